// reduct: a featherweight content-addressed compute runtime.
//
// Copyright (C) 2020  Brandon Lewis
//
// This program is free software: you can redistribute it and/or
// modify it under the terms of the GNU Lesser General Public License
// as published by the Free Software Foundation, either version 3 of
// the License, or (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// Lesser General Public License for more details.
//
// You should have received a copy of the GNU Lesser General Public
// License along with this program.  If not, see
// <https://www.gnu.org/licenses/>.
//
// Every value is an immutable object behind a content-addressed Name,
// every computation is a pure program from Names to Names, and the
// runtime's job is to reduce a Name to its Value form: memoizing
// applications, discovering dependencies as they surface, and
// scheduling the resulting graph across worker threads without ever
// running the same computation twice.

extern crate byteorder;
extern crate enumflags2;
extern crate hex;
extern crate ron;
extern crate serde;
extern crate sha2;
extern crate thiserror;
#[macro_use]
extern crate lazy_static;
#[macro_use]
extern crate log;


pub mod cache;
pub mod config;
pub mod error;
pub mod eval;
pub mod name;
pub mod program;
pub mod sched;
pub mod store;
pub mod task;
pub mod vm;
