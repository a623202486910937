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

use std::env::args;

use reduct::config::{self, Limits};
use reduct::eval::Runtime;
use reduct::program::Module;
use reduct::store::Object;
use reduct::vm::{BinOp, HostCall, Opcode::*, Value};

// Demo driver: build the add-two-integers program, apply it to a pair
// of inputs, and print the result. Pass a RON limits file to size the
// runtime.
fn main() {
    env_logger::init();

    let limits = match args().nth(1) {
        Some(path) => config::load(&path).expect("couldn't load limits"),
        None => Limits::default(),
    };
    let runtime = Runtime::new(limits);

    let add = Module {
        name: "add".to_string(),
        inputs: 2,
        outputs: 1,
        ro_slots: 2,
        rw_slots: vec![4],
        data: vec![Value::Int(0), Value::Int(1), Value::Int(2), Value::Int(4)],
        code: vec![
            Arg(0),
            LoadI(1),
            Host(HostCall::GetTreeEntry),
            LoadI(0),
            Host(HostCall::AttachBlob),
            Arg(0),
            LoadI(2),
            Host(HostCall::GetTreeEntry),
            LoadI(1),
            Host(HostCall::AttachBlob),
            LoadI(0),
            LoadW(0),
            LoadI(0),
            LoadW(1),
            Binary(BinOp::Add),
            LoadI(0),
            StoreW(0),
            LoadI(0),
            LoadI(3),
            Host(HostCall::FreezeBlob),
            Host(HostCall::DesignateOutput),
            Halt,
        ],
    };

    let store = runtime.store();
    let program = store
        .put(Object::Blob(add.encode().expect("well-formed module")))
        .expect("store the program");
    let a = store
        .put(Object::Blob(1u32.to_le_bytes().to_vec()))
        .expect("store an input");
    let b = store
        .put(Object::Blob(2u32.to_le_bytes().to_vec()))
        .expect("store an input");
    let encode = store
        .put(Object::Tree(vec![program, a, b]))
        .expect("store the encode");
    let thunk = store.put(Object::Thunk(encode)).expect("store the thunk");

    let result = runtime.eval(thunk).expect("evaluation succeeds");
    let bytes = store.blob(result).expect("result is a blob");
    println!("{:?} reduced to {:?} = {}", thunk, result, hex::encode(bytes.as_ref()));
}
