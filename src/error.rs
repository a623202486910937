use thiserror::Error;

use crate::name::Name;
use crate::task::Task;
use crate::vm::Trap;


pub type Result<T> = core::result::Result<T, Error>;


// Everything that can go wrong inside the runtime. Failure is
// deterministic (programs are pure), so nothing here is retried; an
// error propagates to whoever submitted the root Task. The type is
// cheap to clone because the cache records it when propagating a
// failure through the dependency graph.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    // A lookup against a Name absent from the store.
    #[error("unknown name {0:?}")]
    UnknownName(Name),

    // A Thunk or Tag must wrap a Tree.
    #[error("{0:?} does not name a tree")]
    NotATree(Name),

    // A completed Task was asked to complete again.
    #[error("{0:?} already has a cached result")]
    DoubleCache(Task),

    // A Task tried to complete while its blocked counter was non-zero.
    #[error("{0:?} is still blocked on dependencies")]
    StillBlocked(Task),

    #[error("{0:?} cannot depend on itself")]
    SelfDependency(Task),

    #[error("dependency of {depender:?} on {dependee:?} would close a cycle")]
    DependencyCycle { dependee: Task, depender: Task },

    // The sandbox trapped while applying a program.
    #[error("{task:?} trapped: {reason}")]
    ExecutionTrap { task: Task, reason: Trap },

    // A deadline elapsed while waiting on a root result. Cached state
    // is left untouched.
    #[error("timed out waiting for {0:?}")]
    Timeout(Task),
}
