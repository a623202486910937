// (C) 2020 Brandon Lewis
//
// The evaluator: the state machine that drives Tasks to results.
//
// A worker hands the evaluator one Task at a time. The evaluator
// never blocks the worker on another Task; instead it consults the
// cache, registers any dependencies it discovers, and returns. When
// the last dependency lands the cache re-enqueues the Task and the
// evaluator runs it again from the top, this time finding everything
// it needs. Every handler below is written to be re-entrant in that
// way.
//
// Discovery over a Tree uses the speculative protocol: the Task
// pre-charges its own blocked counter once per prospective child, then
// settles each child against the cache. The counter cannot reach zero
// while discovery is still running, so a Task is never re-enqueued
// out from under itself.
//
// Failures are never cached as results. A trap faults the Task, the
// fault propagates through the reverse-dependency index, and the root
// caller observes the original error from get_blocking.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::cache::FixCache;
use crate::config::Limits;
use crate::error::{Error, Result};
use crate::name::{Kind, Name};
use crate::program::Module;
use crate::sched::{Pool, WorkQueue};
use crate::store::{Object, Store};
use crate::task::Task;
use crate::vm;
use crate::vm::Trap;


// One evaluation context: a store, a cache, and a pool of workers
// draining one queue. Library code always receives a Runtime by
// reference; only top-level entry points may lean on the process-wide
// default.
pub struct Runtime {
    inner: Arc<Inner>,
    // Dropping the pool closes the queue and joins the workers.
    _pool: Pool,
}


struct Inner {
    store: Store,
    cache: FixCache,
    queue: Arc<WorkQueue>,
    programs: RwLock<HashMap<Name, Arc<Module>>>,
    limits: Limits,
}


impl Runtime {
    pub fn new(limits: Limits) -> Runtime {
        let queue = Arc::new(WorkQueue::new());
        let inner = Arc::new(Inner {
            store: Store::new(),
            cache: FixCache::new(),
            queue: queue.clone(),
            programs: RwLock::new(HashMap::new()),
            limits: limits.clone(),
        });
        let worker = inner.clone();
        let pool = Pool::spawn(limits.workers, queue, move |task| worker.step(task));
        Runtime { inner, _pool: pool }
    }

    pub fn store(&self) -> &Store {
        &self.inner.store
    }

    pub fn cache(&self) -> &FixCache {
        &self.inner.cache
    }

    // Reduce a Name to its Value form, waiting for the result. This is
    // the external entry point; the work itself happens on the pool.
    pub fn eval(&self, name: Name) -> Result<Name> {
        let task = Task::Eval(name);
        self.inner.cache.start(task, self.inner.enqueue());
        self.inner.cache.get_blocking(task, self.inner.limits.deadline())
    }

    // Ensure every transitive child of a Name is present, waiting for
    // completion. A second fill of the same Name returns immediately.
    pub fn fill(&self, name: Name) -> Result<Name> {
        let task = Task::Fill(name);
        self.inner.cache.start(task, self.inner.enqueue());
        self.inner.cache.get_blocking(task, self.inner.limits.deadline())
    }
}


impl Inner {
    // The enqueue function handed to the cache: push onto our queue.
    fn enqueue(&self) -> impl Fn(Task) {
        let queue = self.queue.clone();
        move |task| queue.push(task)
    }

    fn step(&self, task: Task) {
        trace!("eval: dispatch {:?}", task);
        let outcome = match task {
            Task::Eval(name) => self.eval_task(task, name),
            Task::Apply(name) => self.apply_task(task, name),
            Task::Fill(name) => self.fill_task(task, name),
        };
        if let Err(error) = outcome {
            self.cache.fault(task, error);
        }
    }

    fn eval_task(&self, task: Task, name: Name) -> Result<()> {
        match name.kind() {
            // Blobs, Literals and Tags reduce to themselves.
            Kind::Literal | Kind::Blob | Kind::Tag => {
                self.cache.cache(task, name, self.enqueue())
            }
            Kind::Thunk => {
                let applied = match self.cache.get_or_add_dependency(
                    Task::Apply(name),
                    task,
                    self.enqueue(),
                )? {
                    Some(applied) => applied,
                    None => return Ok(()),
                };
                match applied.kind() {
                    Kind::Literal | Kind::Blob | Kind::Tag => {
                        self.cache.cache(task, applied, self.enqueue())
                    }
                    // The application produced something reducible;
                    // chase it before calling this a Value.
                    _ => match self.cache.get_or_add_dependency(
                        Task::Eval(applied),
                        task,
                        self.enqueue(),
                    )? {
                        Some(value) => self.cache.cache(task, value, self.enqueue()),
                        None => Ok(()),
                    },
                }
            }
            Kind::Tree => {
                let entries = self.store.tree(name)?;
                let pending: Vec<Name> = entries
                    .iter()
                    .copied()
                    .filter(|entry| match entry.kind() {
                        Kind::Thunk | Kind::Tree => true,
                        _ => false,
                    })
                    .collect();
                if pending.is_empty() {
                    return self.cache.cache(task, name, self.enqueue());
                }

                self.cache.increment_blocking(task, pending.len());
                let mut count = pending.len();
                for child in &pending {
                    count = self.cache.add_dependency_or_decrement(
                        Task::Eval(*child),
                        task,
                        self.enqueue(),
                    )?;
                }
                if count != 0 {
                    return Ok(());
                }

                // Everything landed; assemble the evaluated tree,
                // reusing this Name if nothing actually changed.
                let mut out = Vec::with_capacity(entries.len());
                let mut changed = false;
                for entry in entries.iter() {
                    match entry.kind() {
                        Kind::Thunk | Kind::Tree => {
                            let value = self
                                .cache
                                .get(Task::Eval(*entry))
                                .expect("settled children have results");
                            changed = changed || value != *entry;
                            out.push(value);
                        }
                        _ => out.push(*entry),
                    }
                }
                let result = if changed {
                    self.store.put(Object::Tree(out))?
                } else {
                    name
                };
                self.cache.cache(task, result, self.enqueue())
            }
        }
    }

    fn apply_task(&self, task: Task, name: Name) -> Result<()> {
        // Fill first, so the machine can read everything synchronously.
        match self.cache.get_or_add_dependency(Task::Fill(name), task, self.enqueue())? {
            None => Ok(()),
            Some(_) => {
                let encode = self.store.target(name)?;
                let entries = self.store.tree(encode)?;
                let program = entries.first().copied().ok_or_else(|| Error::ExecutionTrap {
                    task,
                    reason: Trap::BadModule("empty encode tree".to_string()),
                })?;
                let module = self
                    .module(program)
                    .map_err(|reason| Error::ExecutionTrap { task, reason })?;
                let output = vm::apply(&self.store, &module, encode, &self.limits)
                    .map_err(|reason| Error::ExecutionTrap { task, reason })?;
                self.cache.cache(task, output, self.enqueue())
            }
        }
    }

    fn fill_task(&self, task: Task, name: Name) -> Result<()> {
        match name.kind() {
            Kind::Literal => self.cache.cache(task, name, self.enqueue()),
            // A Tag's target stays lazy; presence of the Tag itself is
            // enough.
            Kind::Blob | Kind::Tag => {
                if !self.store.contains(name) {
                    return Err(Error::UnknownName(name));
                }
                self.cache.cache(task, name, self.enqueue())
            }
            Kind::Thunk => {
                let target = self.store.target(name)?;
                match self.cache.get_or_add_dependency(Task::Fill(target), task, self.enqueue())? {
                    Some(_) => self.cache.cache(task, name, self.enqueue()),
                    None => Ok(()),
                }
            }
            Kind::Tree => {
                let entries = self.store.tree(name)?;
                let mut pending = Vec::new();
                for entry in entries.iter() {
                    match entry.kind() {
                        Kind::Literal => {}
                        Kind::Blob | Kind::Tag => {
                            if !self.store.contains(*entry) {
                                return Err(Error::UnknownName(*entry));
                            }
                        }
                        Kind::Tree | Kind::Thunk => pending.push(*entry),
                    }
                }
                if pending.is_empty() {
                    return self.cache.cache(task, name, self.enqueue());
                }

                self.cache.increment_blocking(task, pending.len());
                let mut count = pending.len();
                for child in &pending {
                    count = self.cache.add_dependency_or_decrement(
                        Task::Fill(*child),
                        task,
                        self.enqueue(),
                    )?;
                }
                if count != 0 {
                    return Ok(());
                }
                self.cache.cache(task, name, self.enqueue())
            }
        }
    }

    // Decode the program module a Blob carries, memoized per Name.
    fn module(&self, blob: Name) -> core::result::Result<Arc<Module>, Trap> {
        if let Some(module) = self.programs.read().unwrap().get(&blob) {
            return Ok(module.clone());
        }
        let bytes = self.store.blob(blob).map_err(|_| Trap::UnknownName(blob))?;
        let module = Arc::new(Module::decode(&bytes)?);
        self.programs.write().unwrap().insert(blob, module.clone());
        Ok(module)
    }
}


lazy_static! {
    static ref DEFAULT: Runtime = Runtime::new(Limits::default());
}


// The process-wide runtime, for top-level entry points that don't
// care to manage their own.
pub fn default_runtime() -> &'static Runtime {
    &DEFAULT
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::Opcode::*;
    use crate::vm::{HostCall, Value};

    fn runtime() -> Runtime {
        let mut limits = Limits::default();
        limits.workers = 2;
        Runtime::new(limits)
    }

    // A program that designates its first argument as its output.
    fn identity_module() -> Module {
        Module {
            name: "identity".to_string(),
            inputs: 1,
            outputs: 1,
            ro_slots: 1,
            rw_slots: vec![],
            data: vec![Value::Int(1)],
            code: vec![
                Arg(0),
                LoadI(0),
                Host(HostCall::GetTreeEntry),
                Host(HostCall::DesignateOutput),
                Halt,
            ],
        }
    }

    // A program that sums two little-endian u32 argument Blobs and
    // freezes the four-byte result.
    fn add_module() -> Module {
        Module {
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
                Binary(crate::vm::BinOp::Add),
                LoadI(0),
                StoreW(0),
                LoadI(0),
                LoadI(3),
                Host(HostCall::FreezeBlob),
                Host(HostCall::DesignateOutput),
                Halt,
            ],
        }
    }

    // A program that divides by the first byte of its argument, so an
    // argument starting with zero traps it.
    fn touchy_module() -> Module {
        Module {
            name: "touchy".to_string(),
            inputs: 1,
            outputs: 1,
            ro_slots: 1,
            rw_slots: vec![],
            data: vec![Value::Int(0), Value::Int(1)],
            code: vec![
                Arg(0),
                LoadI(1),
                Host(HostCall::GetTreeEntry),
                Dup(1),
                LoadI(0),
                Host(HostCall::AttachBlob),
                LoadI(1),
                LoadI(0),
                LoadB(0),
                Binary(crate::vm::BinOp::Div),
                Drop(1),
                Host(HostCall::DesignateOutput),
                Halt,
            ],
        }
    }

    fn put_module(rt: &Runtime, module: Module) -> Name {
        rt.store()
            .put(Object::Blob(module.encode().unwrap()))
            .unwrap()
    }

    fn thunk_of(rt: &Runtime, entries: Vec<Name>) -> Name {
        let tree = rt.store().put(Object::Tree(entries)).unwrap();
        rt.store().put(Object::Thunk(tree)).unwrap()
    }

    #[test]
    fn test_values_evaluate_to_themselves() {
        let rt = runtime();
        let literal = Name::literal(b"v").unwrap();
        assert_eq!(rt.eval(literal), Ok(literal));

        let blob = rt.store().put(Object::Blob(b"bytes".to_vec())).unwrap();
        assert_eq!(rt.eval(blob), Ok(blob));

        let tree = rt.store().put(Object::Tree(vec![literal, blob])).unwrap();
        assert_eq!(rt.eval(tree), Ok(tree));
    }

    #[test]
    fn test_tags_are_value_leaves() {
        let rt = runtime();
        let subject = rt.store().put(Object::Blob(b"subject".to_vec())).unwrap();
        let body = rt.store().put(Object::Tree(vec![subject])).unwrap();
        let tag = rt.store().put(Object::Tag(body)).unwrap();
        assert_eq!(rt.eval(tag), Ok(tag));
        assert_eq!(rt.fill(tag), Ok(tag));
    }

    #[test]
    fn test_identity_program() {
        let rt = runtime();
        let program = put_module(&rt, identity_module());
        let input = rt.store().put(Object::Blob(b"hello".to_vec())).unwrap();
        let thunk = thunk_of(&rt, vec![program, input]);
        assert_eq!(rt.eval(thunk), Ok(input));
    }

    #[test]
    fn test_add_two_integers() {
        let rt = runtime();
        let program = put_module(&rt, add_module());
        let a = rt
            .store()
            .put(Object::Blob(1u32.to_le_bytes().to_vec()))
            .unwrap();
        let b = rt
            .store()
            .put(Object::Blob(2u32.to_le_bytes().to_vec()))
            .unwrap();
        let thunk = thunk_of(&rt, vec![program, a, b]);
        let result = rt.eval(thunk).unwrap();
        assert_eq!(
            rt.store().blob(result).unwrap().as_ref(),
            &3u32.to_le_bytes().to_vec()
        );
    }

    #[test]
    fn test_memoization() {
        let rt = runtime();
        let program = put_module(&rt, add_module());
        let a = rt
            .store()
            .put(Object::Blob(20u32.to_le_bytes().to_vec()))
            .unwrap();
        let b = rt
            .store()
            .put(Object::Blob(22u32.to_le_bytes().to_vec()))
            .unwrap();
        let thunk = thunk_of(&rt, vec![program, a, b]);

        let first = rt.eval(thunk).unwrap();
        // The application is already cached before the second request.
        assert_eq!(rt.cache().get(Task::Apply(thunk)), Some(first));
        let entries = rt.store().len();

        let second = rt.eval(thunk).unwrap();
        assert_eq!(first, second);
        assert_eq!(rt.store().len(), entries);
    }

    #[test]
    fn test_tree_with_thunk_entries_evaluates_deeply() {
        let rt = runtime();
        let program = put_module(&rt, identity_module());
        let input = rt.store().put(Object::Blob(b"leaf".to_vec())).unwrap();
        let thunk = thunk_of(&rt, vec![program, input]);
        let plain = Name::literal(b"plain").unwrap();
        let tree = rt.store().put(Object::Tree(vec![plain, thunk])).unwrap();

        let result = rt.eval(tree).unwrap();
        assert_ne!(result, tree);
        assert_eq!(
            rt.store().tree(result).unwrap().as_ref(),
            &vec![plain, input]
        );
    }

    #[test]
    fn test_nested_evaluation() {
        let rt = runtime();
        let program = put_module(&rt, identity_module());
        let input = rt.store().put(Object::Blob(b"inner".to_vec())).unwrap();
        let inner = thunk_of(&rt, vec![program, input]);
        // The outer program's output is the inner thunk itself.
        let outer = thunk_of(&rt, vec![program, inner]);

        assert_eq!(rt.eval(outer), Ok(input));

        // Both applications are cached, each with its own edge from
        // the Eval that demanded it.
        assert_eq!(rt.cache().get(Task::Apply(outer)), Some(inner));
        assert_eq!(rt.cache().get(Task::Apply(inner)), Some(input));
        assert!(rt
            .cache()
            .dependers_of(Task::Apply(outer))
            .contains(&Task::Eval(outer)));
        assert!(rt
            .cache()
            .dependers_of(Task::Apply(inner))
            .contains(&Task::Eval(inner)));
    }

    #[test]
    fn test_shared_subcomputation_applies_once() {
        let rt = runtime();
        let program = put_module(&rt, identity_module());
        let input = rt.store().put(Object::Blob(b"shared".to_vec())).unwrap();
        let inner = thunk_of(&rt, vec![program, input]);

        // Two distinct roots funnel into the same inner application.
        let spare = Name::literal(b"spare").unwrap();
        let root1 = thunk_of(&rt, vec![program, inner]);
        let root2 = thunk_of(&rt, vec![program, inner, spare]);
        assert_ne!(root1, root2);

        let first = rt.eval(root1).unwrap();
        let second = rt.eval(root2).unwrap();
        assert_eq!(first, second);
        assert_eq!(first, input);
        assert_eq!(rt.cache().get(Task::Apply(inner)), Some(input));
    }

    #[test]
    fn test_deep_tree_fill() {
        let rt = runtime();

        // Depth 5, fan-out 3: 81 leaf blobs under 40 trees, 121
        // entries in all, built bottom-up.
        fn build(rt: &Runtime, depth: usize, path: u32) -> Name {
            if depth == 0 {
                let bytes = path.to_le_bytes().to_vec();
                return rt.store().put(Object::Blob(bytes)).unwrap();
            }
            let children = (0..3)
                .map(|i| build(rt, depth - 1, path * 3 + i))
                .collect();
            rt.store().put(Object::Tree(children)).unwrap()
        }
        let root = build(&rt, 4, 1);
        assert_eq!(rt.store().len(), 121);

        // Filling adds nothing: everything is already present.
        assert_eq!(rt.fill(root), Ok(root));
        assert_eq!(rt.store().len(), 121);

        // A second fill is a cache hit.
        assert_eq!(rt.cache().get(Task::Fill(root)), Some(root));
        assert_eq!(rt.fill(root), Ok(root));
    }

    #[test]
    fn test_fill_of_thunk_descends_into_encode() {
        let rt = runtime();
        let program = put_module(&rt, identity_module());
        let input = rt.store().put(Object::Blob(b"arg".to_vec())).unwrap();
        let thunk = thunk_of(&rt, vec![program, input]);
        assert_eq!(rt.fill(thunk), Ok(thunk));
        let tree = rt.store().target(thunk).unwrap();
        assert_eq!(rt.cache().get(Task::Fill(tree)), Some(tree));
    }

    #[test]
    fn test_failure_isolation() {
        let rt = runtime();
        let program = put_module(&rt, touchy_module());

        let zero = rt.store().put(Object::Blob(vec![0])).unwrap();
        let trapping = thunk_of(&rt, vec![program, zero]);
        match rt.eval(trapping) {
            Err(Error::ExecutionTrap { task, reason }) => {
                assert_eq!(task, Task::Apply(trapping));
                assert_eq!(reason, Trap::DivideByZero);
            }
            other => panic!("expected a trap, got {:?}", other),
        }
        // No result was cached for the failed application.
        assert_eq!(rt.cache().get(Task::Apply(trapping)), None);

        // An unrelated application is untouched.
        let one = rt.store().put(Object::Blob(vec![1])).unwrap();
        let fine = thunk_of(&rt, vec![program, one]);
        assert_eq!(rt.eval(fine), Ok(one));
    }

    #[test]
    fn test_failed_apply_faults_are_remembered() {
        let rt = runtime();
        let program = put_module(&rt, touchy_module());
        let zero = rt.store().put(Object::Blob(vec![0])).unwrap();
        let trapping = thunk_of(&rt, vec![program, zero]);

        assert!(rt.eval(trapping).is_err());
        // The identical request fails the same way, deterministically.
        assert_eq!(rt.eval(trapping), rt.eval(trapping));
    }

    #[test]
    fn test_determinism_across_runtimes() {
        let result_of = || {
            let rt = runtime();
            let program = put_module(&rt, add_module());
            let a = rt
                .store()
                .put(Object::Blob(5u32.to_le_bytes().to_vec()))
                .unwrap();
            let b = rt
                .store()
                .put(Object::Blob(6u32.to_le_bytes().to_vec()))
                .unwrap();
            rt.eval(thunk_of(&rt, vec![program, a, b])).unwrap()
        };
        assert_eq!(result_of(), result_of());
    }

    #[test]
    fn test_unknown_program_surfaces_as_trap() {
        let rt = runtime();
        // An encode whose program blob isn't a module at all.
        let junk = rt.store().put(Object::Blob(b"not a module".to_vec())).unwrap();
        let thunk = thunk_of(&rt, vec![junk]);
        match rt.eval(thunk) {
            Err(Error::ExecutionTrap { reason, .. }) => match reason {
                Trap::BadModule(_) => {}
                other => panic!("expected a module trap, got {}", other),
            },
            other => panic!("expected a trap, got {:?}", other),
        }
    }

    #[test]
    fn test_deadline_times_out() {
        let mut limits = Limits::default();
        // No workers, so nothing can ever complete.
        limits.workers = 0;
        limits.deadline_ms = Some(50);
        let rt = Runtime::new(limits);
        let name = Name::literal(b"stuck").unwrap();
        assert_eq!(rt.eval(name), Err(Error::Timeout(Task::Eval(name))));
    }
}
