// (C) 2020 Brandon Lewis
//
// Concurrent memoization and dependency tracking for Tasks.
//
// Every Task that enters the cache is enqueued exactly once through
// the caller-provided enqueue function, and its result slot moves
// monotonically from absent, to queued (None), to completed (Some).
// It never regresses.
//
// *Dependencies*
//
// Edges run in reverse: the table maps a dependee to the Tasks that
// are waiting on it, so completion can find exactly the work it
// unblocks. Multiple dependers of one dependee are distinguished by a
// dense positive index chosen by linear scan at insertion. Completion
// walks (task, 1), (task, 2), ... and stops at the first gap, which
// marks the end of the edge list. The table stays flat and the walk
// touches consecutive entries.
//
// Each depender carries an atomic counter of outstanding
// dependencies. A depender whose counter reaches zero is re-enqueued,
// and only then. Evaluators that discover dependencies incrementally
// pre-charge the counter once per prospective child and settle the
// difference with add_dependency_or_decrement, so the counter can
// never hit zero while discovery is still running.
//
// *Failure*
//
// A failed Task never gets a result. Instead the fault is recorded
// and pushed through the reverse index to every Task waiting on it,
// since none of them can ever become ready. Waiters observe the
// original error.
//
// *Locking*
//
// One reader-writer lock serializes the tables. Completion signalling
// uses a separate epoch counter under a mutex with a condition
// variable; the epoch mutex is only ever taken after the table lock
// has been released, so the two cannot deadlock. Workers never wait
// here. get_blocking exists for external callers awaiting a root
// result.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::name::Name;
use crate::task::Task;


// Bound on the reverse-index walk used to reject dependency cycles.
// Content addressing makes cyclic objects unrepresentable, so a cycle
// can only come from an evaluator bug; the check is a guard, not a
// load-bearing search.
const CYCLE_SCAN_DEPTH: usize = 16;


#[derive(Default)]
struct Tables {
    results: HashMap<Task, Option<Name>>,
    deps: HashMap<(Task, usize), Task>,
    blocked: HashMap<Task, Arc<AtomicUsize>>,
    faults: HashMap<Task, Error>,
}


pub struct FixCache {
    tables: RwLock<Tables>,
    epoch: Mutex<u64>,
    done: Condvar,
}


impl FixCache {
    pub fn new() -> FixCache {
        FixCache {
            tables: RwLock::new(Tables::default()),
            epoch: Mutex::new(0),
            done: Condvar::new(),
        }
    }

    // Insert and enqueue a task that isn't known yet. True if this
    // call was the one that inserted it.
    fn add_task<F: Fn(Task)>(tables: &mut Tables, task: Task, enqueue: &F) -> bool {
        if tables.results.contains_key(&task) {
            return false;
        }
        tables.results.insert(task, None);
        tables.blocked.insert(task, Arc::new(AtomicUsize::new(0)));
        trace!("cache: queued {:?}", task);
        enqueue(task);
        true
    }

    // Does `from` transitively depend on `target`? Bounded search over
    // the reverse index.
    fn depends_on(tables: &Tables, from: Task, target: Task, depth: usize) -> bool {
        if from == target {
            return true;
        }
        if depth == 0 {
            return false;
        }
        tables.deps.iter().any(|(&(dependee, _), &depender)| {
            depender == from && Self::depends_on(tables, dependee, target, depth - 1)
        })
    }

    // Record that `depender` waits on `dependee`, picking the first
    // free index by linear scan.
    fn insert_edge(tables: &mut Tables, dependee: Task, depender: Task) -> Result<()> {
        if dependee == depender {
            return Err(Error::SelfDependency(depender));
        }
        if Self::depends_on(tables, dependee, depender, CYCLE_SCAN_DEPTH) {
            return Err(Error::DependencyCycle { dependee, depender });
        }
        for i in 1.. {
            if !tables.deps.contains_key(&(dependee, i)) {
                tables.deps.insert((dependee, i), depender);
                break;
            }
        }
        Ok(())
    }

    fn blocked_counter(tables: &Tables, task: Task) -> Arc<AtomicUsize> {
        tables
            .blocked
            .get(&task)
            .expect("blocked counter exists for every started task")
            .clone()
    }

    // Bump the completion epoch and wake every waiter.
    fn signal(&self) {
        let mut epoch = self.epoch.lock().unwrap();
        *epoch = epoch.wrapping_add(1);
        self.done.notify_all();
    }

    // The cached result, if the task has completed.
    pub fn get(&self, task: Task) -> Option<Name> {
        self.tables.read().unwrap().results.get(&task).copied().flatten()
    }

    // Queue a task unless it is already known. Idempotent.
    pub fn start<F: Fn(Task)>(&self, task: Task, enqueue: F) {
        let mut tables = self.tables.write().unwrap();
        Self::add_task(&mut tables, task, &enqueue);
    }

    // Queue `dependee` if it isn't known. Returns its result if it has
    // one; otherwise records the dependency and charges `depender`'s
    // counter. A faulted dependee reports its recorded error.
    pub fn get_or_add_dependency<F: Fn(Task)>(
        &self,
        dependee: Task,
        depender: Task,
        enqueue: F,
    ) -> Result<Option<Name>> {
        let mut tables = self.tables.write().unwrap();
        Self::add_task(&mut tables, dependee, &enqueue);
        if let Some(error) = tables.faults.get(&dependee) {
            return Err(error.clone());
        }
        if let Some(&Some(result)) = tables.results.get(&dependee) {
            return Ok(Some(result));
        }
        Self::insert_edge(&mut tables, dependee, depender)?;
        Self::blocked_counter(&tables, depender).fetch_add(1, Ordering::SeqCst);
        Ok(None)
    }

    // The settling half of speculative discovery: the depender already
    // charged its counter for this child. A completed dependee pays
    // the charge back; a pending one converts it into an edge. Returns
    // the counter as of this call.
    pub fn add_dependency_or_decrement<F: Fn(Task)>(
        &self,
        dependee: Task,
        depender: Task,
        enqueue: F,
    ) -> Result<usize> {
        let mut tables = self.tables.write().unwrap();
        Self::add_task(&mut tables, dependee, &enqueue);
        if let Some(error) = tables.faults.get(&dependee) {
            return Err(error.clone());
        }
        let counter = Self::blocked_counter(&tables, depender);
        if let Some(&Some(_)) = tables.results.get(&dependee) {
            return Ok(counter.fetch_sub(1, Ordering::SeqCst) - 1);
        }
        Self::insert_edge(&mut tables, dependee, depender)?;
        Ok(counter.load(Ordering::SeqCst))
    }

    // Pre-charge a task's counter, one unit per prospective child.
    pub fn increment_blocking(&self, task: Task, count: usize) {
        let tables = self.tables.read().unwrap();
        Self::blocked_counter(&tables, task).fetch_add(count, Ordering::SeqCst);
    }

    // Publish a task's result and requeue every depender this makes
    // ready. Rejects a second completion and a completion attempted
    // while the task is still blocked.
    pub fn cache<F: Fn(Task)>(&self, task: Task, result: Name, enqueue: F) -> Result<()> {
        let ready = {
            let mut tables = self.tables.write().unwrap();
            match tables.results.get(&task) {
                Some(Some(_)) => return Err(Error::DoubleCache(task)),
                Some(None) => {}
                None => panic!("cache of a task that was never started: {:?}", task),
            }
            if Self::blocked_counter(&tables, task).load(Ordering::SeqCst) != 0 {
                return Err(Error::StillBlocked(task));
            }
            tables.results.insert(task, Some(result));
            trace!("cache: {:?} -> {:?}", task, result);

            let mut ready = Vec::new();
            for i in 1.. {
                match tables.deps.get(&(task, i)) {
                    Some(&depender) => {
                        let left = Self::blocked_counter(&tables, depender)
                            .fetch_sub(1, Ordering::SeqCst)
                            - 1;
                        if left == 0 {
                            ready.push(depender);
                        }
                    }
                    None => break,
                }
            }
            ready
        };
        self.signal();
        for depender in ready {
            trace!("cache: unblocked {:?}", depender);
            enqueue(depender);
        }
        Ok(())
    }

    // Record a failure for `task` and push it to every depender
    // reachable through the reverse index. None of them will run
    // again. The first fault recorded for a task wins.
    pub fn fault(&self, task: Task, error: Error) {
        {
            let mut tables = self.tables.write().unwrap();
            let mut frontier = vec![task];
            while let Some(current) = frontier.pop() {
                if tables.faults.contains_key(&current) {
                    continue;
                }
                warn!("cache: {:?} faulted: {}", current, error);
                tables.faults.insert(current, error.clone());
                for i in 1.. {
                    match tables.deps.get(&(current, i)) {
                        Some(&depender) => frontier.push(depender),
                        None => break,
                    }
                }
            }
        }
        self.signal();
    }

    // The recorded fault for a task, if any.
    pub fn fault_of(&self, task: Task) -> Option<Error> {
        self.tables.read().unwrap().faults.get(&task).cloned()
    }

    // Every depender currently on record for a dependee, in index
    // order.
    pub fn dependers_of(&self, task: Task) -> Vec<Task> {
        let tables = self.tables.read().unwrap();
        let mut out = Vec::new();
        for i in 1.. {
            match tables.deps.get(&(task, i)) {
                Some(&depender) => out.push(depender),
                None => break,
            }
        }
        out
    }

    fn poll(&self, task: Task) -> Option<Result<Name>> {
        let tables = self.tables.read().unwrap();
        if let Some(&Some(result)) = tables.results.get(&task) {
            return Some(Ok(result));
        }
        if let Some(error) = tables.faults.get(&task) {
            return Some(Err(error.clone()));
        }
        None
    }

    // Wait until the task completes or faults. For external callers
    // only; workers suspend through the dependency machinery instead.
    // With a deadline, gives up with Timeout once it elapses, leaving
    // all cached state intact.
    pub fn get_blocking(&self, task: Task, deadline: Option<Duration>) -> Result<Name> {
        let started = Instant::now();
        loop {
            if let Some(outcome) = self.poll(task) {
                return outcome;
            }
            let mut epoch = self.epoch.lock().unwrap();
            let seen = *epoch;
            // A completion may have landed between the poll and taking
            // the epoch lock.
            if let Some(outcome) = self.poll(task) {
                return outcome;
            }
            while *epoch == seen {
                match deadline {
                    None => epoch = self.done.wait(epoch).unwrap(),
                    Some(limit) => {
                        let left = match limit.checked_sub(started.elapsed()) {
                            Some(left) => left,
                            None => return Err(Error::Timeout(task)),
                        };
                        let (guard, timeout) = self.done.wait_timeout(epoch, left).unwrap();
                        epoch = guard;
                        if timeout.timed_out() && *epoch == seen {
                            return Err(Error::Timeout(task));
                        }
                    }
                }
            }
        }
    }
}
