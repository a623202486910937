// Work queue and worker pool.
//
// Scheduling is deliberately dumb: one FIFO queue shared by a fixed
// set of worker threads. The cache hands completed dependers to the
// queue through its enqueue callback, a worker pops a Task and runs
// the evaluator on it, and the evaluator either completes the Task or
// returns after registering dependencies. Every pushed Task is
// eventually popped; nothing stronger is promised or needed.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use crate::task::Task;


struct QueueState {
    jobs: VecDeque<Task>,
    closed: bool,
}


pub struct WorkQueue {
    state: Mutex<QueueState>,
    ready: Condvar,
}


impl WorkQueue {
    pub fn new() -> WorkQueue {
        WorkQueue {
            state: Mutex::new(QueueState {
                jobs: VecDeque::new(),
                closed: false,
            }),
            ready: Condvar::new(),
        }
    }

    // Append a task. Pushes to a closed queue are dropped, which only
    // happens while the owning runtime is being torn down.
    pub fn push(&self, task: Task) {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return;
        }
        state.jobs.push_back(task);
        self.ready.notify_one();
    }

    // Block until a task is available or the queue closes. None means
    // the queue is closed and drained.
    pub fn pop(&self) -> Option<Task> {
        let mut state = self.state.lock().unwrap();
        loop {
            if let Some(task) = state.jobs.pop_front() {
                return Some(task);
            }
            if state.closed {
                return None;
            }
            state = self.ready.wait(state).unwrap();
        }
    }

    pub fn close(&self) {
        let mut state = self.state.lock().unwrap();
        state.closed = true;
        self.ready.notify_all();
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().jobs.len()
    }
}


pub struct Pool {
    workers: Vec<thread::JoinHandle<()>>,
    queue: Arc<WorkQueue>,
}


impl Pool {
    // Start `count` workers, each looping pop-dispatch until the
    // queue closes.
    pub fn spawn<F>(count: usize, queue: Arc<WorkQueue>, handler: F) -> Pool
    where
        F: Fn(Task) + Send + Sync + 'static,
    {
        let handler = Arc::new(handler);
        let workers = (0..count)
            .map(|i| {
                let queue = queue.clone();
                let handler = handler.clone();
                thread::Builder::new()
                    .name(format!("reduct-worker-{}", i))
                    .spawn(move || {
                        debug!("worker {} up", i);
                        while let Some(task) = queue.pop() {
                            handler(task);
                        }
                        debug!("worker {} down", i);
                    })
                    .expect("spawn worker thread")
            })
            .collect();
        Pool { workers, queue }
    }
}


impl Drop for Pool {
    fn drop(&mut self) {
        self.queue.close();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}
