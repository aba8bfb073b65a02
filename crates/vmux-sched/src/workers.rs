//! Fixed worker pool backing task execution
//!
//! Workers block on a shared deque; the scheduler pushes one job per
//! dispatched task. Shutdown either drains the queue or discards
//! whatever has not started yet.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, trace};

pub(crate) type Job = Box<dyn FnOnce() + Send>;

struct PoolShared {
    queue: Mutex<VecDeque<Job>>,
    available: Condvar,
    stop: AtomicBool,
}

pub(crate) struct WorkerPool {
    shared: Arc<PoolShared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub(crate) fn new(threads: usize) -> Self {
        let shared = Arc::new(PoolShared {
            queue: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
            stop: AtomicBool::new(false),
        });

        let mut workers = Vec::with_capacity(threads);
        for idx in 0..threads {
            let shared = Arc::clone(&shared);
            let handle = std::thread::Builder::new()
                .name(format!("vmux-worker-{idx}"))
                .spawn(move || worker_loop(&shared))
                .expect("spawning worker thread");
            workers.push(handle);
        }
        debug!(threads, "worker pool started");

        Self {
            shared,
            workers: Mutex::new(workers),
        }
    }

    pub(crate) fn execute(&self, job: Job) {
        let mut queue = self.shared.queue.lock();
        queue.push_back(job);
        drop(queue);
        self.shared.available.notify_one();
    }

    pub(crate) fn queued(&self) -> usize {
        self.shared.queue.lock().len()
    }

    /// Stop the pool; `discard_pending` drops jobs that have not
    /// started yet instead of running them.
    pub(crate) fn shutdown(&self, discard_pending: bool) {
        if discard_pending {
            let dropped = self.shared.queue.lock().drain(..).count();
            if dropped > 0 {
                debug!(dropped, "discarded queued jobs at shutdown");
            }
        }
        self.shared.stop.store(true, Ordering::Release);
        self.shared.available.notify_all();

        for handle in self.workers.lock().drain(..) {
            let _ = handle.join();
        }
    }
}

fn worker_loop(shared: &PoolShared) {
    loop {
        let job = {
            let mut queue = shared.queue.lock();
            loop {
                if let Some(job) = queue.pop_front() {
                    break Some(job);
                }
                if shared.stop.load(Ordering::Acquire) {
                    break None;
                }
                shared.available.wait(&mut queue);
            }
        };

        match job {
            Some(job) => {
                trace!("worker picked up a job");
                job();
            }
            None => return,
        }
    }
}
