// SPDX-License-Identifier: MIT

//! Bounded worker-pool that drains send-queue tasks (spec.md §4.5).
//!
//! Tasks are boxed closures; oversubscription shows up as queue growth, not
//! dropped tasks, since the channel used here is unbounded in capacity but
//! bounded in worker count.

use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam::channel::{self, Receiver, Sender};

type Task = Box<dyn FnOnce() + Send + 'static>;

pub struct WorkerPool {
    sender: Sender<Task>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `workers` threads, defaulting to the number of hardware
    /// threads if `workers == 0`.
    pub fn new(workers: usize) -> Arc<Self> {
        let workers = if workers == 0 {
            std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4)
        } else {
            workers
        };

        let (sender, receiver) = channel::unbounded::<Task>();
        let mut handles = Vec::with_capacity(workers);
        for index in 0..workers {
            let receiver: Receiver<Task> = receiver.clone();
            handles.push(
                std::thread::Builder::new()
                    .name(format!("smq-worker-{index}"))
                    .spawn(move || {
                        for task in receiver.iter() {
                            // A task panicking must never take down the
                            // pool (spec.md §7: worker-pool tasks catch and
                            // log every error).
                            if let Err(panic) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(task)) {
                                tracing::error!(?panic, "send-queue task panicked");
                            }
                        }
                    })
                    .expect("failed to spawn worker thread"),
            );
        }

        Arc::new(Self { sender, handles })
    }

    /// Submit a task. Never blocks: the channel is unbounded.
    pub fn submit(&self, task: impl FnOnce() + Send + 'static) {
        if self.sender.send(Box::new(task)).is_err() {
            tracing::warn!("worker pool is shut down, dropping task");
        }
    }

    pub fn worker_count(&self) -> usize {
        self.handles.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn submitted_tasks_run() {
        let pool = WorkerPool::new(2);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..10 {
            let counter = counter.clone();
            pool.submit(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        // Tasks run asynchronously; give the pool a moment to drain.
        std::thread::sleep(Duration::from_millis(200));
        assert_eq!(counter.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn a_panicking_task_does_not_kill_the_pool() {
        let pool = WorkerPool::new(1);
        pool.submit(|| panic!("boom"));

        let counter = Arc::new(AtomicUsize::new(0));
        let counter2 = counter.clone();
        pool.submit(move || {
            counter2.fetch_add(1, Ordering::SeqCst);
        });

        std::thread::sleep(Duration::from_millis(200));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn zero_workers_defaults_to_hardware_parallelism() {
        let pool = WorkerPool::new(0);
        assert!(pool.worker_count() >= 1);
    }
}
