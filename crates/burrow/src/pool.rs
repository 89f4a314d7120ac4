//! Fixed-size compaction thread pool.
//!
//! Plain threads over an `mpsc` channel; no async runtime. Queue depth
//! is bounded by the buffer count of the callers (a partition can have
//! at most one compaction in flight), so an unbounded channel never
//! accumulates more than `2^P` jobs.

use std::sync::mpsc::{channel, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use tracing::debug;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// A fixed pool of worker threads executing queued jobs.
pub struct ThreadPool {
    sender: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl ThreadPool {
    /// Spawns a pool with `size` workers. `size` is clamped to at
    /// least one.
    pub fn fixed(size: usize) -> Self {
        let size = size.max(1);
        let (sender, receiver) = channel::<Job>();
        let receiver = Arc::new(Mutex::new(receiver));

        let workers = (0..size)
            .map(|id| {
                let receiver = Arc::clone(&receiver);
                std::thread::Builder::new()
                    .name(format!("burrow-compact-{id}"))
                    .spawn(move || loop {
                        let job = {
                            let guard = receiver.lock().unwrap();
                            guard.recv()
                        };
                        match job {
                            Ok(job) => job(),
                            Err(_) => break, // Pool dropped
                        }
                    })
                    .expect("failed to spawn compaction worker")
            })
            .collect();

        debug!(size, "compaction pool started");
        Self {
            sender: Some(sender),
            workers,
        }
    }

    /// Queues a job for execution on some worker.
    pub fn execute<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.sender
            .as_ref()
            .expect("pool already shut down")
            .send(Box::new(job))
            .expect("compaction workers exited early");
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        // Closing the channel lets workers drain remaining jobs and exit.
        drop(self.sender.take());
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
        debug!("compaction pool stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_pool_runs_all_jobs() {
        let pool = ThreadPool::fixed(4);
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..64 {
            let counter = Arc::clone(&counter);
            pool.execute(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }

        drop(pool); // Joins workers, draining the queue first.
        assert_eq!(counter.load(Ordering::SeqCst), 64);
    }

    #[test]
    fn test_zero_size_clamped() {
        let pool = ThreadPool::fixed(0);
        let counter = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&counter);
        pool.execute(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        drop(pool);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
