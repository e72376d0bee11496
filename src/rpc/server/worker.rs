//! Worker pool that runs request handlers off the polling path.

use std::panic::{self, AssertUnwindSafe};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender};

/// Default number of worker threads per server connection.
pub const DEFAULT_THREAD_POOL_SIZE: usize = 4;

enum Job {
    Run(Box<dyn FnOnce() + Send + 'static>),
    Shutdown,
}

/// Fixed-size pool of worker threads fed by an unbounded job queue.
///
/// Dropping the pool lets the workers finish the jobs already queued, then
/// joins them.
pub struct WorkerPool {
    tx: Sender<Job>,
    workers: Vec<JoinHandle<()>>,
}

/// Cloneable submission end of a [`WorkerPool`].
#[derive(Clone)]
pub struct WorkerHandle {
    tx: Sender<Job>,
}

impl WorkerHandle {
    /// Queue a job. Returns `false` if the pool is gone.
    pub fn submit<F>(&self, job: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        self.tx.send(Job::Run(Box::new(job))).is_ok()
    }
}

impl WorkerPool {
    /// Spawn `size` workers (at least one) named `{name}-{i}`.
    pub fn new(name: &str, size: usize) -> std::io::Result<Self> {
        let (tx, rx) = crossbeam_channel::unbounded();
        let mut pool = Self {
            tx,
            workers: Vec::with_capacity(size.max(1)),
        };
        for i in 0..size.max(1) {
            let rx = rx.clone();
            let worker = thread::Builder::new()
                .name(format!("{}-{}", name, i))
                .spawn(move || work(rx))?;
            pool.workers.push(worker);
        }
        Ok(pool)
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.workers.len()
    }

    pub fn handle(&self) -> WorkerHandle {
        WorkerHandle {
            tx: self.tx.clone(),
        }
    }
}

fn work(rx: Receiver<Job>) {
    while let Ok(job) = rx.recv() {
        match job {
            Job::Run(f) => {
                if panic::catch_unwind(AssertUnwindSafe(f)).is_err() {
                    log::error!(
                        "job panicked on worker {}",
                        thread::current().name().unwrap_or("?")
                    );
                }
            }
            Job::Shutdown => break,
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        for _ in 0..self.workers.len() {
            let _ = self.tx.send(Job::Shutdown);
        }
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                log::error!("worker thread panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;

    #[test]
    fn test_runs_all_jobs() {
        let count = Arc::new(AtomicUsize::new(0));
        {
            let pool = WorkerPool::new("test-worker", 3).unwrap();
            assert_eq!(pool.size(), 3);
            let handle = pool.handle();
            for _ in 0..100 {
                let count = count.clone();
                assert!(handle.submit(move || {
                    count.fetch_add(1, Ordering::Relaxed);
                }));
            }
        }
        assert_eq!(count.load(Ordering::Relaxed), 100);
    }

    #[test]
    fn test_survives_panic() {
        let pool = WorkerPool::new("test-worker", 1).unwrap();
        let handle = pool.handle();
        handle.submit(|| panic!("boom"));

        let (tx, rx) = crossbeam_channel::bounded(1);
        handle.submit(move || tx.send(42).unwrap());
        assert_eq!(rx.recv().unwrap(), 42);
    }
}
