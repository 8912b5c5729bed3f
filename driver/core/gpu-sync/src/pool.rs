use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Returned by [`WorkerPool::execute`] after [`WorkerPool::shutdown`].
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct PoolClosed;

/// Fixed-size pool of named threads draining a shared job queue.
pub struct WorkerPool {
    sender: Mutex<Option<Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Spawn `size` workers (at least one) named `{name}-{n}`.
    ///
    /// # Errors
    /// Propagates thread spawn failures.
    pub fn new(name: &str, size: usize) -> std::io::Result<Self> {
        let (tx, rx) = mpsc::channel::<Job>();
        let rx = Arc::new(Mutex::new(rx));
        let mut workers = Vec::with_capacity(size.max(1));
        for n in 0..size.max(1) {
            let rx = Arc::clone(&rx);
            let handle = thread::Builder::new()
                .name(format!("{name}-{n}"))
                .spawn(move || {
                    loop {
                        let job = {
                            let rx = rx.lock().unwrap_or_else(PoisonError::into_inner);
                            rx.recv()
                        };
                        match job {
                            Ok(job) => job(),
                            Err(_) => break,
                        }
                    }
                })?;
            workers.push(handle);
        }
        log::debug!("{name}: started {} workers", workers.len());
        Ok(Self {
            sender: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
        })
    }

    /// Queue `job` for execution on some worker.
    ///
    /// # Errors
    /// [`PoolClosed`] once the pool has been shut down.
    pub fn execute(&self, job: impl FnOnce() + Send + 'static) -> Result<(), PoolClosed> {
        let sender = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        match sender.as_ref() {
            Some(tx) => tx.send(Box::new(job)).map_err(|_| PoolClosed),
            None => Err(PoolClosed),
        }
    }

    /// Stop accepting jobs, let queued ones finish and join all workers.
    pub fn shutdown(&self) {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let workers = std::mem::take(&mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner));
        let current = thread::current().id();
        for w in workers {
            // A job shutting down its own pool must not join itself.
            if w.thread().id() != current {
                let _ = w.join();
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Completion;
    use std::time::Duration;

    #[test]
    fn runs_jobs_on_workers() {
        let pool = WorkerPool::new("test", 2).unwrap();
        let done = Completion::new();
        let signal = done.clone();
        pool.execute(move || {
            signal.complete(thread::current().name().map(str::to_owned));
        })
        .unwrap();
        let name = done.wait(Duration::from_secs(5)).flatten().unwrap();
        assert!(name.starts_with("test-"));
    }

    #[test]
    fn rejects_after_shutdown() {
        let pool = WorkerPool::new("closed", 1).unwrap();
        pool.shutdown();
        assert_eq!(pool.execute(|| {}), Err(PoolClosed));
    }
}
