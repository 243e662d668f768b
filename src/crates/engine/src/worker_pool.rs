//! A bounded worker pool for parallel branch dispatch.
//!
//! The originating platform guards its thread pool with a submit-count
//! cap enforced in an overridden `submit()` (`GraphEngineThreadPool` in
//! `graph_engine.py`); a `tokio::sync::Semaphore` gives the same
//! backpressure natively, so the cap here is purely the lifetime ceiling
//! on total submissions, checked before the semaphore permit is acquired.

use crate::error::{EngineError, Result};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

/// Bounds how many branch tasks may run concurrently (via the semaphore)
/// and how many may ever be submitted over the run's lifetime (via the
/// atomic counter).
pub struct WorkerPool {
    semaphore: Arc<Semaphore>,
    submitted: AtomicUsize,
    max_submit_count: usize,
}

impl WorkerPool {
    /// A pool with `max_workers` concurrent slots and a lifetime submission
    /// cap of `max_submit_count`.
    pub fn new(max_workers: usize, max_submit_count: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_workers)),
            submitted: AtomicUsize::new(0),
            max_submit_count,
        }
    }

    /// Spawn `task` once a worker slot is free, after checking the
    /// lifetime submission cap. Returns a handle to the spawned task;
    /// the permit is held for the task's duration and released on
    /// completion.
    pub async fn submit<F, T>(&self, task: F) -> Result<JoinHandle<T>>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let prev = self.submitted.fetch_add(1, Ordering::SeqCst);
        if prev >= self.max_submit_count {
            self.submitted.fetch_sub(1, Ordering::SeqCst);
            return Err(EngineError::WorkerPoolFull {
                max_submit_count: self.max_submit_count,
            });
        }

        let semaphore = Arc::clone(&self.semaphore);
        let permit = semaphore
            .acquire_owned()
            .await
            .expect("semaphore is never closed");

        Ok(tokio::spawn(async move {
            let _permit = permit;
            task.await
        }))
    }

    /// Number of tasks submitted so far over this pool's lifetime.
    pub fn submitted_count(&self) -> usize {
        self.submitted.load(Ordering::SeqCst)
    }
}
