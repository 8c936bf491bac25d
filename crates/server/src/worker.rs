use std::{
    panic::{AssertUnwindSafe, catch_unwind},
    sync::Arc,
};

use tokio::sync::Semaphore;

use crate::{Error, Result};

/// Runs blocking handlers without stalling connection tasks.
///
/// With `max_workers > 0` at most that many blocking calls execute at once on
/// tokio's blocking threads; further calls wait for a permit. With
/// `max_workers == 0` there is no pool and blocking handlers run inline on
/// the calling task.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    permits: Option<Arc<Semaphore>>,
    max_workers: usize,
}

impl WorkerPool {
    pub fn new(max_workers: usize) -> Self {
        Self {
            permits: (max_workers > 0).then(|| Arc::new(Semaphore::new(max_workers))),
            max_workers,
        }
    }

    /// A pool that always runs inline.
    pub fn inline() -> Self {
        Self::new(0)
    }

    pub const fn max_workers(&self) -> usize {
        self.max_workers
    }

    pub const fn is_inline(&self) -> bool {
        self.permits.is_none()
    }

    pub async fn run<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let Some(permits) = &self.permits else {
            return catch_unwind(AssertUnwindSafe(f)).map_err(|_| Error::WorkerPanicked);
        };
        let permit = Arc::clone(permits)
            .acquire_owned()
            .await
            .map_err(|_| Error::WorkerPoolClosed)?;
        let output = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            f()
        })
        .await?;
        Ok(output)
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new(4)
    }
}
