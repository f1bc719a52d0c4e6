//! Global worker pool for CPU-bound work.
//!
//! Rasterisation and recognition both block a thread for hundreds of
//! milliseconds and hold a decoded bitmap while they do. The pool is a
//! counting semaphore in front of `spawn_blocking`: at most `size` such
//! operations run at once across every in-flight document, no matter how
//! many documents were submitted.
//!
//! A permit is moved into the blocking closure, so work that has started
//! keeps its slot until it really finishes even if the awaiting task is
//! dropped (cancelled jobs let in-flight pages complete).

use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

/// Why a unit of work did not run to completion.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    #[error("cancelled before a worker was available")]
    Cancelled,
    #[error("worker pool is shut down")]
    Closed,
    #[error("worker panicked: {0}")]
    Panicked(String),
}

/// Cloneable handle to the shared pool.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    size: usize,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            permits: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Workers currently idle.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Wait for a worker slot, giving up if `cancel` fires first.
    pub async fn acquire(
        &self,
        cancel: &CancellationToken,
    ) -> Result<OwnedSemaphorePermit, PoolError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(PoolError::Cancelled),
            permit = Arc::clone(&self.permits).acquire_owned() => {
                permit.map_err(|_| PoolError::Closed)
            }
        }
    }

    /// [`acquire`](Self::acquire) from a blocking (non-async) thread.
    pub fn acquire_blocking(
        &self,
        cancel: &CancellationToken,
    ) -> Result<OwnedSemaphorePermit, PoolError> {
        futures::executor::block_on(self.acquire(cancel))
    }

    /// Run `work` on a blocking thread once a worker slot is free.
    pub async fn run<F, T>(&self, cancel: &CancellationToken, work: F) -> Result<T, PoolError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let permit = self.acquire(cancel).await?;
        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            work()
        })
        .await
        .map_err(|e| PoolError::Panicked(e.to_string()))
    }

    /// Refuse all further acquisitions. Work already running is unaffected.
    pub fn close(&self) {
        self.permits.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn never_exceeds_pool_size() {
        let pool = WorkerPool::new(2);
        let cancel = CancellationToken::new();
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let pool = pool.clone();
                let cancel = cancel.clone();
                let running = Arc::clone(&running);
                let peak = Arc::clone(&peak);
                tokio::spawn(async move {
                    pool.run(&cancel, move || {
                        let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        std::thread::sleep(Duration::from_millis(20));
                        running.fetch_sub(1, Ordering::SeqCst);
                    })
                    .await
                })
            })
            .collect();

        for t in tasks {
            t.await.unwrap().unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(pool.available(), 2);
    }

    #[tokio::test]
    async fn cancelled_token_refuses_work() {
        let pool = WorkerPool::new(1);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let ran = Arc::new(AtomicUsize::new(0));
        let r = Arc::clone(&ran);
        let out = pool
            .run(&cancel, move || {
                r.fetch_add(1, Ordering::SeqCst);
            })
            .await;
        assert_eq!(out, Err(PoolError::Cancelled));
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn closed_pool_refuses_work() {
        let pool = WorkerPool::new(1);
        pool.close();
        let out = pool.run(&CancellationToken::new(), || 1).await;
        assert_eq!(out, Err(PoolError::Closed));
    }

    #[tokio::test]
    async fn panics_are_reported() {
        let pool = WorkerPool::new(1);
        let out: Result<(), _> = pool
            .run(&CancellationToken::new(), || panic!("boom"))
            .await;
        assert!(matches!(out, Err(PoolError::Panicked(_))));
        // The permit is released even though the closure panicked.
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn size_is_at_least_one() {
        assert_eq!(WorkerPool::new(0).size(), 1);
    }
}
