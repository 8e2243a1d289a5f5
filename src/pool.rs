//! Bounded worker pool shared by all collectors.
//!
//! A single semaphore caps the number of concurrently running submissions
//! and with it the number of outbound HTTP connections process-wide.

use std::future::Future;
use std::sync::Arc;

use anyhow::{bail, Error};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_POOL_SIZE: usize = 4;

#[derive(Clone)]
pub struct WorkerPool {
    semaphore: Arc<Semaphore>,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(size.max(1))),
        }
    }

    /// Wait for a free slot, then run `task` on its own tokio task.
    ///
    /// Returns a cancellation error when `token` fires while still waiting
    /// for a slot. The slot is held until the task finishes, panics
    /// included, so the bound also holds across worker faults.
    pub async fn submit<F, T>(
        &self,
        token: &CancellationToken,
        task: F,
    ) -> Result<JoinHandle<T>, Error>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let permit = tokio::select! {
            permit = Arc::clone(&self.semaphore).acquire_owned() => permit?,
            _ = token.cancelled() => bail!("cancelled while waiting for a worker slot"),
        };

        Ok(tokio::spawn(async move {
            let _permit = permit;
            task.await
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_concurrency_bound() -> Result<(), Error> {
        const POOL_SIZE: usize = 2;
        const TASKS: usize = 8;

        let pool = WorkerPool::new(POOL_SIZE);
        let token = CancellationToken::new();
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..TASKS {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            let handle = pool
                .submit(&token, async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                })
                .await?;
            handles.push(handle);
        }

        for handle in handles {
            handle.await?;
        }

        assert!(peak.load(Ordering::SeqCst) <= POOL_SIZE);
        Ok(())
    }

    #[tokio::test]
    async fn test_cancelled_while_waiting() -> Result<(), Error> {
        let pool = WorkerPool::new(1);
        let token = CancellationToken::new();

        // occupy the only slot
        let blocker = pool
            .submit(&token, async {
                tokio::time::sleep(Duration::from_secs(10)).await;
            })
            .await?;

        token.cancel();
        assert!(pool.submit(&token, async {}).await.is_err());

        blocker.abort();
        Ok(())
    }

    #[tokio::test]
    async fn test_panic_releases_slot() -> Result<(), Error> {
        let pool = WorkerPool::new(1);
        let token = CancellationToken::new();

        let handle = pool
            .submit(&token, async {
                panic!("worker fault");
            })
            .await?;
        assert!(handle.await.is_err());

        // the slot must be free again
        let handle = pool.submit(&token, async { 7u32 }).await?;
        assert_eq!(handle.await?, 7);
        Ok(())
    }
}
