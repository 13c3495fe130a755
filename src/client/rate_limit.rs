//! Token-bucket rate limiting for outbound calls

use crate::error::{Error, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// A shared pool of request tokens
#[async_trait]
pub trait TokenPool: Send + Sync {
    /// Take one token, waiting until one is available or `cancel` fires
    async fn acquire(&self, cancel: &CancellationToken) -> Result<()>;

    /// Top the pool back up to its capacity
    fn refill(&self);
}

/// Capacity-bounded bucket refilled in full once per window
pub struct TokenBucket {
    name: String,
    capacity: usize,
    tokens: Semaphore,
}

impl TokenBucket {
    /// Create a full bucket
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        Self {
            name: name.into(),
            capacity,
            tokens: Semaphore::new(capacity),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Tokens currently available
    pub fn available(&self) -> usize {
        self.tokens.available_permits()
    }

    /// Spawn the single refill task for this bucket
    pub fn spawn_refill(
        self: &Arc<Self>,
        every: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let bucket = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            // First tick completes immediately and the bucket starts full
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!(bucket = %bucket.name, "Refill task stopped");
                        break;
                    }
                    _ = ticker.tick() => bucket.refill(),
                }
            }
        })
    }
}

#[async_trait]
impl TokenPool for TokenBucket {
    async fn acquire(&self, cancel: &CancellationToken) -> Result<()> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled),
            permit = self.tokens.acquire() => {
                permit.map_err(|_| Error::Cancelled)?.forget();
                trace!(bucket = %self.name, remaining = self.available(), "Token acquired");
                Ok(())
            }
        }
    }

    fn refill(&self) {
        let missing = self.capacity.saturating_sub(self.tokens.available_permits());
        if missing > 0 {
            self.tokens.add_permits(missing);
            trace!(bucket = %self.name, added = missing, "Bucket refilled");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_bucket_ceiling_under_concurrency() {
        let bucket = Arc::new(TokenBucket::new("test", 5));
        let cancel = CancellationToken::new();
        let granted = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..10 {
            let bucket = Arc::clone(&bucket);
            let cancel = cancel.clone();
            let granted = Arc::clone(&granted);
            handles.push(tokio::spawn(async move {
                let acquired =
                    tokio::time::timeout(Duration::from_millis(50), bucket.acquire(&cancel)).await;
                if matches!(acquired, Ok(Ok(()))) {
                    granted.fetch_add(1, Ordering::SeqCst);
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(granted.load(Ordering::SeqCst), 5);
        assert_eq!(bucket.available(), 0);
    }

    #[tokio::test]
    async fn test_refill_tops_up_to_capacity() {
        let bucket = TokenBucket::new("test", 3);
        let cancel = CancellationToken::new();
        bucket.acquire(&cancel).await.unwrap();
        bucket.acquire(&cancel).await.unwrap();
        assert_eq!(bucket.available(), 1);

        bucket.refill();
        assert_eq!(bucket.available(), 3);
        bucket.refill();
        assert_eq!(bucket.available(), 3);
    }

    #[tokio::test]
    async fn test_acquire_honours_cancellation() {
        let bucket = TokenBucket::new("test", 1);
        let cancel = CancellationToken::new();
        bucket.acquire(&cancel).await.unwrap();

        cancel.cancel();
        let result = bucket.acquire(&cancel).await;
        assert!(matches!(result, Err(Error::Cancelled)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_refill_task_releases_waiters() {
        let bucket = Arc::new(TokenBucket::new("test", 1));
        let cancel = CancellationToken::new();
        let refill = bucket.spawn_refill(Duration::from_secs(60), cancel.clone());

        bucket.acquire(&cancel).await.unwrap();
        tokio_test::assert_ok!(
            tokio::time::timeout(Duration::from_secs(61), bucket.acquire(&cancel))
                .await
                .unwrap()
        );

        cancel.cancel();
        refill.await.unwrap();
    }
}
