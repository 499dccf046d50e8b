//! The synchronization lock.
//!
//! A counting lock with capacity one gating every mutation of the local
//! store: change-capture insertion into the queue, the push engine's
//! drain, and the pull engine's database-update worker. Acquisition is
//! cancellable; cancellation errors out of the acquire call.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::errors::{ClientError, Result};

/// Single-holder gate over the local store during synchronization.
#[derive(Debug, Clone)]
pub struct SyncLock {
    semaphore: Arc<Semaphore>,
}

/// Holding this guard is the permission to mutate the local store and the
/// operations queue; dropping it releases the lock.
#[derive(Debug)]
pub struct SyncLockGuard {
    _permit: OwnedSemaphorePermit,
}

impl SyncLock {
    pub fn new() -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(1)),
        }
    }

    /// Wait for the lock, bailing out if `cancellation` fires first.
    pub async fn acquire(&self, cancellation: &CancellationToken) -> Result<SyncLockGuard> {
        tokio::select! {
            // Cancellation preempts a simultaneously available permit.
            biased;
            _ = cancellation.cancelled() => Err(ClientError::Cancelled),
            permit = Arc::clone(&self.semaphore).acquire_owned() => {
                let permit = permit
                    .map_err(|_| ClientError::config("synchronization lock closed"))?;
                Ok(SyncLockGuard { _permit: permit })
            }
        }
    }
}

impl Default for SyncLock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn lock_is_mutually_exclusive() {
        let lock = SyncLock::new();
        let token = CancellationToken::new();

        let guard = lock.acquire(&token).await.unwrap();
        let blocked =
            tokio::time::timeout(Duration::from_millis(50), lock.acquire(&token)).await;
        assert!(blocked.is_err(), "second acquire should block");

        drop(guard);
        let reacquired =
            tokio::time::timeout(Duration::from_millis(50), lock.acquire(&token)).await;
        assert!(reacquired.is_ok());
    }

    #[tokio::test]
    async fn cancellation_aborts_a_pending_acquire() {
        let lock = SyncLock::new();
        let token = CancellationToken::new();
        let _held = lock.acquire(&token).await.unwrap();

        let waiter = {
            let lock = lock.clone();
            let token = token.clone();
            tokio::spawn(async move { lock.acquire(&token).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        token.cancel();

        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(ClientError::Cancelled)));
    }
}
