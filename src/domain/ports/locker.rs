use crate::domain::errors::LockResult;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// The three remote lock primitives against a single named lock resource.
#[async_trait]
pub trait Locker: Send + Sync {
    /// Attempt to take the lease for `caller_id`.
    /// Returns `Some(lock_id)` on success and `None` when the lock is
    /// currently held by someone else, which is not an error.
    async fn acquire(&self, cancel: &CancellationToken, caller_id: &str)
        -> LockResult<Option<String>>;

    /// Relinquish the lease. Fails with a conflict-class error when there
    /// is nothing to release.
    async fn release(&self, cancel: &CancellationToken) -> LockResult<()>;

    /// Extend the TTL of the currently held lease.
    /// Fails with `LockError::Conflict` once the lease has been lost.
    async fn renew(&self, cancel: &CancellationToken) -> LockResult<()>;
}
