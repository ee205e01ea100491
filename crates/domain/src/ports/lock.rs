use std::time::Duration;

use thiserror::Error;

use super::BoxFuture;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock service unavailable: {0}")]
    Unavailable(String),
    #[error("lock operation failed: {0}")]
    Operation(String),
}

/// Proof of a held lock. Only the holder's token can release it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LockLease {
    pub key: String,
    pub token: String,
}

pub trait LockService: Send + Sync {
    /// Single non-blocking attempt. `None` means someone else holds `key`.
    fn try_acquire(
        &self,
        key: &str,
        ttl: Duration,
    ) -> BoxFuture<'_, Result<Option<LockLease>, LockError>>;

    /// Returns `false` when the lease had already expired or been taken over.
    fn release(&self, lease: &LockLease) -> BoxFuture<'_, Result<bool, LockError>>;
}
