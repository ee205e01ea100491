use thiserror::Error;

use super::BoxFuture;
use crate::error::DomainError;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("db unavailable: {0}")]
    Unavailable(String),
    #[error("db operation failed: {0}")]
    Operation(String),
}

impl From<DbError> for DomainError {
    fn from(err: DbError) -> Self {
        DomainError::Persistence(err.to_string())
    }
}

/// Readiness check for whichever store backs the counters.
pub trait DbAdapter: Send + Sync {
    fn name(&self) -> &'static str;
    fn health_check(&self) -> BoxFuture<'_, Result<(), DbError>>;
}
