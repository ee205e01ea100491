use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::BoxFuture;
use crate::error::DomainError;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum IdempotencyState {
    InProgress,
    Completed,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct IdempotencyRecord {
    pub state: IdempotencyState,
    pub result: Option<serde_json::Value>,
}

impl IdempotencyRecord {
    pub fn in_progress() -> Self {
        Self {
            state: IdempotencyState::InProgress,
            result: None,
        }
    }

    pub fn completed(result: serde_json::Value) -> Self {
        Self {
            state: IdempotencyState::Completed,
            result: Some(result),
        }
    }
}

#[derive(Debug, Error)]
pub enum IdempotencyError {
    #[error("idempotency store unavailable: {0}")]
    Unavailable(String),
    #[error("idempotency serialization error: {0}")]
    Serialization(String),
    #[error("idempotency store error: {0}")]
    Store(String),
}

impl From<IdempotencyError> for DomainError {
    fn from(err: IdempotencyError) -> Self {
        match err {
            IdempotencyError::Unavailable(_) => DomainError::Persistence(err.to_string()),
            IdempotencyError::Serialization(_) | IdempotencyError::Store(_) => {
                DomainError::Transient(err.to_string())
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PutOutcome {
    Stored,
    Existing(IdempotencyRecord),
}

/// Claim-once markers keyed by an operation id.
pub trait IdempotencyStore: Send + Sync {
    /// Stores `record` only when `key` is free or expired.
    fn put_if_absent(
        &self,
        key: &str,
        record: &IdempotencyRecord,
        ttl: Duration,
    ) -> BoxFuture<'_, Result<PutOutcome, IdempotencyError>>;

    fn update(
        &self,
        key: &str,
        record: &IdempotencyRecord,
        ttl: Duration,
    ) -> BoxFuture<'_, Result<(), IdempotencyError>>;

    /// Frees `key` so the operation can be claimed again.
    fn remove(&self, key: &str) -> BoxFuture<'_, Result<(), IdempotencyError>>;
}
