//! Exactly-once guard for replayed daily writes.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::ports::idempotency::{
    IdempotencyError, IdempotencyRecord, IdempotencyState, IdempotencyStore, PutOutcome,
};
use crate::stats::ProcessingResultEvent;

#[derive(Clone, Debug)]
pub struct IdempotencyConfig {
    /// How long a crashed claim blocks a retry.
    pub in_progress_ttl: Duration,
    pub completed_ttl: Duration,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            in_progress_ttl: Duration::from_secs(60),
            completed_ttl: Duration::from_secs(60 * 60 * 24),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum BeginOutcome {
    Started,
    InProgress,
    Completed(serde_json::Value),
}

#[derive(Clone)]
pub struct IdempotencyService {
    store: Arc<dyn IdempotencyStore>,
    config: IdempotencyConfig,
}

impl IdempotencyService {
    pub fn new(store: Arc<dyn IdempotencyStore>, config: IdempotencyConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &IdempotencyConfig {
        &self.config
    }

    pub async fn begin(&self, key: &str) -> Result<BeginOutcome, IdempotencyError> {
        let record = IdempotencyRecord::in_progress();
        match self
            .store
            .put_if_absent(key, &record, self.config.in_progress_ttl)
            .await?
        {
            PutOutcome::Stored => Ok(BeginOutcome::Started),
            PutOutcome::Existing(existing) => match existing.state {
                IdempotencyState::InProgress => Ok(BeginOutcome::InProgress),
                IdempotencyState::Completed => {
                    let result = existing.result.ok_or_else(|| {
                        IdempotencyError::Store("completed record missing result".into())
                    })?;
                    Ok(BeginOutcome::Completed(result))
                }
            },
        }
    }

    pub async fn complete<T>(&self, key: &str, result: &T) -> Result<(), IdempotencyError>
    where
        T: Serialize,
    {
        let value = serde_json::to_value(result)
            .map_err(|err| IdempotencyError::Serialization(err.to_string()))?;
        self.store
            .update(key, &IdempotencyRecord::completed(value), self.config.completed_ttl)
            .await
    }

    /// Releases a claim whose operation failed.
    pub async fn abandon(&self, key: &str) -> Result<(), IdempotencyError> {
        self.store.remove(key).await
    }
}

/// One key per recorded event, so a re-processed document replays again.
pub fn replay_idempotency_key(event: &ProcessingResultEvent) -> String {
    format!(
        "stats_replay:{}:{}:{}",
        event.city_code,
        event.document_id,
        event.processed_at.unix_timestamp_nanos()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryIdempotencyStore;
    use crate::stats::ResultType;
    use time::macros::datetime;

    fn service(config: IdempotencyConfig) -> IdempotencyService {
        IdempotencyService::new(Arc::new(InMemoryIdempotencyStore::new()), config)
    }

    #[tokio::test]
    async fn second_begin_sees_claim_then_result() {
        let service = service(IdempotencyConfig::default());
        assert_eq!(service.begin("k").await.unwrap(), BeginOutcome::Started);
        assert_eq!(service.begin("k").await.unwrap(), BeginOutcome::InProgress);

        service.complete("k", &serde_json::json!({"version": 3})).await.unwrap();
        assert_eq!(
            service.begin("k").await.unwrap(),
            BeginOutcome::Completed(serde_json::json!({"version": 3}))
        );
    }

    #[tokio::test]
    async fn abandoned_or_expired_claims_can_restart() {
        let service = service(IdempotencyConfig {
            in_progress_ttl: Duration::from_millis(1),
            ..IdempotencyConfig::default()
        });
        assert_eq!(service.begin("a").await.unwrap(), BeginOutcome::Started);
        service.abandon("a").await.unwrap();
        assert_eq!(service.begin("a").await.unwrap(), BeginOutcome::Started);

        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(service.begin("a").await.unwrap(), BeginOutcome::Started);
    }

    #[test]
    fn key_distinguishes_reprocessed_documents() {
        let first = ProcessingResultEvent {
            document_id: "doc-1".into(),
            city_code: "TPE".into(),
            result_type: ResultType::Failed,
            processing_duration_seconds: None,
            processed_at: datetime!(2025-01-10 08:15 UTC),
        };
        let mut again = first.clone();
        again.processed_at = datetime!(2025-01-10 09:40 UTC);
        assert_ne!(replay_idempotency_key(&first), replay_idempotency_key(&again));
        assert!(replay_idempotency_key(&first).starts_with("stats_replay:TPE:doc-1:"));
    }
}
