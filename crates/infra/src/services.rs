use std::sync::Arc;

use anyhow::{Context, bail};
use procstats_domain::aggregation::AggregationService;
use procstats_domain::coordinator::ConcurrencyCoordinator;
use procstats_domain::error::DomainError;
use procstats_domain::hourly::HourlyTrendWriter;
use procstats_domain::idempotency::IdempotencyService;
use procstats_domain::memory::{
    InMemoryCounterStore, InMemoryDocumentSource, InMemoryIdempotencyStore, InMemoryJobQueue,
    InMemoryLockService, InMemoryReconciliationLog,
};
use procstats_domain::ports::counters::CounterStore;
use procstats_domain::ports::db::DbAdapter;
use procstats_domain::ports::documents::DocumentSource;
use procstats_domain::ports::idempotency::IdempotencyStore;
use procstats_domain::ports::jobs::JobQueue;
use procstats_domain::ports::lock::LockService;
use procstats_domain::ports::reconciliation::ReconciliationLog;
use procstats_domain::reconciliation::ReconciliationService;
use procstats_domain::recording::StatsRecorder;

use crate::config::AppConfig;
use crate::db::{self, DbConfig, MemoryAdapter, SurrealAdapter};
use crate::idempotency::RedisIdempotencyStore;
use crate::jobs::RedisJobQueue;
use crate::lock::RedisLockService;
use crate::repositories::{SurrealCounterStore, SurrealDocumentSource, SurrealReconciliationLog};

/// Concrete in-memory backends, kept so tests can seed and inspect them.
#[derive(Clone, Default)]
pub struct MemoryHandles {
    pub store: Arc<InMemoryCounterStore>,
    pub locks: Arc<InMemoryLockService>,
    pub documents: Arc<InMemoryDocumentSource>,
    pub audit: Arc<InMemoryReconciliationLog>,
    pub queue: Arc<InMemoryJobQueue>,
    pub idempotency: Arc<InMemoryIdempotencyStore>,
}

/// Every port the services need, resolved for one backend.
#[derive(Clone)]
pub struct StatsBackends {
    pub store: Arc<dyn CounterStore>,
    pub locks: Arc<dyn LockService>,
    pub documents: Arc<dyn DocumentSource>,
    pub audit: Arc<dyn ReconciliationLog>,
    pub queue: Arc<dyn JobQueue>,
    pub idempotency: Arc<dyn IdempotencyStore>,
    pub db: Arc<dyn DbAdapter>,
}

impl StatsBackends {
    pub fn memory() -> Self {
        Self::from_memory(&MemoryHandles::default())
    }

    pub fn from_memory(handles: &MemoryHandles) -> Self {
        Self {
            store: handles.store.clone(),
            locks: handles.locks.clone(),
            documents: handles.documents.clone(),
            audit: handles.audit.clone(),
            queue: handles.queue.clone(),
            idempotency: handles.idempotency.clone(),
            db: Arc::new(MemoryAdapter),
        }
    }

    /// Resolves `data_backend`: `memory`, or `surreal` with Redis for locks,
    /// replay claims and the job queue.
    pub async fn connect(config: &AppConfig) -> anyhow::Result<Self> {
        match config.data_backend.as_str() {
            "memory" => {
                tracing::warn!("using in-memory stats backend; counters are not durable");
                Ok(Self::memory())
            }
            "surreal" | "surrealdb" => {
                let db_config = DbConfig::from_app_config(config);
                let client = db::connect(&db_config)
                    .await
                    .context("failed to connect to surrealdb")?;
                db::apply_schema(&client).await?;
                let locks = RedisLockService::connect_with_prefix(
                    &config.redis_url,
                    config.stats_lock_prefix.clone(),
                )
                .await
                .context("failed to connect lock service")?;
                let queue = RedisJobQueue::connect_with_prefix(
                    &config.redis_url,
                    config.worker_queue_prefix.clone(),
                )
                .await
                .context("failed to connect job queue")?;
                let idempotency = RedisIdempotencyStore::connect_with_prefix(
                    &config.redis_url,
                    config.stats_replay_idempotency_prefix.clone(),
                )
                .await
                .context("failed to connect replay idempotency store")?;
                tracing::info!(
                    endpoint = %db_config.endpoint,
                    namespace = %db_config.namespace,
                    database = %db_config.database,
                    "surreal stats backend ready"
                );
                Ok(Self {
                    store: Arc::new(SurrealCounterStore::with_client(client.clone())),
                    locks: Arc::new(locks),
                    documents: Arc::new(SurrealDocumentSource::with_client(client.clone())),
                    audit: Arc::new(SurrealReconciliationLog::with_client(client)),
                    queue: Arc::new(queue),
                    idempotency: Arc::new(idempotency),
                    db: Arc::new(SurrealAdapter::new(db_config)),
                })
            }
            other => bail!("unsupported data_backend '{other}'"),
        }
    }
}

/// The three entry points shared by the api and the worker.
#[derive(Clone)]
pub struct StatsServices {
    pub recorder: StatsRecorder,
    pub aggregation: AggregationService,
    pub reconciliation: ReconciliationService,
}

impl StatsServices {
    pub fn build(backends: &StatsBackends, config: &AppConfig) -> Result<Self, DomainError> {
        let calendar = config.calendar()?;
        let coordinator = ConcurrencyCoordinator::new(
            backends.store.clone(),
            backends.locks.clone(),
            config.coordinator_config(),
        );
        Ok(Self {
            recorder: StatsRecorder::new(
                coordinator,
                HourlyTrendWriter::new(backends.store.clone()),
                backends.queue.clone(),
                IdempotencyService::new(
                    backends.idempotency.clone(),
                    config.replay_idempotency_config(),
                ),
                calendar,
                config.job_defaults(),
            ),
            aggregation: AggregationService::new(backends.store.clone(), calendar),
            reconciliation: ReconciliationService::new(
                backends.documents.clone(),
                backends.store.clone(),
                backends.audit.clone(),
                calendar,
            ),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_backend_resolves_without_network() {
        let config = AppConfig::for_tests();
        let backends = StatsBackends::connect(&config).await.unwrap();
        assert_eq!(backends.db.name(), "memory");
        assert!(backends.db.health_check().await.is_ok());
        assert!(StatsServices::build(&backends, &config).is_ok());
    }

    #[tokio::test]
    async fn unknown_backend_is_rejected() {
        let mut config = AppConfig::for_tests();
        config.data_backend = "sqlite".to_string();
        assert!(StatsBackends::connect(&config).await.is_err());
    }

    #[test]
    fn invalid_offset_fails_service_build() {
        let mut config = AppConfig::for_tests();
        config.stats_utc_offset_minutes = 27 * 60;
        assert!(StatsServices::build(&StatsBackends::memory(), &config).is_err());
    }
}
