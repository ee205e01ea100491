use std::time::Duration;

use procstats_domain::calendar::StatsCalendar;
use procstats_domain::coordinator::CoordinatorConfig;
use procstats_domain::idempotency::IdempotencyConfig;
use procstats_domain::jobs::JobDefaults;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub app_env: String,
    pub port: u16,
    pub log_level: String,
    pub data_backend: String,
    pub surreal_endpoint: String,
    pub surreal_ns: String,
    pub surreal_db: String,
    pub surreal_user: String,
    pub surreal_pass: String,
    pub redis_url: String,
    pub request_timeout_ms: u64,
    pub rate_limit_per_second: u64,
    pub rate_limit_burst: u32,
    pub stats_lock_enabled: bool,
    pub stats_lock_ttl_ms: u64,
    pub stats_lock_wait_ms: u64,
    pub stats_lock_poll_ms: u64,
    pub stats_lock_prefix: String,
    pub stats_max_retries: u32,
    pub stats_backoff_base_ms: u64,
    pub stats_backoff_max_ms: u64,
    pub stats_utc_offset_minutes: i32,
    pub stats_replay_idempotency_prefix: String,
    pub stats_replay_claim_ttl_ms: u64,
    pub stats_replay_completed_ttl_ms: u64,
    pub worker_queue_prefix: String,
    pub worker_poll_interval_ms: u64,
    pub worker_promote_batch: usize,
    pub worker_backoff_base_ms: u64,
    pub worker_backoff_max_ms: u64,
    pub worker_max_attempts: u32,
    pub worker_reconcile_interval_ms: u64,
    pub worker_reconcile_lookback_days: u32,
    pub worker_metrics_port: u16,
}

impl AppConfig {
    pub fn load() -> Result<Self, config::ConfigError> {
        dotenvy::dotenv().ok();
        let cfg = config::Config::builder()
            .set_default("app_env", "development")?
            .set_default("port", 3000)?
            .set_default("log_level", "info")?
            .set_default("data_backend", "memory")?
            .set_default("surreal_endpoint", "ws://127.0.0.1:8000")?
            .set_default("surreal_ns", "procstats")?
            .set_default("surreal_db", "stats")?
            .set_default("surreal_user", "root")?
            .set_default("surreal_pass", "root")?
            .set_default("redis_url", "redis://127.0.0.1:6379")?
            .set_default("request_timeout_ms", 15_000)?
            .set_default("rate_limit_per_second", 50)?
            .set_default("rate_limit_burst", 200)?
            .set_default("stats_lock_enabled", true)?
            .set_default("stats_lock_ttl_ms", 5_000)?
            .set_default("stats_lock_wait_ms", 250)?
            .set_default("stats_lock_poll_ms", 20)?
            .set_default("stats_lock_prefix", "procstats:lock")?
            .set_default("stats_max_retries", 5)?
            .set_default("stats_backoff_base_ms", 10)?
            .set_default("stats_backoff_max_ms", 200)?
            .set_default("stats_utc_offset_minutes", 0)?
            .set_default("stats_replay_idempotency_prefix", "procstats:idemp")?
            .set_default("stats_replay_claim_ttl_ms", 60_000)?
            .set_default("stats_replay_completed_ttl_ms", 86_400_000)?
            .set_default("worker_queue_prefix", "procstats:jobs")?
            .set_default("worker_poll_interval_ms", 1000)?
            .set_default("worker_promote_batch", 50)?
            .set_default("worker_backoff_base_ms", 1000)?
            .set_default("worker_backoff_max_ms", 60000)?
            .set_default("worker_max_attempts", 5)?
            .set_default("worker_reconcile_interval_ms", 3_600_000)?
            .set_default("worker_reconcile_lookback_days", 1)?
            .set_default("worker_metrics_port", 9100)?
            .add_source(config::Environment::default().separator("__"))
            .build()?;
        cfg.try_deserialize()
    }

    pub fn is_production(&self) -> bool {
        self.app_env.eq_ignore_ascii_case("production")
    }

    pub fn is_test(&self) -> bool {
        self.app_env.eq_ignore_ascii_case("test")
    }

    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            lock_enabled: self.stats_lock_enabled,
            lock_ttl: Duration::from_millis(self.stats_lock_ttl_ms.max(1)),
            lock_wait: Duration::from_millis(self.stats_lock_wait_ms),
            lock_poll_interval: Duration::from_millis(self.stats_lock_poll_ms.max(1)),
            max_retries: self.stats_max_retries,
            backoff_base: Duration::from_millis(self.stats_backoff_base_ms),
            backoff_max: Duration::from_millis(self.stats_backoff_max_ms),
        }
    }

    /// The claim TTL is floored at one second so a slow write keeps its claim.
    pub fn replay_idempotency_config(&self) -> IdempotencyConfig {
        IdempotencyConfig {
            in_progress_ttl: Duration::from_millis(self.stats_replay_claim_ttl_ms.max(1_000)),
            completed_ttl: Duration::from_millis(self.stats_replay_completed_ttl_ms),
        }
    }

    pub fn calendar(&self) -> Result<StatsCalendar, procstats_domain::error::DomainError> {
        StatsCalendar::from_offset_minutes(self.stats_utc_offset_minutes)
    }

    pub fn job_defaults(&self) -> JobDefaults {
        JobDefaults {
            max_attempts: self.worker_max_attempts.max(1),
        }
    }

    /// Defaults with the in-memory backend, for tests.
    pub fn for_tests() -> Self {
        Self {
            app_env: "test".to_string(),
            port: 0,
            log_level: "warn".to_string(),
            data_backend: "memory".to_string(),
            surreal_endpoint: "ws://127.0.0.1:8000".to_string(),
            surreal_ns: "procstats".to_string(),
            surreal_db: "stats".to_string(),
            surreal_user: "root".to_string(),
            surreal_pass: "root".to_string(),
            redis_url: "redis://127.0.0.1:6379".to_string(),
            request_timeout_ms: 5_000,
            rate_limit_per_second: 50,
            rate_limit_burst: 200,
            stats_lock_enabled: true,
            stats_lock_ttl_ms: 5_000,
            stats_lock_wait_ms: 50,
            stats_lock_poll_ms: 5,
            stats_lock_prefix: "procstats:lock".to_string(),
            stats_max_retries: 5,
            stats_backoff_base_ms: 1,
            stats_backoff_max_ms: 10,
            stats_utc_offset_minutes: 0,
            stats_replay_idempotency_prefix: "procstats:idemp".to_string(),
            stats_replay_claim_ttl_ms: 60_000,
            stats_replay_completed_ttl_ms: 86_400_000,
            worker_queue_prefix: "procstats:jobs".to_string(),
            worker_poll_interval_ms: 50,
            worker_promote_batch: 50,
            worker_backoff_base_ms: 10,
            worker_backoff_max_ms: 100,
            worker_max_attempts: 3,
            worker_reconcile_interval_ms: 3_600_000,
            worker_reconcile_lookback_days: 1,
            worker_metrics_port: 0,
        }
    }
}
