//! Serialises daily counter updates per `(city, date)`.
//!
//! With the lock held a delta is one atomic upsert. Otherwise it goes through a
//! version-checked read-modify-write.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use time::{Date, OffsetDateTime};
use tokio::time::{Instant, sleep};

use crate::DomainResult;
use crate::error::DomainError;
use crate::ports::counters::CounterStore;
use crate::ports::lock::{LockLease, LockService};
use crate::stats::{CounterDelta, DailyCounter};

#[derive(Clone, Debug)]
pub struct CoordinatorConfig {
    pub lock_enabled: bool,
    pub lock_ttl: Duration,
    pub lock_wait: Duration,
    pub lock_poll_interval: Duration,
    /// Retries after the first optimistic attempt.
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            lock_enabled: true,
            lock_ttl: Duration::from_secs(5),
            lock_wait: Duration::from_millis(250),
            lock_poll_interval: Duration::from_millis(20),
            max_retries: 5,
            backoff_base: Duration::from_millis(10),
            backoff_max: Duration::from_millis(200),
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WritePath {
    Locked,
    Optimistic,
    /// Single lock-free upsert, used for advisory buckets.
    Direct,
}

impl WritePath {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Locked => "locked",
            Self::Optimistic => "optimistic",
            Self::Direct => "direct",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ApplyOutcome {
    pub path: WritePath,
    pub attempts: u32,
    pub counter: DailyCounter,
}

pub fn daily_lock_key(city_code: &str, date: Date) -> String {
    format!("stats:daily:{city_code}:{date}")
}

#[derive(Clone)]
pub struct ConcurrencyCoordinator {
    store: Arc<dyn CounterStore>,
    locks: Arc<dyn LockService>,
    config: CoordinatorConfig,
}

impl ConcurrencyCoordinator {
    pub fn new(
        store: Arc<dyn CounterStore>,
        locks: Arc<dyn LockService>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            store,
            locks,
            config,
        }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub async fn apply_delta(
        &self,
        city_code: &str,
        date: Date,
        delta: &CounterDelta,
    ) -> DomainResult<ApplyOutcome> {
        if self.config.lock_enabled {
            let key = daily_lock_key(city_code, date);
            if let Some(lease) = self.acquire(&key).await {
                let result = self
                    .store
                    .upsert_daily_delta(city_code, date, delta, OffsetDateTime::now_utc())
                    .await;
                self.release(&lease).await;
                match result {
                    Ok(counter) => {
                        return Ok(ApplyOutcome {
                            path: WritePath::Locked,
                            attempts: 1,
                            counter,
                        });
                    }
                    Err(err) if lost_race(&err) => {
                        tracing::debug!(
                            city_code,
                            %date,
                            error = %err,
                            "locked upsert rolled back; retrying optimistically"
                        );
                    }
                    Err(err) => return Err(err),
                }
            } else {
                tracing::debug!(
                    city_code,
                    %date,
                    "daily counter lock not acquired; falling back to optimistic write"
                );
            }
        }
        self.apply_optimistic(city_code, date, delta).await
    }

    /// Version-checked read-modify-write, retried with jittered backoff.
    pub async fn apply_optimistic(
        &self,
        city_code: &str,
        date: Date,
        delta: &CounterDelta,
    ) -> DomainResult<ApplyOutcome> {
        let attempts = self.config.max_retries.saturating_add(1);
        for attempt in 0..attempts {
            let now = OffsetDateTime::now_utc();
            let written = match self.store.get_daily(city_code, date).await? {
                None => {
                    let fresh = DailyCounter::from_delta(city_code, date, delta, now);
                    match self.store.create_daily(&fresh).await {
                        Ok(created) => Some(created),
                        Err(err) if lost_race(&err) => None,
                        Err(err) => return Err(err),
                    }
                }
                Some(current) => {
                    let next = current.with_delta(delta, now);
                    match self
                        .store
                        .update_daily_if_version(&next, current.version)
                        .await
                    {
                        Ok(updated) => updated,
                        Err(err) if lost_race(&err) => None,
                        Err(err) => return Err(err),
                    }
                }
            };

            if let Some(counter) = written {
                return Ok(ApplyOutcome {
                    path: WritePath::Optimistic,
                    attempts: attempt + 1,
                    counter,
                });
            }
            if attempt + 1 < attempts {
                sleep(self.backoff(attempt)).await;
            }
        }

        tracing::warn!(
            city_code,
            %date,
            attempts,
            "optimistic daily counter write exhausted retries"
        );
        Err(DomainError::Contention { attempts })
    }

    async fn acquire(&self, key: &str) -> Option<LockLease> {
        let deadline = Instant::now() + self.config.lock_wait;
        loop {
            match self.locks.try_acquire(key, self.config.lock_ttl).await {
                Ok(Some(lease)) => return Some(lease),
                Ok(None) => {}
                Err(err) => {
                    tracing::warn!(error = %err, key, "lock service failed; skipping lock");
                    return None;
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            sleep(self.config.lock_poll_interval.min(deadline - now)).await;
        }
    }

    async fn release(&self, lease: &LockLease) {
        match self.locks.release(lease).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!(key = %lease.key, "lock lease expired before release");
            }
            Err(err) => {
                tracing::warn!(
                    error = %err,
                    key = %lease.key,
                    "lock release failed; ttl will expire it"
                );
            }
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let ceiling =
            backoff_for_attempt(self.config.backoff_base, self.config.backoff_max, attempt);
        let ceiling_ms = ceiling.as_millis() as u64;
        let jittered = rand::thread_rng().gen_range(ceiling_ms / 2..=ceiling_ms);
        Duration::from_millis(jittered)
    }
}

/// A rejected write that left the row untouched; re-reading and retrying is safe.
fn lost_race(err: &DomainError) -> bool {
    matches!(err, DomainError::Conflict | DomainError::Transient(_))
}

fn backoff_for_attempt(base: Duration, max: Duration, attempt: u32) -> Duration {
    if base.is_zero() {
        return Duration::from_millis(1);
    }
    let multiplier = 1u64 << attempt.min(8);
    let base_ms = base.as_millis() as u64;
    let max_ms = max.as_millis() as u64;
    let delay_ms = base_ms.saturating_mul(multiplier).max(1);
    if max_ms == 0 {
        Duration::from_millis(delay_ms)
    } else {
        Duration::from_millis(delay_ms.min(max_ms))
    }
}
