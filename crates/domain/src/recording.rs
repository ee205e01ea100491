use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::Date;

use crate::DomainResult;
use crate::calendar::StatsCalendar;
use crate::coordinator::{ApplyOutcome, ConcurrencyCoordinator, WritePath};
use crate::error::DomainError;
use crate::hourly::HourlyTrendWriter;
use crate::idempotency::{BeginOutcome, IdempotencyService, replay_idempotency_key};
use crate::jobs::{JobDefaults, StatsReplayPayload, replay_job};
use crate::ports::BoxFuture;
use crate::ports::jobs::JobQueue;
use crate::stats::{ProcessingResultEvent, sanitize_duration};

const MAX_CITY_CODE_LEN: usize = 32;
const MAX_DOCUMENT_ID_LEN: usize = 128;

/// Consistency level of one counter write.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum WritePolicy {
    /// Daily buckets: lock first, version-checked fallback, replay on failure.
    StrictDaily,
    /// Hourly buckets: one lock-free upsert, failures are dropped.
    BestEffortHourly,
}

impl WritePolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::StrictDaily => "strict_daily",
            Self::BestEffortHourly => "best_effort_hourly",
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct WriteReceipt {
    pub policy: WritePolicy,
    pub path: WritePath,
    pub attempts: u32,
    pub version: Option<u64>,
}

pub trait CounterWriteStrategy: Send + Sync {
    fn policy(&self) -> WritePolicy;

    fn write<'a>(
        &'a self,
        event: &'a ProcessingResultEvent,
    ) -> BoxFuture<'a, DomainResult<WriteReceipt>>;
}

pub struct StrictDailyStrategy {
    coordinator: ConcurrencyCoordinator,
    calendar: StatsCalendar,
}

impl StrictDailyStrategy {
    pub fn new(coordinator: ConcurrencyCoordinator, calendar: StatsCalendar) -> Self {
        Self {
            coordinator,
            calendar,
        }
    }

    async fn apply(&self, event: &ProcessingResultEvent) -> DomainResult<ApplyOutcome> {
        let date = self.calendar.day_of(event.processed_at);
        self.coordinator
            .apply_delta(&event.city_code, date, &event.delta())
            .await
    }
}

impl CounterWriteStrategy for StrictDailyStrategy {
    fn policy(&self) -> WritePolicy {
        WritePolicy::StrictDaily
    }

    fn write<'a>(
        &'a self,
        event: &'a ProcessingResultEvent,
    ) -> BoxFuture<'a, DomainResult<WriteReceipt>> {
        Box::pin(async move {
            let outcome = self.apply(event).await?;
            Ok(WriteReceipt {
                policy: WritePolicy::StrictDaily,
                path: outcome.path,
                attempts: outcome.attempts,
                version: Some(outcome.counter.version),
            })
        })
    }
}

pub struct BestEffortHourlyStrategy {
    writer: HourlyTrendWriter,
    calendar: StatsCalendar,
}

impl BestEffortHourlyStrategy {
    pub fn new(writer: HourlyTrendWriter, calendar: StatsCalendar) -> Self {
        Self { writer, calendar }
    }
}

impl CounterWriteStrategy for BestEffortHourlyStrategy {
    fn policy(&self) -> WritePolicy {
        WritePolicy::BestEffortHourly
    }

    fn write<'a>(
        &'a self,
        event: &'a ProcessingResultEvent,
    ) -> BoxFuture<'a, DomainResult<WriteReceipt>> {
        Box::pin(async move {
            let hour = self.calendar.hour_of(event.processed_at);
            self.writer
                .bump_hourly(&event.city_code, hour, &event.delta())
                .await?;
            Ok(WriteReceipt {
                policy: WritePolicy::BestEffortHourly,
                path: WritePath::Direct,
                attempts: 1,
                version: None,
            })
        })
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DailyWriteStatus {
    Applied {
        path: WritePath,
        attempts: u32,
        version: u64,
    },
    /// Queued for the worker to re-apply.
    Deferred { reason: String },
    /// Queue unavailable too; the event is in the error log for manual replay.
    LoggedForReplay { reason: String },
    Rejected { reason: String },
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum HourlyWriteStatus {
    Applied,
    Skipped { reason: String },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReplayOutcome {
    Applied(WriteReceipt),
    /// An earlier delivery of the same replay already wrote the delta.
    AlreadyApplied(Option<WriteReceipt>),
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecordOutcome {
    pub document_id: String,
    pub city_code: String,
    pub date: Option<Date>,
    pub daily: DailyWriteStatus,
    pub hourly: HourlyWriteStatus,
}

/// Entry point for the processing pipeline.
///
/// Recording is a side channel of document completion: it never returns an
/// error. Daily writes that fail are handed to the replay queue.
#[derive(Clone)]
pub struct StatsRecorder {
    daily: Arc<dyn CounterWriteStrategy>,
    hourly: Arc<dyn CounterWriteStrategy>,
    replay_queue: Arc<dyn JobQueue>,
    replay_guard: IdempotencyService,
    calendar: StatsCalendar,
    job_defaults: JobDefaults,
}

impl StatsRecorder {
    pub fn new(
        coordinator: ConcurrencyCoordinator,
        hourly_writer: HourlyTrendWriter,
        replay_queue: Arc<dyn JobQueue>,
        replay_guard: IdempotencyService,
        calendar: StatsCalendar,
        job_defaults: JobDefaults,
    ) -> Self {
        Self {
            daily: Arc::new(StrictDailyStrategy::new(coordinator, calendar)),
            hourly: Arc::new(BestEffortHourlyStrategy::new(hourly_writer, calendar)),
            replay_queue,
            replay_guard,
            calendar,
            job_defaults,
        }
    }

    pub fn strategy(&self, policy: WritePolicy) -> &dyn CounterWriteStrategy {
        match policy {
            WritePolicy::StrictDaily => self.daily.as_ref(),
            WritePolicy::BestEffortHourly => self.hourly.as_ref(),
        }
    }

    pub async fn write(
        &self,
        policy: WritePolicy,
        event: &ProcessingResultEvent,
    ) -> DomainResult<WriteReceipt> {
        self.strategy(policy).write(event).await
    }

    pub async fn record_processing_result(&self, event: &ProcessingResultEvent) -> RecordOutcome {
        let event = match normalize_event(event) {
            Ok(event) => event,
            Err(err) => {
                tracing::error!(
                    error = %err,
                    document_id = %event.document_id,
                    "processing result rejected"
                );
                let reason = err.to_string();
                return RecordOutcome {
                    document_id: event.document_id.clone(),
                    city_code: event.city_code.clone(),
                    date: None,
                    daily: DailyWriteStatus::Rejected {
                        reason: reason.clone(),
                    },
                    hourly: HourlyWriteStatus::Skipped { reason },
                };
            }
        };

        let daily = match self.write(WritePolicy::StrictDaily, &event).await {
            Ok(receipt) => DailyWriteStatus::Applied {
                path: receipt.path,
                attempts: receipt.attempts,
                version: receipt.version.unwrap_or_default(),
            },
            Err(err) => self.defer(&event, &err).await,
        };

        let hourly = match self.write(WritePolicy::BestEffortHourly, &event).await {
            Ok(_) => HourlyWriteStatus::Applied,
            Err(err) => {
                tracing::warn!(
                    error = %err,
                    city_code = %event.city_code,
                    document_id = %event.document_id,
                    "hourly trend write dropped"
                );
                HourlyWriteStatus::Skipped {
                    reason: err.to_string(),
                }
            }
        };

        RecordOutcome {
            date: Some(self.calendar.day_of(event.processed_at)),
            document_id: event.document_id,
            city_code: event.city_code,
            daily,
            hourly,
        }
    }

    /// Re-applies a deferred daily write at most once per recorded event.
    /// Errors go back to the worker.
    pub async fn replay(&self, payload: &StatsReplayPayload) -> DomainResult<ReplayOutcome> {
        let event = normalize_event(&payload.event)?;
        let key = replay_idempotency_key(&event);
        match self.replay_guard.begin(&key).await? {
            BeginOutcome::Started => {}
            BeginOutcome::InProgress => {
                return Err(DomainError::Transient(format!(
                    "replay {key} is being applied by another worker"
                )));
            }
            BeginOutcome::Completed(previous) => {
                return Ok(ReplayOutcome::AlreadyApplied(
                    serde_json::from_value(previous).ok(),
                ));
            }
        }

        match self.write(WritePolicy::StrictDaily, &event).await {
            Ok(receipt) => {
                if let Err(err) = self.replay_guard.complete(&key, &receipt).await {
                    // The in-progress marker still blocks redelivery until it expires.
                    tracing::warn!(error = %err, key = %key, "replay completion not recorded");
                }
                Ok(ReplayOutcome::Applied(receipt))
            }
            Err(err) => {
                if let Err(release_err) = self.replay_guard.abandon(&key).await {
                    tracing::warn!(
                        error = %release_err,
                        key = %key,
                        "replay claim not released; waiting for expiry"
                    );
                }
                Err(err)
            }
        }
    }

    async fn defer(&self, event: &ProcessingResultEvent, err: &DomainError) -> DailyWriteStatus {
        let reason = err.to_string();
        let payload = StatsReplayPayload {
            event: event.clone(),
            reason: reason.clone(),
        };
        let enqueue_error = match replay_job(&payload, self.job_defaults.clone()) {
            Ok(job) => match self.replay_queue.enqueue(&job).await {
                Ok(()) => None,
                Err(queue_err) => Some(queue_err.to_string()),
            },
            Err(serialize_err) => Some(serialize_err.to_string()),
        };

        match enqueue_error {
            None => {
                tracing::warn!(
                    error = %err,
                    city_code = %event.city_code,
                    document_id = %event.document_id,
                    "daily counter write deferred to replay queue"
                );
                DailyWriteStatus::Deferred { reason }
            }
            Some(queue_err) => {
                let event_json = serde_json::to_string(event).unwrap_or_default();
                tracing::error!(
                    error = %err,
                    queue_error = %queue_err,
                    event = %event_json,
                    "daily counter write failed and replay enqueue failed"
                );
                DailyWriteStatus::LoggedForReplay { reason }
            }
        }
    }
}

fn normalize_event(event: &ProcessingResultEvent) -> DomainResult<ProcessingResultEvent> {
    let city_code = event.city_code.trim().to_string();
    if city_code.is_empty() {
        return Err(DomainError::Validation("city_code is required".into()));
    }
    if city_code.chars().count() > MAX_CITY_CODE_LEN {
        return Err(DomainError::Validation(format!(
            "city_code exceeds max length of {MAX_CITY_CODE_LEN}"
        )));
    }
    let document_id = event.document_id.trim().to_string();
    if document_id.is_empty() {
        return Err(DomainError::Validation("document_id is required".into()));
    }
    if document_id.chars().count() > MAX_DOCUMENT_ID_LEN {
        return Err(DomainError::Validation(format!(
            "document_id exceeds max length of {MAX_DOCUMENT_ID_LEN}"
        )));
    }

    let duration = sanitize_duration(event.processing_duration_seconds);
    if duration.is_none() && event.processing_duration_seconds.is_some() {
        tracing::warn!(
            document_id = %document_id,
            "ignoring invalid processing duration"
        );
    }

    Ok(ProcessingResultEvent {
        document_id,
        city_code,
        result_type: event.result_type,
        processing_duration_seconds: duration,
        processed_at: event.processed_at,
    })
}
