use std::sync::Arc;
use std::time::{Duration, Instant};

use procstats_domain::error::DomainError;
use procstats_domain::jobs::{StatsReconcilePayload, StatsReplayPayload, backoff_ms, now_ms};
use procstats_domain::ports::jobs::{JobEnvelope, JobQueue, JobQueueError, JobType};
use procstats_domain::reconciliation::{AuditType, ReconciliationService};
use procstats_domain::recording::{ReplayOutcome, StatsRecorder};
use procstats_infra::config::AppConfig;
use tokio::sync::watch;

use crate::observability;

const RECOVER_PROCESSING_LIMIT: usize = 10_000;

#[derive(Clone, Debug)]
pub struct RunnerSettings {
    pub poll_interval: Duration,
    pub promote_batch: usize,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
}

impl RunnerSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            poll_interval: Duration::from_millis(config.worker_poll_interval_ms.max(1)),
            promote_batch: config.worker_promote_batch.max(1),
            backoff_base_ms: config.worker_backoff_base_ms,
            backoff_max_ms: config.worker_backoff_max_ms,
        }
    }
}

/// Why a job did not complete.
#[derive(Debug)]
enum JobFailure {
    /// The payload can never succeed; dropped without retry.
    Permanent(String),
    Retryable(String),
}

impl From<DomainError> for JobFailure {
    fn from(err: DomainError) -> Self {
        if err.is_retryable() {
            Self::Retryable(err.to_string())
        } else {
            Self::Permanent(err.to_string())
        }
    }
}

/// What happened to one dequeued job.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobDisposition {
    Completed,
    Retried,
    Dropped,
}

impl JobDisposition {
    fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "success",
            Self::Retried => "retry",
            Self::Dropped => "dropped",
        }
    }
}

pub struct JobRunner {
    queue: Arc<dyn JobQueue>,
    recorder: StatsRecorder,
    reconciliation: ReconciliationService,
    settings: RunnerSettings,
}

impl JobRunner {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        recorder: StatsRecorder,
        reconciliation: ReconciliationService,
        settings: RunnerSettings,
    ) -> Self {
        Self {
            queue,
            recorder,
            reconciliation,
            settings,
        }
    }

    /// Jobs left in `processing` by a previous run go back to `ready`.
    pub async fn recover(&self) -> Result<usize, JobQueueError> {
        let moved = self
            .queue
            .requeue_processing(RECOVER_PROCESSING_LIMIT)
            .await?;
        if moved > 0 {
            tracing::warn!(moved, "recovered in-flight jobs from previous run");
        }
        Ok(moved)
    }

    /// One loop turn. `None` when the poll timed out with nothing to do.
    pub async fn run_once(&self) -> Result<Option<JobDisposition>, JobQueueError> {
        let now = now_ms();
        let promoted = self
            .queue
            .promote_due(now, self.settings.promote_batch)
            .await?;
        if promoted > 0 {
            tracing::debug!(promoted, "promoted delayed jobs");
        }
        if let Ok(snapshot) = self.queue.snapshot().await {
            observability::set_queue_snapshot(&snapshot, now);
        }

        let Some(job) = self.queue.dequeue(self.settings.poll_interval).await? else {
            return Ok(None);
        };
        self.handle(job).await.map(Some)
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!("job runner started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = shutdown.changed() => break,
                turn = self.run_once() => {
                    if let Err(err) = turn {
                        tracing::error!(error = %err, "job queue error");
                        tokio::time::sleep(self.settings.poll_interval).await;
                    }
                }
            }
        }
        tracing::info!("job runner stopped");
    }

    async fn handle(&self, job: JobEnvelope) -> Result<JobDisposition, JobQueueError> {
        let started = Instant::now();
        let result = self.dispatch(&job).await;
        let disposition = match result {
            Ok(()) => {
                self.queue.ack(&job.job_id).await?;
                JobDisposition::Completed
            }
            Err(JobFailure::Permanent(reason)) => {
                tracing::error!(
                    job_id = %job.job_id,
                    job_type = job.job_type.as_str(),
                    attempt = job.attempt,
                    payload = %job.payload,
                    reason = %reason,
                    "job cannot succeed; dropped"
                );
                self.queue.ack(&job.job_id).await?;
                JobDisposition::Dropped
            }
            Err(JobFailure::Retryable(reason)) if job.attempt >= job.max_attempts => {
                tracing::error!(
                    job_id = %job.job_id,
                    job_type = job.job_type.as_str(),
                    attempt = job.attempt,
                    payload = %job.payload,
                    reason = %reason,
                    "job exhausted its attempts; dropped"
                );
                self.queue.ack(&job.job_id).await?;
                JobDisposition::Dropped
            }
            Err(JobFailure::Retryable(reason)) => {
                let delay_ms = backoff_ms(
                    self.settings.backoff_base_ms,
                    job.attempt,
                    self.settings.backoff_max_ms,
                );
                let mut next = job.clone().with_run_at(now_ms() + delay_ms as i64);
                next.attempt = job.next_attempt();
                tracing::warn!(
                    job_id = %job.job_id,
                    job_type = job.job_type.as_str(),
                    attempt = job.attempt,
                    delay_ms,
                    reason = %reason,
                    "job failed; retrying later"
                );
                self.queue.retry_later(&next).await?;
                JobDisposition::Retried
            }
        };
        observability::register_job_processed(
            job.job_type.as_str(),
            disposition.as_str(),
            started.elapsed().as_secs_f64() * 1_000.0,
        );
        Ok(disposition)
    }

    async fn dispatch(&self, job: &JobEnvelope) -> Result<(), JobFailure> {
        match job.job_type {
            JobType::StatsReplay => {
                let payload: StatsReplayPayload = decode_payload(job)?;
                match self.recorder.replay(&payload).await? {
                    ReplayOutcome::Applied(receipt) => tracing::info!(
                        job_id = %job.job_id,
                        city_code = %payload.event.city_code,
                        document_id = %payload.event.document_id,
                        path = receipt.path.as_str(),
                        attempts = receipt.attempts,
                        "deferred daily delta applied"
                    ),
                    ReplayOutcome::AlreadyApplied(_) => tracing::info!(
                        job_id = %job.job_id,
                        city_code = %payload.event.city_code,
                        document_id = %payload.event.document_id,
                        "deferred daily delta already applied; skipping"
                    ),
                }
            }
            JobType::StatsReconcile => {
                let payload: StatsReconcilePayload = decode_payload(job)?;
                let report = self
                    .reconciliation
                    .verify_and_reconcile(
                        &payload.city_code,
                        payload.date,
                        AuditType::Scheduled,
                        &payload.executed_by,
                    )
                    .await?;
                observability::register_reconciliation(report.verified, report.corrected);
            }
        }
        Ok(())
    }
}

fn decode_payload<T>(job: &JobEnvelope) -> Result<T, JobFailure>
where
    T: serde::de::DeserializeOwned,
{
    serde_json::from_value(job.payload.clone()).map_err(|err| {
        JobFailure::Permanent(format!(
            "invalid {} payload: {err}",
            job.job_type.as_str()
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use procstats_domain::jobs::{JobDefaults, new_job};
    use procstats_domain::ports::counters::CounterStore;
    use procstats_domain::ports::reconciliation::{ReconciliationLog, ReconciliationQuery};
    use procstats_domain::recording::DailyWriteStatus;
    use procstats_domain::stats::{ProcessingResultEvent, ResultType};
    use procstats_infra::services::{MemoryHandles, StatsBackends, StatsServices};
    use serde_json::json;
    use time::macros::{date, datetime};

    fn runner(handles: &MemoryHandles) -> (JobRunner, StatsServices) {
        let config = AppConfig::for_tests();
        let backends = StatsBackends::from_memory(handles);
        let services = StatsServices::build(&backends, &config).unwrap();
        let runner = JobRunner::new(
            backends.queue.clone(),
            services.recorder.clone(),
            services.reconciliation.clone(),
            RunnerSettings::from_config(&config),
        );
        (runner, services)
    }

    fn event() -> ProcessingResultEvent {
        ProcessingResultEvent {
            document_id: "doc-1".into(),
            city_code: "TPE".into(),
            result_type: ResultType::AutoApproved,
            processing_duration_seconds: Some(12.0),
            processed_at: datetime!(2025-01-10 08:00 UTC),
        }
    }

    #[tokio::test]
    async fn deferred_write_is_replayed() {
        let handles = MemoryHandles::default();
        let (runner, services) = runner(&handles);

        handles.store.set_unavailable(true);
        let outcome = services.recorder.record_processing_result(&event()).await;
        assert!(matches!(outcome.daily, DailyWriteStatus::Deferred { .. }));
        handles.store.set_unavailable(false);

        let disposition = runner.run_once().await.unwrap();
        assert_eq!(disposition, Some(JobDisposition::Completed));

        let counter = handles
            .store
            .get_daily("TPE", date!(2025 - 01 - 10))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(counter.totals.total_processed, 1);
        assert_eq!(counter.totals.auto_approved, 1);
        assert!(handles.queue.pending_jobs().is_empty());
        assert_eq!(handles.queue.processing_len(), 0);
    }

    #[tokio::test]
    async fn redelivered_replay_is_applied_once() {
        let handles = MemoryHandles::default();
        let (runner, services) = runner(&handles);

        handles.store.set_unavailable(true);
        services.recorder.record_processing_result(&event()).await;
        handles.store.set_unavailable(false);
        let deferred = handles.queue.pending_jobs().remove(0);
        handles.queue.enqueue(&deferred).await.unwrap();

        assert_eq!(runner.run_once().await.unwrap(), Some(JobDisposition::Completed));
        assert_eq!(runner.run_once().await.unwrap(), Some(JobDisposition::Completed));

        let counter = handles
            .store
            .get_daily("TPE", date!(2025 - 01 - 10))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(counter.totals.total_processed, 1);
        assert!(handles.queue.pending_jobs().is_empty());
    }

    #[tokio::test]
    async fn retryable_failure_backs_off_then_drops() {
        let handles = MemoryHandles::default();
        let (runner, services) = runner(&handles);

        handles.store.set_unavailable(true);
        services.recorder.record_processing_result(&event()).await;

        let disposition = runner.run_once().await.unwrap();
        assert_eq!(disposition, Some(JobDisposition::Retried));
        let pending = handles.queue.pending_jobs();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].attempt, 2);
        assert_eq!(handles.queue.processing_len(), 0);

        let mut last = None;
        for _ in 0..20 {
            tokio::time::sleep(Duration::from_millis(120)).await;
            if let Some(disposition) = runner.run_once().await.unwrap() {
                last = Some(disposition);
                if disposition == JobDisposition::Dropped {
                    break;
                }
            }
        }
        assert_eq!(last, Some(JobDisposition::Dropped));
        assert!(handles.queue.pending_jobs().is_empty());
        assert_eq!(handles.queue.processing_len(), 0);
    }

    #[tokio::test]
    async fn malformed_payload_is_dropped_without_retry() {
        let handles = MemoryHandles::default();
        let (runner, _) = runner(&handles);
        let job = new_job(
            "replay:bad".into(),
            JobType::StatsReplay,
            json!({ "unexpected": true }),
            "req".into(),
            "corr".into(),
            JobDefaults::default(),
        );
        handles.queue.enqueue(&job).await.unwrap();

        let disposition = runner.run_once().await.unwrap();
        assert_eq!(disposition, Some(JobDisposition::Dropped));
        assert!(handles.queue.pending_jobs().is_empty());
    }

    #[tokio::test]
    async fn scheduled_reconciliation_is_audited() {
        let handles = MemoryHandles::default();
        let (runner, _) = runner(&handles);
        let payload = StatsReconcilePayload {
            city_code: "TPE".into(),
            date: date!(2025 - 01 - 10),
            executed_by: "scheduler".into(),
        };
        let job = procstats_domain::jobs::reconcile_job(&payload, JobDefaults::default()).unwrap();
        handles.queue.enqueue(&job).await.unwrap();

        let disposition = runner.run_once().await.unwrap();
        assert_eq!(disposition, Some(JobDisposition::Completed));

        let records = handles
            .audit
            .list(&ReconciliationQuery {
                limit: 10,
                ..ReconciliationQuery::default()
            })
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].audit_type, AuditType::Scheduled);
        assert_eq!(records[0].executed_by, "scheduler");
    }

    #[tokio::test]
    async fn idle_poll_returns_none() {
        let handles = MemoryHandles::default();
        let (runner, _) = runner(&handles);
        assert_eq!(runner.run_once().await.unwrap(), None);
    }

    #[tokio::test]
    async fn recover_requeues_in_flight_jobs() {
        let handles = MemoryHandles::default();
        let (runner, _) = runner(&handles);
        let job = new_job(
            "replay:orphan".into(),
            JobType::StatsReplay,
            json!({}),
            "req".into(),
            "corr".into(),
            JobDefaults::default(),
        );
        handles.queue.enqueue(&job).await.unwrap();
        handles
            .queue
            .dequeue(Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(handles.queue.processing_len(), 1);

        assert_eq!(runner.recover().await.unwrap(), 1);
        assert_eq!(handles.queue.processing_len(), 0);
        assert_eq!(handles.queue.pending_jobs().len(), 1);
    }
}
