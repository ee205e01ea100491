use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use procstats_domain::calendar::StatsCalendar;
use procstats_domain::jobs::{JobDefaults, StatsReconcilePayload, reconcile_job};
use procstats_domain::ports::counters::CounterStore;
use procstats_domain::ports::documents::DocumentSource;
use procstats_domain::ports::jobs::JobQueue;
use procstats_infra::config::AppConfig;
use time::Date;
use tokio::sync::watch;

use crate::observability;

const SCHEDULER_ACTOR: &str = "scheduler";

#[derive(Clone, Debug)]
pub struct SchedulerSettings {
    pub interval: Duration,
    pub lookback_days: u32,
}

impl SchedulerSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            interval: Duration::from_millis(config.worker_reconcile_interval_ms.max(1_000)),
            lookback_days: config.worker_reconcile_lookback_days.max(1),
        }
    }

    /// A closed day stays inside the lookback window for `lookback_days`
    /// days, so its marker must outlive that plus the day in progress.
    pub fn dedupe_ttl_ms(&self) -> u64 {
        (u64::from(self.lookback_days) + 1) * 86_400_000
    }
}

/// Enqueues one reconciliation job per known city for each recently closed day.
pub struct ReconcileScheduler {
    queue: Arc<dyn JobQueue>,
    store: Arc<dyn CounterStore>,
    documents: Arc<dyn DocumentSource>,
    calendar: StatsCalendar,
    job_defaults: JobDefaults,
    settings: SchedulerSettings,
}

impl ReconcileScheduler {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        store: Arc<dyn CounterStore>,
        documents: Arc<dyn DocumentSource>,
        calendar: StatsCalendar,
        job_defaults: JobDefaults,
        settings: SchedulerSettings,
    ) -> Self {
        Self {
            queue,
            store,
            documents,
            calendar,
            job_defaults,
            settings,
        }
    }

    /// Closed days to verify, most recent first. Today is never included.
    pub fn target_dates(&self, today: Date) -> Vec<Date> {
        std::iter::successors(today.previous_day(), |date| date.previous_day())
            .take(self.settings.lookback_days as usize)
            .collect()
    }

    /// Returns how many jobs were newly enqueued.
    pub async fn schedule_once(&self) -> anyhow::Result<usize> {
        let known = self
            .store
            .list_city_codes()
            .await
            .context("failed to list counter cities")?;
        let mut enqueued = 0usize;
        for date in self.target_dates(self.calendar.today()) {
            let (start, end) = self.calendar.day_window(date);
            let active = self
                .documents
                .list_active_cities(start, end)
                .await
                .context("failed to list active cities")?;
            let cities: BTreeSet<&String> = known.iter().chain(active.iter()).collect();
            for city_code in cities {
                let payload = StatsReconcilePayload {
                    city_code: city_code.clone(),
                    date,
                    executed_by: SCHEDULER_ACTOR.to_string(),
                };
                let job = reconcile_job(&payload, self.job_defaults.clone())?;
                if self
                    .queue
                    .enqueue_if_absent(&job, self.settings.dedupe_ttl_ms())
                    .await?
                {
                    enqueued += 1;
                }
            }
        }
        observability::register_jobs_scheduled(enqueued);
        tracing::info!(enqueued, "reconciliation jobs scheduled");
        Ok(enqueued)
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.settings.interval);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    if let Err(err) = self.schedule_once().await {
                        tracing::error!(error = %err, "reconciliation scheduling failed");
                    }
                }
            }
        }
        tracing::info!("reconciliation scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use procstats_domain::ports::documents::{DocumentRecord, DocumentStatus};
    use procstats_domain::stats::DailyCounter;
    use procstats_infra::services::MemoryHandles;
    use time::Duration as TimeDuration;
    use time::macros::date;

    fn scheduler(handles: &MemoryHandles, lookback_days: u32) -> ReconcileScheduler {
        scheduler_every(handles, Duration::from_secs(3_600), lookback_days)
    }

    fn scheduler_every(
        handles: &MemoryHandles,
        interval: Duration,
        lookback_days: u32,
    ) -> ReconcileScheduler {
        ReconcileScheduler::new(
            handles.queue.clone(),
            handles.store.clone(),
            handles.documents.clone(),
            StatsCalendar::default(),
            JobDefaults::default(),
            SchedulerSettings {
                interval,
                lookback_days,
            },
        )
    }

    #[test]
    fn target_dates_skip_today() {
        let handles = MemoryHandles::default();
        let dates = scheduler(&handles, 3).target_dates(date!(2025 - 03 - 01));
        assert_eq!(
            dates,
            vec![
                date!(2025 - 02 - 28),
                date!(2025 - 02 - 27),
                date!(2025 - 02 - 26)
            ]
        );
    }

    #[tokio::test]
    async fn schedules_each_known_city_once() {
        let handles = MemoryHandles::default();
        let calendar = StatsCalendar::default();
        let yesterday = calendar.today() - TimeDuration::days(1);
        handles
            .store
            .put_daily_raw(DailyCounter::empty(
                "TPE",
                date!(2025 - 01 - 10),
                time::OffsetDateTime::now_utc(),
            ))
            .await;
        let (start, _) = calendar.day_window(yesterday);
        handles
            .documents
            .insert(DocumentRecord {
                document_id: "doc-1".into(),
                city_code: "KHH".into(),
                status: DocumentStatus::Completed,
                auto_approved: true,
                processing_duration_seconds: None,
                processed_at: start + TimeDuration::hours(1),
            })
            .await;

        let scheduler = scheduler(&handles, 2);
        assert_eq!(scheduler.schedule_once().await.unwrap(), 3);
        assert_eq!(scheduler.schedule_once().await.unwrap(), 0);

        let mut job_ids: Vec<String> = handles
            .queue
            .pending_jobs()
            .into_iter()
            .map(|job| job.job_id)
            .collect();
        job_ids.sort();
        let day_before = yesterday - TimeDuration::days(1);
        assert_eq!(
            job_ids,
            vec![
                format!("reconcile:KHH:{yesterday}"),
                format!("reconcile:TPE:{day_before}"),
                format!("reconcile:TPE:{yesterday}"),
            ]
        );
    }

    #[test]
    fn dedupe_window_spans_the_lookback() {
        let settings = SchedulerSettings {
            interval: Duration::from_secs(3_600),
            lookback_days: 2,
        };
        assert_eq!(settings.dedupe_ttl_ms(), 3 * 86_400_000);
    }

    #[tokio::test]
    async fn later_ticks_do_not_requeue_a_closed_day() {
        let handles = MemoryHandles::default();
        handles
            .store
            .put_daily_raw(DailyCounter::empty(
                "TPE",
                date!(2025 - 01 - 10),
                time::OffsetDateTime::now_utc(),
            ))
            .await;
        let interval = Duration::from_millis(10);
        let scheduler = scheduler_every(&handles, interval, 1);

        assert_eq!(scheduler.schedule_once().await.unwrap(), 1);
        let job = handles.queue.dequeue(Duration::from_millis(10)).await.unwrap().unwrap();
        handles.queue.ack(&job.job_id).await.unwrap();

        tokio::time::sleep(interval * 3).await;
        assert_eq!(scheduler.schedule_once().await.unwrap(), 0);
        assert!(handles.queue.pending_jobs().is_empty());
    }
}
