use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::{Date, OffsetDateTime};

use crate::DomainResult;
use crate::calendar::StatsCalendar;
use crate::error::DomainError;
use crate::ports::counters::CounterStore;
use crate::ports::documents::DocumentSource;
use crate::ports::reconciliation::{ReconciliationLog, ReconciliationQuery};
use crate::stats::{CounterDelta, DailyCounter, DateRange, StatsTotals};
use crate::util::{approx_eq, immutable_event_hash, uuid_v7_without_dashes};

const DEFAULT_LIST_LIMIT: usize = 50;
const MAX_LIST_LIMIT: usize = 500;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuditType {
    Scheduled,
    Manual,
}

impl AuditType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Manual => "manual",
        }
    }
}

/// `expected` is truth, `actual` is what the counter row held.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Discrepancy {
    pub field: String,
    pub expected: Option<f64>,
    pub actual: Option<f64>,
    pub difference: Option<f64>,
}

impl Discrepancy {
    fn new(field: &str, expected: Option<f64>, actual: Option<f64>) -> Self {
        let difference = match (expected, actual) {
            (Some(expected), Some(actual)) => Some(expected - actual),
            _ => None,
        };
        Self {
            field: field.to_string(),
            expected,
            actual,
            difference,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ReconciliationRecord {
    pub audit_id: String,
    pub city_code: String,
    pub date: Date,
    pub audit_type: AuditType,
    pub verified: bool,
    pub corrected: bool,
    pub documents_scanned: u64,
    pub discrepancies: Vec<Discrepancy>,
    pub corrections: Option<DailyCounter>,
    pub error: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub executed_at: OffsetDateTime,
    pub executed_by: String,
    #[serde(default)]
    pub record_hash: String,
}

impl ReconciliationRecord {
    fn seal(mut self) -> DomainResult<Self> {
        self.record_hash = String::new();
        self.record_hash = immutable_event_hash(&self)?;
        Ok(self)
    }

    /// Recomputes the digest over everything except `record_hash`.
    pub fn hash_matches(&self) -> bool {
        let mut unsealed = self.clone();
        unsealed.record_hash = String::new();
        immutable_event_hash(&unsealed).is_ok_and(|hash| hash == self.record_hash)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ReconciliationReport {
    pub verified: bool,
    pub discrepancies: Vec<Discrepancy>,
    pub corrected: bool,
    pub audit_log_id: String,
}

/// Counter values recomputed from per-document records.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Truth {
    pub totals: StatsTotals,
    pub min_processing_time_seconds: Option<f64>,
    pub max_processing_time_seconds: Option<f64>,
    pub documents_scanned: u64,
}

impl Truth {
    fn as_counter(&self, city_code: &str, date: Date, at: OffsetDateTime) -> DailyCounter {
        let mut counter = DailyCounter::empty(city_code, date, at);
        counter.totals = self.totals.clone();
        counter.min_processing_time_seconds = self.min_processing_time_seconds;
        counter.max_processing_time_seconds = self.max_processing_time_seconds;
        counter.refresh_derived();
        counter
    }
}

#[derive(Clone)]
pub struct ReconciliationService {
    documents: Arc<dyn DocumentSource>,
    store: Arc<dyn CounterStore>,
    audit: Arc<dyn ReconciliationLog>,
    calendar: StatsCalendar,
}

impl ReconciliationService {
    pub fn new(
        documents: Arc<dyn DocumentSource>,
        store: Arc<dyn CounterStore>,
        audit: Arc<dyn ReconciliationLog>,
        calendar: StatsCalendar,
    ) -> Self {
        Self {
            documents,
            store,
            audit,
            calendar,
        }
    }

    pub fn calendar(&self) -> StatsCalendar {
        self.calendar
    }

    /// Scans the authoritative records of one city-day. No documents is a
    /// valid all-zero truth.
    pub async fn compute_truth(&self, city_code: &str, date: Date) -> DomainResult<Truth> {
        let (start, end) = self.calendar.day_window(date);
        let documents = self.documents.list_documents(city_code, start, end).await?;

        let mut truth = Truth::default();
        for document in &documents {
            let Some(result_type) = document.result_type() else {
                continue;
            };
            let delta = CounterDelta::for_result(result_type, document.processing_duration_seconds);
            truth.totals.apply(&delta);
            truth.documents_scanned += 1;
            if let Some(seconds) = delta.duration_seconds {
                truth.min_processing_time_seconds = Some(
                    truth
                        .min_processing_time_seconds
                        .map_or(seconds, |current| current.min(seconds)),
                );
                truth.max_processing_time_seconds = Some(
                    truth
                        .max_processing_time_seconds
                        .map_or(seconds, |current| current.max(seconds)),
                );
            }
        }
        Ok(truth)
    }

    pub async fn verify_and_reconcile(
        &self,
        city_code: &str,
        date: Date,
        audit_type: AuditType,
        executed_by: &str,
    ) -> DomainResult<ReconciliationReport> {
        let city_code = city_code.trim();
        if city_code.is_empty() {
            return Err(DomainError::Validation("city_code is required".into()));
        }
        let executed_by = match executed_by.trim() {
            "" => audit_type.as_str(),
            actor => actor,
        };
        let today = self.calendar.today();
        if date > today {
            return Err(DomainError::Validation(format!(
                "cannot reconcile future date {date}"
            )));
        }
        if date == today {
            tracing::warn!(
                city_code,
                %date,
                same_day = true,
                "reconciling a day that is still accumulating"
            );
        }

        let mut record = ReconciliationRecord {
            audit_id: uuid_v7_without_dashes(),
            city_code: city_code.to_string(),
            date,
            audit_type,
            verified: false,
            corrected: false,
            documents_scanned: 0,
            discrepancies: Vec::new(),
            corrections: None,
            error: None,
            executed_at: OffsetDateTime::now_utc(),
            executed_by: executed_by.to_string(),
            record_hash: String::new(),
        };

        match self.reconcile(&mut record).await {
            Ok(()) => {
                let record = self.audit.append(&record.seal()?).await?;
                if record.discrepancies.is_empty() {
                    tracing::info!(
                        city_code,
                        %date,
                        audit_id = %record.audit_id,
                        corrected = record.corrected,
                        "daily counter verified"
                    );
                } else {
                    tracing::warn!(
                        city_code,
                        %date,
                        audit_id = %record.audit_id,
                        discrepancies = record.discrepancies.len(),
                        "daily counter corrected"
                    );
                }
                Ok(ReconciliationReport {
                    verified: record.verified,
                    discrepancies: record.discrepancies,
                    corrected: record.corrected,
                    audit_log_id: record.audit_id,
                })
            }
            Err(err) => {
                record.verified = false;
                record.corrected = false;
                record.error = Some(err.to_string());
                let sealed = record.seal()?;
                if let Err(audit_err) = self.audit.append(&sealed).await {
                    tracing::error!(
                        error = %audit_err,
                        city_code,
                        %date,
                        "failed to audit failed reconciliation"
                    );
                } else {
                    tracing::error!(
                        error = %err,
                        city_code,
                        %date,
                        audit_id = %sealed.audit_id,
                        "reconciliation failed"
                    );
                }
                Err(err)
            }
        }
    }

    /// Reconciles each date of an inclusive range in order. Stops at the
    /// first failure; earlier dates stay reconciled.
    pub async fn verify_range(
        &self,
        city_code: &str,
        start: Date,
        end: Date,
        audit_type: AuditType,
        executed_by: &str,
    ) -> DomainResult<Vec<ReconciliationReport>> {
        let range = DateRange::new(start, end)?;
        let mut reports = Vec::with_capacity(range.days() as usize);
        for date in range.dates() {
            reports.push(
                self.verify_and_reconcile(city_code, date, audit_type, executed_by)
                    .await?,
            );
        }
        Ok(reports)
    }

    pub async fn list_records(
        &self,
        query: &ReconciliationQuery,
    ) -> DomainResult<Vec<ReconciliationRecord>> {
        let mut query = query.clone();
        query.limit = match query.limit {
            0 => DEFAULT_LIST_LIMIT,
            limit => limit.min(MAX_LIST_LIMIT),
        };
        self.audit.list(&query).await
    }

    pub async fn get_record(&self, audit_id: &str) -> DomainResult<ReconciliationRecord> {
        self.audit.get(audit_id).await?.ok_or(DomainError::NotFound)
    }

    async fn reconcile(&self, record: &mut ReconciliationRecord) -> DomainResult<()> {
        let truth = self.compute_truth(&record.city_code, record.date).await?;
        let stored = self.store.get_daily(&record.city_code, record.date).await?;
        record.documents_scanned = truth.documents_scanned;

        let now = OffsetDateTime::now_utc();
        let baseline = stored
            .clone()
            .unwrap_or_else(|| DailyCounter::empty(record.city_code.as_str(), record.date, now));
        record.discrepancies = diff(&truth, &baseline);
        record.verified = record.discrepancies.is_empty();

        if !record.verified || stored.is_none() {
            let replacement = truth.as_counter(&record.city_code, record.date, now);
            let written = self.store.replace_daily(&replacement).await?;
            record.corrections = Some(written);
            record.corrected = true;
        }
        Ok(())
    }
}

fn diff(truth: &Truth, stored: &DailyCounter) -> Vec<Discrepancy> {
    let expected = &truth.totals;
    let actual = &stored.totals;
    let mut discrepancies = Vec::new();

    let counts = [
        ("total_processed", expected.total_processed, actual.total_processed),
        ("auto_approved", expected.auto_approved, actual.auto_approved),
        ("manual_reviewed", expected.manual_reviewed, actual.manual_reviewed),
        ("escalated", expected.escalated, actual.escalated),
        ("failed", expected.failed, actual.failed),
        ("success_count", expected.success_count, actual.success_count),
    ];
    for (field, expected, actual) in counts {
        if expected != actual {
            discrepancies.push(Discrepancy::new(
                field,
                Some(expected as f64),
                Some(actual as f64),
            ));
        }
    }

    if !approx_eq(
        expected.total_processing_time_seconds,
        actual.total_processing_time_seconds,
    ) {
        discrepancies.push(Discrepancy::new(
            "total_processing_time_seconds",
            Some(expected.total_processing_time_seconds),
            Some(actual.total_processing_time_seconds),
        ));
    }

    let extremes = [
        (
            "min_processing_time_seconds",
            truth.min_processing_time_seconds,
            stored.min_processing_time_seconds,
        ),
        (
            "max_processing_time_seconds",
            truth.max_processing_time_seconds,
            stored.max_processing_time_seconds,
        ),
    ];
    for (field, expected, actual) in extremes {
        let matches = match (expected, actual) {
            (Some(expected), Some(actual)) => approx_eq(expected, actual),
            (None, None) => true,
            _ => false,
        };
        if !matches {
            discrepancies.push(Discrepancy::new(field, expected, actual));
        }
    }

    for (field, expected, actual) in stored.integrity_violations() {
        discrepancies.push(Discrepancy::new(
            field,
            Some(expected as f64),
            Some(actual as f64),
        ));
    }
    discrepancies
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{InMemoryCounterStore, InMemoryDocumentSource, InMemoryReconciliationLog};
    use crate::ports::documents::{DocumentRecord, DocumentStatus};
    use time::macros::{date, datetime};

    fn doc(id: &str, status: DocumentStatus, auto: bool, seconds: Option<f64>) -> DocumentRecord {
        DocumentRecord {
            document_id: id.to_string(),
            city_code: "TPE".to_string(),
            status,
            auto_approved: auto,
            processing_duration_seconds: seconds,
            processed_at: datetime!(2025-01-10 10:00 UTC),
        }
    }

    struct Harness {
        documents: Arc<InMemoryDocumentSource>,
        store: Arc<InMemoryCounterStore>,
        audit: Arc<InMemoryReconciliationLog>,
        service: ReconciliationService,
    }

    fn harness() -> Harness {
        let documents = Arc::new(InMemoryDocumentSource::new());
        let store = Arc::new(InMemoryCounterStore::new());
        let audit = Arc::new(InMemoryReconciliationLog::new());
        let service = ReconciliationService::new(
            documents.clone(),
            store.clone(),
            audit.clone(),
            StatsCalendar::default(),
        );
        Harness {
            documents,
            store,
            audit,
            service,
        }
    }

    #[tokio::test]
    async fn truth_classifies_documents_and_skips_in_flight() {
        let h = harness();
        h.documents
            .extend([
                doc("a", DocumentStatus::Completed, true, Some(30.0)),
                doc("b", DocumentStatus::Completed, false, Some(120.0)),
                doc("c", DocumentStatus::Escalated, false, None),
                doc("d", DocumentStatus::Failed, false, Some(10.0)),
                doc("e", DocumentStatus::Processing, false, Some(99.0)),
            ])
            .await;

        let truth = h
            .service
            .compute_truth("TPE", date!(2025 - 01 - 10))
            .await
            .unwrap();
        assert_eq!(truth.documents_scanned, 4);
        assert_eq!(truth.totals.auto_approved, 1);
        assert_eq!(truth.totals.manual_reviewed, 1);
        assert_eq!(truth.totals.escalated, 1);
        assert_eq!(truth.totals.failed, 1);
        assert_eq!(truth.totals.success_count, 3);
        assert_eq!(truth.totals.total_processing_time_seconds, 160.0);
        assert_eq!(truth.min_processing_time_seconds, Some(10.0));
        assert_eq!(truth.max_processing_time_seconds, Some(120.0));
    }

    #[tokio::test]
    async fn zero_state_creates_an_empty_row_once() {
        let h = harness();
        let day = date!(2025 - 01 - 10);

        let first = h
            .service
            .verify_and_reconcile("TPE", day, AuditType::Manual, "alice")
            .await
            .unwrap();
        assert!(first.verified);
        assert!(first.corrected);

        let second = h
            .service
            .verify_and_reconcile("TPE", day, AuditType::Manual, "alice")
            .await
            .unwrap();
        assert!(second.verified);
        assert!(!second.corrected);

        let stored = h.store.get_daily("TPE", day).await.unwrap().unwrap();
        assert_eq!(stored.totals, StatsTotals::default());
        assert_eq!(stored.version, 1);
    }

    #[tokio::test]
    async fn integrity_violation_is_reported_as_discrepancy() {
        let h = harness();
        let day = date!(2025 - 01 - 10);
        h.documents
            .insert(doc("a", DocumentStatus::Completed, true, None))
            .await;
        let mut broken = DailyCounter::empty("TPE", day, OffsetDateTime::UNIX_EPOCH);
        broken.totals.total_processed = 1;
        broken.totals.success_count = 1;
        broken.version = 4;
        h.store.put_daily_raw(broken).await;

        let report = h
            .service
            .verify_and_reconcile("TPE", day, AuditType::Scheduled, "scheduler")
            .await
            .unwrap();

        let fields: Vec<_> = report.discrepancies.iter().map(|d| d.field.as_str()).collect();
        assert_eq!(fields, vec!["auto_approved", "integrity.breakdown_sum"]);
        assert!(report.corrected);
        let stored = h.store.get_daily("TPE", day).await.unwrap().unwrap();
        assert_eq!(stored.totals.auto_approved, 1);
        assert_eq!(stored.version, 5);
        assert!(stored.integrity_violations().is_empty());
    }

    #[tokio::test]
    async fn audit_records_are_sealed_and_listed_newest_first() {
        let h = harness();
        for date in [date!(2025 - 01 - 09), date!(2025 - 01 - 10)] {
            h.service
                .verify_and_reconcile("TPE", date, AuditType::Manual, "")
                .await
                .unwrap();
        }

        let records = h
            .service
            .list_records(&ReconciliationQuery {
                city_code: Some("TPE".into()),
                ..ReconciliationQuery::default()
            })
            .await
            .unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].date, date!(2025 - 01 - 10));
        assert_eq!(records[0].executed_by, "manual");
        assert!(records.iter().all(ReconciliationRecord::hash_matches));

        let mut tampered = records[0].clone();
        tampered.verified = !tampered.verified;
        assert!(!tampered.hash_matches());
    }

    #[tokio::test]
    async fn failed_run_is_audited_before_error_returns() {
        let h = harness();
        h.store.set_unavailable(true);

        let err = h
            .service
            .verify_and_reconcile("TPE", date!(2025 - 01 - 10), AuditType::Manual, "bob")
            .await
            .unwrap_err();
        assert!(err.is_retryable());

        let records = h.audit.list(&ReconciliationQuery::default()).await.unwrap();
        assert_eq!(records.len(), 1);
        assert!(!records[0].verified);
        assert!(records[0].error.is_some());
    }

    #[tokio::test]
    async fn future_dates_are_rejected() {
        let h = harness();
        let tomorrow = StatsCalendar::default().today().next_day().unwrap();
        let err = h
            .service
            .verify_and_reconcile("TPE", tomorrow, AuditType::Manual, "bob")
            .await
            .unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[tokio::test]
    async fn range_reconciles_every_day() {
        let h = harness();
        let reports = h
            .service
            .verify_range(
                "TPE",
                date!(2025 - 01 - 01),
                date!(2025 - 01 - 03),
                AuditType::Manual,
                "ops",
            )
            .await
            .unwrap();
        assert_eq!(reports.len(), 3);
        assert!(h.store.get_daily("TPE", date!(2025 - 01 - 02)).await.unwrap().is_some());
    }
}
