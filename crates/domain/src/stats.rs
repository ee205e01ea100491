use std::collections::BTreeSet;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::{Date, Duration, OffsetDateTime};

use crate::DomainResult;
use crate::error::DomainError;

const MAX_RANGE_DAYS: i64 = 3_660;

/// Terminal outcome of one processed document.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResultType {
    AutoApproved,
    ManualReviewed,
    Escalated,
    Failed,
}

impl ResultType {
    pub const ALL: [ResultType; 4] = [
        Self::AutoApproved,
        Self::ManualReviewed,
        Self::Escalated,
        Self::Failed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::AutoApproved => "AUTO_APPROVED",
            Self::ManualReviewed => "MANUAL_REVIEWED",
            Self::Escalated => "ESCALATED",
            Self::Failed => "FAILED",
        }
    }

    pub fn is_success(self) -> bool {
        !matches!(self, Self::Failed)
    }
}

impl FromStr for ResultType {
    type Err = DomainError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "AUTO_APPROVED" => Ok(Self::AutoApproved),
            "MANUAL_REVIEWED" => Ok(Self::ManualReviewed),
            "ESCALATED" => Ok(Self::Escalated),
            "FAILED" => Ok(Self::Failed),
            other => Err(DomainError::Validation(format!(
                "invalid result type '{other}'"
            ))),
        }
    }
}

/// Emitted by the processing pipeline once per finished document.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ProcessingResultEvent {
    pub document_id: String,
    pub city_code: String,
    pub result_type: ResultType,
    pub processing_duration_seconds: Option<f64>,
    #[serde(with = "time::serde::rfc3339")]
    pub processed_at: OffsetDateTime,
}

impl ProcessingResultEvent {
    pub fn delta(&self) -> CounterDelta {
        CounterDelta::for_result(self.result_type, self.processing_duration_seconds)
    }
}

/// Drops durations that cannot be summed into a counter.
pub fn sanitize_duration(value: Option<f64>) -> Option<f64> {
    value.filter(|seconds| seconds.is_finite() && *seconds >= 0.0)
}

/// Numeric increment implied by a single terminal event.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CounterDelta {
    pub total_processed: u64,
    pub auto_approved: u64,
    pub manual_reviewed: u64,
    pub escalated: u64,
    pub failed: u64,
    pub success_count: u64,
    pub duration_seconds: Option<f64>,
}

impl CounterDelta {
    pub fn for_result(result_type: ResultType, duration_seconds: Option<f64>) -> Self {
        let mut delta = Self {
            total_processed: 1,
            success_count: u64::from(result_type.is_success()),
            duration_seconds: sanitize_duration(duration_seconds),
            ..Self::default()
        };
        match result_type {
            ResultType::AutoApproved => delta.auto_approved = 1,
            ResultType::ManualReviewed => delta.manual_reviewed = 1,
            ResultType::Escalated => delta.escalated = 1,
            ResultType::Failed => delta.failed = 1,
        }
        delta
    }
}

/// Summable counts shared by every bucket grain.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StatsTotals {
    pub total_processed: u64,
    pub auto_approved: u64,
    pub manual_reviewed: u64,
    pub escalated: u64,
    pub failed: u64,
    pub success_count: u64,
    pub total_processing_time_seconds: f64,
}

impl StatsTotals {
    pub fn apply(&mut self, delta: &CounterDelta) {
        self.total_processed += delta.total_processed;
        self.auto_approved += delta.auto_approved;
        self.manual_reviewed += delta.manual_reviewed;
        self.escalated += delta.escalated;
        self.failed += delta.failed;
        self.success_count += delta.success_count;
        if let Some(seconds) = delta.duration_seconds {
            self.total_processing_time_seconds += seconds;
        }
    }

    pub fn merge(&mut self, other: &StatsTotals) {
        self.total_processed += other.total_processed;
        self.auto_approved += other.auto_approved;
        self.manual_reviewed += other.manual_reviewed;
        self.escalated += other.escalated;
        self.failed += other.failed;
        self.success_count += other.success_count;
        self.total_processing_time_seconds += other.total_processing_time_seconds;
    }

    pub fn breakdown_sum(&self) -> u64 {
        self.auto_approved + self.manual_reviewed + self.escalated + self.failed
    }

    pub fn metrics(&self) -> DerivedMetrics {
        DerivedMetrics::from_totals(self)
    }
}

/// Rates derived from totals. Always recomputed, never summed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DerivedMetrics {
    pub avg_processing_time_seconds: f64,
    pub success_rate: f64,
    pub automation_rate: f64,
}

impl DerivedMetrics {
    pub fn from_totals(totals: &StatsTotals) -> Self {
        if totals.total_processed == 0 {
            return Self::default();
        }
        let total = totals.total_processed as f64;
        Self {
            avg_processing_time_seconds: totals.total_processing_time_seconds / total,
            success_rate: totals.success_count as f64 / total * 100.0,
            automation_rate: totals.auto_approved as f64 / total * 100.0,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DailyCounter {
    pub city_code: String,
    pub date: Date,
    #[serde(flatten)]
    pub totals: StatsTotals,
    pub min_processing_time_seconds: Option<f64>,
    pub max_processing_time_seconds: Option<f64>,
    #[serde(flatten)]
    pub derived: DerivedMetrics,
    pub version: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub last_updated_at: OffsetDateTime,
}

impl DailyCounter {
    /// A row that does not exist yet: all zeros, version 0.
    pub fn empty(city_code: impl Into<String>, date: Date, at: OffsetDateTime) -> Self {
        Self {
            city_code: city_code.into(),
            date,
            totals: StatsTotals::default(),
            min_processing_time_seconds: None,
            max_processing_time_seconds: None,
            derived: DerivedMetrics::default(),
            version: 0,
            last_updated_at: at,
        }
    }

    pub fn from_delta(
        city_code: impl Into<String>,
        date: Date,
        delta: &CounterDelta,
        at: OffsetDateTime,
    ) -> Self {
        Self::empty(city_code, date, at).with_delta(delta, at)
    }

    /// Next state after `delta`, one version ahead.
    pub fn with_delta(&self, delta: &CounterDelta, at: OffsetDateTime) -> Self {
        let mut next = self.clone();
        next.totals.apply(delta);
        if let Some(seconds) = delta.duration_seconds {
            next.min_processing_time_seconds = Some(
                next.min_processing_time_seconds
                    .map_or(seconds, |current| current.min(seconds)),
            );
            next.max_processing_time_seconds = Some(
                next.max_processing_time_seconds
                    .map_or(seconds, |current| current.max(seconds)),
            );
        }
        next.refresh_derived();
        next.version = self.version + 1;
        next.last_updated_at = at;
        next
    }

    pub fn refresh_derived(&mut self) {
        self.derived = self.totals.metrics();
    }

    /// Broken row-level invariants as `(name, expected, actual)`.
    pub fn integrity_violations(&self) -> Vec<(&'static str, u64, u64)> {
        let mut violations = Vec::new();
        let breakdown = self.totals.breakdown_sum();
        if breakdown != self.totals.total_processed {
            violations.push((
                "integrity.breakdown_sum",
                breakdown,
                self.totals.total_processed,
            ));
        }
        let expected_success = self
            .totals
            .total_processed
            .saturating_sub(self.totals.failed);
        if expected_success != self.totals.success_count {
            violations.push((
                "integrity.success_count",
                expected_success,
                self.totals.success_count,
            ));
        }
        violations
    }
}

/// Advisory hourly trend bucket. `hour` is stored truncated and in UTC.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HourlyCounter {
    pub city_code: String,
    #[serde(with = "time::serde::rfc3339")]
    pub hour: OffsetDateTime,
    #[serde(flatten)]
    pub totals: StatsTotals,
    #[serde(with = "time::serde::rfc3339")]
    pub last_updated_at: OffsetDateTime,
}

/// Caller-supplied city capability. Trusted as-is.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CityFilter {
    All,
    Only(BTreeSet<String>),
}

impl CityFilter {
    pub fn only<I, S>(cities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Only(cities.into_iter().map(Into::into).collect())
    }

    pub fn allows(&self, city_code: &str) -> bool {
        match self {
            Self::All => true,
            Self::Only(cities) => cities.contains(city_code),
        }
    }

    pub fn city_codes(&self) -> Option<Vec<String>> {
        match self {
            Self::All => None,
            Self::Only(cities) => Some(cities.iter().cloned().collect()),
        }
    }
}

/// Inclusive calendar-date range.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: Date,
    pub end: Date,
}

impl DateRange {
    pub fn new(start: Date, end: Date) -> DomainResult<Self> {
        if start > end {
            return Err(DomainError::Validation(format!(
                "range start {start} is after end {end}"
            )));
        }
        let range = Self { start, end };
        if range.days() > MAX_RANGE_DAYS {
            return Err(DomainError::Validation(format!(
                "range exceeds {MAX_RANGE_DAYS} days"
            )));
        }
        Ok(range)
    }

    pub fn single(date: Date) -> Self {
        Self {
            start: date,
            end: date,
        }
    }

    pub fn days(&self) -> i64 {
        (self.end - self.start).whole_days() + 1
    }

    /// The range of equal length ending the day before `start`. Fails when
    /// that range would start before the earliest representable date.
    pub fn previous(&self) -> DomainResult<Self> {
        let start = self
            .start
            .checked_sub(Duration::days(self.days()))
            .ok_or_else(|| {
                DomainError::Validation(format!(
                    "no comparison period before {}",
                    self.start
                ))
            })?;
        let end = self.start.previous_day().ok_or_else(|| {
            DomainError::Validation(format!("no comparison period before {}", self.start))
        })?;
        Ok(Self { start, end })
    }

    pub fn contains(&self, date: Date) -> bool {
        date >= self.start && date <= self.end
    }

    pub fn dates(&self) -> impl Iterator<Item = Date> + '_ {
        std::iter::successors(Some(self.start), |date| date.next_day())
            .take_while(|date| *date <= self.end)
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
    Hour,
    Day,
    Week,
    Month,
    Year,
}

impl Granularity {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hour => "hour",
            Self::Day => "day",
            Self::Week => "week",
            Self::Month => "month",
            Self::Year => "year",
        }
    }
}

impl FromStr for Granularity {
    type Err = DomainError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "hour" => Ok(Self::Hour),
            "day" => Ok(Self::Day),
            "week" => Ok(Self::Week),
            "month" => Ok(Self::Month),
            "year" => Ok(Self::Year),
            other => Err(DomainError::Validation(format!(
                "invalid granularity '{other}'"
            ))),
        }
    }
}
