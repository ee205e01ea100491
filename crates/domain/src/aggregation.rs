use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::{Date, OffsetDateTime};

use crate::DomainResult;
use crate::calendar::StatsCalendar;
use crate::ports::counters::CounterStore;
use crate::stats::{CityFilter, DailyCounter, DateRange, DerivedMetrics, Granularity, StatsTotals};

/// One output bucket. Rates are recomputed from the summed totals.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct PeriodStats {
    pub period: String,
    #[serde(flatten)]
    pub totals: StatsTotals,
    pub min_processing_time_seconds: Option<f64>,
    pub max_processing_time_seconds: Option<f64>,
    #[serde(flatten)]
    pub metrics: DerivedMetrics,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct AggregatedStats {
    pub granularity: Granularity,
    pub range: DateRange,
    pub periods: Vec<PeriodStats>,
    pub totals: StatsTotals,
    pub metrics: DerivedMetrics,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct PeriodTotals {
    #[serde(flatten)]
    pub totals: StatsTotals,
    #[serde(flatten)]
    pub metrics: DerivedMetrics,
}

impl PeriodTotals {
    fn from_totals(totals: StatsTotals) -> Self {
        let metrics = totals.metrics();
        Self { totals, metrics }
    }
}

/// Percentage changes from the previous period to the current one.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct SummaryChanges {
    pub total_processed: f64,
    pub success_rate: f64,
    pub automation_rate: f64,
    pub avg_processing_time_seconds: f64,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct SummaryEntry {
    pub current: PeriodTotals,
    pub previous: PeriodTotals,
    pub change: SummaryChanges,
}

impl SummaryEntry {
    fn compare(current: StatsTotals, previous: StatsTotals) -> Self {
        let current = PeriodTotals::from_totals(current);
        let previous = PeriodTotals::from_totals(previous);
        let change = SummaryChanges {
            total_processed: percentage_change(
                current.totals.total_processed as f64,
                previous.totals.total_processed as f64,
            ),
            success_rate: percentage_change(
                current.metrics.success_rate,
                previous.metrics.success_rate,
            ),
            automation_rate: percentage_change(
                current.metrics.automation_rate,
                previous.metrics.automation_rate,
            ),
            avg_processing_time_seconds: percentage_change(
                current.metrics.avg_processing_time_seconds,
                previous.metrics.avg_processing_time_seconds,
            ),
        };
        Self {
            current,
            previous,
            change,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct CitySummaryRow {
    pub city_code: String,
    #[serde(flatten)]
    pub entry: SummaryEntry,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct CitySummary {
    pub range: DateRange,
    pub previous_range: DateRange,
    pub overall: SummaryEntry,
    pub cities: Vec<CitySummaryRow>,
}

/// Relative change in percent. A zero baseline maps to 0 or ±100.
pub fn percentage_change(current: f64, previous: f64) -> f64 {
    if previous == 0.0 {
        if current > 0.0 {
            100.0
        } else if current < 0.0 {
            -100.0
        } else {
            0.0
        }
    } else {
        (current - previous) / previous * 100.0
    }
}

/// Fixed-width label for the bucket containing `date`; lexical order is
/// chronological order.
pub fn period_label(date: Date, granularity: Granularity) -> String {
    match granularity {
        Granularity::Hour | Granularity::Day => {
            format!("{:04}-{:02}-{:02}", date.year(), u8::from(date.month()), date.day())
        }
        Granularity::Week => {
            let (year, week, _) = date.to_iso_week_date();
            format!("{year:04}-W{week:02}")
        }
        Granularity::Month => format!("{:04}-{:02}", date.year(), u8::from(date.month())),
        Granularity::Year => format!("{:04}", date.year()),
    }
}

fn hour_label(local: OffsetDateTime) -> String {
    format!(
        "{:04}-{:02}-{:02}T{:02}:00",
        local.year(),
        u8::from(local.month()),
        local.day(),
        local.hour()
    )
}

#[derive(Default)]
struct Bucket {
    totals: StatsTotals,
    min: Option<f64>,
    max: Option<f64>,
}

impl Bucket {
    fn add_daily(&mut self, row: &DailyCounter) {
        self.totals.merge(&row.totals);
        if let Some(min) = row.min_processing_time_seconds {
            self.min = Some(self.min.map_or(min, |current| current.min(min)));
        }
        if let Some(max) = row.max_processing_time_seconds {
            self.max = Some(self.max.map_or(max, |current| current.max(max)));
        }
    }

    fn into_period(self, period: String) -> PeriodStats {
        PeriodStats {
            period,
            metrics: self.totals.metrics(),
            totals: self.totals,
            min_processing_time_seconds: self.min,
            max_processing_time_seconds: self.max,
        }
    }
}

/// Read side over the counter store. Week, month and year are always derived
/// from daily rows at query time.
#[derive(Clone)]
pub struct AggregationService {
    store: Arc<dyn CounterStore>,
    calendar: StatsCalendar,
}

impl AggregationService {
    pub fn new(store: Arc<dyn CounterStore>, calendar: StatsCalendar) -> Self {
        Self { store, calendar }
    }

    pub async fn get_aggregated_stats(
        &self,
        filter: &CityFilter,
        range: &DateRange,
        granularity: Granularity,
    ) -> DomainResult<AggregatedStats> {
        let mut buckets: BTreeMap<String, Bucket> = BTreeMap::new();

        match granularity {
            Granularity::Hour => {
                let (start, _) = self.calendar.day_window(range.start);
                let (_, end) = self.calendar.day_window(range.end);
                let rows = self.store.list_hourly(filter, start, end).await?;
                for row in rows {
                    let label = hour_label(row.hour.to_offset(self.calendar.offset()));
                    buckets.entry(label).or_default().totals.merge(&row.totals);
                }
            }
            Granularity::Day | Granularity::Week | Granularity::Month | Granularity::Year => {
                let rows = self.store.list_daily(filter, range.start, range.end).await?;
                for row in rows.iter().filter(|row| filter.allows(&row.city_code)) {
                    buckets
                        .entry(period_label(row.date, granularity))
                        .or_default()
                        .add_daily(row);
                }
            }
        }

        let mut totals = StatsTotals::default();
        let periods: Vec<PeriodStats> = buckets
            .into_iter()
            .map(|(label, bucket)| {
                totals.merge(&bucket.totals);
                bucket.into_period(label)
            })
            .collect();

        Ok(AggregatedStats {
            granularity,
            range: *range,
            periods,
            metrics: totals.metrics(),
            totals,
        })
    }

    pub async fn get_city_summary(
        &self,
        filter: &CityFilter,
        range: &DateRange,
    ) -> DomainResult<CitySummary> {
        let previous_range = range.previous()?;
        let current_rows = self.store.list_daily(filter, range.start, range.end).await?;
        let previous_rows = self
            .store
            .list_daily(filter, previous_range.start, previous_range.end)
            .await?;

        let current = totals_by_city(filter, &current_rows);
        let previous = totals_by_city(filter, &previous_rows);

        let mut cities: BTreeSet<String> = current.keys().chain(previous.keys()).cloned().collect();
        if let Some(requested) = filter.city_codes() {
            cities.extend(requested);
        }

        let mut overall_current = StatsTotals::default();
        let mut overall_previous = StatsTotals::default();
        let rows = cities
            .into_iter()
            .map(|city_code| {
                let now = current.get(&city_code).cloned().unwrap_or_default();
                let before = previous.get(&city_code).cloned().unwrap_or_default();
                overall_current.merge(&now);
                overall_previous.merge(&before);
                CitySummaryRow {
                    city_code,
                    entry: SummaryEntry::compare(now, before),
                }
            })
            .collect();

        Ok(CitySummary {
            range: *range,
            previous_range,
            overall: SummaryEntry::compare(overall_current, overall_previous),
            cities: rows,
        })
    }
}

fn totals_by_city(filter: &CityFilter, rows: &[DailyCounter]) -> BTreeMap<String, StatsTotals> {
    let mut by_city: BTreeMap<String, StatsTotals> = BTreeMap::new();
    for row in rows.iter().filter(|row| filter.allows(&row.city_code)) {
        by_city
            .entry(row.city_code.clone())
            .or_default()
            .merge(&row.totals);
    }
    by_city
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DomainError;
    use crate::memory::InMemoryCounterStore;
    use crate::stats::{CounterDelta, ResultType};
    use time::macros::{date, datetime, offset};

    #[test]
    fn percentage_change_sign_convention() {
        assert_eq!(percentage_change(0.0, 0.0), 0.0);
        assert_eq!(percentage_change(50.0, 0.0), 100.0);
        assert_eq!(percentage_change(80.0, 100.0), -20.0);
        assert_eq!(percentage_change(150.0, 100.0), 50.0);
    }

    #[test]
    fn labels_are_fixed_width() {
        let day = date!(2025 - 01 - 05);
        assert_eq!(period_label(day, Granularity::Day), "2025-01-05");
        assert_eq!(period_label(day, Granularity::Month), "2025-01");
        assert_eq!(period_label(day, Granularity::Year), "2025");
        assert_eq!(period_label(day, Granularity::Week), "2025-W01");
        assert_eq!(period_label(date!(2024 - 12 - 30), Granularity::Week), "2025-W01");
        assert_eq!(period_label(date!(2025 - 03 - 03), Granularity::Week), "2025-W10");
    }

    async fn seed(store: &InMemoryCounterStore, city: &str, date: Date, results: &[(ResultType, f64)]) {
        let at = datetime!(2025-01-01 00:00 UTC);
        for (result_type, seconds) in results {
            store
                .upsert_daily_delta(city, date, &CounterDelta::for_result(*result_type, Some(*seconds)), at)
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn daily_rows_group_across_cities() {
        let store = Arc::new(InMemoryCounterStore::new());
        seed(&store, "TPE", date!(2025 - 01 - 10), &[(ResultType::AutoApproved, 10.0)]).await;
        seed(&store, "KHH", date!(2025 - 01 - 10), &[(ResultType::Failed, 30.0)]).await;
        seed(&store, "KHH", date!(2025 - 01 - 11), &[(ResultType::Escalated, 5.0)]).await;
        let service = AggregationService::new(store, StatsCalendar::default());

        let range = DateRange::new(date!(2025 - 01 - 10), date!(2025 - 01 - 11)).unwrap();
        let stats = service
            .get_aggregated_stats(&CityFilter::All, &range, Granularity::Day)
            .await
            .unwrap();

        let labels: Vec<_> = stats.periods.iter().map(|p| p.period.as_str()).collect();
        assert_eq!(labels, vec!["2025-01-10", "2025-01-11"]);
        assert_eq!(stats.periods[0].totals.total_processed, 2);
        assert_eq!(stats.periods[0].metrics.success_rate, 50.0);
        assert_eq!(stats.periods[0].min_processing_time_seconds, Some(10.0));
        assert_eq!(stats.periods[0].max_processing_time_seconds, Some(30.0));
        assert_eq!(stats.totals.total_processed, 3);

        let only_tpe = service
            .get_aggregated_stats(&CityFilter::only(["TPE"]), &range, Granularity::Day)
            .await
            .unwrap();
        assert_eq!(only_tpe.totals.total_processed, 1);
    }

    #[tokio::test]
    async fn hourly_labels_follow_calendar_offset() {
        let store = Arc::new(InMemoryCounterStore::new());
        let calendar = StatsCalendar::new(offset!(+8));
        let at = datetime!(2025-01-10 00:00 UTC);
        store
            .bump_hourly(
                "TPE",
                datetime!(2025-01-10 01:00 UTC),
                &CounterDelta::for_result(ResultType::AutoApproved, Some(2.0)),
                at,
            )
            .await
            .unwrap();
        store
            .bump_hourly(
                "TPE",
                datetime!(2025-01-10 20:00 UTC),
                &CounterDelta::for_result(ResultType::AutoApproved, Some(2.0)),
                at,
            )
            .await
            .unwrap();
        let service = AggregationService::new(store, calendar);

        let stats = service
            .get_aggregated_stats(
                &CityFilter::All,
                &DateRange::single(date!(2025 - 01 - 10)),
                Granularity::Hour,
            )
            .await
            .unwrap();
        assert_eq!(stats.periods.len(), 1);
        assert_eq!(stats.periods[0].period, "2025-01-10T09:00");
        assert_eq!(stats.periods[0].min_processing_time_seconds, None);
    }

    #[tokio::test]
    async fn summary_compares_with_previous_period() {
        let store = Arc::new(InMemoryCounterStore::new());
        seed(
            &store,
            "TPE",
            date!(2025 - 01 - 09),
            &[(ResultType::AutoApproved, 10.0), (ResultType::Failed, 10.0)],
        )
        .await;
        seed(
            &store,
            "TPE",
            date!(2025 - 01 - 10),
            &[
                (ResultType::AutoApproved, 10.0),
                (ResultType::AutoApproved, 10.0),
                (ResultType::ManualReviewed, 10.0),
            ],
        )
        .await;
        seed(&store, "KHH", date!(2025 - 01 - 10), &[(ResultType::Escalated, 4.0)]).await;
        let service = AggregationService::new(store, StatsCalendar::default());

        let summary = service
            .get_city_summary(
                &CityFilter::only(["TPE", "TXG"]),
                &DateRange::single(date!(2025 - 01 - 10)),
            )
            .await
            .unwrap();

        assert_eq!(summary.previous_range, DateRange::single(date!(2025 - 01 - 09)));
        let cities: Vec<_> = summary.cities.iter().map(|row| row.city_code.as_str()).collect();
        assert_eq!(cities, vec!["TPE", "TXG"]);

        let tpe = &summary.cities[0].entry;
        assert_eq!(tpe.current.totals.total_processed, 3);
        assert_eq!(tpe.previous.totals.total_processed, 2);
        assert_eq!(tpe.change.total_processed, 50.0);
        assert_eq!(tpe.change.success_rate, 100.0);
        assert_eq!(summary.cities[1].entry, SummaryEntry::default());
        assert_eq!(summary.overall.current.totals.total_processed, 3);
    }

    #[tokio::test]
    async fn summary_without_a_comparison_period_is_a_validation_error() {
        let service =
            AggregationService::new(Arc::new(InMemoryCounterStore::new()), StatsCalendar::default());
        let err = service
            .get_city_summary(&CityFilter::All, &DateRange::single(Date::MIN))
            .await
            .unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }
}
