use std::sync::Arc;

use procstats_domain::aggregation::AggregationService;
use procstats_domain::calendar::StatsCalendar;
use procstats_domain::memory::InMemoryCounterStore;
use procstats_domain::ports::counters::CounterStore;
use procstats_domain::stats::{CityFilter, CounterDelta, DateRange, Granularity, ResultType, StatsTotals};
use time::macros::{date, datetime};

#[tokio::test]
async fn month_totals_equal_sum_of_daily_rows() {
    let store = Arc::new(InMemoryCounterStore::new());
    let at = datetime!(2025-02-01 00:00 UTC);
    let range = DateRange::new(date!(2025 - 01 - 01), date!(2025 - 01 - 31)).unwrap();

    let mut expected = StatsTotals::default();
    for (offset, date) in range.dates().enumerate() {
        // Skewed days so averaging daily percentages would give a different answer.
        let results: Vec<ResultType> = if offset % 2 == 0 {
            vec![ResultType::AutoApproved]
        } else {
            vec![
                ResultType::Failed,
                ResultType::Failed,
                ResultType::ManualReviewed,
                ResultType::Escalated,
            ]
        };
        for result_type in results {
            let delta = CounterDelta::for_result(result_type, Some(offset as f64));
            expected.apply(&delta);
            store.upsert_daily_delta("TPE", date, &delta, at).await.unwrap();
        }
    }
    store
        .upsert_daily_delta(
            "TPE",
            date!(2025 - 02 - 01),
            &CounterDelta::for_result(ResultType::Failed, None),
            at,
        )
        .await
        .unwrap();

    let service = AggregationService::new(store, StatsCalendar::default());
    let stats = service
        .get_aggregated_stats(&CityFilter::All, &range, Granularity::Month)
        .await
        .unwrap();

    assert_eq!(stats.periods.len(), 1);
    let month = &stats.periods[0];
    assert_eq!(month.period, "2025-01");
    assert_eq!(month.totals, expected);
    assert_eq!(month.metrics, expected.metrics());
    // 16 single-approval days, 15 days with 4 documents and 2 failures.
    assert_eq!(expected.total_processed, 76);
    assert_eq!(month.metrics.automation_rate, 16.0 / 76.0 * 100.0);
    assert_eq!(month.metrics.success_rate, 46.0 / 76.0 * 100.0);
    assert_eq!(month.min_processing_time_seconds, Some(0.0));
    assert_eq!(month.max_processing_time_seconds, Some(30.0));
}

#[tokio::test]
async fn week_and_year_labels_sort_chronologically() {
    let store = Arc::new(InMemoryCounterStore::new());
    let at = datetime!(2025-02-01 00:00 UTC);
    for date in [date!(2024 - 12 - 23), date!(2024 - 12 - 31), date!(2025 - 01 - 08)] {
        store
            .upsert_daily_delta(
                "KHH",
                date,
                &CounterDelta::for_result(ResultType::AutoApproved, None),
                at,
            )
            .await
            .unwrap();
    }
    let service = AggregationService::new(store, StatsCalendar::default());
    let range = DateRange::new(date!(2024 - 12 - 01), date!(2025 - 01 - 31)).unwrap();

    let weeks = service
        .get_aggregated_stats(&CityFilter::All, &range, Granularity::Week)
        .await
        .unwrap();
    let labels: Vec<_> = weeks.periods.iter().map(|p| p.period.as_str()).collect();
    assert_eq!(labels, vec!["2024-W52", "2025-W01", "2025-W02"]);

    let years = service
        .get_aggregated_stats(&CityFilter::All, &range, Granularity::Year)
        .await
        .unwrap();
    let labels: Vec<_> = years.periods.iter().map(|p| p.period.as_str()).collect();
    assert_eq!(labels, vec!["2024", "2025"]);
    assert_eq!(years.periods[0].totals.total_processed, 2);
}
