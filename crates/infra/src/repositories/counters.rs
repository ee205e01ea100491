use std::sync::Arc;

use metrics::counter;
use procstats_domain::DomainResult;
use procstats_domain::error::DomainError;
use procstats_domain::ports::BoxFuture;
use procstats_domain::ports::counters::CounterStore;
use procstats_domain::stats::{CityFilter, CounterDelta, DailyCounter, HourlyCounter};
use serde::Deserialize;
use serde_json::{Value, to_value};
use surrealdb::{Surreal, engine::remote::ws::Client};
use time::{Date, OffsetDateTime};

use super::{decode_many, decode_one, map_surreal_error, query_result_error, to_rfc3339};

const DAILY_VERSION_CONFLICTS_TOTAL: &str = "procstats_daily_version_conflicts_total";

/// Derived fields recomputed from the totals assigned earlier in the same `SET`.
const DERIVED_ASSIGNMENTS: &str = "\
    avg_processing_time_seconds = IF total_processed > 0 \
        THEN <float> total_processing_time_seconds / total_processed ELSE 0.0 END, \
    success_rate = IF total_processed > 0 \
        THEN <float> success_count / total_processed * 100.0 ELSE 0.0 END, \
    automation_rate = IF total_processed > 0 \
        THEN <float> auto_approved / total_processed * 100.0 ELSE 0.0 END";

pub struct SurrealCounterStore {
    client: Arc<Surreal<Client>>,
}

impl SurrealCounterStore {
    pub fn with_client(client: Arc<Surreal<Client>>) -> Self {
        Self { client }
    }

    fn daily_key(city_code: &str, date: Date) -> String {
        format!("{city_code}_{date}")
    }

    fn hourly_key(city_code: &str, hour: OffsetDateTime) -> String {
        format!("{city_code}_{}", hour.unix_timestamp())
    }

    fn city_binds(filter: &CityFilter) -> (bool, Vec<String>) {
        match filter.city_codes() {
            None => (true, Vec::new()),
            Some(cities) => (false, cities),
        }
    }

    fn daily_payload(counter: &DailyCounter) -> DomainResult<Value> {
        to_value(counter)
            .map_err(|err| DomainError::Validation(format!("invalid daily counter payload: {err}")))
    }
}

#[derive(Deserialize)]
struct CityCodeRow {
    city_code: String,
}

impl CounterStore for SurrealCounterStore {
    fn get_daily(
        &self,
        city_code: &str,
        date: Date,
    ) -> BoxFuture<'_, DomainResult<Option<DailyCounter>>> {
        let key = Self::daily_key(city_code, date);
        Box::pin(async move {
            let mut response = self
                .client
                .query("SELECT * OMIT id FROM type::record('daily_counter', $key)")
                .bind(("key", key))
                .await
                .map_err(map_surreal_error)?;
            let rows: Vec<Value> = response.take(0).map_err(query_result_error)?;
            decode_one(rows, "daily_counter")
        })
    }

    fn upsert_daily_delta(
        &self,
        city_code: &str,
        date: Date,
        delta: &CounterDelta,
        at: OffsetDateTime,
    ) -> BoxFuture<'_, DomainResult<DailyCounter>> {
        let key = Self::daily_key(city_code, date);
        let city_code = city_code.to_string();
        let delta = delta.clone();
        Box::pin(async move {
            let at = to_rfc3339(at)?;
            let query = format!(
                "UPSERT type::record('daily_counter', $key) SET \
                    city_code = $city_code, \
                    date = $date, \
                    total_processed = (total_processed ?? 0) + $total_processed, \
                    auto_approved = (auto_approved ?? 0) + $auto_approved, \
                    manual_reviewed = (manual_reviewed ?? 0) + $manual_reviewed, \
                    escalated = (escalated ?? 0) + $escalated, \
                    failed = (failed ?? 0) + $failed, \
                    success_count = (success_count ?? 0) + $success_count, \
                    total_processing_time_seconds = \
                        (total_processing_time_seconds ?? 0.0) + $duration, \
                    min_processing_time_seconds = IF !$has_duration \
                        THEN min_processing_time_seconds \
                        ELSE IF min_processing_time_seconds = NONE \
                            OR min_processing_time_seconds = NULL \
                            OR min_processing_time_seconds > $duration \
                        THEN $duration \
                        ELSE min_processing_time_seconds END, \
                    max_processing_time_seconds = IF !$has_duration \
                        THEN max_processing_time_seconds \
                        ELSE IF max_processing_time_seconds = NONE \
                            OR max_processing_time_seconds = NULL \
                            OR max_processing_time_seconds < $duration \
                        THEN $duration \
                        ELSE max_processing_time_seconds END, \
                    {DERIVED_ASSIGNMENTS}, \
                    version = (version ?? 0) + 1, \
                    last_updated_at = $at \
                 RETURN AFTER"
            );
            let mut response = self
                .client
                .query(query)
                .bind(("key", key))
                .bind(("city_code", city_code))
                .bind(("date", date.to_string()))
                .bind(("total_processed", delta.total_processed))
                .bind(("auto_approved", delta.auto_approved))
                .bind(("manual_reviewed", delta.manual_reviewed))
                .bind(("escalated", delta.escalated))
                .bind(("failed", delta.failed))
                .bind(("success_count", delta.success_count))
                .bind(("has_duration", delta.duration_seconds.is_some()))
                .bind(("duration", delta.duration_seconds.unwrap_or(0.0)))
                .bind(("at", at))
                .await
                .map_err(map_surreal_error)?;
            let rows: Vec<Value> = response.take(0).map_err(query_result_error)?;
            decode_one(rows, "daily_counter")?.ok_or_else(|| {
                DomainError::Persistence("daily counter upsert returned no row".to_string())
            })
        })
    }

    fn create_daily(&self, counter: &DailyCounter) -> BoxFuture<'_, DomainResult<DailyCounter>> {
        let key = Self::daily_key(&counter.city_code, counter.date);
        let counter = counter.clone();
        Box::pin(async move {
            let payload = Self::daily_payload(&counter)?;
            self.client
                .query("CREATE type::record('daily_counter', $key) CONTENT $payload")
                .bind(("key", key))
                .bind(("payload", payload))
                .await
                .map_err(map_surreal_error)?
                .check()
                .map_err(map_surreal_error)?;
            Ok(counter)
        })
    }

    fn update_daily_if_version(
        &self,
        counter: &DailyCounter,
        expected_version: u64,
    ) -> BoxFuture<'_, DomainResult<Option<DailyCounter>>> {
        let key = Self::daily_key(&counter.city_code, counter.date);
        let counter = counter.clone();
        Box::pin(async move {
            let payload = Self::daily_payload(&counter)?;
            let mut response = self
                .client
                .query(
                    "UPDATE type::record('daily_counter', $key) MERGE $payload \
                     WHERE version = $expected_version RETURN AFTER",
                )
                .bind(("key", key))
                .bind(("payload", payload))
                .bind(("expected_version", expected_version))
                .await
                .map_err(map_surreal_error)?;
            let rows: Vec<Value> = response.take(0).map_err(query_result_error)?;
            if rows.is_empty() {
                counter!(DAILY_VERSION_CONFLICTS_TOTAL).increment(1);
                return Ok(None);
            }
            Ok(Some(counter))
        })
    }

    fn replace_daily(&self, counter: &DailyCounter) -> BoxFuture<'_, DomainResult<DailyCounter>> {
        let key = Self::daily_key(&counter.city_code, counter.date);
        let mut counter = counter.clone();
        counter.refresh_derived();
        Box::pin(async move {
            let at = to_rfc3339(counter.last_updated_at)?;
            let totals = &counter.totals;
            let mut response = self
                .client
                .query(format!(
                    "UPSERT type::record('daily_counter', $key) SET \
                        city_code = $city_code, \
                        date = $date, \
                        total_processed = $total_processed, \
                        auto_approved = $auto_approved, \
                        manual_reviewed = $manual_reviewed, \
                        escalated = $escalated, \
                        failed = $failed, \
                        success_count = $success_count, \
                        total_processing_time_seconds = $total_processing_time_seconds, \
                        min_processing_time_seconds = $min_processing_time_seconds, \
                        max_processing_time_seconds = $max_processing_time_seconds, \
                        {DERIVED_ASSIGNMENTS}, \
                        version = (version ?? 0) + 1, \
                        last_updated_at = $at \
                     RETURN AFTER"
                ))
                .bind(("key", key))
                .bind(("city_code", counter.city_code.clone()))
                .bind(("date", counter.date.to_string()))
                .bind(("total_processed", totals.total_processed))
                .bind(("auto_approved", totals.auto_approved))
                .bind(("manual_reviewed", totals.manual_reviewed))
                .bind(("escalated", totals.escalated))
                .bind(("failed", totals.failed))
                .bind(("success_count", totals.success_count))
                .bind((
                    "total_processing_time_seconds",
                    totals.total_processing_time_seconds,
                ))
                .bind((
                    "min_processing_time_seconds",
                    counter.min_processing_time_seconds,
                ))
                .bind((
                    "max_processing_time_seconds",
                    counter.max_processing_time_seconds,
                ))
                .bind(("at", at))
                .await
                .map_err(map_surreal_error)?;
            let rows: Vec<Value> = response.take(0).map_err(query_result_error)?;
            decode_one(rows, "daily_counter")?.ok_or_else(|| {
                DomainError::Persistence("daily counter replace returned no row".to_string())
            })
        })
    }

    fn list_daily(
        &self,
        filter: &CityFilter,
        start: Date,
        end: Date,
    ) -> BoxFuture<'_, DomainResult<Vec<DailyCounter>>> {
        let (all_cities, cities) = Self::city_binds(filter);
        Box::pin(async move {
            let mut response = self
                .client
                .query(
                    "SELECT * OMIT id FROM daily_counter \
                     WHERE date >= $start AND date <= $end \
                       AND ($all_cities OR city_code IN $cities) \
                     ORDER BY date ASC, city_code ASC",
                )
                .bind(("start", start.to_string()))
                .bind(("end", end.to_string()))
                .bind(("all_cities", all_cities))
                .bind(("cities", cities))
                .await
                .map_err(map_surreal_error)?;
            let rows: Vec<Value> = response.take(0).map_err(query_result_error)?;
            decode_many(rows, "daily_counter")
        })
    }

    fn bump_hourly(
        &self,
        city_code: &str,
        hour: OffsetDateTime,
        delta: &CounterDelta,
        at: OffsetDateTime,
    ) -> BoxFuture<'_, DomainResult<HourlyCounter>> {
        let key = Self::hourly_key(city_code, hour);
        let city_code = city_code.to_string();
        let delta = delta.clone();
        Box::pin(async move {
            let hour = to_rfc3339(hour)?;
            let at = to_rfc3339(at)?;
            let mut response = self
                .client
                .query(
                    "UPSERT type::record('hourly_counter', $key) SET \
                        city_code = $city_code, \
                        hour = $hour, \
                        total_processed = (total_processed ?? 0) + $total_processed, \
                        auto_approved = (auto_approved ?? 0) + $auto_approved, \
                        manual_reviewed = (manual_reviewed ?? 0) + $manual_reviewed, \
                        escalated = (escalated ?? 0) + $escalated, \
                        failed = (failed ?? 0) + $failed, \
                        success_count = (success_count ?? 0) + $success_count, \
                        total_processing_time_seconds = \
                            (total_processing_time_seconds ?? 0.0) + $duration, \
                        last_updated_at = $at \
                     RETURN AFTER",
                )
                .bind(("key", key))
                .bind(("city_code", city_code))
                .bind(("hour", hour))
                .bind(("total_processed", delta.total_processed))
                .bind(("auto_approved", delta.auto_approved))
                .bind(("manual_reviewed", delta.manual_reviewed))
                .bind(("escalated", delta.escalated))
                .bind(("failed", delta.failed))
                .bind(("success_count", delta.success_count))
                .bind(("duration", delta.duration_seconds.unwrap_or(0.0)))
                .bind(("at", at))
                .await
                .map_err(map_surreal_error)?;
            let rows: Vec<Value> = response.take(0).map_err(query_result_error)?;
            decode_one(rows, "hourly_counter")?.ok_or_else(|| {
                DomainError::Persistence("hourly counter upsert returned no row".to_string())
            })
        })
    }

    fn list_hourly(
        &self,
        filter: &CityFilter,
        start: OffsetDateTime,
        end: OffsetDateTime,
    ) -> BoxFuture<'_, DomainResult<Vec<HourlyCounter>>> {
        let (all_cities, cities) = Self::city_binds(filter);
        Box::pin(async move {
            let start = to_rfc3339(start)?;
            let end = to_rfc3339(end)?;
            let mut response = self
                .client
                .query(
                    "SELECT *, <datetime> hour AS hour_at OMIT id FROM hourly_counter \
                     WHERE <datetime> hour >= <datetime> $start \
                       AND <datetime> hour < <datetime> $end \
                       AND ($all_cities OR city_code IN $cities) \
                     ORDER BY hour_at ASC, city_code ASC",
                )
                .bind(("start", start))
                .bind(("end", end))
                .bind(("all_cities", all_cities))
                .bind(("cities", cities))
                .await
                .map_err(map_surreal_error)?;
            let rows: Vec<Value> = response.take(0).map_err(query_result_error)?;
            decode_many(rows, "hourly_counter")
        })
    }

    fn list_city_codes(&self) -> BoxFuture<'_, DomainResult<Vec<String>>> {
        Box::pin(async move {
            let mut response = self
                .client
                .query("SELECT city_code FROM daily_counter GROUP BY city_code")
                .await
                .map_err(map_surreal_error)?;
            let rows: Vec<Value> = response.take(0).map_err(query_result_error)?;
            let mut cities: Vec<String> = decode_many::<CityCodeRow>(rows, "city_code")?
                .into_iter()
                .map(|row| row.city_code)
                .collect();
            cities.sort();
            Ok(cities)
        })
    }
}
