use time::{Date, OffsetDateTime};

use super::BoxFuture;
use crate::DomainResult;
use crate::stats::{CityFilter, CounterDelta, DailyCounter, HourlyCounter};

/// Durable daily and hourly buckets. No business logic lives behind this trait.
pub trait CounterStore: Send + Sync {
    fn get_daily(
        &self,
        city_code: &str,
        date: Date,
    ) -> BoxFuture<'_, DomainResult<Option<DailyCounter>>>;

    /// Insert-if-absent or increment-if-present in one atomic statement,
    /// bumping `version` and refreshing min/max and derived fields.
    fn upsert_daily_delta(
        &self,
        city_code: &str,
        date: Date,
        delta: &CounterDelta,
        at: OffsetDateTime,
    ) -> BoxFuture<'_, DomainResult<DailyCounter>>;

    /// Fails with `DomainError::Conflict` when the key already exists.
    fn create_daily(&self, counter: &DailyCounter) -> BoxFuture<'_, DomainResult<DailyCounter>>;

    /// Writes `counter` only if the stored version still equals
    /// `expected_version`. `None` means zero rows matched.
    fn update_daily_if_version(
        &self,
        counter: &DailyCounter,
        expected_version: u64,
    ) -> BoxFuture<'_, DomainResult<Option<DailyCounter>>>;

    /// Overwrites every counted field and increments the stored version.
    fn replace_daily(&self, counter: &DailyCounter) -> BoxFuture<'_, DomainResult<DailyCounter>>;

    fn list_daily(
        &self,
        filter: &CityFilter,
        start: Date,
        end: Date,
    ) -> BoxFuture<'_, DomainResult<Vec<DailyCounter>>>;

    fn bump_hourly(
        &self,
        city_code: &str,
        hour: OffsetDateTime,
        delta: &CounterDelta,
        at: OffsetDateTime,
    ) -> BoxFuture<'_, DomainResult<HourlyCounter>>;

    /// Hours in `[start, end)`.
    fn list_hourly(
        &self,
        filter: &CityFilter,
        start: OffsetDateTime,
        end: OffsetDateTime,
    ) -> BoxFuture<'_, DomainResult<Vec<HourlyCounter>>>;

    fn list_city_codes(&self) -> BoxFuture<'_, DomainResult<Vec<String>>>;
}
