use std::sync::Arc;

use time::OffsetDateTime;

use crate::DomainResult;
use crate::ports::counters::CounterStore;
use crate::stats::{CounterDelta, HourlyCounter};

/// Lock-free writer for hourly trend buckets.
///
/// Hourly rows are advisory and never reconciled, so two writers racing on the
/// same hour may each increment a stale snapshot. One upsert round-trip is the
/// whole cost of a write.
#[derive(Clone)]
pub struct HourlyTrendWriter {
    store: Arc<dyn CounterStore>,
}

impl HourlyTrendWriter {
    pub fn new(store: Arc<dyn CounterStore>) -> Self {
        Self { store }
    }

    /// `hour` must already be truncated to the bucket start.
    pub async fn bump_hourly(
        &self,
        city_code: &str,
        hour: OffsetDateTime,
        delta: &CounterDelta,
    ) -> DomainResult<HourlyCounter> {
        self.store
            .bump_hourly(city_code, hour, delta, OffsetDateTime::now_utc())
            .await
    }
}
