use time::{Date, OffsetDateTime, Time, UtcOffset};

use crate::DomainResult;
use crate::error::DomainError;

/// Maps instants onto day and hour buckets in one fixed offset.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StatsCalendar {
    offset: UtcOffset,
}

impl Default for StatsCalendar {
    fn default() -> Self {
        Self {
            offset: UtcOffset::UTC,
        }
    }
}

impl StatsCalendar {
    pub fn new(offset: UtcOffset) -> Self {
        Self { offset }
    }

    pub fn from_offset_minutes(minutes: i32) -> DomainResult<Self> {
        let offset = UtcOffset::from_whole_seconds(minutes.saturating_mul(60)).map_err(|err| {
            DomainError::Validation(format!("invalid utc offset {minutes} minutes: {err}"))
        })?;
        Ok(Self { offset })
    }

    pub fn offset(&self) -> UtcOffset {
        self.offset
    }

    pub fn day_of(&self, at: OffsetDateTime) -> Date {
        at.to_offset(self.offset).date()
    }

    /// Start of the hour containing `at`, normalised to UTC.
    pub fn hour_of(&self, at: OffsetDateTime) -> OffsetDateTime {
        let local = at.to_offset(self.offset);
        let truncated = Time::from_hms(local.hour(), 0, 0).unwrap_or(Time::MIDNIGHT);
        local.replace_time(truncated).to_offset(UtcOffset::UTC)
    }

    /// Half-open `[start, end)` window covering `date`.
    pub fn day_window(&self, date: Date) -> (OffsetDateTime, OffsetDateTime) {
        let start = date.midnight().assume_offset(self.offset);
        let end = start + time::Duration::days(1);
        (start, end)
    }

    pub fn today(&self) -> Date {
        self.day_of(OffsetDateTime::now_utc())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::{date, datetime, offset};

    #[test]
    fn day_follows_configured_offset() {
        let calendar = StatsCalendar::new(offset!(+8));
        assert_eq!(
            calendar.day_of(datetime!(2025-01-09 17:30 UTC)),
            date!(2025 - 01 - 10)
        );
        assert_eq!(
            StatsCalendar::default().day_of(datetime!(2025-01-09 17:30 UTC)),
            date!(2025 - 01 - 09)
        );
    }

    #[test]
    fn hour_is_truncated_and_utc() {
        let calendar = StatsCalendar::new(offset!(+8));
        let hour = calendar.hour_of(datetime!(2025-01-10 08:45:12 +8));
        assert_eq!(hour, datetime!(2025-01-10 00:00 UTC));
        assert_eq!(hour.offset(), UtcOffset::UTC);
    }

    #[test]
    fn day_window_spans_one_local_day() {
        let calendar = StatsCalendar::from_offset_minutes(480).unwrap();
        let (start, end) = calendar.day_window(date!(2025 - 01 - 10));
        assert_eq!(start, datetime!(2025-01-09 16:00 UTC));
        assert_eq!(end, datetime!(2025-01-10 16:00 UTC));
    }
}
