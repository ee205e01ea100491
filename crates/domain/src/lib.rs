pub mod aggregation;
pub mod calendar;
pub mod coordinator;
pub mod error;
pub mod hourly;
pub mod idempotency;
pub mod jobs;
pub mod memory;
pub mod ports;
pub mod reconciliation;
pub mod recording;
pub mod stats;
pub mod util;

pub type DomainResult<T> = Result<T, error::DomainError>;
