use std::future::Future;
use std::pin::Pin;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub mod counters;
pub mod db;
pub mod documents;
pub mod idempotency;
pub mod jobs;
pub mod lock;
pub mod reconciliation;
