pub mod config;
pub mod db;
pub mod idempotency;
pub mod jobs;
pub mod lock;
pub mod logging;
pub mod repositories;
pub mod services;
