use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use time::Date;

use crate::ports::jobs::{JobEnvelope, JobType};
use crate::stats::ProcessingResultEvent;

/// A daily write that could not be applied inline.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct StatsReplayPayload {
    pub event: ProcessingResultEvent,
    pub reason: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct StatsReconcilePayload {
    pub city_code: String,
    pub date: Date,
    pub executed_by: String,
}

#[derive(Clone, Debug)]
pub struct JobDefaults {
    pub max_attempts: u32,
}

impl Default for JobDefaults {
    fn default() -> Self {
        Self { max_attempts: 5 }
    }
}

pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

pub fn backoff_ms(base_ms: u64, attempt: u32, max_ms: u64) -> u64 {
    if attempt == 0 {
        return 0;
    }
    let pow = 2u64.saturating_pow(attempt.saturating_sub(1));
    let delay = base_ms.saturating_mul(pow);
    delay.min(max_ms)
}

pub fn new_job(
    job_id: String,
    job_type: JobType,
    payload: serde_json::Value,
    request_id: String,
    correlation_id: String,
    defaults: JobDefaults,
) -> JobEnvelope {
    let now = now_ms();
    JobEnvelope {
        job_id,
        job_type,
        payload,
        request_id,
        correlation_id,
        attempt: 1,
        max_attempts: defaults.max_attempts,
        run_at_ms: now,
        created_at_ms: now,
    }
}

pub fn replay_job_id(event: &ProcessingResultEvent) -> String {
    format!("replay:{}:{}", event.city_code, event.document_id)
}

/// One scheduled verification per city and date.
pub fn reconcile_job_id(city_code: &str, date: Date) -> String {
    format!("reconcile:{city_code}:{date}")
}

pub fn replay_job(
    payload: &StatsReplayPayload,
    defaults: JobDefaults,
) -> Result<JobEnvelope, serde_json::Error> {
    let body = serde_json::to_value(payload)?;
    Ok(new_job(
        replay_job_id(&payload.event),
        JobType::StatsReplay,
        body,
        payload.event.document_id.clone(),
        crate::util::uuid_v7_without_dashes(),
        defaults,
    ))
}

pub fn reconcile_job(
    payload: &StatsReconcilePayload,
    defaults: JobDefaults,
) -> Result<JobEnvelope, serde_json::Error> {
    let body = serde_json::to_value(payload)?;
    let job_id = reconcile_job_id(&payload.city_code, payload.date);
    Ok(new_job(
        job_id.clone(),
        JobType::StatsReconcile,
        body,
        job_id,
        crate::util::uuid_v7_without_dashes(),
        defaults,
    ))
}
