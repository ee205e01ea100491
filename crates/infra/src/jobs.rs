use std::time::Duration;

use procstats_domain::jobs::now_ms;
use procstats_domain::ports::BoxFuture;
use procstats_domain::ports::jobs::{JobEnvelope, JobQueue, JobQueueError, QueueSnapshot};
use redis::AsyncCommands;
use redis::aio::ConnectionManager;

const DEFAULT_PREFIX: &str = "procstats:jobs";

/// Stores the payload and routes the id to `ready` or `delayed` by `run_at_ms`.
/// With a non-empty marker key the job is only stored if the marker was unset.
const ENQUEUE_SCRIPT: &str = r#"
    local payload_key = KEYS[1]
    local ready_key = KEYS[2]
    local delayed_key = KEYS[3]
    local processing_key = KEYS[4]
    local marker_key = KEYS[5]
    local job_id = ARGV[1]
    local payload = ARGV[2]
    local run_at_ms = tonumber(ARGV[3])
    local now_ms = tonumber(ARGV[4])
    local dedupe_ttl_ms = tonumber(ARGV[5])
    local from_processing = ARGV[6] == '1'

    if dedupe_ttl_ms > 0 then
        if redis.call('SET', marker_key, 1, 'PX', dedupe_ttl_ms, 'NX') == false then
            return 0
        end
    end

    redis.call('HSET', payload_key, job_id, payload)
    if from_processing then
        redis.call('LREM', processing_key, 1, job_id)
    end
    if run_at_ms <= now_ms then
        redis.call('RPUSH', ready_key, job_id)
    else
        redis.call('ZADD', delayed_key, run_at_ms, job_id)
    end
    return 1
"#;

/// Moves due ids from `delayed` to `ready` in one step.
const PROMOTE_SCRIPT: &str = r#"
    local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, tonumber(ARGV[2]))
    for _, job_id in ipairs(due) do
        redis.call('ZREM', KEYS[1], job_id)
        redis.call('RPUSH', KEYS[2], job_id)
    end
    return #due
"#;

/// Reliable queue on Redis: a `ready` list, a `delayed` sorted set scored by
/// run time, a `processing` list for in-flight ids and a payload hash.
#[derive(Clone)]
pub struct RedisJobQueue {
    manager: ConnectionManager,
    prefix: String,
    ready_key: String,
    delayed_key: String,
    processing_key: String,
    payload_key: String,
}

fn op_err(err: redis::RedisError) -> JobQueueError {
    JobQueueError::Operation(err.to_string())
}

impl RedisJobQueue {
    pub async fn connect(redis_url: &str) -> Result<Self, JobQueueError> {
        Self::connect_with_prefix(redis_url, DEFAULT_PREFIX).await
    }

    pub async fn connect_with_prefix(
        redis_url: &str,
        prefix: impl Into<String>,
    ) -> Result<Self, JobQueueError> {
        let client = redis::Client::open(redis_url)
            .map_err(|err| JobQueueError::Unavailable(err.to_string()))?;
        let manager = ConnectionManager::new(client)
            .await
            .map_err(|err| JobQueueError::Unavailable(err.to_string()))?;
        let prefix = prefix.into();
        Ok(Self {
            manager,
            ready_key: format!("{prefix}:ready"),
            delayed_key: format!("{prefix}:delayed"),
            processing_key: format!("{prefix}:processing"),
            payload_key: format!("{prefix}:payloads"),
            prefix,
        })
    }

    fn marker_key(&self, job_id: &str) -> String {
        format!("{}:dedupe:{job_id}", self.prefix)
    }

    async fn store(
        &self,
        job: &JobEnvelope,
        dedupe_ttl_ms: u64,
        from_processing: bool,
    ) -> Result<bool, JobQueueError> {
        let payload = serde_json::to_string(job)
            .map_err(|err| JobQueueError::Serialization(err.to_string()))?;
        let mut conn = self.manager.clone();
        let stored: i32 = redis::Script::new(ENQUEUE_SCRIPT)
            .key(&self.payload_key)
            .key(&self.ready_key)
            .key(&self.delayed_key)
            .key(&self.processing_key)
            .key(self.marker_key(&job.job_id))
            .arg(&job.job_id)
            .arg(payload)
            .arg(job.run_at_ms)
            .arg(now_ms())
            .arg(dedupe_ttl_ms as i64)
            .arg(if from_processing { "1" } else { "0" })
            .invoke_async(&mut conn)
            .await
            .map_err(op_err)?;
        Ok(stored == 1)
    }
}

impl JobQueue for RedisJobQueue {
    fn enqueue(&self, job: &JobEnvelope) -> BoxFuture<'_, Result<(), JobQueueError>> {
        let job = job.clone();
        Box::pin(async move {
            self.store(&job, 0, false).await?;
            Ok(())
        })
    }

    fn enqueue_if_absent(
        &self,
        job: &JobEnvelope,
        dedupe_ttl_ms: u64,
    ) -> BoxFuture<'_, Result<bool, JobQueueError>> {
        let job = job.clone();
        Box::pin(async move { self.store(&job, dedupe_ttl_ms.max(1), false).await })
    }

    fn dequeue(
        &self,
        timeout: Duration,
    ) -> BoxFuture<'_, Result<Option<JobEnvelope>, JobQueueError>> {
        Box::pin(async move {
            let mut conn = self.manager.clone();
            let job_id: Option<String> = redis::cmd("BLMOVE")
                .arg(&self.ready_key)
                .arg(&self.processing_key)
                .arg("LEFT")
                .arg("RIGHT")
                .arg(timeout.as_secs_f64().max(0.01))
                .query_async(&mut conn)
                .await
                .map_err(op_err)?;
            let Some(job_id) = job_id else {
                return Ok(None);
            };

            let payload: Option<String> = conn
                .hget(&self.payload_key, &job_id)
                .await
                .map_err(op_err)?;
            let Some(payload) = payload else {
                let _: i64 = conn
                    .lrem(&self.processing_key, 1, &job_id)
                    .await
                    .map_err(op_err)?;
                return Err(JobQueueError::Operation(format!(
                    "missing payload for job_id {job_id}"
                )));
            };
            serde_json::from_str(&payload)
                .map(Some)
                .map_err(|err| JobQueueError::Serialization(err.to_string()))
        })
    }

    fn ack(&self, job_id: &str) -> BoxFuture<'_, Result<(), JobQueueError>> {
        let job_id = job_id.to_string();
        Box::pin(async move {
            let mut conn = self.manager.clone();
            let _: Vec<i64> = redis::pipe()
                .atomic()
                .lrem(&self.processing_key, 1, &job_id)
                .hdel(&self.payload_key, &job_id)
                .query_async(&mut conn)
                .await
                .map_err(op_err)?;
            Ok(())
        })
    }

    fn retry_later(&self, job: &JobEnvelope) -> BoxFuture<'_, Result<(), JobQueueError>> {
        let job = job.clone();
        Box::pin(async move {
            self.store(&job, 0, true).await?;
            Ok(())
        })
    }

    fn promote_due(
        &self,
        now_ms: i64,
        limit: usize,
    ) -> BoxFuture<'_, Result<usize, JobQueueError>> {
        Box::pin(async move {
            if limit == 0 {
                return Ok(0);
            }
            let mut conn = self.manager.clone();
            let moved: i64 = redis::Script::new(PROMOTE_SCRIPT)
                .key(&self.delayed_key)
                .key(&self.ready_key)
                .arg(now_ms)
                .arg(limit as i64)
                .invoke_async(&mut conn)
                .await
                .map_err(op_err)?;
            Ok(moved.max(0) as usize)
        })
    }

    fn requeue_processing(&self, limit: usize) -> BoxFuture<'_, Result<usize, JobQueueError>> {
        Box::pin(async move {
            let mut conn = self.manager.clone();
            let mut moved = 0usize;
            while moved < limit {
                let job_id: Option<String> = redis::cmd("LMOVE")
                    .arg(&self.processing_key)
                    .arg(&self.ready_key)
                    .arg("LEFT")
                    .arg("RIGHT")
                    .query_async(&mut conn)
                    .await
                    .map_err(op_err)?;
                if job_id.is_none() {
                    break;
                }
                moved += 1;
            }
            if moved > 0 {
                tracing::info!(moved, "requeued jobs left in processing");
            }
            Ok(moved)
        })
    }

    fn snapshot(&self) -> BoxFuture<'_, Result<QueueSnapshot, JobQueueError>> {
        Box::pin(async move {
            let mut conn = self.manager.clone();
            let (ready, delayed, processing): (u64, u64, u64) = redis::pipe()
                .llen(&self.ready_key)
                .zcard(&self.delayed_key)
                .llen(&self.processing_key)
                .query_async(&mut conn)
                .await
                .map_err(op_err)?;
            let oldest: Vec<(String, f64)> = conn
                .zrange_withscores(&self.delayed_key, 0, 0)
                .await
                .map_err(op_err)?;
            Ok(QueueSnapshot {
                ready,
                delayed,
                processing,
                oldest_delayed_ms: oldest.into_iter().next().map(|(_, score)| score as i64),
            })
        })
    }
}
