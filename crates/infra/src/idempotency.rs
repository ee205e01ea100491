use std::time::Duration;

use procstats_domain::ports::BoxFuture;
use procstats_domain::ports::idempotency::{
    IdempotencyError, IdempotencyRecord, IdempotencyStore, PutOutcome,
};
use redis::AsyncCommands;
use redis::aio::ConnectionManager;

const PUT_RETRY_LIMIT: usize = 2;

/// Replay claims as JSON strings: `SET NX PX` to claim, `SET XX PX` to
/// complete, `DEL` to release.
#[derive(Clone)]
pub struct RedisIdempotencyStore {
    manager: ConnectionManager,
    prefix: String,
}

impl RedisIdempotencyStore {
    pub async fn connect_with_prefix(
        redis_url: &str,
        prefix: impl Into<String>,
    ) -> Result<Self, IdempotencyError> {
        let client = redis::Client::open(redis_url)
            .map_err(|err| IdempotencyError::Unavailable(err.to_string()))?;
        let manager = ConnectionManager::new(client)
            .await
            .map_err(|err| IdempotencyError::Unavailable(err.to_string()))?;
        Ok(Self {
            manager,
            prefix: prefix.into(),
        })
    }

    fn cache_key(&self, key: &str) -> String {
        cache_key(&self.prefix, key)
    }
}

fn cache_key(prefix: &str, key: &str) -> String {
    format!("{prefix}:{key}")
}

fn ttl_ms(ttl: Duration) -> u64 {
    let ms = ttl.as_millis() as u64;
    if ms == 0 { 1 } else { ms }
}

fn encode(record: &IdempotencyRecord) -> Result<String, IdempotencyError> {
    serde_json::to_string(record).map_err(|err| IdempotencyError::Serialization(err.to_string()))
}

fn decode(payload: &str) -> Result<IdempotencyRecord, IdempotencyError> {
    serde_json::from_str(payload).map_err(|err| IdempotencyError::Serialization(err.to_string()))
}

fn map_redis_error(err: redis::RedisError) -> IdempotencyError {
    if err.is_io_error() || err.is_connection_dropped() || err.is_timeout() {
        IdempotencyError::Unavailable(err.to_string())
    } else {
        IdempotencyError::Store(err.to_string())
    }
}

impl IdempotencyStore for RedisIdempotencyStore {
    fn put_if_absent(
        &self,
        key: &str,
        record: &IdempotencyRecord,
        ttl: Duration,
    ) -> BoxFuture<'_, Result<PutOutcome, IdempotencyError>> {
        let cache_key = self.cache_key(key);
        let record = record.clone();
        Box::pin(async move {
            let payload = encode(&record)?;
            for _ in 0..PUT_RETRY_LIMIT {
                let mut conn = self.manager.clone();
                let stored: Option<String> = redis::cmd("SET")
                    .arg(&cache_key)
                    .arg(&payload)
                    .arg("NX")
                    .arg("PX")
                    .arg(ttl_ms(ttl))
                    .query_async(&mut conn)
                    .await
                    .map_err(map_redis_error)?;
                if stored.is_some() {
                    return Ok(PutOutcome::Stored);
                }

                // The holder may expire between SET and GET; claim again then.
                let existing: Option<String> =
                    conn.get(&cache_key).await.map_err(map_redis_error)?;
                if let Some(existing) = existing {
                    return Ok(PutOutcome::Existing(decode(&existing)?));
                }
            }
            Err(IdempotencyError::Store(format!(
                "failed to claim idempotency key {cache_key}"
            )))
        })
    }

    fn update(
        &self,
        key: &str,
        record: &IdempotencyRecord,
        ttl: Duration,
    ) -> BoxFuture<'_, Result<(), IdempotencyError>> {
        let cache_key = self.cache_key(key);
        let record = record.clone();
        Box::pin(async move {
            let payload = encode(&record)?;
            let mut conn = self.manager.clone();
            let replaced: Option<String> = redis::cmd("SET")
                .arg(&cache_key)
                .arg(&payload)
                .arg("XX")
                .arg("PX")
                .arg(ttl_ms(ttl))
                .query_async(&mut conn)
                .await
                .map_err(map_redis_error)?;
            if replaced.is_none() {
                let _: String = redis::cmd("SET")
                    .arg(&cache_key)
                    .arg(&payload)
                    .arg("PX")
                    .arg(ttl_ms(ttl))
                    .query_async(&mut conn)
                    .await
                    .map_err(map_redis_error)?;
            }
            Ok(())
        })
    }

    fn remove(&self, key: &str) -> BoxFuture<'_, Result<(), IdempotencyError>> {
        let cache_key = self.cache_key(key);
        Box::pin(async move {
            let mut conn = self.manager.clone();
            let _: i64 = conn.del(&cache_key).await.map_err(map_redis_error)?;
            Ok(())
        })
    }
}
