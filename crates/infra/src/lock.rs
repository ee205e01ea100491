use std::time::Duration;

use procstats_domain::ports::BoxFuture;
use procstats_domain::ports::lock::{LockError, LockLease, LockService};
use procstats_domain::util::uuid_v7_without_dashes;
use redis::aio::ConnectionManager;

const DEFAULT_PREFIX: &str = "procstats:lock";

const RELEASE_SCRIPT: &str = r#"
    if redis.call('GET', KEYS[1]) == ARGV[1] then
        return redis.call('DEL', KEYS[1])
    end
    return 0
"#;

/// Single-instance Redis lock: `SET NX PX` to acquire, compare-token-and-delete
/// to release.
#[derive(Clone)]
pub struct RedisLockService {
    manager: ConnectionManager,
    prefix: String,
}

impl RedisLockService {
    pub async fn connect(redis_url: &str) -> Result<Self, LockError> {
        Self::connect_with_prefix(redis_url, DEFAULT_PREFIX).await
    }

    pub async fn connect_with_prefix(
        redis_url: &str,
        prefix: impl Into<String>,
    ) -> Result<Self, LockError> {
        let client =
            redis::Client::open(redis_url).map_err(|err| LockError::Unavailable(err.to_string()))?;
        let manager = ConnectionManager::new(client)
            .await
            .map_err(|err| LockError::Unavailable(err.to_string()))?;
        Ok(Self {
            manager,
            prefix: prefix.into(),
        })
    }

    fn lock_key(&self, key: &str) -> String {
        format!("{}:{key}", self.prefix)
    }

    fn ttl_ms(ttl: Duration) -> u64 {
        let ms = ttl.as_millis() as u64;
        if ms == 0 { 1 } else { ms }
    }
}

fn map_redis_error(err: redis::RedisError) -> LockError {
    if err.is_io_error() || err.is_connection_dropped() || err.is_timeout() {
        LockError::Unavailable(err.to_string())
    } else {
        LockError::Operation(err.to_string())
    }
}

impl LockService for RedisLockService {
    fn try_acquire(
        &self,
        key: &str,
        ttl: Duration,
    ) -> BoxFuture<'_, Result<Option<LockLease>, LockError>> {
        let lock_key = self.lock_key(key);
        let key = key.to_string();
        Box::pin(async move {
            let token = uuid_v7_without_dashes();
            let mut conn = self.manager.clone();
            let result: Option<String> = redis::cmd("SET")
                .arg(&lock_key)
                .arg(&token)
                .arg("NX")
                .arg("PX")
                .arg(Self::ttl_ms(ttl))
                .query_async(&mut conn)
                .await
                .map_err(map_redis_error)?;
            Ok(result.map(|_| LockLease { key, token }))
        })
    }

    fn release(&self, lease: &LockLease) -> BoxFuture<'_, Result<bool, LockError>> {
        let lock_key = self.lock_key(&lease.key);
        let token = lease.token.clone();
        Box::pin(async move {
            let mut conn = self.manager.clone();
            let deleted: i32 = redis::Script::new(RELEASE_SCRIPT)
                .key(&lock_key)
                .arg(&token)
                .invoke_async(&mut conn)
                .await
                .map_err(map_redis_error)?;
            Ok(deleted == 1)
        })
    }
}
