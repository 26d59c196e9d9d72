//! Redis backend.
//!
//! One multiplexed [`ConnectionManager`] is shared by every call; it
//! reconnects on its own after drops. Each command is bounded by the
//! configured operation timeout.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{FromRedisValue, RedisError, Script};
use tracing::{debug, info};

use super::backend::{BackendError, KvBackend, ScanCursor, ScanPage};

/// Delete KEYS[1] only while it still holds ARGV[1].
const RELEASE_IF_OWNER_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

/// SET KEYS[2] to ARGV[2] with a PX of ARGV[3] only while KEYS[1] holds ARGV[1].
const STORE_IF_OWNER_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    redis.call('SET', KEYS[2], ARGV[2], 'PX', ARGV[3])
    return 1
end
return 0
"#;

const SCAN_START: &str = "0";

pub struct RedisBackend {
    connection: ConnectionManager,
    release_script: Script,
    store_script: Script,
    timeout: Duration,
    closed: AtomicBool,
}

impl RedisBackend {
    /// Open a managed connection and confirm the server answers a ping.
    pub async fn connect(url: &str, timeout: Duration) -> Result<Self, BackendError> {
        let client = redis::Client::open(url).map_err(map_redis_error)?;
        let connection = tokio::time::timeout(timeout, ConnectionManager::new(client))
            .await
            .map_err(|_| BackendError::Timeout(timeout))?
            .map_err(map_redis_error)?;

        let backend = Self {
            connection,
            release_script: Script::new(RELEASE_IF_OWNER_SCRIPT),
            store_script: Script::new(STORE_IF_OWNER_SCRIPT),
            timeout,
            closed: AtomicBool::new(false),
        };
        backend.ping().await?;
        info!(target = "quire::cache::redis", "Connected to Redis");
        Ok(backend)
    }

    async fn run<T, F>(&self, op: F) -> Result<T, BackendError>
    where
        F: Future<Output = Result<T, RedisError>>,
    {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BackendError::unavailable("redis backend is closed"));
        }
        tokio::time::timeout(self.timeout, op)
            .await
            .map_err(|_| BackendError::Timeout(self.timeout))?
            .map_err(map_redis_error)
    }

    async fn query<T: FromRedisValue>(&self, cmd: redis::Cmd) -> Result<T, BackendError> {
        let mut connection = self.connection.clone();
        self.run(async move { cmd.query_async::<T>(&mut connection).await })
            .await
    }
}

#[async_trait]
impl KvBackend for RedisBackend {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn get(&self, key: &str) -> Result<Option<String>, BackendError> {
        let mut cmd = redis::cmd("GET");
        cmd.arg(key);
        self.query(cmd).await
    }

    async fn set_with_ttl(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<(), BackendError> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value).arg("PX").arg(ttl_millis(ttl));
        self.query(cmd).await
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, BackendError> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl));
        let reply: Option<String> = self.query(cmd).await?;
        Ok(reply.is_some())
    }

    async fn set_if_equals(
        &self,
        guard: &str,
        expected: &str,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, BackendError> {
        let mut connection = self.connection.clone();
        let mut invocation = self.store_script.prepare_invoke();
        invocation
            .key(guard)
            .key(key)
            .arg(expected)
            .arg(value)
            .arg(ttl_millis(ttl));
        let stored: u64 = self
            .run(async move { invocation.invoke_async::<u64>(&mut connection).await })
            .await?;
        Ok(stored > 0)
    }

    async fn delete(&self, key: &str) -> Result<bool, BackendError> {
        let mut cmd = redis::cmd("DEL");
        cmd.arg(key);
        let removed: u64 = self.query(cmd).await?;
        Ok(removed > 0)
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool, BackendError> {
        let mut connection = self.connection.clone();
        let mut invocation = self.release_script.prepare_invoke();
        invocation.key(key).arg(expected);
        let removed: u64 = self
            .run(async move { invocation.invoke_async::<u64>(&mut connection).await })
            .await?;
        Ok(removed > 0)
    }

    async fn delete_many(&self, keys: &[String]) -> Result<u64, BackendError> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut cmd = redis::cmd("DEL");
        cmd.arg(keys);
        self.query(cmd).await
    }

    async fn scan(
        &self,
        pattern: &str,
        cursor: Option<ScanCursor>,
        batch: usize,
    ) -> Result<ScanPage, BackendError> {
        let start = cursor.map(|c| c.0).unwrap_or_else(|| SCAN_START.to_string());
        let mut cmd = redis::cmd("SCAN");
        cmd.arg(&start)
            .arg("MATCH")
            .arg(pattern)
            .arg("COUNT")
            .arg(batch.max(1));
        let (next, keys): (String, Vec<String>) = self.query(cmd).await?;
        debug!(
            target = "quire::cache::redis",
            pattern,
            returned = keys.len(),
            "SCAN batch"
        );
        Ok(ScanPage {
            keys,
            next: (next != SCAN_START).then_some(ScanCursor(next)),
        })
    }

    async fn ping(&self) -> Result<(), BackendError> {
        let reply: String = self.query(redis::cmd("PING")).await?;
        if reply == "PONG" {
            Ok(())
        } else {
            Err(BackendError::Command(format!(
                "unexpected PING reply `{reply}`"
            )))
        }
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            info!(target = "quire::cache::redis", "Closed Redis backend");
        }
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

fn map_redis_error(err: RedisError) -> BackendError {
    if err.is_io_error()
        || err.is_connection_dropped()
        || err.is_connection_refusal()
        || err.is_timeout()
    {
        BackendError::Unavailable(err.to_string())
    } else {
        BackendError::Command(err.to_string())
    }
}
