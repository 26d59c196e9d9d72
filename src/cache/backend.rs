//! Key-value backend contract.
//!
//! Any store offering plain reads, writes with expiry, deletes, an atomic
//! set-if-absent with expiry, cursor-based key scans, and a ping can back the
//! cache. Implementations return errors; deciding what an error means for a
//! caller is the cache manager's job.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error, Clone)]
pub enum BackendError {
    #[error("cache backend unavailable: {0}")]
    Unavailable(String),
    #[error("cache backend timed out after {0:?}")]
    Timeout(Duration),
    #[error("cache backend rejected command: {0}")]
    Command(String),
}

impl BackendError {
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable(message.into())
    }
}

/// Opaque resume point of a key scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanCursor(pub(crate) String);

/// One batch of a key scan.
#[derive(Debug, Clone, Default)]
pub struct ScanPage {
    pub keys: Vec<String>,
    /// `None` once the scan has visited every key.
    pub next: Option<ScanCursor>,
}

#[async_trait]
pub trait KvBackend: Send + Sync {
    /// Short backend name for logs and status output.
    fn name(&self) -> &'static str;

    async fn get(&self, key: &str) -> Result<Option<String>, BackendError>;

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration)
    -> Result<(), BackendError>;

    /// Atomically store `value` only if `key` is absent. Returns whether it was stored.
    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, BackendError>;

    /// Store `value` under `key` only while `guard` still holds `expected`,
    /// as one atomic step. Returns whether it was stored.
    async fn set_if_equals(
        &self,
        guard: &str,
        expected: &str,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, BackendError>;

    /// Returns whether the key existed.
    async fn delete(&self, key: &str) -> Result<bool, BackendError>;

    /// Delete `key` only while it still holds `expected`. Returns whether it was deleted.
    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool, BackendError>;

    /// Delete a batch of keys, returning how many existed.
    async fn delete_many(&self, keys: &[String]) -> Result<u64, BackendError>;

    /// Visit keys matching a glob pattern, at most roughly `batch` per call.
    async fn scan(
        &self,
        pattern: &str,
        cursor: Option<ScanCursor>,
        batch: usize,
    ) -> Result<ScanPage, BackendError>;

    async fn ping(&self) -> Result<(), BackendError>;

    /// Release connections. Later calls fail with [`BackendError::Unavailable`].
    async fn close(&self);
}

/// Backend used when caching is disabled or the real store could not be reached.
///
/// Every read misses, every write is accepted and dropped, and lock
/// acquisition always succeeds so callers compute directly. Pings fail so
/// health output reports the cache as disconnected.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopBackend;

#[async_trait]
impl KvBackend for NoopBackend {
    fn name(&self) -> &'static str {
        "noop"
    }

    async fn get(&self, _key: &str) -> Result<Option<String>, BackendError> {
        Ok(None)
    }

    async fn set_with_ttl(
        &self,
        _key: &str,
        _value: &str,
        _ttl: Duration,
    ) -> Result<(), BackendError> {
        Ok(())
    }

    async fn set_if_absent(
        &self,
        _key: &str,
        _value: &str,
        _ttl: Duration,
    ) -> Result<bool, BackendError> {
        Ok(true)
    }

    async fn set_if_equals(
        &self,
        _guard: &str,
        _expected: &str,
        _key: &str,
        _value: &str,
        _ttl: Duration,
    ) -> Result<bool, BackendError> {
        Ok(true)
    }

    async fn delete(&self, _key: &str) -> Result<bool, BackendError> {
        Ok(false)
    }

    async fn delete_if_equals(&self, _key: &str, _expected: &str) -> Result<bool, BackendError> {
        Ok(false)
    }

    async fn delete_many(&self, _keys: &[String]) -> Result<u64, BackendError> {
        Ok(0)
    }

    async fn scan(
        &self,
        _pattern: &str,
        _cursor: Option<ScanCursor>,
        _batch: usize,
    ) -> Result<ScanPage, BackendError> {
        Ok(ScanPage::default())
    }

    async fn ping(&self) -> Result<(), BackendError> {
        Err(BackendError::unavailable("caching is disabled"))
    }

    async fn close(&self) {}
}
