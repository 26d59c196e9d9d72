//! Cache manager.
//!
//! Owns the backend handle and turns every backend failure on the read path
//! into a miss: callers of [`CacheManager::get`], [`CacheManager::set`] and
//! [`CacheManager::get_with_lock`] never see a cache error. Values are stored
//! as JSON.
//!
//! `get_with_lock` is the stampede guard. On a miss the first caller takes a
//! lease under `lock:<key>`, computes and stores the value. Everyone else
//! polls the entry with jittered exponential backoff until it appears, the
//! lease disappears (they then race for it again), or the wait budget runs
//! out, in which case they compute uncached.
//!
//! The leader stores its result only while it still holds the lease.
//! Invalidation revokes leases before deleting entries, so a computation that
//! read the store before a write cannot publish its result after the
//! write's invalidation ran.

use std::future::Future;
use std::sync::{Arc, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use metrics::{counter, histogram};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::backend::{BackendError, KvBackend, NoopBackend, ScanCursor};
use super::config::{CacheConfig, CachePolicy, LockWait};
use super::keys::{CacheKey, LOCK_PREFIX};
use super::lock::{Backoff, LeaseLock, rw_read, rw_write};
use super::memory::MemoryBackend;
use super::redis::RedisBackend;
use crate::config::CacheBackendKind;

pub(crate) const METRIC_CACHE_HIT: &str = "quire_cache_hit_total";
pub(crate) const METRIC_CACHE_MISS: &str = "quire_cache_miss_total";
pub(crate) const METRIC_CACHE_BACKEND_ERROR: &str = "quire_cache_backend_error_total";
pub(crate) const METRIC_CACHE_LOCK_ACQUIRED: &str = "quire_cache_lock_acquired_total";
pub(crate) const METRIC_CACHE_LOCK_WAIT: &str = "quire_cache_lock_wait_total";
pub(crate) const METRIC_CACHE_LOCK_FALLBACK: &str = "quire_cache_lock_fallback_total";
pub(crate) const METRIC_CACHE_COMPUTE_MS: &str = "quire_cache_compute_ms";

const TARGET: &str = "quire::cache::manager";

/// Why the manager is or is not talking to a real store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendMode {
    Active,
    /// Caching switched off in configuration.
    Disabled,
    /// The configured store could not be reached at startup.
    Fallback,
}

/// Point-in-time view of the manager for monitoring.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStatus {
    pub backend: &'static str,
    pub mode: BackendMode,
    pub connected: bool,
    pub last_error: Option<String>,
}

enum StoreOutcome {
    Stored,
    /// The lease expired or was revoked while computing.
    LeaseLost,
    Skipped,
}

enum Resolution<T> {
    Hit(T),
    Leader(LeaseLock),
    /// The lock itself could not be reached; compute without it.
    Degraded,
    /// Waited out the whole budget.
    Fallback,
}

pub struct CacheManager {
    backend: Arc<dyn KvBackend>,
    mode: BackendMode,
    connected: AtomicBool,
    last_error: RwLock<Option<String>>,
    lock_wait: LockWait,
    scan_batch: usize,
}

impl CacheManager {
    pub fn new(backend: Arc<dyn KvBackend>, config: &CacheConfig) -> Self {
        Self::with_mode(backend, BackendMode::Active, config)
    }

    fn with_mode(backend: Arc<dyn KvBackend>, mode: BackendMode, config: &CacheConfig) -> Self {
        Self {
            backend,
            mode,
            connected: AtomicBool::new(mode == BackendMode::Active),
            last_error: RwLock::new(None),
            lock_wait: config.lock_wait(),
            scan_batch: config.scan_batch_size_non_zero(),
        }
    }

    /// A manager that caches nothing.
    pub fn disabled(config: &CacheConfig) -> Self {
        Self::with_mode(Arc::new(NoopBackend), BackendMode::Disabled, config)
    }

    /// Build the configured backend. Never fails: an unreachable store
    /// leaves the manager on the no-op backend so reads go to the database.
    pub async fn open(config: &CacheConfig) -> Self {
        if !config.enabled {
            info!(target = TARGET, "Caching disabled by configuration");
            return Self::disabled(config);
        }

        match config.backend {
            CacheBackendKind::Memory => {
                info!(target = TARGET, backend = "memory", "Cache manager opened");
                Self::new(Arc::new(MemoryBackend::new()), config)
            }
            CacheBackendKind::Redis => {
                match RedisBackend::connect(&config.redis_url, config.operation_timeout()).await {
                    Ok(backend) => {
                        info!(target = TARGET, backend = "redis", "Cache manager opened");
                        Self::new(Arc::new(backend), config)
                    }
                    Err(err) => {
                        warn!(
                            target = TARGET,
                            backend = "redis",
                            error = %err,
                            "Cache backend unreachable at startup; serving without cache"
                        );
                        let manager =
                            Self::with_mode(Arc::new(NoopBackend), BackendMode::Fallback, config);
                        manager.remember_error(&err);
                        manager
                    }
                }
            }
        }
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub fn mode(&self) -> BackendMode {
        self.mode
    }

    /// Last observed connectivity. Cheap; does not touch the backend.
    pub fn is_connected(&self) -> bool {
        self.mode == BackendMode::Active && self.connected.load(Ordering::Relaxed)
    }

    pub fn status(&self) -> CacheStatus {
        let last_error = rw_read(&self.last_error, TARGET, "status").clone();
        CacheStatus {
            backend: self.backend.name(),
            mode: self.mode,
            connected: self.is_connected(),
            last_error,
        }
    }

    /// Round-trip to the backend, refreshing the connectivity flag.
    pub async fn ping(&self) -> bool {
        match self.backend.ping().await {
            Ok(()) => {
                self.mark_connected();
                true
            }
            Err(err) => {
                if self.mode == BackendMode::Active {
                    self.note_backend_error("ping", None, &err);
                }
                false
            }
        }
    }

    /// Release backend connections. Later operations miss.
    pub async fn close(&self) {
        self.backend.close().await;
        self.connected.store(false, Ordering::Relaxed);
        info!(target = TARGET, backend = self.backend.name(), "Cache manager closed");
    }

    /// Read and decode one entry. Backend failures and undecodable values are misses.
    pub async fn get<T: DeserializeOwned>(&self, key: &CacheKey) -> Option<T> {
        let raw = match self.backend.get(key.as_str()).await {
            Ok(Some(raw)) => {
                self.mark_connected();
                raw
            }
            Ok(None) => {
                self.mark_connected();
                return None;
            }
            Err(err) => {
                self.note_backend_error("get", Some(key), &err);
                return None;
            }
        };

        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(err) => {
                warn!(
                    target = TARGET,
                    cache_key = %key,
                    error = %err,
                    "Discarding undecodable cache entry"
                );
                if let Err(err) = self.backend.delete(key.as_str()).await {
                    self.note_backend_error("delete_corrupt", Some(key), &err);
                }
                None
            }
        }
    }

    /// Best-effort write. Returns whether the value was stored.
    pub async fn set<T: Serialize + ?Sized>(&self, key: &CacheKey, value: &T, ttl: Duration) -> bool {
        let Some(encoded) = encode(key, value) else {
            return false;
        };

        match self.backend.set_with_ttl(key.as_str(), &encoded, ttl).await {
            Ok(()) => {
                self.mark_connected();
                true
            }
            Err(err) => {
                self.note_backend_error("set", Some(key), &err);
                false
            }
        }
    }

    /// Best-effort delete. Returns whether the command succeeded; a missing key is success.
    pub async fn delete(&self, key: &CacheKey) -> bool {
        self.try_delete(key).await.is_ok()
    }

    /// Delete one key, surfacing backend failures. `Ok(true)` when the key existed.
    pub async fn try_delete(&self, key: &CacheKey) -> Result<bool, BackendError> {
        match self.backend.delete(key.as_str()).await {
            Ok(existed) => {
                self.mark_connected();
                Ok(existed)
            }
            Err(err) => {
                self.note_backend_error("delete", Some(key), &err);
                Err(err)
            }
        }
    }

    /// Revoke any lease on `key`, then delete the entry. `Ok(true)` when the entry existed.
    ///
    /// A computation holding the revoked lease can no longer store its result.
    pub async fn try_invalidate(&self, key: &CacheKey) -> Result<bool, BackendError> {
        if let Err(err) = self.backend.delete(&key.lock_key()).await {
            self.note_backend_error("revoke_lock", Some(key), &err);
            return Err(err);
        }
        self.try_delete(key).await
    }

    /// Pattern form of [`try_invalidate`](Self::try_invalidate). Counts removed entries only.
    pub async fn try_invalidate_pattern(&self, pattern: &str) -> Result<u64, BackendError> {
        self.try_delete_pattern(&format!("{LOCK_PREFIX}{pattern}"))
            .await?;
        self.try_delete_pattern(pattern).await
    }

    /// Best-effort pattern delete. Returns the number of keys removed, 0 on failure.
    pub async fn delete_pattern(&self, pattern: &str) -> u64 {
        self.try_delete_pattern(pattern).await.unwrap_or(0)
    }

    /// Delete every key matching `pattern`, one scan batch at a time.
    ///
    /// Yields to the scheduler between batches so a large namespace never
    /// monopolises the worker. Keys written after a batch was visited may
    /// survive; the next invalidation or their TTL removes them.
    pub async fn try_delete_pattern(&self, pattern: &str) -> Result<u64, BackendError> {
        let mut removed = 0u64;
        let mut cursor: Option<ScanCursor> = None;
        loop {
            let page = match self.backend.scan(pattern, cursor.take(), self.scan_batch).await {
                Ok(page) => page,
                Err(err) => {
                    self.note_backend_error("scan", None, &err);
                    return Err(err);
                }
            };
            if !page.keys.is_empty() {
                match self.backend.delete_many(&page.keys).await {
                    Ok(count) => removed += count,
                    Err(err) => {
                        self.note_backend_error("delete_many", None, &err);
                        return Err(err);
                    }
                }
            }
            match page.next {
                Some(next) => {
                    cursor = Some(next);
                    tokio::task::yield_now().await;
                }
                None => break,
            }
        }
        self.mark_connected();
        debug!(target = TARGET, pattern, removed, "Pattern delete finished");
        Ok(removed)
    }

    /// Count keys matching `pattern` without modifying anything.
    pub async fn count_pattern(&self, pattern: &str) -> Result<u64, BackendError> {
        let mut total = 0u64;
        let mut cursor: Option<ScanCursor> = None;
        loop {
            let page = match self.backend.scan(pattern, cursor.take(), self.scan_batch).await {
                Ok(page) => page,
                Err(err) => {
                    self.note_backend_error("scan", None, &err);
                    return Err(err);
                }
            };
            total += page.keys.len() as u64;
            match page.next {
                Some(next) => {
                    cursor = Some(next);
                    tokio::task::yield_now().await;
                }
                None => break,
            }
        }
        self.mark_connected();
        Ok(total)
    }

    /// Return the cached value for `key`, or compute it at most once across
    /// concurrent callers and cache the result.
    ///
    /// Errors from `compute` are returned unchanged and never cached.
    pub async fn get_with_lock<T, E, F, Fut>(
        &self,
        key: &CacheKey,
        policy: CachePolicy,
        compute: F,
    ) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned + Send,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.get_with_lock_if(key, policy, |_| true, compute).await
    }

    /// Like [`get_with_lock`](Self::get_with_lock), but only stores results
    /// for which `cacheable` holds. Other results are returned uncached.
    pub async fn get_with_lock_if<T, E, P, F, Fut>(
        &self,
        key: &CacheKey,
        policy: CachePolicy,
        cacheable: P,
        compute: F,
    ) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned + Send,
        P: Fn(&T) -> bool,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if let Some(value) = self.get::<T>(key).await {
            counter!(METRIC_CACHE_HIT).increment(1);
            return Ok(value);
        }
        counter!(METRIC_CACHE_MISS).increment(1);

        match self.resolve(key, policy.lock_ttl).await {
            Resolution::Hit(value) => Ok(value),
            Resolution::Leader(lease) => {
                counter!(METRIC_CACHE_LOCK_ACQUIRED).increment(1);
                let pending = ReleaseOnDrop::new(lease, self.backend.clone());
                let result = timed_compute(compute).await;
                let Some(lease) = pending.disarm() else {
                    return result;
                };

                let outcome = match &result {
                    Ok(value) if cacheable(value) => {
                        self.store_as_leader(&lease, key, value, policy.entry_ttl)
                            .await
                    }
                    _ => StoreOutcome::Skipped,
                };
                match outcome {
                    StoreOutcome::LeaseLost => debug!(
                        target = TARGET,
                        cache_key = %key,
                        "Lease lost while computing; result left uncached"
                    ),
                    StoreOutcome::Stored | StoreOutcome::Skipped => {
                        self.release(lease, key).await
                    }
                }
                result
            }
            Resolution::Degraded => {
                counter!(METRIC_CACHE_LOCK_FALLBACK, "reason" => "backend_error").increment(1);
                timed_compute(compute).await
            }
            Resolution::Fallback => {
                counter!(METRIC_CACHE_LOCK_FALLBACK, "reason" => "wait_budget").increment(1);
                warn!(
                    target = TARGET,
                    cache_key = %key,
                    budget_ms = self.lock_wait.budget.as_millis() as u64,
                    "Lock wait budget exhausted; computing without cache"
                );
                timed_compute(compute).await
            }
        }
    }

    async fn resolve<T: DeserializeOwned>(&self, key: &CacheKey, lease: Duration) -> Resolution<T> {
        let deadline = Instant::now() + self.lock_wait.budget;
        let mut backoff = Backoff::new(self.lock_wait.backoff_initial, self.lock_wait.backoff_max);
        let mut waited = false;

        loop {
            match LeaseLock::try_acquire(self.backend.as_ref(), key, lease).await {
                Ok(Some(lock)) => {
                    // The previous holder may have stored the value between our miss and this acquire.
                    if let Some(value) = self.get::<T>(key).await {
                        self.release(lock, key).await;
                        return Resolution::Hit(value);
                    }
                    return Resolution::Leader(lock);
                }
                Ok(None) => {}
                Err(err) => {
                    self.note_backend_error("acquire_lock", Some(key), &err);
                    return Resolution::Degraded;
                }
            }

            if !waited {
                waited = true;
                counter!(METRIC_CACHE_LOCK_WAIT).increment(1);
                debug!(target = TARGET, cache_key = %key, "Waiting for lock holder");
            }

            let now = Instant::now();
            if now >= deadline {
                return Resolution::Fallback;
            }
            tokio::time::sleep(backoff.next_delay().min(deadline - now)).await;

            if let Some(value) = self.get::<T>(key).await {
                counter!(METRIC_CACHE_HIT).increment(1);
                return Resolution::Hit(value);
            }
        }
    }

    async fn store_as_leader<T: Serialize>(
        &self,
        lease: &LeaseLock,
        key: &CacheKey,
        value: &T,
        ttl: Duration,
    ) -> StoreOutcome {
        let Some(encoded) = encode(key, value) else {
            return StoreOutcome::Skipped;
        };
        match lease
            .store_if_held(self.backend.as_ref(), key, &encoded, ttl)
            .await
        {
            Ok(true) => {
                self.mark_connected();
                StoreOutcome::Stored
            }
            Ok(false) => StoreOutcome::LeaseLost,
            Err(err) => {
                self.note_backend_error("set", Some(key), &err);
                StoreOutcome::Skipped
            }
        }
    }

    async fn release(&self, lease: LeaseLock, key: &CacheKey) {
        match lease.release(self.backend.as_ref()).await {
            Ok(true) => {}
            Ok(false) => {
                if self.mode == BackendMode::Active {
                    warn!(
                        target = TARGET,
                        cache_key = %key,
                        "Lease expired before release; computation outlived the lock"
                    );
                }
            }
            Err(err) => self.note_backend_error("release_lock", Some(key), &err),
        }
    }

    fn mark_connected(&self) {
        if self.mode == BackendMode::Active {
            self.connected.store(true, Ordering::Relaxed);
        }
    }

    fn remember_error(&self, err: &BackendError) {
        *rw_write(&self.last_error, TARGET, "remember_error") = Some(err.to_string());
    }

    fn note_backend_error(&self, op: &'static str, key: Option<&CacheKey>, err: &BackendError) {
        counter!(METRIC_CACHE_BACKEND_ERROR, "op" => op).increment(1);
        if matches!(err, BackendError::Unavailable(_) | BackendError::Timeout(_)) {
            self.connected.store(false, Ordering::Relaxed);
        }
        self.remember_error(err);
        warn!(
            target = TARGET,
            op,
            backend = self.backend.name(),
            cache_key = key.map(CacheKey::as_str),
            error = %err,
            "Cache backend call failed; treating as miss"
        );
    }
}

/// Gives a leader's lease back when its computation is dropped mid-flight.
struct ReleaseOnDrop {
    lease: Option<LeaseLock>,
    backend: Arc<dyn KvBackend>,
}

impl ReleaseOnDrop {
    fn new(lease: LeaseLock, backend: Arc<dyn KvBackend>) -> Self {
        Self {
            lease: Some(lease),
            backend,
        }
    }

    fn disarm(mut self) -> Option<LeaseLock> {
        self.lease.take()
    }
}

impl Drop for ReleaseOnDrop {
    fn drop(&mut self) {
        let Some(lease) = self.lease.take() else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let backend = self.backend.clone();
        runtime.spawn(async move {
            if let Err(err) = lease.release(backend.as_ref()).await {
                debug!(
                    target = TARGET,
                    error = %err,
                    "Could not release lease of cancelled computation"
                );
            }
        });
    }
}

fn encode<T: Serialize + ?Sized>(key: &CacheKey, value: &T) -> Option<String> {
    match serde_json::to_string(value) {
        Ok(encoded) => Some(encoded),
        Err(err) => {
            warn!(
                target = TARGET,
                cache_key = %key,
                error = %err,
                "Failed to encode cache entry"
            );
            None
        }
    }
}

async fn timed_compute<T, E, F, Fut>(compute: F) -> Result<T, E>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let started = Instant::now();
    let result = compute().await;
    histogram!(METRIC_CACHE_COMPUTE_MS).record(started.elapsed().as_secs_f64() * 1000.0);
    result
}
