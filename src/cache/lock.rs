//! Lease locks and lock-wait backoff.
//!
//! A lease is an entry under the `lock:` prefix holding a random owner token.
//! It is created with an atomic set-if-absent carrying its own expiry, so a
//! holder that dies never wedges the key past the lease. Release deletes the
//! entry only while it still holds the holder's token, and the holder's
//! result is stored under the same condition, so revoking a lease also
//! discards whatever its holder was computing.
//!
//! The poison-recovering guard helpers at the bottom are shared by the
//! in-process backend.

use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use tracing::warn;
use uuid::Uuid;

use super::backend::{BackendError, KvBackend};
use super::keys::CacheKey;

/// Exclusive right to compute one cache entry, until released or expired.
#[derive(Debug)]
pub struct LeaseLock {
    key: String,
    token: String,
}

impl LeaseLock {
    /// Try to take the lease guarding `entry`. `Ok(None)` means someone else holds it.
    pub async fn try_acquire(
        backend: &dyn KvBackend,
        entry: &CacheKey,
        lease: Duration,
    ) -> Result<Option<Self>, BackendError> {
        let key = entry.lock_key();
        let token = Uuid::new_v4().to_string();
        if backend.set_if_absent(&key, &token, lease).await? {
            Ok(Some(Self { key, token }))
        } else {
            Ok(None)
        }
    }

    /// Whether any caller currently holds the lease for `entry`.
    pub async fn is_held(backend: &dyn KvBackend, entry: &CacheKey) -> Result<bool, BackendError> {
        Ok(backend.get(&entry.lock_key()).await?.is_some())
    }

    /// Store `value` under `entry` only while this lease is still held.
    /// Returns `false` when the lease expired or was revoked by invalidation.
    pub async fn store_if_held(
        &self,
        backend: &dyn KvBackend,
        entry: &CacheKey,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, BackendError> {
        backend
            .set_if_equals(&self.key, &self.token, entry.as_str(), value, ttl)
            .await
    }

    /// Give the lease back. Returns `false` when it had already expired or
    /// been taken over, in which case nothing is deleted.
    pub async fn release(self, backend: &dyn KvBackend) -> Result<bool, BackendError> {
        backend.delete_if_equals(&self.key, &self.token).await
    }
}

/// Bounded exponential backoff with jitter for lock waiters.
#[derive(Debug, Clone)]
pub struct Backoff {
    current: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        let initial = initial.max(Duration::from_millis(1));
        Self {
            current: initial,
            max: max.max(initial),
        }
    }

    /// Next delay: the current step plus up to half of it again as jitter.
    pub fn next_delay(&mut self) -> Duration {
        let step = self.current;
        let step_ms = u64::try_from(step.as_millis()).unwrap_or(u64::MAX);
        let jitter = Duration::from_millis(fastrand::u64(0..=step_ms / 2));
        self.current = (step * 2).min(self.max);
        (step + jitter).min(self.max)
    }
}

pub(crate) fn rw_read<'a, T>(
    lock: &'a RwLock<T>,
    target: &'static str,
    op: &'static str,
) -> RwLockReadGuard<'a, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poisoned) => {
            warn!(
                op,
                target_module = target,
                lock_kind = "rwlock.read",
                result = "poisoned_recovered",
                hint = "state may be stale after panic in another thread",
                "Recovered from poisoned cache lock"
            );
            poisoned.into_inner()
        }
    }
}

pub(crate) fn rw_write<'a, T>(
    lock: &'a RwLock<T>,
    target: &'static str,
    op: &'static str,
) -> RwLockWriteGuard<'a, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poisoned) => {
            warn!(
                op,
                target_module = target,
                lock_kind = "rwlock.write",
                result = "poisoned_recovered",
                hint = "state may be stale after panic in another thread",
                "Recovered from poisoned cache lock"
            );
            poisoned.into_inner()
        }
    }
}
