//! Cache configuration.
//!
//! Controls backend selection, entry lifetimes and lock waiting. Built from
//! the resolved `[cache]` settings; the defaults below are also the ones the
//! settings loader falls back to.

use std::time::Duration;

use crate::config::{CacheBackendKind, CacheSettings};

pub(crate) mod defaults {
    pub(crate) const REDIS_URL: &str = "redis://127.0.0.1:6379";
    pub(crate) const OPERATION_TIMEOUT_MS: u64 = 250;
    pub(crate) const ENTITY_TTL_SECS: u64 = 300;
    pub(crate) const PAGE_TTL_SECS: u64 = 60;
    pub(crate) const LOCK_TTL_MS: u64 = 5_000;
    pub(crate) const BACKOFF_INITIAL_MS: u64 = 25;
    pub(crate) const BACKOFF_MAX_MS: u64 = 400;
    pub(crate) const SCAN_BATCH_SIZE: usize = 200;
    pub(crate) const WARMUP_PAGES: u32 = 2;
    pub(crate) const WARMUP_LIMIT: u32 = 10;
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// When false the manager runs on the no-op backend.
    pub enabled: bool,
    pub backend: CacheBackendKind,
    pub redis_url: String,
    /// Upper bound on any single backend call.
    pub operation_timeout_ms: u64,
    /// Lifetime of single-entity entries.
    pub entity_ttl_secs: u64,
    /// Lifetime of pagination entries.
    pub page_ttl_secs: u64,
    /// Lease of the per-key computation lock.
    pub lock_ttl_ms: u64,
    /// How long a waiter polls before computing uncached. Defaults to twice the lease.
    pub lock_wait_budget_ms: Option<u64>,
    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,
    /// Keys visited per scan call during pattern deletes.
    pub scan_batch_size: usize,
    pub warm_on_startup: bool,
    /// Number of leading public pages issued by a warm-up.
    pub warmup_pages: u32,
    pub warmup_limit: u32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            backend: CacheBackendKind::Memory,
            redis_url: defaults::REDIS_URL.to_string(),
            operation_timeout_ms: defaults::OPERATION_TIMEOUT_MS,
            entity_ttl_secs: defaults::ENTITY_TTL_SECS,
            page_ttl_secs: defaults::PAGE_TTL_SECS,
            lock_ttl_ms: defaults::LOCK_TTL_MS,
            lock_wait_budget_ms: None,
            backoff_initial_ms: defaults::BACKOFF_INITIAL_MS,
            backoff_max_ms: defaults::BACKOFF_MAX_MS,
            scan_batch_size: defaults::SCAN_BATCH_SIZE,
            warm_on_startup: false,
            warmup_pages: defaults::WARMUP_PAGES,
            warmup_limit: defaults::WARMUP_LIMIT,
        }
    }
}

impl From<&CacheSettings> for CacheConfig {
    fn from(settings: &CacheSettings) -> Self {
        Self {
            enabled: settings.enabled,
            backend: settings.backend,
            redis_url: settings.redis_url.clone(),
            operation_timeout_ms: duration_ms(settings.operation_timeout),
            entity_ttl_secs: settings.entity_ttl.as_secs(),
            page_ttl_secs: settings.page_ttl.as_secs(),
            lock_ttl_ms: duration_ms(settings.lock_ttl),
            lock_wait_budget_ms: Some(duration_ms(settings.lock_wait_budget)),
            backoff_initial_ms: duration_ms(settings.backoff_initial),
            backoff_max_ms: duration_ms(settings.backoff_max),
            scan_batch_size: settings.scan_batch_size.get(),
            warm_on_startup: settings.warm_on_startup,
            warmup_pages: settings.warmup_pages,
            warmup_limit: settings.warmup_limit,
        }
    }
}

/// How entries of one namespace are cached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachePolicy {
    pub entry_ttl: Duration,
    pub lock_ttl: Duration,
    /// Only publicly visible results may be stored.
    pub public_only: bool,
}

/// How a caller that lost the lock race waits for the winner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockWait {
    pub budget: Duration,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
}

impl CacheConfig {
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms.max(1))
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_millis(self.lock_ttl_ms.max(1))
    }

    pub fn entity_policy(&self) -> CachePolicy {
        CachePolicy {
            entry_ttl: Duration::from_secs(self.entity_ttl_secs.max(1)),
            lock_ttl: self.lock_ttl(),
            public_only: true,
        }
    }

    pub fn page_policy(&self) -> CachePolicy {
        CachePolicy {
            entry_ttl: Duration::from_secs(self.page_ttl_secs.max(1)),
            lock_ttl: self.lock_ttl(),
            public_only: true,
        }
    }

    pub fn lock_wait(&self) -> LockWait {
        let budget = self
            .lock_wait_budget_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.lock_ttl() * 2);
        LockWait {
            budget,
            backoff_initial: Duration::from_millis(self.backoff_initial_ms.max(1)),
            backoff_max: Duration::from_millis(self.backoff_max_ms.max(self.backoff_initial_ms)),
        }
    }

    /// Returns the scan batch size, clamping to 1 if zero.
    pub fn scan_batch_size_non_zero(&self) -> usize {
        self.scan_batch_size.max(1)
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_values() {
        let config = CacheConfig::default();
        assert!(config.enabled);
        assert_eq!(config.backend, CacheBackendKind::Memory);
        assert_eq!(config.entity_ttl_secs, 300);
        assert_eq!(config.page_ttl_secs, 60);
        assert_eq!(config.lock_ttl_ms, 5_000);
        assert_eq!(config.scan_batch_size, 200);
        assert_eq!(config.warmup_pages, 2);
        assert_eq!(config.warmup_limit, 10);
    }

    #[test]
    fn wait_budget_defaults_to_twice_the_lease() {
        let config = CacheConfig {
            lock_ttl_ms: 1_500,
            ..Default::default()
        };
        let wait = config.lock_wait();
        assert_eq!(wait.budget, Duration::from_millis(3_000));
        assert_eq!(wait.backoff_initial, Duration::from_millis(25));
        assert_eq!(wait.backoff_max, Duration::from_millis(400));
    }

    #[test]
    fn explicit_wait_budget_wins() {
        let config = CacheConfig {
            lock_wait_budget_ms: Some(750),
            ..Default::default()
        };
        assert_eq!(config.lock_wait().budget, Duration::from_millis(750));
    }

    #[test]
    fn policies_only_cache_public_results() {
        let config = CacheConfig::default();
        let entity = config.entity_policy();
        let page = config.page_policy();
        assert!(entity.public_only && page.public_only);
        assert_eq!(entity.entry_ttl, Duration::from_secs(300));
        assert_eq!(page.entry_ttl, Duration::from_secs(60));
        assert_eq!(page.lock_ttl, Duration::from_secs(5));
    }

    #[test]
    fn non_zero_clamps_to_min() {
        let config = CacheConfig {
            scan_batch_size: 0,
            ..Default::default()
        };
        assert_eq!(config.scan_batch_size_non_zero(), 1);
    }
}
