//! Quire cache system
//!
//! A read-through cache in front of the blog store:
//!
//! - **Keys** ([`CacheKey`]): canonical, unambiguous keys per query
//! - **Manager** ([`CacheManager`]): JSON get/set/delete over a
//!   [`KvBackend`], pattern deletes by cursor, and the stampede-safe
//!   [`CacheManager::get_with_lock`]
//! - **Service** ([`BlogCacheService`]): blog caching policy, warm-up,
//!   stats and health
//! - **Middleware** ([`invalidate_blog_writes`]): post-response invalidation
//!   of blog writes
//!
//! ## Configuration
//!
//! ```toml
//! [cache]
//! enabled = true
//! backend = "redis"          # or "memory"
//! redis_url = "redis://127.0.0.1:6379"
//! entity_ttl_secs = 300
//! page_ttl_secs = 60
//! lock_ttl_ms = 5000
//! # ... see config.rs for all options
//! ```

mod backend;
mod config;
mod keys;
mod lock;
mod manager;
mod memory;
mod middleware;
mod redis;
mod service;

pub use backend::{BackendError, KvBackend, NoopBackend, ScanCursor, ScanPage};
pub use config::{CacheConfig, CachePolicy, LockWait};
pub(crate) use config::defaults;
pub use keys::{
    BLOG_NAMESPACE, CacheKey, KeyError, KeyPart, LOCK_PREFIX, Namespace, blog_namespace_pattern,
};
pub use lock::{Backoff, LeaseLock};
pub use manager::{BackendMode, CacheManager, CacheStatus};
pub use memory::MemoryBackend;
pub use middleware::{
    BLOG_ROUTE_PREFIX, InvalidationMarker, InvalidationScheduler, InvalidationState,
    InvalidationTarget, invalidate_blog_writes, target_from_path,
};
pub use redis::RedisBackend;
pub use service::{
    BlogCacheService, CacheHealth, CacheStats, InvalidationReport, NamespaceStats, WarmupPlan,
    WarmupReport,
};
