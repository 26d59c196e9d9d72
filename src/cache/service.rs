//! Blog caching policy on top of the cache manager.
//!
//! Only publicly visible data is ever stored. Listing requests for anything
//! but the public view skip the cache entirely; single-blog lookups are
//! fetched first and stored only when the fetched record turns out to be
//! public, since visibility is a property of the data.

use std::sync::Arc;

use futures::future::join_all;
use metrics::histogram;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::backend::BackendError;
use super::config::{CacheConfig, CachePolicy};
use super::keys::{CacheKey, Namespace, blog_namespace_pattern};
use super::manager::{CacheManager, CacheStatus};
use crate::application::repos::{BlogsRepo, RepoError};
use crate::domain::blogs::{BlogPage, BlogRecord, PageQuery};
use crate::domain::types::{ListVisibility, SortField, SortOrder};

const TARGET: &str = "quire::cache::service";
const METRIC_CACHE_WARM_MS: &str = "quire_cache_warm_ms";
const HEALTH_CHECK_PREFIX: &str = "health:check:";
const HEALTH_CHECK_TTL: std::time::Duration = std::time::Duration::from_secs(10);

/// Which of the leading public pages a warm-up issues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WarmupPlan {
    pub pages: u32,
    pub limit: u32,
}

impl WarmupPlan {
    pub fn queries(&self) -> Vec<PageQuery> {
        (1..=self.pages)
            .filter_map(|page| {
                PageQuery::new(
                    page,
                    self.limit,
                    SortField::CreatedAt,
                    SortOrder::Desc,
                    ListVisibility::Public,
                )
                .ok()
            })
            .collect()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WarmupReport {
    pub warmed: usize,
    pub failed: usize,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct NamespaceStats {
    pub namespace: &'static str,
    pub pattern: String,
    /// `None` when the backend could not be scanned.
    pub keys: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub status: CacheStatus,
    pub namespaces: Vec<NamespaceStats>,
    pub total_keys: u64,
}

/// Result of the write-read-delete self test.
#[derive(Debug, Clone, Serialize)]
pub struct CacheHealth {
    pub healthy: bool,
    pub connected: bool,
    pub backend: &'static str,
    pub write_ok: bool,
    pub read_ok: bool,
    pub delete_ok: bool,
    pub latency_ms: u64,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct InvalidationReport {
    pub keys_removed: u64,
}

#[derive(Clone)]
pub struct BlogCacheService {
    cache: Arc<CacheManager>,
    reader: Arc<dyn BlogsRepo>,
    entity_policy: CachePolicy,
    page_policy: CachePolicy,
    warmup: WarmupPlan,
}

impl BlogCacheService {
    pub fn new(cache: Arc<CacheManager>, reader: Arc<dyn BlogsRepo>, config: &CacheConfig) -> Self {
        Self {
            cache,
            reader,
            entity_policy: config.entity_policy(),
            page_policy: config.page_policy(),
            warmup: WarmupPlan {
                pages: config.warmup_pages,
                limit: config.warmup_limit,
            },
        }
    }

    pub async fn get_paginated_list_cached(&self, query: PageQuery) -> Result<BlogPage, RepoError> {
        if self.page_policy.public_only && !query.visibility.is_public() {
            return self.reader.fetch_page(&query).await;
        }

        let key = CacheKey::blog_page(&query);
        let reader = &self.reader;
        self.cache
            .get_with_lock_if(
                &key,
                self.page_policy,
                |page: &BlogPage| page.items.iter().all(BlogRecord::is_publicly_visible),
                || reader.fetch_page(&query),
            )
            .await
    }

    pub async fn get_by_id_cached(&self, id: i64) -> Result<Option<BlogRecord>, RepoError> {
        let key = CacheKey::blog_by_id(id);
        let reader = &self.reader;
        self.lookup(&key, || reader.fetch_by_id(id)).await
    }

    pub async fn get_by_slug_cached(&self, slug: &str) -> Result<Option<BlogRecord>, RepoError> {
        let key = match CacheKey::blog_by_slug(slug) {
            Ok(key) => key,
            Err(err) => {
                debug!(
                    target = TARGET,
                    error = %err,
                    "Slug cannot be keyed; reading from the store"
                );
                return self.reader.fetch_by_slug(slug).await;
            }
        };
        let reader = &self.reader;
        self.lookup(&key, || reader.fetch_by_slug(slug)).await
    }

    async fn lookup<F, Fut>(&self, key: &CacheKey, fetch: F) -> Result<Option<BlogRecord>, RepoError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<Option<BlogRecord>, RepoError>>,
    {
        let policy = self.entity_policy;
        let record = self
            .cache
            .get_with_lock_if(
                key,
                policy,
                |record: &Option<BlogRecord>| {
                    record
                        .as_ref()
                        .is_some_and(|record| !policy.public_only || record.is_publicly_visible())
                },
                fetch,
            )
            .await?;

        // A public copy may linger from before the record went private.
        let private = record
            .as_ref()
            .is_some_and(|found| !found.is_publicly_visible());
        if policy.public_only && private {
            self.cache.delete(key).await;
        }
        Ok(record)
    }

    /// Drop everything that may reflect blog `id`: its id and slug entries and every listing page.
    ///
    /// Leases on those keys are revoked too, so reads already in flight
    /// return their result without caching it.
    pub async fn invalidate_blog_cache(
        &self,
        id: i64,
        slug: Option<&str>,
    ) -> Result<InvalidationReport, BackendError> {
        let mut report = InvalidationReport::default();
        let mut first_error: Option<BackendError> = None;

        let mut entity_keys = vec![CacheKey::blog_by_id(id)];
        if let Some(slug) = slug {
            match CacheKey::blog_by_slug(slug) {
                Ok(key) => entity_keys.push(key),
                Err(err) => debug!(
                    target = TARGET,
                    blog_id = id,
                    error = %err,
                    "Slug was never cached; skipping its key"
                ),
            }
        }

        for key in &entity_keys {
            match self.cache.try_invalidate(key).await {
                Ok(existed) => report.keys_removed += u64::from(existed),
                Err(err) => {
                    first_error.get_or_insert(err);
                }
            }
        }

        match self
            .cache
            .try_invalidate_pattern(&Namespace::BlogPage.pattern())
            .await
        {
            Ok(removed) => report.keys_removed += removed,
            Err(err) => {
                first_error.get_or_insert(err);
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => {
                debug!(
                    target = TARGET,
                    blog_id = id,
                    keys_removed = report.keys_removed,
                    "Invalidated blog cache"
                );
                Ok(report)
            }
        }
    }

    /// Drop every blog-derived entry.
    pub async fn invalidate_all_blog_caches(&self) -> Result<InvalidationReport, BackendError> {
        let keys_removed = self
            .cache
            .try_invalidate_pattern(&blog_namespace_pattern())
            .await?;
        debug!(target = TARGET, keys_removed, "Invalidated all blog caches");
        Ok(InvalidationReport { keys_removed })
    }

    /// Drop every entry of one namespace.
    pub async fn invalidate_namespace(
        &self,
        namespace: Namespace,
    ) -> Result<InvalidationReport, BackendError> {
        let keys_removed = self
            .cache
            .try_invalidate_pattern(&namespace.pattern())
            .await?;
        Ok(InvalidationReport { keys_removed })
    }

    /// Issue the known-hot listing queries through the cached path.
    pub async fn warm_up_cache(&self) -> WarmupReport {
        let started = Instant::now();
        let queries = self.warmup.queries();
        let results = join_all(
            queries
                .iter()
                .map(|query| self.get_paginated_list_cached(*query)),
        )
        .await;

        let mut report = WarmupReport {
            warmed: 0,
            failed: 0,
            elapsed_ms: 0,
        };
        for (query, result) in queries.iter().zip(results) {
            match result {
                Ok(_) => report.warmed += 1,
                Err(err) => {
                    report.failed += 1;
                    warn!(
                        target = TARGET,
                        page = query.page,
                        limit = query.limit,
                        error = %err,
                        "Warm-up query failed"
                    );
                }
            }
        }

        let elapsed = started.elapsed();
        report.elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
        histogram!(METRIC_CACHE_WARM_MS).record(elapsed.as_secs_f64() * 1000.0);
        info!(
            target = TARGET,
            warmed = report.warmed,
            failed = report.failed,
            elapsed_ms = report.elapsed_ms,
            "Cache warm-up finished"
        );
        report
    }

    pub async fn get_cache_stats(&self) -> CacheStats {
        let mut namespaces = Vec::with_capacity(Namespace::ALL.len());
        let mut total_keys = 0;
        for namespace in Namespace::ALL {
            let pattern = namespace.pattern();
            let keys = self.cache.count_pattern(&pattern).await.ok();
            total_keys += keys.unwrap_or(0);
            namespaces.push(NamespaceStats {
                namespace: namespace.label(),
                pattern,
                keys,
            });
        }

        CacheStats {
            status: self.cache.status(),
            namespaces,
            total_keys,
        }
    }

    /// Write a sentinel entry, read it back and delete it.
    pub async fn cache_health_check(&self) -> CacheHealth {
        let started = Instant::now();
        let connected = self.cache.ping().await;
        let sentinel_value = Uuid::new_v4().to_string();
        let sentinel = CacheKey::from_raw(format!("{HEALTH_CHECK_PREFIX}{sentinel_value}"));

        let write_ok = self.cache.set(&sentinel, &sentinel_value, HEALTH_CHECK_TTL).await;
        let read_ok = write_ok
            && self
                .cache
                .get::<String>(&sentinel)
                .await
                .is_some_and(|value| value == sentinel_value);
        let delete_result = self.cache.try_delete(&sentinel).await;
        let delete_ok = matches!(delete_result, Ok(true));

        let error = match (&delete_result, write_ok, read_ok) {
            (Err(err), _, _) => Some(err.to_string()),
            (_, false, _) => Some("sentinel write failed".to_string()),
            (_, true, false) => Some("sentinel read returned a different value".to_string()),
            _ => None,
        };

        let healthy = connected && write_ok && read_ok && delete_ok;
        if !healthy {
            warn!(
                target = TARGET,
                backend = self.cache.backend_name(),
                connected,
                write_ok,
                read_ok,
                delete_ok,
                "Cache health check failed"
            );
        }

        CacheHealth {
            healthy,
            connected,
            backend: self.cache.backend_name(),
            write_ok,
            read_ok,
            delete_ok,
            latency_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn warmup_plan_issues_leading_public_pages() {
        let plan = WarmupPlan { pages: 2, limit: 10 };
        let keys: Vec<String> = plan
            .queries()
            .iter()
            .map(|q| CacheKey::blog_page(q).to_string())
            .collect();
        assert_eq!(
            keys,
            vec![
                "blog:page:public:1:10:createdAt:desc",
                "blog:page:public:2:10:createdAt:desc",
            ]
        );
    }

    #[test]
    fn warmup_plan_skips_invalid_limits() {
        let plan = WarmupPlan { pages: 3, limit: 0 };
        assert!(plan.queries().is_empty());
    }
}
