//! Write invalidation middleware.
//!
//! Wraps the blog routes. After a successful mutating request the affected
//! entries are invalidated on a detached task once the response body has been
//! sent, so invalidation never adds to response latency and its failures
//! never reach the client.
//!
//! The target is taken from, in order: an [`InvalidationMarker`] in the
//! response extensions (set by the handler), one in the request extensions
//! (set by an outer layer), then the request path. A path naming a blog id
//! invalidates that blog; any other blog path invalidates the whole namespace.

use axum::{
    body::Body,
    extract::State,
    http::{Method, Request},
    middleware::Next,
    response::Response,
};
use metrics::counter;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, error, instrument};

use super::backend::BackendError;
use super::keys::Namespace;
use super::service::{BlogCacheService, InvalidationReport};
use crate::infra::http::hooks::on_response_complete;

const TARGET: &str = "quire::cache::middleware";
const METRIC_CACHE_INVALIDATION: &str = "quire_cache_invalidation_total";

/// Route prefix whose mutations invalidate blog entries.
pub const BLOG_ROUTE_PREFIX: &str = "/blogs";

/// Explicit instruction for the invalidation middleware.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidationMarker {
    /// The request handles invalidation itself.
    Skip,
    Entity { id: i64, slugs: Vec<String> },
    All,
}

/// What a scheduled invalidation removes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidationTarget {
    /// One blog. With no known slugs the whole slug namespace is dropped.
    Entity { id: i64, slugs: Vec<String> },
    All,
}

impl InvalidationTarget {
    fn scope(&self) -> &'static str {
        match self {
            InvalidationTarget::Entity { .. } => "entity",
            InvalidationTarget::All => "all",
        }
    }
}

/// Runs invalidations off the request path.
#[derive(Clone)]
pub struct InvalidationScheduler {
    service: BlogCacheService,
    runtime: Handle,
}

impl InvalidationScheduler {
    pub fn new(service: BlogCacheService, runtime: Handle) -> Self {
        Self { service, runtime }
    }

    /// Fire and forget. Failures are logged and counted.
    pub fn schedule(&self, target: InvalidationTarget) -> JoinHandle<()> {
        let scheduler = self.clone();
        self.runtime.spawn(async move {
            let _ = scheduler.run(target).await;
        })
    }

    /// Invalidate now and report the outcome.
    pub async fn run(
        &self,
        target: InvalidationTarget,
    ) -> Result<InvalidationReport, BackendError> {
        let scope = target.scope();
        let result = match &target {
            InvalidationTarget::All => self.service.invalidate_all_blog_caches().await,
            InvalidationTarget::Entity { id, slugs } => self.invalidate_entity(*id, slugs).await,
        };

        match &result {
            Ok(report) => {
                counter!(METRIC_CACHE_INVALIDATION, "result" => "ok", "scope" => scope)
                    .increment(1);
                debug!(
                    target = TARGET,
                    scope,
                    keys_removed = report.keys_removed,
                    "Cache invalidation finished"
                );
            }
            Err(err) => {
                counter!(METRIC_CACHE_INVALIDATION, "result" => "failed", "scope" => scope)
                    .increment(1);
                error!(
                    target = TARGET,
                    scope,
                    invalidation = ?target,
                    error = %err,
                    "Cache invalidation failed"
                );
            }
        }
        result
    }

    async fn invalidate_entity(
        &self,
        id: i64,
        slugs: &[String],
    ) -> Result<InvalidationReport, BackendError> {
        if slugs.is_empty() {
            let mut report = self.service.invalidate_blog_cache(id, None).await?;
            report.keys_removed += self
                .service
                .invalidate_namespace(Namespace::BlogBySlug)
                .await?
                .keys_removed;
            return Ok(report);
        }

        let mut total = InvalidationReport::default();
        let mut first_error = None;
        for slug in slugs {
            match self.service.invalidate_blog_cache(id, Some(slug)).await {
                Ok(report) => total.keys_removed += report.keys_removed,
                Err(err) => {
                    first_error.get_or_insert(err);
                }
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(total),
        }
    }
}

#[derive(Clone)]
pub struct InvalidationState {
    pub scheduler: InvalidationScheduler,
}

/// Middleware scheduling cache invalidation after successful blog writes.
#[instrument(skip_all, fields(method = %request.method(), path = %request.uri().path()))]
pub async fn invalidate_blog_writes(
    State(state): State<InvalidationState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    if !is_mutation(request.method()) {
        return next.run(request).await;
    }

    let path = request.uri().path().to_string();
    let request_marker = request.extensions().get::<InvalidationMarker>().cloned();

    let response = next.run(request).await;
    if !response.status().is_success() {
        return response;
    }

    let marker = response
        .extensions()
        .get::<InvalidationMarker>()
        .cloned()
        .or(request_marker);

    let target = match marker {
        Some(InvalidationMarker::Skip) => {
            debug!(target = TARGET, "Request opted out of invalidation");
            return response;
        }
        Some(InvalidationMarker::Entity { id, slugs }) => InvalidationTarget::Entity { id, slugs },
        Some(InvalidationMarker::All) => InvalidationTarget::All,
        None => match target_from_path(&path) {
            Some(target) => target,
            None => return response,
        },
    };

    let scheduler = state.scheduler.clone();
    on_response_complete(response, move || {
        scheduler.schedule(target);
    })
}

fn is_mutation(method: &Method) -> bool {
    matches!(
        *method,
        Method::POST | Method::PUT | Method::PATCH | Method::DELETE
    )
}

/// Derive the invalidation target from a request path. `None` for non-blog paths.
pub fn target_from_path(path: &str) -> Option<InvalidationTarget> {
    let rest = path.strip_prefix(BLOG_ROUTE_PREFIX)?;
    if !(rest.is_empty() || rest.starts_with('/')) {
        return None;
    }

    let first = rest.split('/').find(|segment| !segment.is_empty());
    match first.map(str::parse::<i64>) {
        Some(Ok(id)) => Some(InvalidationTarget::Entity {
            id,
            slugs: Vec::new(),
        }),
        _ => Some(InvalidationTarget::All),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_with_numeric_id_targets_entity() {
        assert_eq!(
            target_from_path("/blogs/42"),
            Some(InvalidationTarget::Entity {
                id: 42,
                slugs: vec![]
            })
        );
        assert_eq!(
            target_from_path("/blogs/42/publish"),
            Some(InvalidationTarget::Entity {
                id: 42,
                slugs: vec![]
            })
        );
    }

    #[test]
    fn path_without_id_targets_everything() {
        assert_eq!(target_from_path("/blogs"), Some(InvalidationTarget::All));
        assert_eq!(target_from_path("/blogs/"), Some(InvalidationTarget::All));
        assert_eq!(
            target_from_path("/blogs/bulk-delete"),
            Some(InvalidationTarget::All)
        );
    }

    #[test]
    fn unrelated_paths_are_ignored() {
        assert_eq!(target_from_path("/users/1"), None);
        assert_eq!(target_from_path("/blogsmith"), None);
        assert_eq!(target_from_path("/_cache/warm"), None);
    }

    #[test]
    fn only_writes_are_mutations() {
        assert!(is_mutation(&Method::POST));
        assert!(is_mutation(&Method::DELETE));
        assert!(!is_mutation(&Method::GET));
        assert!(!is_mutation(&Method::HEAD));
    }
}
