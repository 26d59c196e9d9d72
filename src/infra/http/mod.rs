mod blogs;
mod cache_admin;
pub mod hooks;
mod middleware;

use std::sync::Arc;

use axum::{
    Router,
    extract::State,
    http::StatusCode,
    middleware as axum_middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
};

use crate::application::error::{ErrorReport, HttpError};
use crate::application::repos::{BlogsWriteRepo, RepoError, StoreHealth};
use crate::cache::{
    BlogCacheService, InvalidationScheduler, InvalidationState, invalidate_blog_writes,
};

pub use middleware::RequestContext;

#[derive(Clone)]
pub struct HttpState {
    pub blogs: BlogCacheService,
    pub writer: Arc<dyn BlogsWriteRepo>,
    pub store: Arc<dyn StoreHealth>,
    pub invalidation: InvalidationScheduler,
}

pub fn build_router(state: HttpState) -> Router {
    let invalidation = InvalidationState {
        scheduler: state.invalidation.clone(),
    };

    let blog_routes = Router::new()
        .route("/blogs", get(blogs::list_blogs).post(blogs::create_blog))
        .route("/blogs/bulk-delete", post(blogs::bulk_delete_blogs))
        .route("/blogs/slug/{slug}", get(blogs::blog_by_slug))
        .route(
            "/blogs/{id}",
            get(blogs::blog_by_id)
                .put(blogs::update_blog)
                .delete(blogs::delete_blog),
        )
        .layer(axum_middleware::from_fn_with_state(
            invalidation,
            invalidate_blog_writes,
        ));

    let operational_routes = Router::new()
        .route("/_cache/stats", get(cache_admin::cache_stats))
        .route("/_cache/health", get(cache_admin::cache_health))
        .route("/_cache/warm", post(cache_admin::warm_cache))
        .route("/_cache/invalidate", post(cache_admin::invalidate_cache))
        .route("/_health/db", get(db_health));

    blog_routes
        .merge(operational_routes)
        .with_state(state)
        .layer(axum_middleware::from_fn(middleware::log_responses))
        .layer(axum_middleware::from_fn(middleware::set_request_context))
}

async fn db_health(State(state): State<HttpState>) -> Response {
    db_health_response(state.store.health_check().await)
}

fn db_health_response(result: Result<(), RepoError>) -> Response {
    match result {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => {
            let mut response = StatusCode::SERVICE_UNAVAILABLE.into_response();
            ErrorReport::from_error(
                "infra::http::db_health",
                StatusCode::SERVICE_UNAVAILABLE,
                &err,
            )
            .attach(&mut response);
            response
        }
    }
}

/// Map a repository error to a consistent HTTP error response.
pub fn repo_error_to_http(source: &'static str, err: RepoError) -> HttpError {
    match err {
        RepoError::Duplicate { constraint } => {
            HttpError::new(source, StatusCode::CONFLICT, "Duplicate record", constraint)
        }
        RepoError::NotFound => HttpError::new(
            source,
            StatusCode::NOT_FOUND,
            "Resource not found",
            "resource not found",
        ),
        RepoError::InvalidInput { message } => {
            HttpError::new(source, StatusCode::BAD_REQUEST, "Invalid input", message)
        }
        RepoError::Timeout => HttpError::new(
            source,
            StatusCode::SERVICE_UNAVAILABLE,
            "Database timeout",
            "Database timeout",
        ),
        RepoError::Persistence(message) => HttpError::new(
            source,
            StatusCode::INTERNAL_SERVER_ERROR,
            "Persistence error",
            message,
        ),
    }
}
