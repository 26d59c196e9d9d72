use axum::{
    Json,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Deserialize;

use crate::application::error::HttpError;
use crate::cache::InvalidationTarget;

use super::HttpState;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub(super) struct InvalidateRequest {
    id: Option<i64>,
    slug: Option<String>,
}

pub(super) async fn cache_stats(State(state): State<HttpState>) -> Response {
    Json(state.blogs.get_cache_stats().await).into_response()
}

pub(super) async fn cache_health(State(state): State<HttpState>) -> Response {
    let health = state.blogs.cache_health_check().await;
    let status = if health.healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(health)).into_response()
}

pub(super) async fn warm_cache(State(state): State<HttpState>) -> Response {
    Json(state.blogs.warm_up_cache().await).into_response()
}

/// Invalidate synchronously so operators see the outcome. An empty body drops everything.
pub(super) async fn invalidate_cache(
    State(state): State<HttpState>,
    body: Option<Json<InvalidateRequest>>,
) -> Response {
    let request = body.map(|Json(request)| request).unwrap_or_default();
    let target = match request.id {
        Some(id) => InvalidationTarget::Entity {
            id,
            slugs: request.slug.into_iter().collect(),
        },
        None => InvalidationTarget::All,
    };

    match state.invalidation.run(target).await {
        Ok(report) => Json(report).into_response(),
        Err(err) => HttpError::from_error(
            "infra::http::cache_admin::invalidate",
            StatusCode::SERVICE_UNAVAILABLE,
            "Cache invalidation failed",
            &err,
        )
        .into_response(),
    }
}
