//! Blog read and write handlers.
//!
//! Reads go through the blog cache service. Writes go straight to the store
//! and tell the invalidation middleware what they touched via a response
//! marker.

use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};

use crate::application::error::AppError;
use crate::application::repos::{CreateBlogParams, UpdateBlogParams};
use crate::cache::{InvalidationMarker, InvalidationTarget};
use crate::domain::blogs::{BlogRecord, DEFAULT_PAGE_LIMIT, PageQuery};
use crate::domain::error::DomainError;
use crate::domain::types::{BlogStatus, BlogVisibility, ListVisibility, SortField, SortOrder};

use super::hooks::on_response_complete;
use super::{HttpState, repo_error_to_http};

const MAX_BULK_DELETE: usize = 500;

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub(super) struct ListParams {
    page: Option<u32>,
    limit: Option<u32>,
    sort_by: Option<String>,
    sort_order: Option<String>,
    visibility: Option<String>,
}

impl ListParams {
    fn into_query(self) -> Result<PageQuery, DomainError> {
        let sort_by = match self.sort_by.as_deref() {
            Some(value) => value.parse()?,
            None => SortField::default(),
        };
        let sort_order = match self.sort_order.as_deref() {
            Some(value) => value.parse()?,
            None => SortOrder::default(),
        };
        let visibility = match self.visibility.as_deref() {
            Some(value) => value.parse()?,
            None => ListVisibility::default(),
        };
        PageQuery::new(
            self.page.unwrap_or(1),
            self.limit.unwrap_or(DEFAULT_PAGE_LIMIT),
            sort_by,
            sort_order,
            visibility,
        )
    }
}

#[derive(Debug, Deserialize)]
pub(super) struct CreateBlogRequest {
    slug: String,
    title: String,
    #[serde(default)]
    excerpt: String,
    body: String,
    author: String,
    #[serde(default = "default_status")]
    status: BlogStatus,
    #[serde(default = "default_visibility")]
    visibility: BlogVisibility,
}

#[derive(Debug, Deserialize)]
pub(super) struct UpdateBlogRequest {
    slug: String,
    title: String,
    #[serde(default)]
    excerpt: String,
    body: String,
    status: BlogStatus,
    visibility: BlogVisibility,
}

#[derive(Debug, Deserialize)]
pub(super) struct BulkDeleteRequest {
    ids: Vec<i64>,
}

#[derive(Debug, Serialize)]
pub(super) struct BulkDeleteResponse {
    deleted: Vec<i64>,
    missing: Vec<i64>,
}

fn default_status() -> BlogStatus {
    BlogStatus::Draft
}

fn default_visibility() -> BlogVisibility {
    BlogVisibility::Public
}

fn require_text(field: &'static str, value: &str) -> Result<(), AppError> {
    if value.trim().is_empty() {
        return Err(AppError::validation(format!("{field} must not be empty")));
    }
    Ok(())
}

pub(super) async fn list_blogs(
    State(state): State<HttpState>,
    Query(params): Query<ListParams>,
) -> Result<Response, AppError> {
    let query = params.into_query()?;
    let page = state.blogs.get_paginated_list_cached(query).await?;
    Ok(Json(page).into_response())
}

pub(super) async fn blog_by_id(
    State(state): State<HttpState>,
    Path(id): Path<i64>,
) -> Result<Json<BlogRecord>, AppError> {
    state
        .blogs
        .get_by_id_cached(id)
        .await?
        .map(Json)
        .ok_or_else(|| DomainError::not_found("blog").into())
}

pub(super) async fn blog_by_slug(
    State(state): State<HttpState>,
    Path(slug): Path<String>,
) -> Result<Json<BlogRecord>, AppError> {
    state
        .blogs
        .get_by_slug_cached(&slug)
        .await?
        .map(Json)
        .ok_or_else(|| DomainError::not_found("blog").into())
}

pub(super) async fn create_blog(
    State(state): State<HttpState>,
    Json(request): Json<CreateBlogRequest>,
) -> Result<Response, Response> {
    for (field, value) in [
        ("slug", &request.slug),
        ("title", &request.title),
        ("body", &request.body),
        ("author", &request.author),
    ] {
        require_text(field, value).map_err(IntoResponse::into_response)?;
    }

    let created = state
        .writer
        .create_blog(CreateBlogParams {
            slug: request.slug,
            title: request.title,
            excerpt: request.excerpt,
            body: request.body,
            author: request.author,
            status: request.status,
            visibility: request.visibility,
        })
        .await
        .map_err(|err| repo_error_to_http("infra::http::blogs::create", err).into_response())?;

    // A new blog shifts every listing page.
    Ok((
        StatusCode::CREATED,
        Extension(InvalidationMarker::All),
        Json(created),
    )
        .into_response())
}

pub(super) async fn update_blog(
    State(state): State<HttpState>,
    Path(id): Path<i64>,
    Json(request): Json<UpdateBlogRequest>,
) -> Result<Response, Response> {
    require_text("slug", &request.slug).map_err(IntoResponse::into_response)?;
    require_text("title", &request.title).map_err(IntoResponse::into_response)?;

    let (previous, updated) = state
        .writer
        .update_blog(UpdateBlogParams {
            id,
            slug: request.slug,
            title: request.title,
            excerpt: request.excerpt,
            body: request.body,
            status: request.status,
            visibility: request.visibility,
        })
        .await
        .map_err(|err| repo_error_to_http("infra::http::blogs::update", err).into_response())?;

    let mut slugs = vec![previous.slug];
    if updated.slug != slugs[0] {
        slugs.push(updated.slug.clone());
    }

    Ok((
        Extension(InvalidationMarker::Entity { id, slugs }),
        Json(updated),
    )
        .into_response())
}

pub(super) async fn delete_blog(
    State(state): State<HttpState>,
    Path(id): Path<i64>,
) -> Result<Response, Response> {
    let removed = state
        .writer
        .delete_blog(id)
        .await
        .map_err(|err| repo_error_to_http("infra::http::blogs::delete", err).into_response())?;

    match removed {
        Some(blog) => Ok((
            StatusCode::NO_CONTENT,
            Extension(InvalidationMarker::Entity {
                id,
                slugs: vec![blog.slug],
            }),
        )
            .into_response()),
        None => Err(AppError::from(DomainError::not_found("blog")).into_response()),
    }
}

/// Delete many blogs, invalidating once at the end instead of per blog.
pub(super) async fn bulk_delete_blogs(
    State(state): State<HttpState>,
    Json(request): Json<BulkDeleteRequest>,
) -> Result<Response, Response> {
    if request.ids.is_empty() || request.ids.len() > MAX_BULK_DELETE {
        return Err(AppError::validation(format!(
            "ids must contain between 1 and {MAX_BULK_DELETE} entries"
        ))
        .into_response());
    }

    let mut deleted = Vec::new();
    let mut missing = Vec::new();
    let mut failure = None;
    for id in request.ids {
        match state.writer.delete_blog(id).await {
            Ok(Some(_)) => deleted.push(id),
            Ok(None) => missing.push(id),
            Err(err) => {
                failure = Some(err);
                break;
            }
        }
    }

    if let Some(err) = failure {
        // Whatever was deleted before the failure still has to leave the cache.
        if !deleted.is_empty() {
            state.invalidation.schedule(InvalidationTarget::All);
        }
        return Err(repo_error_to_http("infra::http::blogs::bulk_delete", err).into_response());
    }

    let touched = !deleted.is_empty();
    let response = (
        Extension(InvalidationMarker::Skip),
        Json(BulkDeleteResponse { deleted, missing }),
    )
        .into_response();
    if !touched {
        return Ok(response);
    }

    let scheduler = state.invalidation.clone();
    Ok(on_response_complete(response, move || {
        scheduler.schedule(InvalidationTarget::All);
    }))
}
