//! Repository traits describing persistence adapters.
//!
//! The cache layer only reads through [`BlogsRepo`]; writes go through
//! [`BlogsWriteRepo`] and are followed by cache invalidation.

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::blogs::{BlogPage, BlogRecord, PageQuery};
use crate::domain::types::{BlogStatus, BlogVisibility};

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("persistence error: {0}")]
    Persistence(String),
    #[error("duplicate record violates unique constraint `{constraint}`")]
    Duplicate { constraint: String },
    #[error("resource not found")]
    NotFound,
    #[error("invalid input: {message}")]
    InvalidInput { message: String },
    #[error("database timeout")]
    Timeout,
}

impl RepoError {
    pub fn from_persistence(err: impl std::fmt::Display) -> Self {
        Self::Persistence(err.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct CreateBlogParams {
    pub slug: String,
    pub title: String,
    pub excerpt: String,
    pub body: String,
    pub author: String,
    pub status: BlogStatus,
    pub visibility: BlogVisibility,
}

#[derive(Debug, Clone)]
pub struct UpdateBlogParams {
    pub id: i64,
    pub slug: String,
    pub title: String,
    pub excerpt: String,
    pub body: String,
    pub status: BlogStatus,
    pub visibility: BlogVisibility,
}

/// Read accessor over the blog store.
#[async_trait]
pub trait BlogsRepo: Send + Sync {
    async fn fetch_page(&self, query: &PageQuery) -> Result<BlogPage, RepoError>;

    async fn fetch_by_id(&self, id: i64) -> Result<Option<BlogRecord>, RepoError>;

    async fn fetch_by_slug(&self, slug: &str) -> Result<Option<BlogRecord>, RepoError>;
}

#[async_trait]
pub trait BlogsWriteRepo: Send + Sync {
    async fn create_blog(&self, params: CreateBlogParams) -> Result<BlogRecord, RepoError>;

    /// Returns the previous and the updated record so callers can invalidate both slugs.
    async fn update_blog(
        &self,
        params: UpdateBlogParams,
    ) -> Result<(BlogRecord, BlogRecord), RepoError>;

    /// Returns the removed record, or `None` when nothing matched.
    async fn delete_blog(&self, id: i64) -> Result<Option<BlogRecord>, RepoError>;
}

/// Liveness check of the backing store.
#[async_trait]
pub trait StoreHealth: Send + Sync {
    async fn health_check(&self) -> Result<(), RepoError>;
}
