//! Blog entities and list queries.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use super::error::DomainError;
use super::types::{BlogStatus, BlogVisibility, ListVisibility, SortField, SortOrder};

pub const DEFAULT_PAGE_LIMIT: u32 = 10;
pub const MAX_PAGE_LIMIT: u32 = 100;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlogRecord {
    pub id: i64,
    pub slug: String,
    pub title: String,
    pub excerpt: String,
    pub body: String,
    pub author: String,
    pub status: BlogStatus,
    pub visibility: BlogVisibility,
    #[serde(with = "time::serde::rfc3339::option")]
    pub published_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl BlogRecord {
    /// Whether anonymous readers may see this blog.
    pub fn is_publicly_visible(&self) -> bool {
        self.status == BlogStatus::Published && self.visibility == BlogVisibility::Public
    }
}

/// Offset pagination over the blog listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PageQuery {
    pub page: u32,
    pub limit: u32,
    pub sort_by: SortField,
    pub sort_order: SortOrder,
    pub visibility: ListVisibility,
}

impl PageQuery {
    pub fn new(
        page: u32,
        limit: u32,
        sort_by: SortField,
        sort_order: SortOrder,
        visibility: ListVisibility,
    ) -> Result<Self, DomainError> {
        if page == 0 {
            return Err(DomainError::validation("page must be at least 1"));
        }
        if limit == 0 || limit > MAX_PAGE_LIMIT {
            return Err(DomainError::validation(format!(
                "limit must be between 1 and {MAX_PAGE_LIMIT}"
            )));
        }

        Ok(Self {
            page,
            limit,
            sort_by,
            sort_order,
            visibility,
        })
    }

    /// First page of public blogs, newest first.
    pub fn public_first_page(limit: u32) -> Self {
        Self {
            page: 1,
            limit: limit.clamp(1, MAX_PAGE_LIMIT),
            sort_by: SortField::CreatedAt,
            sort_order: SortOrder::Desc,
            visibility: ListVisibility::Public,
        }
    }

    pub fn offset(&self) -> u64 {
        u64::from(self.page.saturating_sub(1)) * u64::from(self.limit)
    }
}

impl Default for PageQuery {
    fn default() -> Self {
        Self::public_first_page(DEFAULT_PAGE_LIMIT)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlogPage {
    pub items: Vec<BlogRecord>,
    pub total: u64,
    pub page: u32,
    pub limit: u32,
}

impl BlogPage {
    pub fn total_pages(&self) -> u64 {
        if self.limit == 0 {
            return 0;
        }
        self.total.div_ceil(u64::from(self.limit))
    }
}
