use async_trait::async_trait;
use sqlx::{FromRow, QueryBuilder};
use time::OffsetDateTime;

use crate::application::repos::{
    BlogsRepo, BlogsWriteRepo, CreateBlogParams, RepoError, UpdateBlogParams,
};
use crate::domain::blogs::{BlogPage, BlogRecord, PageQuery};
use crate::domain::types::{BlogStatus, BlogVisibility};

use super::{PostgresRepositories, map_sqlx_error};

const BLOG_COLUMNS: &str = "b.id, b.slug, b.title, b.excerpt, b.body, b.author, b.status, \
     b.visibility, b.published_at, b.created_at, b.updated_at";

const RETURNING_COLUMNS: &str = "id, slug, title, excerpt, body, author, status, visibility, \
     published_at, created_at, updated_at";

#[derive(Debug, FromRow)]
struct BlogRow {
    id: i64,
    slug: String,
    title: String,
    excerpt: String,
    body: String,
    author: String,
    status: BlogStatus,
    visibility: BlogVisibility,
    published_at: Option<OffsetDateTime>,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl From<BlogRow> for BlogRecord {
    fn from(row: BlogRow) -> Self {
        Self {
            id: row.id,
            slug: row.slug,
            title: row.title,
            excerpt: row.excerpt,
            body: row.body,
            author: row.author,
            status: row.status,
            visibility: row.visibility,
            published_at: row.published_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[async_trait]
impl BlogsRepo for PostgresRepositories {
    async fn fetch_page(&self, query: &PageQuery) -> Result<BlogPage, RepoError> {
        let mut count_qb = QueryBuilder::new("SELECT COUNT(*) FROM blogs b WHERE 1=1");
        Self::apply_visibility(&mut count_qb, query.visibility);
        let total: i64 = count_qb
            .build_query_scalar()
            .fetch_one(self.pool())
            .await
            .map_err(map_sqlx_error)?;

        let mut qb = QueryBuilder::new(format!("SELECT {BLOG_COLUMNS} FROM blogs b WHERE 1=1"));
        Self::apply_visibility(&mut qb, query.visibility);
        Self::push_order(&mut qb, query.sort_by, query.sort_order);
        qb.push(" LIMIT ");
        qb.push_bind(i64::from(query.limit));
        qb.push(" OFFSET ");
        qb.push_bind(i64::try_from(query.offset()).unwrap_or(i64::MAX));

        let rows: Vec<BlogRow> = qb
            .build_query_as()
            .fetch_all(self.pool())
            .await
            .map_err(map_sqlx_error)?;

        Ok(BlogPage {
            items: rows.into_iter().map(BlogRecord::from).collect(),
            total: Self::convert_count(total)?,
            page: query.page,
            limit: query.limit,
        })
    }

    async fn fetch_by_id(&self, id: i64) -> Result<Option<BlogRecord>, RepoError> {
        let row = sqlx::query_as::<_, BlogRow>(&format!(
            "SELECT {BLOG_COLUMNS} FROM blogs b WHERE b.id = $1"
        ))
        .bind(id)
        .fetch_optional(self.pool())
        .await
        .map_err(map_sqlx_error)?;
        Ok(row.map(BlogRecord::from))
    }

    async fn fetch_by_slug(&self, slug: &str) -> Result<Option<BlogRecord>, RepoError> {
        let row = sqlx::query_as::<_, BlogRow>(&format!(
            "SELECT {BLOG_COLUMNS} FROM blogs b WHERE b.slug = $1"
        ))
        .bind(slug)
        .fetch_optional(self.pool())
        .await
        .map_err(map_sqlx_error)?;
        Ok(row.map(BlogRecord::from))
    }
}

#[async_trait]
impl BlogsWriteRepo for PostgresRepositories {
    async fn create_blog(&self, params: CreateBlogParams) -> Result<BlogRecord, RepoError> {
        let row = sqlx::query_as::<_, BlogRow>(&format!(
            "INSERT INTO blogs (slug, title, excerpt, body, author, status, visibility, published_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, CASE WHEN $6 = 'published'::blog_status THEN now() END) \
             RETURNING {RETURNING_COLUMNS}"
        ))
        .bind(&params.slug)
        .bind(&params.title)
        .bind(&params.excerpt)
        .bind(&params.body)
        .bind(&params.author)
        .bind(params.status)
        .bind(params.visibility)
        .fetch_one(self.pool())
        .await
        .map_err(map_sqlx_error)?;
        Ok(row.into())
    }

    async fn update_blog(
        &self,
        params: UpdateBlogParams,
    ) -> Result<(BlogRecord, BlogRecord), RepoError> {
        let mut tx = self.pool().begin().await.map_err(map_sqlx_error)?;

        let previous = sqlx::query_as::<_, BlogRow>(&format!(
            "SELECT {BLOG_COLUMNS} FROM blogs b WHERE b.id = $1 FOR UPDATE"
        ))
        .bind(params.id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(map_sqlx_error)?
        .ok_or(RepoError::NotFound)?;

        let updated = sqlx::query_as::<_, BlogRow>(&format!(
            "UPDATE blogs SET slug = $2, title = $3, excerpt = $4, body = $5, status = $6, \
             visibility = $7, updated_at = now(), \
             published_at = COALESCE(published_at, CASE WHEN $6 = 'published'::blog_status THEN now() END) \
             WHERE id = $1 RETURNING {RETURNING_COLUMNS}"
        ))
        .bind(params.id)
        .bind(&params.slug)
        .bind(&params.title)
        .bind(&params.excerpt)
        .bind(&params.body)
        .bind(params.status)
        .bind(params.visibility)
        .fetch_one(&mut *tx)
        .await
        .map_err(map_sqlx_error)?;

        tx.commit().await.map_err(map_sqlx_error)?;
        Ok((previous.into(), updated.into()))
    }

    async fn delete_blog(&self, id: i64) -> Result<Option<BlogRecord>, RepoError> {
        let row = sqlx::query_as::<_, BlogRow>(&format!(
            "DELETE FROM blogs WHERE id = $1 RETURNING {RETURNING_COLUMNS}"
        ))
        .bind(id)
        .fetch_optional(self.pool())
        .await
        .map_err(map_sqlx_error)?;
        Ok(row.map(BlogRecord::from))
    }
}
