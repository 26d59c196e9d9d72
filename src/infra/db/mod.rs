//! Postgres-backed repository implementations.

mod blogs;
mod util;

pub use util::map_sqlx_error;

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::{
    Postgres, QueryBuilder,
    migrate::MigrateError,
    postgres::{PgPool, PgPoolOptions},
    query,
};

use crate::application::repos::{RepoError, StoreHealth};
use crate::domain::types::{BlogStatus, BlogVisibility, ListVisibility, SortField, SortOrder};

#[derive(Clone)]
pub struct PostgresRepositories {
    pool: Arc<PgPool>,
}

impl PostgresRepositories {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn connect(url: &str, max_connections: u32) -> Result<PgPool, sqlx::Error> {
        PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
    }

    pub async fn run_migrations(pool: &PgPool) -> Result<(), MigrateError> {
        sqlx::migrate!("./migrations").run(pool).await
    }

    fn apply_visibility<'q>(qb: &mut QueryBuilder<'q, Postgres>, visibility: ListVisibility) {
        match visibility {
            ListVisibility::Public => {
                qb.push(" AND b.status = ");
                qb.push_bind(BlogStatus::Published);
                qb.push(" AND b.visibility = ");
                qb.push_bind(BlogVisibility::Public);
            }
            ListVisibility::Private => {
                qb.push(" AND NOT (b.status = ");
                qb.push_bind(BlogStatus::Published);
                qb.push(" AND b.visibility = ");
                qb.push_bind(BlogVisibility::Public);
                qb.push(")");
            }
            ListVisibility::All => {}
        }
    }

    /// Column and direction come from closed enums, so they are pushed as SQL text.
    fn push_order(qb: &mut QueryBuilder<'_, Postgres>, sort_by: SortField, order: SortOrder) {
        let column = match sort_by {
            SortField::CreatedAt => "b.created_at",
            SortField::UpdatedAt => "b.updated_at",
            SortField::Title => "b.title",
        };
        let direction = match order {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        };
        qb.push(format!(" ORDER BY {column} {direction}, b.id {direction} "));
    }

    fn convert_count(value: i64) -> Result<u64, RepoError> {
        value
            .try_into()
            .map_err(|_| RepoError::from_persistence("count exceeds supported range"))
    }
}

#[async_trait]
impl StoreHealth for PostgresRepositories {
    async fn health_check(&self) -> Result<(), RepoError> {
        query("SELECT 1")
            .execute(self.pool())
            .await
            .map(|_| ())
            .map_err(map_sqlx_error)
    }
}
