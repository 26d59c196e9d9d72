//! Shared fixtures: an in-memory blog store with call counters and fault switches.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use quire::application::repos::{
    BlogsRepo, BlogsWriteRepo, CreateBlogParams, RepoError, StoreHealth, UpdateBlogParams,
};
use quire::cache::{BlogCacheService, CacheConfig, CacheManager, MemoryBackend};
use quire::domain::blogs::{BlogPage, BlogRecord, PageQuery};
use quire::domain::types::{BlogStatus, BlogVisibility, ListVisibility, SortField, SortOrder};
use time::OffsetDateTime;
use time::macros::datetime;

#[derive(Default)]
pub struct FakeBlogs {
    records: Mutex<BTreeMap<i64, BlogRecord>>,
    page_fetches: AtomicUsize,
    entity_fetches: AtomicUsize,
    delay_ms: AtomicUsize,
    failing: AtomicBool,
    snapshot_before_delay: AtomicBool,
}

impl FakeBlogs {
    pub fn with_records(records: impl IntoIterator<Item = BlogRecord>) -> Arc<Self> {
        let store = Self::default();
        {
            let mut map = store.records.lock().unwrap();
            for record in records {
                map.insert(record.id, record);
            }
        }
        Arc::new(store)
    }

    pub fn page_fetches(&self) -> usize {
        self.page_fetches.load(Ordering::SeqCst)
    }

    pub fn entity_fetches(&self) -> usize {
        self.entity_fetches.load(Ordering::SeqCst)
    }

    pub fn set_delay(&self, delay: Duration) {
        self.delay_ms
            .store(delay.as_millis() as usize, Ordering::SeqCst);
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Take the read snapshot before the simulated latency instead of after,
    /// so writes during the delay are invisible to the read in flight.
    pub fn set_snapshot_before_delay(&self, enabled: bool) {
        self.snapshot_before_delay.store(enabled, Ordering::SeqCst);
    }

    /// Change a record behind the cache's back.
    pub fn edit(&self, id: i64, edit: impl FnOnce(&mut BlogRecord)) {
        let mut map = self.records.lock().unwrap();
        edit(map.get_mut(&id).expect("record exists"));
    }

    async fn simulate_latency(&self) -> Result<(), RepoError> {
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay as u64)).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(RepoError::Timeout);
        }
        Ok(())
    }

    async fn read<T>(&self, read: impl Fn(&BTreeMap<i64, BlogRecord>) -> T) -> Result<T, RepoError> {
        if self.snapshot_before_delay.load(Ordering::SeqCst) {
            let snapshot = read(&self.records.lock().unwrap());
            self.simulate_latency().await?;
            return Ok(snapshot);
        }
        self.simulate_latency().await?;
        let found = read(&self.records.lock().unwrap());
        Ok(found)
    }
}

#[async_trait]
impl BlogsRepo for FakeBlogs {
    async fn fetch_page(&self, query: &PageQuery) -> Result<BlogPage, RepoError> {
        self.page_fetches.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await?;

        let map = self.records.lock().unwrap();
        let mut matching: Vec<BlogRecord> = map
            .values()
            .filter(|record| match query.visibility {
                ListVisibility::Public => record.is_publicly_visible(),
                ListVisibility::Private => !record.is_publicly_visible(),
                ListVisibility::All => true,
            })
            .cloned()
            .collect();
        matching.sort_by(|a, b| match query.sort_by {
            SortField::Title => a.title.cmp(&b.title),
            SortField::UpdatedAt => a.updated_at.cmp(&b.updated_at),
            SortField::CreatedAt => a.created_at.cmp(&b.created_at),
        });
        if query.sort_order == SortOrder::Desc {
            matching.reverse();
        }

        let total = matching.len() as u64;
        let items = matching
            .into_iter()
            .skip(query.offset() as usize)
            .take(query.limit as usize)
            .collect();
        Ok(BlogPage {
            items,
            total,
            page: query.page,
            limit: query.limit,
        })
    }

    async fn fetch_by_id(&self, id: i64) -> Result<Option<BlogRecord>, RepoError> {
        self.entity_fetches.fetch_add(1, Ordering::SeqCst);
        self.read(|map| map.get(&id).cloned()).await
    }

    async fn fetch_by_slug(&self, slug: &str) -> Result<Option<BlogRecord>, RepoError> {
        self.entity_fetches.fetch_add(1, Ordering::SeqCst);
        self.read(|map| {
            map.values()
                .find(|record| record.slug == slug)
                .cloned()
        })
        .await
    }
}

#[async_trait]
impl BlogsWriteRepo for FakeBlogs {
    async fn create_blog(&self, params: CreateBlogParams) -> Result<BlogRecord, RepoError> {
        let mut map = self.records.lock().unwrap();
        if map.values().any(|record| record.slug == params.slug) {
            return Err(RepoError::Duplicate {
                constraint: "blogs_slug_key".into(),
            });
        }
        let id = map.keys().next_back().copied().unwrap_or(0) + 1;
        let now = OffsetDateTime::now_utc();
        let record = BlogRecord {
            id,
            slug: params.slug,
            title: params.title,
            excerpt: params.excerpt,
            body: params.body,
            author: params.author,
            status: params.status,
            visibility: params.visibility,
            published_at: (params.status == BlogStatus::Published).then_some(now),
            created_at: now,
            updated_at: now,
        };
        map.insert(id, record.clone());
        Ok(record)
    }

    async fn update_blog(
        &self,
        params: UpdateBlogParams,
    ) -> Result<(BlogRecord, BlogRecord), RepoError> {
        let mut map = self.records.lock().unwrap();
        let record = map.get_mut(&params.id).ok_or(RepoError::NotFound)?;
        let previous = record.clone();
        record.slug = params.slug;
        record.title = params.title;
        record.excerpt = params.excerpt;
        record.body = params.body;
        record.status = params.status;
        record.visibility = params.visibility;
        record.updated_at = OffsetDateTime::now_utc();
        Ok((previous, record.clone()))
    }

    async fn delete_blog(&self, id: i64) -> Result<Option<BlogRecord>, RepoError> {
        Ok(self.records.lock().unwrap().remove(&id))
    }
}

#[async_trait]
impl StoreHealth for FakeBlogs {
    async fn health_check(&self) -> Result<(), RepoError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(RepoError::Timeout);
        }
        Ok(())
    }
}

pub fn blog(id: i64, slug: &str) -> BlogRecord {
    let created = datetime!(2025-01-01 0:00 UTC) + time::Duration::minutes(id.rem_euclid(100_000));
    BlogRecord {
        id,
        slug: slug.to_string(),
        title: format!("Blog {id}"),
        excerpt: String::new(),
        body: format!("Body of blog {id}"),
        author: "ada".to_string(),
        status: BlogStatus::Published,
        visibility: BlogVisibility::Public,
        published_at: Some(created),
        created_at: created,
        updated_at: created,
    }
}

pub fn draft(id: i64, slug: &str) -> BlogRecord {
    BlogRecord {
        status: BlogStatus::Draft,
        published_at: None,
        ..blog(id, slug)
    }
}

/// Memory-backed cache wiring around a fake store.
pub struct Harness {
    pub store: Arc<FakeBlogs>,
    pub backend: Arc<MemoryBackend>,
    pub cache: Arc<CacheManager>,
    pub service: BlogCacheService,
}

impl Harness {
    pub fn new(store: Arc<FakeBlogs>) -> Self {
        Self::with_config(store, CacheConfig::default())
    }

    pub fn with_config(store: Arc<FakeBlogs>, config: CacheConfig) -> Self {
        let backend = Arc::new(MemoryBackend::new());
        let cache = Arc::new(CacheManager::new(backend.clone(), &config));
        let service = BlogCacheService::new(cache.clone(), store.clone(), &config);
        Self {
            store,
            backend,
            cache,
            service,
        }
    }
}
