//! In-process key-value backend.
//!
//! Entries live in an ordered map so scans can resume after the last key they
//! returned, which keeps cursor iteration stable while the caller deletes the
//! keys it was handed. Expiry is lazy: expired entries are invisible to reads
//! and swept periodically on writes.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use super::backend::{BackendError, KvBackend, ScanCursor, ScanPage};
use super::lock::{rw_read, rw_write};

const SOURCE: &str = "cache::memory";
const SWEEP_EVERY_WRITES: u64 = 512;

#[derive(Debug, Clone)]
struct MemoryEntry {
    value: String,
    expires_at: Instant,
}

impl MemoryEntry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

/// Ordered in-memory store with per-entry expiry.
pub struct MemoryBackend {
    entries: RwLock<BTreeMap<String, MemoryEntry>>,
    online: AtomicBool,
    writes: AtomicU64,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(BTreeMap::new()),
            online: AtomicBool::new(true),
            writes: AtomicU64::new(0),
        }
    }

    /// Simulate losing or regaining the backend. While offline every call fails.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// Number of live entries, locks included.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        rw_read(&self.entries, SOURCE, "len")
            .values()
            .filter(|entry| entry.is_live(now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn ensure_online(&self) -> Result<(), BackendError> {
        if self.online.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BackendError::unavailable("memory backend is offline"))
        }
    }

    fn note_write(&self, entries: &mut BTreeMap<String, MemoryEntry>) {
        let count = self.writes.fetch_add(1, Ordering::Relaxed) + 1;
        if count % SWEEP_EVERY_WRITES == 0 {
            let now = Instant::now();
            entries.retain(|_, entry| entry.is_live(now));
        }
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KvBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Option<String>, BackendError> {
        self.ensure_online()?;
        let now = Instant::now();
        Ok(rw_read(&self.entries, SOURCE, "get")
            .get(key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.value.clone()))
    }

    async fn set_with_ttl(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<(), BackendError> {
        self.ensure_online()?;
        let mut entries = rw_write(&self.entries, SOURCE, "set_with_ttl");
        entries.insert(
            key.to_string(),
            MemoryEntry {
                value: value.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
        self.note_write(&mut entries);
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, BackendError> {
        self.ensure_online()?;
        let now = Instant::now();
        let mut entries = rw_write(&self.entries, SOURCE, "set_if_absent");
        if entries.get(key).is_some_and(|entry| entry.is_live(now)) {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            MemoryEntry {
                value: value.to_string(),
                expires_at: now + ttl,
            },
        );
        self.note_write(&mut entries);
        Ok(true)
    }

    async fn set_if_equals(
        &self,
        guard: &str,
        expected: &str,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, BackendError> {
        self.ensure_online()?;
        let now = Instant::now();
        let mut entries = rw_write(&self.entries, SOURCE, "set_if_equals");
        let owned = entries
            .get(guard)
            .is_some_and(|entry| entry.is_live(now) && entry.value == expected);
        if owned {
            entries.insert(
                key.to_string(),
                MemoryEntry {
                    value: value.to_string(),
                    expires_at: now + ttl,
                },
            );
            self.note_write(&mut entries);
        }
        Ok(owned)
    }

    async fn delete(&self, key: &str) -> Result<bool, BackendError> {
        self.ensure_online()?;
        let now = Instant::now();
        Ok(rw_write(&self.entries, SOURCE, "delete")
            .remove(key)
            .is_some_and(|entry| entry.is_live(now)))
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool, BackendError> {
        self.ensure_online()?;
        let now = Instant::now();
        let mut entries = rw_write(&self.entries, SOURCE, "delete_if_equals");
        let owned = entries
            .get(key)
            .is_some_and(|entry| entry.is_live(now) && entry.value == expected);
        if owned {
            entries.remove(key);
        }
        Ok(owned)
    }

    async fn delete_many(&self, keys: &[String]) -> Result<u64, BackendError> {
        self.ensure_online()?;
        let now = Instant::now();
        let mut entries = rw_write(&self.entries, SOURCE, "delete_many");
        let removed = keys
            .iter()
            .filter_map(|key| entries.remove(key))
            .filter(|entry| entry.is_live(now))
            .count();
        Ok(removed as u64)
    }

    async fn scan(
        &self,
        pattern: &str,
        cursor: Option<ScanCursor>,
        batch: usize,
    ) -> Result<ScanPage, BackendError> {
        self.ensure_online()?;
        let now = Instant::now();
        let batch = batch.max(1);
        let entries = rw_read(&self.entries, SOURCE, "scan");

        let lower = match cursor {
            Some(ScanCursor(after)) => Bound::Excluded(after),
            None => Bound::Unbounded,
        };

        let mut page = ScanPage::default();
        let mut visited = 0usize;
        let mut range = entries.range::<String, _>((lower, Bound::Unbounded)).peekable();
        while let Some((key, entry)) = range.next() {
            visited += 1;
            if entry.is_live(now) && glob_match(pattern, key) {
                page.keys.push(key.clone());
            }
            if visited >= batch {
                if range.peek().is_some() {
                    page.next = Some(ScanCursor(key.clone()));
                }
                break;
            }
        }
        Ok(page)
    }

    async fn ping(&self) -> Result<(), BackendError> {
        self.ensure_online()
    }

    async fn close(&self) {
        self.set_online(false);
        rw_write(&self.entries, SOURCE, "close").clear();
    }
}

/// Match `text` against a glob supporting `*`, `?` and `\` escapes.
pub(crate) fn glob_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();

    let (mut p, mut t) = (0usize, 0usize);
    let mut star: Option<(usize, usize)> = None;

    while t < text.len() {
        match pattern.get(p) {
            Some('*') => {
                star = Some((p, t));
                p += 1;
                continue;
            }
            Some('?') => {
                p += 1;
                t += 1;
                continue;
            }
            Some('\\') if pattern.get(p + 1) == Some(&text[t]) => {
                p += 2;
                t += 1;
                continue;
            }
            Some(c) if *c != '\\' && *c == text[t] => {
                p += 1;
                t += 1;
                continue;
            }
            _ => {}
        }

        match star {
            Some((star_p, star_t)) => {
                p = star_p + 1;
                t = star_t + 1;
                star = Some((star_p, star_t + 1));
            }
            None => return false,
        }
    }

    pattern[p..].iter().all(|c| *c == '*')
}

#[cfg(test)]
mod tests {
    use std::panic::{AssertUnwindSafe, catch_unwind};

    use super::*;

    #[test]
    fn glob_matching() {
        assert!(glob_match("blog:*", "blog:id:1"));
        assert!(glob_match("blog:page:*", "blog:page:public:1:10:createdAt:desc"));
        assert!(!glob_match("blog:page:*", "blog:id:1"));
        assert!(!glob_match("blog:*", "lock:blog:id:1"));
        assert!(glob_match("blog:id:?", "blog:id:7"));
        assert!(!glob_match("blog:id:?", "blog:id:42"));
        assert!(glob_match("a\\*b", "a*b"));
        assert!(!glob_match("a\\*b", "axb"));
        assert!(glob_match("*", ""));
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire_after_ttl() {
        let backend = MemoryBackend::new();
        backend
            .set_with_ttl("blog:id:1", "v", Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(backend.get("blog:id:1").await.unwrap().as_deref(), Some("v"));

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(backend.get("blog:id:1").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn set_if_absent_respects_live_entries_only() {
        let backend = MemoryBackend::new();
        let ttl = Duration::from_secs(1);
        assert!(backend.set_if_absent("lock:k", "a", ttl).await.unwrap());
        assert!(!backend.set_if_absent("lock:k", "b", ttl).await.unwrap());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(backend.set_if_absent("lock:k", "b", ttl).await.unwrap());
        assert_eq!(backend.get("lock:k").await.unwrap().as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn delete_if_equals_checks_owner() {
        let backend = MemoryBackend::new();
        let ttl = Duration::from_secs(5);
        backend.set_if_absent("lock:k", "owner", ttl).await.unwrap();

        assert!(!backend.delete_if_equals("lock:k", "intruder").await.unwrap());
        assert!(backend.delete_if_equals("lock:k", "owner").await.unwrap());
        assert_eq!(backend.get("lock:k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn set_if_equals_writes_only_for_the_guard_owner() {
        let backend = MemoryBackend::new();
        let ttl = Duration::from_secs(5);
        backend.set_if_absent("lock:k", "owner", ttl).await.unwrap();

        assert!(
            !backend
                .set_if_equals("lock:k", "intruder", "k", "stale", ttl)
                .await
                .unwrap()
        );
        assert_eq!(backend.get("k").await.unwrap(), None);

        assert!(
            backend
                .set_if_equals("lock:k", "owner", "k", "fresh", ttl)
                .await
                .unwrap()
        );
        assert_eq!(backend.get("k").await.unwrap().as_deref(), Some("fresh"));

        backend.delete("lock:k").await.unwrap();
        assert!(
            !backend
                .set_if_equals("lock:k", "owner", "k", "late", ttl)
                .await
                .unwrap()
        );
        assert_eq!(backend.get("k").await.unwrap().as_deref(), Some("fresh"));
    }

    #[tokio::test]
    async fn scan_visits_every_matching_key_across_batches() {
        let backend = MemoryBackend::new();
        let ttl = Duration::from_secs(60);
        for i in 0..25 {
            backend
                .set_with_ttl(&format!("blog:page:public:{i}:10:createdAt:desc"), "x", ttl)
                .await
                .unwrap();
        }
        backend.set_with_ttl("blog:id:1", "x", ttl).await.unwrap();
        backend.set_with_ttl("lock:blog:id:1", "t", ttl).await.unwrap();

        let mut cursor = None;
        let mut seen = Vec::new();
        loop {
            let page = backend.scan("blog:page:*", cursor, 4).await.unwrap();
            seen.extend(page.keys);
            match page.next {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        assert_eq!(seen.len(), 25);
    }

    #[tokio::test]
    async fn scan_is_stable_while_deleting_returned_keys() {
        let backend = MemoryBackend::new();
        let ttl = Duration::from_secs(60);
        for i in 0..10 {
            backend
                .set_with_ttl(&format!("blog:id:{i}"), "x", ttl)
                .await
                .unwrap();
        }

        let mut cursor = None;
        let mut removed = 0;
        loop {
            let page = backend.scan("blog:*", cursor, 3).await.unwrap();
            removed += backend.delete_many(&page.keys).await.unwrap();
            match page.next {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        assert_eq!(removed, 10);
        assert!(backend.is_empty());
    }

    #[tokio::test]
    async fn offline_backend_fails_every_call() {
        let backend = MemoryBackend::new();
        backend.set_online(false);
        assert!(backend.get("k").await.is_err());
        assert!(backend.ping().await.is_err());

        backend.set_online(true);
        assert!(backend.ping().await.is_ok());
    }

    #[tokio::test]
    async fn recovers_from_poisoned_lock() {
        let backend = MemoryBackend::new();

        let _ = catch_unwind(AssertUnwindSafe(|| {
            let _guard = backend
                .entries
                .write()
                .expect("entries lock should be acquired");
            panic!("poison entries lock");
        }));

        backend
            .set_with_ttl("blog:id:1", "v", Duration::from_secs(5))
            .await
            .unwrap();
        assert!(backend.get("blog:id:1").await.unwrap().is_some());
    }
}
