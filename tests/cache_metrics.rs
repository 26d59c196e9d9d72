mod support;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use metrics_util::debugging::DebuggingRecorder;
use quire::cache::{
    CacheConfig, CacheKey, CacheManager, InvalidationScheduler, InvalidationTarget, LeaseLock,
    MemoryBackend,
};
use quire::domain::blogs::PageQuery;
use serial_test::serial;
use support::{FakeBlogs, Harness, blog};
use tokio::runtime::Handle;

#[tokio::test(start_paused = true)]
#[serial]
async fn cache_paths_emit_expected_metric_keys() {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder
        .install()
        .expect("debug metrics recorder should install in this test process");

    // Miss, lock acquired, compute, then hit.
    let harness = Harness::new(FakeBlogs::with_records([blog(1, "first")]));
    harness.service.get_by_id_cached(1).await.unwrap();
    harness.service.get_by_id_cached(1).await.unwrap();

    // Waiting on a held lock until the budget runs out.
    let config = CacheConfig {
        lock_wait_budget_ms: Some(100),
        ..CacheConfig::default()
    };
    let backend = Arc::new(MemoryBackend::new());
    let manager = CacheManager::new(backend.clone(), &config);
    let key = CacheKey::blog_by_id(9);
    let held = LeaseLock::try_acquire(backend.as_ref(), &key, Duration::from_secs(30))
        .await
        .unwrap();
    assert!(held.is_some());
    let value: Result<u32, ()> = manager
        .get_with_lock(&key, config.entity_policy(), || async { Ok(7) })
        .await;
    assert_eq!(value, Ok(7));

    // Backend failure, then invalidation failure and success.
    let scheduler = InvalidationScheduler::new(harness.service.clone(), Handle::current());
    assert!(scheduler.run(InvalidationTarget::All).await.is_ok());
    harness.backend.set_online(false);
    harness.service.get_by_id_cached(1).await.unwrap();
    assert!(scheduler.run(InvalidationTarget::All).await.is_err());
    harness.backend.set_online(true);

    // Warm-up timing.
    harness.service.warm_up_cache().await;
    harness
        .service
        .get_paginated_list_cached(PageQuery::default())
        .await
        .unwrap();

    let snapshot = snapshotter.snapshot().into_vec();
    let names: HashSet<String> = snapshot
        .iter()
        .map(|(composite_key, _, _, _)| composite_key.key().name().to_string())
        .collect();

    let expected = [
        "quire_cache_hit_total",
        "quire_cache_miss_total",
        "quire_cache_backend_error_total",
        "quire_cache_lock_acquired_total",
        "quire_cache_lock_wait_total",
        "quire_cache_lock_fallback_total",
        "quire_cache_compute_ms",
        "quire_cache_invalidation_total",
        "quire_cache_warm_ms",
    ];
    for metric in expected {
        assert!(names.contains(metric), "missing metric: {metric}");
    }

    let label_values = |metric: &str, label_key: &str| -> HashSet<String> {
        snapshot
            .iter()
            .filter(|(composite_key, _, _, _)| composite_key.key().name() == metric)
            .flat_map(|(composite_key, _, _, _)| {
                composite_key
                    .key()
                    .labels()
                    .filter(|label| label.key() == label_key)
                    .map(|label| label.value().to_string())
                    .collect::<Vec<_>>()
            })
            .collect()
    };

    let invalidation_results = label_values("quire_cache_invalidation_total", "result");
    assert!(invalidation_results.contains("ok"));
    assert!(invalidation_results.contains("failed"));

    // The outage read computed without a lease, the held lease forced a timeout.
    let fallback_reasons = label_values("quire_cache_lock_fallback_total", "reason");
    assert!(fallback_reasons.contains("backend_error"));
    assert!(fallback_reasons.contains("wait_budget"));
}
