use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use sentinel_edge::cache::{CachedResponse, ResponseCache, StoreCache};
use sentinel_edge::store::{KeyValueStore, MemoryStore};

fn artifact(body: &str) -> CachedResponse {
    let mut headers = BTreeMap::new();
    headers.insert("Content-Type".to_string(), vec!["text/plain".to_string()]);
    CachedResponse {
        status: 200,
        headers,
        body: body.as_bytes().to_vec(),
        content_type: Some("text/plain".to_string()),
        content_length: body.len(),
    }
}

fn cache() -> (Arc<MemoryStore>, StoreCache) {
    let store = Arc::new(MemoryStore::new());
    let cache = StoreCache::new(store.clone(), "test:");
    (store, cache)
}

#[tokio::test]
async fn test_put_then_get_returns_artifact() {
    let (_, cache) = cache();

    cache
        .put("GET:/ping", &artifact("pong"), Duration::from_secs(5), "default")
        .await
        .unwrap();

    let hit = cache.get("GET:/ping", "default").await.unwrap().unwrap();
    assert_eq!(hit.status, 200);
    assert_eq!(hit.body, b"pong");
}

#[tokio::test]
async fn test_entry_expires_after_ttl() {
    let (_, cache) = cache();

    cache
        .put("GET:/ping", &artifact("pong"), Duration::from_millis(100), "default")
        .await
        .unwrap();
    assert!(cache.get("GET:/ping", "default").await.unwrap().is_some());

    tokio::time::sleep(Duration::from_millis(200)).await;

    assert!(cache.get("GET:/ping", "default").await.unwrap().is_none());
}

#[tokio::test]
async fn test_put_replaces_previous_value() {
    let (_, cache) = cache();
    let ttl = Duration::from_secs(5);

    cache.put("k", &artifact("one"), ttl, "default").await.unwrap();
    cache.put_and_evict("k", &artifact("two"), ttl, "default").await.unwrap();

    let hit = cache.get("k", "default").await.unwrap().unwrap();
    assert_eq!(hit.body, b"two");
}

#[tokio::test]
async fn test_regions_are_separate_namespaces() {
    let (_, cache) = cache();
    let ttl = Duration::from_secs(5);

    cache.put("k", &artifact("users"), ttl, "users").await.unwrap();

    assert!(cache.get("k", "orders").await.unwrap().is_none());
    assert!(cache.get("k", "users").await.unwrap().is_some());
}

#[tokio::test]
async fn test_remove_missing_key_is_ok() {
    let (_, cache) = cache();

    cache.remove("GET:/never", "default").await.unwrap();

    cache
        .put("GET:/ping", &artifact("pong"), Duration::from_secs(5), "default")
        .await
        .unwrap();
    cache.remove("GET:/ping", "default").await.unwrap();
    assert!(cache.get("GET:/ping", "default").await.unwrap().is_none());
}

#[tokio::test]
async fn test_clear_region_leaves_other_regions() {
    let (store, cache) = cache();
    let ttl = Duration::from_secs(5);

    cache.put("a", &artifact("a"), ttl, "users").await.unwrap();
    cache.put("b", &artifact("b"), ttl, "users").await.unwrap();
    cache.put("a", &artifact("a"), ttl, "orders").await.unwrap();

    assert_eq!(cache.clear_region("users").await.unwrap(), 2);

    assert!(cache.get("a", "users").await.unwrap().is_none());
    assert!(cache.get("b", "users").await.unwrap().is_none());
    assert!(cache.get("a", "orders").await.unwrap().is_some());
    assert!(store.keys().iter().all(|k| !k.contains("users")));

    assert_eq!(cache.clear_region("users").await.unwrap(), 0);
}

#[tokio::test]
async fn test_store_outage_surfaces_as_error() {
    let (store, cache) = cache();
    store.set_offline(true);

    assert!(cache.get("GET:/ping", "default").await.is_err());
    assert!(
        cache
            .put("GET:/ping", &artifact("pong"), Duration::from_secs(5), "default")
            .await
            .is_err()
    );
}

#[tokio::test]
async fn test_expired_entries_are_pruned_from_region_index() {
    let (store, cache) = cache();

    for i in 0..100 {
        let key = format!("GET:/search?q={}", i);
        cache
            .put(&key, &artifact("hit"), Duration::from_millis(5), "search")
            .await
            .unwrap();
    }
    cache
        .put("GET:/search?q=live", &artifact("live"), Duration::from_secs(30), "search")
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(40)).await;
    for i in 0..100 {
        let key = format!("GET:/search?q={}", i);
        assert!(cache.get(&key, "search").await.unwrap().is_none());
    }

    let index = store.set_members("test:cache-region:search").await.unwrap();
    assert_eq!(index, vec!["test:cache:search:GET:/search?q=live".to_string()]);
    assert_eq!(cache.clear_region("search").await.unwrap(), 1);
}
