use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use sentinel_edge::registry::{ServiceRegistration, ServiceRegistry};
use sentinel_edge::store::{KeyValueStore, MemoryStore, StoreResult};

fn registry(store: &Arc<MemoryStore>, ttl: Option<Duration>) -> ServiceRegistry {
    ServiceRegistry::new(store.clone(), "test:", "registered_services", ttl)
}

fn princess() -> ServiceRegistration {
    ServiceRegistration::new("princess-svc", "i1", "10.0.0.5", 8080).with_tag("v1")
}

#[tokio::test]
async fn test_register_then_get_services() {
    let store = Arc::new(MemoryStore::new());
    let registry = registry(&store, None);

    let reply = registry.register_service(princess()).await;
    assert!(reply.success, "{}", reply.message);

    let services = registry.get_services().await.unwrap();
    assert_eq!(services, vec![princess()]);
}

#[tokio::test]
async fn test_reregistering_same_instance_keeps_one_entry() {
    let store = Arc::new(MemoryStore::new());
    let registry = registry(&store, None);

    registry.register_service(princess()).await;
    registry.register_service(princess()).await;

    let reordered = ServiceRegistration::new("princess-svc", "i1", "10.0.0.5", 8080)
        .with_tag("beta")
        .with_tag("v1");
    registry.register_service(reordered.clone()).await;

    let services = registry.get_services().await.unwrap();
    assert_eq!(services, vec![reordered]);
}

#[tokio::test]
async fn test_instances_are_sorted_and_filtered() {
    let store = Arc::new(MemoryStore::new());
    let registry = registry(&store, None);

    registry
        .register_service(ServiceRegistration::new("orders", "b", "10.0.0.2", 80).with_tag("v2"))
        .await;
    registry
        .register_service(ServiceRegistration::new("orders", "a", "10.0.0.1", 80).with_tag("v1"))
        .await;
    registry
        .register_service(ServiceRegistration::new("auth", "z", "10.0.0.3", 80))
        .await;

    let all = registry.get_services().await.unwrap();
    let ids: Vec<(&str, &str)> = all.iter().map(|s| (s.name.as_str(), s.id.as_str())).collect();
    assert_eq!(ids, vec![("auth", "z"), ("orders", "a"), ("orders", "b")]);

    let orders = registry.instances_of("orders", None).await.unwrap();
    assert_eq!(orders.len(), 2);

    let v2 = registry.instances_of("orders", Some("v2")).await.unwrap();
    assert_eq!(v2.len(), 1);
    assert_eq!(v2[0].id, "b");

    assert!(registry.instances_of("missing", None).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_concurrent_registrations_are_all_kept() {
    let store = Arc::new(MemoryStore::new());
    let registry = Arc::new(registry(&store, None));

    let mut tasks = Vec::new();
    for i in 0..16 {
        let registry = Arc::clone(&registry);
        tasks.push(tokio::spawn(async move {
            registry
                .register_service(ServiceRegistration::new(
                    "worker",
                    format!("w{:02}", i),
                    "10.0.0.9",
                    9000 + i,
                ))
                .await
        }));
    }
    for task in tasks {
        assert!(task.await.unwrap().success);
    }

    let services = registry.get_services().await.unwrap();
    assert_eq!(services.len(), 16);
    assert_eq!(services[0].id, "w00");
    assert_eq!(services[15].id, "w15");
}

#[tokio::test]
async fn test_deregister_removes_instance() {
    let store = Arc::new(MemoryStore::new());
    let registry = registry(&store, None);

    registry.register_service(princess()).await;
    let reply = registry.deregister_service("princess-svc", "i1").await;
    assert!(reply.success);
    assert!(registry.get_services().await.unwrap().is_empty());

    // Unknown instances deregister cleanly
    assert!(registry.deregister_service("princess-svc", "i9").await.success);
}

#[tokio::test]
async fn test_registration_expires_without_heartbeat() {
    let store = Arc::new(MemoryStore::new());
    let registry = registry(&store, Some(Duration::from_millis(100)));

    registry.register_service(princess()).await;
    assert_eq!(registry.get_services().await.unwrap().len(), 1);

    tokio::time::sleep(Duration::from_millis(200)).await;

    assert!(registry.get_services().await.unwrap().is_empty());
    // The stale index entry was pruned too
    assert!(
        store
            .set_members("test:registered_services")
            .await
            .unwrap()
            .is_empty()
    );
}

#[tokio::test]
async fn test_undecodable_record_is_skipped() {
    let store = Arc::new(MemoryStore::new());
    let registry = registry(&store, None);

    registry.register_service(princess()).await;
    store.set("test:service:broken:1", "not json", None).await.unwrap();
    store
        .set_add("test:registered_services", "test:service:broken:1")
        .await
        .unwrap();

    let services = registry.get_services().await.unwrap();
    assert_eq!(services, vec![princess()]);
}

#[tokio::test]
async fn test_store_outage_is_reported() {
    let store = Arc::new(MemoryStore::new());
    let registry = registry(&store, None);
    store.set_offline(true);

    let reply = registry.register_service(princess()).await;
    assert!(!reply.success);
    assert!(registry.get_services().await.is_err());

    // Status never touches the store
    assert_eq!(registry.status().message, "Service Discovery is running");
}

/// Delegates to a `MemoryStore`, replaying a pending write just before the
/// next SREM so that it lands between a reader's GET and its removal.
struct HeartbeatBeforeRemove {
    inner: Arc<MemoryStore>,
    pending: Mutex<Option<(String, String)>>,
}

#[async_trait]
impl KeyValueStore for HeartbeatBeforeRemove {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
        self.inner.set(key, value, ttl).await
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.inner.delete(key).await
    }

    async fn set_add(&self, key: &str, member: &str) -> StoreResult<bool> {
        self.inner.set_add(key, member).await
    }

    async fn set_members(&self, key: &str) -> StoreResult<Vec<String>> {
        self.inner.set_members(key).await
    }

    async fn set_remove(&self, key: &str, member: &str) -> StoreResult<bool> {
        let pending = self.pending.lock().unwrap().take();
        if let Some((record_key, value)) = pending {
            self.inner.set(&record_key, &value, None).await?;
            self.inner.set_add(key, &record_key).await?;
        }
        self.inner.set_remove(key, member).await
    }
}

#[tokio::test]
async fn test_heartbeat_during_prune_keeps_instance_visible() {
    let inner = Arc::new(MemoryStore::new());
    let store = Arc::new(HeartbeatBeforeRemove {
        inner: inner.clone(),
        pending: Mutex::new(None),
    });
    let registry = ServiceRegistry::new(
        store.clone(),
        "test:",
        "registered_services",
        Some(Duration::from_millis(20)),
    );

    registry.register_service(princess()).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    // The record has expired; the heartbeat arrives mid-prune.
    *store.pending.lock().unwrap() = Some((
        "test:service:princess-svc:i1".to_string(),
        serde_json::to_string(&princess()).unwrap(),
    ));

    let first = registry.get_services().await.unwrap();
    assert_eq!(first, vec![princess()]);

    let second = registry.get_services().await.unwrap();
    assert_eq!(second, vec![princess()]);
    assert_eq!(
        inner.set_members("test:registered_services").await.unwrap(),
        vec!["test:service:princess-svc:i1".to_string()]
    );
}
