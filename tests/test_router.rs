//! End-to-end routing against loopback backends.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use sentinel_edge::app::App;
use sentinel_edge::config::Config;
use sentinel_edge::error::GatewayError;
use sentinel_edge::http::request::{Method, Request, RequestBuilder};
use sentinel_edge::http::response::{Response, StatusCode};
use sentinel_edge::proxy::{BackendResolver, ForwardCall, ResiliencePolicy, Router, Upstream};
use sentinel_edge::registry::ServiceRegistration;
use sentinel_edge::server::Handler;
use sentinel_edge::store::MemoryStore;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

/// A backend that answers every request with `status` and echoes the
/// request line as the body. Returns its base URL and a hit counter.
async fn spawn_backend(status: &'static str, extra_headers: &'static str) -> (String, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let hits = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&hits);
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let mut temp = [0u8; 1024];
                while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
                    match socket.read(&mut temp).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => buf.extend_from_slice(&temp[..n]),
                    }
                }
                let head = String::from_utf8_lossy(&buf).to_string();
                let request_line = head.lines().next().unwrap_or_default().to_string();
                let reply = format!(
                    "HTTP/1.1 {}\r\nContent-Type: text/plain\r\n{}Content-Length: {}\r\nConnection: close\r\n\r\n{}",
                    status,
                    extra_headers,
                    request_line.len(),
                    request_line
                );
                let _ = socket.write_all(reply.as_bytes()).await;
                let _ = socket.shutdown().await;
            });
        }
    });

    (format!("http://{}", addr), hits)
}

/// A base URL nothing listens on.
async fn dead_backend() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{}", addr)
}

fn gateway(yaml: &str) -> (App, Arc<MemoryStore>) {
    let config = Config::from_yaml_str(yaml).unwrap();
    config.validate().unwrap();
    let store = Arc::new(MemoryStore::new());
    let app = App::with_store(config, store.clone()).unwrap();
    (app, store)
}

fn cached_route(url: &str) -> String {
    format!(
        r#"
server:
  connect_timeout_ms: 500
  request_timeout_ms: 2000
routes:
  - path: /api/*
    strip_prefix: true
    target: {{ url: "{url}" }}
    cache: {{ ttl_secs: 30 }}
"#
    )
}

fn request(method: Method, path: &str) -> Request {
    RequestBuilder::new().method(method).path(path).build().unwrap()
}

fn cache_entries(store: &MemoryStore) -> Vec<String> {
    store
        .keys()
        .into_iter()
        .filter(|k| k.starts_with("sentinel:cache:"))
        .collect()
}

#[tokio::test]
async fn test_second_get_is_served_from_cache() {
    let (url, hits) = spawn_backend("200 OK", "").await;
    let (app, store) = gateway(&cached_route(&url));

    let first = app.router.route(&request(Method::GET, "/api/ping")).await.unwrap();
    assert_eq!(first.status, StatusCode::OK);
    assert_eq!(first.header("X-Cache"), Some("MISS"));
    assert_eq!(first.body, b"GET /ping HTTP/1.1");

    // Slash noise and query order map onto the same entry
    let second = app.router.route(&request(Method::GET, "/api//ping/")).await.unwrap();
    assert_eq!(second.header("X-Cache"), Some("HIT"));
    assert_eq!(second.body, first.body);
    assert_eq!(second.header("Content-Type"), Some("text/plain"));

    assert_eq!(hits.load(Ordering::SeqCst), 1);
    assert_eq!(
        cache_entries(&store),
        vec!["sentinel:cache:default:GET:/api/ping".to_string()]
    );
}

#[tokio::test]
async fn test_post_is_never_cached() {
    let (url, hits) = spawn_backend("200 OK", "").await;
    let (app, store) = gateway(&cached_route(&url));

    for _ in 0..2 {
        let response = app.router.route(&request(Method::POST, "/api/orders")).await.unwrap();
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.header("X-Cache"), None);
    }

    assert_eq!(hits.load(Ordering::SeqCst), 2);
    assert!(cache_entries(&store).is_empty());
}

#[tokio::test]
async fn test_error_and_no_store_responses_are_not_cached() {
    let (url, hits) = spawn_backend("500 Internal Server Error", "").await;
    let (app, store) = gateway(&cached_route(&url));

    for _ in 0..2 {
        let response = app.router.route(&request(Method::GET, "/api/boom")).await.unwrap();
        assert_eq!(response.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(response.header("X-Cache"), Some("MISS"));
    }
    assert_eq!(hits.load(Ordering::SeqCst), 2);

    assert!(cache_entries(&store).is_empty());

    let (url, _) = spawn_backend("200 OK", "Cache-Control: no-store\r\n").await;
    let (app, store) = gateway(&cached_route(&url));
    let response = app.router.route(&request(Method::GET, "/api/secret")).await.unwrap();
    assert_eq!(response.status, StatusCode::OK);

    assert!(cache_entries(&store).is_empty());
}

#[tokio::test]
async fn test_unreachable_backend_writes_no_cache_entry() {
    let url = dead_backend().await;
    let (app, store) = gateway(&cached_route(&url));

    let err = app
        .router
        .route(&request(Method::GET, "/api/ping"))
        .await
        .unwrap_err();

    assert!(err.is_backend_unavailable(), "{}", err);
    assert_eq!(err.status(), StatusCode::BAD_GATEWAY);
    assert!(cache_entries(&store).is_empty());

    let response = app.router.handle(request(Method::GET, "/api/ping")).await;
    assert_eq!(response.status, StatusCode::BAD_GATEWAY);
}

#[tokio::test]
async fn test_store_outage_bypasses_cache() {
    let (url, hits) = spawn_backend("200 OK", "").await;
    let (app, store) = gateway(&cached_route(&url));
    store.set_offline(true);

    for _ in 0..2 {
        let response = app.router.route(&request(Method::GET, "/api/ping")).await.unwrap();
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.header("X-Cache"), Some("BYPASS"));
    }
    assert_eq!(hits.load(Ordering::SeqCst), 2);

    store.set_offline(false);
    assert!(cache_entries(&store).is_empty());
}

#[tokio::test]
async fn test_unmatched_path_is_no_route() {
    let (url, _) = spawn_backend("200 OK", "").await;
    let (app, _) = gateway(&cached_route(&url));

    let err = app.router.route(&request(Method::GET, "/other")).await.unwrap_err();
    assert!(matches!(err, GatewayError::NoRoute { .. }));

    let response = app.router.handle(request(Method::GET, "/other")).await;
    assert_eq!(response.status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_service_target_resolves_through_registry() {
    let (url, hits) = spawn_backend("200 OK", "").await;
    let port: u16 = url.rsplit(':').next().unwrap().parse().unwrap();

    let (app, _) = gateway(
        r#"
routes:
  - path: /princess/*
    target: { service: princess-svc, tag: v1 }
"#,
    );

    // Nothing registered yet
    let response = app.router.handle(request(Method::GET, "/princess/castle")).await;
    assert_eq!(response.status, StatusCode::SERVICE_UNAVAILABLE);

    // Wrong tag does not count
    app.registry
        .register_service(ServiceRegistration::new("princess-svc", "i0", "127.0.0.1", port).with_tag("v0"))
        .await;
    let response = app.router.handle(request(Method::GET, "/princess/castle")).await;
    assert_eq!(response.status, StatusCode::SERVICE_UNAVAILABLE);

    app.registry
        .register_service(ServiceRegistration::new("princess-svc", "i1", "127.0.0.1", port).with_tag("v1"))
        .await;
    let response = app.router.route(&request(Method::GET, "/princess/castle?x=1")).await.unwrap();
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.body, b"GET /princess/castle?x=1 HTTP/1.1");
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_round_robin_over_instances() {
    let (url_a, hits_a) = spawn_backend("200 OK", "").await;
    let (url_b, hits_b) = spawn_backend("200 OK", "").await;
    let port = |url: &str| -> u16 { url.rsplit(':').next().unwrap().parse().unwrap() };

    let (app, _) = gateway(
        r#"
routes:
  - path: /*
    target: { service: pool }
"#,
    );
    app.registry
        .register_service(ServiceRegistration::new("pool", "a", "127.0.0.1", port(&url_a)))
        .await;
    app.registry
        .register_service(ServiceRegistration::new("pool", "b", "127.0.0.1", port(&url_b)))
        .await;

    for _ in 0..4 {
        let response = app.router.route(&request(Method::GET, "/")).await.unwrap();
        assert_eq!(response.status, StatusCode::OK);
    }

    assert_eq!(hits_a.load(Ordering::SeqCst), 2);
    assert_eq!(hits_b.load(Ordering::SeqCst), 2);
}

/// Retries a failed attempt once and counts how often it ran.
struct RetryOnce {
    executions: AtomicUsize,
    attempts: AtomicUsize,
}

#[async_trait]
impl ResiliencePolicy for RetryOnce {
    async fn execute(&self, call: &dyn ForwardCall) -> Result<Response, GatewayError> {
        self.executions.fetch_add(1, Ordering::SeqCst);
        self.attempts.fetch_add(1, Ordering::SeqCst);
        match call.attempt().await {
            Err(e) if e.is_backend_unavailable() => {
                self.attempts.fetch_add(1, Ordering::SeqCst);
                call.attempt().await
            }
            other => other,
        }
    }
}

#[tokio::test]
async fn test_injected_policy_wraps_forwarding() {
    let url = dead_backend().await;
    let config = Config::from_yaml_str(&cached_route(&url)).unwrap();
    let store = Arc::new(MemoryStore::new());
    let app = App::with_store(config, store).unwrap();

    let policy = Arc::new(RetryOnce {
        executions: AtomicUsize::new(0),
        attempts: AtomicUsize::new(0),
    });
    let routes = app.router.routes().clone();
    let router = Router::new(
        routes,
        BackendResolver::new(None),
        Upstream::new(Duration::from_millis(500), Duration::from_secs(1)),
    )
    .with_policy(policy.clone());

    let err = router.route(&request(Method::GET, "/api/ping")).await.unwrap_err();
    assert!(err.is_backend_unavailable());
    assert_eq!(policy.executions.load(Ordering::SeqCst), 1);
    assert_eq!(policy.attempts.load(Ordering::SeqCst), 2);
}
