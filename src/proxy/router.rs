//! Gateway router
//!
//! For each request: match a route, serve from cache when possible, resolve
//! the backend, forward through the resilience policy and store cacheable
//! responses on the way back.
//!
//! Cache rules:
//!
//! - only routes with a cache policy, and only GET/HEAD requests, use it
//! - only 2xx responses without `Cache-Control: no-store`/`private` are stored
//! - a store outage on lookup bypasses the cache for that request instead of
//!   failing it; a failed write is logged and the response still returned
//! - the entry is written after the full backend response has arrived, as a
//!   single value, so an aborted request never leaves a partial entry

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::cache::{CachedResponse, ResponseCache, cache_key};
use crate::error::GatewayError;
use crate::http::request::Request;
use crate::http::response::Response;
use crate::proxy::backend::BackendResolver;
use crate::proxy::resilience::{PassThrough, ResiliencePolicy};
use crate::proxy::route::{Route, RouteCachePolicy, RouteTable};
use crate::proxy::upstream::{Upstream, UpstreamCall};
use crate::server::Handler;

pub const CACHE_STATUS_HEADER: &str = "X-Cache";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    Hit,
    Miss,
    /// The cache store could not be reached; the request went straight through.
    Bypass,
}

impl CacheStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheStatus::Hit => "HIT",
            CacheStatus::Miss => "MISS",
            CacheStatus::Bypass => "BYPASS",
        }
    }
}

pub struct Router {
    routes: RouteTable,
    resolver: BackendResolver,
    upstream: Upstream,
    cache: Option<Arc<dyn ResponseCache>>,
    policy: Arc<dyn ResiliencePolicy>,
}

impl Router {
    pub fn new(routes: RouteTable, resolver: BackendResolver, upstream: Upstream) -> Self {
        Self {
            routes,
            resolver,
            upstream,
            cache: None,
            policy: Arc::new(PassThrough),
        }
    }

    pub fn with_cache(mut self, cache: Arc<dyn ResponseCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_policy(mut self, policy: Arc<dyn ResiliencePolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    /// Routes one request to its backend.
    pub async fn route(&self, request: &Request) -> Result<Response, GatewayError> {
        let route = self.routes.find(request).ok_or_else(|| GatewayError::NoRoute {
            method: request.method,
            path: request.path_only().to_string(),
        })?;

        let cache = match (&self.cache, &route.cache) {
            (Some(cache), Some(policy)) if request.method.is_cacheable() => {
                Some((cache.as_ref(), policy, cache_key(request, &policy.vary_headers)))
            }
            _ => None,
        };

        let mut cache_status = None;
        if let Some((cache, policy, key)) = &cache {
            match cache.get(key, &policy.region).await {
                Ok(Some(hit)) => {
                    debug!(route = %route.name, key = %key, "Cache hit");
                    let mut response = hit.into_response();
                    response.set_header(CACHE_STATUS_HEADER, CacheStatus::Hit.as_str());
                    return Ok(response);
                }
                Ok(None) => cache_status = Some(CacheStatus::Miss),
                Err(e) => {
                    warn!(route = %route.name, key = %key, error = %e, "Cache unavailable, bypassing");
                    cache_status = Some(CacheStatus::Bypass);
                }
            }
        }

        let mut response = self.forward(route, request).await?;

        if let (Some((cache, policy, key)), Some(CacheStatus::Miss)) = (&cache, cache_status) {
            if is_storable(&response) {
                self.store(*cache, policy, key, &response).await;
            }
        }

        if let Some(status) = cache_status {
            response.set_header(CACHE_STATUS_HEADER, status.as_str());
        }
        Ok(response)
    }

    async fn forward(&self, route: &Route, request: &Request) -> Result<Response, GatewayError> {
        let backend = self.resolver.resolve(&route.target).await?;
        let target = route.upstream_target(request);

        let call = UpstreamCall {
            upstream: &self.upstream,
            backend: &backend,
            request,
            target: &target,
        };
        self.policy.execute(&call).await
    }

    async fn store(
        &self,
        cache: &dyn ResponseCache,
        policy: &RouteCachePolicy,
        key: &str,
        response: &Response,
    ) {
        let entry = CachedResponse::from_response(response);
        if let Err(e) = cache.put(key, &entry, policy.ttl, &policy.region).await {
            warn!(key = %key, region = %policy.region, error = %e, "Failed to cache response");
        }
    }
}

/// Whether a backend response may be stored.
fn is_storable(response: &Response) -> bool {
    if !response.status.is_success() {
        return false;
    }
    let forbidden = response.header("Cache-Control").is_some_and(|cc| {
        cc.split(',').any(|directive| {
            let directive = directive.trim();
            directive.eq_ignore_ascii_case("no-store") || directive.eq_ignore_ascii_case("private")
        })
    });
    !forbidden
}

#[async_trait]
impl Handler for Router {
    async fn handle(&self, request: Request) -> Response {
        match self.route(&request).await {
            Ok(response) => response,
            Err(e) => {
                match &e {
                    GatewayError::NoRoute { .. } => debug!(error = %e, "No route"),
                    _ => warn!(
                        method = %request.method,
                        path = %request.path_only(),
                        error = %e,
                        "Gateway failure"
                    ),
                }
                e.to_response()
            }
        }
    }
}
