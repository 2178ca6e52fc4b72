//! Route table
//!
//! Routes are built once from configuration and never change afterwards.
//! Matching is first-match in configuration order against the normalized
//! request path.

use std::time::Duration;

use anyhow::{Context, anyhow};
use url::Url;

use crate::cache::key::normalize_path;
use crate::config::{CacheConfig, RouteConfig, TargetConfig};
use crate::http::request::{Method, Request};

/// Path half of a route pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathPattern {
    /// Matches one normalized path.
    Exact(String),
    /// Matches the prefix itself and everything below it. Written `/api/*`.
    Prefix(String),
}

impl PathPattern {
    pub fn parse(pattern: &str) -> Self {
        match pattern.strip_suffix("/*") {
            Some(prefix) => {
                let prefix = normalize_path(prefix);
                // "/*" matches everything; keep the prefix empty for that case.
                PathPattern::Prefix(if prefix == "/" { String::new() } else { prefix })
            }
            None => PathPattern::Exact(normalize_path(pattern)),
        }
    }

    /// `path` must already be normalized.
    pub fn matches(&self, path: &str) -> bool {
        match self {
            PathPattern::Exact(exact) => path == exact,
            PathPattern::Prefix(prefix) => {
                path == prefix
                    || path
                        .strip_prefix(prefix.as_str())
                        .is_some_and(|rest| rest.starts_with('/'))
            }
        }
    }

    /// Removes the matched prefix, keeping the result rooted at `/`.
    pub fn strip(&self, path: &str) -> String {
        match self {
            PathPattern::Exact(_) => "/".to_string(),
            PathPattern::Prefix(prefix) => match path.strip_prefix(prefix.as_str()) {
                Some("") | None => "/".to_string(),
                Some(rest) => rest.to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteTarget {
    Static(Url),
    Service { name: String, tag: Option<String> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteCachePolicy {
    pub ttl: Duration,
    pub region: String,
    pub vary_headers: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct Route {
    pub name: String,
    pub method: Option<Method>,
    pub pattern: PathPattern,
    pub target: RouteTarget,
    pub strip_prefix: bool,
    pub cache: Option<RouteCachePolicy>,
}

impl Route {
    /// Builds a route, filling cache defaults from `cache_defaults`.
    pub fn from_config(cfg: &RouteConfig, cache_defaults: &CacheConfig) -> anyhow::Result<Self> {
        let method = cfg
            .method
            .as_deref()
            .map(|m| Method::from_str(m).ok_or_else(|| anyhow!("unknown method {:?}", m)))
            .transpose()?;

        let target = match &cfg.target {
            TargetConfig::Static { url } => RouteTarget::Static(
                Url::parse(url).with_context(|| format!("invalid backend url {:?}", url))?,
            ),
            TargetConfig::Service { service, tag } => RouteTarget::Service {
                name: service.clone(),
                tag: tag.clone(),
            },
        };

        let cache = cfg.cache.as_ref().map(|c| RouteCachePolicy {
            ttl: c
                .ttl_secs
                .map(Duration::from_secs)
                .unwrap_or_else(|| cache_defaults.default_ttl()),
            region: c
                .region
                .clone()
                .unwrap_or_else(|| cache_defaults.default_region.clone()),
            vary_headers: c.vary_headers.clone(),
        });

        Ok(Self {
            name: cfg.name.clone().unwrap_or_else(|| cfg.path.clone()),
            method,
            pattern: PathPattern::parse(&cfg.path),
            target,
            strip_prefix: cfg.strip_prefix,
            cache,
        })
    }

    pub fn matches(&self, method: Method, normalized_path: &str) -> bool {
        self.method.is_none_or(|m| m == method) && self.pattern.matches(normalized_path)
    }

    /// The request target sent upstream: normalized path, prefix stripped
    /// when configured, original query string kept.
    pub fn upstream_target(&self, request: &Request) -> String {
        let path = normalize_path(request.path_only());
        let mut target = if self.strip_prefix {
            self.pattern.strip(&path)
        } else {
            path
        };
        if let Some(query) = request.query() {
            target.push('?');
            target.push_str(query);
        }
        target
    }
}

#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    routes: Vec<Route>,
}

impl RouteTable {
    pub fn new(routes: Vec<Route>) -> Self {
        Self { routes }
    }

    pub fn from_config(routes: &[RouteConfig], cache_defaults: &CacheConfig) -> anyhow::Result<Self> {
        let routes = routes
            .iter()
            .map(|r| Route::from_config(r, cache_defaults).with_context(|| format!("route {:?}", r.path)))
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok(Self { routes })
    }

    pub fn find(&self, request: &Request) -> Option<&Route> {
        let path = normalize_path(request.path_only());
        self.routes.iter().find(|r| r.matches(request.method, &path))
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
