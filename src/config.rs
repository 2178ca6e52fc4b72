//! Gateway configuration.
//!
//! Loaded once at startup from a YAML file (path in `SENTINEL_CONFIG`), with
//! a few environment overrides for the values that usually differ per
//! deployment. Every section has defaults so an empty file is valid.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, bail};
use serde::Deserialize;

use crate::http::request::Method;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// `tracing` max level: trace, debug, info, warn or error.
    pub log_level: String,
    pub server: ServerConfig,
    pub registry: RegistryConfig,
    pub store: StoreConfig,
    pub cache: CacheConfig,
    pub routes: Vec<RouteConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_addr: String,
    pub connect_timeout_ms: u64,
    pub request_timeout_ms: u64,
    pub idle_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Address of the registry RPC listener.
    pub listen_addr: String,
    /// Name of the index set holding every registration key.
    pub services_key: String,
    /// Registrations expire unless renewed within this many seconds.
    /// `None` keeps them until explicitly deregistered.
    pub registration_ttl_secs: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Redis,
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub url: String,
    /// Prepended to every key the gateway writes.
    pub key_prefix: String,
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    pub default_ttl_secs: u64,
    pub default_region: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RouteConfig {
    #[serde(default)]
    pub name: Option<String>,
    /// Restricts the route to one method; any method matches when absent.
    #[serde(default)]
    pub method: Option<String>,
    /// Exact path, or a prefix when it ends in `/*`.
    pub path: String,
    pub target: TargetConfig,
    /// Drop the matched prefix before forwarding.
    #[serde(default)]
    pub strip_prefix: bool,
    #[serde(default)]
    pub cache: Option<RouteCacheConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum TargetConfig {
    /// A fixed backend, e.g. `http://localhost:3000`.
    Static { url: String },
    /// Resolved through the service registry on every request.
    Service {
        service: String,
        #[serde(default)]
        tag: Option<String>,
    },
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RouteCacheConfig {
    pub ttl_secs: Option<u64>,
    pub region: Option<String>,
    /// Request headers that take part in the cache key.
    pub vary_headers: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            server: ServerConfig::default(),
            registry: RegistryConfig::default(),
            store: StoreConfig::default(),
            cache: CacheConfig::default(),
            routes: Vec::new(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8080".to_string(),
            connect_timeout_ms: 2_000,
            request_timeout_ms: 30_000,
            idle_timeout_secs: 60,
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:50051".to_string(),
            services_key: "registered_services".to_string(),
            registration_ttl_secs: None,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Redis,
            url: "redis://127.0.0.1:6379".to_string(),
            key_prefix: "sentinel:".to_string(),
            timeout_ms: 1_000,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_ttl_secs: 30,
            default_region: "default".to_string(),
        }
    }
}

impl ServerConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

impl RegistryConfig {
    pub fn registration_ttl(&self) -> Option<Duration> {
        self.registration_ttl_secs.map(Duration::from_secs)
    }
}

impl StoreConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl CacheConfig {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }
}

impl Config {
    /// Loads the configuration file named by `SENTINEL_CONFIG` (or defaults),
    /// then applies the `LISTEN`, `REGISTRY_LISTEN` and `REDIS_URL` overrides.
    pub fn load() -> anyhow::Result<Self> {
        let mut cfg = match std::env::var("SENTINEL_CONFIG") {
            Ok(path) => Self::from_file(path)?,
            Err(_) => Self::default(),
        };
        cfg.apply_env();
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        Self::from_yaml_str(&raw).with_context(|| format!("parsing config file {}", path.display()))
    }

    pub fn from_yaml_str(raw: &str) -> anyhow::Result<Self> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        let cfg: Config = serde_yaml::from_str(raw)?;
        Ok(cfg)
    }

    fn apply_env(&mut self) {
        if let Ok(addr) = std::env::var("LISTEN") {
            self.server.listen_addr = addr;
        }
        if let Ok(addr) = std::env::var("REGISTRY_LISTEN") {
            self.registry.listen_addr = addr;
        }
        if let Ok(url) = std::env::var("REDIS_URL") {
            self.store.url = url;
        }
    }

    /// Rejects settings the gateway could not serve: a zero registration
    /// TTL and route tables the router cannot use.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.registry.registration_ttl_secs == Some(0) {
            bail!("registry.registration_ttl_secs must be at least 1; omit it to disable expiry");
        }
        for route in &self.routes {
            if !route.path.starts_with('/') {
                bail!("route path {:?} must start with '/'", route.path);
            }
            if let Some(method) = &route.method {
                if Method::from_str(method).is_none() {
                    bail!("route {:?} has unknown method {:?}", route.path, method);
                }
            }
            match &route.target {
                TargetConfig::Static { url } => {
                    let parsed = url::Url::parse(url)
                        .with_context(|| format!("route {:?} has invalid url {:?}", route.path, url))?;
                    if parsed.scheme() != "http" {
                        bail!("route {:?}: only http backends are supported", route.path);
                    }
                    if parsed.host_str().is_none() {
                        bail!("route {:?}: backend url {:?} has no host", route.path, url);
                    }
                }
                TargetConfig::Service { service, .. } => {
                    if service.is_empty() {
                        bail!("route {:?} has an empty service name", route.path);
                    }
                }
            }
        }
        Ok(())
    }
}
