//! Backend resolution
//!
//! Turns a route target into a concrete backend address: static targets are
//! used as configured, service targets are looked up in the registry on every
//! request and spread round-robin over the live instances.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use url::Url;

use crate::error::GatewayError;
use crate::proxy::route::RouteTarget;
use crate::registry::ServiceRegistry;

/// A backend chosen for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backend {
    /// Base URL, e.g. `http://10.0.0.5:8080`
    pub url: Url,

    /// Name for logging: `service/instance-id`, or the URL for static targets
    pub name: String,
}

impl Backend {
    pub fn new(url: Url, name: impl Into<String>) -> Self {
        Self {
            url,
            name: name.into(),
        }
    }

    /// Get a display name for the backend
    pub fn display_name(&self) -> &str {
        &self.name
    }

    /// `host:port` to connect to, with the scheme's default port filled in.
    pub fn authority(&self) -> Result<String, GatewayError> {
        let host = self
            .url
            .host_str()
            .ok_or_else(|| GatewayError::InvalidTarget(format!("{} has no host", self.url)))?;
        let port = self.url.port_or_known_default().unwrap_or(80);
        Ok(format!("{}:{}", host, port))
    }
}

pub struct BackendResolver {
    registry: Option<Arc<ServiceRegistry>>,
    cursor: AtomicUsize,
}

impl BackendResolver {
    /// `registry` may be `None` when every route has a static target.
    pub fn new(registry: Option<Arc<ServiceRegistry>>) -> Self {
        Self {
            registry,
            cursor: AtomicUsize::new(0),
        }
    }

    pub async fn resolve(&self, target: &RouteTarget) -> Result<Backend, GatewayError> {
        match target {
            RouteTarget::Static(url) => Ok(Backend::new(url.clone(), url.as_str())),
            RouteTarget::Service { name, tag } => {
                let registry = self.registry.as_ref().ok_or_else(|| {
                    GatewayError::InvalidTarget(format!(
                        "route targets service {:?} but no registry is configured",
                        name
                    ))
                })?;

                let instances = registry.instances_of(name, tag.as_deref()).await?;
                if instances.is_empty() {
                    tracing::warn!(service = %name, tag = ?tag, "No registered instances");
                    return Err(GatewayError::NoInstances(name.clone()));
                }

                let index = self.cursor.fetch_add(1, Ordering::Relaxed) % instances.len();
                let instance = &instances[index];
                let url = Url::parse(&instance.base_url()).map_err(|e| {
                    GatewayError::InvalidTarget(format!(
                        "instance {}/{} has unusable address {:?}: {}",
                        instance.name, instance.id, instance.address, e
                    ))
                })?;

                tracing::trace!(service = %name, instance = %instance.id, "Resolved backend");
                Ok(Backend::new(url, format!("{}/{}", instance.name, instance.id)))
            }
        }
    }
}
