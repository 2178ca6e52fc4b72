//! Wiring: builds the store, cache, registry and router from a [`Config`]
//! and runs both listeners.

use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tracing::info;

use crate::cache::StoreCache;
use crate::config::{Config, StoreBackend};
use crate::proxy::{BackendResolver, RouteTable, Router, Upstream};
use crate::registry::{RegistryApi, ServiceRegistry};
use crate::server::listener;
use crate::store::{MemoryStore, RedisStore, SharedStore};

pub struct App {
    pub config: Config,
    pub store: SharedStore,
    pub registry: Arc<ServiceRegistry>,
    pub router: Arc<Router>,
}

impl App {
    /// Connects to the configured store and assembles the services.
    pub async fn build(config: Config) -> anyhow::Result<Self> {
        let store: SharedStore = match config.store.backend {
            StoreBackend::Redis => Arc::new(
                RedisStore::connect(&config.store.url, config.store.timeout())
                    .await
                    .context("connecting to the key-value store")?,
            ),
            StoreBackend::Memory => {
                tracing::warn!("Using the in-process store; state is not shared between gateway instances");
                Arc::new(MemoryStore::new())
            }
        };
        Self::with_store(config, store)
    }

    /// Assembles the services over an existing store handle.
    pub fn with_store(config: Config, store: SharedStore) -> anyhow::Result<Self> {
        let registry = Arc::new(ServiceRegistry::new(
            Arc::clone(&store),
            config.store.key_prefix.clone(),
            &config.registry.services_key,
            config.registry.registration_ttl(),
        ));

        let routes = RouteTable::from_config(&config.routes, &config.cache)?;
        let upstream = Upstream::new(
            config.server.connect_timeout(),
            config.server.request_timeout(),
        );
        let mut router = Router::new(routes, BackendResolver::new(Some(Arc::clone(&registry))), upstream);
        if config.cache.enabled {
            router = router.with_cache(Arc::new(StoreCache::new(
                Arc::clone(&store),
                config.store.key_prefix.clone(),
            )));
        }

        info!(
            routes = router.routes().len(),
            cache = config.cache.enabled,
            registration_ttl = ?config.registry.registration_ttl(),
            "Gateway assembled"
        );

        Ok(Self {
            config,
            store,
            registry,
            router: Arc::new(router),
        })
    }

    /// Serves the gateway and the registry until either listener fails.
    pub async fn run(&self) -> anyhow::Result<()> {
        let gateway = TcpListener::bind(&self.config.server.listen_addr)
            .await
            .with_context(|| format!("binding gateway to {}", self.config.server.listen_addr))?;
        let registry = TcpListener::bind(&self.config.registry.listen_addr)
            .await
            .with_context(|| format!("binding registry to {}", self.config.registry.listen_addr))?;

        info!("Gateway listening on {}", gateway.local_addr()?);
        info!("Registry listening on {}", registry.local_addr()?);

        let idle = self.config.server.idle_timeout();
        let registry_api = Arc::new(RegistryApi::new(Arc::clone(&self.registry)));

        tokio::try_join!(
            listener::serve(gateway, "gateway", self.router.clone(), idle),
            listener::serve(registry, "registry", registry_api, idle),
        )?;
        Ok(())
    }
}
