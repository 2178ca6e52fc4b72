//! Service registry over the shared store
//!
//! Storage layout, with `P` the configured key prefix:
//!
//! ```text
//! P service:<name>:<id>        JSON ServiceRegistration, optional TTL
//! P <services_key>             set of every `P service:...` key
//! ```
//!
//! Keying by `(name, id)` means re-registering an instance replaces its
//! record (and refreshes its TTL) rather than adding a near-duplicate when,
//! say, its tags are listed in a different order.
//!
//! Every query still re-reads the whole index, which is fine for the small
//! fleets this targets but linear in the number of instances.

use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

use super::model::{RegisterReply, ServiceRegistration, StatusReply};
use crate::store::{SharedStore, StoreError};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("invalid registration: {0}")]
    Validation(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct ServiceRegistry {
    store: SharedStore,
    prefix: String,
    index_key: String,
    registration_ttl: Option<Duration>,
}

impl ServiceRegistry {
    pub fn new(
        store: SharedStore,
        prefix: impl Into<String>,
        services_key: &str,
        registration_ttl: Option<Duration>,
    ) -> Self {
        let prefix = prefix.into();
        Self {
            index_key: format!("{}{}", prefix, services_key),
            store,
            prefix,
            registration_ttl,
        }
    }

    pub fn registration_ttl(&self) -> Option<Duration> {
        self.registration_ttl
    }

    fn instance_key(&self, name: &str, id: &str) -> String {
        format!("{}service:{}:{}", self.prefix, escape(name), escape(id))
    }

    /// Validates and stores a registration, replacing any earlier record
    /// for the same `(name, id)`.
    pub async fn try_register(&self, registration: &ServiceRegistration) -> Result<(), RegistryError> {
        registration.validate().map_err(RegistryError::Validation)?;

        let key = self.instance_key(&registration.name, &registration.id);
        let encoded = serde_json::to_string(registration)
            .map_err(|e| RegistryError::Validation(e.to_string()))?;

        // Value first, index second: a reader never finds an index entry
        // whose record has not been written yet.
        self.store.set(&key, &encoded, self.registration_ttl).await?;
        self.store.set_add(&self.index_key, &key).await?;
        Ok(())
    }

    /// Registration entry point for the RPC surface. Never fails; problems
    /// are reported in the reply.
    pub async fn register_service(&self, registration: ServiceRegistration) -> RegisterReply {
        match self.try_register(&registration).await {
            Ok(()) => {
                info!(
                    service = %registration.name,
                    id = %registration.id,
                    address = %registration.address,
                    port = registration.port,
                    "Service registered"
                );
                RegisterReply::ok("Service registered successfully")
            }
            Err(e) => {
                warn!(
                    service = %registration.name,
                    id = %registration.id,
                    error = %e,
                    "Service registration failed"
                );
                RegisterReply::failed(e.to_string())
            }
        }
    }

    /// Removes an instance. Removing an unknown instance succeeds.
    pub async fn deregister_service(&self, name: &str, id: &str) -> RegisterReply {
        let key = self.instance_key(name, id);
        let result: Result<(), StoreError> = async {
            self.store.delete(&key).await?;
            self.store.set_remove(&self.index_key, &key).await?;
            Ok(())
        }
        .await;

        match result {
            Ok(()) => {
                info!(service = %name, id = %id, "Service deregistered");
                RegisterReply::ok("Service deregistered successfully")
            }
            Err(e) => {
                warn!(service = %name, id = %id, error = %e, "Service deregistration failed");
                RegisterReply::failed(e.to_string())
            }
        }
    }

    /// Every live registration, ordered by `(name, id)`.
    ///
    /// Records that fail to decode are skipped. Index entries whose record
    /// has expired are pruned on the way.
    pub async fn get_services(&self) -> Result<Vec<ServiceRegistration>, RegistryError> {
        let members = self.store.set_members(&self.index_key).await?;
        let mut services = Vec::with_capacity(members.len());

        for key in members {
            let raw = match self.store.get(&key).await? {
                Some(raw) => raw,
                None => match self.prune(&key).await {
                    Ok(Some(raw)) => raw,
                    Ok(None) => continue,
                    Err(e) => {
                        warn!(key = %key, error = %e, "Failed to prune expired registration");
                        continue;
                    }
                },
            };
            match serde_json::from_str::<ServiceRegistration>(&raw) {
                Ok(registration) => services.push(registration),
                Err(e) => warn!(key = %key, error = %e, "Skipping undecodable registration"),
            }
        }

        services.sort_by(|a, b| (&a.name, &a.id).cmp(&(&b.name, &b.id)));
        Ok(services)
    }

    /// Removes an expired record's index entry.
    ///
    /// A heartbeat may re-register the instance between the miss and the
    /// removal; its SADD is then a no-op and the SREM would hide it. The
    /// record is read again afterwards and re-indexed when it is back, in
    /// which case it is returned.
    async fn prune(&self, key: &str) -> Result<Option<String>, StoreError> {
        if !self.store.set_remove(&self.index_key, key).await? {
            return Ok(None);
        }
        match self.store.get(key).await? {
            Some(raw) => {
                self.store.set_add(&self.index_key, key).await?;
                debug!(key = %key, "Registration renewed while pruning, kept");
                Ok(Some(raw))
            }
            None => {
                debug!(key = %key, "Pruned expired registration");
                Ok(None)
            }
        }
    }

    /// Live instances of `name`, optionally restricted to those carrying `tag`.
    pub async fn instances_of(
        &self,
        name: &str,
        tag: Option<&str>,
    ) -> Result<Vec<ServiceRegistration>, RegistryError> {
        let mut services = self.get_services().await?;
        services.retain(|s| s.name == name && tag.is_none_or(|t| s.has_tag(t)));
        Ok(services)
    }

    /// Liveness check; does not touch the store.
    pub fn status(&self) -> StatusReply {
        StatusReply {
            message: "Service Discovery is running".to_string(),
        }
    }
}

/// Keeps `:` out of key segments so `(a:b, c)` and `(a, b:c)` stay distinct.
fn escape(segment: &str) -> String {
    segment.replace('%', "%25").replace(':', "%3A")
}
