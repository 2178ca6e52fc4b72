use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::{CachedResponse, ResponseCache};
use crate::store::{SharedStore, StoreError, StoreResult};

/// [`ResponseCache`] over the shared key-value store.
///
/// Layout, with `P` the configured key prefix:
///
/// ```text
/// P cache:<region>:<key>      serialized CachedResponse, expires with its TTL
/// P cache-region:<region>     set of every storage key written to the region
/// ```
#[derive(Clone)]
pub struct StoreCache {
    store: SharedStore,
    prefix: String,
}

impl StoreCache {
    pub fn new(store: SharedStore, prefix: impl Into<String>) -> Self {
        Self {
            store,
            prefix: prefix.into(),
        }
    }

    /// The key the artifact for `key` in `region` is stored under.
    pub fn storage_key(&self, key: &str, region: &str) -> String {
        format!("{}cache:{}:{}", self.prefix, escape_region(region), key)
    }

    fn region_index(&self, region: &str) -> String {
        format!("{}cache-region:{}", self.prefix, escape_region(region))
    }

    /// Drops an expired key from its region index.
    ///
    /// A `put` can land between the miss and the removal; the key is
    /// re-checked afterwards and tracked again if it came back.
    async fn untrack_expired(&self, region: &str, storage_key: &str) -> StoreResult<()> {
        let index = self.region_index(region);
        if !self.store.set_remove(&index, storage_key).await? {
            return Ok(());
        }
        if self.store.get(storage_key).await?.is_some() {
            self.store.set_add(&index, storage_key).await?;
        } else {
            debug!(storage_key, region, "Pruned expired cache key");
        }
        Ok(())
    }
}

/// Keeps `:` out of the region segment so that region `a:b` with key `c`
/// cannot collide with region `a` and key `b:c`.
fn escape_region(region: &str) -> String {
    region.replace('%', "%25").replace(':', "%3A")
}

#[async_trait]
impl ResponseCache for StoreCache {
    async fn put(
        &self,
        key: &str,
        value: &CachedResponse,
        ttl: Duration,
        region: &str,
    ) -> StoreResult<()> {
        if ttl.is_zero() {
            debug!(key, region, "Zero TTL, not caching");
            return Ok(());
        }

        let encoded = serde_json::to_string(value)
            .map_err(|e| StoreError::Command(format!("encoding cache entry: {}", e)))?;
        let storage_key = self.storage_key(key, region);

        self.store.set(&storage_key, &encoded, Some(ttl)).await?;
        self.store
            .set_add(&self.region_index(region), &storage_key)
            .await?;

        debug!(key, region, ttl_ms = ttl.as_millis() as u64, "Cached response");
        Ok(())
    }

    async fn get(&self, key: &str, region: &str) -> StoreResult<Option<CachedResponse>> {
        let storage_key = self.storage_key(key, region);
        let Some(raw) = self.store.get(&storage_key).await? else {
            if let Err(e) = self.untrack_expired(region, &storage_key).await {
                warn!(key, region, error = %e, "Failed to prune expired cache key");
            }
            return Ok(None);
        };

        match serde_json::from_str(&raw) {
            Ok(cached) => Ok(Some(cached)),
            Err(e) => {
                warn!(key, region, error = %e, "Discarding undecodable cache entry");
                Ok(None)
            }
        }
    }

    async fn remove(&self, key: &str, region: &str) -> StoreResult<()> {
        let storage_key = self.storage_key(key, region);
        self.store.delete(&storage_key).await?;
        self.store
            .set_remove(&self.region_index(region), &storage_key)
            .await?;
        Ok(())
    }

    async fn clear_region(&self, region: &str) -> StoreResult<usize> {
        let index = self.region_index(region);
        let keys = self.store.set_members(&index).await?;

        for storage_key in &keys {
            self.store.delete(storage_key).await?;
        }
        self.store.delete(&index).await?;

        debug!(region, keys = keys.len(), "Cleared cache region");
        Ok(keys.len())
    }
}
