//! Response caching
//!
//! The router talks to an abstract [`ResponseCache`]; [`StoreCache`] is the
//! implementation backed by the shared key-value store. Entries are
//! namespaced by region, so a whole region can be evicted at once.

pub mod key;
mod store_cache;

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::http::response::{Response, StatusCode};
use crate::store::StoreResult;

pub use self::key::cache_key;
pub use self::store_cache::StoreCache;

/// A backend response as kept in the cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedResponse {
    pub status: u16,
    /// Header name to values, in arrival order per name.
    pub headers: BTreeMap<String, Vec<String>>,
    pub body: Vec<u8>,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub content_length: usize,
}

impl CachedResponse {
    /// Captures a backend response. Header names are grouped ignoring case;
    /// the first spelling seen is kept.
    pub fn from_response(response: &Response) -> Self {
        let mut headers: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (name, value) in &response.headers {
            let existing = headers
                .keys()
                .find(|k| k.eq_ignore_ascii_case(name))
                .cloned();
            headers
                .entry(existing.unwrap_or_else(|| name.clone()))
                .or_default()
                .push(value.clone());
        }

        Self {
            status: response.status.as_u16(),
            headers,
            body: response.body.clone(),
            content_type: response.header("Content-Type").map(str::to_string),
            content_length: response.body.len(),
        }
    }

    pub fn into_response(self) -> Response {
        let headers = self
            .headers
            .into_iter()
            .flat_map(|(name, values)| values.into_iter().map(move |v| (name.clone(), v)))
            .collect();

        Response {
            status: StatusCode(self.status),
            headers,
            body: self.body,
        }
    }
}

/// Cache capability consumed by the router.
///
/// Store failures are reported, never folded into a miss: the caller decides
/// whether an outage means "bypass the cache" or "fail".
#[async_trait]
pub trait ResponseCache: Send + Sync {
    /// Stores `value` under `key` in `region`, replacing any previous value.
    async fn put(
        &self,
        key: &str,
        value: &CachedResponse,
        ttl: Duration,
        region: &str,
    ) -> StoreResult<()>;

    /// Same as [`put`](Self::put). Kept as a separate entry point so a
    /// backend with dependent entries can invalidate them here.
    async fn put_and_evict(
        &self,
        key: &str,
        value: &CachedResponse,
        ttl: Duration,
        region: &str,
    ) -> StoreResult<()> {
        self.put(key, value, ttl, region).await
    }

    /// `None` when the key is missing, expired or unreadable.
    async fn get(&self, key: &str, region: &str) -> StoreResult<Option<CachedResponse>>;

    /// Deletes the entry; a missing key is not an error.
    async fn remove(&self, key: &str, region: &str) -> StoreResult<()>;

    /// Deletes every entry stored in `region`, returning how many keys were
    /// tracked for it.
    async fn clear_region(&self, region: &str) -> StoreResult<usize>;
}
