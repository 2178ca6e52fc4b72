//! Key-value store abstraction
//!
//! Both the response cache and the service registry are stateless façades
//! over a [`KeyValueStore`] handle injected at construction. The store owns
//! every piece of shared state; the handle itself is cheap to clone and safe
//! to use from any number of concurrent tasks.
//!
//! Two implementations ship with the crate:
//!
//! - [`RedisStore`]: the production backend, one multiplexed connection
//!   shared by every request.
//! - [`MemoryStore`]: an in-process map with the same semantics, used by
//!   tests and single-node development setups.

mod memory;
mod redis_store;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use self::memory::MemoryStore;
pub use self::redis_store::RedisStore;

/// Failure talking to the backing store.
///
/// Every variant means "the store could not answer"; callers decide whether
/// that degrades to a miss or fails the operation.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("store did not answer within {0:?}")]
    Timeout(Duration),

    #[error("store rejected command: {0}")]
    Command(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Shared store handle.
pub type SharedStore = Arc<dyn KeyValueStore>;

/// The subset of key-value operations the gateway relies on.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// GET. `None` when the key does not exist or has expired.
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// SET, with an expiry when `ttl` is given. Replaces any previous value.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()>;

    /// DEL. Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> StoreResult<()>;

    /// SADD. Returns whether the member was newly added.
    async fn set_add(&self, key: &str, member: &str) -> StoreResult<bool>;

    /// SMEMBERS. A missing set reads as empty.
    async fn set_members(&self, key: &str) -> StoreResult<Vec<String>>;

    /// SREM. Returns whether the member was present.
    async fn set_remove(&self, key: &str, member: &str) -> StoreResult<bool>;
}
