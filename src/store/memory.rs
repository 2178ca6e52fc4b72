//! In-process store with Redis-like semantics

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use super::{KeyValueStore, StoreError, StoreResult};

#[derive(Debug)]
enum Entry {
    Value {
        value: String,
        expires_at: Option<Instant>,
    },
    Set(HashSet<String>),
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        matches!(self, Entry::Value { expires_at: Some(at), .. } if *at <= now)
    }
}

/// A `Mutex<HashMap>` store. Expiry is checked lazily on access.
///
/// The lock is never held across an `.await`: every operation finishes its
/// map access synchronously.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
    offline: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulates an outage: while offline every operation fails with
    /// [`StoreError::Unavailable`].
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Number of live keys, for tests and diagnostics.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.with_entries(|entries| entries.values().filter(|e| !e.is_expired(now)).count())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every live key, sorted.
    pub fn keys(&self) -> Vec<String> {
        let now = Instant::now();
        let mut keys: Vec<String> = self.with_entries(|entries| {
            entries
                .iter()
                .filter(|(_, e)| !e.is_expired(now))
                .map(|(k, _)| k.clone())
                .collect()
        });
        keys.sort();
        keys
    }

    fn check_online(&self) -> StoreResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store is offline".to_string()));
        }
        Ok(())
    }

    fn with_entries<T>(&self, f: impl FnOnce(&mut HashMap<String, Entry>) -> T) -> T {
        // A poisoned lock only means another task panicked mid-operation;
        // the map itself is still consistent.
        let mut guard = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut guard)
    }

    /// Drops `key` if it has expired, so later lookups see it as missing.
    fn purge_expired(entries: &mut HashMap<String, Entry>, key: &str) {
        if entries.get(key).is_some_and(|e| e.is_expired(Instant::now())) {
            entries.remove(key);
        }
    }
}

fn wrong_type(key: &str) -> StoreError {
    StoreError::Command(format!(
        "WRONGTYPE operation against key {:?} holding the wrong kind of value",
        key
    ))
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.check_online()?;
        self.with_entries(|entries| {
            Self::purge_expired(entries, key);
            match entries.get(key) {
                None => Ok(None),
                Some(Entry::Value { value, .. }) => Ok(Some(value.clone())),
                Some(Entry::Set(_)) => Err(wrong_type(key)),
            }
        })
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
        self.check_online()?;
        let expires_at = ttl.map(|ttl| Instant::now() + ttl);
        self.with_entries(|entries| {
            entries.insert(
                key.to_string(),
                Entry::Value {
                    value: value.to_string(),
                    expires_at,
                },
            );
        });
        Ok(())
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.check_online()?;
        self.with_entries(|entries| {
            entries.remove(key);
        });
        Ok(())
    }

    async fn set_add(&self, key: &str, member: &str) -> StoreResult<bool> {
        self.check_online()?;
        self.with_entries(|entries| {
            Self::purge_expired(entries, key);
            match entries
                .entry(key.to_string())
                .or_insert_with(|| Entry::Set(HashSet::new()))
            {
                Entry::Set(members) => Ok(members.insert(member.to_string())),
                Entry::Value { .. } => Err(wrong_type(key)),
            }
        })
    }

    async fn set_members(&self, key: &str) -> StoreResult<Vec<String>> {
        self.check_online()?;
        self.with_entries(|entries| {
            Self::purge_expired(entries, key);
            match entries.get(key) {
                None => Ok(Vec::new()),
                Some(Entry::Set(members)) => Ok(members.iter().cloned().collect()),
                Some(Entry::Value { .. }) => Err(wrong_type(key)),
            }
        })
    }

    async fn set_remove(&self, key: &str, member: &str) -> StoreResult<bool> {
        self.check_online()?;
        self.with_entries(|entries| {
            Self::purge_expired(entries, key);
            let removed = match entries.get_mut(key) {
                None => return Ok(false),
                Some(Entry::Set(members)) => members.remove(member),
                Some(Entry::Value { .. }) => return Err(wrong_type(key)),
            };
            // Like Redis, an emptied set stops existing.
            if matches!(entries.get(key), Some(Entry::Set(m)) if m.is_empty()) {
                entries.remove(key);
            }
            Ok(removed)
        })
    }
}
