//! Coordination store: the only channel nodes share.
//!
//! Everything cross-node (heartbeats, the leader lease, job mirrors, priority
//! queues, inboxes) is a string value under a key from [`StoreKeys`]. Values are
//! JSON; [`read_json`] and [`write_json`] do the encoding.
//!
//! # Backends
//!
//! - [`MemoryStore`]: in-process map with TTLs. Single-node runs and tests.
//! - `RedisStore` (feature `redis`): shared Redis with an atomic Lua
//!   compare-and-swap.
//!
//! Plain writes are last-writer-wins. Shared lists (queues, inboxes, the
//! membership list) go through [`update_list`], which retries a
//! [`CoordinationStore::compare_and_swap`] until no other writer got in between.

pub mod keys;
pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;

use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{MeshError, Result};

pub use keys::StoreKeys;
pub use memory::MemoryStore;
#[cfg(feature = "redis")]
pub use self::redis::RedisStore;

/// Upper bound on compare-and-swap rounds for one list update.
pub const MAX_UPDATE_ATTEMPTS: usize = 1024;

#[async_trait]
pub trait CoordinationStore: Send + Sync + std::fmt::Debug {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Write `value`, expiring it after `ttl` when given.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// Atomically replace the value at `key` if it currently equals `expected`
    /// (`None` meaning absent). A `new` of `None` deletes the key.
    ///
    /// Returns whether the swap happened.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: Option<&str>,
        ttl: Option<Duration>,
    ) -> Result<bool>;
}

/// Read and decode a JSON value.
pub async fn read_json<T: DeserializeOwned>(
    store: &dyn CoordinationStore,
    key: &str,
) -> Result<Option<T>> {
    match store.get(key).await? {
        Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        None => Ok(None),
    }
}

/// Encode and write a JSON value.
pub async fn write_json<T: Serialize + ?Sized>(
    store: &dyn CoordinationStore,
    key: &str,
    value: &T,
    ttl: Option<Duration>,
) -> Result<()> {
    let raw = serde_json::to_string(value)?;
    store.set(key, &raw, ttl).await
}

/// Apply `update` to the JSON list stored at `key` without losing concurrent
/// writes.
///
/// Each round reads the raw value, applies `update` and swaps the result in
/// only if the value is still the one that was read. A lost race retries
/// from a fresh read, so `update` may run more than once.
/// An empty result deletes the key. Returns the list as stored.
pub async fn update_list<T, F>(
    store: &dyn CoordinationStore,
    key: &str,
    mut update: F,
) -> Result<Vec<T>>
where
    T: Serialize + DeserializeOwned,
    F: FnMut(&mut Vec<T>),
{
    for attempt in 0..MAX_UPDATE_ATTEMPTS {
        let current = store.get(key).await?;
        let mut list: Vec<T> = match &current {
            Some(raw) => serde_json::from_str(raw)?,
            None => Vec::new(),
        };
        update(&mut list);

        let next = if list.is_empty() {
            None
        } else {
            Some(serde_json::to_string(&list)?)
        };
        if next == current {
            return Ok(list);
        }
        if store
            .compare_and_swap(key, current.as_deref(), next.as_deref(), None)
            .await?
        {
            return Ok(list);
        }

        tracing::trace!(key, attempt, "List changed underneath update, retrying");
        tokio::task::yield_now().await;
    }

    Err(MeshError::Store(format!(
        "gave up updating {key} after {MAX_UPDATE_ATTEMPTS} conflicting writes"
    )))
}
