use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::error::{MeshError, Result};
use crate::store::CoordinationStore;

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| now < at)
    }
}

/// In-process store with per-key expiry.
///
/// Nodes that share one `Arc<MemoryStore>` form a cluster, which is how the
/// integration tests run several nodes in one process. Expiry follows
/// `tokio::time`, so paused test clocks apply.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, Entry>>,
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every operation fail until switched back, simulating an outage.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of live keys.
    pub async fn len(&self) -> usize {
        let now = Instant::now();
        self.entries.read().await.values().filter(|e| e.is_live(now)).count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(MeshError::Store("store unavailable".to_string()))
        } else {
            Ok(())
        }
    }

    fn entry(value: &str, ttl: Option<Duration>) -> Entry {
        Entry {
            value: value.to_string(),
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        }
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.check_available()?;
        let now = Instant::now();
        let entries = self.entries.read().await;
        Ok(entries
            .get(key)
            .filter(|e| e.is_live(now))
            .map(|e| e.value.clone()))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        self.check_available()?;
        self.entries
            .write()
            .await
            .insert(key.to_string(), Self::entry(value, ttl));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.check_available()?;
        self.entries.write().await.remove(key);
        Ok(())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: Option<&str>,
        ttl: Option<Duration>,
    ) -> Result<bool> {
        self.check_available()?;
        let now = Instant::now();
        let mut entries = self.entries.write().await;

        let current = entries
            .get(key)
            .filter(|e| e.is_live(now))
            .map(|e| e.value.as_str());
        if current != expected {
            return Ok(false);
        }

        match new {
            Some(value) => {
                entries.insert(key.to_string(), Self::entry(value, ttl));
            }
            None => {
                entries.remove(key);
            }
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_get_delete() {
        let store = MemoryStore::new();
        assert_eq!(store.get("k").await.unwrap(), None);

        store.set("k", "v", None).await.unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));

        store.delete("k").await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire_after_ttl() {
        let store = MemoryStore::new();
        store
            .set("lease", "node-1", Some(Duration::from_secs(30)))
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(29)).await;
        assert!(store.get("lease").await.unwrap().is_some());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(store.get("lease").await.unwrap().is_none());
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn compare_and_swap_checks_current_value() {
        let store = MemoryStore::new();

        assert!(store
            .compare_and_swap("leader", None, Some("a"), None)
            .await
            .unwrap());
        assert!(!store
            .compare_and_swap("leader", None, Some("b"), None)
            .await
            .unwrap());
        assert!(!store
            .compare_and_swap("leader", Some("b"), Some("b"), None)
            .await
            .unwrap());
        assert!(store
            .compare_and_swap("leader", Some("a"), Some("b"), None)
            .await
            .unwrap());
        assert_eq!(store.get("leader").await.unwrap().as_deref(), Some("b"));

        assert!(store
            .compare_and_swap("leader", Some("b"), None, None)
            .await
            .unwrap());
        assert_eq!(store.get("leader").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_value_counts_as_absent_for_swap() {
        let store = MemoryStore::new();
        store
            .set("leader", "gone", Some(Duration::from_secs(1)))
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;

        assert!(store
            .compare_and_swap("leader", None, Some("next"), None)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn unavailable_store_fails_every_call() {
        let store = MemoryStore::new();
        store.set_unavailable(true);
        assert!(store.get("k").await.is_err());
        assert!(store.set("k", "v", None).await.is_err());

        store.set_unavailable(false);
        assert!(store.set("k", "v", None).await.is_ok());
    }
}
