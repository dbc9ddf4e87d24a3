//! KV store seam
//!
//! Hash-field operations only; batch counters rely on the store's atomic
//! increment so concurrent stage consumers never race each other.

use std::collections::BTreeMap;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;

use crate::Result;

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn hash_set(&self, key: &str, fields: &[(String, String)]) -> Result<()>;

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>>;

    async fn hash_get_all(&self, key: &str) -> Result<Option<BTreeMap<String, String>>>;

    /// Atomic increment; creates the field at `by` when absent.
    async fn hash_incr(&self, key: &str, field: &str, by: i64) -> Result<i64>;

    async fn expire_at(&self, key: &str, epoch: i64) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<()>;
}

/// In-process KV store for tests and single-node runs. Expirations are
/// recorded, not enforced.
#[derive(Default)]
pub struct MemoryKvStore {
    hashes: DashMap<String, Mutex<BTreeMap<String, String>>>,
    expirations: DashMap<String, i64>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Recorded expiry epoch for a key, if any.
    pub fn expiry_of(&self, key: &str) -> Option<i64> {
        self.expirations.get(key).map(|e| *e)
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn hash_set(&self, key: &str, fields: &[(String, String)]) -> Result<()> {
        let entry = self
            .hashes
            .entry(key.to_string())
            .or_insert_with(|| Mutex::new(BTreeMap::new()));
        let mut hash = entry.lock();
        for (field, value) in fields {
            hash.insert(field.clone(), value.clone());
        }
        Ok(())
    }

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>> {
        Ok(self
            .hashes
            .get(key)
            .and_then(|h| h.lock().get(field).cloned()))
    }

    async fn hash_get_all(&self, key: &str) -> Result<Option<BTreeMap<String, String>>> {
        Ok(self.hashes.get(key).map(|h| h.lock().clone()))
    }

    async fn hash_incr(&self, key: &str, field: &str, by: i64) -> Result<i64> {
        let entry = self
            .hashes
            .entry(key.to_string())
            .or_insert_with(|| Mutex::new(BTreeMap::new()));
        let mut hash = entry.lock();
        let current: i64 = hash
            .get(field)
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let next = current + by;
        hash.insert(field.to_string(), next.to_string());
        Ok(next)
    }

    async fn expire_at(&self, key: &str, epoch: i64) -> Result<()> {
        self.expirations.insert(key.to_string(), epoch);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.hashes.remove(key);
        self.expirations.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn incr_is_create_and_add() {
        let kv = MemoryKvStore::new();
        assert_eq!(kv.hash_incr("Sr_b1", "good_count", 1).await.unwrap(), 1);
        assert_eq!(kv.hash_incr("Sr_b1", "good_count", 2).await.unwrap(), 3);
        assert_eq!(
            kv.hash_get("Sr_b1", "good_count").await.unwrap().as_deref(),
            Some("3")
        );
    }

    #[tokio::test]
    async fn delete_removes_hash_and_expiry() {
        let kv = MemoryKvStore::new();
        kv.hash_set("Sr_b1", &[("state".into(), "PROCESSING".into())])
            .await
            .unwrap();
        kv.expire_at("Sr_b1", 12345).await.unwrap();
        assert_eq!(kv.expiry_of("Sr_b1"), Some(12345));

        kv.delete("Sr_b1").await.unwrap();
        assert!(kv.hash_get_all("Sr_b1").await.unwrap().is_none());
        assert_eq!(kv.expiry_of("Sr_b1"), None);
    }
}
