// src/cache.rs
use std::collections::BTreeMap;

use crate::models::server::{ServerId, ServerRecord};
use crate::storage::{RecordStore, StoreError};

/// Per-cycle snapshot of every known server, keyed by id.
///
/// Rebuilt wholesale by `refresh`; nothing patches it in place.
#[derive(Debug, Default)]
pub struct ServerStateStore {
    records: BTreeMap<ServerId, ServerRecord>,
}

impl ServerStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the snapshot with the store's current contents.
    ///
    /// On error the previous snapshot is left as it was.
    pub async fn refresh(&mut self, store: &dyn RecordStore) -> Result<usize, StoreError> {
        let records = store.list_all_servers().await?;
        self.records = records.into_iter().map(|r| (r.id, r)).collect();
        Ok(self.records.len())
    }

    pub fn lookup(&self, id: ServerId) -> Option<&ServerRecord> {
        self.records.get(&id)
    }

    /// Servers to poll this cycle, in id order, sentinels excluded.
    pub fn pollable(&self) -> Vec<&ServerRecord> {
        self.records.values().filter(|r| !r.is_sentinel()).collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryStore;

    #[tokio::test]
    async fn test_refresh_replaces_snapshot() {
        let store = MemoryStore::new();
        let a = store.register_server("10.0.0.1:27015").await.unwrap();
        let b = store.register_server("10.0.0.2:27015").await.unwrap();

        let mut cache = ServerStateStore::new();
        assert_eq!(cache.refresh(&store).await.unwrap(), 2);
        assert_eq!(cache.lookup(a).unwrap().address, "10.0.0.1:27015");

        store.delete_server(b).await.unwrap();
        cache.refresh(&store).await.unwrap();
        assert!(cache.lookup(b).is_none());
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_lookup_miss_is_none() {
        let cache = ServerStateStore::new();
        assert!(cache.is_empty());
        assert!(cache.lookup(42).is_none());
    }

    #[tokio::test]
    async fn test_pollable_skips_sentinels() {
        let store = MemoryStore::new();
        store.insert_server(ServerRecord::registered(0, "0.0.0.0:0"));
        store.insert_server(ServerRecord::registered(2, "10.0.0.2:27015"));
        store.insert_server(ServerRecord::registered(1, "10.0.0.1:27015"));

        let mut cache = ServerStateStore::new();
        cache.refresh(&store).await.unwrap();
        let ids: Vec<ServerId> = cache.pollable().iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_previous_snapshot() {
        let store = MemoryStore::new();
        store.register_server("10.0.0.1:27015").await.unwrap();

        let mut cache = ServerStateStore::new();
        cache.refresh(&store).await.unwrap();
        store.close().await;
        assert!(cache.refresh(&store).await.is_err());
        assert_eq!(cache.len(), 1);
    }
}
