// src/storage/memory.rs
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use crate::models::poll::RecordUpdate;
use crate::models::server::{ServerId, ServerRecord};
use crate::models::watch::{Watcher, WatcherId};
use crate::storage::{RecordStore, StoreError, WatchListStore};

/// In-process record and watch-list store.
///
/// Used when no database is configured, and by tests.
pub struct MemoryStore {
    servers: DashMap<ServerId, ServerRecord>,
    watchers: DashMap<WatcherId, Watcher>,
    next_server_id: AtomicI64,
    next_watcher_id: AtomicI64,
    connected: AtomicBool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            servers: DashMap::new(),
            watchers: DashMap::new(),
            next_server_id: AtomicI64::new(1),
            next_watcher_id: AtomicI64::new(1),
            connected: AtomicBool::new(true),
        }
    }

    /// Insert a record as-is, keeping its id.
    pub fn insert_server(&self, record: ServerRecord) {
        self.next_server_id.fetch_max(record.id + 1, Ordering::SeqCst);
        self.servers.insert(record.id, record);
    }

    fn ensure_connected(&self) -> Result<(), StoreError> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::NotConnected)
        }
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn connect(&self) -> Result<(), StoreError> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    async fn list_all_servers(&self) -> Result<Vec<ServerRecord>, StoreError> {
        self.ensure_connected()?;
        let mut servers: Vec<ServerRecord> = self.servers.iter().map(|r| r.value().clone()).collect();
        servers.sort_by_key(|s| s.id);
        Ok(servers)
    }

    async fn get_server(&self, id: ServerId) -> Result<Option<ServerRecord>, StoreError> {
        self.ensure_connected()?;
        Ok(self.servers.get(&id).map(|r| r.value().clone()))
    }

    async fn update_server(&self, update: &RecordUpdate) -> Result<bool, StoreError> {
        self.ensure_connected()?;
        let Some(mut record) = self.servers.get_mut(&update.server_id) else {
            return Ok(false);
        };

        record.last_known_online = update.last_known_online;
        record.offline_streak = update.offline_streak;
        if let Some(snapshot) = &update.server_snapshot {
            record.server_snapshot = Some(snapshot.clone());
        }
        if let Some(players) = &update.players_snapshot {
            record.players_snapshot = Some(players.clone());
        }
        Ok(true)
    }

    async fn register_server(&self, address: &str) -> Result<ServerId, StoreError> {
        self.ensure_connected()?;
        // Check if a server with the same address already exists.
        let existing = self
            .servers
            .iter()
            .find(|r| r.value().address == address)
            .map(|r| *r.key());

        if let Some(id) = existing {
            return Ok(id);
        }

        let id = self.next_server_id.fetch_add(1, Ordering::SeqCst);
        self.servers.insert(id, ServerRecord::registered(id, address));
        Ok(id)
    }

    async fn delete_server(&self, id: ServerId) -> Result<bool, StoreError> {
        self.ensure_connected()?;
        let removed = self.servers.remove(&id).is_some();
        if removed {
            self.watchers.retain(|_, w| w.server_id != id);
        }
        Ok(removed)
    }
}

#[async_trait]
impl WatchListStore for MemoryStore {
    async fn watchers_for(&self, server_id: ServerId) -> Result<Vec<Watcher>, StoreError> {
        self.ensure_connected()?;
        let mut watchers: Vec<Watcher> = self
            .watchers
            .iter()
            .filter(|r| r.value().server_id == server_id)
            .map(|r| r.value().clone())
            .collect();
        watchers.sort_by_key(|w| w.id);
        Ok(watchers)
    }

    async fn set_notified(&self, watcher_id: WatcherId, notified: bool) -> Result<(), StoreError> {
        self.ensure_connected()?;
        if let Some(mut watcher) = self.watchers.get_mut(&watcher_id) {
            watcher.notified_offline = notified;
        }
        Ok(())
    }

    async fn add_watcher(&self, server_id: ServerId, target: &str) -> Result<WatcherId, StoreError> {
        self.ensure_connected()?;
        if !self.servers.contains_key(&server_id) {
            return Err(StoreError::UnknownServer(server_id));
        }

        let existing = self
            .watchers
            .iter()
            .find(|r| r.value().server_id == server_id && r.value().target == target)
            .map(|r| *r.key());
        if let Some(id) = existing {
            return Ok(id);
        }

        let id = self.next_watcher_id.fetch_add(1, Ordering::SeqCst);
        self.watchers.insert(
            id,
            Watcher {
                id,
                server_id,
                target: target.to_string(),
                notified_offline: false,
            },
        );
        Ok(id)
    }

    async fn remove_watcher(&self, server_id: ServerId, target: &str) -> Result<bool, StoreError> {
        self.ensure_connected()?;
        let before = self.watchers.len();
        self.watchers
            .retain(|_, w| !(w.server_id == server_id && w.target == target));
        Ok(self.watchers.len() < before)
    }
}
