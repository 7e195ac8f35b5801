// src/storage/mod.rs
//
// Record and watch-list stores.
//
// The poller only ever talks to these traits. `MemoryStore` keeps
// everything in process, `PgStore` persists to Postgres.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use thiserror::Error;

use crate::models::poll::RecordUpdate;
use crate::models::server::{ServerId, ServerRecord};
use crate::models::watch::{Watcher, WatcherId};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record store is not connected")]
    NotConnected,

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("failed to decode {column} for server {id}: {source}")]
    Decode {
        id: ServerId,
        column: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("unsupported {column} schema version {version} for server {id}")]
    SchemaVersion {
        id: ServerId,
        column: &'static str,
        version: u16,
    },

    #[error("server {0} not found")]
    UnknownServer(ServerId),
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Acquire the session used by every other call.
    async fn connect(&self) -> Result<(), StoreError>;

    /// Release the session. Further calls fail with `NotConnected`.
    async fn close(&self);

    /// All records, ordered by id.
    async fn list_all_servers(&self) -> Result<Vec<ServerRecord>, StoreError>;

    async fn get_server(&self, id: ServerId) -> Result<Option<ServerRecord>, StoreError>;

    /// Returns `false` when the record no longer exists.
    async fn update_server(&self, update: &RecordUpdate) -> Result<bool, StoreError>;

    /// Registers `address`, or returns the id it is already registered under.
    async fn register_server(&self, address: &str) -> Result<ServerId, StoreError>;

    async fn delete_server(&self, id: ServerId) -> Result<bool, StoreError>;
}

#[async_trait]
pub trait WatchListStore: Send + Sync {
    async fn watchers_for(&self, server_id: ServerId) -> Result<Vec<Watcher>, StoreError>;

    async fn set_notified(&self, watcher_id: WatcherId, notified: bool) -> Result<(), StoreError>;

    async fn add_watcher(&self, server_id: ServerId, target: &str) -> Result<WatcherId, StoreError>;

    async fn remove_watcher(&self, server_id: ServerId, target: &str) -> Result<bool, StoreError>;
}
