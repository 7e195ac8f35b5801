// src/storage/postgres.rs
//
// Postgres-backed record and watch-list store.
//
// Snapshots live in JSONB columns and are decoded into typed records here,
// so nothing past this module ever sees raw JSON.

use async_trait::async_trait;
use log::{info, warn};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::Row;
use std::time::Duration;

use crate::models::poll::RecordUpdate;
use crate::models::server::{ServerId, ServerRecord, SNAPSHOT_SCHEMA_VERSION};
use crate::models::watch::{Watcher, WatcherId};
use crate::storage::{RecordStore, StoreError, WatchListStore};

const SCHEMA: [&str; 2] = [
    "CREATE TABLE IF NOT EXISTS servers (
        id BIGSERIAL PRIMARY KEY,
        address TEXT NOT NULL UNIQUE,
        last_online BOOLEAN NOT NULL DEFAULT FALSE,
        offline_streak BIGINT NOT NULL DEFAULT 0,
        server_snapshot JSONB,
        players_snapshot JSONB
    )",
    "CREATE TABLE IF NOT EXISTS watchers (
        id BIGSERIAL PRIMARY KEY,
        server_id BIGINT NOT NULL REFERENCES servers(id) ON DELETE CASCADE,
        target TEXT NOT NULL,
        notified_offline BOOLEAN NOT NULL DEFAULT FALSE,
        UNIQUE (server_id, target)
    )",
];

const SERVER_COLUMNS: &str =
    "id, address, last_online, offline_streak, server_snapshot, players_snapshot";

/// Database pool configuration
#[derive(Clone, Debug)]
pub struct PgPoolConfig {
    pub max_connections: u32,
    pub acquire_timeout: Duration,
    pub idle_timeout: Duration,
    pub max_lifetime: Duration,
}

impl Default for PgPoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            acquire_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(600),   // 10 minutes
            max_lifetime: Duration::from_secs(1800),  // 30 minutes
        }
    }
}

pub struct PgStore {
    database_url: String,
    config: PgPoolConfig,
    pool: RwLock<Option<PgPool>>,
}

impl PgStore {
    pub fn new(database_url: impl Into<String>, config: PgPoolConfig) -> Self {
        Self {
            database_url: database_url.into(),
            config,
            pool: RwLock::new(None),
        }
    }

    fn pool(&self) -> Result<PgPool, StoreError> {
        self.pool.read().clone().ok_or(StoreError::NotConnected)
    }
}

/// Decode a JSONB snapshot column, rejecting versions newer than we understand.
pub(crate) fn decode_snapshot<T: DeserializeOwned>(
    id: ServerId,
    column: &'static str,
    value: serde_json::Value,
) -> Result<T, StoreError> {
    let version = value
        .get("schema_version")
        .and_then(|v| v.as_u64())
        .unwrap_or(u64::from(SNAPSHOT_SCHEMA_VERSION));
    if version > u64::from(SNAPSHOT_SCHEMA_VERSION) {
        return Err(StoreError::SchemaVersion {
            id,
            column,
            version: u16::try_from(version).unwrap_or(u16::MAX),
        });
    }
    serde_json::from_value(value).map_err(|source| StoreError::Decode { id, column, source })
}

/// An undecodable snapshot is treated as absent; the next successful poll replaces it.
fn snapshot_column<T: DeserializeOwned>(
    row: &PgRow,
    id: ServerId,
    column: &'static str,
) -> Result<Option<T>, StoreError> {
    let raw: Option<Json<serde_json::Value>> = row.try_get(column)?;
    Ok(raw.and_then(|Json(value)| match decode_snapshot(id, column, value) {
        Ok(snapshot) => Some(snapshot),
        Err(e) => {
            warn!("Ignoring stored snapshot: {}", e);
            None
        }
    }))
}

fn record_from_row(row: &PgRow) -> Result<ServerRecord, StoreError> {
    let id: i64 = row.try_get("id")?;
    let streak: i64 = row.try_get("offline_streak")?;
    Ok(ServerRecord {
        id,
        address: row.try_get("address")?,
        last_known_online: row.try_get("last_online")?,
        offline_streak: u32::try_from(streak.max(0)).unwrap_or(u32::MAX),
        server_snapshot: snapshot_column(row, id, "server_snapshot")?,
        players_snapshot: snapshot_column(row, id, "players_snapshot")?,
    })
}

fn watcher_from_row(row: &PgRow) -> Result<Watcher, StoreError> {
    Ok(Watcher {
        id: row.try_get("id")?,
        server_id: row.try_get("server_id")?,
        target: row.try_get("target")?,
        notified_offline: row.try_get("notified_offline")?,
    })
}

#[async_trait]
impl RecordStore for PgStore {
    async fn connect(&self) -> Result<(), StoreError> {
        if self.pool.read().is_some() {
            return Ok(());
        }

        info!(
            "Creating database pool: max={}, acquire_timeout={:?}",
            self.config.max_connections, self.config.acquire_timeout
        );
        let pool = PgPoolOptions::new()
            .max_connections(self.config.max_connections)
            .acquire_timeout(self.config.acquire_timeout)
            .idle_timeout(self.config.idle_timeout)
            .max_lifetime(self.config.max_lifetime)
            .connect(&self.database_url)
            .await?;

        for statement in SCHEMA {
            sqlx::query(statement).execute(&pool).await?;
        }

        info!("Database pool created successfully");
        *self.pool.write() = Some(pool);
        Ok(())
    }

    async fn close(&self) {
        let pool = self.pool.write().take();
        if let Some(pool) = pool {
            pool.close().await;
            info!("Database pool closed");
        }
    }

    async fn list_all_servers(&self) -> Result<Vec<ServerRecord>, StoreError> {
        let pool = self.pool()?;
        let rows = sqlx::query(&format!("SELECT {} FROM servers ORDER BY id", SERVER_COLUMNS))
            .fetch_all(&pool)
            .await?;
        rows.iter().map(record_from_row).collect()
    }

    async fn get_server(&self, id: ServerId) -> Result<Option<ServerRecord>, StoreError> {
        let pool = self.pool()?;
        let row = sqlx::query(&format!("SELECT {} FROM servers WHERE id = $1", SERVER_COLUMNS))
            .bind(id)
            .fetch_optional(&pool)
            .await?;
        row.as_ref().map(record_from_row).transpose()
    }

    async fn update_server(&self, update: &RecordUpdate) -> Result<bool, StoreError> {
        let pool = self.pool()?;
        let result = sqlx::query(
            "UPDATE servers SET last_online = $2, offline_streak = $3,
                server_snapshot = COALESCE($4, server_snapshot),
                players_snapshot = COALESCE($5, players_snapshot)
             WHERE id = $1",
        )
        .bind(update.server_id)
        .bind(update.last_known_online)
        .bind(i64::from(update.offline_streak))
        .bind(update.server_snapshot.as_ref().map(Json))
        .bind(update.players_snapshot.as_ref().map(Json))
        .execute(&pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn register_server(&self, address: &str) -> Result<ServerId, StoreError> {
        let pool = self.pool()?;
        let row = sqlx::query(
            "INSERT INTO servers (address) VALUES ($1)
             ON CONFLICT (address) DO UPDATE SET address = EXCLUDED.address
             RETURNING id",
        )
        .bind(address)
        .fetch_one(&pool)
        .await?;
        Ok(row.try_get("id")?)
    }

    async fn delete_server(&self, id: ServerId) -> Result<bool, StoreError> {
        let pool = self.pool()?;
        let result = sqlx::query("DELETE FROM servers WHERE id = $1")
            .bind(id)
            .execute(&pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl WatchListStore for PgStore {
    async fn watchers_for(&self, server_id: ServerId) -> Result<Vec<Watcher>, StoreError> {
        let pool = self.pool()?;
        let rows = sqlx::query(
            "SELECT id, server_id, target, notified_offline FROM watchers
             WHERE server_id = $1 ORDER BY id",
        )
        .bind(server_id)
        .fetch_all(&pool)
        .await?;
        rows.iter().map(watcher_from_row).collect()
    }

    async fn set_notified(&self, watcher_id: WatcherId, notified: bool) -> Result<(), StoreError> {
        let pool = self.pool()?;
        sqlx::query("UPDATE watchers SET notified_offline = $2 WHERE id = $1")
            .bind(watcher_id)
            .bind(notified)
            .execute(&pool)
            .await?;
        Ok(())
    }

    async fn add_watcher(&self, server_id: ServerId, target: &str) -> Result<WatcherId, StoreError> {
        let pool = self.pool()?;
        let row = sqlx::query(
            "INSERT INTO watchers (server_id, target) VALUES ($1, $2)
             ON CONFLICT (server_id, target) DO UPDATE SET target = EXCLUDED.target
             RETURNING id",
        )
        .bind(server_id)
        .bind(target)
        .fetch_one(&pool)
        .await
        .map_err(|e| {
            let missing_server =
                matches!(&e, sqlx::Error::Database(db) if db.is_foreign_key_violation());
            if missing_server {
                StoreError::UnknownServer(server_id)
            } else {
                StoreError::Database(e)
            }
        })?;
        Ok(row.try_get("id")?)
    }

    async fn remove_watcher(&self, server_id: ServerId, target: &str) -> Result<bool, StoreError> {
        let pool = self.pool()?;
        let result = sqlx::query("DELETE FROM watchers WHERE server_id = $1 AND target = $2")
            .bind(server_id)
            .bind(target)
            .execute(&pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
