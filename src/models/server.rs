// src/models/server.rs
use serde::{Deserialize, Serialize};

pub type ServerId = i64;

/// Schema version written into every stored snapshot.
pub const SNAPSHOT_SCHEMA_VERSION: u16 = 1;

fn current_schema() -> u16 {
    SNAPSHOT_SCHEMA_VERSION
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerEntry {
    pub name: String,
    pub session_secs: u64,
}

/// Server attributes from the last successful state query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerSnapshot {
    #[serde(default = "current_schema")]
    pub schema_version: u16,
    pub name: String,
    pub map: String,
    pub game: String,
    pub version: String,
    pub players: u8,
    pub max_players: u8,
    pub ping_ms: u64,
    /// Community listing page, filled in by the auxiliary lookup.
    #[serde(default)]
    pub battle_url: Option<String>,
}

impl ServerSnapshot {
    /// Hostname without the trailing ` - (v123.4)` many servers append.
    pub fn display_name(&self) -> &str {
        let name = self.name.trim();
        match name.rfind(" - (") {
            Some(pos) if pos > 0 && name.ends_with(')') => name[..pos].trim(),
            _ => name,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayersSnapshot {
    #[serde(default = "current_schema")]
    pub schema_version: u16,
    pub players: Vec<PlayerEntry>,
}

impl PlayersSnapshot {
    pub fn new(players: Vec<PlayerEntry>) -> Self {
        Self {
            schema_version: SNAPSHOT_SCHEMA_VERSION,
            players,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerRecord {
    pub id: ServerId,
    pub address: String,
    pub last_known_online: bool,
    pub offline_streak: u32,
    pub server_snapshot: Option<ServerSnapshot>,
    pub players_snapshot: Option<PlayersSnapshot>,
}

impl ServerRecord {
    /// A freshly registered server that has never been polled.
    pub fn registered(id: ServerId, address: impl Into<String>) -> Self {
        Self {
            id,
            address: address.into(),
            last_known_online: false,
            offline_streak: 0,
            server_snapshot: None,
            players_snapshot: None,
        }
    }

    pub fn is_sentinel(&self) -> bool {
        self.id <= 0
    }
}
