use serde::{Deserialize, Serialize};

use crate::models::server::ServerId;

pub type WatcherId = i64;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Watcher {
    pub id: WatcherId,
    pub server_id: ServerId,
    /// Delivery target, a webhook URL.
    pub target: String,
    /// Already told about the current offline streak.
    pub notified_offline: bool,
}
