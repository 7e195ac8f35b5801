// src/handlers/mod.rs
pub mod servers;
pub mod watchers;

use actix_web::web;
use std::sync::Arc;
use std::time::Duration;

use crate::query::QueryClient;
use crate::storage::{RecordStore, WatchListStore};

/// Shared by every handler through `web::Data`.
pub struct ApiState {
    pub store: Arc<dyn RecordStore>,
    pub watchers: Arc<dyn WatchListStore>,
    pub query: Arc<dyn QueryClient>,
    pub query_timeout: Duration,
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/servers", web::get().to(servers::list_servers))
        .route("/servers", web::post().to(servers::register_server))
        .route("/servers/{id}", web::get().to(servers::get_server))
        .route("/servers/{id}", web::delete().to(servers::delete_server))
        .route("/servers/{id}/watchers", web::post().to(watchers::add_watcher))
        .route("/servers/{id}/watchers", web::delete().to(watchers::remove_watcher));
}
