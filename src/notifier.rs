// src/notifier.rs
use async_trait::async_trait;
use log::{debug, warn};
use serde_json::json;
use std::sync::Arc;
use thiserror::Error;

use crate::models::poll::{TransitionEvent, TransitionKind};
use crate::storage::WatchListStore;

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("delivery request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("target rejected delivery: {0}")]
    Rejected(String),
}

#[async_trait]
pub trait Deliverer: Send + Sync {
    async fn deliver(&self, target: &str, message: &str) -> Result<(), DeliveryError>;
}

/// Delivers by POSTing `{"content": message}` to the watcher's webhook URL.
pub struct WebhookDeliverer {
    client: reqwest::Client,
}

impl WebhookDeliverer {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Deliverer for WebhookDeliverer {
    async fn deliver(&self, target: &str, message: &str) -> Result<(), DeliveryError> {
        let response = self
            .client
            .post(target)
            .json(&json!({ "content": message }))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(DeliveryError::Rejected(response.status().to_string()));
        }
        Ok(())
    }
}

pub fn render(event: &TransitionEvent) -> Option<String> {
    let verb = match event.kind {
        TransitionKind::WentOnline => "went online",
        TransitionKind::WentOffline => "went offline",
        TransitionKind::Unchanged => return None,
    };
    Some(match &event.snapshot {
        Some(s) => format!("Server {} ({}) {}!", s.display_name(), s.map, verb),
        None => format!("Server #{} {}!", event.server_id, verb),
    })
}

/// Fans transition events out to the watchers of each server.
pub struct Dispatcher {
    watchers: Arc<dyn WatchListStore>,
    deliverer: Arc<dyn Deliverer>,
}

impl Dispatcher {
    pub fn new(watchers: Arc<dyn WatchListStore>, deliverer: Arc<dyn Deliverer>) -> Self {
        Self { watchers, deliverer }
    }

    /// Deliver `event` and return how many watchers received it.
    ///
    /// Failures are logged and skipped.
    pub async fn dispatch(&self, event: &TransitionEvent) -> usize {
        let Some(message) = render(event) else {
            return 0;
        };

        let watchers = match self.watchers.watchers_for(event.server_id).await {
            Ok(watchers) => watchers,
            Err(e) => {
                warn!("Could not load watchers for server {}: {}", event.server_id, e);
                return 0;
            }
        };
        if watchers.is_empty() {
            return 0;
        }
        debug!("Found {} watchers for server {}", watchers.len(), event.server_id);

        let mut delivered = 0;
        for watcher in &watchers {
            if event.kind == TransitionKind::WentOffline && watcher.notified_offline {
                continue;
            }

            match self.deliverer.deliver(&watcher.target, &message).await {
                Ok(()) => delivered += 1,
                Err(e) => {
                    warn!(
                        "Delivery to watcher {} for server {} failed: {}",
                        watcher.id, event.server_id, e
                    );
                    continue;
                }
            }

            if event.kind == TransitionKind::WentOffline {
                if let Err(e) = self.watchers.set_notified(watcher.id, true).await {
                    warn!("Could not flag watcher {}: {}", watcher.id, e);
                }
            }
        }

        // Back online: the next offline streak gets announced again.
        if event.kind == TransitionKind::WentOnline {
            for watcher in watchers.iter().filter(|w| w.notified_offline) {
                if let Err(e) = self.watchers.set_notified(watcher.id, false).await {
                    warn!("Could not reset watcher {}: {}", watcher.id, e);
                }
            }
        }

        delivered
    }
}
