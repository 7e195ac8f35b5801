// src/lookup.rs

use async_trait::async_trait;
use log::debug;
use parking_lot::RwLock;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

use crate::models::server::ServerSnapshot;

#[derive(Debug, Error)]
pub enum LookupError {
    #[error("lookup API session is not open")]
    NotConnected,

    #[error("lookup API request failed: {0}")]
    Http(#[from] reqwest::Error),
}

#[async_trait]
pub trait UrlLookup: Send + Sync {
    async fn connect(&self) -> Result<(), LookupError>;

    async fn close(&self);

    /// Listing URL for the server at `address`, if the API knows it.
    async fn listing_url(&self, address: &str, snapshot: &ServerSnapshot) -> Result<Option<String>, LookupError>;
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    data: Vec<ListedServer>,
}

#[derive(Debug, Deserialize)]
struct ListedServer {
    id: String,
    attributes: ListedAttributes,
    #[serde(default)]
    relationships: Option<Relationships>,
}

#[derive(Debug, Deserialize)]
struct ListedAttributes {
    ip: String,
    port: u16,
    #[serde(rename = "portQuery", default)]
    port_query: Option<u16>,
}

#[derive(Debug, Deserialize)]
struct Relationships {
    game: Option<Related>,
}

#[derive(Debug, Deserialize)]
struct Related {
    data: RelatedId,
}

#[derive(Debug, Deserialize)]
struct RelatedId {
    id: String,
}

/// BattleMetrics server search.
pub struct BattleMetricsLookup {
    api_url: String,
    timeout: Duration,
    client: RwLock<Option<reqwest::Client>>,
}

impl BattleMetricsLookup {
    pub fn new(api_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            api_url: api_url.into().trim_end_matches('/').to_string(),
            timeout,
            client: RwLock::new(None),
        }
    }
}

fn pick_listing(address: &str, response: &SearchResponse) -> Option<String> {
    let (host, port) = address.rsplit_once(':')?;
    let port: u16 = port.parse().ok()?;

    response
        .data
        .iter()
        .find(|s| s.attributes.ip == host && (s.attributes.port == port || s.attributes.port_query == Some(port)))
        .map(|s| {
            let game = s
                .relationships
                .as_ref()
                .and_then(|r| r.game.as_ref())
                .map(|g| g.data.id.as_str())
                .unwrap_or("ark");
            format!("https://www.battlemetrics.com/servers/{}/{}", game, s.id)
        })
}

#[async_trait]
impl UrlLookup for BattleMetricsLookup {
    async fn connect(&self) -> Result<(), LookupError> {
        let client = reqwest::Client::builder().timeout(self.timeout).build()?;
        *self.client.write() = Some(client);
        Ok(())
    }

    async fn close(&self) {
        self.client.write().take();
    }

    async fn listing_url(&self, address: &str, snapshot: &ServerSnapshot) -> Result<Option<String>, LookupError> {
        let client = self.client.read().clone().ok_or(LookupError::NotConnected)?;
        let response: SearchResponse = client
            .get(format!("{}/servers", self.api_url))
            .query(&[("filter[search]", snapshot.display_name()), ("page[size]", "10")])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let url = pick_listing(address, &response);
        debug!("Listing lookup for {}: {:?}", address, url);
        Ok(url)
    }
}
