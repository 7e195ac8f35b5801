// src/main.rs
mod cache;
mod config;
mod handlers;
mod lookup;
mod models;
mod notifier;
mod operator;
mod query;
mod scheduler;
mod storage;
mod transition;
mod utils;

use actix_web::{web, App, HttpServer};
use anyhow::Context;
use env_logger::Env;
use governor::RateLimiter;
use log::{info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::config::Config;
use crate::handlers::ApiState;
use crate::lookup::{BattleMetricsLookup, UrlLookup};
use crate::notifier::{Dispatcher, WebhookDeliverer};
use crate::operator::{LogOperatorChannel, OperatorChannel, WebhookOperatorChannel};
use crate::query::a2s::A2sClient;
use crate::query::QueryClient;
use crate::scheduler::{Scheduler, SchedulerConfig};
use crate::storage::memory::MemoryStore;
use crate::storage::postgres::{PgPoolConfig, PgStore};
use crate::storage::{RecordStore, WatchListStore};
use crate::utils::{ApiLimiter, RegisterLimiter};

fn build_stores(config: &Config) -> (Arc<dyn RecordStore>, Arc<dyn WatchListStore>) {
    match &config.database_url {
        Some(url) => {
            let pool = PgPoolConfig {
                max_connections: config.db_max_connections,
                acquire_timeout: Duration::from_secs(config.db_acquire_timeout_secs),
                ..PgPoolConfig::default()
            };
            let store = Arc::new(PgStore::new(url.clone(), pool));
            (store.clone(), store)
        }
        None => {
            warn!("DATABASE_URL not set, server records will not outlive the process");
            let store = Arc::new(MemoryStore::new());
            (store.clone(), store)
        }
    }
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    env_logger::init_from_env(Env::default().default_filter_or("info"));

    let config = Config::from_env();
    let (store, watchers) = build_stores(&config);

    let operator: Arc<dyn OperatorChannel> = match &config.operator_webhook_url {
        Some(url) => Arc::new(WebhookOperatorChannel::new(url.clone())),
        None => Arc::new(LogOperatorChannel),
    };
    let query: Arc<dyn QueryClient> = Arc::new(A2sClient::new());
    let lookup: Option<Arc<dyn UrlLookup>> = config.lookup_enabled.then(|| {
        Arc::new(BattleMetricsLookup::new(config.lookup_api_url.clone(), config.query_timeout())) as Arc<dyn UrlLookup>
    });
    let http = reqwest::Client::builder()
        .timeout(config.query_timeout())
        .build()
        .context("failed to build webhook client")?;
    let dispatcher = Dispatcher::new(watchers.clone(), Arc::new(WebhookDeliverer::new(http)));

    let scheduler = Scheduler::new(
        SchedulerConfig::from_config(&config),
        store.clone(),
        query.clone(),
        lookup,
        dispatcher,
        operator,
    );
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let poller = tokio::spawn(scheduler.run(shutdown_rx));

    let state = web::Data::new(ApiState {
        store,
        watchers,
        query,
        query_timeout: config.query_timeout(),
    });
    let api_limiter = web::Data::new(ApiLimiter(RateLimiter::keyed(config.api_quota())));
    let register_limiter = web::Data::new(RegisterLimiter(RateLimiter::keyed(config.register_quota())));

    let bind = format!("{}:{}", config.bind_address, config.port);
    info!("Starting status API on {}", bind);
    let served = HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            .app_data(api_limiter.clone())
            .app_data(register_limiter.clone())
            .configure(handlers::configure)
    })
    .bind(&bind)
    .with_context(|| format!("failed to bind {}", bind))?
    .run()
    .await;

    info!("Status API stopped, shutting down poller");
    // The receiver may already be gone if the poller task died.
    let _ = shutdown_tx.send(true);
    poller.await.context("poller task panicked")?;

    served.context("status API failed")?;
    Ok(())
}
