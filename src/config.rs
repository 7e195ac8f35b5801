use std::env;
use std::num::NonZeroU32;
use std::time::Duration;
use governor::Quota;

#[derive(Clone, Debug)]
pub struct Config {
    // Poller
    pub poll_interval_secs: u64,
    pub workers_count: usize,
    pub query_timeout_secs: u64,
    pub shutdown_grace_secs: u64,

    // Record store
    pub database_url: Option<String>,
    pub db_max_connections: u32,
    pub db_acquire_timeout_secs: u64,

    // Collaborators
    pub operator_webhook_url: Option<String>,
    pub lookup_api_url: String,
    pub lookup_enabled: bool,

    // Status API
    pub bind_address: String,
    pub port: u16,
    pub api_period_secs: u64,
    pub api_burst_limit: u32,
    pub register_period_secs: u64,
    pub register_burst_limit: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            poll_interval_secs: 110,
            workers_count: 10,
            query_timeout_secs: 5,
            shutdown_grace_secs: 5,
            database_url: None,
            db_max_connections: 10,
            db_acquire_timeout_secs: 30,
            operator_webhook_url: None,
            lookup_api_url: "https://api.battlemetrics.com".to_string(),
            lookup_enabled: true,
            bind_address: "0.0.0.0".to_string(),
            port: 8080,
            api_period_secs: 5,
            api_burst_limit: 30,
            register_period_secs: 10,
            register_burst_limit: 3,
        }
    }
}

fn parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn non_empty(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

impl Config {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        // A zero bound would never make progress.
        let workers_count = parsed("WORKERS_COUNT", defaults.workers_count).max(1);

        Self {
            poll_interval_secs: parsed("POLL_INTERVAL_SECS", defaults.poll_interval_secs),
            workers_count,
            query_timeout_secs: parsed("QUERY_TIMEOUT_SECS", defaults.query_timeout_secs),
            shutdown_grace_secs: parsed("SHUTDOWN_GRACE_SECS", defaults.shutdown_grace_secs),

            database_url: non_empty("DATABASE_URL"),
            // One pooled connection per in-flight persist by default.
            db_max_connections: parsed("DB_MAX_CONNECTIONS", workers_count as u32),
            db_acquire_timeout_secs: parsed("DB_ACQUIRE_TIMEOUT_SECS", defaults.db_acquire_timeout_secs),

            operator_webhook_url: non_empty("OPERATOR_WEBHOOK_URL"),
            lookup_api_url: non_empty("LOOKUP_API_URL").unwrap_or(defaults.lookup_api_url),
            lookup_enabled: parsed("LOOKUP_ENABLED", defaults.lookup_enabled),

            bind_address: non_empty("BIND_ADDRESS").unwrap_or(defaults.bind_address),
            port: parsed("PORT", defaults.port),
            api_period_secs: parsed("API_PERIOD_SECS", defaults.api_period_secs),
            api_burst_limit: parsed("API_BURST_LIMIT", defaults.api_burst_limit),
            register_period_secs: parsed("REGISTER_PERIOD_SECS", defaults.register_period_secs),
            register_burst_limit: parsed("REGISTER_BURST_LIMIT", defaults.register_burst_limit),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn api_quota(&self) -> Quota {
        quota(self.api_period_secs, self.api_burst_limit)
    }

    pub fn register_quota(&self) -> Quota {
        quota(self.register_period_secs, self.register_burst_limit)
    }
}

fn quota(period_secs: u64, burst: u32) -> Quota {
    let burst = NonZeroU32::new(burst).unwrap_or(NonZeroU32::MIN);
    Quota::with_period(Duration::from_secs(period_secs.max(1)))
        .unwrap_or_else(|| Quota::per_second(NonZeroU32::MIN))
        .allow_burst(burst)
}
