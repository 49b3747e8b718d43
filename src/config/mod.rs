use crate::error::{Result, TraderError};
use log::{info, warn};
use std::env;
use std::time::Duration;

/// Process-level configuration, sourced from the environment. Call
/// `dotenv::dotenv()` before `from_env` so a local `.env` file is honored.
#[derive(Debug, Clone)]
pub struct Config {
    /// Exchanges to bring up, comma separated (e.g. "kraken,bitstamp").
    pub exchanges: Vec<String>,
    /// Pairs to track on every exchange, canonical "BASE-QUOTE" form.
    pub pairs: Vec<String>,
    /// Path of the SQLite order-history database.
    pub db_path: String,
    /// Watchdog poll interval.
    pub watchdog_interval: Duration,
    /// Depth of the book snapshot the watchdog compares between polls.
    pub watchdog_snapshot_depth: usize,
    /// Consecutive empty polls before an adapter is restarted.
    pub watchdog_empty_streak: u32,
    /// Enables timed/adaptive execution paths. When false only immediate
    /// orders are accepted.
    pub enable_timed_execution: bool,
    /// Default maximum size of a single timed-order slice.
    pub max_order_size: f64,
}

fn env_var(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> Result<T> {
    match env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| TraderError::ConfigError(format!("Invalid value for {}: {}", name, raw))),
        Err(_) => Ok(default),
    }
}

fn env_list(name: &str, default: &str) -> Vec<String> {
    env_var(name, default)
        .split(',')
        .map(|s| s.trim().to_lowercase())
        .filter(|s| !s.is_empty())
        .collect()
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let watchdog_interval_sec: u64 = env_parse("WATCHDOG_INTERVAL_SEC", 20)?;
        Ok(Self {
            exchanges: env_list("EXCHANGES", ""),
            pairs: env_list("PAIRS", "btc-usd")
                .into_iter()
                .map(|p| p.to_uppercase())
                .collect(),
            db_path: env_var("ORDER_DB_PATH", "orders.db"),
            watchdog_interval: Duration::from_secs(watchdog_interval_sec),
            watchdog_snapshot_depth: env_parse("WATCHDOG_SNAPSHOT_DEPTH", 8)?,
            watchdog_empty_streak: env_parse("WATCHDOG_EMPTY_STREAK", 3)?,
            enable_timed_execution: env_parse("ENABLE_TIMED_EXECUTION", true)?,
            max_order_size: env_parse("MAX_ORDER_SIZE", 1.0)?,
        })
    }

    /// Sanity-checks the values and logs the effective configuration.
    pub fn validate_and_log(&self) -> Result<()> {
        if self.pairs.is_empty() {
            return Err(TraderError::ConfigError(
                "PAIRS must name at least one pair".to_string(),
            ));
        }
        for pair in &self.pairs {
            if crate::types::AssetPair::parse(pair).is_none() {
                return Err(TraderError::ConfigError(format!(
                    "PAIRS entry is not BASE-QUOTE form: {}",
                    pair
                )));
            }
        }
        if self.max_order_size <= 0.0 {
            return Err(TraderError::ConfigError(format!(
                "MAX_ORDER_SIZE must be positive, got {}",
                self.max_order_size
            )));
        }
        if self.watchdog_snapshot_depth == 0 {
            return Err(TraderError::ConfigError(
                "WATCHDOG_SNAPSHOT_DEPTH must be at least 1".to_string(),
            ));
        }
        if self.exchanges.is_empty() {
            warn!("EXCHANGES is empty; nothing will be brought up.");
        }

        info!("--- Configuration ---");
        info!("Exchanges: {:?}", self.exchanges);
        info!("Pairs: {:?}", self.pairs);
        info!("Order DB: {}", self.db_path);
        info!(
            "Watchdog: every {:?}, snapshot depth {}, empty streak {}",
            self.watchdog_interval, self.watchdog_snapshot_depth, self.watchdog_empty_streak
        );
        info!("Timed execution enabled: {}", self.enable_timed_execution);
        info!("Max order size: {}", self.max_order_size);
        info!("---------------------");
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            exchanges: Vec::new(),
            pairs: vec!["BTC-USD".to_string()],
            db_path: "orders.db".to_string(),
            watchdog_interval: Duration::from_secs(20),
            watchdog_snapshot_depth: 8,
            watchdog_empty_streak: 3,
            enable_timed_execution: true,
            max_order_size: 1.0,
        }
    }
}
