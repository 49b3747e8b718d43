use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use log::{info, LevelFilter};

use crossbook::config::Config;
use crossbook::execution::ExchangeEngine;
use crossbook::manager::ExchangeClientsManager;
use crossbook::orderbook::{FeedAdapter, FeedHandle, OrderbookWatchdog, UnifiedBook, WatchdogConfig};
use crossbook::persist::SqliteOrderHistory;
use crossbook::testing::{MockExchange, ScriptedFeed};
use crossbook::types::{AssetPair, FeeTable};
use crossbook::utils::setup_logging;

/// Multi-exchange orderbook aggregation and adaptive order execution.
///
/// Exchange wire protocols live behind the `FeedConnector` and
/// `ExchangeAdapter` seams; this binary wires the runtime around paper
/// venues so the whole pipeline (feeds, unified book, watchdog, execution
/// sessions, order history) can be run end to end.
#[derive(Parser)]
#[command(name = "crossbook", version)]
struct Args {
    /// SQLite order-history path; overrides ORDER_DB_PATH.
    #[arg(long)]
    db_path: Option<String>,

    /// Log level: error, warn, info, debug or trace.
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    let args = Args::parse();

    let level: LevelFilter = args
        .log_level
        .parse()
        .with_context(|| format!("bad --log-level: {}", args.log_level))?;
    setup_logging(level).context("Failed to initialize logging")?;

    let mut config = Config::from_env()?;
    if let Some(db_path) = args.db_path {
        config.db_path = db_path;
    }
    config.validate_and_log()?;

    let pairs: Vec<AssetPair> = config
        .pairs
        .iter()
        .filter_map(|p| AssetPair::parse(p))
        .collect();

    let history = Arc::new(
        SqliteOrderHistory::open(&config.db_path)
            .with_context(|| format!("cannot open order history at {}", config.db_path))?,
    );

    let unified = UnifiedBook::new();
    let watchdog = OrderbookWatchdog::new(
        unified.clone(),
        WatchdogConfig {
            interval: config.watchdog_interval,
            snapshot_depth: config.watchdog_snapshot_depth,
            empty_streak_threshold: config.watchdog_empty_streak,
            ..WatchdogConfig::default()
        },
    );
    let manager = ExchangeClientsManager::new(watchdog.clone());
    manager.set_timed_execution_enabled(config.enable_timed_execution);

    let mut feeds = Vec::new();
    for name in &config.exchanges {
        let adapter = Arc::new(MockExchange::new(name));
        for pair in &pairs {
            adapter.set_balance(&pair.base, 10.0);
            adapter.set_balance(&pair.quote, 100_000.0);
        }
        let connector = Arc::new(ScriptedFeed::empty(name));
        let feed = FeedAdapter::new(connector.clone(), pairs.clone(), FeeTable::default());
        feed.start();
        feeds.push(feed.clone());

        let handle = FeedHandle::new(feed.clone());
        unified.set_adapter(name.clone(), Some(feed));
        let factory_pairs = pairs.clone();
        watchdog.supervise(
            handle.clone(),
            Box::new(move || {
                FeedAdapter::new(connector.clone(), factory_pairs.clone(), FeeTable::default())
            }),
            pairs.clone(),
        );

        manager.register_engine(ExchangeEngine::new(adapter, handle, history.clone()));
    }

    unified.start_spread_tracking(pairs);
    watchdog.start();
    info!(
        "crossbook up: {} exchange(s), timed execution {}",
        config.exchanges.len(),
        if config.enable_timed_execution {
            "enabled"
        } else {
            "disabled"
        }
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("shutting down");

    manager.cancel_all();
    watchdog.stop();
    unified.stop_spread_tracking();
    for feed in feeds {
        feed.stop();
    }
    Ok(())
}
