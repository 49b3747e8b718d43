pub mod config;
pub mod error;
pub mod exchange;
pub mod execution;
pub mod manager;
pub mod orderbook;
pub mod persist;
pub mod testing;
pub mod types;
pub mod utils;

pub use error::{Result, TraderError};
pub use exchange::ExchangeAdapter;
pub use execution::{ExchangeEngine, ExecutionParams, MultiExchangeCoordinator};
pub use manager::ExchangeClientsManager;
pub use orderbook::{
    FeedAdapter, FeedConnector, FeedHandle, OrderbookWatchdog, UnifiedBook, WatchdogConfig,
};
pub use persist::{OrderHistory, SqliteOrderHistory};
