pub mod feed;
pub mod tracker;
pub mod unified;
pub mod watchdog;

pub use feed::{FeedAdapter, FeedConnector, FeedEvent, FeedHandle, FeedStream, FillListener};
pub use tracker::{ExecutionRateTracker, SpreadTracker};
pub use unified::UnifiedBook;
pub use watchdog::{FeedFactory, OrderbookWatchdog, WatchdogConfig};
