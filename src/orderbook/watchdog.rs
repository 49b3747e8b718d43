use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use log::{debug, error, info};
use tokio::task::JoinHandle;

use crate::orderbook::feed::{lock_or_recover, read_or_recover, write_or_recover, FeedAdapter, FeedHandle};
use crate::orderbook::unified::UnifiedBook;
use crate::types::{AssetPair, BookSnapshot, FeeMode};

/// Builds a fresh adapter for an exchange; called on every restart.
pub type FeedFactory = Box<dyn Fn() -> Arc<FeedAdapter> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct WatchdogConfig {
    pub interval: Duration,
    /// Depth of the per-pair snapshot compared between polls.
    pub snapshot_depth: usize,
    /// A side shorter than this never counts as frozen; shallow books churn
    /// too slowly to tell a freeze from a quiet market.
    pub frozen_min_depth: usize,
    /// Consecutive empty polls before a restart.
    pub empty_streak_threshold: u32,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(20),
            snapshot_depth: 8,
            frozen_min_depth: 5,
            empty_streak_threshold: 3,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct CompareResult {
    pub frozen: bool,
    pub empty: bool,
    pub invalid: bool,
}

struct WatchdogEntry {
    handle: Arc<FeedHandle>,
    factory: FeedFactory,
    pairs: Vec<AssetPair>,
}

/// Supervises feed adapters: polls depth-limited snapshots on an interval
/// and restarts an exchange whose book is frozen, crossed, or has stayed
/// empty for several polls in a row. Restarts swap the new adapter into the
/// shared handle, the main unified book, and any unified book a running
/// multi-exchange session registered.
pub struct OrderbookWatchdog {
    entries: RwLock<HashMap<String, WatchdogEntry>>,
    unified: Arc<UnifiedBook>,
    config: WatchdogConfig,
    running: AtomicBool,
    handle: Mutex<Option<JoinHandle<()>>>,
    registered_books: Mutex<HashMap<String, Arc<UnifiedBook>>>,
}

impl OrderbookWatchdog {
    pub fn new(unified: Arc<UnifiedBook>, config: WatchdogConfig) -> Arc<Self> {
        Arc::new(Self {
            entries: RwLock::new(HashMap::new()),
            unified,
            config,
            running: AtomicBool::new(false),
            handle: Mutex::new(None),
            registered_books: Mutex::new(HashMap::new()),
        })
    }

    /// Puts one exchange under supervision. The handle's current adapter is
    /// used as-is; `factory` builds its replacements.
    pub fn supervise(&self, handle: Arc<FeedHandle>, factory: FeedFactory, pairs: Vec<AssetPair>) {
        let exchange = handle.current().exchange().to_string();
        let mut entries = write_or_recover(&self.entries);
        entries.insert(
            exchange,
            WatchdogEntry {
                handle,
                factory,
                pairs,
            },
        );
    }

    pub fn feed_handle(&self, exchange: &str) -> Option<Arc<FeedHandle>> {
        let entries = read_or_recover(&self.entries);
        entries.get(exchange).map(|e| e.handle.clone())
    }

    pub fn unified(&self) -> Arc<UnifiedBook> {
        self.unified.clone()
    }

    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let this = Arc::clone(self);
        let task = tokio::spawn(async move { this.run().await });
        *lock_or_recover(&self.handle) = Some(task);
        info!("orderbook watchdog started");
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(task) = lock_or_recover(&self.handle).take() {
            task.abort();
        }
        info!("orderbook watchdog stopped");
    }

    /// Lets a running session receive adapter swaps in its own merged book.
    pub fn register_orderbook(&self, session_id: &str, book: Arc<UnifiedBook>) {
        let mut books = lock_or_recover(&self.registered_books);
        books.insert(session_id.to_string(), book);
    }

    pub fn unregister_orderbook(&self, session_id: &str) {
        let mut books = lock_or_recover(&self.registered_books);
        books.remove(session_id);
    }

    async fn run(self: Arc<Self>) {
        let mut baselines: HashMap<String, HashMap<AssetPair, BookSnapshot>> = HashMap::new();
        let mut empty_streaks: HashMap<String, u32> = HashMap::new();

        while self.running.load(Ordering::SeqCst) {
            tokio::time::sleep(self.config.interval).await;

            for exchange in self.supervised_exchanges() {
                let Some(current) = self.take_snapshots(&exchange) else {
                    continue;
                };
                let mut restarted = false;
                let result = compare_books(
                    &current,
                    baselines.get(&exchange),
                    self.config.frozen_min_depth,
                );
                debug!("watchdog {}: {:?}", exchange, result);
                if result.frozen || result.invalid {
                    error!(
                        "watchdog: restarting {} ({})",
                        exchange,
                        if result.frozen { "frozen book" } else { "crossed book" }
                    );
                    empty_streaks.insert(exchange.clone(), 0);
                    self.restart_exchange(&exchange);
                    restarted = true;
                } else if result.empty {
                    let streak = empty_streaks.entry(exchange.clone()).or_insert(0);
                    *streak += 1;
                    error!("watchdog: {} book empty ({} polls)", exchange, streak);
                    if *streak >= self.config.empty_streak_threshold {
                        error!("watchdog: restarting {} (empty book)", exchange);
                        empty_streaks.insert(exchange.clone(), 0);
                        self.restart_exchange(&exchange);
                        restarted = true;
                    }
                } else {
                    empty_streaks.insert(exchange.clone(), 0);
                }
                if restarted {
                    // fresh adapter, nothing meaningful to compare against yet
                    baselines.remove(&exchange);
                } else {
                    baselines.insert(exchange.clone(), current);
                }
            }
        }
    }

    fn supervised_exchanges(&self) -> Vec<String> {
        let entries = read_or_recover(&self.entries);
        let mut names: Vec<String> = entries.keys().cloned().collect();
        names.sort();
        names
    }

    fn take_snapshots(&self, exchange: &str) -> Option<HashMap<AssetPair, BookSnapshot>> {
        let entries = read_or_recover(&self.entries);
        let entry = entries.get(exchange)?;
        let adapter = entry.handle.current();
        Some(
            entry
                .pairs
                .iter()
                .map(|pair| {
                    (
                        pair.clone(),
                        adapter.get_current_partial_book(pair, self.config.snapshot_depth, FeeMode::None),
                    )
                })
                .collect(),
        )
    }

    /// Stops the exchange's adapter, builds a replacement through the
    /// factory, and swaps it in everywhere.
    pub fn restart_exchange(&self, exchange: &str) {
        let (handle, replacement) = {
            let entries = read_or_recover(&self.entries);
            let Some(entry) = entries.get(exchange) else {
                return;
            };
            (entry.handle.clone(), (entry.factory)())
        };
        replacement.start();
        let old = handle.swap(replacement.clone());
        old.stop();

        self.unified.set_adapter(exchange.to_string(), Some(replacement.clone()));
        let books = lock_or_recover(&self.registered_books);
        for book in books.values() {
            book.set_adapter(exchange.to_string(), Some(replacement.clone()));
        }
        info!("watchdog: {} restarted", exchange);
    }
}

/// Classifies the current snapshots. Empty and crossed books need no
/// history; frozen compares against the previous poll when one exists.
/// Pairs are checked independently; one frozen or crossed pair condemns
/// the exchange.
pub(crate) fn compare_books(
    current: &HashMap<AssetPair, BookSnapshot>,
    previous: Option<&HashMap<AssetPair, BookSnapshot>>,
    frozen_min_depth: usize,
) -> CompareResult {
    let mut result = CompareResult::default();
    for (pair, curr) in current {
        if curr.asks.is_empty() || curr.bids.is_empty() {
            result.empty = true;
        } else if curr.asks[0].price < curr.bids[0].price {
            result.invalid = true;
            break;
        } else if let Some(prev) = previous.and_then(|books| books.get(pair)) {
            if side_identical(&prev.asks, &curr.asks, frozen_min_depth)
                && side_identical(&prev.bids, &curr.bids, frozen_min_depth)
            {
                result.frozen = true;
                break;
            }
        }
    }
    result
}

fn side_identical(
    prev: &[crate::types::PriceLevel],
    curr: &[crate::types::PriceLevel],
    min_depth: usize,
) -> bool {
    if prev.len() != curr.len() || curr.len() < min_depth {
        return false;
    }
    prev.iter()
        .zip(curr.iter())
        .all(|(a, b)| a.price == b.price && a.size == b.size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PriceLevel;
    use pretty_assertions::assert_eq;

    fn pair() -> AssetPair {
        AssetPair::new("BTC", "USD")
    }

    fn levels(prices: &[f64]) -> Vec<PriceLevel> {
        prices.iter().map(|&p| PriceLevel::new(p, 1.0, "x")).collect()
    }

    fn snapshot(asks: &[f64], bids: &[f64]) -> HashMap<AssetPair, BookSnapshot> {
        let mut map = HashMap::new();
        map.insert(
            pair(),
            BookSnapshot {
                asks: levels(asks),
                bids: levels(bids),
            },
        );
        map
    }

    #[test]
    fn identical_deep_books_are_frozen() {
        let prev = snapshot(&[100.0, 101.0, 102.0, 103.0, 104.0], &[99.0, 98.0, 97.0, 96.0, 95.0]);
        let curr = prev.clone();
        let result = compare_books(&curr, Some(&prev), 5);
        assert!(result.frozen);
        assert!(!result.empty);
        assert!(!result.invalid);
    }

    #[test]
    fn shallow_identical_books_are_not_frozen() {
        let prev = snapshot(&[100.0, 101.0], &[99.0, 98.0]);
        let result = compare_books(&prev.clone(), Some(&prev), 5);
        assert_eq!(result, CompareResult::default());
    }

    #[test]
    fn one_changed_side_is_not_frozen() {
        let prev = snapshot(&[100.0, 101.0, 102.0, 103.0, 104.0], &[99.0, 98.0, 97.0, 96.0, 95.0]);
        let mut curr = prev.clone();
        curr.get_mut(&pair()).unwrap().bids[0].size = 2.0;
        let result = compare_books(&curr, Some(&prev), 5);
        assert!(!result.frozen);
    }

    #[test]
    fn missing_side_is_empty() {
        let prev = snapshot(&[100.0], &[99.0]);
        let curr = snapshot(&[100.0], &[]);
        let result = compare_books(&curr, Some(&prev), 5);
        assert!(result.empty);
        assert!(!result.invalid);
    }

    #[test]
    fn crossed_book_is_invalid() {
        let prev = snapshot(&[100.0], &[99.0]);
        let curr = snapshot(&[98.0], &[99.0]);
        let result = compare_books(&curr, Some(&prev), 5);
        assert!(result.invalid);
    }

    #[test]
    fn empty_book_is_flagged_without_a_baseline() {
        let curr = snapshot(&[100.0], &[]);
        let result = compare_books(&curr, None, 5);
        assert!(result.empty);
        assert!(!result.frozen);
    }

    #[test]
    fn crossed_book_is_flagged_without_a_baseline() {
        let curr = snapshot(&[98.0], &[99.0]);
        assert!(compare_books(&curr, None, 5).invalid);
    }

    #[test]
    fn depth_mismatch_is_not_frozen() {
        let prev = snapshot(&[100.0, 101.0, 102.0, 103.0, 104.0], &[99.0, 98.0, 97.0, 96.0, 95.0]);
        let curr = snapshot(
            &[100.0, 101.0, 102.0, 103.0, 104.0, 105.0],
            &[99.0, 98.0, 97.0, 96.0, 95.0],
        );
        let result = compare_books(&curr, Some(&prev), 5);
        assert!(!result.frozen);
    }
}
