use std::cmp::Ordering as CmpOrdering;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use log::info;
use tokio::task::JoinHandle;

use crate::orderbook::feed::{lock_or_recover, read_or_recover, write_or_recover, FeedAdapter};
use crate::orderbook::tracker::SpreadTracker;
use crate::types::{AssetPair, BookSnapshot, FeeMode, FeeTable, PriceLevel, SpreadAndPrice};

const SPREAD_SAMPLE_INTERVAL: Duration = Duration::from_millis(100);

/// A merged view over several exchanges' books. Adapters are registered by
/// exchange name; a slot can be temporarily `None` while the watchdog swaps
/// a restarted adapter in. Reads merge per-exchange snapshots with the
/// requested fee folded in, so the price ordering across venues reflects
/// what a taker/maker would actually pay.
pub struct UnifiedBook {
    adapters: RwLock<HashMap<String, Option<Arc<FeedAdapter>>>>,
    spread: SpreadTracker,
    spread_running: AtomicBool,
    spread_handle: Mutex<Option<JoinHandle<()>>>,
}

impl UnifiedBook {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            adapters: RwLock::new(HashMap::new()),
            spread: SpreadTracker::new(),
            spread_running: AtomicBool::new(false),
            spread_handle: Mutex::new(None),
        })
    }

    pub fn with_adapters(adapters: Vec<Arc<FeedAdapter>>) -> Arc<Self> {
        let book = Self::new();
        for adapter in adapters {
            book.set_adapter(adapter.exchange().to_string(), Some(adapter));
        }
        book
    }

    /// Registers or swaps the adapter serving `exchange`. Passing `None`
    /// blanks the slot without forgetting the exchange.
    pub fn set_adapter(&self, exchange: String, adapter: Option<Arc<FeedAdapter>>) {
        let mut adapters = write_or_recover(&self.adapters);
        adapters.insert(exchange, adapter);
    }

    pub fn exchanges(&self) -> Vec<String> {
        let adapters = read_or_recover(&self.adapters);
        let mut names: Vec<String> = adapters.keys().cloned().collect();
        names.sort();
        names
    }

    fn active_adapters(&self) -> Vec<Arc<FeedAdapter>> {
        // Clone the Arcs under the read lock and release it before touching
        // any adapter, so a watchdog swap never waits on a merge in progress.
        let adapters = read_or_recover(&self.adapters);
        let mut active: Vec<Arc<FeedAdapter>> = adapters.values().flatten().cloned().collect();
        active.sort_by(|a, b| a.exchange().cmp(b.exchange()));
        active
    }

    /// Merged top `depth` levels per side across all registered exchanges.
    /// Asks ascend and bids descend by fee-adjusted price; venues tie-break
    /// in exchange-name order.
    pub fn get_unified_book(&self, pair: &AssetPair, depth: usize, fee_mode: FeeMode) -> BookSnapshot {
        let mut asks: Vec<PriceLevel> = Vec::new();
        let mut bids: Vec<PriceLevel> = Vec::new();
        for adapter in self.active_adapters() {
            let book = adapter.get_current_partial_book(pair, depth, fee_mode);
            asks.extend(book.asks);
            bids.extend(book.bids);
        }
        asks.sort_by(|a, b| cmp_price(a.effective_price(), b.effective_price()));
        bids.sort_by(|a, b| cmp_price(b.effective_price(), a.effective_price()));
        asks.truncate(depth);
        bids.truncate(depth);
        BookSnapshot { asks, bids }
    }

    pub fn get_current_price(&self, pair: &AssetPair) -> (Option<f64>, Option<f64>) {
        let book = self.get_unified_book(pair, 1, FeeMode::None);
        if book.has_both_sides() {
            (
                book.best_ask().map(|l| l.price),
                book.best_bid().map(|l| l.price),
            )
        } else {
            (None, None)
        }
    }

    pub fn spread_and_price(&self, pair: &AssetPair) -> SpreadAndPrice {
        let (ask, bid) = self.get_current_price(pair);
        let spread = match (ask, bid) {
            (Some(a), Some(b)) => a - b,
            _ => 0.0,
        };
        SpreadAndPrice { ask, bid, spread }
    }

    pub fn average_spread(&self, pair: &AssetPair) -> f64 {
        self.spread.average(pair)
    }

    /// Current fee tables per registered exchange.
    pub fn get_fees(&self) -> HashMap<String, FeeTable> {
        let adapters = read_or_recover(&self.adapters);
        adapters
            .iter()
            .filter_map(|(name, slot)| slot.as_ref().map(|a| (name.clone(), a.fees())))
            .collect()
    }

    /// Samples the unified spread on a fixed interval into the moving
    /// average used by execution sessions.
    pub fn start_spread_tracking(self: &Arc<Self>, pairs: Vec<AssetPair>) {
        if self.spread_running.swap(true, Ordering::SeqCst) {
            return;
        }
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SPREAD_SAMPLE_INTERVAL);
            while this.spread_running.load(Ordering::SeqCst) {
                ticker.tick().await;
                for pair in &pairs {
                    let spread = this.spread_and_price(pair).spread;
                    this.spread.observe(pair, spread);
                }
            }
        });
        *lock_or_recover(&self.spread_handle) = Some(handle);
        info!("unified book: spread tracking started");
    }

    pub fn stop_spread_tracking(&self) {
        self.spread_running.store(false, Ordering::SeqCst);
        if let Some(handle) = lock_or_recover(&self.spread_handle).take() {
            handle.abort();
        }
    }
}

fn cmp_price(a: f64, b: f64) -> CmpOrdering {
    a.partial_cmp(&b).unwrap_or(CmpOrdering::Equal)
}
