use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, error, info, warn};
use tokio::task::JoinHandle;

use crate::error::Result;
use crate::orderbook::tracker::{ExecutionRateTracker, SpreadTracker};
use crate::types::{AssetPair, BookSnapshot, FeeMode, FeeTable, LastTrade, PriceLevel, Side, SpreadAndPrice};

const SPREAD_SAMPLE_INTERVAL: Duration = Duration::from_millis(100);
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);

/// One normalized message from an exchange feed.
#[derive(Debug, Clone)]
pub enum FeedEvent {
    /// Full replacement of one pair's book. Levels are (price, size).
    Snapshot {
        pair: AssetPair,
        asks: Vec<(f64, f64)>,
        bids: Vec<(f64, f64)>,
    },
    /// One level changed; size 0 removes the level.
    LevelChange {
        pair: AssetPair,
        side: Side,
        price: f64,
        size: f64,
    },
    /// A public trade printed on the exchange.
    Trade {
        pair: AssetPair,
        side: Side,
        price: f64,
        size: f64,
        time: f64,
    },
    /// A fill on one of our own resting orders.
    OwnFill {
        order_id: String,
        pair: AssetPair,
        size: f64,
        price: f64,
        time: f64,
    },
}

/// An open stream of feed events. `next_event` returning `Ok(None)` means the
/// stream closed cleanly; the adapter reconnects either way.
#[async_trait]
pub trait FeedStream: Send {
    async fn next_event(&mut self) -> Result<Option<FeedEvent>>;
}

/// Connection factory for one exchange's market-data feed.
#[async_trait]
pub trait FeedConnector: Send + Sync {
    fn exchange(&self) -> &str;

    async fn connect(&self) -> Result<Box<dyn FeedStream>>;
}

/// Receives own-order fills pushed off the feed, keyed by exchange order id.
pub trait FillListener: Send + Sync {
    fn on_fill(&self, size: f64, price: f64, time: f64);
}

#[derive(Debug, Default, Clone)]
struct SideLevels {
    /// (price, size); asks ascending, bids descending.
    asks: Vec<(f64, f64)>,
    bids: Vec<(f64, f64)>,
}

/// Live order-book state for one exchange: per-pair books maintained from a
/// reconnecting ingest task, last trades, execution-rate trackers, and a
/// spread moving average sampled on a fixed interval.
pub struct FeedAdapter {
    connector: Arc<dyn FeedConnector>,
    pairs: Vec<AssetPair>,
    books: RwLock<HashMap<AssetPair, SideLevels>>,
    last_trades: RwLock<HashMap<AssetPair, LastTrade>>,
    rate_trackers: Mutex<HashMap<(AssetPair, Side), ExecutionRateTracker>>,
    spread: SpreadTracker,
    fees: RwLock<FeeTable>,
    order_listeners: Mutex<HashMap<String, Arc<dyn FillListener>>>,
    running: AtomicBool,
    connected: AtomicBool,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl FeedAdapter {
    pub fn new(connector: Arc<dyn FeedConnector>, pairs: Vec<AssetPair>, fees: FeeTable) -> Arc<Self> {
        let mut books = HashMap::new();
        for pair in &pairs {
            books.insert(pair.clone(), SideLevels::default());
        }
        Arc::new(Self {
            connector,
            pairs,
            books: RwLock::new(books),
            last_trades: RwLock::new(HashMap::new()),
            rate_trackers: Mutex::new(HashMap::new()),
            spread: SpreadTracker::new(),
            fees: RwLock::new(fees),
            order_listeners: Mutex::new(HashMap::new()),
            running: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            handles: Mutex::new(Vec::new()),
        })
    }

    pub fn exchange(&self) -> &str {
        self.connector.exchange()
    }

    pub fn pairs(&self) -> &[AssetPair] {
        &self.pairs
    }

    /// Spawns the ingest and spread-sampling tasks. Idempotent.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let ingest = {
            let this = Arc::clone(self);
            tokio::spawn(async move { this.run_ingest().await })
        };
        let spread = {
            let this = Arc::clone(self);
            tokio::spawn(async move { this.run_spread_sampler().await })
        };
        let mut handles = lock_or_recover(&self.handles);
        handles.push(ingest);
        handles.push(spread);
        info!("{}: feed adapter started", self.exchange());
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        let mut handles = lock_or_recover(&self.handles);
        for handle in handles.drain(..) {
            handle.abort();
        }
        info!("{}: feed adapter stopped", self.exchange());
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// True once a stream is up and delivering events.
    pub fn is_healthy(&self) -> bool {
        self.running.load(Ordering::SeqCst) && self.connected.load(Ordering::SeqCst)
    }

    async fn run_ingest(self: Arc<Self>) {
        let mut attempt: u32 = 0;
        while self.running.load(Ordering::SeqCst) {
            match self.connector.connect().await {
                Ok(mut stream) => {
                    info!("{}: feed connected", self.exchange());
                    self.connected.store(true, Ordering::SeqCst);
                    attempt = 0;
                    loop {
                        match stream.next_event().await {
                            Ok(Some(event)) => self.apply_event(event),
                            Ok(None) => {
                                warn!("{}: feed stream closed", self.exchange());
                                break;
                            }
                            Err(err) => {
                                error!("{}: feed error: {}", self.exchange(), err);
                                break;
                            }
                        }
                        if !self.running.load(Ordering::SeqCst) {
                            return;
                        }
                    }
                    self.connected.store(false, Ordering::SeqCst);
                }
                Err(err) => {
                    error!("{}: feed connect failed: {}", self.exchange(), err);
                }
            }
            if !self.running.load(Ordering::SeqCst) {
                return;
            }
            attempt = attempt.saturating_add(1);
            let delay = reconnect_delay(attempt);
            debug!("{}: reconnecting in {:?}", self.exchange(), delay);
            tokio::time::sleep(delay).await;
        }
    }

    async fn run_spread_sampler(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(SPREAD_SAMPLE_INTERVAL);
        while self.running.load(Ordering::SeqCst) {
            ticker.tick().await;
            for pair in &self.pairs {
                let spread = self.spread_and_price(pair).spread;
                self.spread.observe(pair, spread);
            }
        }
    }

    pub(crate) fn apply_event(&self, event: FeedEvent) {
        match event {
            FeedEvent::Snapshot { pair, asks, bids } => {
                let mut levels = SideLevels::default();
                for (price, size) in asks {
                    if size > 0.0 {
                        insert_level(&mut levels.asks, true, price, size);
                    }
                }
                for (price, size) in bids {
                    if size > 0.0 {
                        insert_level(&mut levels.bids, false, price, size);
                    }
                }
                let mut books = write_or_recover(&self.books);
                books.insert(pair, levels);
            }
            FeedEvent::LevelChange { pair, side, price, size } => {
                let mut books = write_or_recover(&self.books);
                let levels = books.entry(pair).or_default();
                let side_levels = match side {
                    Side::Buy => &mut levels.bids,
                    Side::Sell => &mut levels.asks,
                };
                if size <= 0.0 {
                    side_levels.retain(|(p, _)| *p != price);
                } else {
                    insert_level(side_levels, side == Side::Sell, price, size);
                }
            }
            FeedEvent::Trade { pair, side, price, size, time } => {
                {
                    let mut trackers = lock_or_recover(&self.rate_trackers);
                    trackers
                        .entry((pair.clone(), side))
                        .or_default()
                        .add_trade(size, price);
                }
                let mut trades = write_or_recover(&self.last_trades);
                trades.insert(pair, LastTrade { side, price, time });
            }
            FeedEvent::OwnFill { order_id, pair, size, price, time } => {
                let listener = {
                    let listeners = lock_or_recover(&self.order_listeners);
                    listeners.get(&order_id).cloned()
                };
                match listener {
                    Some(listener) => listener.on_fill(size, price, time),
                    None => debug!(
                        "{}: fill for untracked order {} ({} {} @ {})",
                        self.exchange(),
                        order_id,
                        pair,
                        size,
                        price
                    ),
                }
            }
        }
    }

    /// Top `depth` levels per side; prices get the fee folded in when a fee
    /// mode is given (asks marked up, bids marked down).
    pub fn get_current_partial_book(
        &self,
        pair: &AssetPair,
        depth: usize,
        fee_mode: FeeMode,
    ) -> BookSnapshot {
        let fee_pct = read_or_recover(&self.fees).percent_for(fee_mode);
        let books = read_or_recover(&self.books);
        let Some(levels) = books.get(pair) else {
            return BookSnapshot::default();
        };
        let source = self.exchange();
        let build = |side: &[(f64, f64)], markup: f64| -> Vec<PriceLevel> {
            side.iter()
                .take(depth)
                .map(|&(price, size)| {
                    let mut level = PriceLevel::new(price, size, source);
                    if fee_mode != FeeMode::None {
                        level.price_with_fee = Some(price * markup);
                    }
                    level
                })
                .collect()
        };
        BookSnapshot {
            asks: build(&levels.asks, 1.0 + fee_pct / 100.0),
            bids: build(&levels.bids, 1.0 - fee_pct / 100.0),
        }
    }

    /// Raw top-of-book prices; both present only when both sides have depth.
    pub fn get_current_price(&self, pair: &AssetPair) -> (Option<f64>, Option<f64>) {
        let book = self.get_current_partial_book(pair, 1, FeeMode::None);
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

    pub fn last_trade(&self, pair: &AssetPair) -> Option<LastTrade> {
        read_or_recover(&self.last_trades).get(pair).copied()
    }

    /// Market execution rate for one side of a pair, base units per second.
    pub fn execution_rate(&self, pair: &AssetPair, side: Side) -> f64 {
        let trackers = lock_or_recover(&self.rate_trackers);
        trackers
            .get(&(pair.clone(), side))
            .map(|t| t.size_rate())
            .unwrap_or(0.0)
    }

    pub fn set_fees(&self, fees: FeeTable) {
        *write_or_recover(&self.fees) = fees;
    }

    pub fn fees(&self) -> FeeTable {
        *read_or_recover(&self.fees)
    }

    pub fn register_order_listener(&self, order_id: &str, listener: Arc<dyn FillListener>) {
        let mut listeners = lock_or_recover(&self.order_listeners);
        listeners.insert(order_id.to_string(), listener);
    }

    pub fn unregister_order_listener(&self, order_id: &str) {
        let mut listeners = lock_or_recover(&self.order_listeners);
        listeners.remove(order_id);
    }
}

/// Shared, swappable handle to the live adapter of one exchange. Holders
/// always read the current adapter through it, so a watchdog restart is
/// visible everywhere without re-wiring.
pub struct FeedHandle {
    slot: RwLock<Arc<FeedAdapter>>,
}

impl FeedHandle {
    pub fn new(adapter: Arc<FeedAdapter>) -> Arc<Self> {
        Arc::new(Self {
            slot: RwLock::new(adapter),
        })
    }

    pub fn current(&self) -> Arc<FeedAdapter> {
        read_or_recover(&self.slot).clone()
    }

    pub fn swap(&self, adapter: Arc<FeedAdapter>) -> Arc<FeedAdapter> {
        std::mem::replace(&mut *write_or_recover(&self.slot), adapter)
    }
}

fn reconnect_delay(attempt: u32) -> Duration {
    let secs = 1u64 << attempt.min(5).saturating_sub(1);
    Duration::from_secs(secs).min(MAX_RECONNECT_DELAY)
}

fn insert_level(levels: &mut Vec<(f64, f64)>, ascending: bool, price: f64, size: f64) {
    let mut index = 0;
    while index < levels.len() {
        let existing = levels[index].0;
        if existing == price {
            levels[index].1 = size;
            return;
        }
        let passed = if ascending { existing < price } else { existing > price };
        if !passed {
            break;
        }
        index += 1;
    }
    levels.insert(index, (price, size));
}

pub(crate) fn lock_or_recover<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

pub(crate) fn read_or_recover<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

pub(crate) fn write_or_recover<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
