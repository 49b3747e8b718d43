use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::task::JoinHandle;

use crate::error::{Result, TraderError};
use crate::exchange::{ExchangeAdapter, OrderRequest};
use crate::execution::order_tracker::OrderTracker;
use crate::execution::session::{
    run_timed_take, sample_uniform, ExecutionParams, ExecutionSink, SessionHost, TakeVenue,
    TakeVenueSource, TimedOrderState,
};
use crate::orderbook::feed::{lock_or_recover, FeedHandle};
use crate::persist::OrderHistory;
use crate::types::{
    AccountBalance, AssetPair, FeeMode, OrderAction, OrderOutcome, OrderRecord, OrderStatus, Side,
    TimedOrderStatus,
};
use crate::utils::{round_size, SIZE_EPSILON};

#[derive(Debug, Default, Clone)]
struct Reservations {
    base: f64,
    base_currency: String,
    quote: f64,
}

struct RestingOrder {
    id: String,
    tracker: Arc<OrderTracker>,
}

/// Drives all order flow against one exchange: validation, cached balances
/// with in-flight reservations, the immediate (take) path with randomized
/// relative sizing, and timed take/make sessions. Exchange calls are
/// serialized through one async lock so slices never interleave on the wire.
pub struct ExchangeEngine {
    self_ref: Weak<ExchangeEngine>,
    adapter: Arc<dyn ExchangeAdapter>,
    feed: Arc<FeedHandle>,
    history: Arc<dyn OrderHistory>,
    params: ExecutionParams,
    state: Arc<TimedOrderState>,
    exchange_lock: tokio::sync::Mutex<()>,
    cached_balance: Mutex<AccountBalance>,
    balance_dirty: AtomicBool,
    reservations: Mutex<Reservations>,
    rng: Mutex<StdRng>,
    host: Mutex<Option<Arc<dyn SessionHost>>>,
    timed_task: Mutex<Option<JoinHandle<()>>>,
    active_order: Mutex<Option<RestingOrder>>,
    parent_id: Mutex<Option<i64>>,
}

impl ExchangeEngine {
    pub fn new(
        adapter: Arc<dyn ExchangeAdapter>,
        feed: Arc<FeedHandle>,
        history: Arc<dyn OrderHistory>,
    ) -> Arc<Self> {
        Self::with_rng(
            adapter,
            feed,
            history,
            ExecutionParams::default(),
            StdRng::from_entropy(),
        )
    }

    /// Full constructor with injectable parameters and random source; tests
    /// seed the rng to drive the execution gate deterministically.
    pub fn with_rng(
        adapter: Arc<dyn ExchangeAdapter>,
        feed: Arc<FeedHandle>,
        history: Arc<dyn OrderHistory>,
        params: ExecutionParams,
        rng: StdRng,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            self_ref: weak.clone(),
            adapter,
            feed,
            history,
            params,
            state: TimedOrderState::new(),
            exchange_lock: tokio::sync::Mutex::new(()),
            cached_balance: Mutex::new(AccountBalance::default()),
            balance_dirty: AtomicBool::new(true),
            reservations: Mutex::new(Reservations::default()),
            rng: Mutex::new(rng),
            host: Mutex::new(None),
            timed_task: Mutex::new(None),
            active_order: Mutex::new(None),
            parent_id: Mutex::new(None),
        })
    }

    pub fn set_host(&self, host: Arc<dyn SessionHost>) {
        *lock_or_recover(&self.host) = Some(host);
    }

    pub fn exchange(&self) -> &str {
        self.adapter.name()
    }

    pub fn adapter(&self) -> Arc<dyn ExchangeAdapter> {
        self.adapter.clone()
    }

    pub fn feed(&self) -> Arc<FeedHandle> {
        self.feed.clone()
    }

    pub fn minimum_order_size(&self, pair: &AssetPair) -> f64 {
        self.adapter.minimum_order_size(pair)
    }

    pub fn is_initialized(&self) -> bool {
        self.adapter.is_initialized()
    }

    fn arc(&self) -> Option<Arc<Self>> {
        self.self_ref.upgrade()
    }

    pub fn mark_balance_dirty(&self) {
        self.balance_dirty.store(true, Ordering::SeqCst);
    }

    /// Cached account balance, refreshed from the exchange only when marked
    /// dirty by an executed order or fill. Reservation amounts held by a
    /// running timed session are reported alongside.
    pub async fn account_balance(&self) -> AccountBalance {
        if self.adapter.is_initialized() && self.balance_dirty.load(Ordering::SeqCst) {
            match self.adapter.account_balance().await {
                Ok(fresh) => {
                    let mut cached = lock_or_recover(&self.cached_balance);
                    cached.balances = fresh.balances;
                    self.balance_dirty.store(false, Ordering::SeqCst);
                }
                Err(err) => error!("{}: balance refresh failed: {}", self.exchange(), err),
            }
        }
        let mut balance = lock_or_recover(&self.cached_balance).clone();
        let reservations = lock_or_recover(&self.reservations);
        balance.reserved_base = reservations.base;
        balance.reserved_base_currency = reservations.base_currency.clone();
        balance.reserved_quote = reservations.quote;
        balance
    }

    /// Validates parameters and available balance without touching the
    /// exchange. A rejection carries a human-readable reason.
    pub async fn can_send_order(
        &self,
        action: OrderAction,
        pair: &AssetPair,
        size: f64,
        price: f64,
    ) -> Result<()> {
        if size <= 0.0 {
            return Err(TraderError::Validation("Invalid size".to_string()));
        }
        if price < 0.0 {
            return Err(TraderError::Validation("Invalid price".to_string()));
        }
        let balance = self.account_balance().await;
        match action.side() {
            Side::Sell => {
                let available = balance.available(&pair.base);
                if size > available {
                    return Err(TraderError::InsufficientBalance(format!(
                        "Available balance {}{} is less than required size {}{}",
                        available, pair.base, size, pair.base
                    )));
                }
            }
            Side::Buy => {
                // price 0 is a market order, quote requirement unknown upfront
                if price > 0.0 {
                    let fee = self.adapter.fee_percent(FeeMode::Taker);
                    let required = price * size * (1.0 + 0.01 * fee);
                    let available = balance.available(&pair.quote);
                    if required > available {
                        return Err(TraderError::InsufficientBalance(format!(
                            "Available balance {}{} is less than required balance {}",
                            available, pair.quote, required
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// The unified entry point. `duration` zero executes in one shot;
    /// anything longer starts an adaptive timed session and returns
    /// "pending" immediately. One timed session per engine.
    pub async fn send_order(
        &self,
        action: OrderAction,
        pair: &AssetPair,
        size: f64,
        price: f64,
        duration: Duration,
        max_order_size: f64,
    ) -> Result<OrderOutcome> {
        if !self.adapter.is_initialized() {
            return Ok(OrderOutcome::rejected("Exchange client not initialized"));
        }
        if let Err(err) = self.can_send_order(action, pair, size, price).await {
            warn!("{}: order not allowed: {}", self.exchange(), err);
            return Ok(OrderOutcome::rejected(err.to_string()));
        }
        if duration.is_zero() {
            let outcome = self
                .send_immediate_order(action, size, pair, price, false, 0.0)
                .await?;
            return Ok(outcome);
        }

        if !self.state.try_begin(action, pair, price, size, duration) {
            warn!(
                "{}: timed order already running, ignoring new timed order",
                self.exchange()
            );
            return Ok(OrderOutcome::rejected("Timed order already running"));
        }
        info!(
            "{}: timed order accepted: {} {} {} @ {} over {:?} (max slice {})",
            self.exchange(),
            action.as_str(),
            size,
            pair,
            price,
            duration,
            max_order_size
        );
        self.write_parent_record(action, pair, size, price).await;
        self.reserve(action, pair, size, price);

        let Some(this) = self.arc() else {
            self.state.finish();
            return Ok(OrderOutcome::rejected("Engine shutting down"));
        };
        let pair = pair.clone();
        let task = tokio::spawn(async move {
            if action.is_make() {
                this.run_timed_make(&pair, action, size, price, max_order_size)
                    .await;
            } else {
                run_timed_take(
                    this.as_ref(),
                    &this.state,
                    &this.rng,
                    &this.params,
                    &pair,
                    action,
                    size,
                    price,
                    duration,
                    max_order_size,
                )
                .await;
            }
            this.finish_timed_session().await;
        });
        *lock_or_recover(&self.timed_task) = Some(task);
        Ok(OrderOutcome::pending())
    }

    async fn write_parent_record(
        &self,
        action: OrderAction,
        pair: &AssetPair,
        size: f64,
        price: f64,
    ) {
        let balance = self.account_balance().await;
        let record = OrderRecord {
            id: None,
            exchange: self.exchange().to_string(),
            action,
            pair: pair.clone(),
            size,
            price,
            exchange_order_id: "0".to_string(),
            status: OrderStatus::Init,
            order_time: OrderRecord::now_timestamp(),
            timed: true,
            parent_id: None,
            quote_available: balance.available(&pair.quote),
            base_available: balance.available(&pair.base),
        };
        match self.history.write_order(&record) {
            Ok(id) => *lock_or_recover(&self.parent_id) = Some(id),
            Err(err) => error!("{}: parent record write failed: {}", self.exchange(), err),
        }
    }

    fn reserve(&self, action: OrderAction, pair: &AssetPair, remaining: f64, price: f64) {
        let mut reservations = lock_or_recover(&self.reservations);
        match action.side() {
            Side::Sell => {
                reservations.base = remaining.max(0.0);
                reservations.base_currency = pair.base.clone();
                reservations.quote = 0.0;
            }
            Side::Buy => {
                let fee = self.adapter.fee_percent(FeeMode::Taker);
                reservations.base = 0.0;
                reservations.base_currency = String::new();
                reservations.quote = (remaining * price * (1.0 + 0.01 * fee)).max(0.0);
            }
        }
    }

    async fn finish_timed_session(&self) {
        self.reconcile_and_cancel_active().await;
        *lock_or_recover(&self.reservations) = Reservations::default();
        *lock_or_recover(&self.parent_id) = None;
        self.state.finish();
        let status = self.state.snapshot();
        info!(
            "{}: timed order finished, done {} of {}",
            self.exchange(),
            status.done_size,
            status.required_size
        );
        let host = lock_or_recover(&self.host).clone();
        if let Some(host) = host {
            host.set_last_status(status);
        }
    }

    /// Sends one order right now. With `relative` set (timed sessions), the
    /// size is first checked for marketability against the current book,
    /// then sampled as a fraction of the visible best level, capped, and
    /// floored to the exchange minimum.
    pub async fn send_immediate_order(
        &self,
        action: OrderAction,
        size: f64,
        pair: &AssetPair,
        price: f64,
        relative: bool,
        max_order_size: f64,
    ) -> Result<OrderOutcome> {
        let mut execute_size = size;
        if relative {
            let feed = self.feed.current();
            let book = feed.get_current_partial_book(pair, 1, FeeMode::None);
            let quote = feed.spread_and_price(pair);
            let marketable = match action.side() {
                Side::Buy => quote.ask.map(|ask| price == 0.0 || ask <= price),
                Side::Sell => quote.bid.map(|bid| price == 0.0 || bid >= price),
            };
            match marketable {
                Some(true) => {
                    let best_size = match action.side() {
                        Side::Buy => book.best_ask().map(|l| l.size).unwrap_or(0.0),
                        Side::Sell => book.best_bid().map(|l| l.size).unwrap_or(0.0),
                    };
                    execute_size = size.min(
                        sample_uniform(
                            &self.rng,
                            self.params.slice_min_factor,
                            self.params.slice_max_factor,
                        ) * best_size,
                    );
                    execute_size = self.apply_size_cap(execute_size, max_order_size);
                    execute_size = execute_size.max(self.adapter.minimum_order_size(pair));
                    debug!(
                        "{}: slice sizing: requested {} execute {} cap {}",
                        self.exchange(),
                        size,
                        execute_size,
                        max_order_size
                    );
                }
                Some(false) => {
                    info!(
                        "{}: market beyond limit {} for {} {}, skipping slice",
                        self.exchange(),
                        price,
                        action.as_str(),
                        pair
                    );
                    execute_size = 0.0;
                }
                None => {
                    warn!("{}: no book for {}, skipping slice", self.exchange(), pair);
                    execute_size = 0.0;
                }
            }
        }
        if execute_size <= 0.0 {
            return Ok(OrderOutcome {
                executed_size: 0.0,
                message: "Nothing to execute".to_string(),
                accepted: true,
                status: OrderStatus::Cancelled,
            });
        }

        let request = OrderRequest {
            action,
            pair: pair.clone(),
            size: execute_size,
            price,
            immediate_or_cancel: !action.is_make(),
        };
        info!(
            "{}: sending {} {} {} @ {}",
            self.exchange(),
            action.as_str(),
            execute_size,
            pair,
            price
        );
        let _guard = self.exchange_lock.lock().await;
        match self.adapter.place_order(&request).await {
            Err(err) => {
                error!(
                    "{}: order failed ({} {} {} @ {}): {}",
                    self.exchange(),
                    action.as_str(),
                    execute_size,
                    pair,
                    price,
                    err
                );
                self.mark_balance_dirty();
                self.write_slice_record(action, pair, execute_size, price, "0", OrderStatus::Error);
                Ok(OrderOutcome {
                    executed_size: 0.0,
                    message: err.to_string(),
                    accepted: true,
                    status: OrderStatus::Error,
                })
            }
            Ok(placed) => {
                self.mark_balance_dirty();
                let record_price = if placed.executed_price > 0.0 {
                    placed.executed_price
                } else {
                    price
                };
                self.write_slice_record(
                    action,
                    pair,
                    execute_size,
                    record_price,
                    &placed.id,
                    placed.status,
                );
                if action.is_make() && placed.status == OrderStatus::Open {
                    self.track_resting_order(&placed.id, pair, execute_size, placed.executed_size);
                }
                Ok(OrderOutcome {
                    executed_size: placed.executed_size,
                    message: String::new(),
                    accepted: true,
                    status: placed.status,
                })
            }
        }
    }

    fn apply_size_cap(&self, execute_size: f64, max_order_size: f64) -> f64 {
        if max_order_size > 0.0 && execute_size > max_order_size {
            let sampled = sample_uniform(
                &self.rng,
                self.params.cap_min_factor,
                self.params.cap_max_factor,
            ) * max_order_size;
            round_size(sampled).min(max_order_size)
        } else {
            execute_size
        }
    }

    fn write_slice_record(
        &self,
        action: OrderAction,
        pair: &AssetPair,
        size: f64,
        price: f64,
        exchange_order_id: &str,
        status: OrderStatus,
    ) {
        let balance = lock_or_recover(&self.cached_balance).clone();
        let record = OrderRecord {
            id: None,
            exchange: self.exchange().to_string(),
            action,
            pair: pair.clone(),
            size,
            price,
            exchange_order_id: exchange_order_id.to_string(),
            status,
            order_time: OrderRecord::now_timestamp(),
            timed: self.state.is_running(),
            parent_id: *lock_or_recover(&self.parent_id),
            quote_available: balance.available(&pair.quote),
            base_available: balance.available(&pair.base),
        };
        if let Err(err) = self.history.write_order(&record) {
            error!("{}: order record write failed: {}", self.exchange(), err);
        }
    }

    fn track_resting_order(
        &self,
        order_id: &str,
        pair: &AssetPair,
        required_size: f64,
        already_executed: f64,
    ) {
        let Some(this) = self.arc() else {
            return;
        };
        let feed = self.feed.current();
        let tracker = OrderTracker::new(
            order_id.to_string(),
            pair.clone(),
            required_size,
            already_executed,
            self.adapter.clone(),
            this,
        );
        feed.register_order_listener(order_id, tracker.clone());
        tracker.attach_feed(feed);
        let mut active = lock_or_recover(&self.active_order);
        *active = Some(RestingOrder {
            id: order_id.to_string(),
            tracker,
        });
    }

    async fn reconcile_and_cancel_active(&self) {
        let active = lock_or_recover(&self.active_order).take();
        let Some(resting) = active else {
            return;
        };
        if let Err(err) = self.adapter.cancel_order(&resting.id).await {
            warn!(
                "{}: cancel of resting order {} failed: {}",
                self.exchange(),
                resting.id,
                err
            );
        }
        // a fill may have raced the cancel; the poll path settles it
        if let Err(err) = resting.tracker.update_from_exchange().await {
            warn!(
                "{}: reconcile of order {} failed: {}",
                self.exchange(),
                resting.id,
                err
            );
        }
        resting.tracker.unregister();
    }

    /// Re-quotes a single resting order near the touch, offset by a random
    /// fraction of the current spread and clamped to the client limit.
    /// Every cycle cancels the previous quote and reconciles its fills
    /// before placing the next one.
    async fn run_timed_make(
        &self,
        pair: &AssetPair,
        action: OrderAction,
        size: f64,
        limit: f64,
        max_order_size: f64,
    ) {
        let started = Instant::now();
        while self.state.is_running() {
            self.reconcile_and_cancel_active().await;
            self.state.set_elapsed(started.elapsed());
            let remaining = size - self.state.done_size();
            if remaining < self.params.make_min_remaining {
                break;
            }
            self.reserve(action, pair, remaining, limit);
            let feed = self.feed.current();
            let quote = feed.spread_and_price(pair);
            if let (Some(ask), Some(bid)) = (quote.ask, quote.bid) {
                let offset = sample_uniform(&self.rng, 0.0, 1.0) * quote.spread.max(0.0);
                let desired = match action.side() {
                    Side::Buy => {
                        let mut price = bid + offset;
                        if limit > 0.0 {
                            price = price.min(limit);
                        }
                        price
                    }
                    Side::Sell => (ask - offset).max(limit),
                };
                let book = feed.get_current_partial_book(pair, 1, FeeMode::None);
                let best_size = match action.side() {
                    Side::Buy => book.best_bid().map(|l| l.size).unwrap_or(0.0),
                    Side::Sell => book.best_ask().map(|l| l.size).unwrap_or(0.0),
                };
                let mut slice = remaining.min(
                    sample_uniform(
                        &self.rng,
                        self.params.slice_min_factor,
                        self.params.slice_max_factor,
                    ) * best_size,
                );
                slice = self.apply_size_cap(slice, max_order_size);
                slice = slice.max(self.adapter.minimum_order_size(pair));
                match self
                    .send_immediate_order(action, slice, pair, desired, false, max_order_size)
                    .await
                {
                    Ok(outcome) if outcome.executed_size > 0.0 => {
                        // a resting order can cross and fill on placement
                        self.state.add_done(outcome.executed_size);
                    }
                    Ok(_) => {}
                    Err(err) => warn!("{}: make slice failed: {}", self.exchange(), err),
                }
            } else {
                warn!("{}: missing price for {}", self.exchange(), pair);
            }
            if self.state.done_size() >= size - SIZE_EPSILON {
                break;
            }
            let requote = sample_uniform(
                &self.rng,
                self.params.make_requote_min.as_secs_f64(),
                self.params.make_requote_max.as_secs_f64(),
            );
            tokio::time::sleep(Duration::from_secs_f64(requote)).await;
        }
    }

    pub fn cancel_timed_order(&self) -> bool {
        self.state.cancel()
    }

    pub fn is_timed_order_running(&self) -> bool {
        self.state.is_running()
    }

    pub fn get_timed_order_status(&self) -> TimedOrderStatus {
        self.state.snapshot()
    }

    /// Waits for the spawned timed session task to wind down after a cancel.
    pub async fn join_timed_session(&self) {
        let task = lock_or_recover(&self.timed_task).take();
        if let Some(task) = task {
            if let Err(err) = task.await {
                if !err.is_cancelled() {
                    warn!("{}: timed session task failed: {}", self.exchange(), err);
                }
            }
        }
    }
}

impl TakeVenueSource for ExchangeEngine {
    fn pick_venue(&self, pair: &AssetPair, _action: OrderAction) -> Option<TakeVenue> {
        let engine = self.arc()?;
        let feed = self.feed.current();
        Some(TakeVenue {
            quote: feed.spread_and_price(pair),
            average_spread: feed.average_spread(pair),
            minimum_order_size: self.adapter.minimum_order_size(pair),
            engine,
        })
    }

    fn on_progress(&self, remaining: f64) {
        let status = self.state.snapshot();
        if let (Some(action), Some(pair)) = (status.action, status.pair) {
            self.reserve(action, &pair, remaining, status.price);
        }
    }
}

impl ExecutionSink for ExchangeEngine {
    fn add_executed_size(&self, size: f64, price: f64, pair: &AssetPair) {
        self.state.add_done(size);
        self.mark_balance_dirty();
        self.write_slice_record(
            self.state
                .snapshot()
                .action
                .unwrap_or(OrderAction::BuyLimit),
            pair,
            size,
            price,
            "fill",
            OrderStatus::Finished,
        );
    }
}
