//! Deterministic stand-ins for an exchange and its market-data feed, used
//! across the unit and integration tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{Result, TraderError};
use crate::exchange::{ExchangeAdapter, FillTransaction, OrderRequest, OrderState, PlacedOrder};
use crate::orderbook::feed::{lock_or_recover, FeedConnector, FeedEvent, FeedStream};
use crate::types::{
    AccountBalance, AssetPair, CurrencyBalance, FeeMode, FeeTable, OrderStatus,
};
use crate::utils::SIZE_EPSILON;

/// Configurable mock exchange. Immediate-or-cancel orders fill at
/// `fill_ratio` of the requested size; resting orders stay open until a
/// test fills them through `fill_resting` or they are cancelled.
pub struct MockExchange {
    name: String,
    initialized: AtomicBool,
    fail_orders: AtomicBool,
    min_order_size: Mutex<f64>,
    fees: Mutex<FeeTable>,
    fill_ratio: Mutex<f64>,
    balances: Mutex<HashMap<String, CurrencyBalance>>,
    orders: Mutex<Vec<OrderRequest>>,
    states: Mutex<HashMap<String, OrderState>>,
    transactions: Mutex<Vec<FillTransaction>>,
    next_id: AtomicU64,
}

impl MockExchange {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            initialized: AtomicBool::new(true),
            fail_orders: AtomicBool::new(false),
            min_order_size: Mutex::new(0.0006),
            fees: Mutex::new(FeeTable::default()),
            fill_ratio: Mutex::new(1.0),
            balances: Mutex::new(HashMap::new()),
            orders: Mutex::new(Vec::new()),
            states: Mutex::new(HashMap::new()),
            transactions: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn set_initialized(&self, initialized: bool) {
        self.initialized.store(initialized, Ordering::SeqCst);
    }

    pub fn set_fail_orders(&self, fail: bool) {
        self.fail_orders.store(fail, Ordering::SeqCst);
    }

    pub fn set_balance(&self, currency: &str, amount: f64) {
        lock_or_recover(&self.balances).insert(
            currency.to_string(),
            CurrencyBalance {
                amount,
                available: amount,
            },
        );
    }

    pub fn set_min_order_size(&self, size: f64) {
        *lock_or_recover(&self.min_order_size) = size;
    }

    pub fn set_fees(&self, fees: FeeTable) {
        *lock_or_recover(&self.fees) = fees;
    }

    pub fn set_fill_ratio(&self, ratio: f64) {
        *lock_or_recover(&self.fill_ratio) = ratio;
    }

    /// Orders placed so far, in submission order.
    pub fn placed_orders(&self) -> Vec<OrderRequest> {
        lock_or_recover(&self.orders).clone()
    }

    pub fn order_count(&self) -> usize {
        lock_or_recover(&self.orders).len()
    }

    /// Simulates a fill on a resting order and logs the transaction.
    pub fn fill_resting(&self, order_id: &str, size: f64, price: f64, pair: &AssetPair) {
        let mut states = lock_or_recover(&self.states);
        if let Some(state) = states.get_mut(order_id) {
            state.executed_size += size;
            state.price = price;
            if state.status == OrderStatus::Open {
                state.status = OrderStatus::Finished;
            }
        }
        lock_or_recover(&self.transactions).push(FillTransaction {
            order_id: order_id.to_string(),
            pair: pair.clone(),
            size,
            price,
            time: 0.0,
        });
    }

    fn settle(&self, request: &OrderRequest, executed: f64) {
        if executed <= 0.0 || request.price <= 0.0 {
            return;
        }
        let mut balances = lock_or_recover(&self.balances);
        let quote_delta = executed * request.price;
        let (base_sign, quote_sign) = match request.action.side() {
            crate::types::Side::Buy => (1.0, -1.0),
            crate::types::Side::Sell => (-1.0, 1.0),
        };
        let base = balances.entry(request.pair.base.clone()).or_default();
        base.amount += base_sign * executed;
        base.available += base_sign * executed;
        let quote = balances.entry(request.pair.quote.clone()).or_default();
        quote.amount += quote_sign * quote_delta;
        quote.available += quote_sign * quote_delta;
    }
}

#[async_trait]
impl ExchangeAdapter for MockExchange {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    async fn place_order(&self, request: &OrderRequest) -> Result<PlacedOrder> {
        if self.fail_orders.load(Ordering::SeqCst) {
            return Err(TraderError::Exchange(format!(
                "{}: order rejected by test flag",
                self.name
            )));
        }
        let id = format!(
            "{}-{}",
            self.name,
            self.next_id.fetch_add(1, Ordering::SeqCst)
        );
        lock_or_recover(&self.orders).push(request.clone());

        let (status, executed) = if request.immediate_or_cancel {
            let executed = request.size * *lock_or_recover(&self.fill_ratio);
            let status = if executed > SIZE_EPSILON {
                OrderStatus::Finished
            } else {
                OrderStatus::Cancelled
            };
            (status, executed)
        } else {
            (OrderStatus::Open, 0.0)
        };
        self.settle(request, executed);
        lock_or_recover(&self.states).insert(
            id.clone(),
            OrderState {
                status,
                executed_size: executed,
                price: request.price,
            },
        );
        Ok(PlacedOrder {
            id,
            status,
            executed_price: request.price,
            executed_size: executed,
        })
    }

    async fn cancel_order(&self, order_id: &str) -> Result<bool> {
        let mut states = lock_or_recover(&self.states);
        match states.get_mut(order_id) {
            Some(state) => {
                if state.status == OrderStatus::Open {
                    state.status = OrderStatus::Cancelled;
                }
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn order_status(&self, order_id: &str) -> Result<OrderState> {
        lock_or_recover(&self.states)
            .get(order_id)
            .cloned()
            .ok_or_else(|| TraderError::Exchange(format!("Unknown order: {}", order_id)))
    }

    async fn account_balance(&self) -> Result<AccountBalance> {
        Ok(AccountBalance {
            balances: lock_or_recover(&self.balances).clone(),
            ..AccountBalance::default()
        })
    }

    async fn recent_transactions(&self, pair: &AssetPair) -> Result<Vec<FillTransaction>> {
        Ok(lock_or_recover(&self.transactions)
            .iter()
            .filter(|t| &t.pair == pair)
            .cloned()
            .collect())
    }

    fn minimum_order_size(&self, _pair: &AssetPair) -> f64 {
        *lock_or_recover(&self.min_order_size)
    }

    fn fee_percent(&self, mode: FeeMode) -> f64 {
        lock_or_recover(&self.fees).percent_for(mode)
    }
}

/// Scripted market-data feed. Events are drained across connections, so a
/// restarted adapter picks up where the previous one left off; tests push
/// further events at any time through `push`.
pub struct ScriptedFeed {
    exchange: String,
    events: Arc<Mutex<VecDeque<FeedEvent>>>,
    fail_connect: AtomicBool,
    connects: AtomicUsize,
}

impl ScriptedFeed {
    pub fn new(exchange: &str, events: Vec<FeedEvent>) -> Self {
        Self {
            exchange: exchange.to_string(),
            events: Arc::new(Mutex::new(events.into())),
            fail_connect: AtomicBool::new(false),
            connects: AtomicUsize::new(0),
        }
    }

    pub fn empty(exchange: &str) -> Self {
        Self::new(exchange, Vec::new())
    }

    pub fn push(&self, event: FeedEvent) {
        lock_or_recover(&self.events).push_back(event);
    }

    pub fn set_fail_connect(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::SeqCst);
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FeedConnector for ScriptedFeed {
    fn exchange(&self) -> &str {
        &self.exchange
    }

    async fn connect(&self) -> Result<Box<dyn FeedStream>> {
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(TraderError::Feed(format!(
                "{}: connect refused by test flag",
                self.exchange
            )));
        }
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedStream {
            events: self.events.clone(),
        }))
    }
}

struct ScriptedStream {
    events: Arc<Mutex<VecDeque<FeedEvent>>>,
}

#[async_trait]
impl FeedStream for ScriptedStream {
    async fn next_event(&mut self) -> Result<Option<FeedEvent>> {
        loop {
            let event = lock_or_recover(&self.events).pop_front();
            match event {
                Some(event) => return Ok(Some(event)),
                // stay connected and wait for the test to push more
                None => tokio::time::sleep(Duration::from_millis(5)).await,
            }
        }
    }
}
