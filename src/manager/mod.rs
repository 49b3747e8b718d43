//! Front door for order routing. Owns one [`ExchangeEngine`] per connected
//! exchange plus any live multi-exchange sessions, and fans requests out to
//! the right one by exchange name.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use dashmap::DashMap;
use log::{info, warn};
use uuid::Uuid;

use crate::error::{Result, TraderError};
use crate::exchange::FillTransaction;
use crate::execution::session::SessionHost;
use crate::execution::{ExchangeEngine, MultiExchangeCoordinator};
use crate::orderbook::feed::lock_or_recover;
use crate::orderbook::OrderbookWatchdog;
use crate::types::{AccountBalance, AssetPair, OrderAction, OrderOutcome, TimedOrderStatus};

pub struct ExchangeClientsManager {
    self_ref: Weak<Self>,
    engines: DashMap<String, Arc<ExchangeEngine>>,
    coordinators: DashMap<String, Arc<MultiExchangeCoordinator>>,
    watchdog: Arc<OrderbookWatchdog>,
    /// Gate for timed sessions; immediate orders always pass.
    timed_execution_enabled: AtomicBool,
    /// Outcome of the most recently finished timed session, single or multi.
    last_status: Mutex<TimedOrderStatus>,
}

impl ExchangeClientsManager {
    pub fn new(watchdog: Arc<OrderbookWatchdog>) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            self_ref: weak.clone(),
            engines: DashMap::new(),
            coordinators: DashMap::new(),
            watchdog,
            timed_execution_enabled: AtomicBool::new(true),
            last_status: Mutex::new(TimedOrderStatus::default()),
        })
    }

    pub fn set_timed_execution_enabled(&self, enabled: bool) {
        self.timed_execution_enabled.store(enabled, Ordering::SeqCst);
    }

    fn timed_order_allowed(&self, duration: Duration) -> bool {
        duration.is_zero() || self.timed_execution_enabled.load(Ordering::SeqCst)
    }

    fn arc(&self) -> Option<Arc<Self>> {
        self.self_ref.upgrade()
    }

    pub fn register_engine(&self, engine: Arc<ExchangeEngine>) {
        if let Some(host) = self.arc() {
            engine.set_host(host as Arc<dyn SessionHost>);
        }
        info!("registered exchange engine: {}", engine.exchange());
        self.engines.insert(engine.exchange().to_string(), engine);
    }

    pub fn engine(&self, exchange: &str) -> Option<Arc<ExchangeEngine>> {
        self.engines.get(exchange).map(|e| e.value().clone())
    }

    pub fn exchange_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.engines.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Account balance per exchange, reservations included.
    pub async fn balances(&self) -> HashMap<String, AccountBalance> {
        let mut out = HashMap::new();
        for name in self.exchange_names() {
            if let Some(engine) = self.engine(&name) {
                out.insert(name, engine.account_balance().await);
            }
        }
        out
    }

    pub async fn transactions(
        &self,
        exchange: &str,
        pair: &AssetPair,
    ) -> Result<Vec<FillTransaction>> {
        let engine = self
            .engine(exchange)
            .ok_or_else(|| TraderError::Validation(format!("Unknown exchange: {}", exchange)))?;
        engine.adapter().recent_transactions(pair).await
    }

    /// Sends an order through a single exchange. `duration` zero means
    /// immediate execution; anything longer starts a timed session.
    #[allow(clippy::too_many_arguments)]
    pub async fn send_order(
        &self,
        exchange: &str,
        action: OrderAction,
        pair: &AssetPair,
        size: f64,
        price: f64,
        duration: Duration,
        max_order_size: f64,
    ) -> Result<OrderOutcome> {
        let engine = self
            .engine(exchange)
            .ok_or_else(|| TraderError::Validation(format!("Unknown exchange: {}", exchange)))?;
        if !self.timed_order_allowed(duration) {
            warn!("{}: timed execution disabled, rejecting timed order", exchange);
            return Ok(OrderOutcome::rejected("Timed execution is disabled"));
        }
        engine
            .send_order(action, pair, size, price, duration, max_order_size)
            .await
    }

    /// Sends an order split across several exchanges. A fresh coordinator is
    /// created per call and kept addressable by its session id until the
    /// session completes.
    #[allow(clippy::too_many_arguments)]
    pub async fn send_multi_order(
        &self,
        exchanges: &[String],
        action: OrderAction,
        pair: &AssetPair,
        size: f64,
        price: f64,
        duration: Duration,
        max_order_size: f64,
    ) -> Result<OrderOutcome> {
        if exchanges.is_empty() {
            return Err(TraderError::Validation(
                "No exchanges given for multi-exchange order".to_string(),
            ));
        }
        if !self.timed_order_allowed(duration) {
            warn!(
                "[{}]: timed execution disabled, rejecting timed order",
                exchanges.join(", ")
            );
            return Ok(OrderOutcome::rejected("Timed execution is disabled"));
        }
        let mut members = HashMap::new();
        for name in exchanges {
            let engine = self
                .engine(name)
                .ok_or_else(|| TraderError::Validation(format!("Unknown exchange: {}", name)))?;
            members.insert(name.clone(), engine);
        }

        let session_id = Uuid::new_v4().to_string();
        let coordinator =
            MultiExchangeCoordinator::new(session_id.clone(), members, self.watchdog.clone());
        if let Some(host) = self.arc() {
            coordinator.set_host(host as Arc<dyn SessionHost>);
        }
        info!(
            "multi-exchange session {} on [{}]: {} {} {} @ {}",
            session_id,
            coordinator.exchange_names(),
            action.as_str(),
            size,
            pair,
            price
        );
        self.coordinators.insert(session_id, coordinator.clone());
        coordinator
            .send_order(action, pair, size, price, duration, max_order_size)
            .await
    }

    pub fn active_sessions(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.coordinators.iter().map(|c| c.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Cancels a running timed order. `key` is either an exchange name or a
    /// multi-exchange session id.
    pub fn cancel_timed_order(&self, key: &str) -> bool {
        if let Some(engine) = self.engine(key) {
            return engine.cancel_timed_order();
        }
        if let Some(coordinator) = self.coordinators.get(key) {
            return coordinator.cancel_timed_order();
        }
        warn!("cancel requested for unknown exchange/session: {}", key);
        false
    }

    pub fn timed_order_status(&self, key: &str) -> Option<TimedOrderStatus> {
        if let Some(engine) = self.engine(key) {
            return Some(engine.get_timed_order_status());
        }
        self.coordinators
            .get(key)
            .map(|c| c.get_timed_order_status())
    }

    pub fn is_timed_order_running(&self, key: &str) -> bool {
        self.timed_order_status(key).map_or(false, |s| s.running)
    }

    pub fn last_timed_status(&self) -> TimedOrderStatus {
        lock_or_recover(&self.last_status).clone()
    }

    /// Stops every running session; used on shutdown.
    pub fn cancel_all(&self) {
        for engine in self.engines.iter() {
            engine.value().cancel_timed_order();
        }
        for coordinator in self.coordinators.iter() {
            coordinator.value().cancel_timed_order();
        }
    }
}

impl SessionHost for ExchangeClientsManager {
    fn set_last_status(&self, status: TimedOrderStatus) {
        *lock_or_recover(&self.last_status) = status;
    }

    fn unregister_session(&self, session_id: &str) {
        if self.coordinators.remove(session_id).is_some() {
            info!("multi-exchange session {} closed", session_id);
        }
    }
}
