use crate::error::Result;
use crate::types::{AccountBalance, AssetPair, FeeMode, OrderAction, OrderStatus};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// A single order submission, already validated and sized.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    pub action: OrderAction,
    pub pair: AssetPair,
    pub size: f64,
    /// Limit price; 0 means market for aggressive actions.
    pub price: f64,
    /// Cancel the unfilled remainder right away instead of resting.
    pub immediate_or_cancel: bool,
}

/// What the exchange returned for a placed order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlacedOrder {
    pub id: String,
    pub status: OrderStatus,
    pub executed_price: f64,
    pub executed_size: f64,
}

/// Polled state of a previously placed order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderState {
    pub status: OrderStatus,
    pub executed_size: f64,
    pub price: f64,
}

/// One fill reported by the exchange's transaction log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FillTransaction {
    pub order_id: String,
    pub pair: AssetPair,
    pub size: f64,
    pub price: f64,
    /// Seconds since the epoch.
    pub time: f64,
}

/// The one seam between execution logic and a concrete exchange. Everything
/// below this trait (REST signing, nonce handling, symbol mapping) belongs to
/// the implementation; everything above only sees these calls.
#[async_trait]
pub trait ExchangeAdapter: Send + Sync {
    fn name(&self) -> &str;

    /// False until credentials/connectivity are in place; orders are rejected
    /// before any network call while uninitialized.
    fn is_initialized(&self) -> bool;

    async fn place_order(&self, request: &OrderRequest) -> Result<PlacedOrder>;

    async fn cancel_order(&self, order_id: &str) -> Result<bool>;

    async fn order_status(&self, order_id: &str) -> Result<OrderState>;

    async fn account_balance(&self) -> Result<AccountBalance>;

    /// Recent fills, newest first.
    async fn recent_transactions(&self, pair: &AssetPair) -> Result<Vec<FillTransaction>>;

    /// Exchange-enforced minimum order size for the pair's base currency.
    fn minimum_order_size(&self, pair: &AssetPair) -> f64;

    /// Fee as a percentage (e.g. 0.25 for 25 bps).
    fn fee_percent(&self, mode: FeeMode) -> f64;
}
