use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// An ordered (base, quote) currency pair, e.g. BTC/USD. Identity is the
/// canonical "BASE-QUOTE" string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AssetPair {
    pub base: String,
    pub quote: String,
}

impl AssetPair {
    pub fn new(base: &str, quote: &str) -> Self {
        Self {
            base: base.to_uppercase(),
            quote: quote.to_uppercase(),
        }
    }

    /// Parses the canonical "BASE-QUOTE" form. Returns None for anything else.
    pub fn parse(s: &str) -> Option<Self> {
        let mut parts = s.splitn(2, '-');
        let base = parts.next()?;
        let quote = parts.next()?;
        if base.is_empty() || quote.is_empty() {
            return None;
        }
        Some(Self::new(base, quote))
    }
}

impl fmt::Display for AssetPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.base, self.quote)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }
}

/// Which fee to fold into quoted prices when reading a book.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeeMode {
    None,
    Taker,
    Maker,
}

/// Per-exchange fee table, mutable at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FeeTable {
    pub taker_pct: f64,
    pub maker_pct: f64,
}

impl FeeTable {
    pub fn percent_for(&self, mode: FeeMode) -> f64 {
        match mode {
            FeeMode::None => 0.0,
            FeeMode::Taker => self.taker_pct,
            FeeMode::Maker => self.maker_pct,
        }
    }
}

impl Default for FeeTable {
    fn default() -> Self {
        Self {
            taker_pct: 0.0,
            maker_pct: 0.0,
        }
    }
}

/// One visible level of an order book. A level with size 0 is removed from
/// the book, never stored. `price_with_fee` is populated only when a book is
/// read with a fee mode other than `FeeMode::None`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceLevel {
    pub price: f64,
    pub size: f64,
    pub source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price_with_fee: Option<f64>,
}

impl PriceLevel {
    pub fn new(price: f64, size: f64, source: &str) -> Self {
        Self {
            price,
            size,
            source: source.to_string(),
            price_with_fee: None,
        }
    }

    /// The price used as a merge key: fee-adjusted when available.
    pub fn effective_price(&self) -> f64 {
        self.price_with_fee.unwrap_or(self.price)
    }
}

/// A point-in-time view of one side-sorted book: asks ascending, bids
/// descending by price.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BookSnapshot {
    pub asks: Vec<PriceLevel>,
    pub bids: Vec<PriceLevel>,
}

impl BookSnapshot {
    pub fn best_ask(&self) -> Option<&PriceLevel> {
        self.asks.first()
    }

    pub fn best_bid(&self) -> Option<&PriceLevel> {
        self.bids.first()
    }

    pub fn has_both_sides(&self) -> bool {
        !self.asks.is_empty() && !self.bids.is_empty()
    }
}

/// Top-of-book prices plus the derived spread. `spread` is 0 whenever either
/// side is missing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SpreadAndPrice {
    pub ask: Option<f64>,
    pub bid: Option<f64>,
    pub spread: f64,
}

/// What the client asked for. `Buy`/`Sell` are aggressive (take,
/// immediate-or-cancel); the `Limit` variants rest on the book (make).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderAction {
    Buy,
    Sell,
    BuyLimit,
    SellLimit,
}

impl OrderAction {
    pub fn side(&self) -> Side {
        match self {
            OrderAction::Buy | OrderAction::BuyLimit => Side::Buy,
            OrderAction::Sell | OrderAction::SellLimit => Side::Sell,
        }
    }

    pub fn is_make(&self) -> bool {
        matches!(self, OrderAction::BuyLimit | OrderAction::SellLimit)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderAction::Buy => "buy",
            OrderAction::Sell => "sell",
            OrderAction::BuyLimit => "buy_limit",
            OrderAction::SellLimit => "sell_limit",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    Init,
    Open,
    Finished,
    Cancelled,
    Error,
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OrderStatus::Init => "Init",
            OrderStatus::Open => "Open",
            OrderStatus::Finished => "Finished",
            OrderStatus::Cancelled => "Cancelled",
            OrderStatus::Error => "Error",
        };
        write!(f, "{}", s)
    }
}

/// Uniform result of every submission path: immediate, timed kickoff,
/// multi-exchange aggregate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderOutcome {
    pub executed_size: f64,
    pub message: String,
    /// Whether the caller should treat the submission as handled (even an
    /// errored slice sets this so sessions do not retry forever).
    pub accepted: bool,
    pub status: OrderStatus,
}

impl OrderOutcome {
    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            executed_size: 0.0,
            message: message.into(),
            accepted: false,
            status: OrderStatus::Cancelled,
        }
    }

    pub fn pending() -> Self {
        Self {
            executed_size: 0.0,
            message: "Pending execution".to_string(),
            accepted: true,
            status: OrderStatus::Open,
        }
    }
}

/// The most recent trade observed on a feed for one pair.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LastTrade {
    pub side: Side,
    pub price: f64,
    /// Exchange-reported time, seconds since the epoch.
    pub time: f64,
}

/// Balance for one currency on one exchange (or summed across exchanges).
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CurrencyBalance {
    pub amount: f64,
    pub available: f64,
}

/// Account balances plus the amounts this process has reserved for
/// in-flight timed orders.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccountBalance {
    pub balances: HashMap<String, CurrencyBalance>,
    pub reserved_base: f64,
    pub reserved_base_currency: String,
    pub reserved_quote: f64,
}

impl AccountBalance {
    pub fn available(&self, currency: &str) -> f64 {
        self.balances
            .get(currency)
            .map(|b| b.available)
            .unwrap_or(0.0)
    }
}

/// One persisted row of the sent-orders log. A timed order writes a parent
/// row first; every slice row links back through `parent_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRecord {
    pub id: Option<i64>,
    pub exchange: String,
    pub action: OrderAction,
    pub pair: AssetPair,
    pub size: f64,
    pub price: f64,
    pub exchange_order_id: String,
    pub status: OrderStatus,
    /// UTC timestamp string, millisecond precision.
    pub order_time: String,
    pub timed: bool,
    pub parent_id: Option<i64>,
    pub quote_available: f64,
    pub base_available: f64,
}

impl OrderRecord {
    pub fn now_timestamp() -> String {
        chrono::Utc::now().format("%Y-%m-%d %H:%M:%S%.3f").to_string()
    }
}

/// Point-in-time status of a timed execution session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TimedOrderStatus {
    pub running: bool,
    pub action: Option<OrderAction>,
    pub pair: Option<AssetPair>,
    pub price: f64,
    pub required_size: f64,
    pub done_size: f64,
    pub sent_time: String,
    pub execution_start_time: String,
    pub elapsed_sec: f64,
    pub duration_sec: f64,
    /// Set when a multi-exchange session stopped because feasible size ran
    /// out before the remainder was covered.
    pub incomplete: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn asset_pair_parse_and_display() {
        let pair = AssetPair::parse("btc-usd").unwrap();
        assert_eq!(pair, AssetPair::new("BTC", "USD"));
        assert_eq!(pair.to_string(), "BTC-USD");
        assert!(AssetPair::parse("BTCUSD").is_none());
        assert!(AssetPair::parse("-USD").is_none());
    }

    #[test]
    fn effective_price_prefers_fee_adjusted() {
        let mut level = PriceLevel::new(100.0, 1.0, "kraken");
        assert_eq!(level.effective_price(), 100.0);
        level.price_with_fee = Some(100.25);
        assert_eq!(level.effective_price(), 100.25);
    }

    #[test]
    fn action_classification() {
        assert_eq!(OrderAction::Buy.side(), Side::Buy);
        assert_eq!(OrderAction::SellLimit.side(), Side::Sell);
        assert!(OrderAction::BuyLimit.is_make());
        assert!(!OrderAction::Sell.is_make());
    }
}
