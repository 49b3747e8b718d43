use std::path::Path;
use std::sync::Mutex;

use log::{debug, info};
use rusqlite::{params, Connection};

use crate::error::{Result, TraderError};
use crate::orderbook::feed::lock_or_recover;
use crate::types::{AssetPair, OrderAction, OrderRecord, OrderStatus};

/// Append-only log of every order this process sends. Implementations must
/// be callable from any thread; execution sessions log and continue when a
/// write fails, so errors here never abort an order.
pub trait OrderHistory: Send + Sync {
    /// Appends a record and returns its row id.
    fn write_order(&self, record: &OrderRecord) -> Result<i64>;

    /// Recent records, newest first. `limit` 0 means no limit.
    fn sent_orders(&self, limit: usize) -> Result<Vec<OrderRecord>>;
}

/// SQLite-backed order log. The connection is serialized behind a mutex;
/// order writes are rare enough that contention is a non-issue.
pub struct SqliteOrderHistory {
    conn: Mutex<Connection>,
}

impl SqliteOrderHistory {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS sent_orders (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                exchange TEXT NOT NULL,
                action TEXT NOT NULL,
                pair TEXT NOT NULL,
                size REAL NOT NULL,
                price REAL NOT NULL,
                exchange_order_id TEXT NOT NULL,
                status TEXT NOT NULL,
                order_time TEXT NOT NULL,
                timed INTEGER NOT NULL,
                parent_id INTEGER,
                quote_available REAL NOT NULL,
                base_available REAL NOT NULL
            )",
            [],
        )?;
        info!("order history ready");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl OrderHistory for SqliteOrderHistory {
    fn write_order(&self, record: &OrderRecord) -> Result<i64> {
        let conn = lock_or_recover(&self.conn);
        conn.execute(
            "INSERT INTO sent_orders (exchange, action, pair, size, price, exchange_order_id,
                status, order_time, timed, parent_id, quote_available, base_available)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                record.exchange,
                record.action.as_str(),
                record.pair.to_string(),
                record.size,
                record.price,
                record.exchange_order_id,
                record.status.to_string(),
                record.order_time,
                record.timed as i64,
                record.parent_id,
                record.quote_available,
                record.base_available,
            ],
        )?;
        let id = conn.last_insert_rowid();
        debug!(
            "order recorded: id={} {} {} {} {} @ {}",
            id, record.exchange, record.action.as_str(), record.size, record.pair, record.price
        );
        Ok(id)
    }

    fn sent_orders(&self, limit: usize) -> Result<Vec<OrderRecord>> {
        let conn = lock_or_recover(&self.conn);
        let mut sql = "SELECT id, exchange, action, pair, size, price, exchange_order_id,
                status, order_time, timed, parent_id, quote_available, base_available
             FROM sent_orders ORDER BY id DESC"
            .to_string();
        if limit > 0 {
            sql.push_str(&format!(" LIMIT {}", limit));
        }
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], |row| {
            Ok(RawRecord {
                id: row.get(0)?,
                exchange: row.get(1)?,
                action: row.get(2)?,
                pair: row.get(3)?,
                size: row.get(4)?,
                price: row.get(5)?,
                exchange_order_id: row.get(6)?,
                status: row.get(7)?,
                order_time: row.get(8)?,
                timed: row.get(9)?,
                parent_id: row.get(10)?,
                quote_available: row.get(11)?,
                base_available: row.get(12)?,
            })
        })?;
        let mut records = Vec::new();
        for raw in rows {
            records.push(raw?.into_record()?);
        }
        Ok(records)
    }
}

struct RawRecord {
    id: i64,
    exchange: String,
    action: String,
    pair: String,
    size: f64,
    price: f64,
    exchange_order_id: String,
    status: String,
    order_time: String,
    timed: i64,
    parent_id: Option<i64>,
    quote_available: f64,
    base_available: f64,
}

impl RawRecord {
    fn into_record(self) -> Result<OrderRecord> {
        let action = parse_action(&self.action)?;
        let status = parse_status(&self.status)?;
        let pair = AssetPair::parse(&self.pair)
            .ok_or_else(|| TraderError::Persistence(format!("Bad pair in row: {}", self.pair)))?;
        Ok(OrderRecord {
            id: Some(self.id),
            exchange: self.exchange,
            action,
            pair,
            size: self.size,
            price: self.price,
            exchange_order_id: self.exchange_order_id,
            status,
            order_time: self.order_time,
            timed: self.timed != 0,
            parent_id: self.parent_id,
            quote_available: self.quote_available,
            base_available: self.base_available,
        })
    }
}

fn parse_action(raw: &str) -> Result<OrderAction> {
    match raw {
        "buy" => Ok(OrderAction::Buy),
        "sell" => Ok(OrderAction::Sell),
        "buy_limit" => Ok(OrderAction::BuyLimit),
        "sell_limit" => Ok(OrderAction::SellLimit),
        other => Err(TraderError::Persistence(format!(
            "Bad action in row: {}",
            other
        ))),
    }
}

fn parse_status(raw: &str) -> Result<OrderStatus> {
    match raw {
        "Init" => Ok(OrderStatus::Init),
        "Open" => Ok(OrderStatus::Open),
        "Finished" => Ok(OrderStatus::Finished),
        "Cancelled" => Ok(OrderStatus::Cancelled),
        "Error" => Ok(OrderStatus::Error),
        other => Err(TraderError::Persistence(format!(
            "Bad status in row: {}",
            other
        ))),
    }
}

/// In-memory order log for tests.
#[derive(Default)]
pub struct MemoryOrderHistory {
    records: Mutex<Vec<OrderRecord>>,
}

impl MemoryOrderHistory {
    pub fn new() -> Self {
        Self::default()
    }
}

impl OrderHistory for MemoryOrderHistory {
    fn write_order(&self, record: &OrderRecord) -> Result<i64> {
        let mut records = lock_or_recover(&self.records);
        let id = records.len() as i64 + 1;
        let mut stored = record.clone();
        stored.id = Some(id);
        records.push(stored);
        Ok(id)
    }

    fn sent_orders(&self, limit: usize) -> Result<Vec<OrderRecord>> {
        let records = lock_or_recover(&self.records);
        let mut out: Vec<OrderRecord> = records.iter().rev().cloned().collect();
        if limit > 0 {
            out.truncate(limit);
        }
        Ok(out)
    }
}
