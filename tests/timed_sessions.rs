//! Timed execution sessions on a single engine: the one-session-per-engine
//! guard, cancellation, and a full adaptive take run against a paper venue.

use std::sync::Arc;
use std::time::Duration;

use crossbook::execution::{ExchangeEngine, ExecutionParams};
use crossbook::orderbook::{FeedAdapter, FeedEvent, FeedHandle};
use crossbook::persist::{MemoryOrderHistory, OrderHistory};
use crossbook::testing::{MockExchange, ScriptedFeed};
use crossbook::types::{AssetPair, FeeTable, OrderAction, OrderStatus};

use assert_approx_eq::assert_approx_eq;
use pretty_assertions::assert_eq;
use rand::rngs::StdRng;
use rand::SeedableRng;

fn pair() -> AssetPair {
    AssetPair::new("BTC", "USD")
}

fn fast_params() -> ExecutionParams {
    ExecutionParams {
        tick: Duration::from_millis(10),
        min_slice_delay: Duration::ZERO,
        max_slice_delay: Duration::from_millis(1),
        ..ExecutionParams::default()
    }
}

fn book_snapshot() -> FeedEvent {
    FeedEvent::Snapshot {
        pair: pair(),
        asks: vec![(100.0, 5.0), (101.0, 5.0)],
        bids: vec![(99.0, 5.0), (98.0, 5.0)],
    }
}

async fn engine_with_book(
    events: Vec<FeedEvent>,
    history: Arc<MemoryOrderHistory>,
) -> (Arc<MockExchange>, Arc<ExchangeEngine>) {
    engine_with(events, history, fast_params()).await
}

async fn engine_with(
    events: Vec<FeedEvent>,
    history: Arc<MemoryOrderHistory>,
    params: ExecutionParams,
) -> (Arc<MockExchange>, Arc<ExchangeEngine>) {
    let exchange = Arc::new(MockExchange::new("alpha"));
    exchange.set_balance("USD", 10_000.0);
    exchange.set_balance("BTC", 10.0);
    let wait_for_book = !events.is_empty();
    let feed = FeedAdapter::new(
        Arc::new(ScriptedFeed::new("alpha", events)),
        vec![pair()],
        FeeTable::default(),
    );
    feed.start();
    if wait_for_book {
        for _ in 0..400 {
            if feed.get_current_price(&pair()).0.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
    let engine = ExchangeEngine::with_rng(
        exchange.clone(),
        FeedHandle::new(feed),
        history,
        params,
        StdRng::seed_from_u64(11),
    );
    (exchange, engine)
}

async fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
    for _ in 0..1000 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}

#[tokio::test]
async fn second_timed_order_is_rejected_while_one_runs() {
    let history = Arc::new(MemoryOrderHistory::new());
    let (_, engine) = engine_with_book(vec![], history).await;

    let first = engine
        .send_order(
            OrderAction::Buy,
            &pair(),
            1.0,
            0.0,
            Duration::from_secs(30),
            0.5,
        )
        .await
        .unwrap();
    assert!(first.accepted);
    assert!(engine.is_timed_order_running());

    let second = engine
        .send_order(
            OrderAction::Buy,
            &pair(),
            1.0,
            0.0,
            Duration::from_secs(30),
            0.5,
        )
        .await
        .unwrap();
    assert!(!second.accepted);
    assert!(second.message.contains("already running"));

    assert!(engine.cancel_timed_order());
    engine.join_timed_session().await;
    assert!(!engine.is_timed_order_running());
    assert_eq!(engine.get_timed_order_status().done_size, 0.0);

    // with the session gone a new timed order is accepted again
    let third = engine
        .send_order(
            OrderAction::Buy,
            &pair(),
            1.0,
            0.0,
            Duration::from_secs(30),
            0.5,
        )
        .await
        .unwrap();
    assert!(third.accepted);
    assert!(engine.cancel_timed_order());
    engine.join_timed_session().await;
}

#[tokio::test]
async fn timed_take_executes_the_full_size() {
    let history = Arc::new(MemoryOrderHistory::new());
    let (exchange, engine) = engine_with_book(vec![book_snapshot()], history.clone()).await;

    let outcome = engine
        .send_order(
            OrderAction::Buy,
            &pair(),
            0.01,
            101.0,
            Duration::from_secs(2),
            // cap equal to the size: the remainder check sends it whole
            0.01,
        )
        .await
        .unwrap();
    assert!(outcome.accepted);

    wait_until("session completion", || !engine.is_timed_order_running()).await;
    assert_approx_eq!(engine.get_timed_order_status().done_size, 0.01);

    let orders = exchange.placed_orders();
    assert_eq!(orders.len(), 1);
    assert_approx_eq!(orders[0].size, 0.01);
    assert!(orders[0].immediate_or_cancel);

    // the history holds the parent record plus the executed slice
    let records = history.sent_orders(0).unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[1].status, OrderStatus::Init);
    assert_eq!(records[1].exchange_order_id, "0");
    assert!(records[1].timed);
    assert_eq!(records[0].status, OrderStatus::Finished);
    assert_approx_eq!(records[0].size, 0.01);
    assert_eq!(records[0].parent_id, records[1].id);
}

#[tokio::test]
async fn make_session_reconciles_fill_that_races_the_cancel() {
    let history = Arc::new(MemoryOrderHistory::new());
    let params = ExecutionParams {
        make_requote_min: Duration::from_secs(1),
        make_requote_max: Duration::from_secs(1),
        ..ExecutionParams::default()
    };
    let (exchange, engine) = engine_with(vec![book_snapshot()], history.clone(), params).await;

    let outcome = engine
        .send_order(
            OrderAction::SellLimit,
            &pair(),
            0.5,
            99.5,
            Duration::from_secs(30),
            0.5,
        )
        .await
        .unwrap();
    assert!(outcome.accepted);

    wait_until("resting order", || exchange.order_count() == 1).await;
    let resting = exchange.placed_orders().remove(0);
    assert!(!resting.immediate_or_cancel);
    assert_approx_eq!(resting.size, 0.5);

    // the fill lands while the session sleeps between requotes, so only
    // the cancel-time reconcile can discover it
    exchange.fill_resting("alpha-1", 0.2, 99.6, &pair());
    assert!(engine.cancel_timed_order());
    engine.join_timed_session().await;

    assert_approx_eq!(engine.get_timed_order_status().done_size, 0.2);
    let records = history.sent_orders(0).unwrap();
    assert!(records
        .iter()
        .any(|r| r.exchange_order_id == "fill"
            && r.status == OrderStatus::Finished
            && (r.size - 0.2).abs() < 1e-9));
}

#[tokio::test]
async fn uninitialized_exchange_rejects_orders() {
    let history = Arc::new(MemoryOrderHistory::new());
    let (exchange, engine) = engine_with_book(vec![book_snapshot()], history).await;
    exchange.set_initialized(false);

    let outcome = engine
        .send_order(
            OrderAction::Buy,
            &pair(),
            1.0,
            100.0,
            Duration::ZERO,
            1.0,
        )
        .await
        .unwrap();
    assert!(!outcome.accepted);
    assert_eq!(exchange.order_count(), 0);
}
