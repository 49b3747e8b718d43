//! The multi-exchange resting-order loop across rebalance rounds. A fill
//! that is only discovered while a member session is being torn down must
//! still land in the coordinator's accounting, and the next round must
//! quote the shrunken remainder.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crossbook::execution::{ExchangeEngine, ExecutionParams, MultiExchangeCoordinator};
use crossbook::orderbook::{FeedAdapter, FeedEvent, FeedHandle, OrderbookWatchdog, UnifiedBook, WatchdogConfig};
use crossbook::persist::MemoryOrderHistory;
use crossbook::testing::{MockExchange, ScriptedFeed};
use crossbook::types::{AssetPair, FeeTable, OrderAction};

use assert_approx_eq::assert_approx_eq;
use pretty_assertions::assert_eq;
use rand::rngs::StdRng;
use rand::SeedableRng;

fn pair() -> AssetPair {
    AssetPair::new("BTC", "USD")
}

fn book_snapshot() -> FeedEvent {
    FeedEvent::Snapshot {
        pair: pair(),
        asks: vec![(100.0, 5.0), (101.0, 5.0)],
        bids: vec![(99.0, 5.0), (98.0, 5.0)],
    }
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
async fn rebalance_keeps_fills_reconciled_during_member_teardown() {
    let exchange = Arc::new(MockExchange::new("alpha"));
    exchange.set_balance("BTC", 10.0);
    exchange.set_balance("USD", 10_000.0);
    let feed = FeedAdapter::new(
        Arc::new(ScriptedFeed::new("alpha", vec![book_snapshot()])),
        vec![pair()],
        FeeTable::default(),
    );
    feed.start();
    wait_until("member book", || feed.get_current_price(&pair()).0.is_some()).await;

    // the member requotes slower than the coordinator rebalances, so its
    // fills surface only through the cancel-time reconcile
    let member_params = ExecutionParams {
        make_requote_min: Duration::from_secs(2),
        make_requote_max: Duration::from_secs(2),
        ..ExecutionParams::default()
    };
    let engine = ExchangeEngine::with_rng(
        exchange.clone(),
        FeedHandle::new(feed),
        Arc::new(MemoryOrderHistory::new()),
        member_params,
        StdRng::seed_from_u64(3),
    );

    let mut members = HashMap::new();
    members.insert("alpha".to_string(), engine);
    let watchdog = OrderbookWatchdog::new(UnifiedBook::new(), WatchdogConfig::default());
    let coordinator_params = ExecutionParams {
        make_rebalance_interval: Duration::from_millis(200),
        make_sleep_factor: 1.0,
        ..ExecutionParams::default()
    };
    let coordinator = MultiExchangeCoordinator::with_rng(
        "make-session".to_string(),
        members,
        watchdog,
        coordinator_params,
        StdRng::seed_from_u64(5),
    );

    let outcome = coordinator
        .send_order(
            OrderAction::SellLimit,
            &pair(),
            1.0,
            105.0,
            Duration::from_secs(60),
            1.0,
        )
        .await
        .unwrap();
    assert!(outcome.accepted);

    wait_until("resting order", || exchange.order_count() >= 1).await;
    exchange.fill_resting("alpha-1", 0.6, 105.0, &pair());

    wait_until("fill folded into the session", || {
        coordinator.get_timed_order_status().done_size > 0.5
    })
    .await;
    assert_approx_eq!(coordinator.get_timed_order_status().done_size, 0.6);
    wait_until("next round's quote", || exchange.order_count() >= 2).await;

    coordinator.cancel_timed_order();
    coordinator.join_timed_session().await;
    assert!(!coordinator.is_timed_order_running());
    assert_approx_eq!(coordinator.get_timed_order_status().done_size, 0.6);

    // the next round rested only the remainder, not the full size again
    let orders = exchange.placed_orders();
    assert_eq!(orders.len(), 2);
    assert_approx_eq!(orders[0].size, 1.0);
    assert_approx_eq!(orders[1].size, 0.4);
}
