//! End-to-end check of the unified book merge and immediate order splitting
//! across two paper venues.

use std::sync::Arc;
use std::time::Duration;

use crossbook::execution::ExchangeEngine;
use crossbook::manager::ExchangeClientsManager;
use crossbook::orderbook::{
    FeedAdapter, FeedEvent, FeedHandle, OrderbookWatchdog, UnifiedBook, WatchdogConfig,
};
use crossbook::persist::MemoryOrderHistory;
use crossbook::testing::{MockExchange, ScriptedFeed};
use crossbook::types::{AssetPair, FeeMode, FeeTable, OrderAction, OrderStatus};

use assert_approx_eq::assert_approx_eq;
use pretty_assertions::assert_eq;

fn pair() -> AssetPair {
    AssetPair::new("BTC", "USD")
}

fn snapshot(asks: &[(f64, f64)], bids: &[(f64, f64)]) -> FeedEvent {
    FeedEvent::Snapshot {
        pair: pair(),
        asks: asks.to_vec(),
        bids: bids.to_vec(),
    }
}

async fn wait_for_book(feed: &FeedAdapter) {
    for _ in 0..400 {
        if feed.get_current_price(&pair()).0.is_some() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("book never arrived for {}", feed.exchange());
}

async fn venue(
    name: &str,
    asks: &[(f64, f64)],
    bids: &[(f64, f64)],
) -> (Arc<MockExchange>, Arc<FeedAdapter>) {
    let exchange = Arc::new(MockExchange::new(name));
    exchange.set_balance("USD", 10_000.0);
    exchange.set_balance("BTC", 10.0);
    let connector = Arc::new(ScriptedFeed::new(name, vec![snapshot(asks, bids)]));
    let feed = FeedAdapter::new(connector, vec![pair()], FeeTable::default());
    feed.start();
    wait_for_book(&feed).await;
    (exchange, feed)
}

#[tokio::test]
async fn unified_book_merges_venues_by_price() {
    let (_, alpha) = venue("alpha", &[(100.0, 1.0)], &[(99.0, 1.0)]).await;
    let (_, beta) = venue("beta", &[(101.0, 2.0)], &[(98.0, 2.0)]).await;

    let unified = UnifiedBook::with_adapters(vec![alpha, beta]);
    let book = unified.get_unified_book(&pair(), 2, FeeMode::None);

    assert_eq!(book.asks.len(), 2);
    assert_eq!(
        (book.asks[0].price, book.asks[0].size, book.asks[0].source.as_str()),
        (100.0, 1.0, "alpha")
    );
    assert_eq!(
        (book.asks[1].price, book.asks[1].size, book.asks[1].source.as_str()),
        (101.0, 2.0, "beta")
    );
    assert_eq!(
        (book.bids[0].price, book.bids[0].size, book.bids[0].source.as_str()),
        (99.0, 1.0, "alpha")
    );
    assert_eq!(
        (book.bids[1].price, book.bids[1].size, book.bids[1].source.as_str()),
        (98.0, 2.0, "beta")
    );
}

#[tokio::test]
async fn immediate_multi_order_splits_across_venues() {
    let (alpha_exchange, alpha) = venue("alpha", &[(100.0, 1.0)], &[(99.0, 1.0)]).await;
    let (beta_exchange, beta) = venue("beta", &[(101.0, 2.0)], &[(98.0, 2.0)]).await;

    let watchdog = OrderbookWatchdog::new(UnifiedBook::new(), WatchdogConfig::default());
    let manager = ExchangeClientsManager::new(watchdog);
    manager.register_engine(ExchangeEngine::new(
        alpha_exchange.clone(),
        FeedHandle::new(alpha),
        Arc::new(MemoryOrderHistory::new()),
    ));
    manager.register_engine(ExchangeEngine::new(
        beta_exchange.clone(),
        FeedHandle::new(beta),
        Arc::new(MemoryOrderHistory::new()),
    ));

    let outcome = manager
        .send_multi_order(
            &["alpha".to_string(), "beta".to_string()],
            OrderAction::Buy,
            &pair(),
            2.0,
            101.0,
            Duration::ZERO,
            10.0,
        )
        .await
        .unwrap();

    assert_eq!(outcome.status, OrderStatus::Finished);
    assert_approx_eq!(outcome.executed_size, 2.0);

    // the cheap level on alpha is exhausted first, beta covers the rest
    let alpha_orders = alpha_exchange.placed_orders();
    let beta_orders = beta_exchange.placed_orders();
    assert_eq!(alpha_orders.len(), 1);
    assert_eq!(beta_orders.len(), 1);
    assert_approx_eq!(alpha_orders[0].size, 1.0);
    assert_approx_eq!(beta_orders[0].size, 1.0);

    // immediate sessions release their coordinator slot on completion
    assert!(manager.active_sessions().is_empty());
}

#[tokio::test]
async fn multi_order_beyond_combined_balance_is_rejected() {
    let (alpha_exchange, alpha) = venue("alpha", &[(100.0, 5.0)], &[(99.0, 5.0)]).await;
    alpha_exchange.set_balance("USD", 50.0);

    let watchdog = OrderbookWatchdog::new(UnifiedBook::new(), WatchdogConfig::default());
    let manager = ExchangeClientsManager::new(watchdog);
    manager.register_engine(ExchangeEngine::new(
        alpha_exchange.clone(),
        FeedHandle::new(alpha),
        Arc::new(MemoryOrderHistory::new()),
    ));

    let outcome = manager
        .send_multi_order(
            &["alpha".to_string()],
            OrderAction::Buy,
            &pair(),
            2.0,
            100.0,
            Duration::ZERO,
            10.0,
        )
        .await
        .unwrap();

    assert!(!outcome.accepted);
    assert_eq!(alpha_exchange.order_count(), 0);
    assert!(manager.active_sessions().is_empty());
}
