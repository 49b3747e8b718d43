//! Watchdog supervision against scripted feeds: a frozen book and a
//! persistently empty book must both get their adapter rebuilt and swapped
//! into the shared handle and the unified book.

use std::sync::Arc;
use std::time::Duration;

use crossbook::orderbook::{
    FeedAdapter, FeedConnector, FeedEvent, FeedHandle, OrderbookWatchdog, UnifiedBook,
    WatchdogConfig,
};
use crossbook::testing::ScriptedFeed;
use crossbook::types::{AssetPair, FeeTable};

fn pair() -> AssetPair {
    AssetPair::new("BTC", "USD")
}

fn deep_snapshot(shift: f64) -> FeedEvent {
    let asks = (0..5).map(|i| (100.0 + shift + i as f64, 1.0)).collect();
    let bids = (0..5).map(|i| (99.0 + shift - i as f64, 1.0)).collect();
    FeedEvent::Snapshot {
        pair: pair(),
        asks,
        bids,
    }
}

fn fast_config() -> WatchdogConfig {
    WatchdogConfig {
        interval: Duration::from_millis(30),
        snapshot_depth: 8,
        frozen_min_depth: 5,
        empty_streak_threshold: 2,
    }
}

fn supervised(
    connector: Arc<ScriptedFeed>,
) -> (Arc<FeedHandle>, Arc<OrderbookWatchdog>, Arc<UnifiedBook>) {
    let feed = FeedAdapter::new(connector.clone(), vec![pair()], FeeTable::default());
    feed.start();
    let handle = FeedHandle::new(feed.clone());
    let unified = UnifiedBook::new();
    unified.set_adapter(connector.exchange().to_string(), Some(feed));
    let watchdog = OrderbookWatchdog::new(unified.clone(), fast_config());
    let factory_connector = connector.clone();
    watchdog.supervise(
        handle.clone(),
        Box::new(move || {
            FeedAdapter::new(factory_connector.clone(), vec![pair()], FeeTable::default())
        }),
        vec![pair()],
    );
    (handle, watchdog, unified)
}

async fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
    for _ in 0..600 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {}", what);
}

#[tokio::test]
async fn frozen_book_triggers_restart() {
    let connector = Arc::new(ScriptedFeed::new("alpha", vec![deep_snapshot(0.0)]));
    let (handle, watchdog, unified) = supervised(connector.clone());
    let original = handle.current();
    wait_until("initial book", || {
        original.get_current_price(&pair()).0.is_some()
    })
    .await;

    watchdog.start();
    wait_until("restart", || connector.connect_count() >= 2).await;
    watchdog.stop();

    let replacement = handle.current();
    assert!(!Arc::ptr_eq(&original, &replacement));

    // the replacement serves fresh data through the same handle and the
    // unified book picked it up
    connector.push(deep_snapshot(10.0));
    wait_until("replacement book", || {
        unified.get_current_price(&pair()).0 == Some(110.0)
    })
    .await;
}

#[tokio::test]
async fn empty_book_restarts_after_streak() {
    let connector = Arc::new(ScriptedFeed::empty("beta"));
    let (handle, watchdog, _unified) = supervised(connector.clone());
    wait_until("initial connect", || connector.connect_count() >= 1).await;
    let original = handle.current();

    watchdog.start();
    wait_until("restart", || connector.connect_count() >= 2).await;
    watchdog.stop();

    assert!(!Arc::ptr_eq(&original, &handle.current()));
}
