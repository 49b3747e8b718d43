use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use log::debug;

use crate::error::Result;
use crate::exchange::ExchangeAdapter;
use crate::execution::session::ExecutionSink;
use crate::orderbook::feed::{lock_or_recover, FeedAdapter, FillListener};
use crate::types::{AssetPair, OrderStatus};
use crate::utils::SIZE_EPSILON;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerPhase {
    Sent,
    Open,
    Finished,
    Cancelled,
}

/// Follows one resting order to completion. Fills arrive either pushed off
/// the feed (`FillListener`) or pulled from the exchange when a cancel races
/// a fill. Every increment funnels through the owning sink's
/// `add_executed_size`, which keeps session done-size, balances, and order
/// history consistent no matter which path reported first.
pub struct OrderTracker {
    order_id: String,
    pair: AssetPair,
    required_size: f64,
    /// Size already executed when the order was placed; exchange totals
    /// include it, our delta accounting must not double-count it.
    initial_done: f64,
    done: Mutex<f64>,
    phase: Mutex<TrackerPhase>,
    adapter: Arc<dyn ExchangeAdapter>,
    sink: Arc<dyn ExecutionSink>,
    feed: Mutex<Option<Arc<FeedAdapter>>>,
    listening: AtomicBool,
}

impl OrderTracker {
    pub fn new(
        order_id: String,
        pair: AssetPair,
        required_size: f64,
        initial_done: f64,
        adapter: Arc<dyn ExchangeAdapter>,
        sink: Arc<dyn ExecutionSink>,
    ) -> Arc<Self> {
        Arc::new(Self {
            order_id,
            pair,
            required_size,
            initial_done,
            done: Mutex::new(0.0),
            phase: Mutex::new(TrackerPhase::Sent),
            adapter,
            sink,
            feed: Mutex::new(None),
            listening: AtomicBool::new(true),
        })
    }

    /// Remembers the feed the listener was registered on so `unregister`
    /// can detach from the same adapter instance.
    pub fn attach_feed(&self, feed: Arc<FeedAdapter>) {
        *lock_or_recover(&self.feed) = Some(feed);
        let mut phase = lock_or_recover(&self.phase);
        if *phase == TrackerPhase::Sent {
            *phase = TrackerPhase::Open;
        }
    }

    pub fn order_id(&self) -> &str {
        &self.order_id
    }

    pub fn done_size(&self) -> f64 {
        *lock_or_recover(&self.done)
    }

    pub fn phase(&self) -> TrackerPhase {
        *lock_or_recover(&self.phase)
    }

    fn record_fill(&self, size: f64, price: f64) {
        if size <= 0.0 {
            return;
        }
        let finished = {
            let mut done = lock_or_recover(&self.done);
            *done += size;
            *done >= self.required_size - SIZE_EPSILON
        };
        self.sink.add_executed_size(size, price, &self.pair);
        if finished {
            *lock_or_recover(&self.phase) = TrackerPhase::Finished;
            self.unregister();
        }
    }

    /// Poll fallback: overwrites done size from the exchange's view of the
    /// order, reporting only the unseen delta to the sink.
    pub async fn update_from_exchange(&self) -> Result<()> {
        let state = self.adapter.order_status(&self.order_id).await?;
        let delta = state.executed_size - self.initial_done - self.done_size();
        debug!(
            "order {}: exchange reports {} executed, delta {}",
            self.order_id, state.executed_size, delta
        );
        if delta > SIZE_EPSILON {
            self.record_fill(delta, state.price);
        }
        if state.status == OrderStatus::Cancelled {
            let mut phase = lock_or_recover(&self.phase);
            if *phase != TrackerPhase::Finished {
                *phase = TrackerPhase::Cancelled;
            }
        }
        Ok(())
    }

    /// Poll fallback for exchanges whose order-status endpoint lags: sums
    /// the fills attributed to this order in the recent transaction log.
    pub async fn update_from_transactions(&self) -> Result<()> {
        let transactions = self.adapter.recent_transactions(&self.pair).await?;
        let mut total = 0.0;
        let mut last_price = 0.0;
        for tx in transactions.iter().filter(|t| t.order_id == self.order_id) {
            total += tx.size;
            last_price = tx.price;
        }
        let delta = total - self.initial_done - self.done_size();
        if delta > SIZE_EPSILON {
            self.record_fill(delta, last_price);
        }
        Ok(())
    }

    pub fn unregister(&self) {
        if self.listening.swap(false, Ordering::SeqCst) {
            let feed = lock_or_recover(&self.feed).take();
            if let Some(feed) = feed {
                feed.unregister_order_listener(&self.order_id);
            }
        }
    }
}

impl FillListener for OrderTracker {
    fn on_fill(&self, size: f64, price: f64, _time: f64) {
        self.record_fill(size, price);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::{FillTransaction, OrderRequest, OrderState, PlacedOrder};
    use crate::types::{AccountBalance, FeeMode};
    use assert_approx_eq::assert_approx_eq;
    use async_trait::async_trait;

    struct StubAdapter {
        status: Mutex<OrderState>,
        transactions: Mutex<Vec<FillTransaction>>,
    }

    impl StubAdapter {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                status: Mutex::new(OrderState {
                    status: OrderStatus::Open,
                    executed_size: 0.0,
                    price: 0.0,
                }),
                transactions: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl ExchangeAdapter for StubAdapter {
        fn name(&self) -> &str {
            "stub"
        }

        fn is_initialized(&self) -> bool {
            true
        }

        async fn place_order(&self, _request: &OrderRequest) -> Result<PlacedOrder> {
            unimplemented!("not used")
        }

        async fn cancel_order(&self, _order_id: &str) -> Result<bool> {
            Ok(true)
        }

        async fn order_status(&self, _order_id: &str) -> Result<OrderState> {
            Ok(self.status.lock().unwrap().clone())
        }

        async fn account_balance(&self) -> Result<AccountBalance> {
            Ok(AccountBalance::default())
        }

        async fn recent_transactions(&self, _pair: &AssetPair) -> Result<Vec<FillTransaction>> {
            Ok(self.transactions.lock().unwrap().clone())
        }

        fn minimum_order_size(&self, _pair: &AssetPair) -> f64 {
            0.001
        }

        fn fee_percent(&self, _mode: FeeMode) -> f64 {
            0.0
        }
    }

    #[derive(Default)]
    struct RecordingSink(Mutex<Vec<(f64, f64)>>);

    impl ExecutionSink for RecordingSink {
        fn add_executed_size(&self, size: f64, price: f64, _pair: &AssetPair) {
            self.0.lock().unwrap().push((size, price));
        }
    }

    fn pair() -> AssetPair {
        AssetPair::new("BTC", "USD")
    }

    #[test]
    fn push_fills_accumulate_and_finish() {
        let sink = Arc::new(RecordingSink::default());
        let tracker = OrderTracker::new(
            "oid".to_string(),
            pair(),
            1.0,
            0.0,
            StubAdapter::new(),
            sink.clone(),
        );
        tracker.on_fill(0.4, 100.0, 0.0);
        assert_eq!(tracker.phase(), TrackerPhase::Sent);
        tracker.on_fill(0.6, 101.0, 0.0);
        assert_eq!(tracker.phase(), TrackerPhase::Finished);
        assert_approx_eq!(tracker.done_size(), 1.0);
        assert_eq!(sink.0.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn exchange_poll_reports_only_the_delta() {
        let adapter = StubAdapter::new();
        let sink = Arc::new(RecordingSink::default());
        let tracker = OrderTracker::new(
            "oid".to_string(),
            pair(),
            2.0,
            0.5,
            adapter.clone(),
            sink.clone(),
        );
        tracker.on_fill(0.3, 100.0, 0.0);

        // exchange total includes the 0.5 executed at placement
        *adapter.status.lock().unwrap() = OrderState {
            status: OrderStatus::Open,
            executed_size: 1.0,
            price: 100.5,
        };
        tracker.update_from_exchange().await.unwrap();
        assert_approx_eq!(tracker.done_size(), 0.5);
        let fills = sink.0.lock().unwrap();
        assert_eq!(fills.len(), 2);
        assert_approx_eq!(fills[1].0, 0.2);
    }

    #[tokio::test]
    async fn transaction_poll_reconciles_missed_fills() {
        let adapter = StubAdapter::new();
        let sink = Arc::new(RecordingSink::default());
        let tracker = OrderTracker::new(
            "oid".to_string(),
            pair(),
            1.0,
            0.0,
            adapter.clone(),
            sink.clone(),
        );
        adapter.transactions.lock().unwrap().extend([
            FillTransaction {
                order_id: "oid".to_string(),
                pair: pair(),
                size: 0.4,
                price: 99.0,
                time: 1.0,
            },
            FillTransaction {
                order_id: "other".to_string(),
                pair: pair(),
                size: 5.0,
                price: 50.0,
                time: 2.0,
            },
        ]);
        tracker.update_from_transactions().await.unwrap();
        assert_approx_eq!(tracker.done_size(), 0.4);
        // a second poll with unchanged history adds nothing
        tracker.update_from_transactions().await.unwrap();
        assert_approx_eq!(tracker.done_size(), 0.4);
    }
}
