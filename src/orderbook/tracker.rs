use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::types::AssetPair;

const MAX_RATE_AGE: Duration = Duration::from_secs(60);
const SIZE_FOR_PRICE_RATE: f64 = 5.0;
const SPREAD_MIN_SAMPLES_FOR_MOVING: u64 = 100;

/// Exponential moving estimate of how fast the market is trading one side of
/// a pair, fed from the live trade stream. The blend weight of a new
/// observation grows with the time elapsed since the previous one; an
/// observation older than the window replaces the estimate outright.
#[derive(Debug)]
pub struct ExecutionRateTracker {
    price: f64,
    last_time: Instant,
    size_rate: f64,
    /// Sizes of trades that arrived within the same instant as the previous
    /// one; folded into the next rate sample.
    pending_size: f64,
    size_for_price_rate: f64,
    max_rate_age: Duration,
}

impl Default for ExecutionRateTracker {
    fn default() -> Self {
        Self::new(MAX_RATE_AGE, SIZE_FOR_PRICE_RATE)
    }
}

impl ExecutionRateTracker {
    pub fn new(max_rate_age: Duration, size_for_price_rate: f64) -> Self {
        Self::with_start(max_rate_age, size_for_price_rate, Instant::now())
    }

    /// Like `new` with an explicit first-observation time; pairs with
    /// `add_trade_at` for deterministic stepping in tests.
    pub fn with_start(max_rate_age: Duration, size_for_price_rate: f64, start: Instant) -> Self {
        Self {
            price: 0.0,
            last_time: start,
            size_rate: 0.0,
            pending_size: 0.0,
            size_for_price_rate,
            max_rate_age,
        }
    }

    pub fn add_trade(&mut self, size: f64, price: f64) {
        self.add_trade_at(size, price, Instant::now());
    }

    /// Same as `add_trade` but with an explicit clock, so tests can step time.
    pub fn add_trade_at(&mut self, size: f64, price: f64, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_time);
        self.last_time = now;
        let elapsed_sec = elapsed.as_secs_f64();

        let curr_rate = if elapsed_sec > 0.0 {
            let rate = (size + self.pending_size) / elapsed_sec;
            self.pending_size = 0.0;
            rate
        } else {
            self.pending_size += size;
            0.0
        };

        if curr_rate > 0.0 {
            if self.size_rate == 0.0 || elapsed > self.max_rate_age {
                self.size_rate = curr_rate;
            } else {
                let time_ratio = elapsed_sec / self.max_rate_age.as_secs_f64();
                self.size_rate = time_ratio * curr_rate + (1.0 - time_ratio) * self.size_rate;
            }
            if size > self.size_for_price_rate || self.price == 0.0 {
                self.price = price;
            } else {
                let price_ratio = size / self.size_for_price_rate;
                self.price = price_ratio * price + (1.0 - price_ratio) * self.price;
            }
        }
    }

    /// Estimated market execution rate, base units per second.
    pub fn size_rate(&self) -> f64 {
        self.size_rate
    }

    /// Size-weighted moving price of recent trades.
    pub fn price(&self) -> f64 {
        self.price
    }
}

/// Moving average of the top-of-book spread per pair. Samples where the
/// spread is zero or negative are ignored; the weight of a new sample is
/// 1/min(samples, 100), so early readings converge fast and the average
/// settles into a slow-moving window.
#[derive(Debug, Default)]
pub struct SpreadTracker {
    inner: Mutex<HashMap<AssetPair, SpreadState>>,
}

#[derive(Debug, Default, Clone, Copy)]
struct SpreadState {
    average: f64,
    samples: u64,
}

impl SpreadTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&self, pair: &AssetPair, spread: f64) {
        if spread <= 0.0 {
            return;
        }
        let mut inner = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let state = inner.entry(pair.clone()).or_default();
        state.samples += 1;
        let ratio = 1.0 / state.samples.min(SPREAD_MIN_SAMPLES_FOR_MOVING) as f64;
        state.average = (1.0 - ratio) * state.average + ratio * spread;
    }

    pub fn average(&self, pair: &AssetPair) -> f64 {
        let inner = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        inner.get(pair).map(|s| s.average).unwrap_or(0.0)
    }

    pub fn reset(&self, pair: &AssetPair) {
        let mut inner = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        inner.remove(pair);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    fn pair() -> AssetPair {
        AssetPair::new("BTC", "USD")
    }

    fn tracker_at(start: Instant) -> ExecutionRateTracker {
        ExecutionRateTracker::with_start(Duration::from_secs(60), 5.0, start)
    }

    #[test]
    fn first_trade_sets_rate_directly() {
        let start = Instant::now();
        let mut tracker = tracker_at(start);
        tracker.add_trade_at(2.0, 100.0, start + Duration::from_secs(4));
        assert_approx_eq!(tracker.size_rate(), 0.5);
        assert_approx_eq!(tracker.price(), 100.0);
    }

    #[test]
    fn rate_blends_by_elapsed_time() {
        let start = Instant::now();
        let mut tracker = tracker_at(start);
        tracker.add_trade_at(1.0, 100.0, start + Duration::from_secs(1));
        // 6 seconds later: time_ratio = 0.1, curr_rate = 3/6 = 0.5
        tracker.add_trade_at(3.0, 100.0, start + Duration::from_secs(7));
        assert_approx_eq!(tracker.size_rate(), 0.1 * 0.5 + 0.9 * 1.0, 1e-9);
    }

    #[test]
    fn stale_gap_replaces_rate() {
        let start = Instant::now();
        let mut tracker = tracker_at(start);
        tracker.add_trade_at(1.0, 100.0, start + Duration::from_secs(1));
        tracker.add_trade_at(10.0, 100.0, start + Duration::from_secs(101));
        assert_approx_eq!(tracker.size_rate(), 0.1);
    }

    #[test]
    fn same_instant_trades_accumulate() {
        let start = Instant::now();
        let mut tracker = tracker_at(start);
        tracker.add_trade_at(1.0, 100.0, start + Duration::from_secs(1));
        let t = start + Duration::from_secs(2);
        tracker.add_trade_at(2.0, 100.0, t);
        // identical timestamp: folded into the next sample
        tracker.add_trade_at(3.0, 100.0, t);
        let rate_after_second = (1.0 / 60.0) * 2.0 + (1.0 - 1.0 / 60.0) * 1.0;
        tracker.add_trade_at(1.0, 100.0, t + Duration::from_secs(1));
        // curr_rate = (1 + 3 pending) / 1s = 4.0, blended with weight 1/60
        let expected = (1.0 / 60.0) * 4.0 + (1.0 - 1.0 / 60.0) * rate_after_second;
        assert_approx_eq!(tracker.size_rate(), expected, 1e-9);
    }

    #[test]
    fn large_trade_snaps_price() {
        let start = Instant::now();
        let mut tracker = tracker_at(start);
        tracker.add_trade_at(1.0, 100.0, start + Duration::from_secs(1));
        tracker.add_trade_at(6.0, 120.0, start + Duration::from_secs(2));
        assert_approx_eq!(tracker.price(), 120.0);
    }

    #[test]
    fn small_trade_blends_price_by_size() {
        let start = Instant::now();
        let mut tracker = tracker_at(start);
        tracker.add_trade_at(5.0, 100.0, start + Duration::from_secs(1));
        tracker.add_trade_at(1.0, 110.0, start + Duration::from_secs(2));
        assert_approx_eq!(tracker.price(), 0.2 * 110.0 + 0.8 * 100.0);
    }

    #[test]
    fn spread_average_warms_up_then_moves_slowly() {
        let tracker = SpreadTracker::new();
        tracker.observe(&pair(), 2.0);
        assert_approx_eq!(tracker.average(&pair()), 2.0);
        tracker.observe(&pair(), 4.0);
        assert_approx_eq!(tracker.average(&pair()), 3.0);
        // zero and negative spreads are ignored
        tracker.observe(&pair(), 0.0);
        tracker.observe(&pair(), -1.0);
        assert_approx_eq!(tracker.average(&pair()), 3.0);
    }

    #[test]
    fn spread_reset_clears_state() {
        let tracker = SpreadTracker::new();
        tracker.observe(&pair(), 2.0);
        tracker.reset(&pair());
        assert_approx_eq!(tracker.average(&pair()), 0.0);
    }
}
