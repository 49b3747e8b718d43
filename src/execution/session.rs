use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use rand::rngs::StdRng;
use rand::Rng;

use crate::execution::engine::ExchangeEngine;
use crate::orderbook::feed::lock_or_recover;
use crate::types::{AssetPair, OrderAction, SpreadAndPrice, TimedOrderStatus};
use crate::utils::SIZE_EPSILON;

/// Tunables of the adaptive execution loops. Defaults reproduce live
/// behavior; tests shrink the intervals.
#[derive(Debug, Clone)]
pub struct ExecutionParams {
    /// Base poll interval of the timed-take loop.
    pub tick: Duration,
    /// Extra delay range after a slice actually fills.
    pub min_slice_delay: Duration,
    pub max_slice_delay: Duration,
    /// A slice takes this fraction range of the best level's size.
    pub slice_min_factor: f64,
    pub slice_max_factor: f64,
    /// When capped by max_order_size, the cap itself is sampled in this range.
    pub cap_min_factor: f64,
    pub cap_max_factor: f64,
    /// Relative distance from the limit price at which execution starts.
    pub start_tolerance: f64,
    /// Requote interval range of the single-exchange make loop.
    pub make_requote_min: Duration,
    pub make_requote_max: Duration,
    /// Residual below this counts as fully covered when splitting.
    pub make_min_remaining: f64,
    /// Quote-currency step the multi-make loop moves its price offset by.
    pub make_offset_step: f64,
    /// Rebalance interval of the multi-make loop; actual sleeps are sampled
    /// in [factor * interval, interval].
    pub make_rebalance_interval: Duration,
    pub make_sleep_factor: f64,
    /// EMA weight kept by the multi-make rate estimate per rebalance.
    pub rate_time_ratio: f64,
}

impl Default for ExecutionParams {
    fn default() -> Self {
        Self {
            tick: Duration::from_millis(500),
            min_slice_delay: Duration::from_secs(2),
            max_slice_delay: Duration::from_secs(8),
            slice_min_factor: 0.3,
            slice_max_factor: 0.7,
            cap_min_factor: 0.6,
            cap_max_factor: 1.0,
            start_tolerance: 0.001,
            make_requote_min: Duration::from_secs(2),
            make_requote_max: Duration::from_secs(5),
            make_min_remaining: 1e-4,
            make_offset_step: 5.0,
            make_rebalance_interval: Duration::from_secs(30),
            make_sleep_factor: 0.75,
            rate_time_ratio: 0.95,
        }
    }
}

/// Shared state of one timed execution session: a single running flag plus
/// the externally visible status. Only one session per owner may run; the
/// flag is claimed with a compare-and-swap.
pub struct TimedOrderState {
    running: AtomicBool,
    status: Mutex<TimedOrderStatus>,
}

impl TimedOrderState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            running: AtomicBool::new(false),
            status: Mutex::new(TimedOrderStatus::default()),
        })
    }

    /// Claims the session. Returns false if one is already running.
    pub fn try_begin(
        &self,
        action: OrderAction,
        pair: &AssetPair,
        price: f64,
        size: f64,
        duration: Duration,
    ) -> bool {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }
        let mut status = lock_or_recover(&self.status);
        *status = TimedOrderStatus {
            running: true,
            action: Some(action),
            pair: Some(pair.clone()),
            price,
            required_size: size,
            done_size: 0.0,
            sent_time: chrono::Utc::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            execution_start_time: String::new(),
            elapsed_sec: 0.0,
            duration_sec: duration.as_secs_f64(),
            incomplete: false,
        };
        true
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Requests the session to stop. Returns whether one was running.
    pub fn cancel(&self) -> bool {
        self.running.swap(false, Ordering::SeqCst)
    }

    pub fn add_done(&self, size: f64) {
        lock_or_recover(&self.status).done_size += size;
    }

    pub fn done_size(&self) -> f64 {
        lock_or_recover(&self.status).done_size
    }

    pub fn mark_execution_started(&self) {
        lock_or_recover(&self.status).execution_start_time =
            chrono::Utc::now().format("%Y-%m-%d %H:%M:%S").to_string();
    }

    pub fn set_elapsed(&self, elapsed: Duration) {
        lock_or_recover(&self.status).elapsed_sec = elapsed.as_secs_f64();
    }

    pub fn set_incomplete(&self) {
        lock_or_recover(&self.status).incomplete = true;
    }

    pub fn finish(&self) {
        self.running.store(false, Ordering::SeqCst);
        lock_or_recover(&self.status).running = false;
    }

    pub fn snapshot(&self) -> TimedOrderStatus {
        let mut status = lock_or_recover(&self.status).clone();
        status.running = self.is_running();
        status
    }
}

/// Where the next timed-take slice would go: an engine plus the market
/// context the gating math needs.
pub struct TakeVenue {
    pub engine: Arc<ExchangeEngine>,
    pub quote: SpreadAndPrice,
    pub average_spread: f64,
    pub minimum_order_size: f64,
}

/// Supplies venues to the shared timed-take loop. The single-exchange
/// engine returns itself; the coordinator returns whichever venue currently
/// quotes the best fee-adjusted price.
pub trait TakeVenueSource: Send + Sync {
    fn pick_venue(&self, pair: &AssetPair, action: OrderAction) -> Option<TakeVenue>;

    /// Called after every tick with the still-unfilled size.
    fn on_progress(&self, _remaining: f64) {}
}

/// Receives executed sizes funneled back from order trackers.
pub trait ExecutionSink: Send + Sync {
    fn add_executed_size(&self, size: f64, price: f64, pair: &AssetPair);
}

/// Callbacks into the owner of running sessions (the clients manager).
pub trait SessionHost: Send + Sync {
    fn set_last_status(&self, status: TimedOrderStatus);

    fn unregister_session(&self, _session_id: &str) {}
}

pub(crate) fn sample_uniform(rng: &Mutex<StdRng>, low: f64, high: f64) -> f64 {
    if low >= high {
        return low;
    }
    lock_or_recover(rng).gen_range(low..high)
}

pub(crate) fn sample_unit(rng: &Mutex<StdRng>) -> f64 {
    lock_or_recover(rng).gen::<f64>()
}

/// The adaptive timed-take loop: waits until the market comes within the
/// start tolerance of the limit price, then sends randomized slices gated by
/// `exp(-spread_ratio * actual_rate / required_rate)` so execution slows
/// down when the book is wide or we are ahead of schedule. Runs until the
/// required size is done, the state is cancelled, or the owner stops it.
pub async fn run_timed_take(
    source: &dyn TakeVenueSource,
    state: &TimedOrderState,
    rng: &Mutex<StdRng>,
    params: &ExecutionParams,
    pair: &AssetPair,
    action: OrderAction,
    size: f64,
    price: f64,
    duration: Duration,
    max_order_size: f64,
) -> f64 {
    let mut started = false;
    let mut start_time: Option<Instant> = None;

    while state.is_running() {
        let mut sleep_time = params.tick;
        match source.pick_venue(pair, action) {
            None => warn!("timed take: no venue for {}", pair),
            Some(venue) => {
                let quote = venue.quote;
                match (quote.ask, quote.bid) {
                    (Some(ask), Some(bid)) => {
                        if !started {
                            // price 0 is a market order: start right away
                            started = price == 0.0
                                || match action.side() {
                                    crate::types::Side::Buy => {
                                        price / ask > 1.0 - params.start_tolerance
                                    }
                                    crate::types::Side::Sell => {
                                        price / bid < 1.0 + params.start_tolerance
                                    }
                                };
                            if started {
                                info!("timed take for {} started", pair);
                                start_time = Some(Instant::now());
                                state.mark_execution_started();
                            }
                        }
                        if started {
                            let elapsed = start_time
                                .map(|t| t.elapsed())
                                .unwrap_or_default();
                            state.set_elapsed(elapsed);
                            let required_rate = size / duration.as_secs_f64();
                            let done = state.done_size();
                            let actual_rate = if done != 0.0 && elapsed.as_secs_f64() > 0.0 {
                                done / elapsed.as_secs_f64()
                            } else {
                                required_rate
                            };
                            let spread_ratio = if venue.average_spread != 0.0 {
                                quote.spread / venue.average_spread
                            } else {
                                1.0
                            };
                            if spread_ratio <= 0.0 {
                                warn!(
                                    "timed take: invalid spread ratio {} (average {})",
                                    spread_ratio, venue.average_spread
                                );
                            } else {
                                let factor =
                                    (-spread_ratio * actual_rate / required_rate).exp();
                                let roll = sample_unit(rng);
                                debug!(
                                    "timed take: done={} factor={} roll={} actual_rate={} required_rate={}",
                                    done, factor, roll, actual_rate, required_rate
                                );
                                if factor > roll {
                                    let curr_size = size - done;
                                    // keep the remainder executable: if what would
                                    // be left after a capped slice is below the
                                    // exchange minimum, send the remainder as-is
                                    let relative =
                                        curr_size - max_order_size >= venue.minimum_order_size;
                                    let outcome = venue
                                        .engine
                                        .send_immediate_order(
                                            action,
                                            curr_size,
                                            pair,
                                            price,
                                            relative,
                                            max_order_size,
                                        )
                                        .await;
                                    match outcome {
                                        Ok(sent) if sent.executed_size > 0.0 => {
                                            state.add_done(sent.executed_size);
                                            sleep_time += Duration::from_secs_f64(sample_uniform(
                                                rng,
                                                params.min_slice_delay.as_secs_f64(),
                                                params.max_slice_delay.as_secs_f64(),
                                            ));
                                        }
                                        Ok(_) => {}
                                        Err(err) => {
                                            warn!("timed take: slice failed: {}", err)
                                        }
                                    }
                                }
                            }
                            source.on_progress(size - state.done_size());
                        }
                    }
                    _ => warn!("timed take: missing price for {}", pair),
                }
            }
        }
        if state.done_size() >= size - SIZE_EPSILON {
            break;
        }
        tokio::time::sleep(sleep_time).await;
    }
    state.done_size()
}
