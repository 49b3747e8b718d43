use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::task::JoinHandle;

use crate::error::{Result, TraderError};
use crate::execution::engine::ExchangeEngine;
use crate::execution::session::{
    run_timed_take, sample_uniform, ExecutionParams, SessionHost, TakeVenue, TakeVenueSource,
    TimedOrderState,
};
use crate::orderbook::feed::lock_or_recover;
use crate::orderbook::unified::UnifiedBook;
use crate::orderbook::watchdog::OrderbookWatchdog;
use crate::types::{
    AccountBalance, AssetPair, FeeMode, OrderAction, OrderOutcome, OrderStatus, PriceLevel, Side,
    TimedOrderStatus,
};
use crate::utils::round_size;

/// Depth of the unified book walked when splitting an immediate order.
const SPLIT_BOOK_DEPTH: usize = 20;

/// Fronts a set of single-exchange engines with one logical order. Owns a
/// private unified book scoped to its members (kept fresh by the watchdog
/// while registered) and splits size across exchanges by fee-adjusted
/// price, balance, and minimum order size. One coordinator serves one
/// logical order; the manager releases it on completion.
pub struct MultiExchangeCoordinator {
    self_ref: Weak<Self>,
    session_id: String,
    engines: HashMap<String, Arc<ExchangeEngine>>,
    unified: Arc<UnifiedBook>,
    watchdog: Arc<OrderbookWatchdog>,
    host: Mutex<Option<Arc<dyn SessionHost>>>,
    state: Arc<TimedOrderState>,
    params: ExecutionParams,
    rng: Mutex<StdRng>,
    timed_task: Mutex<Option<JoinHandle<()>>>,
}

impl MultiExchangeCoordinator {
    pub fn new(
        session_id: String,
        engines: HashMap<String, Arc<ExchangeEngine>>,
        watchdog: Arc<OrderbookWatchdog>,
    ) -> Arc<Self> {
        Self::with_rng(
            session_id,
            engines,
            watchdog,
            ExecutionParams::default(),
            StdRng::from_entropy(),
        )
    }

    pub fn with_rng(
        session_id: String,
        engines: HashMap<String, Arc<ExchangeEngine>>,
        watchdog: Arc<OrderbookWatchdog>,
        params: ExecutionParams,
        rng: StdRng,
    ) -> Arc<Self> {
        let unified = UnifiedBook::new();
        for engine in engines.values() {
            let adapter = engine.feed().current();
            unified.set_adapter(adapter.exchange().to_string(), Some(adapter));
        }
        Arc::new_cyclic(|weak| Self {
            self_ref: weak.clone(),
            session_id,
            engines,
            unified,
            watchdog,
            host: Mutex::new(None),
            state: TimedOrderState::new(),
            params,
            rng: Mutex::new(rng),
            timed_task: Mutex::new(None),
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn set_host(&self, host: Arc<dyn SessionHost>) {
        *lock_or_recover(&self.host) = Some(host);
    }

    pub fn exchange_names(&self) -> String {
        let mut names: Vec<&str> = self.engines.keys().map(String::as_str).collect();
        names.sort();
        names.join(", ")
    }

    fn members_sorted(&self) -> Vec<Arc<ExchangeEngine>> {
        let mut members: Vec<Arc<ExchangeEngine>> = self.engines.values().cloned().collect();
        members.sort_by(|a, b| a.exchange().cmp(b.exchange()));
        members
    }

    pub fn is_initialized(&self) -> bool {
        self.engines.values().all(|e| e.is_initialized())
    }

    /// Balances summed per currency across all member exchanges.
    pub async fn account_balance(&self) -> AccountBalance {
        let mut total = AccountBalance::default();
        for engine in self.members_sorted() {
            let balance = engine.account_balance().await;
            for (currency, amounts) in balance.balances {
                let entry = total.balances.entry(currency).or_default();
                entry.amount += amounts.amount;
                entry.available += amounts.available;
            }
            total.reserved_base += balance.reserved_base;
            if !balance.reserved_base_currency.is_empty() {
                total.reserved_base_currency = balance.reserved_base_currency;
            }
            total.reserved_quote += balance.reserved_quote;
        }
        total
    }

    async fn can_send_order(
        &self,
        action: OrderAction,
        pair: &AssetPair,
        size: f64,
        price: f64,
    ) -> Result<()> {
        if size <= 0.0 {
            return Err(TraderError::Validation("Invalid size".to_string()));
        }
        if price < 0.0 {
            return Err(TraderError::Validation("Invalid price".to_string()));
        }
        let balance = self.account_balance().await;
        match action.side() {
            Side::Sell => {
                let available = balance.available(&pair.base);
                if size > available {
                    return Err(TraderError::InsufficientBalance(format!(
                        "Combined balance {}{} is less than required size {}{}",
                        available, pair.base, size, pair.base
                    )));
                }
            }
            Side::Buy => {
                if price > 0.0 {
                    let fee = self
                        .engines
                        .values()
                        .map(|e| e.adapter().fee_percent(FeeMode::Taker))
                        .fold(0.0, f64::max);
                    let required = price * size * (1.0 + 0.01 * fee);
                    let available = balance.available(&pair.quote);
                    if required > available {
                        return Err(TraderError::InsufficientBalance(format!(
                            "Combined balance {}{} is less than required balance {}",
                            available, pair.quote, required
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// Unified entry point, mirroring the single-exchange engine's.
    pub async fn send_order(
        &self,
        action: OrderAction,
        pair: &AssetPair,
        size: f64,
        price: f64,
        duration: Duration,
        max_order_size: f64,
    ) -> Result<OrderOutcome> {
        self.watchdog
            .register_orderbook(&self.session_id, self.unified.clone());
        if !self.is_initialized() {
            self.complete(false);
            return Ok(OrderOutcome::rejected("Exchange client not initialized"));
        }
        if let Err(err) = self.can_send_order(action, pair, size, price).await {
            warn!("{}: order not allowed: {}", self.exchange_names(), err);
            self.complete(false);
            return Ok(OrderOutcome::rejected(err.to_string()));
        }
        if duration.is_zero() {
            let outcome = self
                .send_immediate_order(action, size, pair, price, false, max_order_size)
                .await?;
            self.complete(false);
            return Ok(outcome);
        }

        if !self.state.try_begin(action, pair, price, size, duration) {
            warn!(
                "{}: timed order already running, ignoring new timed order",
                self.exchange_names()
            );
            return Ok(OrderOutcome::rejected("Timed order already running"));
        }
        let Some(this) = self.self_ref.upgrade() else {
            self.state.finish();
            return Ok(OrderOutcome::rejected("Coordinator shutting down"));
        };
        let pair = pair.clone();
        let task = tokio::spawn(async move {
            if action.is_make() {
                this.run_timed_make_multi(&pair, action, size, price, duration, max_order_size)
                    .await;
            } else {
                run_timed_take(
                    this.as_ref(),
                    &this.state,
                    &this.rng,
                    &this.params,
                    &pair,
                    action,
                    size,
                    price,
                    duration,
                    max_order_size,
                )
                .await;
            }
            this.finish_timed_session().await;
        });
        *lock_or_recover(&self.timed_task) = Some(task);
        Ok(OrderOutcome::pending())
    }

    /// Splits an immediate order across member exchanges by walking the
    /// fee-adjusted unified book, then submits each exchange its share.
    pub async fn send_immediate_order(
        &self,
        action: OrderAction,
        size: f64,
        pair: &AssetPair,
        price: f64,
        relative: bool,
        max_order_size: f64,
    ) -> Result<OrderOutcome> {
        let book = self
            .unified
            .get_unified_book(pair, SPLIT_BOOK_DEPTH, FeeMode::Taker);
        let levels = match action.side() {
            Side::Buy => &book.asks,
            Side::Sell => &book.bids,
        };
        let split = split_order_across_levels(levels, size);
        info!("{}: order split: {:?}", self.exchange_names(), split);

        let mut total_executed = 0.0;
        let mut messages = Vec::new();
        for (exchange, slice) in split {
            let Some(engine) = self.engines.get(&exchange) else {
                continue;
            };
            match engine
                .send_immediate_order(action, slice, pair, price, relative, max_order_size)
                .await
            {
                Ok(outcome) => {
                    debug!("{}: slice outcome: {:?}", exchange, outcome.status);
                    if !outcome.message.is_empty() {
                        messages.push(outcome.message);
                    }
                    total_executed += outcome.executed_size;
                }
                Err(err) => {
                    warn!("{}: slice failed: {}", exchange, err);
                    messages.push(err.to_string());
                }
            }
        }
        let status = if total_executed > 0.0 {
            OrderStatus::Finished
        } else {
            OrderStatus::Cancelled
        };
        Ok(OrderOutcome {
            executed_size: total_executed,
            message: messages.join("; "),
            accepted: true,
            status,
        })
    }

    /// The rebalancing resting-order loop: each tick collects member fills,
    /// adapts a price offset to the realized rate, recomputes the per-member
    /// split under minimum-size and balance constraints, and restarts member
    /// make sessions at the adaptive price.
    async fn run_timed_make_multi(
        &self,
        pair: &AssetPair,
        action: OrderAction,
        size: f64,
        limit: f64,
        duration: Duration,
        max_order_size: f64,
    ) {
        let started = Instant::now();
        // positive offset rests away from the target price (passive)
        let mut offset = self.params.make_offset_step;
        let mut curr_rate = 0.0;
        let mut prev_tick: Option<Instant> = None;

        while self.state.is_running() {
            if let Some(prev) = prev_tick {
                let round_fills = self.collect_round_fills().await;
                self.state.add_done(round_fills);
                let elapsed = started.elapsed();
                self.state.set_elapsed(elapsed);
                let remaining = size - self.state.done_size();
                let time_left = duration.saturating_sub(elapsed).as_secs_f64().max(1.0);
                let required_rate = remaining / time_left;
                let dt = prev.elapsed().as_secs_f64().max(f64::EPSILON);
                curr_rate = self.params.rate_time_ratio * curr_rate
                    + (1.0 - self.params.rate_time_ratio) * round_fills / dt;
                if curr_rate > required_rate {
                    offset += self.params.make_offset_step;
                    info!(
                        "{}: fill rate ahead of schedule, widening offset to {}",
                        self.exchange_names(),
                        offset
                    );
                } else if curr_rate < required_rate {
                    offset -= self.params.make_offset_step;
                    info!(
                        "{}: fill rate behind schedule, tightening offset to {}",
                        self.exchange_names(),
                        offset
                    );
                }
            }

            let remaining = size - self.state.done_size();
            if remaining < self.params.make_min_remaining {
                break;
            }

            let members = self.collect_member_quotes(pair, action, limit).await;
            if members.is_empty() {
                warn!("{}: no member has a price for {}", self.exchange_names(), pair);
            } else {
                let Some(assignments) = self.split_for_make(&members, remaining) else {
                    self.state.set_incomplete();
                    self.state.cancel();
                    break;
                };
                let quote_price = adaptive_quote(&members, action, limit, offset);
                for (member, share) in assignments {
                    info!(
                        "{}: resting {} {} on {} @ {}",
                        self.exchange_names(),
                        share,
                        pair,
                        member.engine.exchange(),
                        quote_price
                    );
                    match member
                        .engine
                        .send_order(action, pair, share, quote_price, duration, max_order_size)
                        .await
                    {
                        Ok(outcome) if !outcome.accepted => warn!(
                            "{}: member rejected slice: {}",
                            member.engine.exchange(),
                            outcome.message
                        ),
                        Ok(_) => {}
                        Err(err) => {
                            warn!("{}: member slice failed: {}", member.engine.exchange(), err)
                        }
                    }
                }
            }

            if self.state.is_running() {
                let sleep = sample_uniform(
                    &self.rng,
                    self.params.make_sleep_factor
                        * self.params.make_rebalance_interval.as_secs_f64(),
                    self.params.make_rebalance_interval.as_secs_f64(),
                );
                debug!("{}: rebalance sleep {:.1}s", self.exchange_names(), sleep);
                prev_tick = Some(Instant::now());
                tokio::time::sleep(Duration::from_secs_f64(sleep)).await;
            }
        }

        let round_fills = self.collect_round_fills().await;
        self.state.add_done(round_fills);
    }

    /// Stops every member session and sums what the round filled. A fill
    /// racing the cancel reaches member state only while the session task
    /// winds down, so done sizes are read after the join.
    async fn collect_round_fills(&self) -> f64 {
        for engine in self.members_sorted() {
            engine.cancel_timed_order();
        }
        let mut round_fills = 0.0;
        for engine in self.members_sorted() {
            engine.join_timed_session().await;
            round_fills += engine.get_timed_order_status().done_size;
        }
        round_fills
    }

    async fn collect_member_quotes(
        &self,
        pair: &AssetPair,
        action: OrderAction,
        limit: f64,
    ) -> Vec<MemberQuote> {
        let mut members = Vec::new();
        for engine in self.members_sorted() {
            let feed = engine.feed().current();
            let quote = feed.spread_and_price(pair);
            // a maker joins their own side's touch
            let touch = match action.side() {
                Side::Sell => quote.ask,
                Side::Buy => quote.bid,
            };
            let Some(touch) = touch else {
                continue;
            };
            let balance = engine.account_balance().await;
            let base_available = balance.available(&pair.base);
            let quote_available = balance.available(&pair.quote);
            let capacity = match action.side() {
                Side::Sell => base_available,
                Side::Buy => {
                    let reference = if limit > 0.0 { limit } else { touch };
                    quote_available / reference
                }
            };
            members.push(MemberQuote {
                minimum_order_size: engine.minimum_order_size(pair),
                engine,
                touch,
                capacity,
            });
        }
        members
    }

    /// Equal split under minimum-size constraints, falling back to a greedy
    /// balance-ascending redistribution. Returns None when the remaining
    /// size cannot be covered, which stops the session as incomplete.
    fn split_for_make<'a>(
        &self,
        members: &'a [MemberQuote],
        remaining: f64,
    ) -> Option<Vec<(&'a MemberQuote, f64)>> {
        let mut eligible: Vec<&MemberQuote> = members.iter().collect();
        eligible.sort_by(|a, b| {
            a.minimum_order_size
                .partial_cmp(&b.minimum_order_size)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let mut share;
        loop {
            if eligible.is_empty() {
                warn!(
                    "{}: remaining size {} too small for every member",
                    self.exchange_names(),
                    remaining
                );
                return None;
            }
            share = round_size(remaining / eligible.len() as f64);
            match eligible.iter().position(|m| m.minimum_order_size > share) {
                None => break,
                Some(_) => {
                    if eligible.len() == 1 {
                        warn!(
                            "{}: remaining size {} below the last member's minimum",
                            self.exchange_names(),
                            remaining
                        );
                        return None;
                    }
                    // the largest minimum is the hardest to satisfy
                    let removed = eligible.pop();
                    if let Some(removed) = removed {
                        debug!(
                            "{}: dropping {} from split (minimum {} > share {})",
                            self.exchange_names(),
                            removed.engine.exchange(),
                            removed.minimum_order_size,
                            share
                        );
                    }
                }
            }
        }

        let needs_rebalance = eligible.iter().any(|m| m.capacity < share);
        if !needs_rebalance {
            return Some(eligible.into_iter().map(|m| (m, share)).collect());
        }

        // balance-constrained: assign the thinnest members first, pushing
        // the shortfall onto members with more room
        eligible.sort_by(|a, b| {
            a.capacity
                .partial_cmp(&b.capacity)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        let mut assignments = Vec::new();
        let mut left = remaining;
        let count = eligible.len();
        let mut share = round_size(left / count as f64);
        for (index, member) in eligible.into_iter().enumerate() {
            let take = if share <= member.capacity {
                share
            } else {
                member.capacity
            };
            if take > 0.0 {
                assignments.push((member, take));
            }
            left -= take;
            let rest = count - index - 1;
            if rest > 0 {
                share = round_size(left / rest as f64);
            }
        }
        if left > self.params.make_min_remaining {
            warn!(
                "{}: not enough combined balance, {} uncovered",
                self.exchange_names(),
                left
            );
            return None;
        }
        Some(assignments)
    }

    async fn finish_timed_session(&self) {
        self.state.finish();
        self.complete(true);
    }

    fn complete(&self, timed: bool) {
        self.watchdog.unregister_orderbook(&self.session_id);
        let host = lock_or_recover(&self.host).clone();
        if let Some(host) = host {
            if timed {
                host.set_last_status(self.state.snapshot());
            }
            host.unregister_session(&self.session_id);
        }
    }

    pub fn cancel_timed_order(&self) -> bool {
        let cancelled = self.state.cancel();
        for engine in self.members_sorted() {
            engine.cancel_timed_order();
        }
        cancelled
    }

    pub fn is_timed_order_running(&self) -> bool {
        self.state.is_running()
    }

    pub fn get_timed_order_status(&self) -> TimedOrderStatus {
        self.state.snapshot()
    }

    pub async fn join_timed_session(&self) {
        let task = lock_or_recover(&self.timed_task).take();
        if let Some(task) = task {
            if let Err(err) = task.await {
                if !err.is_cancelled() {
                    warn!(
                        "{}: timed session task failed: {}",
                        self.exchange_names(),
                        err
                    );
                }
            }
        }
    }
}

struct MemberQuote {
    engine: Arc<ExchangeEngine>,
    /// Best price on this member's own side (ask for sell, bid for buy).
    touch: f64,
    minimum_order_size: f64,
    /// Most base units this member's available balance can support.
    capacity: f64,
}

/// Picks the best touch among members and applies the adaptive offset,
/// clamped so the quote never crosses the client's limit.
fn adaptive_quote(members: &[MemberQuote], action: OrderAction, limit: f64, offset: f64) -> f64 {
    match action.side() {
        Side::Sell => {
            let best = members.iter().map(|m| m.touch).fold(f64::INFINITY, f64::min);
            (best + offset).max(limit)
        }
        Side::Buy => {
            let best = members.iter().map(|m| m.touch).fold(0.0, f64::max);
            let quote = best - offset;
            if limit > 0.0 {
                quote.min(limit)
            } else {
                quote
            }
        }
    }
}

impl TakeVenueSource for MultiExchangeCoordinator {
    /// The venue is whichever exchange tops the fee-adjusted unified book;
    /// pacing context (spread and its average) comes from the unified view.
    fn pick_venue(&self, pair: &AssetPair, action: OrderAction) -> Option<TakeVenue> {
        let top = self.unified.get_unified_book(pair, 1, FeeMode::Taker);
        let level = match action.side() {
            Side::Buy => top.best_ask(),
            Side::Sell => top.best_bid(),
        }?;
        let engine = self.engines.get(&level.source)?.clone();
        Some(TakeVenue {
            quote: self.unified.spread_and_price(pair),
            average_spread: self.unified.average_spread(pair),
            minimum_order_size: engine.minimum_order_size(pair),
            engine,
        })
    }
}

/// Walks one side of the merged book, greedily assigning each level's
/// visible size to its source exchange until the requested size is covered
/// or depth runs out. Returns per-exchange totals in first-seen order.
pub(crate) fn split_order_across_levels(levels: &[PriceLevel], size: f64) -> Vec<(String, f64)> {
    let mut split: Vec<(String, f64)> = Vec::new();
    let mut remaining = size;
    for level in levels {
        if remaining <= 0.0 {
            break;
        }
        let take = remaining.min(level.size);
        match split.iter_mut().find(|(name, _)| *name == level.source) {
            Some((_, total)) => *total += take,
            None => split.push((level.source.clone(), take)),
        }
        remaining -= take;
    }
    split
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use pretty_assertions::assert_eq;

    fn level(price: f64, size: f64, source: &str) -> PriceLevel {
        PriceLevel::new(price, size, source)
    }

    #[test]
    fn split_walks_levels_in_order() {
        let levels = vec![
            level(100.0, 1.0, "alpha"),
            level(101.0, 2.0, "beta"),
            level(102.0, 5.0, "alpha"),
        ];
        let split = split_order_across_levels(&levels, 2.5);
        assert_eq!(split.len(), 2);
        assert_eq!(split[0].0, "alpha");
        assert_approx_eq!(split[0].1, 1.0);
        assert_eq!(split[1].0, "beta");
        assert_approx_eq!(split[1].1, 1.5);
    }

    #[test]
    fn split_aggregates_repeat_sources() {
        let levels = vec![
            level(100.0, 1.0, "alpha"),
            level(101.0, 0.5, "beta"),
            level(102.0, 5.0, "alpha"),
        ];
        let split = split_order_across_levels(&levels, 3.0);
        assert_eq!(split.len(), 2);
        assert_approx_eq!(split[0].1, 2.5);
        assert_approx_eq!(split[1].1, 0.5);
    }

    #[test]
    fn split_conserves_size_when_depth_suffices() {
        let levels = vec![
            level(100.0, 1.0, "a"),
            level(100.5, 1.0, "b"),
            level(101.0, 1.0, "c"),
        ];
        let split = split_order_across_levels(&levels, 2.0);
        let total: f64 = split.iter().map(|(_, s)| s).sum();
        assert_approx_eq!(total, 2.0);
    }

    #[test]
    fn split_stops_at_available_depth() {
        let levels = vec![level(100.0, 0.5, "a")];
        let split = split_order_across_levels(&levels, 2.0);
        assert_eq!(split.len(), 1);
        assert_approx_eq!(split[0].1, 0.5);
    }

    #[test]
    fn adaptive_quote_clamps_to_limit() {
        let quotes = [
            MemberQuote {
                engine: unreachable_engine(),
                touch: 100.0,
                minimum_order_size: 0.001,
                capacity: 1.0,
            },
            MemberQuote {
                engine: unreachable_engine(),
                touch: 101.0,
                minimum_order_size: 0.001,
                capacity: 1.0,
            },
        ];
        // sell: best ask 100 plus offset 5 rests at 105; a limit above
        // that becomes the floor
        assert_approx_eq!(adaptive_quote(&quotes, OrderAction::SellLimit, 102.0, 5.0), 105.0);
        assert_approx_eq!(adaptive_quote(&quotes, OrderAction::SellLimit, 110.0, 5.0), 110.0);
        // buy: best bid 101 minus offset 5 quotes 96; a lower limit caps it
        assert_approx_eq!(adaptive_quote(&quotes, OrderAction::BuyLimit, 94.0, 5.0), 94.0);
        assert_approx_eq!(adaptive_quote(&quotes, OrderAction::BuyLimit, 100.0, 5.0), 96.0);
    }

    fn unreachable_engine() -> Arc<ExchangeEngine> {
        use crate::persist::MemoryOrderHistory;
        use crate::testing::mock_exchange::{MockExchange, ScriptedFeed};
        use crate::orderbook::feed::{FeedAdapter, FeedHandle};
        use crate::types::FeeTable;

        let adapter = FeedAdapter::new(
            Arc::new(ScriptedFeed::empty("stub")),
            vec![AssetPair::new("BTC", "USD")],
            FeeTable::default(),
        );
        ExchangeEngine::new(
            Arc::new(MockExchange::new("stub")),
            FeedHandle::new(adapter),
            Arc::new(MemoryOrderHistory::new()),
        )
    }
}
