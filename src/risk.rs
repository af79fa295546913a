//! Risk management
//!
//! The `RiskManager` is the only gate between a signal and an order, and the
//! only writer of `AccountState`. It enforces:
//! - the daily-loss circuit breaker (new exposure blocked, closes allowed)
//! - `max_open_positions`, counting orders still awaiting confirmation
//! - compounding position sizing from current equity
//! - per-strategy stop loss, take profit, trailing stop and max hold
//!
//! Position sizing formula:
//! ```text
//! quantity = clamp(size_fraction, 0, max_position_fraction) * equity * leverage / price
//! ```
//!
//! Equity and P&L use `Money`, so the equity after any set of realized P&L
//! events is exactly `daily_start_equity + sum(pnl)` whatever their order.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::config::TradingConfig;
use crate::error::RiskRejection;
use crate::gateway::{VenueAccount, VenuePosition};
use crate::strategies::RiskProfile;
use crate::{
    AccountState, ClosedTrade, Direction, ExitReason, Money, OrderSide, Position, Signal,
    SignalIntent, StrategyKind, Symbol,
};

/// Risk manager behind the single-writer lock
pub type SharedRiskManager = Arc<tokio::sync::Mutex<RiskManager>>;

/// Configuration for RiskManager using builder pattern
#[derive(Debug, Clone)]
pub struct RiskManagerConfig {
    pub starting_equity: Money,
    pub max_open_positions: usize,
    /// Base stop distance in percent, used when a strategy has no profile
    pub stop_loss_pct: f64,
    pub daily_loss_limit_pct: f64,
    /// Reporting target only
    pub daily_profit_target_pct: f64,
    pub circuit_breaker_duration: Duration,
    pub leverage: f64,
    pub max_position_fraction: f64,
    pub min_notional: f64,
    pub taker_fee: f64,
    pub profiles: BTreeMap<StrategyKind, RiskProfile>,
}

impl Default for RiskManagerConfig {
    fn default() -> Self {
        Self {
            starting_equity: Money::from_f64(10_000.0),
            max_open_positions: 10,
            stop_loss_pct: 1.5,
            daily_loss_limit_pct: 1.0,
            daily_profit_target_pct: 3.0,
            circuit_breaker_duration: Duration::hours(24),
            leverage: 1.0,
            max_position_fraction: 0.25,
            min_notional: 6.0,
            taker_fee: 0.0004,
            profiles: BTreeMap::new(),
        }
    }
}

impl RiskManagerConfig {
    /// Seed from the trading section of the configuration
    pub fn from_trading(trading: &TradingConfig, taker_fee: f64) -> Self {
        Self::default()
            .with_equity(Money::from_f64(trading.starting_equity))
            .with_max_positions(trading.max_open_positions)
            .with_stop_loss_pct(trading.stop_loss_pct)
            .with_daily_loss_limit_pct(trading.daily_loss_limit_pct)
            .with_daily_profit_target_pct(trading.daily_profit_target_pct)
            .with_circuit_breaker_hours(trading.circuit_breaker_hours)
            .with_leverage(trading.leverage)
            .with_max_position_fraction(trading.max_position_fraction)
            .with_min_notional(trading.min_notional)
            .with_taker_fee(taker_fee)
    }

    pub fn with_equity(mut self, equity: Money) -> Self {
        self.starting_equity = equity;
        self
    }

    /// Set maximum concurrent positions
    pub fn with_max_positions(mut self, max: usize) -> Self {
        self.max_open_positions = max;
        self
    }

    pub fn with_stop_loss_pct(mut self, pct: f64) -> Self {
        self.stop_loss_pct = pct;
        self
    }

    /// Daily loss (percent of start-of-day equity) that trips the breaker
    pub fn with_daily_loss_limit_pct(mut self, pct: f64) -> Self {
        self.daily_loss_limit_pct = pct;
        self
    }

    pub fn with_daily_profit_target_pct(mut self, pct: f64) -> Self {
        self.daily_profit_target_pct = pct;
        self
    }

    pub fn with_circuit_breaker_hours(mut self, hours: i64) -> Self {
        self.circuit_breaker_duration = Duration::hours(hours);
        self
    }

    pub fn with_leverage(mut self, leverage: f64) -> Self {
        self.leverage = leverage;
        self
    }

    pub fn with_max_position_fraction(mut self, fraction: f64) -> Self {
        self.max_position_fraction = fraction;
        self
    }

    pub fn with_min_notional(mut self, notional: f64) -> Self {
        self.min_notional = notional;
        self
    }

    pub fn with_taker_fee(mut self, fee: f64) -> Self {
        self.taker_fee = fee;
        self
    }

    pub fn with_profile(mut self, kind: StrategyKind, profile: RiskProfile) -> Self {
        self.profiles.insert(kind, profile);
        self
    }

    pub fn with_profiles(mut self, profiles: impl IntoIterator<Item = (StrategyKind, RiskProfile)>) -> Self {
        self.profiles.extend(profiles);
        self
    }

    /// Build the RiskManager with a fresh account
    pub fn build(self, now: DateTime<Utc>) -> RiskManager {
        let account = AccountState::new(self.starting_equity, now);
        RiskManager::with_account(self, account)
    }
}

/// Order the risk manager has sized and reserved capacity for
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovedOrder {
    pub client_order_id: String,
    pub symbol: Symbol,
    pub intent: SignalIntent,
    pub side: OrderSide,
    /// Direction of the position this order opens, grows or closes
    pub direction: Direction,
    pub quantity: f64,
    pub reference_price: f64,
    pub stop_price: Option<f64>,
    pub target_price: Option<f64>,
    pub strategy: StrategyKind,
    /// Set on closes
    pub exit_reason: Option<ExitReason>,
    pub approved_at: DateTime<Utc>,
}

impl ApprovedOrder {
    pub fn notional(&self) -> f64 {
        self.quantity * self.reference_price
    }

    pub fn is_close(&self) -> bool {
        self.intent == SignalIntent::Close
    }
}

/// Confirmed execution of an approved order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fill {
    pub client_order_id: String,
    pub order_id: String,
    pub symbol: Symbol,
    pub quantity: f64,
    pub price: f64,
    pub filled_at: DateTime<Utc>,
}

/// What a confirmed fill did to the account
#[derive(Debug, Clone, PartialEq)]
pub enum FillOutcome {
    Opened(Position),
    Added(Position),
    Closed(ClosedTrade),
}

/// Result of adopting venue state
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcileReport {
    /// Venue positions we had no record of
    pub adopted: Vec<Symbol>,
    /// Local positions whose size or entry changed
    pub updated: Vec<Symbol>,
    /// Local positions the venue no longer holds
    pub dropped: Vec<Symbol>,
    pub equity_before: Money,
    pub equity_after: Money,
}

/// Daily status for reporting
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DailyReport {
    pub equity: Money,
    pub daily_start_equity: Money,
    pub daily_realized_pnl: Money,
    pub daily_pnl_pct: f64,
    pub target_pct: f64,
    pub target_reached: bool,
    pub open_positions: usize,
    pub pending_orders: usize,
    pub circuit_breaker_until: Option<DateTime<Utc>>,
}

/// Sole owner of account state and the approval gate
#[derive(Debug, Clone)]
pub struct RiskManager {
    config: RiskManagerConfig,
    account: AccountState,
    pending: BTreeMap<Symbol, ApprovedOrder>,
    order_seq: u64,
}

impl RiskManager {
    /// Create from config with an existing account (restored checkpoint)
    pub fn with_account(config: RiskManagerConfig, account: AccountState) -> Self {
        Self {
            config,
            account,
            pending: BTreeMap::new(),
            order_seq: 0,
        }
    }

    pub fn into_shared(self) -> SharedRiskManager {
        Arc::new(tokio::sync::Mutex::new(self))
    }

    pub fn config(&self) -> &RiskManagerConfig {
        &self.config
    }

    pub fn account(&self) -> &AccountState {
        &self.account
    }

    /// Consistent copy for signal generation
    pub fn snapshot(&self) -> AccountState {
        self.account.clone()
    }

    pub fn pending_orders(&self) -> impl Iterator<Item = &ApprovedOrder> {
        self.pending.values()
    }

    pub fn profile(&self, kind: StrategyKind) -> RiskProfile {
        self.config
            .profiles
            .get(&kind)
            .cloned()
            .unwrap_or_else(|| RiskProfile::stop_only(self.config.stop_loss_pct))
    }

    /// Open positions plus opens awaiting confirmation
    pub fn committed_positions(&self) -> usize {
        let pending_opens = self
            .pending
            .values()
            .filter(|o| o.intent == SignalIntent::Open)
            .count();
        self.account.open_count() + pending_opens
    }

    // =========================================================================
    // Approval
    // =========================================================================

    /// Validate a signal against live account state and size it.
    /// On success the order's capacity is reserved until `confirm_fill` or
    /// `cancel`.
    pub fn approve(
        &mut self,
        signal: &Signal,
        price: f64,
        now: DateTime<Utc>,
    ) -> Result<ApprovedOrder, RiskRejection> {
        if !signal.is_actionable() {
            return Err(RiskRejection::NotActionable);
        }
        if !(price.is_finite() && price > 0.0) {
            return Err(RiskRejection::InvalidPrice(price));
        }
        if self.pending.contains_key(&signal.symbol) {
            return Err(RiskRejection::PendingOrder(signal.symbol.clone()));
        }

        let order = match signal.intent {
            SignalIntent::Close => self.close_order(&signal.symbol, price, ExitReason::Signal, now)?,
            SignalIntent::Open => self.open_order(signal, price, now)?,
            SignalIntent::Add => self.add_order(signal, price, now)?,
            SignalIntent::Hold => return Err(RiskRejection::NotActionable),
        };

        self.pending.insert(order.symbol.clone(), order.clone());
        Ok(order)
    }

    /// Close order for a stop/target/trailing/max-hold exit
    pub fn exit_order(
        &mut self,
        symbol: &Symbol,
        price: f64,
        reason: ExitReason,
        now: DateTime<Utc>,
    ) -> Result<ApprovedOrder, RiskRejection> {
        if !(price.is_finite() && price > 0.0) {
            return Err(RiskRejection::InvalidPrice(price));
        }
        if self.pending.contains_key(symbol) {
            return Err(RiskRejection::PendingOrder(symbol.clone()));
        }
        let order = self.close_order(symbol, price, reason, now)?;
        self.pending.insert(order.symbol.clone(), order.clone());
        Ok(order)
    }

    fn check_breaker(&self, now: DateTime<Utc>) -> Result<(), RiskRejection> {
        match self.account.circuit_breaker_until {
            Some(until) if now < until => Err(RiskRejection::CircuitBreakerActive { until }),
            _ => Ok(()),
        }
    }

    fn open_order(
        &mut self,
        signal: &Signal,
        price: f64,
        now: DateTime<Utc>,
    ) -> Result<ApprovedOrder, RiskRejection> {
        let side = OrderSide::opening(signal.direction).ok_or(RiskRejection::NotActionable)?;

        self.check_breaker(now)?;

        let committed = self.committed_positions();
        if committed >= self.config.max_open_positions {
            return Err(RiskRejection::CapacityExceeded {
                open: committed,
                max: self.config.max_open_positions,
            });
        }

        if self.account.open_positions.contains_key(&signal.symbol) {
            return Err(RiskRejection::PositionExists(signal.symbol.clone()));
        }

        let quantity = self.size(signal.size_fraction, price)?;
        let profile = self.profile(signal.source);
        let (stop, target) = stop_and_target(signal.direction, price, &profile);

        Ok(ApprovedOrder {
            client_order_id: self.next_order_id(now),
            symbol: signal.symbol.clone(),
            intent: SignalIntent::Open,
            side,
            direction: signal.direction,
            quantity,
            reference_price: price,
            stop_price: Some(stop),
            target_price: target,
            strategy: signal.source,
            exit_reason: None,
            approved_at: now,
        })
    }

    fn add_order(
        &mut self,
        signal: &Signal,
        price: f64,
        now: DateTime<Utc>,
    ) -> Result<ApprovedOrder, RiskRejection> {
        self.check_breaker(now)?;

        let position = self
            .account
            .position(&signal.symbol)
            .ok_or_else(|| RiskRejection::NoOpenPosition(signal.symbol.clone()))?;

        if position.direction != signal.direction || position.strategy != signal.source {
            return Err(RiskRejection::DirectionMismatch);
        }

        let max_adds = self.profile(position.strategy).max_adds;
        if position.adds >= max_adds {
            return Err(RiskRejection::PyramidLimit {
                adds: position.adds,
                max: max_adds,
            });
        }

        let side = OrderSide::opening(position.direction).ok_or(RiskRejection::DirectionMismatch)?;
        let direction = position.direction;
        let stop = position.stop_price;
        let target = position.target_price;
        let quantity = self.size(signal.size_fraction, price)?;

        Ok(ApprovedOrder {
            client_order_id: self.next_order_id(now),
            symbol: signal.symbol.clone(),
            intent: SignalIntent::Add,
            side,
            direction,
            quantity,
            reference_price: price,
            stop_price: Some(stop),
            target_price: target,
            strategy: signal.source,
            exit_reason: None,
            approved_at: now,
        })
    }

    /// Closes are never blocked by the breaker or capacity
    fn close_order(
        &mut self,
        symbol: &Symbol,
        price: f64,
        reason: ExitReason,
        now: DateTime<Utc>,
    ) -> Result<ApprovedOrder, RiskRejection> {
        let position = self
            .account
            .position(symbol)
            .ok_or_else(|| RiskRejection::NoOpenPosition(symbol.clone()))?;

        let side = OrderSide::closing(position.direction).ok_or(RiskRejection::DirectionMismatch)?;
        let direction = position.direction;
        let quantity = position.quantity;
        let strategy = position.strategy;

        Ok(ApprovedOrder {
            client_order_id: self.next_order_id(now),
            symbol: symbol.clone(),
            intent: SignalIntent::Close,
            side,
            direction,
            quantity,
            reference_price: price,
            stop_price: None,
            target_price: None,
            strategy,
            exit_reason: Some(reason),
            approved_at: now,
        })
    }

    /// Compounding size: the fraction applies to current equity
    fn size(&self, fraction: f64, price: f64) -> Result<f64, RiskRejection> {
        let fraction = if fraction.is_finite() {
            fraction.clamp(0.0, self.config.max_position_fraction)
        } else {
            0.0
        };
        let notional = fraction * self.account.equity.to_f64() * self.config.leverage;
        if notional < self.config.min_notional {
            return Err(RiskRejection::BelowMinimumSize {
                notional,
                minimum: self.config.min_notional,
            });
        }
        Ok(notional / price)
    }

    fn next_order_id(&mut self, now: DateTime<Utc>) -> String {
        self.order_seq += 1;
        format!("rt-{}-{}", now.timestamp_millis(), self.order_seq)
    }

    // =========================================================================
    // Fill handling
    // =========================================================================

    /// Apply a confirmed fill. Returns `None` for fills we hold no
    /// reservation for.
    pub fn confirm_fill(&mut self, fill: &Fill) -> Option<FillOutcome> {
        let reserved = self
            .pending
            .get(&fill.symbol)
            .is_some_and(|o| o.client_order_id == fill.client_order_id);
        if !reserved {
            tracing::warn!(
                symbol = %fill.symbol,
                client_order_id = %fill.client_order_id,
                "Fill without a matching reservation ignored"
            );
            return None;
        }
        let order = self.pending.remove(&fill.symbol)?;

        match order.intent {
            SignalIntent::Open => {
                let profile = self.profile(order.strategy);
                let (stop, target) = stop_and_target(order.direction, fill.price, &profile);
                let position = Position {
                    symbol: fill.symbol.clone(),
                    direction: order.direction,
                    entry_price: fill.price,
                    quantity: fill.quantity,
                    opened_at: fill.filled_at,
                    strategy: order.strategy,
                    stop_price: stop,
                    target_price: target,
                    trailing_stop_pct: profile.trailing_stop_pct,
                    best_price: fill.price,
                    adds: 0,
                    max_hold_until: profile.max_hold.map(|d| fill.filled_at + d),
                };
                self.account
                    .open_positions
                    .insert(fill.symbol.clone(), position.clone());

                tracing::info!(
                    symbol = %position.symbol,
                    direction = %position.direction,
                    strategy = %position.strategy,
                    quantity = position.quantity,
                    entry = position.entry_price,
                    stop = format!("{:.4}", position.stop_price),
                    open_positions = self.account.open_count(),
                    "Position opened"
                );
                Some(FillOutcome::Opened(position))
            }
            SignalIntent::Add => {
                let profile = self.profile(order.strategy);
                let position = self.account.open_positions.get_mut(&fill.symbol)?;

                let total = position.quantity + fill.quantity;
                if total > 0.0 {
                    position.entry_price = (position.entry_price * position.quantity
                        + fill.price * fill.quantity)
                        / total;
                }
                position.quantity = total;
                position.adds += 1;
                let (stop, target) = stop_and_target(position.direction, position.entry_price, &profile);
                position.stop_price = stop;
                position.target_price = target;

                tracing::info!(
                    symbol = %position.symbol,
                    adds = position.adds,
                    quantity = position.quantity,
                    avg_entry = format!("{:.4}", position.entry_price),
                    "Position pyramided"
                );
                Some(FillOutcome::Added(position.clone()))
            }
            SignalIntent::Close => {
                let position = self.account.open_positions.remove(&fill.symbol)?;
                let trade = self.realize(
                    position,
                    fill.price,
                    fill.quantity,
                    fill.filled_at,
                    order.exit_reason.unwrap_or(ExitReason::Signal),
                );
                Some(FillOutcome::Closed(trade))
            }
            SignalIntent::Hold => None,
        }
    }

    /// Release a reservation after a rejected or abandoned order
    pub fn cancel(&mut self, symbol: &Symbol) -> Option<ApprovedOrder> {
        let order = self.pending.remove(symbol);
        if let Some(ref o) = order {
            tracing::debug!(symbol = %o.symbol, client_order_id = %o.client_order_id, "Reservation released");
        }
        order
    }

    fn realize(
        &mut self,
        position: Position,
        exit_price: f64,
        quantity: f64,
        closed_at: DateTime<Utc>,
        reason: ExitReason,
    ) -> ClosedTrade {
        let quantity = if quantity > 0.0 { quantity.min(position.quantity) } else { position.quantity };
        let gross = (exit_price - position.entry_price) * quantity * position.direction.sign();
        let fees = (position.entry_price + exit_price) * quantity * self.config.taker_fee;

        let gross_pnl = Money::from_f64(gross).round_dp(8);
        let fees = Money::from_f64(fees).round_dp(8);
        let net_pnl = gross_pnl - fees;

        // Partial close keeps the remainder open
        if quantity < position.quantity {
            let mut remainder = position.clone();
            remainder.quantity = position.quantity - quantity;
            self.account
                .open_positions
                .insert(position.symbol.clone(), remainder);
        }

        let trade = ClosedTrade {
            symbol: position.symbol.clone(),
            direction: position.direction,
            strategy: position.strategy,
            entry_price: position.entry_price,
            exit_price,
            quantity,
            opened_at: position.opened_at,
            closed_at,
            gross_pnl,
            fees,
            net_pnl,
            reason,
        };

        tracing::info!(
            symbol = %trade.symbol,
            strategy = %trade.strategy,
            reason = %reason,
            pnl = %net_pnl,
            return_pct = format!("{:.2}%", trade.return_pct()),
            "Position closed"
        );

        self.record_realized_pnl(net_pnl, closed_at);
        trade
    }

    // =========================================================================
    // Exits
    // =========================================================================

    /// Evaluate stop loss, trailing stop, take profit and max hold for one
    /// position at `price`. Ratchets the trailing reference as a side effect.
    pub fn check_exit(&mut self, symbol: &Symbol, price: f64, now: DateTime<Utc>) -> Option<ExitReason> {
        let position = self.account.open_positions.get_mut(symbol)?;

        match position.direction {
            Direction::Long => position.best_price = position.best_price.max(price),
            Direction::Short => position.best_price = position.best_price.min(price),
            Direction::Flat => return None,
        }

        let sign = position.direction.sign();
        let beyond = |level: f64| (price - level) * sign;

        if beyond(position.stop_price) <= 0.0 {
            return Some(ExitReason::StopLoss);
        }

        if let Some(trail_pct) = position.trailing_stop_pct {
            let trail_level = position.best_price * (1.0 - sign * trail_pct / 100.0);
            let in_profit = (position.best_price - position.entry_price) * sign > 0.0;
            if in_profit && beyond(trail_level) <= 0.0 {
                return Some(ExitReason::TrailingStop);
            }
        }

        if let Some(target) = position.target_price {
            if beyond(target) >= 0.0 {
                return Some(ExitReason::TakeProfit);
            }
        }

        match position.max_hold_until {
            Some(deadline) if now >= deadline => Some(ExitReason::MaxHold),
            _ => None,
        }
    }

    // =========================================================================
    // P&L, breaker and daily accounting
    // =========================================================================

    /// Compound a realized P&L event into equity and check the breaker
    pub fn record_realized_pnl(&mut self, pnl: Money, now: DateTime<Utc>) {
        self.account.equity += pnl;
        self.account.daily_realized_pnl += pnl;

        let limit = -self.config.daily_loss_limit_pct / 100.0;
        let ratio = self.account.daily_pnl_ratio();
        if ratio < limit && !self.account.breaker_active(now) {
            let until = now + self.config.circuit_breaker_duration;
            self.account.circuit_breaker_until = Some(until);
            tracing::warn!(
                daily_pnl_pct = format!("{:.2}%", ratio * 100.0),
                limit_pct = format!("{:.2}%", limit * 100.0),
                until = %until,
                "Circuit breaker tripped, new positions blocked"
            );
        }
    }

    /// Clear an elapsed breaker (resetting the daily baseline) or roll the
    /// daily counters at the UTC date boundary
    pub fn refresh(&mut self, now: DateTime<Utc>) {
        if let Some(until) = self.account.circuit_breaker_until {
            if now >= until {
                self.account.circuit_breaker_until = None;
                self.reset_day(now);
                tracing::info!(equity = %self.account.equity, "Circuit breaker cleared");
            }
            return;
        }

        if now.date_naive() != self.account.day_started.date_naive() {
            tracing::info!(
                equity = %self.account.equity,
                daily_pnl = %self.account.daily_realized_pnl,
                "Daily accounting rolled over"
            );
            self.reset_day(now);
        }
    }

    fn reset_day(&mut self, now: DateTime<Utc>) {
        self.account.daily_start_equity = self.account.equity;
        self.account.daily_realized_pnl = Money::ZERO;
        self.account.day_started = now;
    }

    pub fn daily_report(&self) -> DailyReport {
        let pct = self.account.daily_pnl_ratio() * 100.0;
        DailyReport {
            equity: self.account.equity,
            daily_start_equity: self.account.daily_start_equity,
            daily_realized_pnl: self.account.daily_realized_pnl,
            daily_pnl_pct: pct,
            target_pct: self.config.daily_profit_target_pct,
            target_reached: pct >= self.config.daily_profit_target_pct,
            open_positions: self.account.open_count(),
            pending_orders: self.pending.len(),
            circuit_breaker_until: self.account.circuit_breaker_until,
        }
    }

    // =========================================================================
    // Reconciliation
    // =========================================================================

    /// Adopt the venue's view of equity and positions. Local ownership and
    /// exit metadata survive for positions the venue confirms; positions the
    /// venue opened for an unconfirmed order go to the strategy that reserved
    /// it.
    ///
    /// When the venue closed or reduced anything, the equity difference is
    /// realized P&L and goes through `record_realized_pnl`, so it counts
    /// toward the daily loss limit. Otherwise the difference only moves the
    /// daily baseline.
    pub fn reconcile(&mut self, venue: &VenueAccount, now: DateTime<Utc>) -> ReconcileReport {
        let mut report = ReconcileReport {
            equity_before: self.account.equity,
            equity_after: venue.equity,
            ..Default::default()
        };

        let mut previous = std::mem::take(&mut self.account.open_positions);
        let pending = std::mem::take(&mut self.pending);
        let mut reduced = false;

        for vp in venue
            .positions
            .iter()
            .filter(|p| p.quantity > 0.0 && p.direction != Direction::Flat)
        {
            let reserved = pending.get(&vp.symbol);
            let position = match previous.remove(&vp.symbol) {
                Some(local) if local.direction == vp.direction => {
                    reduced |= vp.quantity < local.quantity - f64::EPSILON;
                    let (position, changed) = self.merge_venue_position(local, vp, reserved);
                    if changed {
                        report.updated.push(vp.symbol.clone());
                    }
                    position
                }
                other => {
                    // Local position on the other side is gone
                    reduced |= other.is_some();
                    report.adopted.push(vp.symbol.clone());
                    self.adopt_venue_position(vp, reserved, now)
                }
            };
            self.account.open_positions.insert(vp.symbol.clone(), position);
        }

        report.dropped = previous.into_keys().collect();
        reduced |= !report.dropped.is_empty();

        let delta = venue.equity - self.account.equity;
        let realized = if reduced { delta } else { Money::ZERO };
        if reduced {
            self.record_realized_pnl(delta, now);
        } else {
            self.account.equity = venue.equity;
            self.account.daily_start_equity += delta;
        }

        tracing::info!(
            adopted = report.adopted.len(),
            updated = report.updated.len(),
            dropped = report.dropped.len(),
            released = pending.len(),
            equity = %venue.equity,
            realized = %realized,
            "Account reconciled with venue"
        );
        for symbol in &report.dropped {
            tracing::warn!(symbol = %symbol, "Local position not held at venue, dropped");
        }

        report
    }

    /// Venue size and entry win. A filled add counts toward the pyramid cap.
    fn merge_venue_position(
        &self,
        mut local: Position,
        vp: &VenuePosition,
        reserved: Option<&ApprovedOrder>,
    ) -> (Position, bool) {
        let changed = (local.quantity - vp.quantity).abs() > f64::EPSILON
            || (local.entry_price - vp.entry_price).abs() > f64::EPSILON;
        if !changed {
            return (local, false);
        }

        let added = vp.quantity > local.quantity
            && reserved.is_some_and(|o| o.intent == SignalIntent::Add && o.strategy == local.strategy);
        local.quantity = vp.quantity;
        local.entry_price = vp.entry_price;
        if added {
            local.adds += 1;
            let profile = self.profile(local.strategy);
            let (stop, target) = stop_and_target(local.direction, local.entry_price, &profile);
            local.stop_price = stop;
            local.target_price = target;
        }
        (local, true)
    }

    /// Position we hold no record of. An unconfirmed open on the same side
    /// names its owner; anything else goes to Protective (short) or Trend.
    fn adopt_venue_position(
        &self,
        vp: &VenuePosition,
        reserved: Option<&ApprovedOrder>,
        now: DateTime<Utc>,
    ) -> Position {
        let (strategy, opened_at) = match reserved {
            Some(order) if order.intent == SignalIntent::Open && order.direction == vp.direction => {
                (order.strategy, order.approved_at)
            }
            _ => match vp.direction {
                Direction::Short => (StrategyKind::Protective, now),
                _ => (StrategyKind::Trend, now),
            },
        };
        let profile = self.profile(strategy);
        let (stop, target) = stop_and_target(vp.direction, vp.entry_price, &profile);
        Position {
            symbol: vp.symbol.clone(),
            direction: vp.direction,
            entry_price: vp.entry_price,
            quantity: vp.quantity,
            opened_at,
            strategy,
            stop_price: stop,
            target_price: target,
            trailing_stop_pct: profile.trailing_stop_pct,
            best_price: vp.entry_price,
            adds: 0,
            max_hold_until: profile.max_hold.map(|d| opened_at + d),
        }
    }
}

/// Stop and optional target for an entry at `price`
fn stop_and_target(direction: Direction, price: f64, profile: &RiskProfile) -> (f64, Option<f64>) {
    let sign = direction.sign();
    let stop = price * (1.0 - sign * profile.stop_loss_pct / 100.0);
    let target = profile
        .take_profit_pct
        .map(|tp| price * (1.0 + sign * tp / 100.0));
    (stop, target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::VenuePosition;
    use crate::strategies::StrategySet;
    use crate::{PairIndicators, PairMetrics};
    use approx::assert_relative_eq;
    use chrono::TimeZone;
    use itertools::Itertools;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 7, 1, 9, 0, 0).unwrap()
    }

    fn manager() -> RiskManager {
        RiskManagerConfig::default()
            .with_equity(Money::from_f64(10_000.0))
            .with_profiles(StrategySet::default().risk_profiles(1.5))
            .with_taker_fee(0.0)
            .build(t0())
    }

    fn pair(symbol: &str, price: f64) -> PairMetrics {
        PairMetrics {
            symbol: Symbol::new(symbol),
            quote_volume_24h: 80_000_000.0,
            volatility: 1.0,
            liquid: true,
            price,
            indicators: PairIndicators::default(),
            timestamp: t0(),
        }
    }

    fn open_signal(symbol: &str, direction: Direction, source: StrategyKind) -> Signal {
        Signal::open(&pair(symbol, 100.0), direction, 0.1, source)
    }

    fn fill_for(order: &ApprovedOrder, price: f64, at: DateTime<Utc>) -> Fill {
        Fill {
            client_order_id: order.client_order_id.clone(),
            order_id: format!("v-{}", order.client_order_id),
            symbol: order.symbol.clone(),
            quantity: order.quantity,
            price,
            filled_at: at,
        }
    }

    fn open_position(rm: &mut RiskManager, symbol: &str, direction: Direction, source: StrategyKind) {
        let order = rm.approve(&open_signal(symbol, direction, source), 100.0, t0()).unwrap();
        rm.confirm_fill(&fill_for(&order, 100.0, t0())).unwrap();
    }

    #[test]
    fn test_sizing_compounds_on_current_equity() {
        let mut rm = manager();
        let order = rm.approve(&open_signal("ETHUSDT", Direction::Long, StrategyKind::Trend), 100.0, t0()).unwrap();
        // 0.1 * 10_000 / 100
        assert_relative_eq!(order.quantity, 10.0, epsilon = 1e-9);
        assert_eq!(order.side, OrderSide::Buy);
        assert_relative_eq!(order.stop_price.unwrap(), 98.5, epsilon = 1e-9);
        rm.cancel(&order.symbol);

        rm.record_realized_pnl(Money::from_f64(1_000.0), t0());
        let order = rm.approve(&open_signal("ETHUSDT", Direction::Long, StrategyKind::Trend), 100.0, t0()).unwrap();
        assert_relative_eq!(order.quantity, 11.0, epsilon = 1e-9);
    }

    #[test]
    fn test_fraction_is_capped_and_tiny_orders_rejected() {
        let mut rm = manager();
        let mut greedy = open_signal("SOLUSDT", Direction::Long, StrategyKind::Trend);
        greedy.size_fraction = 5.0;
        let order = rm.approve(&greedy, 100.0, t0()).unwrap();
        assert_relative_eq!(order.notional(), 2_500.0, epsilon = 1e-6);

        let mut dust = open_signal("XRPUSDT", Direction::Long, StrategyKind::Trend);
        dust.size_fraction = 0.0001;
        assert!(matches!(
            rm.approve(&dust, 100.0, t0()),
            Err(RiskRejection::BelowMinimumSize { .. })
        ));
    }

    #[test]
    fn test_capacity_is_never_exceeded() {
        let mut rm = manager();
        for i in 0..10 {
            open_position(&mut rm, &format!("P{i}USDT"), Direction::Long, StrategyKind::Trend);
        }
        assert_eq!(rm.account().open_count(), 10);

        let err = rm
            .approve(&open_signal("NEWUSDT", Direction::Long, StrategyKind::Trend), 100.0, t0())
            .unwrap_err();
        assert_eq!(err, RiskRejection::CapacityExceeded { open: 10, max: 10 });
        assert_eq!(rm.account().open_count(), 10);
    }

    #[test]
    fn test_pending_opens_count_toward_capacity() {
        let mut rm = manager();
        for i in 0..9 {
            open_position(&mut rm, &format!("P{i}USDT"), Direction::Long, StrategyKind::Trend);
        }
        rm.approve(&open_signal("AUSDT", Direction::Long, StrategyKind::Trend), 100.0, t0())
            .unwrap();
        assert!(matches!(
            rm.approve(&open_signal("BUSDT", Direction::Long, StrategyKind::Trend), 100.0, t0()),
            Err(RiskRejection::CapacityExceeded { open: 10, max: 10 })
        ));

        rm.cancel(&Symbol::new("AUSDT"));
        assert!(rm
            .approve(&open_signal("BUSDT", Direction::Long, StrategyKind::Trend), 100.0, t0())
            .is_ok());
    }

    /// Every interleaving of approvals, fills and cancels keeps the count
    /// at or below the limit
    #[test]
    fn test_capacity_holds_under_any_interleaving() {
        let symbols = ["AUSDT", "BUSDT", "CUSDT", "DUSDT", "EUSDT"];
        for order in symbols.iter().permutations(symbols.len()) {
            let mut rm = RiskManagerConfig::default().with_max_positions(3).build(t0());
            for (i, symbol) in order.iter().enumerate() {
                let approved = rm.approve(&open_signal(symbol, Direction::Long, StrategyKind::Trend), 100.0, t0());
                if let Ok(o) = approved {
                    if i % 2 == 0 {
                        rm.confirm_fill(&fill_for(&o, 100.0, t0()));
                    }
                }
                assert!(rm.committed_positions() <= 3);
                assert!(rm.account().open_count() <= 3);
            }
        }
    }

    #[test]
    fn test_breaker_blocks_opens_for_24h_but_allows_closes() {
        let mut rm = manager();
        open_position(&mut rm, "ETHUSDT", Direction::Long, StrategyKind::Trend);

        // -1.01% of 10_000
        rm.record_realized_pnl(Money::from_f64(-101.0), t0());
        let until = rm.account().circuit_breaker_until.unwrap();
        assert_eq!(until, t0() + Duration::hours(24));

        for hours in [0, 1, 12, 23] {
            let now = t0() + Duration::hours(hours);
            rm.refresh(now);
            assert!(matches!(
                rm.approve(&open_signal("BTCUSDT", Direction::Long, StrategyKind::Trend), 100.0, now),
                Err(RiskRejection::CircuitBreakerActive { .. })
            ));
        }

        let close = Signal::close(&pair("ETHUSDT", 99.0), StrategyKind::Trend);
        let order = rm.approve(&close, 99.0, t0() + Duration::hours(2)).unwrap();
        assert!(order.is_close());
        assert_eq!(order.side, OrderSide::Sell);
        rm.confirm_fill(&fill_for(&order, 99.0, t0() + Duration::hours(2))).unwrap();
        assert_eq!(rm.account().open_count(), 0);

        let later = t0() + Duration::hours(24);
        rm.refresh(later);
        assert!(rm.account().circuit_breaker_until.is_none());
        assert_eq!(rm.account().daily_start_equity, rm.account().equity);
        assert!(rm
            .approve(&open_signal("BTCUSDT", Direction::Long, StrategyKind::Trend), 100.0, later)
            .is_ok());
    }

    #[test]
    fn test_loss_at_limit_does_not_trip() {
        let mut rm = manager();
        rm.record_realized_pnl(Money::from_f64(-100.0), t0());
        assert!(rm.account().circuit_breaker_until.is_none());
    }

    #[test]
    fn test_compounding_is_order_independent() {
        let events = [125.37, -42.11, 0.01, -300.0, 77.77, 12.5];
        let start = manager().account().daily_start_equity;
        let expected = start + events.iter().map(|&p| Money::from_f64(p)).sum::<Money>();

        for order in events.iter().permutations(events.len()) {
            let mut rm = manager();
            for pnl in order {
                rm.record_realized_pnl(Money::from_f64(*pnl), t0());
            }
            assert_eq!(rm.account().equity, expected);
            assert_eq!(rm.account().daily_start_equity + rm.account().daily_realized_pnl, expected);
        }
    }

    #[test]
    fn test_pyramiding_merges_and_respects_cap() {
        let mut rm = manager();
        open_position(&mut rm, "ETHUSDT", Direction::Long, StrategyKind::Trend);

        for (i, price) in [102.0, 104.0].into_iter().enumerate() {
            let add = Signal::add(&pair("ETHUSDT", price), Direction::Long, 0.05, StrategyKind::Trend);
            let order = rm.approve(&add, price, t0()).unwrap();
            match rm.confirm_fill(&fill_for(&order, price, t0())).unwrap() {
                FillOutcome::Added(p) => assert_eq!(p.adds, i as u32 + 1),
                other => panic!("unexpected outcome {other:?}"),
            }
        }

        let position = rm.account().position(&Symbol::new("ETHUSDT")).unwrap();
        assert!(position.entry_price > 100.0 && position.entry_price < 104.0);
        assert_eq!(rm.account().open_count(), 1);

        let third = Signal::add(&pair("ETHUSDT", 106.0), Direction::Long, 0.05, StrategyKind::Trend);
        assert_eq!(
            rm.approve(&third, 106.0, t0()),
            Err(RiskRejection::PyramidLimit { adds: 2, max: 2 })
        );
    }

    #[test]
    fn test_add_from_other_strategy_is_rejected() {
        let mut rm = manager();
        open_position(&mut rm, "ETHUSDT", Direction::Short, StrategyKind::Protective);
        let add = Signal::add(&pair("ETHUSDT", 98.0), Direction::Long, 0.05, StrategyKind::Trend);
        assert_eq!(rm.approve(&add, 98.0, t0()), Err(RiskRejection::DirectionMismatch));
    }

    #[test]
    fn test_one_order_in_flight_per_symbol() {
        let mut rm = manager();
        rm.approve(&open_signal("ETHUSDT", Direction::Long, StrategyKind::Trend), 100.0, t0())
            .unwrap();
        assert!(matches!(
            rm.approve(&open_signal("ETHUSDT", Direction::Long, StrategyKind::Trend), 100.0, t0()),
            Err(RiskRejection::PendingOrder(_))
        ));
    }

    #[test]
    fn test_exit_checks() {
        let mut rm = manager();
        open_position(&mut rm, "ETHUSDT", Direction::Long, StrategyKind::Trend);
        let eth = Symbol::new("ETHUSDT");

        assert_eq!(rm.check_exit(&eth, 101.0, t0()), None);
        assert_eq!(rm.check_exit(&eth, 98.4, t0()), Some(ExitReason::StopLoss));

        // Ratchet to 104, then give back more than 2%
        assert_eq!(rm.check_exit(&eth, 104.0, t0()), None);
        assert_eq!(rm.check_exit(&eth, 101.8, t0()), Some(ExitReason::TrailingStop));
        assert_eq!(rm.check_exit(&eth, 104.6, t0()), Some(ExitReason::TakeProfit));

        open_position(&mut rm, "SOLUSDT", Direction::Short, StrategyKind::Scalp);
        let sol = Symbol::new("SOLUSDT");
        assert_eq!(rm.check_exit(&sol, 100.2, t0()), None);
        assert_eq!(rm.check_exit(&sol, 100.5, t0()), Some(ExitReason::StopLoss));
        assert_eq!(rm.check_exit(&sol, 99.3, t0()), Some(ExitReason::TakeProfit));
        assert_eq!(
            rm.check_exit(&sol, 100.1, t0() + Duration::minutes(15)),
            Some(ExitReason::MaxHold)
        );
    }

    #[test]
    fn test_close_realizes_pnl_with_fees() {
        let mut rm = RiskManagerConfig::default()
            .with_taker_fee(0.001)
            .build(t0());
        open_position(&mut rm, "ETHUSDT", Direction::Long, StrategyKind::Trend);

        let order = rm
            .exit_order(&Symbol::new("ETHUSDT"), 110.0, ExitReason::TakeProfit, t0())
            .unwrap();
        let trade = match rm.confirm_fill(&fill_for(&order, 110.0, t0())).unwrap() {
            FillOutcome::Closed(trade) => trade,
            other => panic!("unexpected outcome {other:?}"),
        };

        // 10 units: gross 100, fees (100 + 110) * 10 * 0.001 = 2.1
        assert_relative_eq!(trade.gross_pnl.to_f64(), 100.0, epsilon = 1e-6);
        assert_relative_eq!(trade.fees.to_f64(), 2.1, epsilon = 1e-6);
        assert_eq!(trade.reason, ExitReason::TakeProfit);
        assert_relative_eq!(rm.account().equity.to_f64(), 10_097.9, epsilon = 1e-6);
    }

    #[test]
    fn test_daily_rollover_resets_baseline() {
        let mut rm = manager();
        rm.record_realized_pnl(Money::from_f64(50.0), t0());
        rm.refresh(t0() + Duration::hours(2));
        assert_eq!(rm.account().daily_realized_pnl, Money::from_f64(50.0));

        rm.refresh(t0() + Duration::days(1));
        assert_eq!(rm.account().daily_realized_pnl, Money::ZERO);
        assert_eq!(rm.account().daily_start_equity, Money::from_f64(10_050.0));
    }

    #[test]
    fn test_daily_report_target_is_informational() {
        let mut rm = manager();
        rm.record_realized_pnl(Money::from_f64(350.0), t0());
        let report = rm.daily_report();
        assert!(report.target_reached);
        assert_relative_eq!(report.daily_pnl_pct, 3.5, epsilon = 1e-9);
        assert!(rm
            .approve(&open_signal("ETHUSDT", Direction::Long, StrategyKind::Trend), 100.0, t0())
            .is_ok());
    }

    #[test]
    fn test_reconcile_adopts_venue_state() {
        let mut rm = manager();
        open_position(&mut rm, "ETHUSDT", Direction::Long, StrategyKind::Trend);
        open_position(&mut rm, "BNBUSDT", Direction::Long, StrategyKind::Trend);
        rm.approve(&open_signal("ADAUSDT", Direction::Long, StrategyKind::Trend), 100.0, t0())
            .unwrap();

        let venue = VenueAccount {
            equity: Money::from_f64(9_900.0),
            positions: vec![
                VenuePosition {
                    symbol: Symbol::new("ETHUSDT"),
                    direction: Direction::Long,
                    quantity: 12.0,
                    entry_price: 100.5,
                },
                VenuePosition {
                    symbol: Symbol::new("DOGEUSDT"),
                    direction: Direction::Short,
                    quantity: 1_000.0,
                    entry_price: 0.1,
                },
            ],
        };

        let report = rm.reconcile(&venue, t0());
        assert_eq!(report.adopted, vec![Symbol::new("DOGEUSDT")]);
        assert_eq!(report.updated, vec![Symbol::new("ETHUSDT")]);
        assert_eq!(report.dropped, vec![Symbol::new("BNBUSDT")]);

        let account = rm.account();
        assert_eq!(account.equity, Money::from_f64(9_900.0));
        assert_eq!(account.open_count(), 2);
        assert_eq!(
            account.position(&Symbol::new("DOGEUSDT")).unwrap().strategy,
            StrategyKind::Protective
        );
        assert_eq!(account.position(&Symbol::new("ETHUSDT")).unwrap().strategy, StrategyKind::Trend);
        assert_eq!(rm.pending_orders().count(), 0);
    }

    #[test]
    fn test_reconciled_close_counts_toward_daily_loss() {
        let mut rm = manager();
        let signal = Signal::open(&pair("ETHUSDT", 100.0), Direction::Long, 0.25, StrategyKind::Trend);
        let order = rm.approve(&signal, 100.0, t0()).unwrap();
        rm.confirm_fill(&fill_for(&order, 100.0, t0())).unwrap();

        // Stop-loss close submitted, outcome unknown
        let later = t0() + Duration::minutes(30);
        rm.exit_order(&Symbol::new("ETHUSDT"), 98.5, ExitReason::StopLoss, later)
            .unwrap();

        let venue = VenueAccount {
            equity: Money::from_f64(9_850.0),
            positions: vec![],
        };
        let report = rm.reconcile(&venue, later);
        assert_eq!(report.dropped, vec![Symbol::new("ETHUSDT")]);

        let account = rm.account();
        assert_eq!(account.equity, Money::from_f64(9_850.0));
        assert_eq!(account.daily_realized_pnl, Money::from_f64(-150.0));
        assert_eq!(account.daily_start_equity, Money::from_f64(10_000.0));
        assert!(account.breaker_active(later));

        let err = rm
            .approve(&open_signal("BTCUSDT", Direction::Long, StrategyKind::Trend), 100.0, later)
            .unwrap_err();
        assert!(matches!(err, RiskRejection::CircuitBreakerActive { .. }));
    }

    #[test]
    fn test_reconcile_drift_without_closes_moves_baseline() {
        let mut rm = manager();
        let venue = VenueAccount {
            equity: Money::from_f64(10_500.0),
            positions: vec![],
        };
        rm.reconcile(&venue, t0());

        let account = rm.account();
        assert_eq!(account.equity, Money::from_f64(10_500.0));
        assert_eq!(account.daily_start_equity, Money::from_f64(10_500.0));
        assert_eq!(account.daily_realized_pnl, Money::ZERO);
        assert!(!rm.daily_report().target_reached);
    }

    #[test]
    fn test_reconcile_gives_unconfirmed_open_to_its_strategy() {
        let mut rm = manager();
        let order = rm
            .approve(&open_signal("SOLUSDT", Direction::Short, StrategyKind::Scalp), 100.0, t0())
            .unwrap();

        let later = t0() + Duration::minutes(2);
        let venue = VenueAccount {
            equity: Money::from_f64(10_000.0),
            positions: vec![VenuePosition {
                symbol: Symbol::new("SOLUSDT"),
                direction: Direction::Short,
                quantity: order.quantity,
                entry_price: 100.0,
            }],
        };
        let report = rm.reconcile(&venue, later);
        assert_eq!(report.adopted, vec![Symbol::new("SOLUSDT")]);

        let profile = rm.profile(StrategyKind::Scalp);
        let position = rm.account().position(&Symbol::new("SOLUSDT")).unwrap();
        assert_eq!(position.strategy, StrategyKind::Scalp);
        assert_eq!(position.opened_at, t0());
        assert_relative_eq!(position.stop_price, 100.0 * (1.0 + profile.stop_loss_pct / 100.0), epsilon = 1e-9);
        assert_eq!(position.max_hold_until, profile.max_hold.map(|d| t0() + d));
        assert_eq!(rm.pending_orders().count(), 0);
    }

    #[test]
    fn test_reconciled_add_counts_toward_pyramid_cap() {
        let mut rm = manager();
        open_position(&mut rm, "ETHUSDT", Direction::Long, StrategyKind::Trend);
        let max_adds = rm.profile(StrategyKind::Trend).max_adds;

        for n in 1..=max_adds {
            let held = rm.account().position(&Symbol::new("ETHUSDT")).unwrap().clone();
            let add = Signal::add(&pair("ETHUSDT", 102.0), Direction::Long, 0.05, StrategyKind::Trend);
            let order = rm.approve(&add, 102.0, t0()).unwrap();

            let quantity = held.quantity + order.quantity;
            let entry = (held.entry_price * held.quantity + 102.0 * order.quantity) / quantity;
            let venue = VenueAccount {
                equity: Money::from_f64(10_000.0),
                positions: vec![VenuePosition {
                    symbol: Symbol::new("ETHUSDT"),
                    direction: Direction::Long,
                    quantity,
                    entry_price: entry,
                }],
            };
            rm.reconcile(&venue, t0());

            let position = rm.account().position(&Symbol::new("ETHUSDT")).unwrap();
            assert_eq!(position.adds, n);
            assert_eq!(position.strategy, StrategyKind::Trend);
            assert_relative_eq!(position.stop_price, entry * 0.985, epsilon = 1e-9);
        }

        let add = Signal::add(&pair("ETHUSDT", 102.0), Direction::Long, 0.05, StrategyKind::Trend);
        assert!(matches!(
            rm.approve(&add, 102.0, t0()),
            Err(RiskRejection::PyramidLimit { .. })
        ));
    }
}
