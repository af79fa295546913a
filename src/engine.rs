//! Trading Engine
//!
//! Owns the control loop. Regime classification runs on its own timer and
//! feeds the dispatcher; every scan cycle then runs, in order:
//!
//! 1. venue time, reconciliation when a previous order ended ambiguous
//! 2. daily roll-over / circuit breaker expiry
//! 3. exit checks for open positions (stop, trailing, target, max hold)
//! 4. concurrent pair scan
//! 5. dispatch, approval, execution and fill confirmation
//! 6. checkpoint and status report

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::dispatcher::StrategyDispatcher;
use crate::error::EngineError;
use crate::executor::OrderExecutor;
use crate::gateway::{with_timeout, ExchangeGateway};
use crate::indicators::regime_snapshot;
use crate::regime::{RegimeClassifier, RegimeTracker, RegimeTransition};
use crate::risk::{
    ApprovedOrder, DailyReport, FillOutcome, ReconcileReport, RiskManager, RiskManagerConfig,
    SharedRiskManager,
};
use crate::scanner::PairScanner;
use crate::state_manager::{Checkpoint, SignalDecision, SignalRecord, SqliteStateManager};
use crate::strategies::StrategySet;
use crate::{PairMetrics, Regime, Signal, Symbol};

/// Summary of one scan cycle
#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub cycle: u64,
    pub at: DateTime<Utc>,
    pub regime: Option<Regime>,
    pub candidates: usize,
    /// Actionable signals (holds excluded)
    pub signals: usize,
    pub approved: usize,
    pub rejected: usize,
    pub filled: usize,
    pub order_failures: usize,
    pub exits: usize,
    /// Set when trading was skipped for the cycle
    pub skipped: Option<String>,
    pub daily: DailyReport,
}

#[derive(Debug, Default)]
struct CycleTally {
    candidates: usize,
    signals: usize,
    approved: usize,
    rejected: usize,
    filled: usize,
    order_failures: usize,
    exits: usize,
}

pub struct TradingEngine {
    config: Config,
    gateway: Arc<dyn ExchangeGateway>,
    scanner: PairScanner,
    regime: RegimeTracker,
    dispatcher: StrategyDispatcher,
    risk: SharedRiskManager,
    risk_config: RiskManagerConfig,
    executor: OrderExecutor,
    state: Option<SqliteStateManager>,
    needs_reconcile: bool,
    cycle: u64,
}

impl TradingEngine {
    pub fn new(config: Config, gateway: Arc<dyn ExchangeGateway>) -> Self {
        let strategies = StrategySet::new(&config.strategies);
        let risk_config = RiskManagerConfig::from_trading(&config.trading, config.exchange.taker_fee)
            .with_profiles(strategies.risk_profiles(config.trading.stop_loss_pct));
        let risk = risk_config.clone().build(Utc::now()).into_shared();

        Self {
            scanner: PairScanner::new(Arc::clone(&gateway), &config),
            regime: RegimeTracker::new(RegimeClassifier::new(&config.regime)),
            dispatcher: StrategyDispatcher::new(strategies),
            executor: OrderExecutor::new(Arc::clone(&gateway), &config.exchange),
            risk,
            risk_config,
            state: None,
            needs_reconcile: false,
            cycle: 0,
            gateway,
            config,
        }
    }

    pub fn with_state(mut self, state: SqliteStateManager) -> Self {
        self.state = Some(state);
        self
    }

    pub fn with_executor(mut self, executor: OrderExecutor) -> Self {
        self.executor = executor;
        self
    }

    pub fn risk(&self) -> SharedRiskManager {
        Arc::clone(&self.risk)
    }

    pub fn regime(&self) -> Option<Regime> {
        self.regime.current()
    }

    pub fn dispatcher(&self) -> &StrategyDispatcher {
        &self.dispatcher
    }

    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    pub fn needs_reconcile(&self) -> bool {
        self.needs_reconcile
    }

    async fn now(&self) -> Result<DateTime<Utc>, EngineError> {
        with_timeout(self.config.request_timeout(), self.gateway.server_time())
            .await
            .map_err(EngineError::venue_unavailable)
    }

    // =========================================================================
    // Startup
    // =========================================================================

    /// Restore the latest checkpoint, then (live only) adopt venue state
    pub async fn recover(&mut self) -> Result<(), EngineError> {
        let now = self.now().await?;

        let checkpoint = match &self.state {
            Some(state) => state.load_checkpoint().map_err(EngineError::State)?,
            None => None,
        };

        match checkpoint {
            Some(ckpt) => {
                info!(
                    "Restoring checkpoint from cycle {} ({} open positions)",
                    ckpt.cycle,
                    ckpt.account.open_count()
                );
                *self.risk.lock().await = RiskManager::with_account(self.risk_config.clone(), ckpt.account);
                self.regime = RegimeTracker::with_initial(RegimeClassifier::new(&self.config.regime), ckpt.regime);
                if let Some(regime) = ckpt.regime {
                    self.dispatcher.on_regime(regime, now);
                }
                self.cycle = ckpt.cycle;
            }
            None => {
                *self.risk.lock().await = self.risk_config.clone().build(now);
            }
        }

        if !self.executor.is_dry_run() {
            // Venue state wins over the checkpoint
            self.needs_reconcile = true;
            match self.reconcile(now).await {
                Ok(_) => self.needs_reconcile = false,
                Err(e) => warn!("Startup reconciliation failed, will retry next cycle: {}", e),
            }
        }

        Ok(())
    }

    async fn reconcile(&self, now: DateTime<Utc>) -> Result<ReconcileReport, EngineError> {
        let venue = with_timeout(self.config.request_timeout(), self.gateway.fetch_account())
            .await
            .map_err(EngineError::venue_unavailable)?;
        Ok(self.risk.lock().await.reconcile(&venue, now))
    }

    // =========================================================================
    // Regime
    // =========================================================================

    /// Classify the reference asset. On failure the previous regime is kept.
    pub async fn classify_regime(&mut self) -> Result<Option<RegimeTransition>, EngineError> {
        let config = &self.config.regime;
        let symbol = Symbol::new(&config.reference_symbol);

        let candles = with_timeout(
            self.config.request_timeout(),
            self.gateway.fetch_candles(&symbol, &config.timeframe, config.lookback),
        )
        .await
        .map_err(|e| EngineError::data_unavailable(&symbol, e))?;

        let snapshot = regime_snapshot(&symbol, &candles, config).ok_or_else(|| {
            EngineError::data_unavailable(&symbol, format!("insufficient candles ({})", candles.len()))
        })?;

        debug!(
            "Regime inputs: price={:.2} ema={:.2} adx={:.1} volume_cv={:.2} displacement={:.2}%",
            snapshot.price, snapshot.ema200, snapshot.adx, snapshot.volume_cv, snapshot.net_displacement_pct
        );

        let transition = self.regime.update(&snapshot);
        if let Some(t) = &transition {
            self.dispatcher.on_transition(t);
        }
        Ok(transition)
    }

    // =========================================================================
    // Cycle
    // =========================================================================

    pub async fn run_cycle(&mut self) -> Result<CycleReport, EngineError> {
        let now = self.now().await?;
        self.cycle += 1;
        let mut tally = CycleTally::default();

        if self.needs_reconcile {
            match self.reconcile(now).await {
                Ok(_) => self.needs_reconcile = false,
                Err(e) => {
                    warn!("Reconciliation failed, skipping trading this cycle: {}", e);
                    return Ok(self.finish(now, tally, Some(format!("reconciliation failed: {}", e))).await);
                }
            }
        }

        self.risk.lock().await.refresh(now);

        self.process_exits(now, &mut tally).await;

        if self.needs_reconcile {
            return Ok(self.finish(now, tally, Some("ambiguous exit order".to_string())).await);
        }

        let regime = match self.dispatcher.regime() {
            Some(regime) => regime,
            None => {
                return Ok(self.finish(now, tally, Some("no regime classified yet".to_string())).await);
            }
        };

        let universe = match self.scanner.universe().await {
            Ok(universe) => universe,
            Err(e) => {
                warn!("Universe unavailable: {}", e);
                return Ok(self.finish(now, tally, Some(e.to_string())).await);
            }
        };

        let scan = self.scanner.scan(&universe).await;
        tally.candidates = scan.candidates.len();
        let pairs = self.with_held_pairs(scan.candidates).await;

        let snapshot = self.risk.lock().await.snapshot();
        let signals: Vec<Signal> = self
            .dispatcher
            .dispatch_all(&pairs, &snapshot)
            .into_iter()
            .filter(Signal::is_actionable)
            .collect();
        tally.signals = signals.len();

        debug!("Regime {}: {} actionable signals from {} pairs", regime, signals.len(), pairs.len());

        for signal in &signals {
            let approval = self.risk.lock().await.approve(signal, signal.price, now);
            match approval {
                Ok(order) => {
                    tally.approved += 1;
                    let decision = self.execute(order, now, &mut tally).await;
                    self.journal(signal, decision.0, decision.1, now);
                    if self.needs_reconcile {
                        warn!("Order outcome unknown, halting signal processing until reconciled");
                        break;
                    }
                }
                Err(rejection) => {
                    tally.rejected += 1;
                    info!(
                        symbol = %signal.symbol,
                        strategy = %signal.source,
                        intent = %signal.intent,
                        "Signal rejected: {}",
                        rejection
                    );
                    self.journal(signal, SignalDecision::Rejected, Some(rejection.to_string()), now);
                }
            }
        }

        Ok(self.finish(now, tally, None).await)
    }

    /// Candidates plus fresh metrics for held symbols that fell out of the scan
    async fn with_held_pairs(&self, mut pairs: Vec<PairMetrics>) -> Vec<PairMetrics> {
        let listed: BTreeSet<Symbol> = pairs.iter().map(|p| p.symbol.clone()).collect();
        let missing: Vec<Symbol> = self
            .risk
            .lock()
            .await
            .account()
            .open_positions
            .keys()
            .filter(|s| !listed.contains(*s))
            .cloned()
            .collect();

        if !missing.is_empty() {
            let evaluation = self.scanner.evaluate(&missing).await;
            pairs.extend(evaluation.metrics);
        }
        pairs
    }

    async fn process_exits(&mut self, now: DateTime<Utc>, tally: &mut CycleTally) {
        let held: Vec<Symbol> = self.risk.lock().await.account().open_positions.keys().cloned().collect();
        if held.is_empty() {
            return;
        }

        let prices = self.fetch_prices(&held).await;

        for (symbol, price) in prices {
            let order = {
                let mut risk = self.risk.lock().await;
                match risk.check_exit(&symbol, price, now) {
                    Some(reason) => risk.exit_order(&symbol, price, reason, now),
                    None => continue,
                }
            };

            match order {
                Ok(order) => {
                    info!(
                        symbol = %symbol,
                        price,
                        reason = ?order.exit_reason,
                        "Exit triggered"
                    );
                    tally.exits += 1;
                    self.execute(order, now, tally).await;
                    if self.needs_reconcile {
                        return;
                    }
                }
                Err(e) => debug!("Exit for {} deferred: {}", symbol, e),
            }
        }
    }

    /// Last prices for `symbols`, fetched concurrently. Failures are skipped.
    async fn fetch_prices(&self, symbols: &[Symbol]) -> BTreeMap<Symbol, f64> {
        let timeout = self.config.request_timeout();
        let mut tasks = JoinSet::new();
        for symbol in symbols {
            let gateway = Arc::clone(&self.gateway);
            let symbol = symbol.clone();
            tasks.spawn(async move {
                let ticker = with_timeout(timeout, gateway.fetch_ticker(&symbol)).await;
                (symbol, ticker)
            });
        }

        let mut prices = BTreeMap::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((symbol, Ok(ticker))) if ticker.last_price > 0.0 => {
                    prices.insert(symbol, ticker.last_price);
                }
                Ok((symbol, Ok(_))) => debug!("No price for {}", symbol),
                Ok((symbol, Err(e))) => warn!("Price unavailable for {}: {}", symbol, e),
                Err(e) => warn!("Price task failed: {}", e),
            }
        }
        prices
    }

    /// Submit an approved order and settle the reservation
    async fn execute(
        &mut self,
        order: ApprovedOrder,
        now: DateTime<Utc>,
        tally: &mut CycleTally,
    ) -> (SignalDecision, Option<String>) {
        match self.executor.execute(&order, now).await {
            Ok(fill) => {
                tally.filled += 1;
                let outcome = self.risk.lock().await.confirm_fill(&fill);
                if let (Some(FillOutcome::Closed(trade)), Some(state)) = (&outcome, &self.state) {
                    if let Err(e) = state.record_trade(trade) {
                        warn!("Failed to record trade: {}", e);
                    }
                }
                (SignalDecision::Filled, None)
            }
            Err(e @ EngineError::AmbiguousFill { .. }) => {
                tally.order_failures += 1;
                error!("{}", e);
                self.needs_reconcile = true;
                (SignalDecision::Ambiguous, Some(e.to_string()))
            }
            Err(e) => {
                tally.order_failures += 1;
                self.risk.lock().await.cancel(&order.symbol);
                (SignalDecision::OrderRejected, Some(e.to_string()))
            }
        }
    }

    fn journal(&self, signal: &Signal, decision: SignalDecision, reason: Option<String>, now: DateTime<Utc>) {
        if let Some(state) = &self.state {
            let record = SignalRecord::new(signal, decision, reason, now);
            if let Err(e) = state.record_signal(&record) {
                warn!("Failed to journal signal: {}", e);
            }
        }
    }

    async fn finish(&self, now: DateTime<Utc>, tally: CycleTally, skipped: Option<String>) -> CycleReport {
        let (daily, account) = {
            let risk = self.risk.lock().await;
            (risk.daily_report(), risk.snapshot())
        };

        if let Some(state) = &self.state {
            let checkpoint = Checkpoint {
                cycle: self.cycle,
                timestamp: now,
                regime: self.regime.current(),
                account,
                dry_run: self.executor.is_dry_run(),
            };
            if let Err(e) = state.save_checkpoint(&checkpoint) {
                warn!("Failed to save checkpoint: {}", e);
            }
        }

        let report = CycleReport {
            cycle: self.cycle,
            at: now,
            regime: self.regime.current(),
            candidates: tally.candidates,
            signals: tally.signals,
            approved: tally.approved,
            rejected: tally.rejected,
            filled: tally.filled,
            order_failures: tally.order_failures,
            exits: tally.exits,
            skipped,
            daily,
        };
        log_status(&report);
        report
    }

    // =========================================================================
    // Main loop
    // =========================================================================

    /// Run until `shutdown` fires. Only fatal errors end the loop early.
    pub async fn run(&mut self, mut shutdown: mpsc::Receiver<()>) -> Result<(), EngineError> {
        if let Err(e) = self.classify_regime().await {
            warn!("Initial regime classification failed: {}", e);
        }

        let regime_period = Duration::from_secs(self.config.regime.interval_secs.max(1));
        let mut regime_timer = tokio::time::interval_at(tokio::time::Instant::now() + regime_period, regime_period);
        regime_timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut scan_timer = tokio::time::interval(Duration::from_secs(self.config.scanner.interval_secs.max(1)));
        scan_timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;

                _ = shutdown.recv() => {
                    info!("Shutdown signal received");
                    break;
                }
                _ = regime_timer.tick() => {
                    if let Err(e) = self.classify_regime().await {
                        warn!("Regime classification failed, keeping {:?}: {}", self.regime.current(), e);
                    }
                }
                _ = scan_timer.tick() => {
                    if let Err(e) = self.run_cycle().await {
                        error!("Trading cycle error: {}", e);
                        if e.is_fatal() {
                            return Err(e);
                        }
                    }
                }
            }
        }

        self.shutdown().await;
        Ok(())
    }

    pub async fn shutdown(&self) {
        let account = self.risk.lock().await.snapshot();
        if let Some(state) = &self.state {
            let checkpoint = Checkpoint {
                cycle: self.cycle,
                timestamp: Utc::now(),
                regime: self.regime.current(),
                account: account.clone(),
                dry_run: self.executor.is_dry_run(),
            };
            if let Err(e) = state.save_checkpoint(&checkpoint) {
                error!("Failed to save final checkpoint: {}", e);
            }
        }
        info!(
            "Engine stopped after {} cycles | Equity: {} | Open positions: {}",
            self.cycle,
            account.equity,
            account.open_count()
        );
    }
}

fn log_status(report: &CycleReport) {
    let regime = report
        .regime
        .map(|r| r.to_string())
        .unwrap_or_else(|| "UNKNOWN".to_string());

    info!(
        "Cycle {} | Regime: {} | Equity: {} | Daily P&L: {:+.2}% | Open: {} | Signals: {} approved / {} rejected | Exits: {}",
        report.cycle,
        regime,
        report.daily.equity,
        report.daily.daily_pnl_pct,
        report.daily.open_positions,
        report.approved,
        report.rejected,
        report.exits
    );

    if report.daily.target_reached {
        info!(
            "Daily profit target reached: {:+.2}% (target {:.2}%)",
            report.daily.daily_pnl_pct, report.daily.target_pct
        );
    }
    if let Some(until) = report.daily.circuit_breaker_until {
        warn!("Circuit breaker active until {}", until);
    }
    if let Some(reason) = &report.skipped {
        info!("Trading skipped: {}", reason);
    }
}
