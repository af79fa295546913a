//! Pair Scanner
//!
//! Evaluates every symbol of the universe concurrently: 24h ticker plus
//! recent candles on the scan timeframe, reduced to a `PairMetrics`.
//! Evaluation is side-effect free so symbols fan out onto a `JoinSet`,
//! bounded by a semaphore of `max_workers` permits. Each symbol has its own
//! timeout and the whole fan-in has a cycle budget; symbols still running
//! when the budget runs out are abandoned for the cycle.

use std::cmp::Reverse;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use ordered_float::OrderedFloat;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::config::{Config, ScannerConfig};
use crate::error::EngineError;
use crate::gateway::{with_timeout, ExchangeGateway};
use crate::indicators::pair_indicators;
use crate::{PairMetrics, Symbol};

/// Outcome of evaluating a set of symbols, before volume filtering
#[derive(Debug, Clone, Default)]
pub struct Evaluation {
    pub metrics: Vec<PairMetrics>,
    /// Symbols whose data could not be fetched or was insufficient
    pub unavailable: Vec<Symbol>,
    /// Symbols still running when the cycle budget ran out
    pub abandoned: Vec<Symbol>,
}

/// Ranked candidates of one scan cycle
#[derive(Debug, Clone, Default)]
pub struct ScanReport {
    pub candidates: Vec<PairMetrics>,
    pub evaluated: usize,
    /// Evaluated but below the volume floor
    pub below_volume: usize,
    pub unavailable: Vec<Symbol>,
    pub abandoned: Vec<Symbol>,
}

#[derive(Debug)]
struct ScanParams {
    config: ScannerConfig,
    liquid_volume: f64,
}

pub struct PairScanner {
    gateway: Arc<dyn ExchangeGateway>,
    params: Arc<ScanParams>,
    min_volume: f64,
    universe: Vec<Symbol>,
    request_timeout: Duration,
}

impl PairScanner {
    pub fn new(gateway: Arc<dyn ExchangeGateway>, config: &Config) -> Self {
        Self {
            gateway,
            params: Arc::new(ScanParams {
                config: config.scanner.clone(),
                liquid_volume: config.trading.liquid_volume,
            }),
            min_volume: config.trading.min_volume,
            universe: config.trading.symbols(),
            request_timeout: config.request_timeout(),
        }
    }

    pub fn min_volume(&self) -> f64 {
        self.min_volume
    }

    /// Configured universe, or every symbol the gateway lists when none is configured
    pub async fn universe(&self) -> Result<Vec<Symbol>, EngineError> {
        if !self.universe.is_empty() {
            return Ok(self.universe.clone());
        }
        let mut symbols = with_timeout(self.request_timeout, self.gateway.list_symbols())
            .await
            .map_err(EngineError::venue_unavailable)?;
        symbols.sort();
        symbols.dedup();
        Ok(symbols)
    }

    /// Evaluate, filter by volume and rank
    pub async fn scan(&self, universe: &[Symbol]) -> ScanReport {
        let evaluation = self.evaluate(universe).await;
        let evaluated = evaluation.metrics.len();
        let candidates = filter_and_rank(evaluation.metrics, self.min_volume);

        let report = ScanReport {
            below_volume: evaluated - candidates.len(),
            candidates,
            evaluated,
            unavailable: evaluation.unavailable,
            abandoned: evaluation.abandoned,
        };

        info!(
            universe = universe.len(),
            evaluated = report.evaluated,
            candidates = report.candidates.len(),
            below_volume = report.below_volume,
            unavailable = report.unavailable.len(),
            abandoned = report.abandoned.len(),
            "Scan complete"
        );
        report
    }

    /// Concurrent, unfiltered evaluation of `symbols`
    pub async fn evaluate(&self, symbols: &[Symbol]) -> Evaluation {
        let config = &self.params.config;
        let semaphore = Arc::new(Semaphore::new(config.max_workers.max(1)));
        let deadline = tokio::time::Instant::now() + config.cycle_budget();
        let mut tasks = JoinSet::new();

        for symbol in symbols {
            let gateway = Arc::clone(&self.gateway);
            let semaphore = Arc::clone(&semaphore);
            let params = Arc::clone(&self.params);
            let symbol = symbol.clone();

            tasks.spawn(async move {
                let result = match semaphore.acquire_owned().await {
                    Ok(_permit) => {
                        let timeout = params.config.symbol_timeout();
                        match tokio::time::timeout(timeout, evaluate_symbol(gateway.as_ref(), &symbol, &params)).await {
                            Ok(result) => result,
                            Err(_) => Err(EngineError::data_unavailable(&symbol, format!("timed out after {:?}", timeout))),
                        }
                    }
                    Err(_) => Err(EngineError::data_unavailable(&symbol, "worker pool closed")),
                };
                (symbol, result)
            });
        }

        let mut outstanding: BTreeSet<Symbol> = symbols.iter().cloned().collect();
        let mut evaluation = Evaluation::default();

        loop {
            match tokio::time::timeout_at(deadline, tasks.join_next()).await {
                Ok(Some(Ok((symbol, result)))) => {
                    outstanding.remove(&symbol);
                    match result {
                        Ok(metrics) => evaluation.metrics.push(metrics),
                        Err(e) => {
                            debug!("Skipping {}: {}", symbol, e);
                            evaluation.unavailable.push(symbol);
                        }
                    }
                }
                Ok(Some(Err(e))) => warn!("Scan task failed: {}", e),
                Ok(None) => break,
                Err(_) => {
                    warn!(
                        "Scan budget of {:?} exhausted, abandoning {} symbols",
                        config.cycle_budget(),
                        outstanding.len()
                    );
                    tasks.abort_all();
                    break;
                }
            }
        }

        evaluation.unavailable.sort();
        evaluation.abandoned = outstanding.into_iter().collect();
        evaluation
    }
}

async fn evaluate_symbol(
    gateway: &dyn ExchangeGateway,
    symbol: &Symbol,
    params: &ScanParams,
) -> Result<PairMetrics, EngineError> {
    let config = &params.config;
    let (ticker, candles) = tokio::join!(
        gateway.fetch_ticker(symbol),
        gateway.fetch_candles(symbol, &config.timeframe, config.lookback),
    );
    let ticker = ticker.map_err(|e| EngineError::data_unavailable(symbol, e))?;
    let candles = candles.map_err(|e| EngineError::data_unavailable(symbol, e))?;

    if !(ticker.last_price.is_finite() && ticker.last_price > 0.0) {
        return Err(EngineError::data_unavailable(symbol, "no last price"));
    }

    let indicators = pair_indicators(&candles, config).ok_or_else(|| {
        EngineError::data_unavailable(symbol, format!("insufficient candles ({})", candles.len()))
    })?;

    Ok(PairMetrics {
        symbol: symbol.clone(),
        quote_volume_24h: ticker.quote_volume,
        volatility: indicators.atr_pct,
        liquid: ticker.quote_volume >= params.liquid_volume,
        price: ticker.last_price,
        indicators,
        timestamp: ticker.timestamp,
    })
}

/// Keep pairs at or above `min_volume`, highest volume first, ties by symbol
pub fn filter_and_rank(metrics: Vec<PairMetrics>, min_volume: f64) -> Vec<PairMetrics> {
    let mut kept: Vec<PairMetrics> = metrics
        .into_iter()
        .filter(|m| m.quote_volume_24h >= min_volume)
        .collect();
    kept.sort_by(|a, b| {
        Reverse(OrderedFloat(a.quote_volume_24h))
            .cmp(&Reverse(OrderedFloat(b.quote_volume_24h)))
            .then_with(|| a.symbol.cmp(&b.symbol))
    });
    kept
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GatewayError;
    use crate::gateway::{OrderAck, OrderRequest, Ticker24h, VenueAccount};
    use crate::strategies::test_support::{now, pair};
    use crate::{Candle, Money, PairIndicators};
    use async_trait::async_trait;
    use chrono::{DateTime, Duration as ChronoDuration, Utc};
    use itertools::Itertools;
    use std::collections::HashMap;

    #[derive(Default)]
    struct MockGateway {
        volumes: HashMap<Symbol, f64>,
        delays: HashMap<Symbol, Duration>,
        listed: Vec<Symbol>,
    }

    impl MockGateway {
        fn with(mut self, symbol: &str, volume: f64) -> Self {
            self.volumes.insert(Symbol::new(symbol), volume);
            self
        }

        fn slow(mut self, symbol: &str, delay: Duration) -> Self {
            self.delays.insert(Symbol::new(symbol), delay);
            self
        }
    }

    fn candles(count: usize) -> Vec<Candle> {
        (0..count)
            .map(|i| {
                let close = 100.0 + (i as f64 * 0.3).sin() * 2.0 + i as f64 * 0.05;
                Candle::new_unchecked(
                    now() - ChronoDuration::minutes(5 * (count - i) as i64),
                    close - 0.1,
                    close + 0.5,
                    close - 0.5,
                    close,
                    1_000.0,
                )
            })
            .collect()
    }

    #[async_trait]
    impl ExchangeGateway for MockGateway {
        async fn server_time(&self) -> Result<DateTime<Utc>, GatewayError> {
            Ok(now())
        }
        async fn list_symbols(&self) -> Result<Vec<Symbol>, GatewayError> {
            Ok(self.listed.clone())
        }
        async fn fetch_candles(&self, _: &Symbol, _: &str, limit: usize) -> Result<Vec<Candle>, GatewayError> {
            Ok(candles(limit))
        }
        async fn fetch_ticker(&self, symbol: &Symbol) -> Result<Ticker24h, GatewayError> {
            if let Some(delay) = self.delays.get(symbol) {
                tokio::time::sleep(*delay).await;
            }
            let volume = self
                .volumes
                .get(symbol)
                .ok_or_else(|| GatewayError::UnknownSymbol(symbol.clone()))?;
            Ok(Ticker24h {
                symbol: symbol.clone(),
                last_price: 100.0,
                quote_volume: *volume,
                timestamp: now(),
            })
        }
        async fn fetch_account(&self) -> Result<VenueAccount, GatewayError> {
            Ok(VenueAccount {
                equity: Money::ZERO,
                positions: vec![],
            })
        }
        async fn submit_order(&self, _: &OrderRequest) -> Result<OrderAck, GatewayError> {
            Err(GatewayError::Unavailable("read-only".into()))
        }
        async fn order_status(&self, _: &Symbol, id: &str) -> Result<OrderAck, GatewayError> {
            Err(GatewayError::UnknownOrder(id.to_string()))
        }
        fn name(&self) -> &'static str {
            "mock"
        }
    }

    fn scanner(gateway: MockGateway, tweak: impl FnOnce(&mut Config)) -> PairScanner {
        let mut config = Config::default();
        tweak(&mut config);
        PairScanner::new(Arc::new(gateway), &config)
    }

    fn symbols(names: &[&str]) -> Vec<Symbol> {
        names.iter().map(Symbol::new).collect()
    }

    fn with_volume(symbol: &str, volume: f64) -> PairMetrics {
        PairMetrics {
            quote_volume_24h: volume,
            ..pair(symbol, 100.0, PairIndicators::default())
        }
    }

    #[test]
    fn test_volume_floor_is_inclusive() {
        let volumes = [0.0, 1.0, 49_999_999.99, 50_000_000.0, 50_000_000.01, 80_000_000.0, 2e9];
        for (i, volume) in volumes.iter().enumerate() {
            let ranked = filter_and_rank(vec![with_volume(&format!("P{}USDT", i), *volume)], 50_000_000.0);
            assert_eq!(ranked.len() == 1, *volume >= 50_000_000.0, "volume {}", volume);
        }
    }

    #[test]
    fn test_rank_is_descending_with_name_tiebreak_for_any_input_order() {
        let base = vec![
            with_volume("SOLUSDT", 90e6),
            with_volume("ADAUSDT", 90e6),
            with_volume("BTCUSDT", 900e6),
            with_volume("DOGEUSDT", 10e6),
            with_volume("ETHUSDT", 400e6),
        ];
        for order in base.iter().cloned().permutations(base.len()) {
            let names: Vec<String> = filter_and_rank(order, 50e6)
                .iter()
                .map(|m| m.symbol.to_string())
                .collect();
            assert_eq!(names, vec!["BTCUSDT", "ETHUSDT", "ADAUSDT", "SOLUSDT"]);
        }
    }

    #[tokio::test]
    async fn test_scan_filters_and_flags_liquidity() {
        let gateway = MockGateway::default()
            .with("BTCUSDT", 900e6)
            .with("XRPUSDT", 80e6)
            .with("PEPEUSDT", 20e6);
        let scanner = scanner(gateway, |_| {});

        let report = scanner.scan(&symbols(&["BTCUSDT", "XRPUSDT", "PEPEUSDT", "MISSINGUSDT"])).await;

        let names: Vec<&str> = report.candidates.iter().map(|m| m.symbol.as_str()).collect();
        assert_eq!(names, vec!["BTCUSDT", "XRPUSDT"]);
        assert!(report.candidates[0].liquid);
        assert!(!report.candidates[1].liquid);
        assert_eq!(report.below_volume, 1);
        assert_eq!(report.unavailable, symbols(&["MISSINGUSDT"]));
        assert!(report.candidates.iter().all(|m| m.volatility > 0.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_symbol_times_out_without_blocking_others() {
        let gateway = MockGateway::default()
            .with("BTCUSDT", 900e6)
            .with("ETHUSDT", 400e6)
            .slow("ETHUSDT", Duration::from_secs(60));
        let scanner = scanner(gateway, |c| c.scanner.symbol_timeout_ms = 2_000);

        let evaluation = scanner.evaluate(&symbols(&["BTCUSDT", "ETHUSDT"])).await;
        assert_eq!(evaluation.metrics.len(), 1);
        assert_eq!(evaluation.unavailable, symbols(&["ETHUSDT"]));
        assert!(evaluation.abandoned.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cycle_budget_abandons_laggards() {
        let gateway = MockGateway::default()
            .with("BTCUSDT", 900e6)
            .with("ETHUSDT", 400e6)
            .slow("ETHUSDT", Duration::from_secs(60));
        let scanner = scanner(gateway, |c| {
            c.scanner.symbol_timeout_ms = 120_000;
            c.scanner.cycle_budget_ms = 1_000;
        });

        let report = scanner.scan(&symbols(&["BTCUSDT", "ETHUSDT"])).await;
        assert_eq!(report.candidates.len(), 1);
        assert_eq!(report.abandoned, symbols(&["ETHUSDT"]));
    }

    #[tokio::test]
    async fn test_worker_pool_smaller_than_universe() {
        let names: Vec<String> = (0..40).map(|i| format!("C{:02}USDT", i)).collect();
        let gateway = names
            .iter()
            .fold(MockGateway::default(), |g, n| g.with(n, 60e6));
        let scanner = scanner(gateway, |c| c.scanner.max_workers = 4);

        let universe: Vec<Symbol> = names.iter().map(Symbol::new).collect();
        let report = scanner.scan(&universe).await;
        assert_eq!(report.candidates.len(), 40);
        assert_eq!(report.candidates[0].symbol.as_str(), "C00USDT");
    }

    #[tokio::test]
    async fn test_empty_universe_falls_back_to_listing() {
        let mut gateway = MockGateway::default();
        gateway.listed = symbols(&["SOLUSDT", "BTCUSDT", "SOLUSDT"]);
        let scanner = scanner(gateway, |c| c.trading.universe.clear());
        assert_eq!(scanner.universe().await.unwrap(), symbols(&["BTCUSDT", "SOLUSDT"]));
    }
}
