//! Replay venue
//!
//! Simulated exchange backed by historical candles. The clock is either
//! stepped explicitly (`advance`) or follows wall time scaled by a speed
//! factor. Market orders fill at the latest visible close; positions and
//! wallet balance are tracked per symbol.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Instant;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use super::{
    ExchangeGateway, OrderAck, OrderRequest, OrderState, Ticker24h, VenueAccount, VenuePosition,
};
use crate::data::{self, interval_duration};
use crate::error::GatewayError;
use crate::{Candle, Direction, Money, OrderSide, Symbol};

#[derive(Debug)]
enum ReplayClock {
    Stepped {
        now: DateTime<Utc>,
    },
    Scaled {
        sim_start: DateTime<Utc>,
        wall_start: Instant,
        speed: f64,
    },
}

impl ReplayClock {
    fn now(&self) -> DateTime<Utc> {
        match self {
            ReplayClock::Stepped { now } => *now,
            ReplayClock::Scaled {
                sim_start,
                wall_start,
                speed,
            } => {
                let elapsed = wall_start.elapsed().mul_f64(speed.max(0.0));
                *sim_start + Duration::from_std(elapsed).unwrap_or_else(|_| Duration::zero())
            }
        }
    }

    fn advance(&mut self, step: Duration) {
        match self {
            ReplayClock::Stepped { now } => *now += step,
            ReplayClock::Scaled { sim_start, .. } => *sim_start += step,
        }
    }
}

/// Signed position held at the venue
#[derive(Debug, Clone, Copy)]
struct Holding {
    /// Positive long, negative short
    quantity: f64,
    entry_price: f64,
}

#[derive(Debug, Default)]
struct VenueBook {
    balance: Money,
    holdings: BTreeMap<Symbol, Holding>,
    orders: HashMap<String, OrderAck>,
    seq: u64,
}

/// Candle-driven simulated venue
pub struct ReplayGateway {
    /// symbol -> interval -> candles, oldest first
    series: BTreeMap<Symbol, BTreeMap<String, Vec<Candle>>>,
    clock: Mutex<ReplayClock>,
    book: Mutex<VenueBook>,
    taker_fee: f64,
}

impl ReplayGateway {
    pub fn new(starting_balance: Money, start: DateTime<Utc>) -> Self {
        Self {
            series: BTreeMap::new(),
            clock: Mutex::new(ReplayClock::Stepped { now: start }),
            book: Mutex::new(VenueBook {
                balance: starting_balance,
                ..Default::default()
            }),
            taker_fee: 0.0,
        }
    }

    /// Load `{SYMBOL}_{interval}.csv` files for every symbol and interval
    pub fn from_data_dir(
        data_dir: impl AsRef<Path>,
        symbols: &[Symbol],
        intervals: &[&str],
        starting_balance: Money,
    ) -> Result<Self> {
        let mut gateway = Self::new(starting_balance, DateTime::<Utc>::UNIX_EPOCH);
        for interval in intervals {
            for (symbol, candles) in data::load_symbols(&data_dir, symbols, interval)? {
                gateway = gateway.with_series(symbol, interval, candles);
            }
        }
        if let Some((start, _)) = gateway.time_range() {
            gateway.set_time(start);
        }
        Ok(gateway)
    }

    pub fn with_series(mut self, symbol: Symbol, interval: &str, mut candles: Vec<Candle>) -> Self {
        candles.sort_by_key(|c| c.datetime);
        self.series
            .entry(symbol)
            .or_default()
            .insert(interval.to_string(), candles);
        self
    }

    pub fn with_taker_fee(mut self, fee: f64) -> Self {
        self.taker_fee = fee;
        self
    }

    /// Follow wall time from the current simulated instant, `speed` times faster
    pub fn with_realtime(self, speed: f64) -> Self {
        let now = self.now();
        if let Ok(mut clock) = self.clock.lock() {
            *clock = ReplayClock::Scaled {
                sim_start: now,
                wall_start: Instant::now(),
                speed,
            };
        }
        self
    }

    pub fn now(&self) -> DateTime<Utc> {
        match self.clock.lock() {
            Ok(clock) => clock.now(),
            Err(poisoned) => poisoned.into_inner().now(),
        }
    }

    pub fn advance(&self, step: Duration) {
        match self.clock.lock() {
            Ok(mut clock) => clock.advance(step),
            Err(poisoned) => poisoned.into_inner().advance(step),
        }
    }

    /// Jump the clock; switches to stepped mode
    pub fn set_time(&self, at: DateTime<Utc>) {
        match self.clock.lock() {
            Ok(mut clock) => *clock = ReplayClock::Stepped { now: at },
            Err(poisoned) => *poisoned.into_inner() = ReplayClock::Stepped { now: at },
        }
    }

    /// Earliest and latest candle time across all series
    pub fn time_range(&self) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        let times = self
            .series
            .values()
            .flat_map(|by_interval| by_interval.values())
            .flat_map(|candles| candles.first().zip(candles.last()))
            .map(|(first, last)| (first.datetime, last.datetime));

        times.fold(None, |acc, (lo, hi)| match acc {
            None => Some((lo, hi)),
            Some((a, b)) => Some((a.min(lo), b.max(hi))),
        })
    }

    fn book(&self) -> Result<MutexGuard<'_, VenueBook>, GatewayError> {
        self.book
            .lock()
            .map_err(|_| GatewayError::Unavailable("replay book lock poisoned".to_string()))
    }

    /// Finest-grained series available for a symbol
    fn finest(&self, symbol: &Symbol) -> Result<&[Candle], GatewayError> {
        let by_interval = self
            .series
            .get(symbol)
            .ok_or_else(|| GatewayError::UnknownSymbol(symbol.clone()))?;

        by_interval
            .iter()
            .min_by_key(|(interval, _)| interval_duration(interval).unwrap_or(Duration::MAX))
            .map(|(_, candles)| candles.as_slice())
            .ok_or_else(|| GatewayError::UnknownSymbol(symbol.clone()))
    }

    fn visible(candles: &[Candle], now: DateTime<Utc>) -> &[Candle] {
        let end = candles.partition_point(|c| c.datetime <= now);
        &candles[..end]
    }

    fn last_price(&self, symbol: &Symbol, now: DateTime<Utc>) -> Result<f64, GatewayError> {
        Self::visible(self.finest(symbol)?, now)
            .last()
            .map(|c| c.close)
            .ok_or_else(|| GatewayError::Unavailable(format!("no data for {} at {}", symbol, now)))
    }

    /// Apply a fill to the signed holding; returns realized P&L
    fn apply_fill(book: &mut VenueBook, symbol: &Symbol, signed_qty: f64, price: f64) -> f64 {
        let existing = book.holdings.get(symbol).copied();
        let (holding, realized) = match existing {
            None => (
                Holding {
                    quantity: signed_qty,
                    entry_price: price,
                },
                0.0,
            ),
            Some(h) if h.quantity.signum() == signed_qty.signum() => {
                let total = h.quantity + signed_qty;
                let entry = (h.entry_price * h.quantity.abs() + price * signed_qty.abs()) / total.abs();
                (
                    Holding {
                        quantity: total,
                        entry_price: entry,
                    },
                    0.0,
                )
            }
            Some(h) => {
                let closed = h.quantity.abs().min(signed_qty.abs());
                let realized = (price - h.entry_price) * closed * h.quantity.signum();
                let remaining = h.quantity + signed_qty;
                let entry = if remaining.signum() == h.quantity.signum() {
                    h.entry_price
                } else {
                    price
                };
                (
                    Holding {
                        quantity: remaining,
                        entry_price: entry,
                    },
                    realized,
                )
            }
        };

        if holding.quantity.abs() < 1e-12 {
            book.holdings.remove(symbol);
        } else {
            book.holdings.insert(symbol.clone(), holding);
        }
        realized
    }
}

#[async_trait]
impl ExchangeGateway for ReplayGateway {
    async fn server_time(&self) -> Result<DateTime<Utc>, GatewayError> {
        Ok(self.now())
    }

    async fn list_symbols(&self) -> Result<Vec<Symbol>, GatewayError> {
        Ok(self.series.keys().cloned().collect())
    }

    async fn fetch_candles(
        &self,
        symbol: &Symbol,
        interval: &str,
        limit: usize,
    ) -> Result<Vec<Candle>, GatewayError> {
        let candles = self
            .series
            .get(symbol)
            .and_then(|by_interval| by_interval.get(interval))
            .ok_or_else(|| GatewayError::UnknownSymbol(symbol.clone()))?;

        let visible = Self::visible(candles, self.now());
        let start = visible.len().saturating_sub(limit);
        Ok(visible[start..].to_vec())
    }

    async fn fetch_ticker(&self, symbol: &Symbol) -> Result<Ticker24h, GatewayError> {
        let now = self.now();
        let visible = Self::visible(self.finest(symbol)?, now);
        let last = visible
            .last()
            .ok_or_else(|| GatewayError::Unavailable(format!("no data for {} at {}", symbol, now)))?;

        let window_start = now - Duration::hours(24);
        let quote_volume = visible
            .iter()
            .rev()
            .take_while(|c| c.datetime > window_start)
            .map(Candle::quote_volume)
            .sum();

        Ok(Ticker24h {
            symbol: symbol.clone(),
            last_price: last.close,
            quote_volume,
            timestamp: now,
        })
    }

    async fn fetch_account(&self) -> Result<VenueAccount, GatewayError> {
        let book = self.book()?;
        let positions = book
            .holdings
            .iter()
            .map(|(symbol, h)| VenuePosition {
                symbol: symbol.clone(),
                direction: if h.quantity > 0.0 {
                    Direction::Long
                } else {
                    Direction::Short
                },
                quantity: h.quantity.abs(),
                entry_price: h.entry_price,
            })
            .collect();

        Ok(VenueAccount {
            equity: book.balance,
            positions,
        })
    }

    async fn submit_order(&self, order: &OrderRequest) -> Result<OrderAck, GatewayError> {
        let now = self.now();
        let mut book = self.book()?;
        book.seq += 1;
        let order_id = format!("replay-{}", book.seq);

        let signed_qty = match order.side {
            OrderSide::Buy => order.quantity,
            OrderSide::Sell => -order.quantity,
        };

        let state = if !(order.quantity.is_finite() && order.quantity > 0.0) {
            OrderState::Rejected {
                reason: format!("invalid quantity {}", order.quantity),
            }
        } else if order.reduce_only
            && !book
                .holdings
                .get(&order.symbol)
                .is_some_and(|h| h.quantity.signum() == -signed_qty.signum())
        {
            OrderState::Rejected {
                reason: "reduce-only order would open a position".to_string(),
            }
        } else {
            let price = self.last_price(&order.symbol, now)?;
            let realized = Self::apply_fill(&mut book, &order.symbol, signed_qty, price);
            let fee = price * order.quantity * self.taker_fee;
            book.balance += Money::from_f64(realized - fee).round_dp(8);
            OrderState::Filled {
                quantity: order.quantity,
                avg_price: price,
            }
        };

        let ack = OrderAck {
            order_id: order_id.clone(),
            client_order_id: order.client_order_id.clone(),
            symbol: order.symbol.clone(),
            state,
            timestamp: now,
        };
        book.orders.insert(order_id, ack.clone());

        tracing::debug!(
            venue = self.name(),
            symbol = %order.symbol,
            side = %order.side,
            quantity = order.quantity,
            state = ?ack.state,
            "Replay order processed"
        );
        Ok(ack)
    }

    async fn order_status(&self, _symbol: &Symbol, order_id: &str) -> Result<OrderAck, GatewayError> {
        self.book()?
            .orders
            .get(order_id)
            .cloned()
            .ok_or_else(|| GatewayError::UnknownOrder(order_id.to_string()))
    }

    fn name(&self) -> &'static str {
        "replay"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap()
    }

    fn hourly(count: usize, start_price: f64, volume: f64) -> Vec<Candle> {
        (0..count)
            .map(|i| {
                let price = start_price + i as f64;
                Candle::new_unchecked(
                    t0() + Duration::hours(i as i64),
                    price,
                    price + 0.5,
                    price - 0.5,
                    price,
                    volume,
                )
            })
            .collect()
    }

    fn gateway() -> ReplayGateway {
        ReplayGateway::new(Money::from_f64(1_000.0), t0())
            .with_series(Symbol::new("ETHUSDT"), "1h", hourly(48, 100.0, 10.0))
    }

    fn order(side: OrderSide, quantity: f64, reduce_only: bool) -> OrderRequest {
        OrderRequest {
            client_order_id: "c-1".to_string(),
            symbol: Symbol::new("ETHUSDT"),
            side,
            quantity,
            stop_price: None,
            reduce_only,
        }
    }

    #[tokio::test]
    async fn test_serves_only_candles_up_to_clock() {
        let gw = gateway();
        gw.advance(Duration::hours(5));
        let candles = gw.fetch_candles(&Symbol::new("ETHUSDT"), "1h", 100).await.unwrap();
        assert_eq!(candles.len(), 6);
        assert_eq!(candles.last().unwrap().close, 105.0);

        let limited = gw.fetch_candles(&Symbol::new("ETHUSDT"), "1h", 2).await.unwrap();
        assert_eq!(limited.len(), 2);
        assert_eq!(limited[0].close, 104.0);
    }

    #[tokio::test]
    async fn test_ticker_sums_last_24h_quote_volume() {
        let gw = gateway();
        gw.advance(Duration::hours(30));
        let ticker = gw.fetch_ticker(&Symbol::new("ETHUSDT")).await.unwrap();
        assert_eq!(ticker.last_price, 130.0);
        // bars 7..=30, 24 bars at close*10
        let expected: f64 = (7..=30).map(|i| (100.0 + i as f64) * 10.0).sum();
        assert_relative_eq!(ticker.quote_volume, expected, epsilon = 1e-9);
    }

    #[tokio::test]
    async fn test_fills_track_positions_and_balance() {
        let gw = gateway();
        let ack = gw.submit_order(&order(OrderSide::Sell, 2.0, false)).await.unwrap();
        assert_eq!(ack.state, OrderState::Filled { quantity: 2.0, avg_price: 100.0 });

        let account = gw.fetch_account().await.unwrap();
        assert_eq!(account.positions[0].direction, Direction::Short);

        gw.advance(Duration::hours(3));
        gw.submit_order(&order(OrderSide::Buy, 2.0, true)).await.unwrap();
        let account = gw.fetch_account().await.unwrap();
        assert!(account.positions.is_empty());
        // short from 100 to 103 on 2 units
        assert_eq!(account.equity, Money::from_f64(994.0));

        let status = gw.order_status(&Symbol::new("ETHUSDT"), &ack.order_id).await.unwrap();
        assert_eq!(status.client_order_id, "c-1");
    }

    #[tokio::test]
    async fn test_reduce_only_without_position_is_rejected() {
        let gw = gateway();
        let ack = gw.submit_order(&order(OrderSide::Sell, 1.0, true)).await.unwrap();
        assert!(matches!(ack.state, OrderState::Rejected { .. }));
    }

    #[tokio::test]
    async fn test_unknown_symbol() {
        let gw = gateway();
        assert!(matches!(
            gw.fetch_ticker(&Symbol::new("NOPEUSDT")).await,
            Err(GatewayError::UnknownSymbol(_))
        ));
    }
}
