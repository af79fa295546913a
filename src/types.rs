//! Core data types used across the trading engine

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Validation errors for candle data
#[derive(Debug, Error)]
pub enum CandleValidationError {
    #[error("high ({high}) must be >= low ({low})")]
    HighLessThanLow { high: f64, low: f64 },

    #[error("volume ({0}) must be >= 0")]
    NegativeVolume(f64),

    #[error("open ({open}) must be between low ({low}) and high ({high})")]
    OpenOutOfRange { open: f64, low: f64, high: f64 },

    #[error("close ({close}) must be between low ({low}) and high ({high})")]
    CloseOutOfRange { close: f64, low: f64, high: f64 },

    #[error("prices must be positive: open={open}, high={high}, low={low}, close={close}")]
    NonPositivePrice {
        open: f64,
        high: f64,
        low: f64,
        close: f64,
    },
}

/// OHLCV candlestick data
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candle {
    pub datetime: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    /// Create a new candle with validation
    pub fn new(
        datetime: DateTime<Utc>,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        volume: f64,
    ) -> Result<Self, CandleValidationError> {
        let candle = Self::new_unchecked(datetime, open, high, low, close, volume);
        candle.validate()?;
        Ok(candle)
    }

    /// Create a candle without validation (for trusted sources or when validation is done separately)
    pub fn new_unchecked(
        datetime: DateTime<Utc>,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        volume: f64,
    ) -> Self {
        Self {
            datetime,
            open,
            high,
            low,
            close,
            volume,
        }
    }

    /// Validate the candle data
    pub fn validate(&self) -> Result<(), CandleValidationError> {
        if self.open <= 0.0 || self.high <= 0.0 || self.low <= 0.0 || self.close <= 0.0 {
            return Err(CandleValidationError::NonPositivePrice {
                open: self.open,
                high: self.high,
                low: self.low,
                close: self.close,
            });
        }

        if self.high < self.low {
            return Err(CandleValidationError::HighLessThanLow {
                high: self.high,
                low: self.low,
            });
        }

        if self.volume < 0.0 {
            return Err(CandleValidationError::NegativeVolume(self.volume));
        }

        if self.open < self.low || self.open > self.high {
            return Err(CandleValidationError::OpenOutOfRange {
                open: self.open,
                low: self.low,
                high: self.high,
            });
        }

        if self.close < self.low || self.close > self.high {
            return Err(CandleValidationError::CloseOutOfRange {
                close: self.close,
                low: self.low,
                high: self.high,
            });
        }

        Ok(())
    }

    /// Check if the candle is valid without returning detailed error
    pub fn is_valid(&self) -> bool {
        self.validate().is_ok()
    }

    /// Quote-currency turnover of this bar (close * base volume)
    pub fn quote_volume(&self) -> f64 {
        self.close * self.volume
    }
}

/// Trading pair symbol using Arc<str> for cheap cloning
///
/// Symbols are cloned into every metric, signal, order and position.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Symbol(#[serde(with = "arc_str_serde")] std::sync::Arc<str>);

/// Custom serde for Arc<str>
mod arc_str_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::sync::Arc;

    pub fn serialize<S>(value: &Arc<str>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(value)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Arc<str>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(Arc::from(s.as_str()))
    }
}

impl Symbol {
    pub fn new(s: impl AsRef<str>) -> Self {
        Symbol(std::sync::Arc::from(s.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Regime and Strategy Identity
// ============================================================================

/// Classified market condition. Exactly one holds at any instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Regime {
    Trending,
    Ranging,
    Dumping,
}

impl Regime {
    pub fn as_str(&self) -> &'static str {
        match self {
            Regime::Trending => "TRENDING",
            Regime::Ranging => "RANGING",
            Regime::Dumping => "DUMPING",
        }
    }
}

impl fmt::Display for Regime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Regime {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "TRENDING" => Ok(Regime::Trending),
            "RANGING" => Ok(Regime::Ranging),
            "DUMPING" => Ok(Regime::Dumping),
            other => Err(format!("unknown regime '{}'", other)),
        }
    }
}

/// The three interchangeable strategies, one per regime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    Trend,
    Scalp,
    Protective,
}

impl StrategyKind {
    pub const ALL: [StrategyKind; 3] = [
        StrategyKind::Trend,
        StrategyKind::Scalp,
        StrategyKind::Protective,
    ];

    /// Strategy that is live while `regime` holds
    pub fn for_regime(regime: Regime) -> Self {
        match regime {
            Regime::Trending => StrategyKind::Trend,
            Regime::Ranging => StrategyKind::Scalp,
            Regime::Dumping => StrategyKind::Protective,
        }
    }

    /// Regime this strategy serves
    pub fn regime(&self) -> Regime {
        match self {
            StrategyKind::Trend => Regime::Trending,
            StrategyKind::Scalp => Regime::Ranging,
            StrategyKind::Protective => Regime::Dumping,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyKind::Trend => "trend",
            StrategyKind::Scalp => "scalp",
            StrategyKind::Protective => "protective",
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Trade direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Long,
    Short,
    Flat,
}

impl Direction {
    /// +1 for long, -1 for short, 0 for flat
    pub fn sign(&self) -> f64 {
        match self {
            Direction::Long => 1.0,
            Direction::Short => -1.0,
            Direction::Flat => 0.0,
        }
    }

    pub fn opposite(&self) -> Direction {
        match self {
            Direction::Long => Direction::Short,
            Direction::Short => Direction::Long,
            Direction::Flat => Direction::Flat,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Direction::Long => "long",
            Direction::Short => "short",
            Direction::Flat => "flat",
        };
        f.write_str(s)
    }
}

/// Side of an order sent to the venue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    /// Side that opens (or adds to) a position in `direction`
    pub fn opening(direction: Direction) -> Option<Self> {
        match direction {
            Direction::Long => Some(OrderSide::Buy),
            Direction::Short => Some(OrderSide::Sell),
            Direction::Flat => None,
        }
    }

    /// Side that closes a position in `direction`
    pub fn closing(direction: Direction) -> Option<Self> {
        Self::opening(direction.opposite())
    }
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderSide::Buy => f.write_str("BUY"),
            OrderSide::Sell => f.write_str("SELL"),
        }
    }
}

// ============================================================================
// Indicator Snapshots and Pair Metrics
// ============================================================================

/// Indicator values for the regime reference asset at one timestamp
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndicatorSnapshot {
    pub asset: Symbol,
    pub timestamp: DateTime<Utc>,
    pub adx: f64,
    pub ema200: f64,
    pub price: f64,
    pub volume: f64,
    /// Coefficient of variation of volume over the volume window
    pub volume_cv: f64,
    /// Absolute close-to-close move over the volume window, in percent
    pub net_displacement_pct: f64,
}

/// Short-timeframe indicators computed per candidate pair during the scan
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PairIndicators {
    pub ema_fast: f64,
    pub ema_slow: f64,
    pub adx: f64,
    pub rsi: f64,
    pub bb_upper: f64,
    pub bb_middle: f64,
    pub bb_lower: f64,
    pub atr_pct: f64,
}

/// Result of evaluating one symbol during a scan cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairMetrics {
    pub symbol: Symbol,
    /// 24h notional volume in USDT
    pub quote_volume_24h: f64,
    /// ATR as a percentage of price on the scan timeframe
    pub volatility: f64,
    pub liquid: bool,
    pub price: f64,
    pub indicators: PairIndicators,
    pub timestamp: DateTime<Utc>,
}

// ============================================================================
// Signals
// ============================================================================

/// What a signal asks the risk manager to do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalIntent {
    /// Open a new position
    Open,
    /// Pyramid into an existing position
    Add,
    /// Close an existing position
    Close,
    /// Do nothing
    Hold,
}

impl fmt::Display for SignalIntent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SignalIntent::Open => "open",
            SignalIntent::Add => "add",
            SignalIntent::Close => "close",
            SignalIntent::Hold => "hold",
        };
        f.write_str(s)
    }
}

/// Trading signal produced by a strategy. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub symbol: Symbol,
    pub direction: Direction,
    /// Suggested fraction of equity to commit (0.0 - 1.0)
    pub size_fraction: f64,
    pub source: StrategyKind,
    pub intent: SignalIntent,
    /// Reference price the decision was made at
    pub price: f64,
    pub created_at: DateTime<Utc>,
}

impl Signal {
    pub fn open(
        pair: &PairMetrics,
        direction: Direction,
        size_fraction: f64,
        source: StrategyKind,
    ) -> Self {
        Self::build(pair, direction, size_fraction, source, SignalIntent::Open)
    }

    pub fn add(
        pair: &PairMetrics,
        direction: Direction,
        size_fraction: f64,
        source: StrategyKind,
    ) -> Self {
        Self::build(pair, direction, size_fraction, source, SignalIntent::Add)
    }

    pub fn close(pair: &PairMetrics, source: StrategyKind) -> Self {
        Self::build(pair, Direction::Flat, 0.0, source, SignalIntent::Close)
    }

    pub fn hold(pair: &PairMetrics, source: StrategyKind) -> Self {
        Self::build(pair, Direction::Flat, 0.0, source, SignalIntent::Hold)
    }

    fn build(
        pair: &PairMetrics,
        direction: Direction,
        size_fraction: f64,
        source: StrategyKind,
        intent: SignalIntent,
    ) -> Self {
        Signal {
            symbol: pair.symbol.clone(),
            direction,
            size_fraction,
            source,
            intent,
            price: pair.price,
            created_at: pair.timestamp,
        }
    }

    /// Opens or adds to exposure
    pub fn is_new_exposure(&self) -> bool {
        matches!(self.intent, SignalIntent::Open | SignalIntent::Add)
    }

    pub fn is_actionable(&self) -> bool {
        self.intent != SignalIntent::Hold
    }

    /// Same signal with intent downgraded to hold
    pub fn into_hold(self) -> Self {
        Signal {
            direction: Direction::Flat,
            size_fraction: 0.0,
            intent: SignalIntent::Hold,
            ..self
        }
    }
}

// ============================================================================
// Positions and Account State
// ============================================================================

/// Why a position was closed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    StopLoss,
    TakeProfit,
    TrailingStop,
    MaxHold,
    Signal,
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExitReason::StopLoss => "stop loss",
            ExitReason::TakeProfit => "take profit",
            ExitReason::TrailingStop => "trailing stop",
            ExitReason::MaxHold => "max hold",
            ExitReason::Signal => "signal",
        };
        f.write_str(s)
    }
}

/// Open position. Owned exclusively by the risk manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub symbol: Symbol,
    pub direction: Direction,
    pub entry_price: f64,
    pub quantity: f64,
    pub opened_at: DateTime<Utc>,
    /// Strategy that opened the position and keeps managing it
    pub strategy: StrategyKind,
    pub stop_price: f64,
    pub target_price: Option<f64>,
    pub trailing_stop_pct: Option<f64>,
    /// Most favourable price seen since entry (drives the trailing stop)
    pub best_price: f64,
    pub adds: u32,
    pub max_hold_until: Option<DateTime<Utc>>,
}

impl Position {
    pub fn notional(&self) -> f64 {
        self.quantity * self.entry_price
    }

    pub fn unrealized_pnl(&self, current_price: f64) -> f64 {
        (current_price - self.entry_price) * self.quantity * self.direction.sign()
    }

    /// Unleveraged return since entry, in percent
    pub fn return_pct(&self, current_price: f64) -> f64 {
        if self.entry_price <= 0.0 {
            return 0.0;
        }
        (current_price - self.entry_price) / self.entry_price * 100.0 * self.direction.sign()
    }

    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now - self.opened_at
    }
}

/// Closed trade record with precise decimal arithmetic for monetary values
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClosedTrade {
    pub symbol: Symbol,
    pub direction: Direction,
    pub strategy: StrategyKind,
    pub entry_price: f64,
    pub exit_price: f64,
    pub quantity: f64,
    pub opened_at: DateTime<Utc>,
    pub closed_at: DateTime<Utc>,
    pub gross_pnl: Money,
    pub fees: Money,
    pub net_pnl: Money,
    pub reason: ExitReason,
}

impl ClosedTrade {
    /// Calculate return percentage
    pub fn return_pct(&self) -> f64 {
        if self.entry_price <= 0.0 {
            return 0.0;
        }
        (self.exit_price - self.entry_price) / self.entry_price * 100.0 * self.direction.sign()
    }
}

/// Process-wide account state. Mutated only by the risk manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountState {
    pub equity: Money,
    pub daily_realized_pnl: Money,
    pub daily_start_equity: Money,
    pub open_positions: BTreeMap<Symbol, Position>,
    pub circuit_breaker_until: Option<DateTime<Utc>>,
    /// Start of the current daily accounting window
    pub day_started: DateTime<Utc>,
}

impl AccountState {
    pub fn new(equity: Money, now: DateTime<Utc>) -> Self {
        AccountState {
            equity,
            daily_realized_pnl: Money::ZERO,
            daily_start_equity: equity,
            open_positions: BTreeMap::new(),
            circuit_breaker_until: None,
            day_started: now,
        }
    }

    pub fn position(&self, symbol: &Symbol) -> Option<&Position> {
        self.open_positions.get(symbol)
    }

    pub fn open_count(&self) -> usize {
        self.open_positions.len()
    }

    /// Breaker is set and still in the future
    pub fn breaker_active(&self, now: DateTime<Utc>) -> bool {
        matches!(self.circuit_breaker_until, Some(until) if now < until)
    }

    /// daily_realized_pnl / daily_start_equity
    pub fn daily_pnl_ratio(&self) -> f64 {
        if !self.daily_start_equity.is_positive() {
            return 0.0;
        }
        (self.daily_realized_pnl / self.daily_start_equity).to_f64()
    }
}

// ============================================================================
// Money Type - Precise Decimal Arithmetic for Monetary Values
// ============================================================================

use rust_decimal::Decimal;
use std::cmp::Ordering;
use std::ops::{Add, AddAssign, Div, Mul, Neg, Sub, SubAssign};

/// Money type for precise decimal arithmetic in monetary calculations.
///
/// Wraps `rust_decimal::Decimal` so realized P&L sums are exact and do not
/// depend on the order they are applied in.
///
/// # Example
/// ```
/// use regime_trader::Money;
/// let equity = Money::from_f64(1_000.10);
/// let pnl = Money::from_f64(-0.10);
/// assert_eq!((equity + pnl).to_f64(), 1_000.0);
/// ```
#[derive(Debug, Clone, Copy, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Money(#[serde(with = "rust_decimal::serde::str")] Decimal);

impl Money {
    /// Zero value
    pub const ZERO: Money = Money(Decimal::ZERO);

    /// Create from f64
    /// Note: This conversion may lose precision for values with many decimal places
    pub fn from_f64(value: f64) -> Self {
        Money(Decimal::try_from(value).unwrap_or_else(|_| {
            // Fallback for extreme values (NaN, Infinity)
            if value.is_nan() || value.is_infinite() {
                Decimal::ZERO
            } else {
                Decimal::from_f64_retain(value).unwrap_or(Decimal::ZERO)
            }
        }))
    }

    /// Convert to f64 (for ratios and sizing that work in f64)
    pub fn to_f64(self) -> f64 {
        use rust_decimal::prelude::ToPrimitive;
        self.0.to_f64().unwrap_or(0.0)
    }

    pub fn from_decimal(value: Decimal) -> Self {
        Money(value)
    }

    pub fn is_zero(self) -> bool {
        self.0.is_zero()
    }

    pub fn is_positive(self) -> bool {
        self.0.is_sign_positive() && !self.0.is_zero()
    }

    pub fn is_negative(self) -> bool {
        self.0.is_sign_negative() && !self.0.is_zero()
    }

    pub fn round_dp(self, dp: u32) -> Self {
        Money(self.0.round_dp(dp))
    }

    /// Get the underlying Decimal
    pub fn inner(self) -> Decimal {
        self.0
    }
}

impl Default for Money {
    fn default() -> Self {
        Self::ZERO
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl PartialEq for Money {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl PartialOrd for Money {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Money {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}

impl std::hash::Hash for Money {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.0.hash(state);
    }
}

impl Add for Money {
    type Output = Self;
    fn add(self, rhs: Self) -> Self::Output {
        Money(self.0 + rhs.0)
    }
}

impl AddAssign for Money {
    fn add_assign(&mut self, rhs: Self) {
        self.0 += rhs.0;
    }
}

impl Sub for Money {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self::Output {
        Money(self.0 - rhs.0)
    }
}

impl SubAssign for Money {
    fn sub_assign(&mut self, rhs: Self) {
        self.0 -= rhs.0;
    }
}

impl Mul for Money {
    type Output = Self;
    fn mul(self, rhs: Self) -> Self::Output {
        Money(self.0 * rhs.0)
    }
}

impl Div for Money {
    type Output = Self;
    fn div(self, rhs: Self) -> Self::Output {
        if rhs.0.is_zero() {
            Money::ZERO
        } else {
            Money(self.0 / rhs.0)
        }
    }
}

impl Neg for Money {
    type Output = Self;
    fn neg(self) -> Self::Output {
        Money(-self.0)
    }
}

impl From<f64> for Money {
    fn from(value: f64) -> Self {
        Money::from_f64(value)
    }
}

impl From<Money> for f64 {
    fn from(value: Money) -> Self {
        value.to_f64()
    }
}

impl std::iter::Sum for Money {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Money::ZERO, |acc, x| acc + x)
    }
}

impl<'a> std::iter::Sum<&'a Money> for Money {
    fn sum<I: Iterator<Item = &'a Self>>(iter: I) -> Self {
        iter.fold(Money::ZERO, |acc, x| acc + *x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_candle_validation() {
        assert!(Candle::new(t0(), 100.0, 101.0, 99.0, 100.5, 10.0).is_ok());
        assert!(matches!(
            Candle::new(t0(), 100.0, 99.0, 101.0, 100.0, 10.0),
            Err(CandleValidationError::HighLessThanLow { .. })
        ));
        assert!(matches!(
            Candle::new(t0(), 100.0, 101.0, 99.0, 100.0, -1.0),
            Err(CandleValidationError::NegativeVolume(_))
        ));
    }

    #[test]
    fn test_money_precision() {
        let a = Money::from_f64(0.1);
        let b = Money::from_f64(0.2);
        let c = Money::from_f64(0.3);
        assert_eq!(a + b, c, "Money should handle 0.1 + 0.2 = 0.3 correctly");
    }

    #[test]
    fn test_money_div_by_zero() {
        assert_eq!(Money::from_f64(100.0) / Money::ZERO, Money::ZERO);
    }

    #[test]
    fn test_money_serde() {
        let money = Money::from_decimal(dec!(123.456));
        let json = serde_json::to_string(&money).unwrap();
        assert_eq!(json, "\"123.456\"");
        let parsed: Money = serde_json::from_str(&json).unwrap();
        assert_eq!(money, parsed);
    }

    #[test]
    fn test_strategy_for_regime_is_bijective() {
        for kind in StrategyKind::ALL {
            assert_eq!(StrategyKind::for_regime(kind.regime()), kind);
        }
    }

    #[test]
    fn test_regime_parse_roundtrip() {
        for regime in [Regime::Trending, Regime::Ranging, Regime::Dumping] {
            assert_eq!(regime.to_string().parse::<Regime>().unwrap(), regime);
        }
        assert!("sideways".parse::<Regime>().is_err());
    }

    #[test]
    fn test_position_pnl_respects_direction() {
        let position = Position {
            symbol: Symbol::new("ETHUSDT"),
            direction: Direction::Short,
            entry_price: 100.0,
            quantity: 2.0,
            opened_at: t0(),
            strategy: StrategyKind::Protective,
            stop_price: 101.5,
            target_price: Some(97.0),
            trailing_stop_pct: None,
            best_price: 100.0,
            adds: 0,
            max_hold_until: None,
        };

        assert_eq!(position.unrealized_pnl(95.0), 10.0);
        assert_eq!(position.unrealized_pnl(105.0), -10.0);
        assert!((position.return_pct(99.0) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_account_state_serde_keeps_positions() {
        let mut account = AccountState::new(Money::from_f64(1_000.0), t0());
        account.open_positions.insert(
            Symbol::new("BTCUSDT"),
            Position {
                symbol: Symbol::new("BTCUSDT"),
                direction: Direction::Long,
                entry_price: 60_000.0,
                quantity: 0.001,
                opened_at: t0(),
                strategy: StrategyKind::Trend,
                stop_price: 59_100.0,
                target_price: None,
                trailing_stop_pct: Some(2.0),
                best_price: 60_000.0,
                adds: 1,
                max_hold_until: None,
            },
        );

        let json = serde_json::to_string(&account).unwrap();
        let restored: AccountState = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, account);
    }
}
