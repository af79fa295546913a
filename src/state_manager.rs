// State Manager
// SQLite-based persistence for restart recovery and audit
//
// Checkpoints carry the full account state and last regime, the signal
// journal records every risk decision, and closed trades are kept for
// reporting.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

use crate::{AccountState, ClosedTrade, Direction, Money, Regime, Signal, SignalIntent, StrategyKind, Symbol};

// =============================================================================
// Data Models
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub cycle: u64,
    pub timestamp: DateTime<Utc>,
    pub regime: Option<Regime>,
    pub account: AccountState,
    pub dry_run: bool,
}

/// What happened to a signal after the strategy produced it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalDecision {
    Rejected,
    Filled,
    OrderRejected,
    Ambiguous,
}

impl SignalDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalDecision::Rejected => "rejected",
            SignalDecision::Filled => "filled",
            SignalDecision::OrderRejected => "order_rejected",
            SignalDecision::Ambiguous => "ambiguous",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalRecord {
    pub timestamp: DateTime<Utc>,
    pub symbol: Symbol,
    pub strategy: StrategyKind,
    pub intent: SignalIntent,
    pub direction: Direction,
    pub decision: SignalDecision,
    pub reason: Option<String>,
}

impl SignalRecord {
    pub fn new(signal: &Signal, decision: SignalDecision, reason: Option<String>, at: DateTime<Utc>) -> Self {
        Self {
            timestamp: at,
            symbol: signal.symbol.clone(),
            strategy: signal.source,
            intent: signal.intent,
            direction: signal.direction,
            decision,
            reason,
        }
    }
}

/// Aggregate over recorded trades
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TradeStats {
    pub trades: usize,
    pub wins: usize,
    pub net_pnl: Money,
    pub fees: Money,
}

impl TradeStats {
    pub fn win_rate(&self) -> f64 {
        if self.trades == 0 {
            return 0.0;
        }
        self.wins as f64 / self.trades as f64 * 100.0
    }
}

// =============================================================================
// State Manager Implementation
// =============================================================================

#[derive(Clone)]
pub struct SqliteStateManager {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStateManager {
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let db_path = db_path.as_ref();

        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create state directory: {}", parent.display()))?;
        }

        let conn = Connection::open(db_path)
            .with_context(|| format!("Failed to open database: {}", db_path.display()))?;

        // Enable WAL mode for concurrent readers
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;

        Self::from_connection(conn)
    }

    /// Non-persistent store, used by replays that do not ask for a database
    pub fn in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        let manager = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        manager.create_tables()?;
        info!("SQLite state manager initialized");
        Ok(manager)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("state database lock poisoned"))
    }

    fn create_tables(&self) -> Result<()> {
        let conn = self.conn()?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS checkpoints (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                cycle INTEGER NOT NULL,
                timestamp TEXT NOT NULL,
                regime TEXT,
                equity TEXT NOT NULL,
                open_positions INTEGER NOT NULL,
                dry_run INTEGER NOT NULL DEFAULT 1,
                account TEXT NOT NULL,
                created_at TEXT DEFAULT CURRENT_TIMESTAMP
            );

            CREATE TABLE IF NOT EXISTS signal_journal (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                symbol TEXT NOT NULL,
                strategy TEXT NOT NULL,
                intent TEXT NOT NULL,
                direction TEXT NOT NULL,
                decision TEXT NOT NULL,
                reason TEXT,
                payload TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS trades (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                symbol TEXT NOT NULL,
                direction TEXT NOT NULL,
                strategy TEXT NOT NULL,
                entry_price REAL NOT NULL,
                exit_price REAL NOT NULL,
                quantity REAL NOT NULL,
                opened_at TEXT NOT NULL,
                closed_at TEXT NOT NULL,
                net_pnl TEXT NOT NULL,
                exit_reason TEXT NOT NULL,
                payload TEXT NOT NULL,
                created_at TEXT DEFAULT CURRENT_TIMESTAMP
            );

            CREATE INDEX IF NOT EXISTS idx_signal_journal_symbol ON signal_journal(symbol);
            CREATE INDEX IF NOT EXISTS idx_trades_symbol ON trades(symbol);",
        )?;

        debug!("Database schema created/verified");
        Ok(())
    }

    pub fn save_checkpoint(&self, ckpt: &Checkpoint) -> Result<()> {
        let account_json = serde_json::to_string(&ckpt.account)?;
        let conn = self.conn()?;

        conn.execute(
            "INSERT INTO checkpoints
             (cycle, timestamp, regime, equity, open_positions, dry_run, account)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                ckpt.cycle as i64,
                ckpt.timestamp.to_rfc3339(),
                ckpt.regime.map(|r| r.as_str()),
                ckpt.account.equity.to_string(),
                ckpt.account.open_count() as i64,
                ckpt.dry_run,
                account_json,
            ],
        )?;

        debug!(
            "Checkpoint saved: cycle={}, equity={}, positions={}",
            ckpt.cycle,
            ckpt.account.equity,
            ckpt.account.open_count()
        );
        Ok(())
    }

    pub fn load_checkpoint(&self) -> Result<Option<Checkpoint>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT cycle, timestamp, regime, dry_run, account
             FROM checkpoints ORDER BY id DESC LIMIT 1",
        )?;

        let row = stmt.query_row([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, bool>(3)?,
                row.get::<_, String>(4)?,
            ))
        });

        let (cycle, timestamp, regime, dry_run, account) = match row {
            Ok(values) => values,
            Err(rusqlite::Error::QueryReturnedNoRows) => {
                debug!("No checkpoint found");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let checkpoint = Checkpoint {
            cycle: cycle.max(0) as u64,
            timestamp: DateTime::parse_from_rfc3339(&timestamp)
                .with_context(|| format!("Bad checkpoint timestamp: {}", timestamp))?
                .with_timezone(&Utc),
            regime: regime
                .map(|r| r.parse::<Regime>())
                .transpose()
                .map_err(|e| anyhow!("Bad checkpoint regime: {}", e))?,
            account: serde_json::from_str(&account).context("Bad checkpoint account state")?,
            dry_run,
        };

        info!(
            "Loaded checkpoint: cycle={}, equity={}, positions={}, regime={:?}",
            checkpoint.cycle,
            checkpoint.account.equity,
            checkpoint.account.open_count(),
            checkpoint.regime
        );
        Ok(Some(checkpoint))
    }

    pub fn record_signal(&self, record: &SignalRecord) -> Result<()> {
        let payload = serde_json::to_string(record)?;
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO signal_journal
             (timestamp, symbol, strategy, intent, direction, decision, reason, payload)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                record.timestamp.to_rfc3339(),
                record.symbol.as_str(),
                record.strategy.as_str(),
                record.intent.to_string(),
                record.direction.to_string(),
                record.decision.as_str(),
                record.reason,
                payload,
            ],
        )?;
        Ok(())
    }

    pub fn recent_signals(&self, limit: usize) -> Result<Vec<SignalRecord>> {
        self.load_payloads(
            "SELECT payload FROM signal_journal ORDER BY id DESC LIMIT ?1",
            row_limit(limit),
        )
    }

    pub fn record_trade(&self, trade: &ClosedTrade) -> Result<()> {
        let payload = serde_json::to_string(trade)?;
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO trades
             (symbol, direction, strategy, entry_price, exit_price, quantity,
              opened_at, closed_at, net_pnl, exit_reason, payload)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                trade.symbol.as_str(),
                trade.direction.to_string(),
                trade.strategy.as_str(),
                trade.entry_price,
                trade.exit_price,
                trade.quantity,
                trade.opened_at.to_rfc3339(),
                trade.closed_at.to_rfc3339(),
                trade.net_pnl.to_string(),
                trade.reason.to_string(),
                payload,
            ],
        )?;

        let result = if trade.net_pnl.is_positive() { "WIN" } else { "LOSS" };
        info!(
            "Trade recorded: {} {} {:.6} @ {:.4} -> {:.4} | Net: {} ({:+.2}%) | {} | {}",
            trade.direction,
            trade.symbol,
            trade.quantity,
            trade.entry_price,
            trade.exit_price,
            trade.net_pnl,
            trade.return_pct(),
            trade.reason,
            result
        );
        Ok(())
    }

    pub fn recent_trades(&self, limit: usize) -> Result<Vec<ClosedTrade>> {
        self.load_payloads("SELECT payload FROM trades ORDER BY id DESC LIMIT ?1", row_limit(limit))
    }

    pub fn trade_stats(&self) -> Result<TradeStats> {
        // LIMIT -1 is unbounded in SQLite
        let trades: Vec<ClosedTrade> = self.load_payloads("SELECT payload FROM trades LIMIT ?1", -1)?;
        Ok(TradeStats {
            trades: trades.len(),
            wins: trades.iter().filter(|t| t.net_pnl.is_positive()).count(),
            net_pnl: trades.iter().map(|t| t.net_pnl).sum(),
            fees: trades.iter().map(|t| t.fees).sum(),
        })
    }

    fn load_payloads<T: serde::de::DeserializeOwned>(&self, sql: &str, limit: i64) -> Result<Vec<T>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(sql)?;
        let payloads = stmt
            .query_map(params![limit], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;

        payloads
            .iter()
            .map(|p| serde_json::from_str(p).context("Corrupt journal payload"))
            .collect()
    }
}

fn row_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}
