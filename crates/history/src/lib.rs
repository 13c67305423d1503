use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use tokio::sync::RwLock;
use tracing::{debug, info};

use common::{
    CloseReason, Direction, Error, Position, PositionStatus, Result, Signal, TradeHistory,
};

const CREATE_TRADES: &str = r#"
CREATE TABLE IF NOT EXISTS trades (
    id                  TEXT PRIMARY KEY,
    signal_id           TEXT NOT NULL,
    instrument          TEXT NOT NULL,
    direction           TEXT NOT NULL,
    entry_price         REAL NOT NULL,
    initial_take_profit REAL NOT NULL,
    initial_stop_loss   REAL NOT NULL,
    take_profit         REAL NOT NULL,
    stop_loss           REAL NOT NULL,
    confidence          REAL NOT NULL,
    rationale           TEXT NOT NULL,
    notional_usd        REAL NOT NULL,
    close_price         REAL NOT NULL,
    pnl                 REAL NOT NULL,
    reason              TEXT NOT NULL,
    created_at          TEXT NOT NULL,
    opened_at           TEXT NOT NULL,
    closed_at           TEXT NOT NULL
)
"#;

const CREATE_CLOSED_AT_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_trades_closed_at ON trades (closed_at)";

/// Closed-position log backed by a SQLite `trades` table.
///
/// The schema is created on connect, so a fresh database file or
/// `sqlite::memory:` works without a separate migration step.
#[derive(Clone)]
pub struct SqliteTradeLog {
    pool: SqlitePool,
}

impl SqliteTradeLog {
    pub async fn connect(database_url: &str) -> Result<Self> {
        // A memory database lives and dies with its connection.
        let max_connections = if database_url.contains(":memory:") { 1 } else { 4 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        Self::with_pool(pool).await
    }

    pub async fn with_pool(pool: SqlitePool) -> Result<Self> {
        sqlx::query(CREATE_TRADES).execute(&pool).await?;
        sqlx::query(CREATE_CLOSED_AT_INDEX).execute(&pool).await?;
        info!("Trade history store ready");
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl TradeHistory for SqliteTradeLog {
    async fn record(&self, position: &Position) -> Result<()> {
        let (reason, close_price, closed_at) = closed_parts(position)?;
        let signal = &position.signal;

        sqlx::query(
            r#"
            INSERT INTO trades (
                id, signal_id, instrument, direction, entry_price,
                initial_take_profit, initial_stop_loss, take_profit, stop_loss,
                confidence, rationale, notional_usd, close_price, pnl, reason,
                created_at, opened_at, closed_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)
            ON CONFLICT(id) DO NOTHING
            "#,
        )
        .bind(&position.id)
        .bind(&signal.id)
        .bind(&signal.symbol)
        .bind(signal.direction)
        .bind(signal.entry)
        .bind(signal.take_profit)
        .bind(signal.stop_loss)
        .bind(position.take_profit)
        .bind(position.stop_loss)
        .bind(signal.confidence)
        .bind(&signal.rationale)
        .bind(position.notional_usd)
        .bind(close_price)
        .bind(position.unrealized_pnl)
        .bind(reason)
        .bind(timestamp(signal.created_at))
        .bind(timestamp(position.opened_at))
        .bind(timestamp(closed_at))
        .execute(&self.pool)
        .await?;

        debug!(instrument = %signal.symbol, id = %position.id, "Trade recorded");
        Ok(())
    }

    async fn recent(&self, limit: usize) -> Result<Vec<Position>> {
        let rows = sqlx::query(
            "SELECT * FROM trades ORDER BY closed_at DESC, rowid DESC LIMIT ?1",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(position_from_row).collect()
    }
}

fn closed_parts(position: &Position) -> Result<(CloseReason, f64, DateTime<Utc>)> {
    match (
        position.status,
        position.close_reason,
        position.close_price,
        position.closed_at,
    ) {
        (PositionStatus::Closed, Some(reason), Some(price), Some(at)) => Ok((reason, price, at)),
        _ => Err(Error::Other(format!(
            "position {} is {} and cannot be recorded as a trade",
            position.id, position.status
        ))),
    }
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| Error::Other(format!("bad timestamp '{raw}' in trades table: {e}")))
}

fn position_from_row(row: &SqliteRow) -> Result<Position> {
    let direction: Direction = row.try_get("direction")?;
    let close_price: f64 = row.try_get("close_price")?;
    let created_at: String = row.try_get("created_at")?;
    let opened_at: String = row.try_get("opened_at")?;
    let closed_at: String = row.try_get("closed_at")?;

    let signal = Signal {
        id: row.try_get("signal_id")?,
        symbol: row.try_get("instrument")?,
        direction,
        entry: row.try_get("entry_price")?,
        take_profit: row.try_get("initial_take_profit")?,
        stop_loss: row.try_get("initial_stop_loss")?,
        confidence: row.try_get("confidence")?,
        created_at: parse_timestamp(&created_at)?,
        rationale: row.try_get("rationale")?,
    };

    Ok(Position {
        id: row.try_get("id")?,
        signal,
        take_profit: row.try_get("take_profit")?,
        stop_loss: row.try_get("stop_loss")?,
        notional_usd: row.try_get("notional_usd")?,
        current_price: close_price,
        unrealized_pnl: row.try_get("pnl")?,
        status: PositionStatus::Closed,
        opened_at: parse_timestamp(&opened_at)?,
        close_reason: Some(row.try_get("reason")?),
        close_price: Some(close_price),
        closed_at: Some(parse_timestamp(&closed_at)?),
    })
}

/// In-process trade log for tests.
#[derive(Default)]
pub struct MemoryTradeLog {
    trades: RwLock<Vec<Position>>,
}

impl MemoryTradeLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.trades.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.trades.read().await.is_empty()
    }
}

#[async_trait]
impl TradeHistory for MemoryTradeLog {
    async fn record(&self, position: &Position) -> Result<()> {
        closed_parts(position)?;
        let mut trades = self.trades.write().await;
        if trades.iter().all(|p| p.id != position.id) {
            trades.push(position.clone());
        }
        Ok(())
    }

    async fn recent(&self, limit: usize) -> Result<Vec<Position>> {
        let trades = self.trades.read().await;
        Ok(trades.iter().rev().take(limit).cloned().collect())
    }
}
