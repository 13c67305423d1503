use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Side of a directional setup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "UPPERCASE")]
#[sqlx(type_name = "TEXT", rename_all = "UPPERCASE")]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    /// +1 for LONG, -1 for SHORT.
    pub fn sign(self) -> f64 {
        match self {
            Direction::Long => 1.0,
            Direction::Short => -1.0,
        }
    }

    pub fn opposite(self) -> Self {
        match self {
            Direction::Long => Direction::Short,
            Direction::Short => Direction::Long,
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Long => write!(f, "LONG"),
            Direction::Short => write!(f, "SHORT"),
        }
    }
}

/// Take-profit / stop-loss pair.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Targets {
    pub take_profit: f64,
    pub stop_loss: f64,
}

impl Targets {
    /// Reward over risk measured from `entry`. Zero when risk is zero.
    pub fn risk_reward(&self, entry: f64) -> f64 {
        let risk = (entry - self.stop_loss).abs();
        if risk <= 0.0 {
            return 0.0;
        }
        (self.take_profit - entry).abs() / risk
    }
}

/// Enforces: all levels strictly positive, LONG `tp > entry > sl`,
/// SHORT `tp < entry < sl`.
pub fn validate_levels(direction: Direction, entry: f64, targets: Targets) -> Result<()> {
    let Targets {
        take_profit,
        stop_loss,
    } = targets;
    let finite = entry.is_finite() && take_profit.is_finite() && stop_loss.is_finite();
    if !finite || entry <= 0.0 || take_profit <= 0.0 || stop_loss <= 0.0 {
        return Err(Error::InvalidLevels(format!(
            "non-positive level: entry={entry} tp={take_profit} sl={stop_loss}"
        )));
    }
    let ordered = match direction {
        Direction::Long => take_profit > entry && entry > stop_loss,
        Direction::Short => take_profit < entry && entry < stop_loss,
    };
    if !ordered {
        return Err(Error::InvalidLevels(format!(
            "{direction} levels out of order: entry={entry} tp={take_profit} sl={stop_loss}"
        )));
    }
    Ok(())
}

/// A directional setup emitted by the signal generator.
///
/// Build through [`Signal::new`], which rejects any level ordering that
/// would corrupt the lifecycle map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub id: String,
    pub symbol: String,
    pub direction: Direction,
    pub entry: f64,
    pub take_profit: f64,
    pub stop_loss: f64,
    pub confidence: f64,
    pub created_at: DateTime<Utc>,
    pub rationale: String,
}

impl Signal {
    pub fn new(
        symbol: impl Into<String>,
        direction: Direction,
        entry: f64,
        targets: Targets,
        confidence: f64,
        created_at: DateTime<Utc>,
        rationale: impl Into<String>,
    ) -> Result<Self> {
        validate_levels(direction, entry, targets)?;
        if !(0.0..=100.0).contains(&confidence) {
            return Err(Error::InvalidLevels(format!(
                "confidence {confidence} outside [0, 100]"
            )));
        }
        let symbol = symbol.into();
        Ok(Self {
            id: format!("{symbol}-{}", created_at.timestamp_millis()),
            symbol,
            direction,
            entry,
            take_profit: targets.take_profit,
            stop_loss: targets.stop_loss,
            confidence,
            created_at,
            rationale: rationale.into(),
        })
    }

    pub fn targets(&self) -> Targets {
        Targets {
            take_profit: self.take_profit,
            stop_loss: self.stop_loss,
        }
    }

    pub fn risk_reward(&self) -> f64 {
        self.targets().risk_reward(self.entry)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "UPPERCASE")]
#[sqlx(type_name = "TEXT", rename_all = "UPPERCASE")]
pub enum PositionStatus {
    Pending,
    Open,
    Closed,
}

impl std::fmt::Display for PositionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PositionStatus::Pending => write!(f, "PENDING"),
            PositionStatus::Open => write!(f, "OPEN"),
            PositionStatus::Closed => write!(f, "CLOSED"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(type_name = "TEXT", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CloseReason {
    TakeProfit,
    StopLoss,
    TrendReversal,
    Expired,
    Manual,
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CloseReason::TakeProfit => write!(f, "TAKE_PROFIT"),
            CloseReason::StopLoss => write!(f, "STOP_LOSS"),
            CloseReason::TrendReversal => write!(f, "TREND_REVERSAL"),
            CloseReason::Expired => write!(f, "EXPIRED"),
            CloseReason::Manual => write!(f, "MANUAL"),
        }
    }
}

/// Runtime state of an accepted signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub id: String,
    pub signal: Signal,
    pub take_profit: f64,
    pub stop_loss: f64,
    pub notional_usd: f64,
    pub current_price: f64,
    pub unrealized_pnl: f64,
    pub status: PositionStatus,
    pub opened_at: DateTime<Utc>,
    pub close_reason: Option<CloseReason>,
    pub close_price: Option<f64>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl Position {
    /// Wrap a signal in a `PENDING` position.
    pub fn pending(signal: Signal, notional_usd: f64, opened_at: DateTime<Utc>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            take_profit: signal.take_profit,
            stop_loss: signal.stop_loss,
            current_price: signal.entry,
            signal,
            notional_usd,
            unrealized_pnl: 0.0,
            status: PositionStatus::Pending,
            opened_at,
            close_reason: None,
            close_price: None,
            closed_at: None,
        }
    }

    pub fn symbol(&self) -> &str {
        &self.signal.symbol
    }

    pub fn direction(&self) -> Direction {
        self.signal.direction
    }

    pub fn entry(&self) -> f64 {
        self.signal.entry
    }

    pub fn targets(&self) -> Targets {
        Targets {
            take_profit: self.take_profit,
            stop_loss: self.stop_loss,
        }
    }

    pub fn is_open(&self) -> bool {
        self.status == PositionStatus::Open
    }

    /// `PENDING -> OPEN`.
    pub fn activate(&mut self) -> Result<()> {
        self.transition(PositionStatus::Pending, PositionStatus::Open)
    }

    /// `direction_sign * (price - entry) / entry * notional`.
    pub fn pnl_at(&self, price: f64) -> f64 {
        let entry = self.entry();
        self.direction().sign() * (price - entry) / entry * self.notional_usd
    }

    /// PnL as a percentage of entry.
    pub fn pnl_pct_at(&self, price: f64) -> f64 {
        let entry = self.entry();
        self.direction().sign() * (price - entry) / entry * 100.0
    }

    /// Record a fresh price. Ignored once closed.
    pub fn mark(&mut self, price: f64) {
        if self.status == PositionStatus::Closed {
            return;
        }
        self.current_price = price;
        self.unrealized_pnl = self.pnl_at(price);
    }

    pub fn take_profit_hit(&self, price: f64) -> bool {
        match self.direction() {
            Direction::Long => price >= self.take_profit,
            Direction::Short => price <= self.take_profit,
        }
    }

    pub fn stop_loss_hit(&self, price: f64) -> bool {
        match self.direction() {
            Direction::Long => price <= self.stop_loss,
            Direction::Short => price >= self.stop_loss,
        }
    }

    pub fn expired(&self, now: DateTime<Utc>, window: Duration) -> bool {
        now - self.opened_at > window
    }

    /// True when `targets` are valid and improve on both current levels
    /// in the position's favour.
    pub fn improves_on(&self, targets: Targets) -> bool {
        if validate_levels(self.direction(), self.entry(), targets).is_err() {
            return false;
        }
        match self.direction() {
            Direction::Long => {
                targets.take_profit > self.take_profit && targets.stop_loss > self.stop_loss
            }
            Direction::Short => {
                targets.take_profit < self.take_profit && targets.stop_loss < self.stop_loss
            }
        }
    }

    /// Replace the live levels. Caller is responsible for `improves_on`.
    pub fn retarget(&mut self, targets: Targets) -> Result<()> {
        if self.status != PositionStatus::Open {
            return Err(Error::InvalidTransition {
                from: self.status,
                to: PositionStatus::Open,
            });
        }
        validate_levels(self.direction(), self.entry(), targets)?;
        self.take_profit = targets.take_profit;
        self.stop_loss = targets.stop_loss;
        Ok(())
    }

    /// `OPEN -> CLOSED`. PnL is frozen at `price`.
    pub fn close(&mut self, reason: CloseReason, price: f64, at: DateTime<Utc>) -> Result<()> {
        self.transition(PositionStatus::Open, PositionStatus::Closed)?;
        self.current_price = price;
        self.unrealized_pnl = self.pnl_at(price);
        self.close_reason = Some(reason);
        self.close_price = Some(price);
        self.closed_at = Some(at);
        Ok(())
    }

    fn transition(&mut self, from: PositionStatus, to: PositionStatus) -> Result<()> {
        if self.status != from {
            return Err(Error::InvalidTransition {
                from: self.status,
                to,
            });
        }
        self.status = to;
        Ok(())
    }
}

/// Lifecycle events published to notification sinks.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "position")]
pub enum SignalEvent {
    SignalOpened(Position),
    SignalUpdated(Position),
    SignalClosed(Position),
}

impl SignalEvent {
    pub fn position(&self) -> &Position {
        match self {
            SignalEvent::SignalOpened(p)
            | SignalEvent::SignalUpdated(p)
            | SignalEvent::SignalClosed(p) => p,
        }
    }
}

/// Why a candidate signal or open request was declined. A deliberate
/// no-op decision, not an error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RejectionReason {
    ConfidenceBelowThreshold { confidence: f64, threshold: f64 },
    RiskRewardTooLow { ratio: f64, minimum: f64 },
    InstrumentCapReached { max: usize },
    DirectionAlreadyOpen(Direction),
    InvalidLevels(String),
}

impl std::fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectionReason::ConfidenceBelowThreshold {
                confidence,
                threshold,
            } => write!(f, "confidence {confidence:.1} below threshold {threshold:.1}"),
            RejectionReason::RiskRewardTooLow { ratio, minimum } => {
                write!(f, "risk/reward {ratio:.2} below minimum {minimum:.2}")
            }
            RejectionReason::InstrumentCapReached { max } => {
                write!(f, "instrument already has {max} open positions")
            }
            RejectionReason::DirectionAlreadyOpen(d) => write!(f, "{d} position already open"),
            RejectionReason::InvalidLevels(s) => write!(f, "invalid levels: {s}"),
        }
    }
}
