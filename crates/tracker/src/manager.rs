use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{info, warn};

use common::{
    validate_levels, CloseReason, Direction, Error, Position, RejectionReason, Result, Signal,
    SignalEvent, Targets, TradeHistory,
};

/// Capacity of the lifecycle event broadcast. Slow subscribers lag rather
/// than block the tracker.
const EVENT_CAPACITY: usize = 256;

/// `[tracker]` section of the scanner settings file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Maximum simultaneously open positions per instrument.
    pub max_trades_per_symbol: usize,
    /// Notional size used for PnL (USDT).
    pub notional_usd: f64,
    /// Positions older than this close with `EXPIRED`.
    pub expiry_hours: i64,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            max_trades_per_symbol: 1,
            notional_usd: 100.0,
            expiry_hours: 24,
        }
    }
}

impl TrackerConfig {
    pub fn expiry(&self) -> Duration {
        Duration::hours(self.expiry_hours)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_trades_per_symbol == 0 {
            return Err(Error::Config("max_trades_per_symbol must be >= 1".into()));
        }
        if !self.notional_usd.is_finite() || self.notional_usd <= 0.0 {
            return Err(Error::Config(format!(
                "notional_usd must be positive, got {}",
                self.notional_usd
            )));
        }
        if self.expiry_hours <= 0 {
            return Err(Error::Config(format!(
                "expiry_hours must be positive, got {}",
                self.expiry_hours
            )));
        }
        Ok(())
    }
}

/// One price observation for an instrument.
#[derive(Debug, Clone, Copy)]
pub struct PriceUpdate {
    pub price: f64,
    pub at: DateTime<Utc>,
    /// Direction of a fresh trend-reversal signal, if the latest evaluation
    /// produced one. Positions facing the other way close first.
    pub reversal: Option<Direction>,
}

impl PriceUpdate {
    pub fn new(price: f64, at: DateTime<Utc>) -> Self {
        Self {
            price,
            at,
            reversal: None,
        }
    }

    pub fn with_reversal(mut self, direction: Direction) -> Self {
        self.reversal = Some(direction);
        self
    }
}

type Book = Arc<Mutex<Vec<Position>>>;

/// Owns every open position, keyed by instrument.
///
/// Mutations on one instrument are serialized through that instrument's
/// book lock; different instruments proceed independently. Locks are never
/// held across history writes or event delivery.
pub struct PositionTracker {
    config: TrackerConfig,
    books: RwLock<HashMap<String, Book>>,
    events: broadcast::Sender<SignalEvent>,
    history: Arc<dyn TradeHistory>,
}

impl PositionTracker {
    pub fn new(config: TrackerConfig, history: Arc<dyn TradeHistory>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            config,
            books: RwLock::new(HashMap::new()),
            events,
            history,
        }
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    /// Receive every lifecycle event published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<SignalEvent> {
        self.events.subscribe()
    }

    pub fn event_sender(&self) -> broadcast::Sender<SignalEvent> {
        self.events.clone()
    }

    pub fn history(&self) -> Arc<dyn TradeHistory> {
        self.history.clone()
    }

    // ─── Lifecycle operations ────────────────────────────────────────────────

    /// Accept a signal as a new `OPEN` position, unless policy says no.
    pub async fn open(&self, signal: Signal) -> std::result::Result<Position, RejectionReason> {
        validate_levels(signal.direction, signal.entry, signal.targets())
            .map_err(|e| RejectionReason::InvalidLevels(e.to_string()))?;

        let symbol = signal.symbol.clone();
        let book = self.book_or_insert(&symbol).await;
        let position = {
            let mut positions = book.lock().await;
            if positions.len() >= self.config.max_trades_per_symbol {
                return Err(RejectionReason::InstrumentCapReached {
                    max: self.config.max_trades_per_symbol,
                });
            }
            if positions.iter().any(|p| p.direction() == signal.direction) {
                return Err(RejectionReason::DirectionAlreadyOpen(signal.direction));
            }

            let mut position = Position::pending(signal, self.config.notional_usd, Utc::now());
            position
                .activate()
                .map_err(|e| RejectionReason::InvalidLevels(e.to_string()))?;
            positions.push(position.clone());
            position
        };

        info!(
            instrument = %symbol,
            direction = %position.direction(),
            entry = position.entry(),
            take_profit = position.take_profit,
            stop_loss = position.stop_loss,
            confidence = position.signal.confidence,
            "Position opened"
        );
        self.publish(SignalEvent::SignalOpened(position.clone()));
        Ok(position)
    }

    /// Mark every open position on `symbol` at `update.price` and close those
    /// that hit a condition, checked in order: trend reversal, take-profit,
    /// stop-loss, expiry. Returns the positions closed by this call.
    ///
    /// Unknown instruments are a no-op.
    pub async fn refresh_price(&self, symbol: &str, update: PriceUpdate) -> Vec<Position> {
        let Some(book) = self.book(symbol).await else {
            return Vec::new();
        };
        let expiry = self.config.expiry();

        let closed = {
            let mut positions = book.lock().await;
            let mut closed = Vec::new();
            let mut still_open = Vec::with_capacity(positions.len());
            for mut position in positions.drain(..) {
                position.mark(update.price);
                let reason = if update.reversal == Some(position.direction().opposite()) {
                    Some(CloseReason::TrendReversal)
                } else if position.take_profit_hit(update.price) {
                    Some(CloseReason::TakeProfit)
                } else if position.stop_loss_hit(update.price) {
                    Some(CloseReason::StopLoss)
                } else if position.expired(update.at, expiry) {
                    Some(CloseReason::Expired)
                } else {
                    None
                };

                match reason {
                    Some(reason) => match position.close(reason, update.price, update.at) {
                        Ok(()) => closed.push(position),
                        Err(e) => {
                            warn!(instrument = %symbol, error = %e, "Close rejected");
                            still_open.push(position);
                        }
                    },
                    None => still_open.push(position),
                }
            }
            *positions = still_open;
            closed
        };
        drop(book);

        self.finalize(symbol, &closed).await;
        closed
    }

    /// Move the levels of the `direction` position on `symbol` to `targets`
    /// when they are strictly more favourable. Returns the updated position.
    pub async fn reinforce(
        &self,
        symbol: &str,
        direction: Direction,
        targets: Targets,
    ) -> Option<Position> {
        let book = self.book(symbol).await?;
        let updated = {
            let mut positions = book.lock().await;
            let position = positions
                .iter_mut()
                .find(|p| p.direction() == direction && p.improves_on(targets))?;
            if let Err(e) = position.retarget(targets) {
                warn!(instrument = %symbol, error = %e, "Retarget rejected");
                return None;
            }
            position.clone()
        };

        info!(
            instrument = %symbol,
            direction = %direction,
            take_profit = updated.take_profit,
            stop_loss = updated.stop_loss,
            "Position levels extended"
        );
        self.publish(SignalEvent::SignalUpdated(updated.clone()));
        Some(updated)
    }

    /// Close every open position on `symbol` at `price`.
    ///
    /// Closing an instrument with nothing open is a no-op, so repeated calls
    /// leave state exactly as after the first.
    pub async fn close(&self, symbol: &str, reason: CloseReason, price: f64) -> Vec<Position> {
        self.close_all(symbol, reason, Some(price)).await
    }

    /// Operator-triggered close at each position's last marked price.
    pub async fn manual_close(&self, symbol: &str) -> Vec<Position> {
        self.close_all(symbol, CloseReason::Manual, None).await
    }

    // ─── Queries ─────────────────────────────────────────────────────────────

    /// Immutable copy of all open positions, keyed by instrument.
    pub async fn snapshot(&self) -> HashMap<String, Vec<Position>> {
        let books: Vec<(String, Book)> = {
            let map = self.books.read().await;
            map.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
        };
        let mut out = HashMap::with_capacity(books.len());
        for (symbol, book) in books {
            let positions = book.lock().await.clone();
            if !positions.is_empty() {
                out.insert(symbol, positions);
            }
        }
        out
    }

    /// Open positions on one instrument.
    pub async fn positions(&self, symbol: &str) -> Vec<Position> {
        match self.book(symbol).await {
            Some(book) => book.lock().await.clone(),
            None => Vec::new(),
        }
    }

    pub async fn open_count(&self) -> usize {
        self.snapshot().await.values().map(Vec::len).sum()
    }

    // ─── Internals ───────────────────────────────────────────────────────────

    async fn book(&self, symbol: &str) -> Option<Book> {
        self.books.read().await.get(symbol).cloned()
    }

    async fn book_or_insert(&self, symbol: &str) -> Book {
        if let Some(book) = self.book(symbol).await {
            return book;
        }
        self.books
            .write()
            .await
            .entry(symbol.to_string())
            .or_default()
            .clone()
    }

    async fn close_all(
        &self,
        symbol: &str,
        reason: CloseReason,
        price: Option<f64>,
    ) -> Vec<Position> {
        let Some(book) = self.book(symbol).await else {
            return Vec::new();
        };
        let now = Utc::now();

        let closed = {
            let mut positions = book.lock().await;
            let mut closed = Vec::new();
            for mut position in positions.drain(..) {
                let at = price.unwrap_or(position.current_price);
                match position.close(reason, at, now) {
                    Ok(()) => closed.push(position),
                    Err(e) => warn!(instrument = %symbol, error = %e, "Close rejected"),
                }
            }
            closed
        };
        drop(book);

        self.finalize(symbol, &closed).await;
        closed
    }

    /// Record and announce closed positions, then drop the instrument's book
    /// if nothing else references it.
    async fn finalize(&self, symbol: &str, closed: &[Position]) {
        if closed.is_empty() {
            return;
        }
        for position in closed {
            info!(
                instrument = %symbol,
                direction = %position.direction(),
                reason = ?position.close_reason,
                close_price = ?position.close_price,
                pnl = position.unrealized_pnl,
                "Position closed"
            );
            if let Err(e) = self.history.record(position).await {
                warn!(instrument = %symbol, error = %e, "Failed to record closed position");
            }
            self.publish(SignalEvent::SignalClosed(position.clone()));
        }
        self.prune(symbol).await;
    }

    async fn prune(&self, symbol: &str) {
        let mut map = self.books.write().await;
        let idle = match map.get(symbol) {
            // Only the map holds the book, so no caller can be mid-operation on it.
            Some(book) if Arc::strong_count(book) == 1 => {
                book.try_lock().map(|p| p.is_empty()).unwrap_or(false)
            }
            _ => false,
        };
        if idle {
            map.remove(symbol);
        }
    }

    fn publish(&self, event: SignalEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::time::Duration as StdDuration;

    use history::MemoryTradeLog;

    use super::*;

    fn signal(symbol: &str, direction: Direction, entry: f64, tp: f64, sl: f64) -> Signal {
        Signal::new(
            symbol,
            direction,
            entry,
            Targets {
                take_profit: tp,
                stop_loss: sl,
            },
            70.0,
            Utc::now(),
            "test",
        )
        .unwrap()
    }

    fn long(symbol: &str) -> Signal {
        signal(symbol, Direction::Long, 100.0, 102.0, 99.0)
    }

    fn short(symbol: &str) -> Signal {
        signal(symbol, Direction::Short, 100.0, 98.0, 101.0)
    }

    fn tracker(config: TrackerConfig) -> (PositionTracker, Arc<MemoryTradeLog>) {
        let log = Arc::new(MemoryTradeLog::new());
        (PositionTracker::new(config, log.clone()), log)
    }

    #[tokio::test]
    async fn take_profit_round_trip() {
        let (tracker, log) = tracker(TrackerConfig::default());
        let mut events = tracker.subscribe();

        let opened = tracker.open(long("BTCUSDT")).await.unwrap();
        assert!(opened.is_open());

        let closed = tracker
            .refresh_price("BTCUSDT", PriceUpdate::new(102.5, Utc::now()))
            .await;
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].close_reason, Some(CloseReason::TakeProfit));
        assert!(closed[0].unrealized_pnl > 0.0);
        assert!(tracker.snapshot().await.is_empty());
        assert_eq!(log.len().await, 1);

        let first = tokio::time::timeout(StdDuration::from_secs(1), events.recv())
            .await
            .expect("timeout")
            .expect("channel closed");
        assert!(matches!(first, SignalEvent::SignalOpened(_)));
        let second = tokio::time::timeout(StdDuration::from_secs(1), events.recv())
            .await
            .expect("timeout")
            .expect("channel closed");
        assert!(matches!(second, SignalEvent::SignalClosed(_)));
    }

    #[tokio::test]
    async fn reversal_outranks_take_profit() {
        let (tracker, _log) = tracker(TrackerConfig::default());
        tracker.open(long("BTCUSDT")).await.unwrap();

        let update = PriceUpdate::new(102.5, Utc::now()).with_reversal(Direction::Short);
        let closed = tracker.refresh_price("BTCUSDT", update).await;
        assert_eq!(closed[0].close_reason, Some(CloseReason::TrendReversal));
    }

    #[tokio::test]
    async fn same_direction_reversal_does_not_close() {
        let (tracker, _log) = tracker(TrackerConfig::default());
        tracker.open(long("BTCUSDT")).await.unwrap();

        let update = PriceUpdate::new(100.5, Utc::now()).with_reversal(Direction::Long);
        assert!(tracker.refresh_price("BTCUSDT", update).await.is_empty());
        let open = tracker.positions("BTCUSDT").await;
        assert!((open[0].current_price - 100.5).abs() < 1e-9);
        assert!(open[0].unrealized_pnl > 0.0);
    }

    #[tokio::test]
    async fn stop_loss_closes_short() {
        let (tracker, _log) = tracker(TrackerConfig::default());
        tracker.open(short("ETHUSDT")).await.unwrap();

        let closed = tracker
            .refresh_price("ETHUSDT", PriceUpdate::new(101.2, Utc::now()))
            .await;
        assert_eq!(closed[0].close_reason, Some(CloseReason::StopLoss));
        assert!(closed[0].unrealized_pnl < 0.0);
    }

    #[tokio::test]
    async fn expiry_closes_stale_position() {
        let (tracker, _log) = tracker(TrackerConfig::default());
        tracker.open(long("BTCUSDT")).await.unwrap();

        let later = Utc::now() + Duration::hours(25);
        let closed = tracker
            .refresh_price("BTCUSDT", PriceUpdate::new(100.2, later))
            .await;
        assert_eq!(closed[0].close_reason, Some(CloseReason::Expired));
        assert_eq!(closed[0].closed_at, Some(later));
    }

    #[tokio::test]
    async fn cap_rejects_extra_position() {
        let (tracker, _log) = tracker(TrackerConfig::default());
        tracker.open(long("BTCUSDT")).await.unwrap();

        let err = tracker.open(short("BTCUSDT")).await.unwrap_err();
        assert_eq!(err, RejectionReason::InstrumentCapReached { max: 1 });
        assert_eq!(tracker.open_count().await, 1);
    }

    #[tokio::test]
    async fn duplicate_direction_rejected_below_cap() {
        let (tracker, _log) = tracker(TrackerConfig {
            max_trades_per_symbol: 3,
            ..TrackerConfig::default()
        });
        tracker.open(long("BTCUSDT")).await.unwrap();
        let err = tracker.open(long("BTCUSDT")).await.unwrap_err();
        assert_eq!(err, RejectionReason::DirectionAlreadyOpen(Direction::Long));

        // The opposite side is still allowed.
        tracker.open(short("BTCUSDT")).await.unwrap();
        assert_eq!(tracker.positions("BTCUSDT").await.len(), 2);
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (tracker, log) = tracker(TrackerConfig::default());
        tracker.open(long("BTCUSDT")).await.unwrap();

        let first = tracker.close("BTCUSDT", CloseReason::Manual, 100.4).await;
        assert_eq!(first.len(), 1);
        let after_first = tracker.snapshot().await;

        let second = tracker.close("BTCUSDT", CloseReason::StopLoss, 90.0).await;
        assert!(second.is_empty());
        assert_eq!(tracker.snapshot().await, after_first);
        assert_eq!(log.len().await, 1);
    }

    #[tokio::test]
    async fn manual_close_uses_last_mark() {
        let (tracker, _log) = tracker(TrackerConfig::default());
        tracker.open(long("BTCUSDT")).await.unwrap();
        tracker
            .refresh_price("BTCUSDT", PriceUpdate::new(101.0, Utc::now()))
            .await;

        let closed = tracker.manual_close("BTCUSDT").await;
        assert_eq!(closed[0].close_reason, Some(CloseReason::Manual));
        assert_eq!(closed[0].close_price, Some(101.0));
    }

    #[tokio::test]
    async fn reinforce_only_moves_levels_forward() {
        let (tracker, _log) = tracker(TrackerConfig::default());
        tracker.open(long("BTCUSDT")).await.unwrap();
        let mut events = tracker.subscribe();

        let worse = Targets {
            take_profit: 103.0,
            stop_loss: 98.0,
        };
        assert!(tracker
            .reinforce("BTCUSDT", Direction::Long, worse)
            .await
            .is_none());

        let better = Targets {
            take_profit: 104.0,
            stop_loss: 99.5,
        };
        let updated = tracker
            .reinforce("BTCUSDT", Direction::Long, better)
            .await
            .unwrap();
        assert_eq!(updated.targets(), better);
        // The originating signal keeps its levels.
        assert_eq!(updated.signal.take_profit, 102.0);

        let event = tokio::time::timeout(StdDuration::from_secs(1), events.recv())
            .await
            .expect("timeout")
            .expect("channel closed");
        assert!(matches!(event, SignalEvent::SignalUpdated(_)));

        // Price that would have hit the old take-profit no longer closes it.
        assert!(tracker
            .refresh_price("BTCUSDT", PriceUpdate::new(102.5, Utc::now()))
            .await
            .is_empty());
    }

    #[tokio::test]
    async fn unknown_instrument_is_noop() {
        let (tracker, log) = tracker(TrackerConfig::default());
        assert!(tracker
            .refresh_price("NOPEUSDT", PriceUpdate::new(1.0, Utc::now()))
            .await
            .is_empty());
        assert!(tracker.manual_close("NOPEUSDT").await.is_empty());
        assert!(log.is_empty().await);
    }

    #[tokio::test]
    async fn concurrent_opens_respect_cap() {
        let (tracker, _log) = tracker(TrackerConfig::default());
        let tracker = Arc::new(tracker);
        let mut handles = Vec::new();
        for _ in 0..16 {
            let t = tracker.clone();
            handles.push(tokio::spawn(async move { t.open(long("BTCUSDT")).await }));
        }
        let mut accepted = 0;
        for h in handles {
            if h.await.unwrap().is_ok() {
                accepted += 1;
            }
        }
        assert_eq!(accepted, 1);
        assert_eq!(tracker.open_count().await, 1);
    }

    #[test]
    fn config_validation() {
        assert!(TrackerConfig::default().validate().is_ok());
        let bad = TrackerConfig {
            max_trades_per_symbol: 0,
            ..TrackerConfig::default()
        };
        assert!(bad.validate().is_err());
    }
}
