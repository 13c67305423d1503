use async_trait::async_trait;

use crate::{Candle, Instrument, OrderBookSnapshot, Position, Result, SignalEvent, Ticker};

/// Read-only market data source.
///
/// `BinanceFuturesClient` implements this against the public futures REST
/// API. Transient failures surface as retryable errors
/// (`Error::is_retryable`); unknown symbols as `Error::NotFound`.
#[async_trait]
pub trait MarketDataProvider: Send + Sync {
    /// Tradeable instruments with their tick size.
    async fn instruments(&self) -> Result<Vec<Instrument>>;

    /// Most recent `limit` candles, oldest first.
    async fn candles(&self, symbol: &str, timeframe: &str, limit: usize) -> Result<Vec<Candle>>;

    async fn order_book(&self, symbol: &str, depth: usize) -> Result<OrderBookSnapshot>;

    async fn ticker(&self, symbol: &str) -> Result<Ticker>;
}

/// Receives lifecycle events. Delivery is fire-and-forget: implementations
/// log their own failures and never report back into the tracker.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    fn name(&self) -> &str;

    async fn publish(&self, event: &SignalEvent);
}

/// Append-only log of closed positions.
#[async_trait]
pub trait TradeHistory: Send + Sync {
    async fn record(&self, position: &Position) -> Result<()>;

    /// Most recently closed first.
    async fn recent(&self, limit: usize) -> Result<Vec<Position>>;
}
