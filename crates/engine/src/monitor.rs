use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use common::PriceTick;
use tracker::{PositionTracker, PriceUpdate};

/// Feeds streamed mark prices into the tracker between scan cycles.
///
/// Runs in every engine state, so take-profit and stop-loss keep firing
/// while scans are paused or stopped.
pub struct PositionMonitor {
    tracker: Arc<PositionTracker>,
    tick_rx: broadcast::Receiver<PriceTick>,
}

impl PositionMonitor {
    pub fn new(tracker: Arc<PositionTracker>, tick_rx: broadcast::Receiver<PriceTick>) -> Self {
        Self { tracker, tick_rx }
    }

    /// Run the monitor loop. Call from `tokio::spawn`.
    pub async fn run(mut self) {
        info!("Position monitor running");
        loop {
            match self.tick_rx.recv().await {
                Ok(tick) => {
                    let closed = self
                        .tracker
                        .refresh_price(&tick.symbol, PriceUpdate::new(tick.price, tick.timestamp))
                        .await;
                    if !closed.is_empty() {
                        debug!(instrument = %tick.symbol, closed = closed.len(), "Closed on price tick");
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "Position monitor lagged, ticks dropped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        warn!("Position monitor: tick channel closed");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::Utc;
    use common::{CloseReason, Direction, Signal, Targets};
    use history::MemoryTradeLog;
    use tracker::TrackerConfig;

    use super::*;

    #[tokio::test]
    async fn tick_through_take_profit_closes_position() {
        let tracker = Arc::new(PositionTracker::new(
            TrackerConfig::default(),
            Arc::new(MemoryTradeLog::new()),
        ));
        let signal = Signal::new(
            "ETHUSDT",
            Direction::Long,
            2000.0,
            Targets {
                take_profit: 2040.0,
                stop_loss: 1980.0,
            },
            72.0,
            Utc::now(),
            "test",
        )
        .unwrap();
        tracker.open(signal).await.unwrap();
        let mut events = tracker.subscribe();

        let (tick_tx, tick_rx) = broadcast::channel(16);
        tokio::spawn(PositionMonitor::new(tracker.clone(), tick_rx).run());

        for (symbol, price) in [("BTCUSDT", 50_000.0), ("ETHUSDT", 2010.0), ("ETHUSDT", 2041.5)] {
            tick_tx
                .send(PriceTick {
                    symbol: symbol.into(),
                    price,
                    timestamp: Utc::now(),
                })
                .unwrap();
        }

        let event = tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .expect("timeout")
            .expect("channel closed");
        let closed = event.position();
        assert_eq!(closed.close_reason, Some(CloseReason::TakeProfit));
        assert_eq!(closed.close_price, Some(2041.5));
        assert_eq!(tracker.open_count().await, 0);
    }
}
