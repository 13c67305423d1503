use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::{info, warn};

use common::{NotificationSink, SignalEvent};

/// Forwards lifecycle events to every notification sink.
///
/// A slow or failing sink only delays delivery; it never feeds back into
/// lifecycle state.
pub struct EventRelay {
    rx: broadcast::Receiver<SignalEvent>,
    sinks: Vec<Arc<dyn NotificationSink>>,
}

impl EventRelay {
    pub fn new(rx: broadcast::Receiver<SignalEvent>) -> Self {
        Self {
            rx,
            sinks: Vec::new(),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Run the relay loop. Call from `tokio::spawn`.
    pub async fn run(mut self) {
        let names: Vec<&str> = self.sinks.iter().map(|s| s.name()).collect();
        info!(sinks = ?names, "Event relay running");
        loop {
            match self.rx.recv().await {
                Ok(event) => {
                    for sink in &self.sinks {
                        sink.publish(&event).await;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "Event relay lagged, notifications dropped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        warn!("Event relay: event channel closed");
    }
}

/// Sink that writes each event to the log.
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    fn name(&self) -> &str {
        "log"
    }

    async fn publish(&self, event: &SignalEvent) {
        let p = event.position();
        match event {
            SignalEvent::SignalOpened(_) => info!(
                instrument = %p.symbol(),
                direction = %p.direction(),
                entry = p.entry(),
                take_profit = p.take_profit,
                stop_loss = p.stop_loss,
                "SIGNAL_OPENED"
            ),
            SignalEvent::SignalUpdated(_) => info!(
                instrument = %p.symbol(),
                take_profit = p.take_profit,
                stop_loss = p.stop_loss,
                "SIGNAL_UPDATED"
            ),
            SignalEvent::SignalClosed(_) => info!(
                instrument = %p.symbol(),
                reason = ?p.close_reason,
                close_price = ?p.close_price,
                pnl = p.unrealized_pnl,
                "SIGNAL_CLOSED"
            ),
        }
    }
}
