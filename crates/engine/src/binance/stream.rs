use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use futures_util::StreamExt;
use serde::Deserialize;
use tokio::sync::{broadcast, RwLock};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use url::Url;

use common::{Error, PriceTick, Result};

use crate::connection::{Backoff, ConnectionEvent, ConnectionState};

const MARK_PRICE_URL: &str = "wss://fstream.binance.com/ws/!markPrice@arr@1s";

/// No frame for this long means the link is dead even if TCP says otherwise.
pub const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(30);

/// All-market mark-price stream for Binance futures.
///
/// Publishes one [`PriceTick`] per symbol per second on a broadcast channel
/// and reconnects with exponential backoff. The connection state is shared
/// so the dashboard can report it.
pub struct MarkPriceStream {
    url: String,
    tick_tx: broadcast::Sender<PriceTick>,
    state: Arc<RwLock<ConnectionState>>,
    heartbeat: Duration,
}

impl MarkPriceStream {
    pub fn new(tick_tx: broadcast::Sender<PriceTick>) -> Self {
        Self {
            url: MARK_PRICE_URL.to_string(),
            tick_tx,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            heartbeat: HEARTBEAT_TIMEOUT,
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    pub fn state_handle(&self) -> Arc<RwLock<ConnectionState>> {
        self.state.clone()
    }

    /// Run the stream loop forever, reconnecting on failure.
    /// Call this inside a `tokio::spawn`.
    pub async fn run(self) {
        let mut backoff = Backoff::default();

        loop {
            self.transition(ConnectionEvent::Dial).await;
            info!(url = %self.url, "Connecting to mark-price stream");
            match self.connect_once(&mut backoff).await {
                Ok(()) => {
                    info!("Mark-price stream closed cleanly");
                    self.transition(ConnectionEvent::Lost).await;
                    // Clean close (e.g. 24h session end): reconnect promptly
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
                Err(e) => {
                    self.transition(ConnectionEvent::Lost).await;
                    let delay = backoff.next_delay();
                    warn!(error = %e, backoff = ?delay, "Mark-price stream error, reconnecting");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn connect_once(&self, backoff: &mut Backoff) -> Result<()> {
        let url = Url::parse(&self.url).map_err(|e| Error::WebSocket(e.to_string()))?;
        let (ws_stream, _) = connect_async(url)
            .await
            .map_err(|e| Error::WebSocket(e.to_string()))?;

        self.transition(ConnectionEvent::Established).await;
        backoff.reset();
        info!("Mark-price stream connected");

        let (_, mut read) = ws_stream.split();
        loop {
            let next = match tokio::time::timeout(self.heartbeat, read.next()).await {
                Ok(next) => next,
                Err(_) => {
                    self.transition(ConnectionEvent::HeartbeatMissed).await;
                    return Err(Error::WebSocket(format!(
                        "no message within {}s",
                        self.heartbeat.as_secs()
                    )));
                }
            };
            let Some(msg) = next else {
                return Ok(());
            };
            let msg = msg.map_err(|e| Error::WebSocket(e.to_string()))?;

            match msg {
                Message::Text(text) => match parse_mark_prices(&text) {
                    Ok(ticks) => {
                        for tick in ticks {
                            // Ignore send errors (no active receivers)
                            let _ = self.tick_tx.send(tick);
                        }
                    }
                    Err(e) => warn!(error = %e, "Failed to parse mark-price frame"),
                },
                Message::Close(frame) => {
                    debug!(?frame, "Mark-price stream sent close frame");
                    return Ok(());
                }
                _ => {}
            }
        }
    }

    async fn transition(&self, event: ConnectionEvent) {
        let mut state = self.state.write().await;
        let from = *state;
        let next = from.on(event);
        if next != from {
            debug!(from = %from, to = %next, "Mark-price stream state change");
            *state = next;
        }
    }
}

// ─── Mark-price JSON parsing ─────────────────────────────────────────────────

#[derive(Deserialize)]
struct MarkPriceUpdate {
    #[serde(rename = "e")]
    event: String,
    #[serde(rename = "E")]
    event_time_ms: i64,
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "p")]
    mark_price: String,
}

/// Parse an array frame of `markPriceUpdate` events. Entries that are not
/// mark-price updates or carry an unusable price are skipped.
pub(crate) fn parse_mark_prices(text: &str) -> Result<Vec<PriceTick>> {
    let updates: Vec<MarkPriceUpdate> = serde_json::from_str(text)?;
    Ok(updates
        .into_iter()
        .filter(|u| u.event == "markPriceUpdate")
        .filter_map(|u| {
            let price = u.mark_price.parse::<f64>().ok().filter(|p| *p > 0.0)?;
            let timestamp: DateTime<Utc> = Utc
                .timestamp_millis_opt(u.event_time_ms)
                .single()
                .unwrap_or_else(Utc::now);
            Some(PriceTick {
                symbol: u.symbol,
                price,
                timestamp,
            })
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_mark_price_array() {
        let text = r#"[
            {"e": "markPriceUpdate", "E": 1562305380000, "s": "BTCUSDT", "p": "11794.15000000",
             "i": "11784.62659091", "P": "11784.25641265", "r": "0.00038167", "T": 1562306400000},
            {"e": "markPriceUpdate", "E": 1562305380000, "s": "ETHUSDT", "p": "0",
             "i": "1", "P": "1", "r": "0", "T": 1562306400000}
        ]"#;
        let ticks = parse_mark_prices(text).unwrap();
        assert_eq!(ticks.len(), 1);
        assert_eq!(ticks[0].symbol, "BTCUSDT");
        assert!((ticks[0].price - 11794.15).abs() < 1e-9);
        assert_eq!(ticks[0].timestamp.timestamp_millis(), 1_562_305_380_000);
    }

    #[test]
    fn non_array_frame_is_error() {
        assert!(parse_mark_prices(r#"{"result": null, "id": 1}"#).is_err());
    }

    #[tokio::test]
    async fn unreachable_endpoint_leaves_state_disconnected() {
        let (tx, _rx) = broadcast::channel(8);
        let stream = MarkPriceStream::new(tx).with_url("ws://127.0.0.1:9/ws");
        let state = stream.state_handle();
        let mut backoff = Backoff::default();

        stream.transition(ConnectionEvent::Dial).await;
        assert_eq!(*state.read().await, ConnectionState::Connecting);
        assert!(stream.connect_once(&mut backoff).await.is_err());
        stream.transition(ConnectionEvent::Lost).await;
        assert_eq!(*state.read().await, ConnectionState::Disconnected);
    }
}
