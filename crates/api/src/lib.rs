mod auth;
pub mod routes;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use tokio::sync::RwLock;
use tower_http::compression::CompressionLayer;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use common::TradeHistory;
use engine::{ConnectionState, EngineHandle};

/// Shared application state injected into every route handler.
#[derive(Clone)]
pub struct AppState {
    pub engine: EngineHandle,
    pub history: Arc<dyn TradeHistory>,
    /// Link state of the mark-price stream.
    pub stream_state: Arc<RwLock<ConnectionState>>,
    pub dashboard_token: String,
}

/// Full application router with middleware applied.
pub fn app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_headers(Any)
        .allow_methods(Any);

    Router::new()
        .merge(routes::api_router(state.clone()))
        .merge(routes::ws_router())
        .merge(routes::health_router())
        .with_state(state)
        .layer(CompressionLayer::new())
        .layer(cors)
}

/// Build and run the Axum API server.
pub async fn serve(state: AppState, port: u16) -> common::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "Dashboard API listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use chrono::Utc;
    use common::{
        Candle, Direction, Error, Instrument, MarketDataProvider, OrderBookSnapshot, Result,
        Signal, Targets, Ticker,
    };
    use engine::{Engine, ScanConfig};
    use history::MemoryTradeLog;
    use serde_json::Value;
    use strategy::{SignalConfig, SignalGenerator};
    use tower::ServiceExt;
    use tracker::{PositionTracker, TrackerConfig};

    use super::*;

    const TOKEN: &str = "secret";

    struct OfflineMarket;

    #[async_trait]
    impl MarketDataProvider for OfflineMarket {
        async fn instruments(&self) -> Result<Vec<Instrument>> {
            Err(Error::Http("offline".into()))
        }
        async fn candles(&self, _: &str, _: &str, _: usize) -> Result<Vec<Candle>> {
            Err(Error::Http("offline".into()))
        }
        async fn order_book(&self, _: &str, _: usize) -> Result<OrderBookSnapshot> {
            Err(Error::Http("offline".into()))
        }
        async fn ticker(&self, _: &str) -> Result<Ticker> {
            Err(Error::Http("offline".into()))
        }
    }

    fn state() -> (AppState, Arc<PositionTracker>) {
        let history: Arc<MemoryTradeLog> = Arc::new(MemoryTradeLog::new());
        let tracker = Arc::new(PositionTracker::new(TrackerConfig::default(), history.clone()));
        let (_engine, handle) = Engine::new(
            Arc::new(OfflineMarket),
            SignalGenerator::new(SignalConfig::default()),
            tracker.clone(),
            ScanConfig::default(),
        );
        let state = AppState {
            engine: handle,
            history,
            stream_state: Arc::new(RwLock::new(ConnectionState::Connected)),
            dashboard_token: TOKEN.into(),
        };
        (state, tracker)
    }

    async fn call(state: &AppState, method: &str, uri: &str, token: Option<&str>) -> (StatusCode, Value) {
        let mut req = Request::builder().method(method).uri(uri);
        if let Some(t) = token {
            req = req.header("Authorization", format!("Bearer {t}"));
        }
        let resp = app(state.clone())
            .oneshot(req.body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, body)
    }

    async fn open_btc_long(tracker: &PositionTracker) {
        let signal = Signal::new(
            "BTCUSDT",
            Direction::Long,
            100.0,
            Targets {
                take_profit: 104.0,
                stop_loss: 98.0,
            },
            70.0,
            Utc::now(),
            "test",
        )
        .unwrap();
        tracker.open(signal).await.unwrap();
    }

    #[tokio::test]
    async fn healthz_needs_no_token() {
        let (state, _) = state();
        let (status, body) = call(&state, "GET", "/healthz", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["engine"], "stopped");
        assert_eq!(body["stream"], "connected");
    }

    #[tokio::test]
    async fn api_rejects_missing_or_wrong_token() {
        let (state, _) = state();
        let (status, _) = call(&state, "GET", "/api/positions", None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        let (status, _) = call(&state, "GET", "/api/positions", Some("nope")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn positions_snapshot_lists_open_positions() {
        let (state, tracker) = state();
        open_btc_long(&tracker).await;

        let (status, body) = call(&state, "GET", "/api/positions", Some(TOKEN)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total_open"], 1);
        assert_eq!(body["positions"][0]["signal"]["symbol"], "BTCUSDT");
        assert_eq!(body["positions"][0]["status"], "OPEN");
    }

    #[tokio::test]
    async fn manual_close_moves_position_to_history() {
        let (state, tracker) = state();
        open_btc_long(&tracker).await;

        let (status, _) = call(&state, "POST", "/api/positions/ETHUSDT/close", Some(TOKEN)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) =
            call(&state, "POST", "/api/positions/btcusdt/close", Some(TOKEN)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["closed"][0]["close_reason"], "MANUAL");
        assert_eq!(tracker.open_count().await, 0);

        let (status, body) = call(&state, "GET", "/api/trades?limit=10", Some(TOKEN)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["count"], 1);
        assert_eq!(body["limit"], 10);
    }

    #[tokio::test]
    async fn report_is_null_before_first_cycle() {
        let (state, _) = state();
        let (status, body) = call(&state, "GET", "/api/report", Some(TOKEN)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["engine"], "stopped");
        assert!(body["report"].is_null());
    }

    #[test]
    fn empty_configured_token_never_matches() {
        let (mut state, _) = state();
        assert!(auth::token_matches(&state, Some(TOKEN)));
        assert!(!auth::token_matches(&state, None));
        state.dashboard_token.clear();
        assert!(!auth::token_matches(&state, Some("")));
    }
}
