use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    middleware,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use common::Position;

use crate::{auth::require_auth, AppState};

const DEFAULT_TRADES_LIMIT: i64 = 50;
const MAX_TRADES_LIMIT: i64 = 500;

pub fn api_router(state: AppState) -> Router<AppState> {
    Router::new()
        .route("/api/positions", get(get_positions))
        .route("/api/positions/:instrument/close", post(close_position))
        .route("/api/report", get(get_report))
        .route("/api/trades", get(get_trades))
        .route_layer(middleware::from_fn_with_state(state, require_auth))
}

// ─── Positions ───────────────────────────────────────────────────────────────

async fn get_positions(State(state): State<AppState>) -> Json<Value> {
    let mut positions: Vec<Position> = state
        .engine
        .open_positions()
        .await
        .into_values()
        .flatten()
        .collect();
    positions.sort_by(|a, b| a.symbol().cmp(b.symbol()).then(a.opened_at.cmp(&b.opened_at)));

    let unrealized: f64 = positions.iter().map(|p| p.unrealized_pnl).sum();
    Json(json!({
        "positions": positions,
        "total_open": positions.len(),
        "unrealized_pnl_usd": unrealized,
    }))
}

async fn close_position(
    State(state): State<AppState>,
    Path(instrument): Path<String>,
) -> (StatusCode, Json<Value>) {
    let symbol = instrument.to_uppercase();
    let closed = state.engine.request_manual_close(&symbol).await;
    if closed.is_empty() {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({"error": format!("no open positions on {symbol}")})),
        );
    }
    info!(instrument = %symbol, count = closed.len(), "Positions closed from dashboard");
    (StatusCode::OK, Json(json!({ "closed": closed })))
}

// ─── Scan report ─────────────────────────────────────────────────────────────

async fn get_report(State(state): State<AppState>) -> Json<Value> {
    let engine_state = state.engine.state().await;
    let report = state.engine.last_report().await;
    Json(json!({
        "engine": engine_state,
        "report": report,
    }))
}

// ─── Trades ──────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct TradesQuery {
    limit: Option<i64>,
}

async fn get_trades(
    State(state): State<AppState>,
    Query(q): Query<TradesQuery>,
) -> (StatusCode, Json<Value>) {
    let limit = q
        .limit
        .unwrap_or(DEFAULT_TRADES_LIMIT)
        .clamp(1, MAX_TRADES_LIMIT) as usize;

    match state.history.recent(limit).await {
        Ok(trades) => {
            let realized: f64 = trades.iter().map(|t| t.unrealized_pnl).sum();
            let wins = trades.iter().filter(|t| t.unrealized_pnl > 0.0).count();
            let win_rate = if trades.is_empty() {
                0.0
            } else {
                wins as f64 / trades.len() as f64
            };
            (
                StatusCode::OK,
                Json(json!({
                    "trades": trades,
                    "count": trades.len(),
                    "limit": limit,
                    "realized_pnl_usd": realized,
                    "win_rate": win_rate,
                })),
            )
        }
        Err(e) => {
            warn!(error = %e, "Trade history query failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({"error": "trade history unavailable"})),
            )
        }
    }
}
