use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::Response,
    routing::get,
    Router,
};
use serde::Deserialize;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use common::SignalEvent;

use crate::auth::{token_matches, unauthorized};
use crate::AppState;

pub fn ws_router() -> Router<AppState> {
    Router::new().route("/ws/events", get(ws_events_handler))
}

#[derive(Deserialize)]
struct WsQuery {
    token: Option<String>,
}

/// Live lifecycle events as JSON text frames.
/// Auth via query param `?token=<DASHBOARD_TOKEN>` (header auth not supported
/// in browser WebSocket API).
async fn ws_events_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(q): Query<WsQuery>,
) -> Response {
    if !token_matches(&state, q.token.as_deref()) {
        return unauthorized();
    }

    // Subscribe before the upgrade so nothing published in between is lost
    let events = state.engine.subscribe_events();
    ws.on_upgrade(move |socket| handle_ws(socket, events))
}

async fn handle_ws(mut socket: WebSocket, mut events: broadcast::Receiver<SignalEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => {
                let text = match serde_json::to_string(&event) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(error = %e, "Failed to encode event for WebSocket");
                        continue;
                    }
                };
                if socket.send(Message::Text(text)).await.is_err() {
                    debug!("WebSocket event client disconnected");
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!(dropped = n, "WebSocket event client lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
