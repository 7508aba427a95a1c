// =============================================================================
// WebSocket Handler — typed event-bus push
// =============================================================================
//
// Clients connect to `/api/status/ws?token=<token>` and receive:
//   1. An immediate full StateSnapshot on connect.
//   2. Every `SystemEvent` published on the event bus from then on, pushed
//      as soon as it happens rather than polled.
//   3. A full snapshot resend every 5s as a keepalive / resync, in case an
//      event was dropped (the bus is a bounded broadcast channel; a slow
//      client can lag behind and miss a send).
//
// The handler also responds to Ping frames with Pong frames and logs a
// Close frame or a receive error as a normal disconnect.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::time::{interval, Duration};
use tracing::{debug, info, warn};

use crate::api::auth::validate_token;
use crate::app_state::AppState;

const RESYNC_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Deserialize)]
pub struct WsQuery {
    token: Option<String>,
}

/// Axum handler for the WebSocket upgrade request. Validates the token
/// from the `?token=` query parameter before upgrading.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(query): Query<WsQuery>,
) -> impl IntoResponse {
    let token = query.token.unwrap_or_default();
    if !validate_token(&token) {
        warn!("websocket connection rejected: invalid token");
        return (
            axum::http::StatusCode::FORBIDDEN,
            "Invalid or missing token",
        )
            .into_response();
    }

    info!("websocket connection accepted — upgrading");
    ws.on_upgrade(move |socket| handle_ws_connection(socket, state))
        .into_response()
}

async fn handle_ws_connection(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();
    let mut events = state.events.subscribe();

    if let Err(e) = send_snapshot(&mut sender, &state).await {
        warn!(error = %e, "failed to send initial websocket snapshot");
        return;
    }

    let mut resync = interval(RESYNC_INTERVAL);
    resync.tick().await; // consume the immediate first tick

    loop {
        tokio::select! {
            event = events.recv() => {
                match event {
                    Ok(envelope) => {
                        if let Err(e) = send_json(&mut sender, &envelope).await {
                            debug!(error = %e, "websocket send failed — disconnecting");
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "websocket subscriber lagged, resyncing with full snapshot");
                        if send_snapshot(&mut sender, &state).await.is_err() {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }

            _ = resync.tick() => {
                if send_snapshot(&mut sender, &state).await.is_err() {
                    break;
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) => {
                        info!("websocket close frame received — disconnecting");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(error = %e, "websocket receive error — disconnecting");
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    info!("websocket connection closed");
}

async fn send_snapshot(
    sender: &mut (impl SinkExt<Message, Error = axum::Error> + Unpin),
    state: &Arc<AppState>,
) -> Result<(), axum::Error> {
    let snapshot = state.build_snapshot();
    send_json(sender, &serde_json::json!({ "type": "Snapshot", "snapshot": snapshot })).await
}

async fn send_json(
    sender: &mut (impl SinkExt<Message, Error = axum::Error> + Unpin),
    value: &impl serde::Serialize,
) -> Result<(), axum::Error> {
    match serde_json::to_string(value) {
        Ok(json) => sender.send(Message::Text(json.into())).await,
        Err(e) => {
            warn!(error = %e, "failed to serialize websocket payload");
            Ok(())
        }
    }
}
