//! `GET /ws` push channel.
//!
//! Authentication happens before the upgrade, so a bad token gets a plain
//! 401. After the upgrade the connection is subscribed under the token's
//! subject and receives every event for that owner until it disconnects.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use serde_json::json;
use std::sync::Arc;

use crate::app_state::AppState;
use crate::routes::auth::AuthUser;
use crate::services::fanout::Fanout;

pub async fn push_channel(
    State(state): State<AppState>,
    AuthUser(claims): AuthUser,
    ws: WebSocketUpgrade,
) -> Response {
    let fanout = state.fanout.clone();
    ws.on_upgrade(move |socket| serve_connection(socket, fanout, claims.sub))
}

async fn serve_connection(socket: WebSocket, fanout: Arc<Fanout>, owner_id: String) {
    let mut subscription = fanout.subscribe(&owner_id);
    let (mut sender, mut receiver) = socket.split();
    tracing::info!(owner_id = %owner_id, "Push client connected");

    let joined = json!({"event": "joined", "data": {"owner_id": &owner_id}});
    if sender.send(Message::Text(joined.to_string().into())).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            event = subscription.recv() => {
                let Some(event) = event else { break };
                let frame = match serde_json::to_string(&event) {
                    Ok(frame) => frame,
                    Err(e) => {
                        tracing::error!(error = %e, "Failed to encode push event");
                        continue;
                    }
                };
                if sender.send(Message::Text(frame.into())).await.is_err() {
                    break;
                }
            }
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    if is_ping(text.as_str()) {
                        let pong = json!({
                            "event": "pong",
                            "data": {"timestamp": Utc::now().timestamp_millis()}
                        });
                        if sender.send(Message::Text(pong.to_string().into())).await.is_err() {
                            break;
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::debug!(owner_id = %owner_id, error = %e, "Push connection error");
                    break;
                }
            }
        }
    }

    tracing::info!(owner_id = %owner_id, "Push client disconnected");
}

/// Accepts a bare `ping` or `{"event": "ping"}`.
fn is_ping(text: &str) -> bool {
    let text = text.trim();
    text == "ping"
        || serde_json::from_str::<serde_json::Value>(text)
            .map(|v| v["event"] == "ping")
            .unwrap_or(false)
}
