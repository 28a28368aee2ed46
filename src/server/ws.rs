//! Log channel WebSocket.
//!
//! A client connects, sends `{"requestId": "..."}` and from then on receives
//! `{"logMsg": "..."}` frames for that job. Sending another id rebinds the connection.

use std::sync::Arc;

use axum::Router;
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::logging::{LogBroker, LogChannel};
use crate::workspace::validate_request_id;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BindRequest {
    request_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct LogFrame<'a> {
    log_msg: &'a str,
}

pub fn ws_router(broker: Arc<LogBroker>) -> Router {
    Router::new()
        .route("/ws/", get(upgrade))
        .route("/ws", get(upgrade))
        .with_state(broker)
}

async fn upgrade(ws: WebSocketUpgrade, State(broker): State<Arc<LogBroker>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| log_session(socket, broker))
}

async fn log_session(socket: WebSocket, broker: Arc<LogBroker>) {
    let (mut sink, mut stream) = socket.split();
    let (channel, mut rx) = broker.open_channel();
    let channel_id = channel.id();
    debug!(channel = channel_id, "log channel connected");

    let forward = tokio::spawn(async move {
        while let Some(line) = rx.recv().await {
            let Ok(frame) = serde_json::to_string(&LogFrame { log_msg: &line }) else {
                continue;
            };
            if sink.send(Message::Text(frame)).await.is_err() {
                break;
            }
        }
    });

    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => handle_inbound(&broker, &channel, text.as_bytes()),
            Ok(Message::Binary(bytes)) => handle_inbound(&broker, &channel, &bytes),
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(channel = channel_id, "log channel error: {e}");
                break;
            }
        }
    }

    broker.unbind(channel_id);
    forward.abort();
    debug!(channel = channel_id, "log channel closed");
}

/// Bind `channel` to the request id named in `raw`. Anything unparseable is ignored.
fn handle_inbound(broker: &LogBroker, channel: &LogChannel, raw: &[u8]) {
    let request = match serde_json::from_slice::<BindRequest>(raw) {
        Ok(request) => request,
        Err(e) => {
            warn!(channel = channel.id(), "ignoring malformed log channel message: {e}");
            return;
        }
    };
    if let Err(e) = validate_request_id(&request.request_id) {
        warn!(channel = channel.id(), "ignoring bind request: {e}");
        return;
    }
    broker.bind(request.request_id.clone(), channel.clone());
    broker.relay(
        &request.request_id,
        format!("[WS] Bound to requestId: {}", request.request_id),
    );
}
