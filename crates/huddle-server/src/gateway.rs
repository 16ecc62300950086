//! WebSocket gateway.
//!
//! Decodes inbound frames into actions for the engine and writes the
//! connection's event stream back to the socket. Text frames carry JSON,
//! binary frames length-prefixed MessagePack; replies follow the encoding of
//! the most recent inbound frame.

use crate::handlers::AppState;
use crate::metrics::{self, ConnectionMetricsGuard};
use crate::preview::first_url;
use anyhow::Result;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::IntoResponse,
};
use bytes::BytesMut;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use huddle_core::{ConnId, CoreError};
use huddle_protocol::{codec, codes, Action, Encoding, Event, ProtocolError};
use serde::Deserialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

type Sink = SplitSink<WebSocket, Message>;

/// Query parameters of the WebSocket route.
#[derive(Debug, Default, Deserialize)]
pub struct ConnectParams {
    /// Identify as this user right after connecting.
    #[serde(default, alias = "userId")]
    pub user_id: Option<String>,
}

/// WebSocket upgrade handler.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.max_message_size(state.config.limits.max_frame_size)
        .on_upgrade(move |socket| handle_websocket(socket, state, params))
}

/// Handle a WebSocket connection.
async fn handle_websocket(socket: WebSocket, state: Arc<AppState>, params: ConnectParams) {
    let _metrics_guard = ConnectionMetricsGuard::new();

    let (conn, mut events) = state.engine.connect();
    debug!(connection = conn, "WebSocket connected");

    let (mut sender, mut receiver) = socket.split();
    let mut encoding = Encoding::Json;

    let heartbeat_ms = state.config.heartbeat.interval_ms;
    let connected = Event::connected(conn, u32::try_from(heartbeat_ms).unwrap_or(u32::MAX));
    if send_event(&mut sender, &connected, encoding).await.is_err() {
        error!(connection = conn, "Failed to send Connected event");
        state.engine.disconnected(conn).await;
        return;
    }

    if let Some(user_id) = params.user_id.filter(|id| !id.is_empty()) {
        dispatch(&state, conn, Action::Identify { user_id }, 0).await;
    }

    let mut read_buffer = BytesMut::with_capacity(4096);
    let timeout = Duration::from_millis(state.config.heartbeat.timeout_ms);
    let mut heartbeat = tokio::time::interval(Duration::from_millis(heartbeat_ms.max(1)));
    heartbeat.tick().await;
    let mut last_seen = Instant::now();

    loop {
        tokio::select! {
            biased;

            // Events addressed to this connection
            Some(event) = events.recv() => {
                if send_event(&mut sender, &event, encoding).await.is_err() {
                    break;
                }
            }

            msg = receiver.next() => {
                last_seen = Instant::now();
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        encoding = Encoding::Json;
                        match codec::decode_text::<Action>(&text) {
                            Ok(action) => dispatch(&state, conn, action, text.len()).await,
                            Err(e) => {
                                if reject_frame(&mut sender, conn, &e, encoding).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                    Some(Ok(Message::Binary(data))) => {
                        encoding = Encoding::MessagePack;
                        read_buffer.extend_from_slice(&data);
                        loop {
                            match codec::decode_binary_from::<Action>(&mut read_buffer) {
                                Ok(Some(action)) => dispatch(&state, conn, action, data.len()).await,
                                Ok(None) => break,
                                Err(e) => {
                                    read_buffer.clear();
                                    if reject_frame(&mut sender, conn, &e, encoding).await.is_err() {
                                        return close(&state, conn).await;
                                    }
                                    break;
                                }
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) => {
                        debug!(connection = conn, "Received close frame");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(connection = conn, error = %e, "WebSocket error");
                        metrics::record_error("websocket");
                        break;
                    }
                    None => {
                        debug!(connection = conn, "WebSocket stream ended");
                        break;
                    }
                }
            }

            _ = heartbeat.tick() => {
                if last_seen.elapsed() > timeout {
                    debug!(connection = conn, "Heartbeat timed out");
                    break;
                }
                if sender.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
        }
    }

    close(&state, conn).await;
}

async fn close(state: &AppState, conn: ConnId) {
    state.engine.disconnected(conn).await;
    metrics::set_active_rooms(state.engine.hub().stats().room_count);
    debug!(connection = conn, "WebSocket disconnected");
}

/// Hand an action to the engine. Failures reach the client as error events
/// through the hub.
async fn dispatch(state: &AppState, conn: ConnId, action: Action, bytes: usize) {
    let kind = action.name();
    metrics::record_action(kind, bytes);
    let start = Instant::now();

    let action = attach_preview(state, action).await;
    let is_message = matches!(action, Action::SendMessage { .. });

    match state.engine.dispatch(conn, action).await {
        Ok(()) => {
            if is_message {
                metrics::record_message_created("text");
            }
        }
        Err(CoreError::Unavailable) => {
            error!(connection = conn, action = kind, "Engine unavailable");
            metrics::record_error("unavailable");
        }
        Err(e) if e.is_client_error() => metrics::record_error("rejected"),
        Err(_) => metrics::record_error("internal"),
    }

    metrics::record_latency(start.elapsed().as_secs_f64());
    metrics::set_active_rooms(state.engine.hub().stats().room_count);
}

/// Fill in a link preview for a text message that names a URL and has none.
async fn attach_preview(state: &AppState, action: Action) -> Action {
    match action {
        Action::SendMessage {
            user_id,
            content,
            url_metadata: None,
        } if state.config.previews.enabled => {
            let url_metadata = match first_url(&content) {
                Some(url) => state.previewer.preview(url).await,
                None => None,
            };
            Action::SendMessage {
                user_id,
                content,
                url_metadata,
            }
        }
        other => other,
    }
}

async fn reject_frame(
    sender: &mut Sink,
    conn: ConnId,
    error: &ProtocolError,
    encoding: Encoding,
) -> Result<()> {
    debug!(connection = conn, error = %error, "Undecodable frame");
    metrics::record_error("decode");
    let event = Event::error(codes::VALIDATION, format!("Invalid frame: {error}"));
    send_event(sender, &event, encoding).await
}

/// Send an event to the WebSocket in the given encoding.
async fn send_event(sender: &mut Sink, event: &Event, encoding: Encoding) -> Result<()> {
    let message = match encoding {
        Encoding::Json => Message::Text(codec::encode_text(event)?),
        Encoding::MessagePack => Message::Binary(codec::encode_binary(event)?.to_vec()),
    };
    let len = match &message {
        Message::Text(text) => text.len(),
        Message::Binary(data) => data.len(),
        _ => 0,
    };
    metrics::record_event(event.name(), len);
    sender.send(message).await?;
    Ok(())
}
