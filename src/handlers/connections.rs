//! Connection endpoints: socket, stream, and polling strategies plus
//! channel subscription management.
//!
//! Every strategy speaks the same wire envelope. The socket is push+pull;
//! the stream is push only (clients send through `POST /send`); polling
//! drains the caller's queue on demand.

use axum::{
    body::Body,
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::AppState;
use crate::error::{Error, Result};
use crate::gateway::{Envelope, EventKind};
use crate::handlers::Identity;
use crate::models::Attachment;
use crate::orchestrator::DeliveryOrchestrator;
use crate::registry::ConnectionHandle;

/// GET /ws
pub async fn ws_connect(
    ws: WebSocketUpgrade,
    identity: Identity,
    State(state): State<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, identity, state))
}

async fn handle_socket(socket: WebSocket, identity: Identity, state: AppState) {
    let connection_id = Uuid::new_v4().to_string();
    let (mut ws_tx, mut ws_rx) = socket.split();

    // AUTH goes out before anything else on the connection.
    let auth = Envelope::auth(&identity.identity, &connection_id).with_provider("socket");
    if write_envelope(&mut ws_tx, &auth).await.is_err() {
        return;
    }

    let (tx, mut rx) = mpsc::unbounded_channel();
    let handle = ConnectionHandle {
        id: connection_id.clone(),
        identity: identity.identity.clone(),
        sender: tx,
    };
    if let Err(e) = state.orchestrator.register_connection(handle).await {
        warn!("[Socket] Failed to register {}: {}", identity.identity, e);
        return;
    }
    info!("[Socket] {} connected ({})", identity.identity, connection_id);

    let mut heartbeat = tokio::time::interval(state.config.heartbeat_interval);
    heartbeat.tick().await; // the first tick fires immediately

    loop {
        tokio::select! {
            outbound = rx.recv() => {
                let Some(envelope) = outbound else { break };
                if write_envelope(&mut ws_tx, &envelope).await.is_err() {
                    break;
                }
            }
            _ = heartbeat.tick() => {
                let beat = Envelope::heartbeat().with_provider("socket");
                if write_envelope(&mut ws_tx, &beat).await.is_err() {
                    break;
                }
            }
            inbound = ws_rx.next() => {
                match inbound {
                    Some(Ok(WsMessage::Text(text))) => {
                        match serde_json::from_str::<Envelope>(text.as_str()) {
                            Ok(envelope) => {
                                if let Err(e) = handle_inbound(&state, &identity, envelope).await {
                                    warn!("[Socket] Inbound event from {} failed: {}", identity.identity, e);
                                }
                            }
                            Err(e) => debug!("[Socket] Ignoring malformed frame: {}", e),
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Ok(_)) => {} // ping/pong/binary, nothing to do
                    Some(Err(e)) => {
                        debug!("[Socket] Read error for {}: {}", identity.identity, e);
                        break;
                    }
                }
            }
        }
    }

    info!("[Socket] {} disconnected ({})", identity.identity, connection_id);
    state
        .orchestrator
        .unregister_connection(&identity.identity, &connection_id)
        .await;
}

async fn write_envelope(
    ws_tx: &mut SplitSink<WebSocket, WsMessage>,
    envelope: &Envelope,
) -> std::result::Result<(), axum::Error> {
    let text = serde_json::to_string(envelope).unwrap_or_default();
    ws_tx.send(WsMessage::Text(text.into())).await
}

/// Unregisters the stream connection when the client goes away; dropping
/// the response body is the only disconnect signal a chunked stream gets.
struct StreamGuard {
    orchestrator: Arc<DeliveryOrchestrator>,
    identity: String,
    connection_id: String,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        let orchestrator = self.orchestrator.clone();
        let identity = std::mem::take(&mut self.identity);
        let connection_id = std::mem::take(&mut self.connection_id);
        tokio::spawn(async move {
            info!("[Stream] {} disconnected ({})", identity, connection_id);
            orchestrator
                .unregister_connection(&identity, &connection_id)
                .await;
        });
    }
}

/// GET /stream
///
/// Newline-delimited JSON envelopes: AUTH first, then fan-out events,
/// with a HEARTBEAT at the configured cadence.
pub async fn stream_connect(
    identity: Identity,
    State(state): State<AppState>,
) -> Result<Response> {
    let connection_id = Uuid::new_v4().to_string();
    let (tx, mut rx) = mpsc::unbounded_channel();
    state
        .orchestrator
        .register_connection(ConnectionHandle {
            id: connection_id.clone(),
            identity: identity.identity.clone(),
            sender: tx,
        })
        .await?;
    info!("[Stream] {} connected ({})", identity.identity, connection_id);

    let guard = StreamGuard {
        orchestrator: state.orchestrator.clone(),
        identity: identity.identity.clone(),
        connection_id: connection_id.clone(),
    };
    let heartbeat_interval = state.config.heartbeat_interval;

    let stream = async_stream::stream! {
        let _guard = guard;

        let auth = Envelope::auth(&identity.identity, &connection_id).with_provider("stream");
        yield Ok::<_, Infallible>(ndjson_line(&auth));

        let mut heartbeat = tokio::time::interval(heartbeat_interval);
        heartbeat.tick().await;

        loop {
            tokio::select! {
                outbound = rx.recv() => {
                    let Some(envelope) = outbound else { break };
                    yield Ok(ndjson_line(&envelope));
                }
                _ = heartbeat.tick() => {
                    yield Ok(ndjson_line(&Envelope::heartbeat().with_provider("stream")));
                }
            }
        }
    };

    let response = Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "application/x-ndjson")
        .header("cache-control", "no-cache")
        .header("connection", "keep-alive")
        .body(Body::from_stream(stream))
        .map_err(|e| Error::Internal(e.into()))?;

    Ok(response)
}

fn ndjson_line(envelope: &Envelope) -> String {
    format!("{}\n", serde_json::to_string(envelope).unwrap_or_default())
}

/// GET /poll
///
/// Drains the caller's queued events. Replayed message events count as
/// delivered, same as on a live connection.
pub async fn poll(identity: Identity, State(state): State<AppState>) -> Result<Json<Value>> {
    let events = state.orchestrator.poll(&identity.identity).await;
    debug!(
        "[Poll] {} drained {} events",
        identity.identity,
        events.len()
    );
    Ok(Json(json!({ "events": events })))
}

/// POST /send
///
/// Ingest for push-only strategies: accepts one wire envelope and runs it
/// through the same inbound dispatch as the socket.
pub async fn send_envelope(
    State(state): State<AppState>,
    identity: Identity,
    Json(envelope): Json<Envelope>,
) -> Result<Json<Value>> {
    let result = handle_inbound(&state, &identity, envelope).await?;
    Ok(Json(result))
}

#[derive(Debug, Deserialize)]
pub struct ChannelRequest {
    pub channel: String,
}

const CONVERSATION_CHANNEL_PREFIX: &str = "conversation:";

/// Conversation channels carry private fan-out; only participants may
/// bind to them, and anonymous identities never can. Everything else is
/// a public channel.
async fn authorize_channel(state: &AppState, identity: &Identity, channel: &str) -> Result<()> {
    let Some(conversation_id) = channel.strip_prefix(CONVERSATION_CHANNEL_PREFIX) else {
        return Ok(());
    };
    if identity.is_anonymous() {
        return Err(Error::AccessDenied {
            identity: identity.identity.clone(),
            conversation_id: conversation_id.to_string(),
        });
    }
    state
        .directory
        .get_conversation(conversation_id, &identity.identity)
        .await?;
    Ok(())
}

/// POST /subscribe
pub async fn subscribe(
    State(state): State<AppState>,
    identity: Identity,
    Json(req): Json<ChannelRequest>,
) -> Result<Json<Value>> {
    authorize_channel(&state, &identity, &req.channel).await?;
    state.registry.subscribe(&identity.identity, &req.channel).await;
    Ok(Json(json!({
        "success": true,
        "channel": req.channel,
        "subscribed": true,
    })))
}

/// POST /unsubscribe
///
/// Anonymous identities unsubscribe with the same client token that
/// subscribed; the synthetic identity is derived, not stored.
pub async fn unsubscribe(
    State(state): State<AppState>,
    identity: Identity,
    Json(req): Json<ChannelRequest>,
) -> Result<Json<Value>> {
    state
        .registry
        .unsubscribe(&identity.identity, &req.channel)
        .await;
    Ok(Json(json!({
        "success": true,
        "channel": req.channel,
        "subscribed": false,
    })))
}

#[derive(Debug, Deserialize)]
struct SendPayload {
    conversation_id: String,
    content: String,
    reply_to: Option<String>,
    #[serde(default)]
    attachments: Vec<Attachment>,
}

#[derive(Debug, Deserialize)]
struct ReadPayload {
    conversation_id: String,
    message_ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct TypingPayload {
    conversation_id: String,
    is_typing: bool,
}

/// Dispatch one client-originated envelope. Shared by the socket read
/// loop and `POST /send`.
async fn handle_inbound(
    state: &AppState,
    identity: &Identity,
    envelope: Envelope,
) -> Result<Value> {
    match envelope.kind {
        EventKind::MessageSend => {
            let payload: SendPayload = parse_payload(envelope.payload)?;
            let message = state
                .orchestrator
                .send_message(
                    &payload.conversation_id,
                    &identity.identity,
                    &payload.content,
                    payload.reply_to,
                    payload.attachments,
                )
                .await?;
            Ok(serde_json::to_value(&message)?)
        }
        EventKind::MessagesRead => {
            let payload: ReadPayload = parse_payload(envelope.payload)?;
            let updated = state
                .orchestrator
                .mark_read(
                    &payload.conversation_id,
                    &identity.identity,
                    &payload.message_ids,
                )
                .await?;
            let ids: Vec<&str> = updated.iter().map(|m| m.id.as_str()).collect();
            Ok(json!({ "success": true, "updated": ids }))
        }
        EventKind::UserTyping => {
            let payload: TypingPayload = parse_payload(envelope.payload)?;
            state
                .orchestrator
                .set_typing(
                    &payload.conversation_id,
                    &identity.identity,
                    payload.is_typing,
                )
                .await?;
            Ok(json!({ "success": true }))
        }
        // Client heartbeats just count as traffic.
        EventKind::Heartbeat => Ok(Value::Null),
        other => Err(Error::Validation(format!(
            "event {:?} is not accepted from clients",
            other
        ))),
    }
}

fn parse_payload<T: serde::de::DeserializeOwned>(payload: Value) -> Result<T> {
    serde_json::from_value(payload).map_err(|e| Error::Validation(format!("bad payload: {}", e)))
}

/// GET /health
pub async fn health_check() -> impl IntoResponse {
    "OK - Messaging Core"
}
