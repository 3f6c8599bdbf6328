//! Message, typing, and presence routes.

use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use crate::config::AppState;
use crate::error::Result;
use crate::handlers::Identity;
use crate::messages::{MessagePage, PageDirection};
use crate::models::{Attachment, Message, PresenceRecord};

#[derive(Debug, Deserialize)]
pub struct SendMessageRequest {
    pub content: String,
    pub reply_to: Option<String>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

/// POST /conversations/{id}/messages
pub async fn send_message(
    Path(conversation_id): Path<String>,
    State(state): State<AppState>,
    identity: Identity,
    Json(req): Json<SendMessageRequest>,
) -> Result<Json<Message>> {
    info!(
        "POST /conversations/{}/messages from {}",
        conversation_id, identity.identity
    );
    let message = state
        .orchestrator
        .send_message(
            &conversation_id,
            &identity.identity,
            &req.content,
            req.reply_to,
            req.attachments,
        )
        .await?;
    Ok(Json(message))
}

#[derive(Debug, Default, Deserialize)]
pub struct ListMessagesQuery {
    pub limit: Option<usize>,
    pub cursor: Option<String>,
    pub direction: Option<PageDirection>,
}

/// GET /conversations/{id}/messages
///
/// Cursor pages anchor on a message id; the page reads oldest-first.
pub async fn list_messages(
    Path(conversation_id): Path<String>,
    State(state): State<AppState>,
    identity: Identity,
    Query(query): Query<ListMessagesQuery>,
) -> Result<Json<Vec<Message>>> {
    let page = MessagePage {
        limit: query.limit.unwrap_or(50),
        cursor: query.cursor,
        direction: query.direction.unwrap_or_default(),
    };
    let messages = state
        .messages
        .list(&conversation_id, &identity.identity, page)
        .await?;
    Ok(Json(messages))
}

#[derive(Debug, Deserialize)]
pub struct MarkReadRequest {
    pub message_ids: Vec<String>,
}

/// POST /conversations/{id}/messages/read
pub async fn mark_messages_read(
    Path(conversation_id): Path<String>,
    State(state): State<AppState>,
    identity: Identity,
    Json(req): Json<MarkReadRequest>,
) -> Result<Json<Value>> {
    let updated = state
        .orchestrator
        .mark_read(&conversation_id, &identity.identity, &req.message_ids)
        .await?;
    let ids: Vec<&str> = updated.iter().map(|m| m.id.as_str()).collect();
    Ok(Json(json!({ "success": true, "updated": ids })))
}

#[derive(Debug, Deserialize)]
pub struct TypingRequest {
    pub is_typing: bool,
}

/// POST /conversations/{id}/typing
///
/// A `true` signal auto-stops after the quiet window unless renewed.
pub async fn send_typing(
    Path(conversation_id): Path<String>,
    State(state): State<AppState>,
    identity: Identity,
    Json(req): Json<TypingRequest>,
) -> Result<Json<Value>> {
    state
        .orchestrator
        .set_typing(&conversation_id, &identity.identity, req.is_typing)
        .await?;
    Ok(Json(json!({ "success": true })))
}

/// GET /conversations/{id}/presence
pub async fn get_presence(
    Path(conversation_id): Path<String>,
    State(state): State<AppState>,
    identity: Identity,
) -> Result<Json<Vec<PresenceRecord>>> {
    state
        .directory
        .get_conversation(&conversation_id, &identity.identity)
        .await?;
    Ok(Json(state.presence.snapshot(&conversation_id).await))
}
