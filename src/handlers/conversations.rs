//! Conversation directory routes.

use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::Deserialize;
use serde_json::Value;
use tracing::info;

use crate::config::AppState;
use crate::directory::{ConversationFilters, Pagination};
use crate::error::{Error, Result};
use crate::handlers::Identity;
use crate::models::{Conversation, ConversationSummary, ConversationType, ParticipantRole};

#[derive(Debug, Deserialize)]
pub struct CreateConversationRequest {
    #[serde(rename = "type")]
    pub conversation_type: ConversationType,
    pub participants: Vec<String>,
    #[serde(default)]
    pub metadata: Value,
}

/// POST /conversations
///
/// The caller becomes a participant whether or not they listed themselves.
pub async fn create_conversation(
    State(state): State<AppState>,
    identity: Identity,
    Json(req): Json<CreateConversationRequest>,
) -> Result<Json<Conversation>> {
    if identity.is_anonymous() {
        return Err(Error::AccessDenied {
            identity: identity.identity,
            conversation_id: "(new)".to_string(),
        });
    }
    info!(
        "POST /conversations - {:?} by {}",
        req.conversation_type, identity.identity
    );

    let mut participants = vec![identity.identity.clone()];
    participants.extend(
        req.participants
            .into_iter()
            .filter(|p| p != &identity.identity),
    );

    let conversation = state
        .orchestrator
        .create_conversation(req.conversation_type, &participants, req.metadata)
        .await?;
    Ok(Json(conversation))
}

#[derive(Debug, Default, Deserialize)]
pub struct ListConversationsQuery {
    #[serde(rename = "type")]
    pub conversation_type: Option<ConversationType>,
    pub is_active: Option<bool>,
    pub limit: Option<usize>,
    pub cursor: Option<String>,
}

/// GET /conversations
pub async fn list_conversations(
    State(state): State<AppState>,
    identity: Identity,
    Query(query): Query<ListConversationsQuery>,
) -> Result<Json<Vec<ConversationSummary>>> {
    let filters = ConversationFilters {
        conversation_type: query.conversation_type,
        is_active: query.is_active,
    };
    let pagination = Pagination {
        limit: query.limit.unwrap_or(Pagination::default().limit),
        cursor: query.cursor,
    };
    let summaries = state
        .directory
        .list_conversations(&identity.identity, filters, pagination)
        .await?;
    Ok(Json(summaries))
}

/// GET /conversations/{id}
pub async fn get_conversation(
    Path(conversation_id): Path<String>,
    State(state): State<AppState>,
    identity: Identity,
) -> Result<Json<Conversation>> {
    let conversation = state
        .directory
        .get_conversation(&conversation_id, &identity.identity)
        .await?;
    Ok(Json(conversation))
}

#[derive(Debug, Deserialize)]
pub struct AddParticipantRequest {
    pub identity: String,
    pub role: Option<ParticipantRole>,
}

/// POST /conversations/{id}/participants
pub async fn add_participant(
    Path(conversation_id): Path<String>,
    State(state): State<AppState>,
    identity: Identity,
    Json(req): Json<AddParticipantRequest>,
) -> Result<Json<Conversation>> {
    info!(
        "POST /conversations/{}/participants - {} adds {}",
        conversation_id, identity.identity, req.identity
    );
    let conversation = state
        .orchestrator
        .add_participant(
            &conversation_id,
            &identity.identity,
            &req.identity,
            req.role.unwrap_or(ParticipantRole::Member),
        )
        .await?;
    Ok(Json(conversation))
}

/// DELETE /conversations/{id}/participants/{identity}
pub async fn remove_participant(
    Path((conversation_id, removed)): Path<(String, String)>,
    State(state): State<AppState>,
    identity: Identity,
) -> Result<Json<Conversation>> {
    info!(
        "DELETE /conversations/{}/participants/{} by {}",
        conversation_id, removed, identity.identity
    );
    let conversation = state
        .orchestrator
        .remove_participant(&conversation_id, &identity.identity, &removed)
        .await?;
    Ok(Json(conversation))
}

/// POST /conversations/{id}/read
///
/// Moves the caller's read position to now. Idempotent.
pub async fn mark_conversation_read(
    Path(conversation_id): Path<String>,
    State(state): State<AppState>,
    identity: Identity,
) -> Result<Json<Conversation>> {
    let conversation = state
        .directory
        .mark_read(&conversation_id, &identity.identity)
        .await?;
    Ok(Json(conversation))
}
