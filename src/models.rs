use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// A durable conversation thread with an ordered participant roster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    #[serde(rename = "type")]
    pub conversation_type: ConversationType,
    pub participants: Vec<Participant>,
    pub last_activity: DateTime<Utc>,
    pub is_active: bool,
    #[serde(default)]
    pub metadata: Value,
}

impl Conversation {
    pub fn new(conversation_type: ConversationType, metadata: Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            conversation_type,
            participants: Vec::new(),
            last_activity: Utc::now(),
            is_active: true,
            metadata,
        }
    }

    pub fn participant(&self, identity: &str) -> Option<&Participant> {
        self.participants.iter().find(|p| p.identity == identity)
    }

    pub fn is_participant(&self, identity: &str) -> bool {
        self.participant(identity).is_some()
    }

    /// Channel name this conversation fans out on.
    pub fn channel(&self) -> String {
        format!("conversation:{}", self.id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationType {
    Direct,
    Entity,
    Opportunity,
}

/// An identity bound to a conversation with a role and read-position marker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Participant {
    pub identity: String,
    pub role: ParticipantRole,
    pub joined_at: DateTime<Utc>,
    pub last_read_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub is_typing: bool,
    #[serde(default)]
    pub is_online: bool,
}

impl Participant {
    pub fn new(identity: impl Into<String>, role: ParticipantRole) -> Self {
        Self {
            identity: identity.into(),
            role,
            joined_at: Utc::now(),
            last_read_at: None,
            is_typing: false,
            is_online: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantRole {
    Admin,
    Member,
    Observer,
}

/// A single message in the append-only log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub content: String,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub status: MessageStatus,
    pub reply_to: Option<String>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    /// Assigned at write time, authoritative ordering key.
    pub timestamp: DateTime<Utc>,
}

impl Message {
    pub fn new(
        conversation_id: impl Into<String>,
        sender_id: impl Into<String>,
        content: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            conversation_id: conversation_id.into(),
            sender_id: sender_id.into(),
            content: content.into(),
            message_type: MessageType::Text,
            status: MessageStatus::Sent,
            reply_to: None,
            attachments: Vec::new(),
            timestamp,
        }
    }

    pub fn with_message_type(mut self, message_type: MessageType) -> Self {
        self.message_type = message_type;
        self
    }

    pub fn with_reply_to(mut self, reply_to: Option<String>) -> Self {
        self.reply_to = reply_to;
        self
    }

    pub fn with_attachments(mut self, attachments: Vec<Attachment>) -> Self {
        self.attachments = attachments;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    #[default]
    Text,
    System,
}

/// Delivery status. Transitions are one-directional:
/// sent -> delivered -> read. Moving backward is a no-op, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Sent,
    Delivered,
    Read,
}

impl MessageStatus {
    /// Whether moving to `next` is a forward transition.
    pub fn can_advance_to(self, next: MessageStatus) -> bool {
        next > self
    }
}

/// Reference to an externally stored attachment. Blob payloads live with
/// the file-storage collaborator; only the reference travels with the
/// message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    pub id: String,
    pub filename: String,
    pub content_type: String,
    pub size: u64,
}

/// Ephemeral per-(conversation, identity) presence state. Last write wins,
/// no durability guarantee.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub identity: String,
    pub conversation_id: String,
    pub is_online: bool,
    pub is_typing: bool,
    pub last_seen: DateTime<Utc>,
}

impl PresenceRecord {
    pub fn offline(identity: impl Into<String>, conversation_id: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            conversation_id: conversation_id.into(),
            is_online: false,
            is_typing: false,
            last_seen: Utc::now(),
        }
    }
}

/// A conversation annotated with the caller's derived unread count,
/// computed per list-request rather than cached.
#[derive(Debug, Clone, Serialize)]
pub struct ConversationSummary {
    #[serde(flatten)]
    pub conversation: Conversation,
    pub unread_count: usize,
}
