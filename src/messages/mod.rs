//! Append-only message log and delivery state machine.
//!
//! Message append is conflict-free: always a new record, ordered by a
//! per-conversation strictly increasing timestamp. Status moves
//! sent -> delivered -> read only; backward transitions are no-ops.

use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

use crate::directory::ConversationDirectory;
use crate::error::{Error, Result};
use crate::models::{Attachment, Message, MessageStatus, MessageType};
use crate::store::DocumentStore;

pub const MESSAGES: &str = "messages";

/// Per-conversation monotonic timestamp source. Wall-clock time, nudged
/// forward when two writes land within the same instant.
pub struct MessageClock {
    last: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl MessageClock {
    pub fn new() -> Self {
        Self {
            last: Mutex::new(HashMap::new()),
        }
    }

    pub async fn next(&self, conversation_id: &str) -> DateTime<Utc> {
        let mut last = self.last.lock().await;
        let now = Utc::now();
        let timestamp = match last.get(conversation_id) {
            Some(prev) if now <= *prev => *prev + Duration::milliseconds(1),
            _ => now,
        };
        last.insert(conversation_id.to_string(), timestamp);
        timestamp
    }
}

impl Default for MessageClock {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageDirection {
    #[default]
    Older,
    Newer,
}

#[derive(Debug, Clone, Default)]
pub struct MessagePage {
    pub limit: usize,
    /// Message id the page anchors on.
    pub cursor: Option<String>,
    pub direction: PageDirection,
}

pub struct MessageStore {
    store: Arc<dyn DocumentStore>,
    directory: Arc<ConversationDirectory>,
    clock: Arc<MessageClock>,
    max_message_len: usize,
}

impl MessageStore {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        directory: Arc<ConversationDirectory>,
        clock: Arc<MessageClock>,
        max_message_len: usize,
    ) -> Self {
        Self {
            store,
            directory,
            clock,
            max_message_len,
        }
    }

    /// Append a message. The sender must be an active participant; the
    /// conversation's last activity follows the assigned timestamp.
    pub async fn append(
        &self,
        conversation_id: &str,
        sender_id: &str,
        content: &str,
        message_type: MessageType,
        reply_to: Option<String>,
        attachments: Vec<Attachment>,
    ) -> Result<Message> {
        let conversation = self
            .directory
            .get_conversation(conversation_id, sender_id)
            .await?;
        if !conversation.is_active {
            return Err(Error::Validation(format!(
                "conversation {} is not active",
                conversation_id
            )));
        }

        if content.is_empty() {
            return Err(Error::Validation("message content is empty".to_string()));
        }
        if content.len() > self.max_message_len {
            return Err(Error::Validation(format!(
                "message content exceeds {} bytes",
                self.max_message_len
            )));
        }

        if let Some(reply_id) = &reply_to {
            let target = self.get(reply_id).await?;
            if target.conversation_id != conversation_id {
                return Err(Error::Validation(
                    "reply references a message in another conversation".to_string(),
                ));
            }
        }

        let timestamp = self.clock.next(conversation_id).await;
        let message = Message::new(conversation_id, sender_id, content, timestamp)
            .with_message_type(message_type)
            .with_reply_to(reply_to)
            .with_attachments(attachments);

        self.store
            .create(MESSAGES, &message.id, serde_json::to_value(&message)?)
            .await?;
        self.directory
            .touch_activity(conversation_id, timestamp)
            .await?;

        info!(
            "[Messages] {} appended {} to {}",
            sender_id, message.id, conversation_id
        );

        Ok(message)
    }

    pub async fn get(&self, message_id: &str) -> Result<Message> {
        let doc = self
            .store
            .get(MESSAGES, message_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("message {}", message_id)))?;
        Ok(serde_json::from_value(doc)?)
    }

    /// All messages of a conversation, newest first.
    async fn load_conversation(&self, conversation_id: &str) -> Result<Vec<Message>> {
        let mut messages: Vec<Message> = self
            .store
            .query(MESSAGES)
            .await?
            .into_iter()
            .filter_map(|doc| serde_json::from_value(doc).ok())
            .filter(|m: &Message| m.conversation_id == conversation_id)
            .collect();
        messages.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then_with(|| b.id.cmp(&a.id)));
        Ok(messages)
    }

    /// Page through a conversation. Ordered newest-first internally; the
    /// returned page reads oldest-first. The cursor anchors on a message
    /// id and `direction` pages strictly older or strictly newer.
    pub async fn list(
        &self,
        conversation_id: &str,
        identity: &str,
        page: MessagePage,
    ) -> Result<Vec<Message>> {
        self.directory
            .get_conversation(conversation_id, identity)
            .await?;

        let messages = self.load_conversation(conversation_id).await?;
        let mut slice: Vec<Message> = match &page.cursor {
            None => messages.into_iter().take(page.limit).collect(),
            Some(cursor) => {
                let Some(anchor) = messages.iter().position(|m| &m.id == cursor) else {
                    return Err(Error::NotFound(format!("message {}", cursor)));
                };
                match page.direction {
                    PageDirection::Older => messages
                        .into_iter()
                        .skip(anchor + 1)
                        .take(page.limit)
                        .collect(),
                    PageDirection::Newer => {
                        let start = anchor.saturating_sub(page.limit);
                        messages[start..anchor].to_vec()
                    }
                }
            }
        };
        slice.reverse();
        Ok(slice)
    }

    /// Batch sent -> delivered for messages the recipient did not author.
    /// Backward or repeated transitions are no-ops. Returns the messages
    /// actually updated.
    pub async fn mark_delivered(
        &self,
        message_ids: &[String],
        recipient: &str,
    ) -> Result<Vec<Message>> {
        self.transition(message_ids, recipient, MessageStatus::Delivered)
            .await
    }

    /// Batch sent/delivered -> read for messages not authored by identity.
    pub async fn mark_read(&self, message_ids: &[String], identity: &str) -> Result<Vec<Message>> {
        self.transition(message_ids, identity, MessageStatus::Read)
            .await
    }

    async fn transition(
        &self,
        message_ids: &[String],
        identity: &str,
        target: MessageStatus,
    ) -> Result<Vec<Message>> {
        let mut updated = Vec::new();
        for message_id in message_ids {
            let mut message = self.get(message_id).await?;
            if message.sender_id == identity {
                continue; // own messages never transition on your behalf
            }
            if !message.status.can_advance_to(target) {
                continue;
            }
            message.status = target;
            self.store
                .update(MESSAGES, &message.id, serde_json::to_value(&message)?)
                .await?;
            updated.push(message);
        }
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ConversationType;
    use crate::presence::PresenceTracker;
    use crate::store::MemoryStore;
    use serde_json::json;

    async fn fixture() -> (Arc<MessageStore>, String) {
        let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
        let clock = Arc::new(MessageClock::new());
        let directory = Arc::new(ConversationDirectory::new(
            store.clone(),
            Arc::new(PresenceTracker::new()),
            clock.clone(),
        ));
        let messages = Arc::new(MessageStore::new(store, directory.clone(), clock, 4096));
        let change = directory
            .create_conversation(
                ConversationType::Direct,
                &["a".to_string(), "b".to_string()],
                json!({}),
            )
            .await
            .unwrap();
        (messages, change.conversation.id)
    }

    #[tokio::test]
    async fn append_requires_participant() {
        let (messages, conversation_id) = fixture().await;
        let result = messages
            .append(&conversation_id, "stranger", "hi", MessageType::Text, None, vec![])
            .await;
        assert!(matches!(result, Err(Error::AccessDenied { .. })));
    }

    #[tokio::test]
    async fn append_validates_content_and_reply() {
        let (messages, conversation_id) = fixture().await;

        let result = messages
            .append(&conversation_id, "a", "", MessageType::Text, None, vec![])
            .await;
        assert!(matches!(result, Err(Error::Validation(_))));

        let result = messages
            .append(
                &conversation_id,
                "a",
                "hi",
                MessageType::Text,
                Some("missing".to_string()),
                vec![],
            )
            .await;
        assert!(matches!(result, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn reply_must_stay_in_conversation() {
        let (messages, conversation_id) = fixture().await;
        let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
        let clock = Arc::new(MessageClock::new());
        let other_directory = Arc::new(ConversationDirectory::new(
            store.clone(),
            Arc::new(PresenceTracker::new()),
            clock.clone(),
        ));
        let other_messages = MessageStore::new(store, other_directory.clone(), clock, 4096);
        let other = other_directory
            .create_conversation(ConversationType::Direct, &["a".to_string()], json!({}))
            .await
            .unwrap();
        let foreign = other_messages
            .append(&other.conversation.id, "a", "x", MessageType::Text, None, vec![])
            .await
            .unwrap();

        // Same-id message does not exist in the first store at all, which
        // also fails the reference check.
        let result = messages
            .append(
                &conversation_id,
                "a",
                "reply",
                MessageType::Text,
                Some(foreign.id),
                vec![],
            )
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn timestamps_strictly_increase() {
        let (messages, conversation_id) = fixture().await;
        let mut previous = None;
        for n in 0..10 {
            let message = messages
                .append(
                    &conversation_id,
                    "a",
                    &format!("m{}", n),
                    MessageType::Text,
                    None,
                    vec![],
                )
                .await
                .unwrap();
            if let Some(prev) = previous {
                assert!(message.timestamp > prev);
            }
            previous = Some(message.timestamp);
        }
    }

    #[tokio::test]
    async fn status_transitions_are_monotonic_and_idempotent() {
        let (messages, conversation_id) = fixture().await;
        let message = messages
            .append(&conversation_id, "a", "hi", MessageType::Text, None, vec![])
            .await
            .unwrap();
        let ids = vec![message.id.clone()];

        // Sender's own mark is a no-op.
        assert!(messages.mark_delivered(&ids, "a").await.unwrap().is_empty());

        let updated = messages.mark_delivered(&ids, "b").await.unwrap();
        assert_eq!(updated[0].status, MessageStatus::Delivered);

        // Reapplying produces no further change.
        assert!(messages.mark_delivered(&ids, "b").await.unwrap().is_empty());

        let updated = messages.mark_read(&ids, "b").await.unwrap();
        assert_eq!(updated[0].status, MessageStatus::Read);

        // Backward is a no-op, not an error.
        assert!(messages.mark_delivered(&ids, "b").await.unwrap().is_empty());
        assert_eq!(messages.get(&ids[0]).await.unwrap().status, MessageStatus::Read);
    }

    #[tokio::test]
    async fn read_skips_delivered_stage_from_sent() {
        let (messages, conversation_id) = fixture().await;
        let message = messages
            .append(&conversation_id, "a", "hi", MessageType::Text, None, vec![])
            .await
            .unwrap();

        let updated = messages
            .mark_read(&[message.id.clone()], "b")
            .await
            .unwrap();
        assert_eq!(updated[0].status, MessageStatus::Read);
    }

    #[tokio::test]
    async fn list_pages_both_directions() {
        let (messages, conversation_id) = fixture().await;
        let mut appended = Vec::new();
        for n in 0..5 {
            appended.push(
                messages
                    .append(
                        &conversation_id,
                        "a",
                        &format!("m{}", n),
                        MessageType::Text,
                        None,
                        vec![],
                    )
                    .await
                    .unwrap(),
            );
        }

        // No cursor: the newest `limit` messages, oldest-first.
        let page = messages
            .list(
                &conversation_id,
                "a",
                MessagePage {
                    limit: 2,
                    cursor: None,
                    direction: PageDirection::Older,
                },
            )
            .await
            .unwrap();
        assert_eq!(page[0].content, "m3");
        assert_eq!(page[1].content, "m4");

        // Older than m3.
        let page = messages
            .list(
                &conversation_id,
                "a",
                MessagePage {
                    limit: 2,
                    cursor: Some(appended[3].id.clone()),
                    direction: PageDirection::Older,
                },
            )
            .await
            .unwrap();
        assert_eq!(page[0].content, "m1");
        assert_eq!(page[1].content, "m2");

        // Newer than m1.
        let page = messages
            .list(
                &conversation_id,
                "a",
                MessagePage {
                    limit: 2,
                    cursor: Some(appended[1].id.clone()),
                    direction: PageDirection::Newer,
                },
            )
            .await
            .unwrap();
        assert_eq!(page[0].content, "m2");
        assert_eq!(page[1].content, "m3");
    }

    #[tokio::test]
    async fn list_denies_non_participants() {
        let (messages, conversation_id) = fixture().await;
        let result = messages
            .list(&conversation_id, "stranger", MessagePage::default())
            .await;
        assert!(matches!(result, Err(Error::AccessDenied { .. })));
    }

    #[tokio::test]
    async fn clock_is_monotonic_per_conversation() {
        let clock = MessageClock::new();
        let a1 = clock.next("c1").await;
        let a2 = clock.next("c1").await;
        let b1 = clock.next("c2").await;
        assert!(a2 > a1);
        // Independent conversations do not contend.
        assert!(b1 >= a1);
    }
}
