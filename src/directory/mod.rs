//! Conversation directory: owns conversation records and participant
//! rosters.
//!
//! Participant mutations are read-modify-write over the conversation
//! record, so they are serialized per conversation id; mutations to
//! different conversations proceed independently.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

use crate::error::{Error, Result};
use crate::messages::{MessageClock, MESSAGES};
use crate::models::{
    Conversation, ConversationSummary, ConversationType, Message, MessageType, Participant,
    ParticipantRole,
};
use crate::presence::PresenceTracker;
use crate::store::DocumentStore;

pub const CONVERSATIONS: &str = "conversations";

/// Sender id stamped on system messages.
pub const SYSTEM_SENDER: &str = "system";

#[derive(Debug, Clone, Default)]
pub struct ConversationFilters {
    pub conversation_type: Option<ConversationType>,
    pub is_active: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct Pagination {
    pub limit: usize,
    /// Opaque conversation id; results resume strictly after it.
    pub cursor: Option<String>,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            limit: 50,
            cursor: None,
        }
    }
}

/// Result of a roster mutation: the updated conversation plus the system
/// message emitted for it, if any.
#[derive(Debug, Clone)]
pub struct DirectoryChange {
    pub conversation: Conversation,
    pub system_message: Option<Message>,
}

pub struct ConversationDirectory {
    store: Arc<dyn DocumentStore>,
    presence: Arc<PresenceTracker>,
    clock: Arc<MessageClock>,
    mutation_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ConversationDirectory {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        presence: Arc<PresenceTracker>,
        clock: Arc<MessageClock>,
    ) -> Self {
        Self {
            store,
            presence,
            clock,
            mutation_locks: Mutex::new(HashMap::new()),
        }
    }

    /// One mutation in flight per conversation id at a time.
    async fn lock_for(&self, conversation_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.mutation_locks.lock().await;
        locks
            .entry(conversation_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    pub async fn create_conversation(
        &self,
        conversation_type: ConversationType,
        participant_ids: &[String],
        metadata: Value,
    ) -> Result<DirectoryChange> {
        if participant_ids.is_empty() {
            return Err(Error::Validation(
                "conversation requires at least one participant".to_string(),
            ));
        }

        let mut conversation = Conversation::new(conversation_type, metadata);
        for (index, identity) in participant_ids.iter().enumerate() {
            if conversation.is_participant(identity) {
                continue; // unique by identity
            }
            let role = if index == 0 {
                ParticipantRole::Admin
            } else {
                ParticipantRole::Member
            };
            conversation.participants.push(Participant::new(identity, role));
        }

        // Entity- and opportunity-scoped conversations open with a notice.
        let system_message = match conversation_type {
            ConversationType::Direct => None,
            ConversationType::Entity | ConversationType::Opportunity => Some(
                self.emit_system_message(&mut conversation, "conversation created".to_string())
                    .await?,
            ),
        };

        self.store
            .create(
                CONVERSATIONS,
                &conversation.id,
                serde_json::to_value(&conversation)?,
            )
            .await?;

        for participant in &conversation.participants {
            self.presence
                .init(&participant.identity, &conversation.id)
                .await;
        }

        info!(
            "[Directory] Created {:?} conversation {} with {} participants",
            conversation_type,
            conversation.id,
            conversation.participants.len()
        );

        Ok(DirectoryChange {
            conversation,
            system_message,
        })
    }

    /// Conversations the identity participates in, ordered by last activity
    /// descending, each annotated with a derived unread count.
    pub async fn list_conversations(
        &self,
        identity: &str,
        filters: ConversationFilters,
        pagination: Pagination,
    ) -> Result<Vec<ConversationSummary>> {
        let mut conversations: Vec<Conversation> = self
            .store
            .query(CONVERSATIONS)
            .await?
            .into_iter()
            .filter_map(|doc| serde_json::from_value(doc).ok())
            .filter(|c: &Conversation| c.is_participant(identity))
            .filter(|c| {
                filters
                    .conversation_type
                    .map(|t| c.conversation_type == t)
                    .unwrap_or(true)
            })
            .filter(|c| filters.is_active.map(|a| c.is_active == a).unwrap_or(true))
            .collect();

        conversations.sort_by(|a, b| {
            b.last_activity
                .cmp(&a.last_activity)
                .then_with(|| a.id.cmp(&b.id))
        });

        let start = match &pagination.cursor {
            Some(cursor) => conversations
                .iter()
                .position(|c| &c.id == cursor)
                .map(|pos| pos + 1)
                .unwrap_or(0),
            None => 0,
        };

        let page: Vec<Conversation> = conversations
            .into_iter()
            .skip(start)
            .take(pagination.limit)
            .collect();

        // Unread counts are computed per request over the message log.
        let mut by_conversation: HashMap<String, Vec<Message>> = HashMap::new();
        for doc in self.store.query(MESSAGES).await? {
            if let Ok(message) = serde_json::from_value::<Message>(doc) {
                by_conversation
                    .entry(message.conversation_id.clone())
                    .or_default()
                    .push(message);
            }
        }

        Ok(page
            .into_iter()
            .map(|conversation| {
                let unread_count = conversation
                    .participant(identity)
                    .map(|participant| {
                        unread_count(
                            participant,
                            by_conversation
                                .get(&conversation.id)
                                .map(Vec::as_slice)
                                .unwrap_or(&[]),
                        )
                    })
                    .unwrap_or(0);
                ConversationSummary {
                    conversation,
                    unread_count,
                }
            })
            .collect())
    }

    /// Load without an access check. Crate-internal composition only.
    pub(crate) async fn load(&self, conversation_id: &str) -> Result<Conversation> {
        let doc = self
            .store
            .get(CONVERSATIONS, conversation_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("conversation {}", conversation_id)))?;
        Ok(serde_json::from_value(doc)?)
    }

    pub async fn get_conversation(
        &self,
        conversation_id: &str,
        identity: &str,
    ) -> Result<Conversation> {
        let conversation = self.load(conversation_id).await?;
        if !conversation.is_participant(identity) {
            return Err(Error::AccessDenied {
                identity: identity.to_string(),
                conversation_id: conversation_id.to_string(),
            });
        }
        Ok(conversation)
    }

    pub async fn add_participant(
        &self,
        conversation_id: &str,
        identity: &str,
        role: ParticipantRole,
    ) -> Result<DirectoryChange> {
        let lock = self.lock_for(conversation_id).await;
        let _guard = lock.lock().await;

        let mut conversation = self.load(conversation_id).await?;
        if conversation.is_participant(identity) {
            return Err(Error::Validation(format!(
                "{} is already a participant",
                identity
            )));
        }

        conversation
            .participants
            .push(Participant::new(identity, role));
        let system_message = self
            .emit_system_message(
                &mut conversation,
                format!("{} joined the conversation", identity),
            )
            .await?;
        self.save(&conversation).await?;
        self.presence.init(identity, conversation_id).await;

        info!("[Directory] {} joined {}", identity, conversation_id);

        Ok(DirectoryChange {
            conversation,
            system_message: Some(system_message),
        })
    }

    pub async fn remove_participant(
        &self,
        conversation_id: &str,
        identity: &str,
    ) -> Result<DirectoryChange> {
        let lock = self.lock_for(conversation_id).await;
        let _guard = lock.lock().await;

        let mut conversation = self.load(conversation_id).await?;
        if !conversation.is_participant(identity) {
            return Err(Error::Validation(format!(
                "{} is not a participant",
                identity
            )));
        }

        conversation.participants.retain(|p| p.identity != identity);
        let system_message = self
            .emit_system_message(
                &mut conversation,
                format!("{} left the conversation", identity),
            )
            .await?;
        self.save(&conversation).await?;
        self.presence.remove(identity, conversation_id).await;

        info!("[Directory] {} left {}", identity, conversation_id);

        Ok(DirectoryChange {
            conversation,
            system_message: Some(system_message),
        })
    }

    /// Set the participant's read position to now. Idempotent.
    pub async fn mark_read(&self, conversation_id: &str, identity: &str) -> Result<Conversation> {
        let lock = self.lock_for(conversation_id).await;
        let _guard = lock.lock().await;

        let mut conversation = self.load(conversation_id).await?;
        let participant = conversation
            .participants
            .iter_mut()
            .find(|p| p.identity == identity)
            .ok_or_else(|| Error::AccessDenied {
                identity: identity.to_string(),
                conversation_id: conversation_id.to_string(),
            })?;
        participant.last_read_at = Some(chrono::Utc::now());
        self.save(&conversation).await?;
        Ok(conversation)
    }

    /// Bump last activity after a message write.
    pub(crate) async fn touch_activity(
        &self,
        conversation_id: &str,
        timestamp: chrono::DateTime<chrono::Utc>,
    ) -> Result<()> {
        let lock = self.lock_for(conversation_id).await;
        let _guard = lock.lock().await;

        let mut conversation = self.load(conversation_id).await?;
        if timestamp > conversation.last_activity {
            conversation.last_activity = timestamp;
            self.save(&conversation).await?;
        }
        Ok(())
    }

    /// Every conversation the identity participates in.
    pub async fn conversations_for(&self, identity: &str) -> Result<Vec<Conversation>> {
        Ok(self
            .store
            .query(CONVERSATIONS)
            .await?
            .into_iter()
            .filter_map(|doc| serde_json::from_value(doc).ok())
            .filter(|c: &Conversation| c.is_participant(identity))
            .collect())
    }

    async fn save(&self, conversation: &Conversation) -> Result<()> {
        self.store
            .update(
                CONVERSATIONS,
                &conversation.id,
                serde_json::to_value(conversation)?,
            )
            .await?;
        Ok(())
    }

    /// Append a system notice to the conversation's message log and carry
    /// its timestamp onto last_activity.
    async fn emit_system_message(
        &self,
        conversation: &mut Conversation,
        content: String,
    ) -> Result<Message> {
        let timestamp = self.clock.next(&conversation.id).await;
        let message = Message::new(&conversation.id, SYSTEM_SENDER, content, timestamp)
            .with_message_type(MessageType::System);
        self.store
            .create(MESSAGES, &message.id, serde_json::to_value(&message)?)
            .await?;
        conversation.last_activity = timestamp;
        Ok(message)
    }
}

/// Unread count: messages newer than the participant's read position and
/// not authored by them. All messages count if the position is unset.
pub fn unread_count(participant: &Participant, messages: &[Message]) -> usize {
    messages
        .iter()
        .filter(|m| m.sender_id != participant.identity)
        .filter(|m| match participant.last_read_at {
            Some(last_read) => m.timestamp > last_read,
            None => true,
        })
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;

    fn directory() -> ConversationDirectory {
        ConversationDirectory::new(
            Arc::new(MemoryStore::new()),
            Arc::new(PresenceTracker::new()),
            Arc::new(MessageClock::new()),
        )
    }

    fn ids(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn create_assigns_roles_and_presence() {
        let directory = directory();
        let change = directory
            .create_conversation(ConversationType::Direct, &ids(&["a", "b"]), json!({}))
            .await
            .unwrap();

        let conversation = &change.conversation;
        assert_eq!(conversation.participants.len(), 2);
        assert_eq!(
            conversation.participant("a").unwrap().role,
            ParticipantRole::Admin
        );
        assert_eq!(
            conversation.participant("b").unwrap().role,
            ParticipantRole::Member
        );
        assert!(change.system_message.is_none());
    }

    #[tokio::test]
    async fn create_rejects_empty_participants() {
        let directory = directory();
        let result = directory
            .create_conversation(ConversationType::Direct, &[], json!({}))
            .await;
        assert!(matches!(result, Err(Error::Validation(_))));
    }

    #[tokio::test]
    async fn create_dedupes_participants() {
        let directory = directory();
        let change = directory
            .create_conversation(ConversationType::Direct, &ids(&["a", "b", "a"]), json!({}))
            .await
            .unwrap();
        assert_eq!(change.conversation.participants.len(), 2);
    }

    #[tokio::test]
    async fn entity_conversations_open_with_system_message() {
        let directory = directory();
        let change = directory
            .create_conversation(ConversationType::Entity, &ids(&["a"]), json!({}))
            .await
            .unwrap();
        let message = change.system_message.unwrap();
        assert_eq!(message.message_type, MessageType::System);
        assert_eq!(message.sender_id, SYSTEM_SENDER);
    }

    #[tokio::test]
    async fn get_denies_non_participants() {
        let directory = directory();
        let change = directory
            .create_conversation(ConversationType::Direct, &ids(&["a", "b"]), json!({}))
            .await
            .unwrap();

        let result = directory
            .get_conversation(&change.conversation.id, "c")
            .await;
        assert!(matches!(result, Err(Error::AccessDenied { .. })));
    }

    #[tokio::test]
    async fn get_missing_is_not_found() {
        let directory = directory();
        let result = directory.get_conversation("nope", "a").await;
        assert!(matches!(result, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn add_rejects_duplicates_remove_rejects_strangers() {
        let directory = directory();
        let change = directory
            .create_conversation(ConversationType::Direct, &ids(&["a", "b"]), json!({}))
            .await
            .unwrap();
        let id = change.conversation.id;

        let result = directory
            .add_participant(&id, "a", ParticipantRole::Member)
            .await;
        assert!(matches!(result, Err(Error::Validation(_))));

        let result = directory.remove_participant(&id, "c").await;
        assert!(matches!(result, Err(Error::Validation(_))));

        let change = directory
            .add_participant(&id, "c", ParticipantRole::Observer)
            .await
            .unwrap();
        assert!(change.conversation.is_participant("c"));
        assert!(change.system_message.is_some());

        // No duplicates ever.
        let identities: Vec<_> = change
            .conversation
            .participants
            .iter()
            .map(|p| p.identity.clone())
            .collect();
        let mut deduped = identities.clone();
        deduped.dedup();
        assert_eq!(identities, deduped);
    }

    #[tokio::test]
    async fn list_orders_by_activity_and_pages_by_cursor() {
        let directory = directory();
        let mut created = Vec::new();
        for _ in 0..3 {
            let change = directory
                .create_conversation(ConversationType::Direct, &ids(&["a", "b"]), json!({}))
                .await
                .unwrap();
            created.push(change.conversation.id.clone());
            // Strictly order activity between creations.
            directory
                .touch_activity(created.last().unwrap(), chrono::Utc::now())
                .await
                .unwrap();
        }

        let first_page = directory
            .list_conversations(
                "a",
                ConversationFilters::default(),
                Pagination {
                    limit: 2,
                    cursor: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(first_page.len(), 2);

        let cursor = first_page.last().unwrap().conversation.id.clone();
        let second_page = directory
            .list_conversations(
                "a",
                ConversationFilters::default(),
                Pagination {
                    limit: 2,
                    cursor: Some(cursor),
                },
            )
            .await
            .unwrap();
        assert_eq!(second_page.len(), 1);

        let mut seen: Vec<_> = first_page
            .iter()
            .chain(second_page.iter())
            .map(|s| s.conversation.id.clone())
            .collect();
        seen.sort();
        let mut expected = created.clone();
        expected.sort();
        assert_eq!(seen, expected);
    }

    #[tokio::test]
    async fn list_excludes_non_participant_conversations() {
        let directory = directory();
        directory
            .create_conversation(ConversationType::Direct, &ids(&["a", "b"]), json!({}))
            .await
            .unwrap();
        directory
            .create_conversation(ConversationType::Direct, &ids(&["b", "c"]), json!({}))
            .await
            .unwrap();

        let listed = directory
            .list_conversations("a", ConversationFilters::default(), Pagination::default())
            .await
            .unwrap();
        assert_eq!(listed.len(), 1);
    }

    #[test]
    fn unread_count_matches_definition() {
        use chrono::{Duration, Utc};

        let now = Utc::now();
        let mut participant = Participant::new("a", ParticipantRole::Member);
        let messages = vec![
            Message::new("c1", "b", "one", now - Duration::seconds(30)),
            Message::new("c1", "b", "two", now - Duration::seconds(10)),
            Message::new("c1", "a", "mine", now - Duration::seconds(5)),
        ];

        // Unset read position: everything from others counts.
        assert_eq!(unread_count(&participant, &messages), 2);

        participant.last_read_at = Some(now - Duration::seconds(20));
        assert_eq!(unread_count(&participant, &messages), 1);

        participant.last_read_at = Some(now);
        assert_eq!(unread_count(&participant, &messages), 0);

        // Never negative, zero with no messages.
        assert_eq!(unread_count(&participant, &[]), 0);
    }
}
