//! Delivery orchestrator.
//!
//! Composes the directory, message store, presence tracker, and
//! subscription registry for the send, read-receipt, typing, and
//! connection lifecycle paths. Collaborators are constructor-injected;
//! notification dispatch is best-effort and never fails a send.

use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::warn;

use crate::directory::{ConversationDirectory, DirectoryChange};
use crate::error::Result;
use crate::gateway::{Envelope, EventKind};
use crate::messages::MessageStore;
use crate::models::{Attachment, Conversation, Message, MessageType, ParticipantRole};
use crate::notify::NotificationDispatcher;
use crate::presence::PresenceTracker;
use crate::registry::{ConnectionHandle, SubscriptionRegistry};

pub struct DeliveryOrchestrator {
    directory: Arc<ConversationDirectory>,
    messages: Arc<MessageStore>,
    presence: Arc<PresenceTracker>,
    registry: Arc<SubscriptionRegistry>,
    notifier: Arc<dyn NotificationDispatcher>,
    typing_quiet_window: Duration,
    presence_grace_period: Duration,
    /// Generation per (conversation, identity); a fresh typing signal
    /// invalidates the pending auto-stop.
    typing_generations: parking_lot::Mutex<HashMap<String, u64>>,
}

fn typing_key(conversation_id: &str, identity: &str) -> String {
    format!("{}:{}", conversation_id, identity)
}

impl DeliveryOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        directory: Arc<ConversationDirectory>,
        messages: Arc<MessageStore>,
        presence: Arc<PresenceTracker>,
        registry: Arc<SubscriptionRegistry>,
        notifier: Arc<dyn NotificationDispatcher>,
        typing_quiet_window: Duration,
        presence_grace_period: Duration,
    ) -> Self {
        Self {
            directory,
            messages,
            presence,
            registry,
            notifier,
            typing_quiet_window,
            presence_grace_period,
            typing_generations: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    /// Create a conversation and bind every participant to its channel so
    /// fan-out (and offline queuing) starts immediately.
    pub async fn create_conversation(
        &self,
        conversation_type: crate::models::ConversationType,
        participant_ids: &[String],
        metadata: serde_json::Value,
    ) -> Result<Conversation> {
        let change = self
            .directory
            .create_conversation(conversation_type, participant_ids, metadata)
            .await?;
        self.bind_participants(&change.conversation).await;
        self.publish_system_message(&change).await;
        Ok(change.conversation)
    }

    pub async fn add_participant(
        &self,
        conversation_id: &str,
        actor: &str,
        identity: &str,
        role: ParticipantRole,
    ) -> Result<Conversation> {
        // Roster changes are participant-only territory.
        self.directory.get_conversation(conversation_id, actor).await?;
        let change = self
            .directory
            .add_participant(conversation_id, identity, role)
            .await?;
        self.registry
            .subscribe(identity, &change.conversation.channel())
            .await;
        self.publish_system_message(&change).await;
        Ok(change.conversation)
    }

    pub async fn remove_participant(
        &self,
        conversation_id: &str,
        actor: &str,
        identity: &str,
    ) -> Result<Conversation> {
        self.directory.get_conversation(conversation_id, actor).await?;
        let change = self
            .directory
            .remove_participant(conversation_id, identity)
            .await?;
        self.registry
            .unsubscribe(identity, &change.conversation.channel())
            .await;
        self.publish_system_message(&change).await;
        Ok(change.conversation)
    }

    /// The send path: persist, bump activity, fan out, then best-effort
    /// notification dispatch. A failed send never silently succeeds; a
    /// failed notification never fails the send.
    pub async fn send_message(
        self: &Arc<Self>,
        conversation_id: &str,
        sender_id: &str,
        content: &str,
        reply_to: Option<String>,
        attachments: Vec<Attachment>,
    ) -> Result<Message> {
        let message = self
            .messages
            .append(
                conversation_id,
                sender_id,
                content,
                MessageType::Text,
                reply_to,
                attachments,
            )
            .await?;

        let conversation = self.directory.load(conversation_id).await?;
        let envelope = Envelope::new(
            EventKind::MessageReceived,
            serde_json::to_value(&message)?,
        );
        let outcome = self.registry.publish(&conversation.channel(), envelope).await;

        // Anything that reached a live connection counts as delivered.
        for identity in &outcome.delivered {
            if identity == sender_id {
                continue;
            }
            if let Err(e) = self
                .messages
                .mark_delivered(&[message.id.clone()], identity)
                .await
            {
                warn!("[Orchestrator] mark_delivered for {} failed: {}", identity, e);
            }
        }

        let recipients: Vec<String> = conversation
            .participants
            .iter()
            .map(|p| p.identity.clone())
            .filter(|identity| identity != sender_id)
            .collect();
        let notifier = self.notifier.clone();
        let (conv_id, msg_id) = (conversation.id.clone(), message.id.clone());
        tokio::spawn(async move {
            if let Err(e) = notifier.dispatch(&conv_id, &msg_id, &recipients).await {
                warn!("[Orchestrator] Notification dispatch failed: {}", e);
            }
        });

        Ok(message)
    }

    /// The read-receipt path: transition messages, move the reader's
    /// position, and tell the other participants.
    pub async fn mark_read(
        &self,
        conversation_id: &str,
        identity: &str,
        message_ids: &[String],
    ) -> Result<Vec<Message>> {
        let conversation = self
            .directory
            .get_conversation(conversation_id, identity)
            .await?;
        let updated = self.messages.mark_read(message_ids, identity).await?;
        self.directory.mark_read(conversation_id, identity).await?;

        let read_ids: Vec<&str> = updated.iter().map(|m| m.id.as_str()).collect();
        self.registry
            .publish(
                &conversation.channel(),
                Envelope::new(
                    EventKind::MessagesRead,
                    json!({
                        "conversation_id": conversation_id,
                        "reader": identity,
                        "message_ids": read_ids,
                    }),
                ),
            )
            .await;

        Ok(updated)
    }

    /// Typing signal with the automatic quiet-window stop. A fresh typing
    /// signal within the window resets it; an explicit stop cancels it.
    pub async fn set_typing(
        self: &Arc<Self>,
        conversation_id: &str,
        identity: &str,
        is_typing: bool,
    ) -> Result<()> {
        let conversation = self
            .directory
            .get_conversation(conversation_id, identity)
            .await?;

        self.presence
            .set_typing(identity, conversation_id, is_typing)
            .await;

        let generation = {
            let mut generations = self.typing_generations.lock();
            let counter = generations.entry(typing_key(conversation_id, identity)).or_insert(0);
            *counter += 1;
            *counter
        };

        let channel = conversation.channel();
        self.publish_typing(&channel, conversation_id, identity, is_typing)
            .await;

        if is_typing {
            let this = self.clone();
            let (conv, who, chan) = (
                conversation_id.to_string(),
                identity.to_string(),
                channel,
            );
            tokio::spawn(async move {
                sleep(this.typing_quiet_window).await;
                let still_current = {
                    let generations = this.typing_generations.lock();
                    generations.get(&typing_key(&conv, &who)) == Some(&generation)
                };
                if still_current {
                    this.presence.set_typing(&who, &conv, false).await;
                    this.publish_typing(&chan, &conv, &who, false).await;
                }
            });
        }

        Ok(())
    }

    async fn publish_typing(
        &self,
        channel: &str,
        conversation_id: &str,
        identity: &str,
        is_typing: bool,
    ) {
        self.registry
            .publish(
                channel,
                Envelope::new(
                    EventKind::UserTyping,
                    json!({
                        "conversation_id": conversation_id,
                        "identity": identity,
                        "is_typing": is_typing,
                    }),
                ),
            )
            .await;
    }

    /// Register a fresh connection: replay the identity's queued events,
    /// mark replayed messages delivered, and flip presence online across
    /// its conversations.
    pub async fn register_connection(&self, handle: ConnectionHandle) -> Result<usize> {
        let identity = handle.identity.clone();

        // Participants stay bound to their conversation channels; this
        // covers identities that subscribed before this process started.
        let conversations = self.directory.conversations_for(&identity).await?;
        for conversation in &conversations {
            self.registry
                .subscribe(&identity, &conversation.channel())
                .await;
        }

        let drained = self.registry.connect(handle).await;
        self.mark_drained_delivered(&identity, &drained).await;

        for conversation in &conversations {
            self.presence.set_online(&identity, &conversation.id, true).await;
            self.registry
                .publish(
                    &conversation.channel(),
                    Envelope::new(
                        EventKind::PresenceChanged,
                        json!({
                            "conversation_id": conversation.id,
                            "identity": identity,
                            "is_online": true,
                        }),
                    ),
                )
                .await;
        }

        Ok(drained.len())
    }

    /// Drop a connection. Subscriptions survive; presence flips offline
    /// only after the grace period, and only if no reconnect happened.
    pub async fn unregister_connection(self: &Arc<Self>, identity: &str, connection_id: &str) {
        let was_last = self.registry.disconnect(identity, connection_id).await;
        if !was_last {
            return;
        }

        let this = self.clone();
        let identity = identity.to_string();
        tokio::spawn(async move {
            sleep(this.presence_grace_period).await;
            if this.registry.has_connection(&identity).await {
                return; // reconnected within the window
            }
            this.presence.set_offline_everywhere(&identity).await;
            let Ok(conversations) = this.directory.conversations_for(&identity).await else {
                return;
            };
            for conversation in conversations {
                this.registry
                    .publish(
                        &conversation.channel(),
                        Envelope::new(
                            EventKind::PresenceChanged,
                            json!({
                                "conversation_id": conversation.id,
                                "identity": identity,
                                "is_online": false,
                            }),
                        ),
                    )
                    .await;
            }
        });
    }

    /// Polling fallback: hand back the identity's queued events.
    pub async fn poll(&self, identity: &str) -> Vec<Envelope> {
        let drained = self.registry.drain_queued(identity).await;
        self.mark_drained_delivered(identity, &drained).await;
        drained
    }

    async fn mark_drained_delivered(&self, identity: &str, drained: &[Envelope]) {
        for envelope in drained {
            if envelope.kind != EventKind::MessageReceived {
                continue;
            }
            let Some(message_id) = envelope.payload.get("id").and_then(|v| v.as_str()) else {
                continue;
            };
            if let Err(e) = self
                .messages
                .mark_delivered(&[message_id.to_string()], identity)
                .await
            {
                warn!(
                    "[Orchestrator] mark_delivered after replay for {} failed: {}",
                    identity, e
                );
            }
        }
    }

    async fn bind_participants(&self, conversation: &Conversation) {
        for participant in &conversation.participants {
            self.registry
                .subscribe(&participant.identity, &conversation.channel())
                .await;
        }
    }

    async fn publish_system_message(&self, change: &DirectoryChange) {
        let Some(message) = &change.system_message else {
            return;
        };
        let Ok(payload) = serde_json::to_value(message) else {
            return;
        };
        self.registry
            .publish(
                &change.conversation.channel(),
                Envelope::new(EventKind::MessageReceived, payload),
            )
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::MessageClock;
    use crate::models::{ConversationType, MessageStatus};
    use crate::notify::LogOnlyDispatcher;
    use crate::store::{DocumentStore, MemoryStore};
    use serde_json::json;
    use tokio::sync::mpsc;

    fn build() -> (
        Arc<DeliveryOrchestrator>,
        Arc<SubscriptionRegistry>,
        Arc<MessageStore>,
        Arc<PresenceTracker>,
    ) {
        let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
        let clock = Arc::new(MessageClock::new());
        let presence = Arc::new(PresenceTracker::new());
        let directory = Arc::new(ConversationDirectory::new(
            store.clone(),
            presence.clone(),
            clock.clone(),
        ));
        let messages = Arc::new(MessageStore::new(
            store,
            directory.clone(),
            clock,
            4096,
        ));
        let registry = Arc::new(SubscriptionRegistry::default());
        let orchestrator = Arc::new(DeliveryOrchestrator::new(
            directory,
            messages.clone(),
            presence.clone(),
            registry.clone(),
            Arc::new(LogOnlyDispatcher),
            Duration::from_millis(100),
            Duration::from_millis(100),
        ));
        (orchestrator, registry, messages, presence)
    }

    fn handle_for(
        identity: &str,
        connection_id: &str,
    ) -> (ConnectionHandle, mpsc::UnboundedReceiver<Envelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = ConnectionHandle {
            id: connection_id.to_string(),
            identity: identity.to_string(),
            sender: tx,
        };
        (handle, rx)
    }

    async fn next_of_kind(
        rx: &mut mpsc::UnboundedReceiver<Envelope>,
        kind: EventKind,
    ) -> Envelope {
        loop {
            let envelope = rx.recv().await.expect("channel closed");
            if envelope.kind == kind {
                return envelope;
            }
        }
    }

    #[tokio::test]
    async fn offline_recipient_gets_queued_then_delivered_on_connect() {
        let (orchestrator, registry, messages, _) = build();
        let conversation = orchestrator
            .create_conversation(
                ConversationType::Direct,
                &["a".to_string(), "b".to_string()],
                json!({}),
            )
            .await
            .unwrap();

        let sent = orchestrator
            .send_message(&conversation.id, "a", "hi", None, vec![])
            .await
            .unwrap();
        assert_eq!(sent.status, MessageStatus::Sent);
        assert_eq!(registry.queued_len("b").await, 1);

        // B connects; the queued event replays and the message flips to
        // delivered.
        let (handle, mut rx) = handle_for("b", "conn-b");
        orchestrator.register_connection(handle).await.unwrap();

        let envelope = next_of_kind(&mut rx, EventKind::MessageReceived).await;
        assert_eq!(envelope.payload["content"], "hi");
        assert_eq!(
            messages.get(&sent.id).await.unwrap().status,
            MessageStatus::Delivered
        );

        // Exactly one message_received event for it.
        assert_eq!(registry.queued_len("b").await, 0);

        // Read receipt completes the state machine.
        orchestrator
            .mark_read(&conversation.id, "b", &[sent.id.clone()])
            .await
            .unwrap();
        assert_eq!(
            messages.get(&sent.id).await.unwrap().status,
            MessageStatus::Read
        );
    }

    #[tokio::test]
    async fn read_receipts_fan_out_to_other_participants() {
        let (orchestrator, _, _, _) = build();
        let conversation = orchestrator
            .create_conversation(
                ConversationType::Direct,
                &["a".to_string(), "b".to_string()],
                json!({}),
            )
            .await
            .unwrap();

        let (handle_a, mut rx_a) = handle_for("a", "conn-a");
        orchestrator.register_connection(handle_a).await.unwrap();

        let sent = orchestrator
            .send_message(&conversation.id, "a", "hi", None, vec![])
            .await
            .unwrap();

        orchestrator
            .mark_read(&conversation.id, "b", &[sent.id.clone()])
            .await
            .unwrap();

        let envelope = next_of_kind(&mut rx_a, EventKind::MessagesRead).await;
        assert_eq!(envelope.payload["reader"], "b");
        assert_eq!(envelope.payload["message_ids"][0], sent.id);
    }

    #[tokio::test(start_paused = true)]
    async fn typing_auto_stops_after_quiet_window() {
        let (orchestrator, _, _, presence) = build();
        let conversation = orchestrator
            .create_conversation(
                ConversationType::Direct,
                &["a".to_string(), "b".to_string()],
                json!({}),
            )
            .await
            .unwrap();

        let (handle_b, mut rx_b) = handle_for("b", "conn-b");
        orchestrator.register_connection(handle_b).await.unwrap();

        orchestrator
            .set_typing(&conversation.id, "a", true)
            .await
            .unwrap();

        let envelope = next_of_kind(&mut rx_b, EventKind::UserTyping).await;
        assert_eq!(envelope.payload["is_typing"], true);

        // No further typing signals: the stop arrives on its own.
        let envelope = next_of_kind(&mut rx_b, EventKind::UserTyping).await;
        assert_eq!(envelope.payload["is_typing"], false);
        assert!(!presence.get("a", &conversation.id).await.unwrap().is_typing);
    }

    #[tokio::test(start_paused = true)]
    async fn explicit_stop_cancels_pending_auto_stop() {
        let (orchestrator, _, _, _) = build();
        let conversation = orchestrator
            .create_conversation(
                ConversationType::Direct,
                &["a".to_string(), "b".to_string()],
                json!({}),
            )
            .await
            .unwrap();

        let (handle_b, mut rx_b) = handle_for("b", "conn-b");
        orchestrator.register_connection(handle_b).await.unwrap();

        orchestrator
            .set_typing(&conversation.id, "a", true)
            .await
            .unwrap();
        orchestrator
            .set_typing(&conversation.id, "a", false)
            .await
            .unwrap();

        let first = next_of_kind(&mut rx_b, EventKind::UserTyping).await;
        assert_eq!(first.payload["is_typing"], true);
        let second = next_of_kind(&mut rx_b, EventKind::UserTyping).await;
        assert_eq!(second.payload["is_typing"], false);

        // The stale auto-stop task fires into the void: no third signal.
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn presence_flips_offline_after_grace_period() {
        let (orchestrator, registry, _, presence) = build();
        let conversation = orchestrator
            .create_conversation(
                ConversationType::Direct,
                &["a".to_string(), "b".to_string()],
                json!({}),
            )
            .await
            .unwrap();

        let (handle, _rx) = handle_for("a", "conn-a");
        orchestrator.register_connection(handle).await.unwrap();
        assert!(presence.get("a", &conversation.id).await.unwrap().is_online);

        orchestrator.unregister_connection("a", "conn-a").await;
        // Still online inside the grace period.
        assert!(presence.get("a", &conversation.id).await.unwrap().is_online);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!presence.get("a", &conversation.id).await.unwrap().is_online);
        // Subscriptions survive the disconnect.
        assert!(registry.is_subscribed("a", &conversation.channel()).await);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_within_grace_keeps_presence_online() {
        let (orchestrator, _, _, presence) = build();
        let conversation = orchestrator
            .create_conversation(
                ConversationType::Direct,
                &["a".to_string(), "b".to_string()],
                json!({}),
            )
            .await
            .unwrap();

        let (handle, _rx) = handle_for("a", "conn-a");
        orchestrator.register_connection(handle).await.unwrap();
        orchestrator.unregister_connection("a", "conn-a").await;

        // Reconnect before the grace period elapses.
        let (handle, _rx2) = handle_for("a", "conn-a2");
        orchestrator.register_connection(handle).await.unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(presence.get("a", &conversation.id).await.unwrap().is_online);
    }

    #[tokio::test]
    async fn send_from_non_participant_is_denied() {
        let (orchestrator, _, _, _) = build();
        let conversation = orchestrator
            .create_conversation(
                ConversationType::Direct,
                &["a".to_string(), "b".to_string()],
                json!({}),
            )
            .await
            .unwrap();

        let result = orchestrator
            .send_message(&conversation.id, "c", "hi", None, vec![])
            .await;
        assert!(matches!(
            result,
            Err(crate::error::Error::AccessDenied { .. })
        ));
    }
}
