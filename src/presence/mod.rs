//! Ephemeral presence and typing state.
//!
//! Last write wins; staleness is bounded by the heartbeat and typing
//! quiet-window intervals. The tracker owns no timers: the caller emits
//! the automatic "typing stopped" signal when the quiet window elapses.

use crate::models::PresenceRecord;
use chrono::Utc;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;

pub struct PresenceTracker {
    records: RwLock<HashMap<String, PresenceRecord>>,
}

fn key(conversation_id: &str, identity: &str) -> String {
    format!("{}:{}", conversation_id, identity)
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
        }
    }

    /// Seed an offline record for a new participant.
    pub async fn init(&self, identity: &str, conversation_id: &str) {
        let mut records = self.records.write().await;
        records
            .entry(key(conversation_id, identity))
            .or_insert_with(|| PresenceRecord::offline(identity, conversation_id));
    }

    pub async fn remove(&self, identity: &str, conversation_id: &str) {
        let mut records = self.records.write().await;
        records.remove(&key(conversation_id, identity));
    }

    pub async fn set_online(&self, identity: &str, conversation_id: &str, is_online: bool) {
        let mut records = self.records.write().await;
        let record = records
            .entry(key(conversation_id, identity))
            .or_insert_with(|| PresenceRecord::offline(identity, conversation_id));
        record.is_online = is_online;
        if !is_online {
            record.is_typing = false;
        }
        record.last_seen = Utc::now();
        debug!(
            "[Presence] {} in {} online={}",
            identity, conversation_id, is_online
        );
    }

    pub async fn set_typing(&self, identity: &str, conversation_id: &str, is_typing: bool) {
        let mut records = self.records.write().await;
        let record = records
            .entry(key(conversation_id, identity))
            .or_insert_with(|| PresenceRecord::offline(identity, conversation_id));
        record.is_typing = is_typing;
        record.last_seen = Utc::now();
    }

    pub async fn get(&self, identity: &str, conversation_id: &str) -> Option<PresenceRecord> {
        let records = self.records.read().await;
        records.get(&key(conversation_id, identity)).cloned()
    }

    /// All presence records for a conversation.
    pub async fn snapshot(&self, conversation_id: &str) -> Vec<PresenceRecord> {
        let records = self.records.read().await;
        records
            .values()
            .filter(|r| r.conversation_id == conversation_id)
            .cloned()
            .collect()
    }

    /// Flip an identity offline across every conversation it appears in.
    /// Used when its last live connection closes.
    pub async fn set_offline_everywhere(&self, identity: &str) {
        let mut records = self.records.write().await;
        for record in records.values_mut().filter(|r| r.identity == identity) {
            record.is_online = false;
            record.is_typing = false;
            record.last_seen = Utc::now();
        }
    }
}

impl Default for PresenceTracker {
    fn default() -> Self {
        Self::new()
    }
}
