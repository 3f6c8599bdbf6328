//! Channel subscription registry.
//!
//! Tracks which channels each identity is bound to, fans events out to the
//! identity's live connections, and queues events for identities with no
//! live connection. Subscriptions survive disconnects so a reconnect
//! resumes the same channels; queued events are replayed in publish order
//! on the next connect.

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::{Hash, Hasher};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

use crate::gateway::Envelope;

pub const DEFAULT_QUEUE_CAPACITY: usize = 100;

/// One live transport connection for an identity. Multiple connections per
/// identity (multiple tabs) are expected; all receive fan-out.
#[derive(Clone)]
pub struct ConnectionHandle {
    pub id: String,
    pub identity: String,
    pub sender: mpsc::UnboundedSender<Envelope>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PublishOutcome {
    /// Identities that had at least one live connection accept the event.
    pub delivered: Vec<String>,
    /// Identities the event was queued for.
    pub queued: Vec<String>,
    /// Live identities where every connection refused the event; the event
    /// was re-queued for them (delivery degraded, replay is the backstop).
    pub degraded: Vec<String>,
}

#[derive(Default)]
struct Inner {
    channels_by_identity: HashMap<String, HashSet<String>>,
    identities_by_channel: HashMap<String, HashSet<String>>,
    connections: HashMap<String, Vec<ConnectionHandle>>,
    queues: HashMap<String, VecDeque<Envelope>>,
}

impl Inner {
    fn enqueue(&mut self, identity: &str, envelope: Envelope, capacity: usize) {
        let queue = self.queues.entry(identity.to_string()).or_default();
        if queue.len() >= capacity {
            queue.pop_front(); // oldest dropped on overflow
        }
        queue.push_back(envelope);
    }
}

pub struct SubscriptionRegistry {
    queue_capacity: usize,
    inner: RwLock<Inner>,
}

impl SubscriptionRegistry {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            queue_capacity,
            inner: RwLock::new(Inner::default()),
        }
    }

    /// Bind an identity to a channel. Idempotent.
    pub async fn subscribe(&self, identity: &str, channel: &str) {
        let mut inner = self.inner.write().await;
        inner
            .channels_by_identity
            .entry(identity.to_string())
            .or_default()
            .insert(channel.to_string());
        inner
            .identities_by_channel
            .entry(channel.to_string())
            .or_default()
            .insert(identity.to_string());
        debug!("[Registry] {} subscribed to {}", identity, channel);
    }

    /// Unbind an identity from a channel. Idempotent.
    pub async fn unsubscribe(&self, identity: &str, channel: &str) {
        let mut inner = self.inner.write().await;
        if let Some(channels) = inner.channels_by_identity.get_mut(identity) {
            channels.remove(channel);
        }
        if let Some(identities) = inner.identities_by_channel.get_mut(channel) {
            identities.remove(identity);
        }
        debug!("[Registry] {} unsubscribed from {}", identity, channel);
    }

    pub async fn channels_for(&self, identity: &str) -> Vec<String> {
        let inner = self.inner.read().await;
        inner
            .channels_by_identity
            .get(identity)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn is_subscribed(&self, identity: &str, channel: &str) -> bool {
        let inner = self.inner.read().await;
        inner
            .channels_by_identity
            .get(identity)
            .map(|set| set.contains(channel))
            .unwrap_or(false)
    }

    /// Register a live connection and replay the identity's queued events
    /// through it in original publish order. Returns the drained events.
    ///
    /// The replay happens under the registry lock (the mpsc send is
    /// non-blocking) so a concurrent publish cannot slip a live event in
    /// ahead of the backlog.
    pub async fn connect(&self, handle: ConnectionHandle) -> Vec<Envelope> {
        let mut inner = self.inner.write().await;
        let drained: Vec<Envelope> = inner
            .queues
            .remove(&handle.identity)
            .map(Vec::from)
            .unwrap_or_default();

        for envelope in &drained {
            if handle.sender.send(envelope.clone()).is_err() {
                warn!(
                    "[Registry] Replay to fresh connection {} failed",
                    handle.id
                );
                break;
            }
        }

        inner
            .connections
            .entry(handle.identity.clone())
            .or_default()
            .push(handle.clone());

        if !drained.is_empty() {
            info!(
                "[Registry] Replayed {} queued events to {} ({})",
                drained.len(),
                handle.identity,
                handle.id
            );
        }
        drained
    }

    /// Remove a connection. Subscriptions are left intact so a reconnect
    /// resumes the same channels. Returns true if this was the identity's
    /// last live connection.
    pub async fn disconnect(&self, identity: &str, connection_id: &str) -> bool {
        let mut inner = self.inner.write().await;
        let Some(handles) = inner.connections.get_mut(identity) else {
            return false;
        };
        handles.retain(|h| h.id != connection_id);
        if handles.is_empty() {
            inner.connections.remove(identity);
            debug!("[Registry] {} has no live connections left", identity);
            true
        } else {
            false
        }
    }

    pub async fn has_connection(&self, identity: &str) -> bool {
        let inner = self.inner.read().await;
        inner
            .connections
            .get(identity)
            .map(|handles| !handles.is_empty())
            .unwrap_or(false)
    }

    /// Fan an event out to every subscriber of a channel. Identities with a
    /// live connection get it immediately (over a snapshot of the
    /// connection set, never the live map); identities without one get it
    /// queued, capacity-bounded, for replay on next connect.
    pub async fn publish(&self, channel: &str, envelope: Envelope) -> PublishOutcome {
        // Snapshot subscribers and their senders, queue for the offline,
        // then release the lock before any sends.
        let (snapshots, queued) = {
            let mut inner = self.inner.write().await;
            let subscribers: Vec<String> = inner
                .identities_by_channel
                .get(channel)
                .map(|set| set.iter().cloned().collect())
                .unwrap_or_default();

            let mut snapshots: Vec<(String, Vec<mpsc::UnboundedSender<Envelope>>)> = Vec::new();
            let mut queued = Vec::new();
            for identity in subscribers {
                let senders: Vec<_> = inner
                    .connections
                    .get(&identity)
                    .map(|handles| handles.iter().map(|h| h.sender.clone()).collect())
                    .unwrap_or_default();
                if senders.is_empty() {
                    inner.enqueue(&identity, envelope.clone(), self.queue_capacity);
                    queued.push(identity);
                } else {
                    snapshots.push((identity, senders));
                }
            }
            (snapshots, queued)
        };

        let mut outcome = PublishOutcome {
            queued,
            ..Default::default()
        };

        let mut degraded = Vec::new();
        for (identity, senders) in snapshots {
            let mut accepted = 0;
            for sender in senders {
                if sender.send(envelope.clone()).is_ok() {
                    accepted += 1;
                }
            }
            if accepted == 0 {
                degraded.push(identity);
            } else {
                outcome.delivered.push(identity);
            }
        }

        // Every connection for these identities refused the send; queue the
        // event so the reconnect replay backstop still delivers it.
        if !degraded.is_empty() {
            let mut inner = self.inner.write().await;
            for identity in &degraded {
                inner.enqueue(identity, envelope.clone(), self.queue_capacity);
            }
            warn!(
                "[Registry] Degraded delivery on {} for {:?}; queued for replay",
                channel, degraded
            );
            outcome.degraded = degraded;
        }

        outcome
    }

    /// Drain queued events without registering a connection. Used by the
    /// polling fallback.
    pub async fn drain_queued(&self, identity: &str) -> Vec<Envelope> {
        let mut inner = self.inner.write().await;
        inner
            .queues
            .remove(identity)
            .map(Vec::from)
            .unwrap_or_default()
    }

    pub async fn queued_len(&self, identity: &str) -> usize {
        let inner = self.inner.read().await;
        inner.queues.get(identity).map(|q| q.len()).unwrap_or(0)
    }
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

/// Synthetic identity for unauthenticated read-only channels, derived from
/// a caller-supplied client token. No persisted queue guarantee across
/// process restarts.
pub fn anonymous_identity(client_token: &str) -> String {
    let mut hasher = DefaultHasher::new();
    client_token.hash(&mut hasher);
    format!("anon-{:016x}", hasher.finish())
}
