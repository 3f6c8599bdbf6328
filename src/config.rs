//! Messaging core configuration

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::directory::ConversationDirectory;
use crate::messages::{MessageClock, MessageStore};
use crate::notify::{LogOnlyDispatcher, NotificationDispatcher};
use crate::orchestrator::DeliveryOrchestrator;
use crate::presence::PresenceTracker;
use crate::registry::SubscriptionRegistry;
use crate::store::{DocumentStore, JsonDocumentStore, MemoryStore};

/// Configuration for the messaging core.
#[derive(Clone, Debug)]
pub struct CoreConfig {
    /// Storage directory for conversation and message documents.
    /// `None` keeps everything in memory.
    pub storage_dir: Option<PathBuf>,
    /// Listen address for the HTTP/WS surface
    pub bind_addr: SocketAddr,
    /// Server-to-client heartbeat cadence on socket and stream connections
    pub heartbeat_interval: Duration,
    /// Quiet window after which a typing signal auto-stops
    pub typing_quiet_window: Duration,
    /// Events queued per offline identity before the oldest is dropped
    pub offline_queue_capacity: usize,
    /// First reconnect delay for client gateways
    pub reconnect_base_delay: Duration,
    /// Reconnect delay cap
    pub reconnect_max_delay: Duration,
    /// Reconnect attempts before a connection error surfaces
    pub max_reconnect_attempts: u32,
    /// How long an identity stays online after its last connection drops
    pub presence_grace_period: Duration,
    /// Max message content size in bytes
    pub max_message_len: usize,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            storage_dir: Some(PathBuf::from("messaging_data")),
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 3001)),
            heartbeat_interval: Duration::from_secs(30),
            typing_quiet_window: Duration::from_secs(1),
            offline_queue_capacity: 100,
            reconnect_base_delay: Duration::from_secs(1),
            reconnect_max_delay: Duration::from_secs(5),
            max_reconnect_attempts: 5,
            presence_grace_period: Duration::from_secs(10),
            max_message_len: 16 * 1024,
        }
    }
}

impl CoreConfig {
    /// Create config with a custom storage base directory
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            storage_dir: Some(base_dir.into().join("documents")),
            ..Self::default()
        }
    }

    /// Config with no on-disk storage. Used by tests.
    pub fn in_memory() -> Self {
        Self {
            storage_dir: None,
            ..Self::default()
        }
    }

    /// Ensure the storage directory exists
    pub async fn ensure_dirs(&self) -> anyhow::Result<()> {
        if let Some(dir) = &self.storage_dir {
            tokio::fs::create_dir_all(dir).await?;
        }
        Ok(())
    }
}

/// App state shared across all handlers
#[derive(Clone)]
pub struct AppState {
    pub config: CoreConfig,
    pub directory: Arc<ConversationDirectory>,
    pub messages: Arc<MessageStore>,
    pub presence: Arc<PresenceTracker>,
    pub registry: Arc<SubscriptionRegistry>,
    pub orchestrator: Arc<DeliveryOrchestrator>,
}

impl AppState {
    /// Wire the managers together with the default log-only dispatcher.
    pub async fn build(config: CoreConfig) -> anyhow::Result<Self> {
        Self::build_with_dispatcher(config, Arc::new(LogOnlyDispatcher)).await
    }

    pub async fn build_with_dispatcher(
        config: CoreConfig,
        notifier: Arc<dyn NotificationDispatcher>,
    ) -> anyhow::Result<Self> {
        config.ensure_dirs().await?;

        let store: Arc<dyn DocumentStore> = match &config.storage_dir {
            Some(dir) => Arc::new(JsonDocumentStore::new(dir.clone()).await?),
            None => Arc::new(MemoryStore::new()),
        };

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
            config.max_message_len,
        ));
        let registry = Arc::new(SubscriptionRegistry::new(config.offline_queue_capacity));
        let orchestrator = Arc::new(DeliveryOrchestrator::new(
            directory.clone(),
            messages.clone(),
            presence.clone(),
            registry.clone(),
            notifier,
            config.typing_quiet_window,
            config.presence_grace_period,
        ));

        Ok(Self {
            config,
            directory,
            messages,
            presence,
            registry,
            orchestrator,
        })
    }
}
