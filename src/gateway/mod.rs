//! Multi-transport delivery gateway.
//!
//! A logical connection is an abstraction over one of three transport
//! strategies, selected by client capability in priority order: persistent
//! socket, streaming fallback, polling fallback. The gateway owns the
//! per-connection state machine, heartbeating, and reconnection with
//! exponential backoff.

pub mod transports;

use anyhow::Result as AnyResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, sleep, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Wire envelope: one event per frame on every transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
    pub provider: String,
}

impl Envelope {
    pub fn new(kind: EventKind, payload: Value) -> Self {
        Self {
            kind,
            payload,
            timestamp: Utc::now(),
            provider: "gateway".to_string(),
        }
    }

    /// Connection-established envelope, sent immediately on open.
    pub fn auth(identity: &str, connection_id: &str) -> Self {
        Self::new(
            EventKind::Auth,
            serde_json::json!({
                "identity": identity,
                "connection_id": connection_id,
            }),
        )
    }

    pub fn heartbeat() -> Self {
        Self::new(EventKind::Heartbeat, Value::Null)
    }

    pub fn connection_error(reason: &str, attempts: u32) -> Self {
        Self::new(
            EventKind::ConnectionError,
            serde_json::json!({
                "reason": reason,
                "attempts": attempts,
            }),
        )
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = provider.into();
        self
    }
}

/// Tagged union of event kinds carried over the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "AUTH")]
    Auth,
    #[serde(rename = "HEARTBEAT")]
    Heartbeat,
    #[serde(rename = "message_send")]
    MessageSend,
    #[serde(rename = "message_received")]
    MessageReceived,
    #[serde(rename = "messages_read")]
    MessagesRead,
    #[serde(rename = "user_typing")]
    UserTyping,
    #[serde(rename = "presence_changed")]
    PresenceChanged,
    #[serde(rename = "connection_error")]
    ConnectionError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Connecting,
    Open,
    Reconnecting,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Socket,
    Stream,
    Poll,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Socket => "socket",
            TransportKind::Stream => "stream",
            TransportKind::Poll => "poll",
        }
    }

    /// Selection priority: socket first, polling last.
    fn priority(&self) -> u8 {
        match self {
            TransportKind::Socket => 0,
            TransportKind::Stream => 1,
            TransportKind::Poll => 2,
        }
    }
}

/// A live, bidirectional pipe produced by a transport strategy. When the
/// underlying link dies the `incoming` side closes and the gateway takes
/// over with its reconnect cycle.
pub struct TransportLink {
    pub outgoing: mpsc::UnboundedSender<Envelope>,
    pub incoming: mpsc::UnboundedReceiver<Envelope>,
}

/// One transport strategy. Implementations translate the wire protocol to
/// envelopes; the gateway stays transport-agnostic above this seam.
#[async_trait]
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;
    async fn open(&self) -> AnyResult<TransportLink>;
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub heartbeat_interval: Duration,
    pub reconnect_base_delay: Duration,
    pub reconnect_max_delay: Duration,
    pub max_reconnect_attempts: u32,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            reconnect_base_delay: Duration::from_secs(1),
            reconnect_max_delay: Duration::from_secs(5),
            max_reconnect_attempts: 5,
        }
    }
}

/// Exponential backoff: base doubling per attempt, capped.
fn backoff_delay(attempt: u32, base: Duration, cap: Duration) -> Duration {
    let shift = attempt.saturating_sub(1).min(16);
    base.saturating_mul(1u32 << shift).min(cap)
}

pub type HandlerId = u64;

type HandlerFn = Box<dyn Fn(&Envelope) -> AnyResult<()> + Send + Sync>;

struct Registration {
    id: HandlerId,
    kind: EventKind,
    handler: HandlerFn,
}

/// Handlers in registration order. Dispatch is synchronous; a failing or
/// panicking handler is isolated and logged, the rest still run.
#[derive(Default)]
struct HandlerRegistry {
    next_id: HandlerId,
    entries: Vec<Registration>,
}

impl HandlerRegistry {
    fn register(&mut self, kind: EventKind, handler: HandlerFn) -> HandlerId {
        self.next_id += 1;
        let id = self.next_id;
        self.entries.push(Registration { id, kind, handler });
        id
    }

    fn deregister(&mut self, id: HandlerId) {
        self.entries.retain(|e| e.id != id);
    }

    fn clear(&mut self) {
        self.entries.clear();
    }

    fn dispatch(&self, envelope: &Envelope) {
        for entry in self.entries.iter().filter(|e| e.kind == envelope.kind) {
            match catch_unwind(AssertUnwindSafe(|| (entry.handler)(envelope))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!("[Gateway] Handler {} failed: {}", entry.id, e);
                }
                Err(_) => {
                    warn!("[Gateway] Handler {} panicked", entry.id);
                }
            }
        }
    }
}

struct Inner {
    config: GatewayConfig,
    transports: Vec<Arc<dyn Transport>>,
    handlers: parking_lot::Mutex<HandlerRegistry>,
    outgoing: parking_lot::Mutex<Option<mpsc::UnboundedSender<Envelope>>>,
    state_tx: watch::Sender<ConnectionState>,
}

impl Inner {
    fn set_state(&self, state: ConnectionState) {
        self.state_tx.send_replace(state);
    }

    fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// Try each transport strategy in priority order.
    async fn open_any(&self) -> AnyResult<TransportLink> {
        let mut last_err = anyhow::anyhow!("no transport strategies configured");
        for transport in &self.transports {
            match transport.open().await {
                Ok(link) => {
                    debug!("[Gateway] Connected via {}", transport.kind().as_str());
                    return Ok(link);
                }
                Err(e) => {
                    debug!(
                        "[Gateway] Transport {} failed to open: {}",
                        transport.kind().as_str(),
                        e
                    );
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }

    fn install_link(&self, link: &TransportLink) {
        *self.outgoing.lock() = Some(link.outgoing.clone());
    }

    fn dispatch(&self, envelope: &Envelope) {
        self.handlers.lock().dispatch(envelope);
    }
}

/// A logical gateway connection with its own receive/heartbeat loop.
pub struct GatewayConnection {
    inner: Arc<Inner>,
}

impl GatewayConnection {
    /// Open a connection over the highest-priority transport that accepts.
    pub async fn connect(
        transports: Vec<Arc<dyn Transport>>,
        config: GatewayConfig,
    ) -> Result<Self> {
        let mut transports = transports;
        transports.sort_by_key(|t| t.kind().priority());

        let (state_tx, _) = watch::channel(ConnectionState::Connecting);
        let inner = Arc::new(Inner {
            config,
            transports,
            handlers: parking_lot::Mutex::new(HandlerRegistry::default()),
            outgoing: parking_lot::Mutex::new(None),
            state_tx,
        });

        let link = inner.open_any().await.map_err(|e| Error::Transport {
            attempts: 1,
            reason: e.to_string(),
        })?;
        inner.install_link(&link);
        inner.set_state(ConnectionState::Open);

        tokio::spawn(run_connection(inner.clone(), link));

        Ok(Self { inner })
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.inner.state()
    }

    /// Watch for state transitions. Mostly useful to await the terminal
    /// `Closed` state.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// Send an event over the live link.
    pub fn send(&self, envelope: Envelope) -> Result<()> {
        if self.inner.state() != ConnectionState::Open {
            return Err(Error::Transport {
                attempts: 0,
                reason: "connection is not open".to_string(),
            });
        }
        let outgoing = self.inner.outgoing.lock();
        let sender = outgoing.as_ref().ok_or_else(|| Error::Transport {
            attempts: 0,
            reason: "no live transport link".to_string(),
        })?;
        sender.send(envelope).map_err(|_| Error::Transport {
            attempts: 0,
            reason: "transport link closed".to_string(),
        })
    }

    /// Register a handler for an event kind. Dispatch order follows
    /// registration order.
    pub fn on(
        &self,
        kind: EventKind,
        handler: impl Fn(&Envelope) -> AnyResult<()> + Send + Sync + 'static,
    ) -> HandlerId {
        self.inner.handlers.lock().register(kind, Box::new(handler))
    }

    pub fn off(&self, id: HandlerId) {
        self.inner.handlers.lock().deregister(id);
    }

    /// Close the connection and deregister all handlers.
    pub fn close(&self) {
        self.inner.set_state(ConnectionState::Closed);
        *self.inner.outgoing.lock() = None;
        self.inner.handlers.lock().clear();
    }
}

async fn run_connection(inner: Arc<Inner>, mut link: TransportLink) {
    let mut state_rx = inner.state_tx.subscribe();

    loop {
        // Receive/heartbeat loop for the current link.
        let mut heartbeat = interval(inner.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        heartbeat.tick().await; // the first tick completes immediately

        let silence_limit = inner.config.heartbeat_interval * 2;
        let mut last_traffic = Instant::now();

        let drop_reason = loop {
            tokio::select! {
                maybe = link.incoming.recv() => match maybe {
                    Some(envelope) => {
                        last_traffic = Instant::now();
                        inner.dispatch(&envelope);
                    }
                    None => break "transport link closed",
                },
                _ = heartbeat.tick() => {
                    if last_traffic.elapsed() > silence_limit {
                        break "no traffic within heartbeat window";
                    }
                    let outgoing = inner.outgoing.lock().clone();
                    if let Some(sender) = outgoing {
                        if sender.send(Envelope::heartbeat()).is_err() {
                            break "heartbeat send failed";
                        }
                    }
                }
                _ = state_rx.changed() => {
                    if *state_rx.borrow() == ConnectionState::Closed {
                        debug!("[Gateway] Connection closed by caller");
                        return;
                    }
                }
            }
        };

        if inner.state() == ConnectionState::Closed {
            return;
        }

        info!("[Gateway] Link dropped: {}", drop_reason);
        inner.set_state(ConnectionState::Reconnecting);
        *inner.outgoing.lock() = None;

        match reconnect(&inner).await {
            Some(new_link) => {
                inner.install_link(&new_link);
                inner.set_state(ConnectionState::Open);
                link = new_link;
            }
            None => {
                let attempts = inner.config.max_reconnect_attempts;
                warn!(
                    "[Gateway] Giving up after {} reconnect attempts",
                    attempts
                );
                inner.dispatch(&Envelope::connection_error(drop_reason, attempts));
                inner.set_state(ConnectionState::Closed);
                inner.handlers.lock().clear();
                return;
            }
        }
    }
}

/// Attempt reconnection with exponential backoff. Returns `None` once the
/// attempt budget is exhausted.
async fn reconnect(inner: &Inner) -> Option<TransportLink> {
    for attempt in 1..=inner.config.max_reconnect_attempts {
        let delay = backoff_delay(
            attempt,
            inner.config.reconnect_base_delay,
            inner.config.reconnect_max_delay,
        );
        debug!(
            "[Gateway] Reconnect attempt {} in {:?}",
            attempt, delay
        );
        sleep(delay).await;

        if inner.state() == ConnectionState::Closed {
            return None;
        }

        match inner.open_any().await {
            Ok(link) => {
                info!("[Gateway] Reconnected on attempt {}", attempt);
                return Some(link);
            }
            Err(e) => {
                warn!("[Gateway] Reconnect attempt {} failed: {}", attempt, e);
            }
        }
    }
    None
}
