//! Concrete client-side transport strategies.
//!
//! Socket: persistent WebSocket, push and pull on one link.
//! Stream: long-lived newline-delimited JSON response; server push only,
//! client sends via a separate ingest request.
//! Poll: interval GET draining queued envelopes; last resort.

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, warn};

use super::{Envelope, Transport, TransportKind, TransportLink};

/// Persistent bidirectional WebSocket transport.
pub struct SocketTransport {
    url: String,
}

impl SocketTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl Transport for SocketTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Socket
    }

    async fn open(&self) -> Result<TransportLink> {
        let (ws, _) = connect_async(&self.url)
            .await
            .with_context(|| format!("websocket connect to {}", self.url))?;
        let (mut sink, mut stream) = ws.split();

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Envelope>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<Envelope>();

        tokio::spawn(async move {
            while let Some(envelope) = out_rx.recv().await {
                let Ok(text) = serde_json::to_string(&envelope) else {
                    continue;
                };
                if sink.send(Message::text(text)).await.is_err() {
                    break;
                }
            }
        });

        tokio::spawn(async move {
            while let Some(message) = stream.next().await {
                let Ok(message) = message else { break };
                if !message.is_text() {
                    continue;
                }
                let Ok(text) = message.into_text() else {
                    continue;
                };
                match serde_json::from_str::<Envelope>(text.as_str()) {
                    Ok(envelope) => {
                        if in_tx
                            .send(envelope.with_provider(TransportKind::Socket.as_str()))
                            .is_err()
                        {
                            break;
                        }
                    }
                    Err(e) => {
                        debug!("[Gateway] Dropping unparseable socket frame: {}", e);
                    }
                }
            }
        });

        Ok(TransportLink {
            outgoing: out_tx,
            incoming: in_rx,
        })
    }
}

/// Streaming fallback: one JSON envelope per line on a long-lived
/// response body. Outbound envelopes go through a separate POST.
pub struct StreamTransport {
    stream_url: String,
    send_url: String,
    client: reqwest::Client,
}

impl StreamTransport {
    pub fn new(stream_url: impl Into<String>, send_url: impl Into<String>) -> Self {
        Self::with_client(stream_url, send_url, reqwest::Client::new())
    }

    /// Use a preconfigured client, e.g. one carrying auth headers.
    pub fn with_client(
        stream_url: impl Into<String>,
        send_url: impl Into<String>,
        client: reqwest::Client,
    ) -> Self {
        Self {
            stream_url: stream_url.into(),
            send_url: send_url.into(),
            client,
        }
    }
}

#[async_trait]
impl Transport for StreamTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Stream
    }

    async fn open(&self) -> Result<TransportLink> {
        let response = self
            .client
            .get(&self.stream_url)
            .send()
            .await
            .with_context(|| format!("stream connect to {}", self.stream_url))?
            .error_for_status()?;
        let mut body = response.bytes_stream();

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Envelope>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<Envelope>();

        tokio::spawn(async move {
            let mut buffer = Vec::new();
            while let Some(chunk) = body.next().await {
                let Ok(chunk) = chunk else { break };
                buffer.extend_from_slice(&chunk);
                while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
                    let line: Vec<u8> = buffer.drain(..=pos).collect();
                    let line = String::from_utf8_lossy(&line[..line.len() - 1]);
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<Envelope>(line) {
                        Ok(envelope) => {
                            if in_tx
                                .send(envelope.with_provider(TransportKind::Stream.as_str()))
                                .is_err()
                            {
                                return;
                            }
                        }
                        Err(e) => {
                            debug!("[Gateway] Dropping unparseable stream frame: {}", e);
                        }
                    }
                }
            }
        });

        let client = self.client.clone();
        let send_url = self.send_url.clone();
        tokio::spawn(async move {
            while let Some(envelope) = out_rx.recv().await {
                if let Err(e) = client.post(&send_url).json(&envelope).send().await {
                    warn!("[Gateway] Stream send request failed: {}", e);
                }
            }
        });

        Ok(TransportLink {
            outgoing: out_tx,
            incoming: in_rx,
        })
    }
}

/// Polling fallback: the client pulls queued envelopes on an interval.
pub struct PollTransport {
    poll_url: String,
    send_url: String,
    interval: Duration,
    client: reqwest::Client,
}

impl PollTransport {
    pub fn new(
        poll_url: impl Into<String>,
        send_url: impl Into<String>,
        interval: Duration,
    ) -> Self {
        Self::with_client(poll_url, send_url, interval, reqwest::Client::new())
    }

    /// Use a preconfigured client, e.g. one carrying auth headers.
    pub fn with_client(
        poll_url: impl Into<String>,
        send_url: impl Into<String>,
        interval: Duration,
        client: reqwest::Client,
    ) -> Self {
        Self {
            poll_url: poll_url.into(),
            send_url: send_url.into(),
            interval,
            client,
        }
    }
}

#[derive(serde::Deserialize)]
struct PollBody {
    events: Vec<Envelope>,
}

#[async_trait]
impl Transport for PollTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Poll
    }

    async fn open(&self) -> Result<TransportLink> {
        // Probe once so an unreachable server fails the open, not the
        // loop. The drain is destructive, so whatever it returns rides
        // along instead of being dropped.
        let initial: PollBody = self
            .client
            .get(&self.poll_url)
            .send()
            .await
            .with_context(|| format!("poll connect to {}", self.poll_url))?
            .error_for_status()?
            .json()
            .await
            .context("poll response unreadable")?;

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Envelope>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<Envelope>();

        let client = self.client.clone();
        let poll_url = self.poll_url.clone();
        let poll_interval = self.interval;
        tokio::spawn(async move {
            for envelope in initial.events {
                if in_tx
                    .send(envelope.with_provider(TransportKind::Poll.as_str()))
                    .is_err()
                {
                    return;
                }
            }
            let mut ticker = tokio::time::interval(poll_interval);
            ticker.tick().await; // immediate first tick, already probed
            loop {
                ticker.tick().await;
                let envelopes: Vec<Envelope> = match client.get(&poll_url).send().await {
                    Ok(response) => match response.json::<PollBody>().await {
                        Ok(body) => body.events,
                        Err(e) => {
                            warn!("[Gateway] Poll response unreadable: {}", e);
                            break;
                        }
                    },
                    Err(e) => {
                        warn!("[Gateway] Poll request failed: {}", e);
                        break;
                    }
                };
                // An empty drain still counts as traffic on the link.
                if envelopes.is_empty() {
                    if in_tx
                        .send(
                            Envelope::heartbeat().with_provider(TransportKind::Poll.as_str()),
                        )
                        .is_err()
                    {
                        return;
                    }
                    continue;
                }
                for envelope in envelopes {
                    if in_tx
                        .send(envelope.with_provider(TransportKind::Poll.as_str()))
                        .is_err()
                    {
                        return;
                    }
                }
            }
        });

        let client = self.client.clone();
        let send_url = self.send_url.clone();
        tokio::spawn(async move {
            while let Some(envelope) = out_rx.recv().await {
                if envelope.kind == super::EventKind::Heartbeat {
                    continue; // the poll request itself is the keepalive
                }
                if let Err(e) = client.post(&send_url).json(&envelope).send().await {
                    warn!("[Gateway] Poll send request failed: {}", e);
                }
            }
        });

        Ok(TransportLink {
            outgoing: out_tx,
            incoming: in_rx,
        })
    }
}
