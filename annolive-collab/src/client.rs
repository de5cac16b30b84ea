//! WebSocket client for the collaboration server.
//!
//! Used by the integration tests and by out-of-process engine producers.
//! Provides:
//! - Connection lifecycle (connect, authenticate, reconnect with backoff)
//! - Typed send helpers for every inbound message kind
//! - Decoded server frames delivered as [`ClientEvent`]s
//!
//! The server keeps no session across sockets, so a reconnect is a fresh
//! join: the `snapshot` that follows `authenticated` carries the full room
//! state again.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;

use crate::conflict::Resolution;
use crate::error::ClientError;
use crate::presence::PresenceStatus;
use crate::protocol::{envelope, AnnotationDraft, Outbound};
use crate::suggestion::SuggestionDraft;

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Events emitted by the client.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    Connected,
    Disconnected,
    /// A decoded server frame
    Message(Outbound),
}

/// Exponential reconnect backoff.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    max_attempts: u32,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            max,
            max_attempts,
            attempt: 0,
        }
    }

    /// Delay before the next attempt, or `None` once attempts are used up.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.max_attempts {
            return None;
        }
        let factor = 2u32.saturating_pow(self.attempt);
        self.attempt += 1;
        Some(self.base.saturating_mul(factor).min(self.max))
    }

    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(250), Duration::from_secs(10), 8)
    }
}

/// WebSocket client bound to one document.
pub struct CollabClient {
    server_url: String,
    project_id: String,
    document_id: String,
    token: String,
    state: Arc<RwLock<ConnectionState>>,
    outgoing_tx: Option<mpsc::Sender<String>>,
    event_tx: mpsc::Sender<ClientEvent>,
    event_rx: Option<mpsc::Receiver<ClientEvent>>,
}

impl CollabClient {
    pub fn new(
        server_url: impl Into<String>,
        project_id: impl Into<String>,
        document_id: impl Into<String>,
        token: impl Into<String>,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            server_url: server_url.into(),
            project_id: project_id.into(),
            document_id: document_id.into(),
            token: token.into(),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            outgoing_tx: None,
            event_tx,
            event_rx: Some(event_rx),
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<ClientEvent>> {
        self.event_rx.take()
    }

    /// Full channel URL including the percent-encoded document query.
    pub fn channel_url(&self) -> Result<String, ClientError> {
        let query = serde_urlencoded::to_string(&[
            ("projectId", self.project_id.as_str()),
            ("documentId", self.document_id.as_str()),
        ])?;
        Ok(format!("{}/ws?{query}", self.server_url.trim_end_matches('/')))
    }

    /// Open the socket and send `authenticate`.
    pub async fn connect(&mut self) -> Result<(), ClientError> {
        *self.state.write().await = ConnectionState::Connecting;
        self.open().await
    }

    /// Connect, retrying with `backoff` between failed attempts.
    pub async fn connect_with_retry(&mut self, mut backoff: Backoff) -> Result<(), ClientError> {
        *self.state.write().await = ConnectionState::Connecting;
        loop {
            match self.open().await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    let Some(delay) = backoff.next_delay() else {
                        *self.state.write().await = ConnectionState::Disconnected;
                        return Err(ClientError::RetriesExhausted(backoff.attempts()));
                    };
                    log::warn!("Connect to {} failed ({e}); retrying in {delay:?}", self.server_url);
                    *self.state.write().await = ConnectionState::Reconnecting;
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn open(&mut self) -> Result<(), ClientError> {
        let url = match self.channel_url() {
            Ok(url) => url,
            Err(e) => {
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(e);
            }
        };
        let (ws, _) = match tokio_tungstenite::connect_async(url.as_str()).await {
            Ok(connected) => connected,
            Err(e) => {
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(e.into());
            }
        };
        let (mut ws_writer, mut ws_reader) = ws.split();

        // Writer task: forward outgoing frames to the socket
        let (out_tx, mut out_rx) = mpsc::channel::<String>(256);
        self.outgoing_tx = Some(out_tx.clone());
        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                if ws_writer.send(Message::text(frame)).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        let auth = envelope(
            "authenticate",
            json!({ "token": self.token, "documentId": self.document_id }),
        );
        out_tx.send(auth).await.map_err(|_| ClientError::NotConnected)?;

        *self.state.write().await = ConnectionState::Connected;
        let _ = self.event_tx.send(ClientEvent::Connected).await;

        // Reader task: decode server frames into events
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Text(text)) => match Outbound::decode(text.as_str()) {
                        Ok(outbound) => {
                            if event_tx.send(ClientEvent::Message(outbound)).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => log::debug!("Ignoring undecodable frame: {e}"),
                    },
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            *state.write().await = ConnectionState::Disconnected;
            let _ = event_tx.send(ClientEvent::Disconnected).await;
        });

        Ok(())
    }

    /// Close the socket; the reader reports `Disconnected`.
    pub fn disconnect(&mut self) {
        self.outgoing_tx = None;
    }

    /// Send a raw envelope.
    pub async fn send(&self, kind: &str, payload: Value) -> Result<(), ClientError> {
        if *self.state.read().await != ConnectionState::Connected {
            return Err(ClientError::NotConnected);
        }
        let tx = self.outgoing_tx.as_ref().ok_or(ClientError::NotConnected)?;
        tx.send(envelope(kind, payload))
            .await
            .map_err(|_| ClientError::NotConnected)
    }

    pub async fn heartbeat(&self) -> Result<(), ClientError> {
        self.send("heartbeat", json!({})).await
    }

    pub async fn set_activity(&self, status: PresenceStatus) -> Result<(), ClientError> {
        self.send("activity", json!({ "status": status })).await
    }

    pub async fn submit_annotation(&self, draft: &AnnotationDraft) -> Result<(), ClientError> {
        self.send("annotation_submitted", to_value(draft)?).await
    }

    pub async fn push_suggestion(&self, draft: &SuggestionDraft) -> Result<(), ClientError> {
        self.send("suggestion", to_value(draft)?).await
    }

    pub async fn accept_suggestion(&self, suggestion_id: &str) -> Result<(), ClientError> {
        self.send("accept_suggestion", json!({ "suggestionId": suggestion_id }))
            .await
    }

    pub async fn reject_suggestion(&self, suggestion_id: &str, reason: Option<&str>) -> Result<(), ClientError> {
        self.send(
            "reject_suggestion",
            json!({ "suggestionId": suggestion_id, "reason": reason }),
        )
        .await
    }

    pub async fn resolve_conflict(&self, conflict_id: &str, resolution: &Resolution) -> Result<(), ClientError> {
        self.send(
            "resolve_conflict",
            json!({ "conflictId": conflict_id, "resolution": to_value(resolution)? }),
        )
        .await
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    pub fn document_id(&self) -> &str {
        &self.document_id
    }
}

fn to_value<T: serde::Serialize>(value: &T) -> Result<Value, ClientError> {
    serde_json::to_value(value).map_err(|e| {
        ClientError::Protocol(crate::error::CollabError::MalformedMessage {
            kind: "client".to_string(),
            reason: e.to_string(),
        })
    })
}
