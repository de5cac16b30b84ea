//! Connection channel: one task per client socket.
//!
//! ```text
//!             authenticate ok
//! Connecting ─────────────────► Active ──── heartbeat timeout ───► Stale ──► Closed
//!     │                           │
//!     └── timeout / invalid ──► Closed ◄── socket closed ─────────┘
//! ```
//!
//! While `Connecting` only `authenticate` is accepted. Once `Active`, every
//! inbound frame resets the inactivity timer; `heartbeat` is answered
//! locally and everything else goes to the room actor in receipt order.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use crate::auth::Identity;
use crate::broadcast::Frame;
use crate::error::CollabError;
use crate::protocol::{
    AuthenticatePayload, AuthenticatedPayload, ConnectionId, DocumentKey, Inbound, Outbound,
};
use crate::room::{RoomCommand, RoomHandle};
use crate::server::Shared;

/// Project used when the query string names none.
pub const DEFAULT_PROJECT: &str = "default";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Active,
    Stale,
    Closed,
}

impl ChannelState {
    pub fn can_transition(self, to: ChannelState) -> bool {
        use ChannelState::*;
        matches!(
            (self, to),
            (Connecting, Active) | (Connecting, Closed) | (Active, Stale) | (Active, Closed) | (Stale, Closed)
        )
    }

    /// Move to `to`, refusing transitions the state machine does not allow.
    pub fn transition(&mut self, to: ChannelState) -> bool {
        if self.can_transition(to) {
            *self = to;
            true
        } else {
            log::warn!("Refused channel transition {self:?} -> {to:?}");
            false
        }
    }
}

/// Parameters taken from `/ws?projectId=..&documentId=..`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ChannelQuery {
    pub project_id: Option<String>,
    pub document_id: Option<String>,
}

impl ChannelQuery {
    /// Decode the query string. Empty values count as absent; a malformed
    /// query yields no parameters.
    pub fn parse(query: &str) -> Self {
        let parsed: Self = serde_urlencoded::from_str(query).unwrap_or_else(|e| {
            log::debug!("Ignoring malformed channel query '{query}': {e}");
            Self::default()
        });
        Self {
            project_id: parsed.project_id.filter(|v| !v.is_empty()),
            document_id: parsed.document_id.filter(|v| !v.is_empty()),
        }
    }
}

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;

async fn send_frame(sink: &mut WsSink, frame: &str) -> bool {
    sink.send(Message::text(frame)).await.is_ok()
}

async fn send_outbound(sink: &mut WsSink, msg: &Outbound) -> bool {
    match msg.encode() {
        Ok(frame) => send_frame(sink, &frame).await,
        Err(e) => {
            log::error!("Failed to encode '{}': {e}", msg.kind());
            false
        }
    }
}

/// Send `err` to the client, closing the socket when the error is terminal.
/// Returns whether the channel can keep going.
async fn report(sink: &mut WsSink, err: &CollabError) -> bool {
    let sent = send_outbound(sink, &Outbound::error(err)).await;
    if err.is_terminal() {
        let _ = sink.close().await;
        return false;
    }
    sent
}

/// Serve one TCP connection until it closes.
pub(crate) async fn serve(stream: TcpStream, shared: Arc<Shared>) -> Result<(), tokio_tungstenite::tungstenite::Error> {
    let mut query = ChannelQuery::default();
    let callback = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        if req.uri().path() != "/ws" {
            let mut err = ErrorResponse::new(Some("only /ws is served".to_string()));
            *err.status_mut() = StatusCode::NOT_FOUND;
            return Err(err);
        }
        query = ChannelQuery::parse(req.uri().query().unwrap_or(""));
        Ok(resp)
    };
    let ws = tokio_tungstenite::accept_hdr_async(stream, callback).await?;
    let (mut sink, mut source) = ws.split();

    let conn: ConnectionId = Uuid::new_v4();
    let mut state = ChannelState::Connecting;
    shared.counters.total_connections.fetch_add(1, Ordering::Relaxed);
    log::debug!("Channel {conn} connecting ({query:?})");

    // ── Connecting ──
    let grace = shared.config.auth_grace;
    let deadline = Instant::now() + grace;
    let auth = loop {
        match tokio::time::timeout_at(deadline, source.next()).await {
            Err(_) => {
                log::info!("Channel {conn} did not authenticate within {grace:?}");
                state.transition(ChannelState::Closed);
                report(&mut sink, &CollabError::AuthTimeout(grace.as_millis() as u64)).await;
                return Ok(());
            }
            Ok(None) | Ok(Some(Err(_))) | Ok(Some(Ok(Message::Close(_)))) => {
                state.transition(ChannelState::Closed);
                return Ok(());
            }
            Ok(Some(Ok(Message::Text(text)))) => match Inbound::parse(text.as_str()) {
                Ok(Inbound::Authenticate(payload)) => break payload,
                _ => {
                    if !report(&mut sink, &CollabError::NotAuthenticated).await {
                        return Ok(());
                    }
                }
            },
            Ok(Some(Ok(_))) => {}
        }
    };

    let (identity, key) = match authenticate(&shared, &query, &auth).await {
        Ok(found) => found,
        Err(err) => {
            log::info!("Channel {conn} rejected: {err}");
            state.transition(ChannelState::Closed);
            if report(&mut sink, &err).await {
                let _ = sink.close().await;
            }
            return Ok(());
        }
    };

    let (unicast_tx, mut unicast_rx) = mpsc::channel::<Frame>(shared.config.unicast_capacity.max(1));
    let (room, accepted) = match shared.registry.join(&key, conn, identity.clone(), unicast_tx).await {
        Ok(joined) => joined,
        Err(err) => {
            log::info!("Channel {conn} could not join {key}: {err}");
            state.transition(ChannelState::Closed);
            if report(&mut sink, &err).await {
                let _ = sink.close().await;
            }
            return Ok(());
        }
    };
    let mut broadcast_rx = accepted.broadcast;

    let authenticated = Outbound::Authenticated(AuthenticatedPayload {
        connection_id: conn,
        user_id: identity.user_id.clone(),
        role: identity.role,
        project_id: key.project_id.clone(),
        document_id: key.document_id.clone(),
    });
    state.transition(ChannelState::Active);
    shared.counters.active_connections.fetch_add(1, Ordering::Relaxed);
    log::info!("Channel {conn} active: {} on {key}", identity.user_id);

    if send_outbound(&mut sink, &authenticated).await && send_frame(&mut sink, &accepted.snapshot).await {
        run_active(&shared, conn, &room, &mut state, &mut sink, &mut source, &mut broadcast_rx, &mut unicast_rx).await;
    }

    // ── Closed ──
    state.transition(ChannelState::Closed);
    shared.counters.active_connections.fetch_sub(1, Ordering::Relaxed);
    let _ = room.send(RoomCommand::Leave { conn }).await;
    let _ = sink.close().await;
    log::info!("Channel {conn} closed ({} on {key})", identity.user_id);
    Ok(())
}

async fn authenticate(
    shared: &Shared,
    query: &ChannelQuery,
    auth: &AuthenticatePayload,
) -> Result<(Identity, DocumentKey), CollabError> {
    let identity = shared.verifier.verify(&auth.token).await?;
    let project = query.project_id.as_deref().unwrap_or(DEFAULT_PROJECT);
    let requested = query.document_id.as_deref().or(auth.document_id.as_deref());
    let key = identity.resolve_document(project, requested)?;
    Ok((identity, key))
}

#[allow(clippy::too_many_arguments)]
async fn run_active(
    shared: &Shared,
    conn: ConnectionId,
    room: &RoomHandle,
    state: &mut ChannelState,
    sink: &mut WsSink,
    source: &mut futures_util::stream::SplitStream<WebSocketStream<TcpStream>>,
    broadcast_rx: &mut broadcast::Receiver<Frame>,
    unicast_rx: &mut mpsc::Receiver<Frame>,
) {
    let timeout = shared.config.heartbeat_timeout;
    let mut last_seen = Instant::now();
    let mut check = tokio::time::interval(shared.config.heartbeat_check_interval);
    check.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            msg = source.next() => {
                let Some(Ok(msg)) = msg else { break };
                last_seen = Instant::now();
                shared.counters.total_messages.fetch_add(1, Ordering::Relaxed);
                match msg {
                    Message::Text(text) => {
                        match Inbound::parse(text.as_str()) {
                            Ok(Inbound::Heartbeat) => {
                                if !send_outbound(sink, &Outbound::heartbeat_ack()).await {
                                    break;
                                }
                            }
                            Ok(message) => {
                                if room.send(RoomCommand::Message { conn, message }).await.is_err() {
                                    log::warn!("Channel {conn}: room {} is gone", room.key());
                                    break;
                                }
                            }
                            Err(err) => {
                                log::debug!("Channel {conn}: {err}");
                                if !report(sink, &err).await {
                                    break;
                                }
                            }
                        }
                    }
                    Message::Ping(data) => {
                        if sink.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            frame = broadcast_rx.recv() => match frame {
                Ok(frame) => {
                    if !send_frame(sink, &frame).await {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    // Frames carry no sequence numbers; the client resyncs from a fresh snapshot.
                    log::warn!("Channel {conn} lagged, skipped {skipped} frame(s); closing");
                    shared.counters.lagged_frames.fetch_add(skipped, Ordering::Relaxed);
                    break;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            frame = unicast_rx.recv() => {
                let Some(frame) = frame else { break };
                if !send_frame(sink, &frame).await {
                    break;
                }
            }
            _ = check.tick() => {
                if last_seen.elapsed() > timeout {
                    state.transition(ChannelState::Stale);
                    log::info!("Channel {conn} stale after {timeout:?} without traffic");
                    break;
                }
            }
        }
    }
}
