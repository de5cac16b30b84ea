//! Error taxonomy shared by every component of the collaboration engine.
//!
//! Each variant maps to a stable wire `code` carried in `error{code, message}`
//! frames. Only `AuthTimeout`, `AuthInvalid` and `RoomFull` close the socket;
//! everything else is reported to the originating connection and the
//! connection keeps running.

use serde_json::Value;
use thiserror::Error;

/// Errors surfaced by the collaboration engine.
#[derive(Debug, Clone, Error)]
pub enum CollabError {
    #[error("no authenticate message within {0} ms")]
    AuthTimeout(u64),

    #[error("authentication rejected: {0}")]
    AuthInvalid(String),

    #[error("authenticate first")]
    NotAuthenticated,

    #[error("unknown message type '{0}'")]
    UnknownMessageType(String),

    #[error("malformed '{kind}' message: {reason}")]
    MalformedMessage { kind: String, reason: String },

    #[error("invalid presence status '{0}'")]
    InvalidStatus(String),

    #[error("invalid span [{start}, {end})")]
    InvalidSpan { start: u32, end: u32 },

    #[error("'{0}' is not permitted for this identity")]
    NotPermitted(String),

    #[error("room is full ({0} connections)")]
    RoomFull(usize),

    #[error("suggestion {0} not found")]
    SuggestionNotFound(String),

    #[error("suggestion {0} is already resolved")]
    SuggestionAlreadyResolved(String),

    #[error("suggestion backlog is full ({0} pending)")]
    SuggestionBacklogFull(usize),

    #[error("conflict {0} not found")]
    ConflictNotFound(String),

    /// Carries the winning resolution so the loser can reconcile without a refetch.
    #[error("conflict {conflict_id} was already resolved")]
    ConflictAlreadyResolved { conflict_id: String, winner: Value },

    #[error("invalid resolution: {0}")]
    InvalidResolution(String),

    #[error("annotation store unavailable: {0}")]
    UpstreamStoreUnavailable(String),

    #[error("room is in presence-only mode")]
    PresenceOnly,
}

impl CollabError {
    /// Stable code sent on the wire.
    pub fn code(&self) -> &'static str {
        match self {
            Self::AuthTimeout(_) => "AuthTimeout",
            Self::AuthInvalid(_) => "AuthInvalid",
            Self::NotAuthenticated => "NotAuthenticated",
            Self::UnknownMessageType(_) => "UnknownMessageType",
            Self::MalformedMessage { .. } => "MalformedMessage",
            Self::InvalidStatus(_) => "InvalidStatus",
            Self::InvalidSpan { .. } => "InvalidSpan",
            Self::NotPermitted(_) => "NotPermitted",
            Self::RoomFull(_) => "RoomFull",
            Self::SuggestionNotFound(_) => "SuggestionNotFound",
            Self::SuggestionAlreadyResolved(_) => "SuggestionAlreadyResolved",
            Self::SuggestionBacklogFull(_) => "SuggestionBacklogFull",
            Self::ConflictNotFound(_) => "ConflictNotFound",
            Self::ConflictAlreadyResolved { .. } => "ConflictAlreadyResolved",
            Self::InvalidResolution(_) => "InvalidResolution",
            Self::UpstreamStoreUnavailable(_) => "UpstreamStoreUnavailable",
            Self::PresenceOnly => "PresenceOnly",
        }
    }

    /// Structured details attached to the wire error, if any.
    pub fn details(&self) -> Option<Value> {
        match self {
            Self::ConflictAlreadyResolved { winner, .. } => Some(winner.clone()),
            _ => None,
        }
    }

    /// Whether the connection must be closed after reporting this error.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::AuthTimeout(_) | Self::AuthInvalid(_) | Self::RoomFull(_))
    }
}

/// Errors that stop the server itself (bind failures, accept loop errors).
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),
}

/// Errors seen by [`crate::client::CollabClient`].
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("not connected")]
    NotConnected,

    #[error("gave up after {0} connection attempts")]
    RetriesExhausted(u32),

    #[error("cannot encode channel query: {0}")]
    Query(#[from] serde_urlencoded::ser::Error),

    #[error(transparent)]
    Protocol(#[from] CollabError),
}
