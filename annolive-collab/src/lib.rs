//! # annolive-collab: Real-time annotation collaboration engine
//!
//! Lets annotators, reviewers and an AI engine work on the same document at
//! once: live presence, streamed AI suggestions, overlap conflict detection
//! with reviewer resolution, and progress metrics, all over WebSocket JSON.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   /ws?projectId&documentId   ┌──────────────┐
//! │ CollabClient │ ◄──────────────────────────► │ Connection   │ (task per socket)
//! │ / browser    │       JSON envelopes         │ Channel      │
//! └──────────────┘                              └──────┬───────┘
//!                                                      │ RoomCommand
//!                                                      ▼
//!                                               ┌──────────────┐
//!                                               │ Room actor   │ router + state
//!                                               └──────┬───────┘
//!                                                      │
//!                                              ┌───────┴───────┐
//!                                              │ BroadcastGroup│
//!                                              │ (fan-out)     │
//!                                              └───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: JSON envelopes, annotations, inbound/outbound messages
//! - [`connection`]: per-socket auth handshake, heartbeats, staleness
//! - [`registry`] / [`room`]: one actor per document
//! - [`router`]: inbound message dispatch inside a room
//! - [`presence`], [`suggestion`], [`conflict`], [`progress`]: room components
//! - [`span_index`]: bucketed span lookup for overlap checks
//! - [`auth`], [`store`]: collaborator seams (token verifier, annotation store)
//! - [`server`] / [`client`]: WebSocket server and reference client

pub mod auth;
pub mod broadcast;
pub mod client;
pub mod conflict;
pub mod connection;
pub mod error;
pub mod presence;
pub mod progress;
pub mod protocol;
pub mod registry;
pub mod room;
pub mod router;
pub mod server;
pub mod span_index;
pub mod store;
pub mod suggestion;

// Re-exports for convenience
pub use auth::{issue_token, Claims, Identity, JwtVerifier, TokenVerifier};
pub use broadcast::{BroadcastGroup, BroadcastStats, Frame};
pub use client::{Backoff, ClientEvent, CollabClient, ConnectionState};
pub use conflict::{
    CheckOutcome, Conflict, ConflictDetector, ConflictKind, ConflictingAnnotation, Resolution,
    ResolutionRecord,
};
pub use connection::ChannelState;
pub use error::{ClientError, CollabError, ServerError};
pub use presence::{PresenceEntry, PresenceStatus, PresenceTracker};
pub use progress::{ProgressSnapshot, TaskStats};
pub use protocol::{
    Annotation, AnnotationDraft, AnnotationSource, DocumentKey, Inbound, Outbound, Role, RoomMode,
};
pub use registry::RoomRegistry;
pub use room::{RoomConfig, RoomStats};
pub use server::{CollabServer, ServerConfig, ServerStats};
pub use store::{AnnotationStore, MemoryAnnotationStore};
pub use suggestion::{
    Suggestion, SuggestionDraft, SuggestionFeedback, SuggestionOutcome, SuggestionStatus,
    SuggestionStream,
};
