//! WebSocket collaboration server.
//!
//! Architecture:
//! ```text
//! Client A ──┐                      ┌── PresenceTracker
//!            ├── Room (p1/doc1) ────┼── SuggestionStream
//! Client B ──┘   actor task         ├── ConflictDetector ── AnnotationStore
//!                    │              └── progress::recompute
//!                    ▼
//!             BroadcastGroup ──► Client A, Client B
//! ```
//!
//! Every accepted socket gets its own task (see [`crate::connection`]). The
//! only shared structure is the [`RoomRegistry`]; all room state lives in
//! the room actors.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::mpsc;

use crate::auth::TokenVerifier;
use crate::connection;
use crate::error::{CollabError, ServerError};
use crate::progress::TaskStats;
use crate::protocol::DocumentKey;
use crate::registry::RoomRegistry;
use crate::room::{EngineInput, RoomConfig, RoomStats};
use crate::store::AnnotationStore;
use crate::suggestion::{SuggestionDraft, SuggestionFeedback};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    pub max_connections_per_room: usize,
    pub max_pending_suggestions: usize,
    /// Resolved suggestions kept for idempotent replies
    pub max_resolved_suggestions: usize,
    /// Resolved conflicts kept for `ConflictAlreadyResolved` replies
    pub max_resolved_conflicts: usize,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
    /// Errors and no-op replies buffered per connection before it is dropped
    pub unicast_capacity: usize,
    pub room_queue_capacity: usize,
    /// Time allowed between socket open and `authenticate`
    pub auth_grace: Duration,
    /// Silence after which a channel goes stale
    pub heartbeat_timeout: Duration,
    pub heartbeat_check_interval: Duration,
    /// Inactivity after which presence turns idle
    pub idle_after: Duration,
    pub idle_check_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let room = RoomConfig::default();
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_connections_per_room: room.max_connections,
            max_pending_suggestions: room.max_pending_suggestions,
            max_resolved_suggestions: room.max_resolved_suggestions,
            max_resolved_conflicts: room.max_resolved_conflicts,
            broadcast_capacity: room.broadcast_capacity,
            unicast_capacity: 64,
            room_queue_capacity: room.queue_capacity,
            auth_grace: Duration::from_secs(10),
            heartbeat_timeout: Duration::from_secs(30),
            heartbeat_check_interval: Duration::from_secs(1),
            idle_after: room.idle_after,
            idle_check_interval: room.idle_check_interval,
        }
    }
}

impl ServerConfig {
    pub fn room_config(&self) -> RoomConfig {
        RoomConfig {
            max_connections: self.max_connections_per_room,
            max_pending_suggestions: self.max_pending_suggestions,
            max_resolved_suggestions: self.max_resolved_suggestions,
            max_resolved_conflicts: self.max_resolved_conflicts,
            broadcast_capacity: self.broadcast_capacity,
            queue_capacity: self.room_queue_capacity,
            idle_after: self.idle_after,
            idle_check_interval: self.idle_check_interval,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub lagged_frames: u64,
    pub active_rooms: usize,
}

/// Lock-free counters updated by connection tasks.
#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub total_connections: AtomicU64,
    pub active_connections: AtomicU64,
    pub total_messages: AtomicU64,
    pub lagged_frames: AtomicU64,
}

/// State shared by every connection task.
pub(crate) struct Shared {
    pub config: ServerConfig,
    pub registry: Arc<RoomRegistry>,
    pub verifier: Arc<dyn TokenVerifier>,
    pub counters: Counters,
}

/// The collaboration server. Cheap to clone.
#[derive(Clone)]
pub struct CollabServer {
    shared: Arc<Shared>,
}

impl CollabServer {
    pub fn new(config: ServerConfig, verifier: Arc<dyn TokenVerifier>, store: Arc<dyn AnnotationStore>) -> Self {
        Self::build(config, verifier, store, None)
    }

    /// Also forward accept/reject outcomes to `feedback` (fire-and-forget).
    pub fn with_feedback(
        config: ServerConfig,
        verifier: Arc<dyn TokenVerifier>,
        store: Arc<dyn AnnotationStore>,
        feedback: mpsc::UnboundedSender<SuggestionFeedback>,
    ) -> Self {
        Self::build(config, verifier, store, Some(feedback))
    }

    fn build(
        config: ServerConfig,
        verifier: Arc<dyn TokenVerifier>,
        store: Arc<dyn AnnotationStore>,
        feedback: Option<mpsc::UnboundedSender<SuggestionFeedback>>,
    ) -> Self {
        let registry = RoomRegistry::new(config.room_config(), store, feedback);
        Self {
            shared: Arc::new(Shared {
                config,
                registry,
                verifier,
                counters: Counters::default(),
            }),
        }
    }

    pub async fn bind(&self) -> Result<TcpListener, ServerError> {
        let addr = &self.shared.config.bind_addr;
        TcpListener::bind(addr).await.map_err(|source| ServerError::Bind {
            addr: addr.clone(),
            source,
        })
    }

    /// Bind and serve until the accept loop fails.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        log::info!("Collaboration server listening on {}", listener.local_addr()?);
        loop {
            let (stream, addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    log::warn!("Accept failed: {e}");
                    continue;
                }
            };
            log::debug!("New TCP connection from {addr}");

            let shared = Arc::clone(&self.shared);
            tokio::spawn(async move {
                if let Err(e) = connection::serve(stream, shared).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Push an AI suggestion into a live room. `Ok(false)` if nobody is connected.
    pub async fn push_suggestion(&self, key: &DocumentKey, draft: SuggestionDraft) -> Result<bool, CollabError> {
        self.shared.registry.push(key, EngineInput::Suggestion(draft)).await
    }

    /// Push batch task statistics into a live room.
    pub async fn push_progress(&self, key: &DocumentKey, stats: TaskStats) -> Result<bool, CollabError> {
        self.shared.registry.push(key, EngineInput::Progress(stats)).await
    }

    pub async fn stats(&self) -> ServerStats {
        let c = &self.shared.counters;
        ServerStats {
            total_connections: c.total_connections.load(Ordering::Relaxed),
            active_connections: c.active_connections.load(Ordering::Relaxed),
            total_messages: c.total_messages.load(Ordering::Relaxed),
            lagged_frames: c.lagged_frames.load(Ordering::Relaxed),
            active_rooms: self.shared.registry.room_count().await,
        }
    }

    pub async fn room_stats(&self) -> Vec<RoomStats> {
        self.shared.registry.room_stats().await
    }

    pub fn config(&self) -> &ServerConfig {
        &self.shared.config
    }
}
