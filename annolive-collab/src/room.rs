//! Document room actor.
//!
//! One tokio task per `(projectId, documentId)` owns every piece of room
//! state and drains one bounded command queue. Connections never touch the
//! state directly; they send [`RoomCommand`]s. Because only the actor
//! mutates the state, presence uniqueness and single resolution hold without
//! a mutex.
//!
//! ```text
//! connection task ──► RoomCommand ──► mpsc ──► room task ──► router
//!        ▲                                          │
//!        ├──── broadcast::Receiver<Frame> ◄─────────┤ (state changes)
//!        └──── mpsc::Receiver<Frame> ◄──────────────┘ (errors, no-ops)
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{broadcast, mpsc, oneshot};
use uuid::Uuid;

use crate::auth::Identity;
use crate::broadcast::{BroadcastGroup, BroadcastStats, Frame};
use crate::conflict::ConflictDetector;
use crate::error::CollabError;
use crate::presence::PresenceTracker;
use crate::progress::{self, ProgressSnapshot, TaskStats};
use crate::protocol::{ConnectionId, DocumentKey, Inbound, Outbound, Role, RoomMode, RoomModePayload, RoomSnapshot};
use crate::registry::RoomRegistry;
use crate::router::{self, Delivery, Origin};
use crate::store::AnnotationStore;
use crate::suggestion::{SuggestionDraft, SuggestionFeedback, SuggestionStream};

/// Per-room limits and timers.
#[derive(Debug, Clone)]
pub struct RoomConfig {
    pub max_connections: usize,
    pub max_pending_suggestions: usize,
    pub max_resolved_suggestions: usize,
    pub max_resolved_conflicts: usize,
    /// Frames buffered per subscriber before it lags.
    pub broadcast_capacity: usize,
    /// Commands buffered in the room queue.
    pub queue_capacity: usize,
    pub idle_after: Duration,
    pub idle_check_interval: Duration,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            max_connections: 100,
            max_pending_suggestions: 500,
            max_resolved_suggestions: 1_000,
            max_resolved_conflicts: 1_000,
            broadcast_capacity: 256,
            queue_capacity: 1_024,
            idle_after: Duration::from_secs(120),
            idle_check_interval: Duration::from_secs(5),
        }
    }
}

/// Input from the AI engine through the in-process API.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineInput {
    Suggestion(SuggestionDraft),
    Progress(TaskStats),
}

impl EngineInput {
    fn into_inbound(self) -> Inbound {
        match self {
            EngineInput::Suggestion(draft) => Inbound::Suggestion(draft),
            EngineInput::Progress(stats) => Inbound::ProgressUpdate(stats),
        }
    }
}

/// What a successful join hands back to the connection.
#[derive(Debug)]
pub struct JoinAccepted {
    /// Subscribed inside the actor, so nothing broadcast after the snapshot is missed.
    pub broadcast: broadcast::Receiver<Frame>,
    pub snapshot: Frame,
}

#[derive(Debug)]
pub enum RoomCommand {
    Join {
        conn: ConnectionId,
        identity: Identity,
        unicast: mpsc::Sender<Frame>,
        reply: oneshot::Sender<Result<JoinAccepted, CollabError>>,
    },
    Message {
        conn: ConnectionId,
        message: Inbound,
    },
    Leave {
        conn: ConnectionId,
    },
    Engine {
        input: EngineInput,
        reply: oneshot::Sender<Result<(), CollabError>>,
    },
    Stats {
        reply: oneshot::Sender<RoomStats>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct RoomStats {
    pub key: DocumentKey,
    pub mode: RoomMode,
    pub connections: usize,
    pub present_users: usize,
    pub pending_suggestions: usize,
    pub open_conflicts: usize,
    pub committed_annotations: usize,
    pub broadcast: BroadcastStats,
}

/// Cheap handle to a running room.
#[derive(Debug, Clone)]
pub struct RoomHandle {
    pub(crate) id: Uuid,
    key: DocumentKey,
    tx: mpsc::Sender<RoomCommand>,
}

impl RoomHandle {
    pub fn key(&self) -> &DocumentKey {
        &self.key
    }

    /// Fails once the room has retired; the command comes back in the error.
    pub async fn send(&self, cmd: RoomCommand) -> Result<(), mpsc::error::SendError<RoomCommand>> {
        self.tx.send(cmd).await
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

struct Member {
    origin: Origin,
    unicast: mpsc::Sender<Frame>,
}

/// State owned by one room task.
pub struct RoomState {
    key: DocumentKey,
    config: RoomConfig,
    mode: RoomMode,
    synced: bool,
    members: HashMap<ConnectionId, Member>,
    pub(crate) presence: PresenceTracker,
    pub(crate) suggestions: SuggestionStream,
    pub(crate) conflicts: ConflictDetector,
    stats: TaskStats,
    store: Arc<dyn AnnotationStore>,
    feedback: Option<mpsc::UnboundedSender<SuggestionFeedback>>,
    group: BroadcastGroup,
}

impl RoomState {
    pub fn new(
        key: DocumentKey,
        config: RoomConfig,
        store: Arc<dyn AnnotationStore>,
        feedback: Option<mpsc::UnboundedSender<SuggestionFeedback>>,
    ) -> Self {
        let document_id = key.document_id.clone();
        Self {
            presence: PresenceTracker::new(document_id.clone()),
            suggestions: SuggestionStream::new(
                document_id.clone(),
                config.max_pending_suggestions,
                config.max_resolved_suggestions,
            ),
            conflicts: ConflictDetector::new(document_id, config.max_resolved_conflicts),
            group: BroadcastGroup::new(config.broadcast_capacity),
            key,
            config,
            mode: RoomMode::PresenceOnly,
            synced: false,
            members: HashMap::new(),
            stats: TaskStats::default(),
            store,
            feedback,
        }
    }

    pub fn key(&self) -> &DocumentKey {
        &self.key
    }

    pub fn mode(&self) -> RoomMode {
        self.mode
    }

    pub fn store(&self) -> Arc<dyn AnnotationStore> {
        Arc::clone(&self.store)
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn connection_count(&self) -> usize {
        self.members.len()
    }

    /// Fetch committed annotations and task counters from the store.
    pub async fn reconcile(&mut self) -> Result<(), CollabError> {
        let annotations = self.store.annotations(&self.key).await?;
        let stats = self.store.task_stats(&self.key).await?;
        log::info!("Room {} reconciled {} annotation(s)", self.key, annotations.len());
        self.conflicts.load(annotations);
        self.stats = stats;
        self.mode = RoomMode::Full;
        self.synced = true;
        Ok(())
    }

    /// Switch to presence-only mode after a store failure.
    pub fn degrade(&mut self, conn: ConnectionId, err: &CollabError) -> Vec<Delivery> {
        let mut deliveries = Vec::new();
        if self.mode == RoomMode::Full {
            log::warn!("Room {} degraded to presence-only: {err}", self.key);
            self.mode = RoomMode::PresenceOnly;
            deliveries.push(Delivery::Broadcast(Outbound::RoomMode(RoomModePayload {
                mode: RoomMode::PresenceOnly,
            })));
        }
        deliveries.push(Delivery::Unicast(conn, Outbound::error(err)));
        deliveries
    }

    pub fn set_task_stats(&mut self, stats: TaskStats) {
        self.stats = stats;
    }

    pub fn progress(&self) -> ProgressSnapshot {
        progress::recompute(&self.stats, &self.presence)
    }

    /// Re-read task counters (keeping the last known ones if the store is down).
    pub async fn refresh_progress(&mut self) -> Delivery {
        match self.store.task_stats(&self.key).await {
            Ok(stats) => self.stats = stats,
            Err(e) => log::warn!("Room {} keeps cached task stats: {e}", self.key),
        }
        Delivery::Broadcast(Outbound::ProgressUpdate(self.progress()))
    }

    pub fn send_feedback(&self, feedback: SuggestionFeedback) {
        if let Some(tx) = &self.feedback {
            if tx.send(feedback).is_err() {
                log::debug!("Suggestion feedback sink is gone");
            }
        }
    }

    pub fn snapshot(&self) -> RoomSnapshot {
        RoomSnapshot {
            project_id: self.key.project_id.clone(),
            document_id: self.key.document_id.clone(),
            mode: self.mode,
            presence: self.presence.entries(),
            suggestions: self.suggestions.pending(),
            conflicts: self.conflicts.open_conflicts().to_vec(),
            annotations: self.conflicts.annotations(),
            progress: self.progress(),
        }
    }

    /// Admit a connection: capacity check, reconciliation, presence, snapshot.
    pub async fn join(
        &mut self,
        conn: ConnectionId,
        identity: Identity,
        unicast: mpsc::Sender<Frame>,
    ) -> Result<JoinAccepted, CollabError> {
        if self.members.len() >= self.config.max_connections {
            log::warn!("Room {} is full, refusing {}", self.key, identity.user_id);
            return Err(CollabError::RoomFull(self.config.max_connections));
        }

        let origin = Origin::from_identity(conn, &identity);
        self.members.insert(conn, Member { origin: origin.clone(), unicast });

        let mut deliveries = Vec::new();
        if self.mode == RoomMode::PresenceOnly {
            let was_synced = self.synced;
            match self.reconcile().await {
                Ok(()) if was_synced => {
                    log::info!("Room {} restored to full mode", self.key);
                    deliveries.push(Delivery::Broadcast(Outbound::RoomMode(RoomModePayload {
                        mode: RoomMode::Full,
                    })));
                }
                Ok(()) => {}
                Err(err) => {
                    log::warn!("Room {} starts presence-only: {err}", self.key);
                    self.synced = true;
                    deliveries.push(Delivery::Unicast(conn, Outbound::error(&err)));
                }
            }
        }

        if origin.role != Role::Engine {
            let delta = self
                .presence
                .join(conn, &origin.user_id, &origin.name, origin.role, Utc::now());
            deliveries.push(Delivery::Broadcast(delta.into_outbound()));
        }

        // Broadcasts from this join go out before the joiner subscribes;
        // the snapshot already contains them.
        let (broadcasts, unicasts): (Vec<_>, Vec<_>) = deliveries
            .into_iter()
            .partition(|d| matches!(d, Delivery::Broadcast(_)));
        self.deliver(broadcasts);
        let receiver = self.group.subscribe();
        let snapshot: Frame = Outbound::Snapshot(self.snapshot()).encode()?.into();
        self.deliver(unicasts);

        log::info!(
            "{} ({:?}) joined room {} [{} connection(s)]",
            origin.user_id,
            origin.role,
            self.key,
            self.members.len()
        );
        Ok(JoinAccepted {
            broadcast: receiver,
            snapshot,
        })
    }

    /// Drop a connection. The presence entry goes with the user's last socket.
    pub fn leave(&mut self, conn: ConnectionId) {
        let Some(member) = self.members.remove(&conn) else {
            return;
        };
        log::info!("{} left room {}", member.origin.user_id, self.key);
        if member.origin.role == Role::Engine {
            return;
        }
        if let Some(delta) = self.presence.disconnect(conn, &member.origin.user_id) {
            self.deliver(vec![Delivery::Broadcast(delta.into_outbound())]);
        }
    }

    pub async fn handle_message(&mut self, conn: ConnectionId, message: Inbound) {
        let Some(origin) = self.members.get(&conn).map(|m| m.origin.clone()) else {
            log::debug!("Dropping '{}' from unknown connection {conn}", message.kind());
            return;
        };
        let deliveries = router::route(self, &origin, message).await;
        self.deliver(deliveries);
    }

    /// Apply engine input; errors go back to the caller instead of a socket.
    pub async fn handle_engine(&mut self, input: EngineInput) -> Result<(), CollabError> {
        let origin = Origin::engine();
        match router::dispatch(self, &origin, input.into_inbound()).await {
            Ok(deliveries) => {
                self.deliver(deliveries);
                Ok(())
            }
            Err(err) => {
                let deliveries = router::reject(self, origin.conn, err.clone());
                self.deliver(deliveries);
                Err(err)
            }
        }
    }

    pub fn sweep_idle(&mut self) {
        let idle_after = chrono::Duration::from_std(self.config.idle_after)
            .unwrap_or_else(|_| chrono::Duration::seconds(120));
        let deltas = self.presence.sweep_idle(Utc::now(), idle_after);
        if !deltas.is_empty() {
            log::debug!("Room {}: {} user(s) went idle", self.key, deltas.len());
            self.deliver(
                deltas
                    .into_iter()
                    .map(|d| Delivery::Broadcast(d.into_outbound()))
                    .collect(),
            );
        }
    }

    pub fn stats(&self) -> RoomStats {
        RoomStats {
            key: self.key.clone(),
            mode: self.mode,
            connections: self.members.len(),
            present_users: self.presence.len(),
            pending_suggestions: self.suggestions.pending_count(),
            open_conflicts: self.conflicts.open_conflicts().len(),
            committed_annotations: self.conflicts.committed_count(),
            broadcast: self.group.stats(),
        }
    }

    /// Serialize and send. Broadcasts are encoded once for the whole room.
    /// A connection whose unicast queue is full is dropped from the room.
    pub fn deliver(&mut self, deliveries: Vec<Delivery>) {
        let mut overflowed = Vec::new();
        for delivery in deliveries {
            match delivery {
                Delivery::Broadcast(msg) => {
                    if let Err(e) = self.group.broadcast(&msg) {
                        log::error!("Room {}: failed to encode '{}': {e}", self.key, msg.kind());
                    }
                }
                Delivery::Unicast(conn, msg) => {
                    let Some(member) = self.members.get(&conn) else {
                        log::trace!("Room {}: no connection {conn} for '{}'", self.key, msg.kind());
                        continue;
                    };
                    let frame: Frame = match msg.encode() {
                        Ok(frame) => frame.into(),
                        Err(e) => {
                            log::error!("Room {}: failed to encode '{}': {e}", self.key, msg.kind());
                            continue;
                        }
                    };
                    match member.unicast.try_send(frame) {
                        Ok(()) | Err(mpsc::error::TrySendError::Closed(_)) => {}
                        Err(mpsc::error::TrySendError::Full(_)) => {
                            log::warn!("Room {}: connection {conn} is not reading; dropping it", self.key);
                            overflowed.push(conn);
                        }
                    }
                }
            }
        }
        for conn in overflowed {
            self.leave(conn);
        }
    }

    async fn handle(&mut self, cmd: RoomCommand) {
        match cmd {
            RoomCommand::Join {
                conn,
                identity,
                unicast,
                reply,
            } => {
                let result = self.join(conn, identity, unicast).await;
                let failed = result.is_err();
                if reply.send(result).is_err() || failed {
                    // The connection gave up (or was refused); forget it.
                    self.leave(conn);
                }
            }
            RoomCommand::Message { conn, message } => self.handle_message(conn, message).await,
            RoomCommand::Leave { conn } => self.leave(conn),
            RoomCommand::Engine { input, reply } => {
                let result = self.handle_engine(input).await;
                let _ = reply.send(result);
            }
            RoomCommand::Stats { reply } => {
                let _ = reply.send(self.stats());
            }
        }
    }
}

/// Spawn the actor for `state` and return its handle.
pub(crate) fn spawn(state: RoomState, registry: Arc<RoomRegistry>) -> RoomHandle {
    let (tx, rx) = mpsc::channel(state.config.queue_capacity.max(1));
    let handle = RoomHandle {
        id: Uuid::new_v4(),
        key: state.key.clone(),
        tx,
    };
    let id = handle.id;
    tokio::spawn(run(state, rx, registry, id));
    handle
}

async fn run(mut state: RoomState, mut rx: mpsc::Receiver<RoomCommand>, registry: Arc<RoomRegistry>, id: Uuid) {
    log::info!("Room {} started", state.key);
    let period = state.config.idle_check_interval.max(Duration::from_millis(10));
    let mut sweep = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            cmd = rx.recv() => {
                let Some(cmd) = cmd else { break };
                state.handle(cmd).await;
                // Only commands can empty a room.
                if state.is_empty() && registry.retire(&state.key, id, &mut rx).await {
                    break;
                }
            }
            _ = sweep.tick() => state.sweep_idle(),
        }
    }
    log::info!("Room {} retired", state.key);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryAnnotationStore;

    fn identity(user: &str, role: Role) -> Identity {
        Identity {
            user_id: user.to_string(),
            name: user.to_string(),
            role,
            allowed_documents: vec!["doc1".into()],
        }
    }

    fn room(store: Arc<MemoryAnnotationStore>, config: RoomConfig) -> RoomState {
        RoomState::new(DocumentKey::new("p1", "doc1"), config, store, None)
    }

    fn decode(frame: &Frame) -> Outbound {
        Outbound::decode(frame).unwrap()
    }

    #[tokio::test]
    async fn test_join_snapshot_lists_joiner() {
        let store = Arc::new(MemoryAnnotationStore::new());
        let mut room = room(store, RoomConfig::default());
        let (tx, _rx) = mpsc::channel(16);

        let accepted = room.join(Uuid::new_v4(), identity("alice", Role::Annotator), tx).await.unwrap();
        match decode(&accepted.snapshot) {
            Outbound::Snapshot(s) => {
                assert_eq!(s.mode, RoomMode::Full);
                assert_eq!(s.presence.len(), 1);
                assert_eq!(s.presence[0].user_id, "alice");
            }
            other => panic!("expected snapshot, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_existing_members_see_joiner() {
        let store = Arc::new(MemoryAnnotationStore::new());
        let mut room = room(store, RoomConfig::default());
        let (tx, _rx) = mpsc::channel(16);
        let mut alice = room
            .join(Uuid::new_v4(), identity("alice", Role::Annotator), tx.clone())
            .await
            .unwrap();
        let mut bob = room.join(Uuid::new_v4(), identity("bob", Role::Annotator), tx).await.unwrap();

        match decode(&alice.broadcast.recv().await.unwrap()) {
            Outbound::UserJoined(entry) => assert_eq!(entry.user_id, "bob"),
            other => panic!("expected user_joined, got {other:?}"),
        }
        // The joiner does not receive its own join.
        assert!(bob.broadcast.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_room_full() {
        let store = Arc::new(MemoryAnnotationStore::new());
        let config = RoomConfig {
            max_connections: 1,
            ..RoomConfig::default()
        };
        let mut room = room(store, config);
        let (tx, _rx) = mpsc::channel(16);
        room.join(Uuid::new_v4(), identity("alice", Role::Annotator), tx.clone())
            .await
            .unwrap();
        let err = room
            .join(Uuid::new_v4(), identity("bob", Role::Annotator), tx)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "RoomFull");
    }

    #[tokio::test]
    async fn test_engine_never_in_presence() {
        let store = Arc::new(MemoryAnnotationStore::new());
        let mut room = room(store, RoomConfig::default());
        let (tx, _rx) = mpsc::channel(16);
        let conn = Uuid::new_v4();
        room.join(conn, identity("engine-1", Role::Engine), tx).await.unwrap();
        assert!(room.presence.is_empty());
        assert_eq!(room.connection_count(), 1);
        room.leave(conn);
        assert!(room.is_empty());
    }

    #[tokio::test]
    async fn test_last_socket_removes_presence() {
        let store = Arc::new(MemoryAnnotationStore::new());
        let mut room = room(store, RoomConfig::default());
        let (tx, _rx) = mpsc::channel(16);
        let (a1, a2) = (Uuid::new_v4(), Uuid::new_v4());
        room.join(a1, identity("alice", Role::Annotator), tx.clone()).await.unwrap();
        room.join(a2, identity("alice", Role::Annotator), tx).await.unwrap();
        assert_eq!(room.presence.len(), 1);

        room.leave(a1);
        assert!(room.presence.get("alice").is_some());
        room.leave(a2);
        assert!(room.presence.get("alice").is_none());
    }

    #[tokio::test]
    async fn test_degraded_join_then_recovery() {
        let store = Arc::new(MemoryAnnotationStore::new());
        store.set_available(false);
        let mut room = room(store.clone(), RoomConfig::default());

        let (tx, mut unicast) = mpsc::channel(16);
        let mut alice = room
            .join(Uuid::new_v4(), identity("alice", Role::Annotator), tx.clone())
            .await
            .unwrap();
        assert_eq!(room.mode(), RoomMode::PresenceOnly);
        match decode(&unicast.recv().await.unwrap()) {
            Outbound::Error(e) => assert_eq!(e.code, "UpstreamStoreUnavailable"),
            other => panic!("expected error, got {other:?}"),
        }

        store.set_available(true);
        room.join(Uuid::new_v4(), identity("bob", Role::Annotator), tx).await.unwrap();
        assert_eq!(room.mode(), RoomMode::Full);
        match decode(&alice.broadcast.recv().await.unwrap()) {
            Outbound::RoomMode(p) => assert_eq!(p.mode, RoomMode::Full),
            other => panic!("expected room_mode, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_full_unicast_queue_drops_connection() {
        let store = Arc::new(MemoryAnnotationStore::new());
        let mut room = room(store, RoomConfig::default());
        let (tx, mut unicast) = mpsc::channel(1);
        let conn = Uuid::new_v4();
        room.join(conn, identity("alice", Role::Annotator), tx).await.unwrap();

        // Each repeated authenticate earns an error unicast.
        let stray = || {
            Inbound::Authenticate(crate::protocol::AuthenticatePayload {
                token: "t".into(),
                document_id: None,
            })
        };
        room.handle_message(conn, stray()).await;
        room.handle_message(conn, stray()).await;

        assert!(room.is_empty());
        assert!(room.presence.get("alice").is_none());
        match decode(&unicast.recv().await.unwrap()) {
            Outbound::Error(e) => assert_eq!(e.code, "MalformedMessage"),
            other => panic!("expected error, got {other:?}"),
        }
        // The room let go of the sender.
        assert!(unicast.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_idle_sweep() {
        let store = Arc::new(MemoryAnnotationStore::new());
        let config = RoomConfig {
            idle_after: Duration::ZERO,
            ..RoomConfig::default()
        };
        let mut room = room(store, config);
        let (tx, _rx) = mpsc::channel(16);
        let mut alice = room
            .join(Uuid::new_v4(), identity("alice", Role::Annotator), tx)
            .await
            .unwrap();

        room.sweep_idle();
        match decode(&alice.broadcast.recv().await.unwrap()) {
            Outbound::PresenceUpdated(entry) => {
                assert_eq!(entry.status, crate::presence::PresenceStatus::Idle)
            }
            other => panic!("expected presence_updated, got {other:?}"),
        }
    }
}
