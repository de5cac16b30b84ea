//! Message router.
//!
//! Runs inside a room actor. Every inbound message from one connection is
//! dispatched to exactly one component and turned into a list of
//! [`Delivery`] values: room-wide broadcasts for state changes, unicasts for
//! errors and idempotent no-op replies. The room serializes each broadcast
//! once and fans it out.
//!
//! ```text
//! user_joined / user_left / activity                 ──► PresenceTracker
//! suggestion / accept_suggestion / reject_suggestion ──► SuggestionStream
//! annotation_submitted / resolve_conflict            ──► ConflictDetector
//! progress_update                                    ──► progress::recompute
//! ```

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::auth::Identity;
use crate::conflict::CheckOutcome;
use crate::error::CollabError;
use crate::presence::PresenceStatus;
use crate::protocol::{
    AcceptSuggestionPayload, Annotation, AnnotationSource, ConnectionId, DeduplicatedPayload, Inbound,
    JoinPayload, Outbound, RejectSuggestionPayload, ResolveConflictPayload, Role, RoomMode,
    SuggestionResolvedPayload,
};
use crate::room::RoomState;
use crate::suggestion::{SuggestionFeedback, Transition};

/// Where an outbound message goes.
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    /// Every channel in the room.
    Broadcast(Outbound),
    /// One channel only.
    Unicast(ConnectionId, Outbound),
}

/// The sender of an inbound message.
#[derive(Debug, Clone, PartialEq)]
pub struct Origin {
    pub conn: ConnectionId,
    pub user_id: String,
    pub name: String,
    pub role: Role,
}

impl Origin {
    pub fn from_identity(conn: ConnectionId, identity: &Identity) -> Self {
        Self {
            conn,
            user_id: identity.user_id.clone(),
            name: identity.name.clone(),
            role: identity.role,
        }
    }

    /// The in-process AI engine. Unicasts addressed to it are dropped.
    pub fn engine() -> Self {
        Self {
            conn: Uuid::nil(),
            user_id: "engine".to_string(),
            name: "AI engine".to_string(),
            role: Role::Engine,
        }
    }
}

/// Route one message; failures become an `error` unicast to the sender.
pub async fn route(room: &mut RoomState, origin: &Origin, message: Inbound) -> Vec<Delivery> {
    let kind = message.kind();
    match dispatch(room, origin, message).await {
        Ok(deliveries) => deliveries,
        Err(err) => {
            log::debug!("'{kind}' from {} on {} failed: {err}", origin.user_id, room.key());
            reject(room, origin.conn, err)
        }
    }
}

/// Turn an error into deliveries. A store failure also degrades the room.
pub fn reject(room: &mut RoomState, conn: ConnectionId, err: CollabError) -> Vec<Delivery> {
    match err {
        CollabError::UpstreamStoreUnavailable(_) => room.degrade(conn, &err),
        err => vec![Delivery::Unicast(conn, Outbound::error(&err))],
    }
}

/// Dispatch one message to its component.
pub async fn dispatch(
    room: &mut RoomState,
    origin: &Origin,
    message: Inbound,
) -> Result<Vec<Delivery>, CollabError> {
    let now = Utc::now();
    match message {
        Inbound::Authenticate(_) => Err(CollabError::MalformedMessage {
            kind: "authenticate".to_string(),
            reason: "connection is already authenticated".to_string(),
        }),
        Inbound::Heartbeat => Ok(vec![Delivery::Unicast(origin.conn, Outbound::heartbeat_ack())]),
        Inbound::UserJoined(payload) => user_joined(room, origin, payload, now),
        Inbound::UserLeft => Ok(room
            .presence
            .leave(&origin.user_id)
            .map(|delta| Delivery::Broadcast(delta.into_outbound()))
            .into_iter()
            .collect()),
        Inbound::Activity(status) => activity(room, origin, status, now),
        Inbound::Suggestion(draft) => {
            require_engine(origin, "suggestion")?;
            require_full(room)?;
            let suggestion = room.suggestions.push(draft, now)?;
            log::info!(
                "Suggestion {} pushed to {} (confidence {:.2})",
                suggestion.id,
                room.key(),
                suggestion.confidence
            );
            Ok(vec![Delivery::Broadcast(Outbound::Suggestion(suggestion))])
        }
        Inbound::AcceptSuggestion(payload) => {
            require_full(room)?;
            accept_suggestion(room, origin, payload, now).await
        }
        Inbound::RejectSuggestion(payload) => {
            require_full(room)?;
            reject_suggestion(room, origin, payload, now).await
        }
        Inbound::AnnotationSubmitted(draft) => {
            require_full(room)?;
            draft.validate()?;
            let annotation = Annotation::from_draft(draft, origin.user_id.as_str(), AnnotationSource::Human);
            submit(room, origin, annotation, now).await
        }
        Inbound::ResolveConflict(payload) => {
            require_full(room)?;
            resolve_conflict(room, origin, payload, now).await
        }
        Inbound::ProgressUpdate(stats) => {
            require_engine(origin, "progress_update")?;
            room.set_task_stats(stats);
            Ok(vec![Delivery::Broadcast(Outbound::ProgressUpdate(room.progress()))])
        }
    }
}

fn require_engine(origin: &Origin, kind: &str) -> Result<(), CollabError> {
    if origin.role == Role::Engine {
        Ok(())
    } else {
        Err(CollabError::NotPermitted(kind.to_string()))
    }
}

fn require_full(room: &RoomState) -> Result<(), CollabError> {
    match room.mode() {
        RoomMode::Full => Ok(()),
        RoomMode::PresenceOnly => Err(CollabError::PresenceOnly),
    }
}

fn user_joined(
    room: &mut RoomState,
    origin: &Origin,
    payload: JoinPayload,
    now: DateTime<Utc>,
) -> Result<Vec<Delivery>, CollabError> {
    if origin.role == Role::Engine {
        return Err(CollabError::NotPermitted("user_joined".to_string()));
    }
    let name = payload.name.unwrap_or_else(|| origin.name.clone());
    let delta = room.presence.join(origin.conn, &origin.user_id, &name, origin.role, now);
    Ok(vec![Delivery::Broadcast(delta.into_outbound())])
}

fn activity(
    room: &mut RoomState,
    origin: &Origin,
    status: PresenceStatus,
    now: DateTime<Utc>,
) -> Result<Vec<Delivery>, CollabError> {
    if origin.role == Role::Engine {
        return Err(CollabError::NotPermitted("activity".to_string()));
    }
    let mut deliveries = Vec::new();
    // Activity after an explicit user_left brings the user back.
    if room.presence.get(&origin.user_id).is_none() {
        let delta = room.presence.join(origin.conn, &origin.user_id, &origin.name, origin.role, now);
        deliveries.push(Delivery::Broadcast(delta.into_outbound()));
    }
    if let Some(delta) = room.presence.touch(&origin.user_id, status, now) {
        deliveries.push(Delivery::Broadcast(delta.into_outbound()));
    }
    Ok(deliveries)
}

/// Run an annotation through conflict detection and commit it if clean.
async fn submit(
    room: &mut RoomState,
    origin: &Origin,
    annotation: Annotation,
    now: DateTime<Utc>,
) -> Result<Vec<Delivery>, CollabError> {
    match room.conflicts.check(annotation, now) {
        CheckOutcome::Clean(annotation) => {
            room.store().commit(room.key(), &annotation).await?;
            log::debug!("Committed annotation {} on {}", annotation.id, room.key());
            room.conflicts.insert(annotation.clone());
            Ok(vec![Delivery::Broadcast(Outbound::AnnotationCommitted(annotation))])
        }
        CheckOutcome::Duplicate { existing_id } => Ok(vec![Delivery::Unicast(
            origin.conn,
            Outbound::AnnotationDeduplicated(DeduplicatedPayload {
                existing_annotation_id: existing_id,
            }),
        )]),
        CheckOutcome::Conflicted(conflicts) => Ok(conflicts
            .into_iter()
            .map(|c| Delivery::Broadcast(Outbound::ConflictDetected(c)))
            .collect()),
    }
}

/// First caller's transition is broadcast; later callers get a tagged unicast.
fn resolution_delivery(origin: &Origin, transition: &Transition) -> Delivery {
    let msg = Outbound::SuggestionResolved(SuggestionResolvedPayload {
        suggestion: transition.suggestion.clone(),
        outcome: transition.outcome,
    });
    if transition.is_applied() {
        Delivery::Broadcast(msg)
    } else {
        Delivery::Unicast(origin.conn, msg)
    }
}

async fn accept_suggestion(
    room: &mut RoomState,
    origin: &Origin,
    payload: AcceptSuggestionPayload,
    now: DateTime<Utc>,
) -> Result<Vec<Delivery>, CollabError> {
    let transition = room.suggestions.accept(&payload.suggestion_id, &origin.user_id, now)?;
    let mut deliveries = vec![resolution_delivery(origin, &transition)];
    if !transition.is_applied() {
        return Ok(deliveries);
    }
    room.send_feedback(SuggestionFeedback::from_suggestion(room.key(), &transition.suggestion));

    for annotation in transition.suggestion.to_annotations(&origin.user_id) {
        match submit(room, origin, annotation, now).await {
            Ok(more) => deliveries.extend(more),
            Err(err) => {
                deliveries.extend(reject(room, origin.conn, err));
                return Ok(deliveries);
            }
        }
    }
    deliveries.push(room.refresh_progress().await);
    Ok(deliveries)
}

async fn reject_suggestion(
    room: &mut RoomState,
    origin: &Origin,
    payload: RejectSuggestionPayload,
    now: DateTime<Utc>,
) -> Result<Vec<Delivery>, CollabError> {
    let transition =
        room.suggestions
            .reject(&payload.suggestion_id, &origin.user_id, payload.reason, now)?;
    let mut deliveries = vec![resolution_delivery(origin, &transition)];
    if transition.is_applied() {
        room.send_feedback(SuggestionFeedback::from_suggestion(room.key(), &transition.suggestion));
        deliveries.push(room.refresh_progress().await);
    }
    Ok(deliveries)
}

async fn resolve_conflict(
    room: &mut RoomState,
    origin: &Origin,
    payload: ResolveConflictPayload,
    now: DateTime<Utc>,
) -> Result<Vec<Delivery>, CollabError> {
    let plan = room
        .conflicts
        .plan_resolution(&payload.conflict_id, &origin.user_id, payload.resolution, now)?;

    // The winner is written before any loser is removed.
    let store = room.store();
    if let Some(annotation) = &plan.commit {
        store.commit(room.key(), annotation).await?;
    }
    let mut removed: Vec<&str> = Vec::new();
    for id in &plan.remove {
        if let Err(err) = store.remove(room.key(), id).await {
            rollback(room, plan.commit.as_ref(), &removed).await;
            return Err(err);
        }
        removed.push(id);
    }

    let applied = room.conflicts.apply_resolution(plan);
    let mut deliveries = vec![Delivery::Broadcast(Outbound::ConflictResolved(applied.record))];
    deliveries.extend(
        applied
            .raised
            .into_iter()
            .map(|c| Delivery::Broadcast(Outbound::ConflictDetected(c))),
    );
    deliveries.push(room.refresh_progress().await);
    Ok(deliveries)
}

/// Undo the store writes of a resolution that failed halfway.
async fn rollback(room: &RoomState, committed: Option<&Annotation>, removed: &[&str]) {
    let store = room.store();
    let mut intact = true;
    if let Some(annotation) = committed {
        if let Err(e) = store.remove(room.key(), &annotation.id).await {
            log::error!("Rollback on {}: could not remove {}: {e}", room.key(), annotation.id);
            intact = false;
        }
    }
    for id in removed {
        let Some(annotation) = room.conflicts.committed(id) else {
            continue;
        };
        if let Err(e) = store.commit(room.key(), annotation).await {
            log::error!("Rollback on {}: could not restore {id}: {e}", room.key());
            intact = false;
        }
    }
    if intact {
        log::warn!("Rolled back a partial resolution on {}", room.key());
    }
}
