//! JSON envelope protocol spoken over the document WebSocket.
//!
//! Wire format (one text frame per message):
//! ```text
//! { "type": "<message kind>", "payload": { ...camelCase fields... } }
//! ```
//!
//! Inbound frames are parsed in two steps so that an unknown `type` is told
//! apart from a known `type` whose payload does not fit: the first yields
//! `UnknownMessageType`, the second `MalformedMessage`.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::conflict::{Conflict, Resolution, ResolutionRecord};
use crate::error::CollabError;
use crate::presence::{PresenceEntry, PresenceStatus};
use crate::progress::{ProgressSnapshot, TaskStats};
use crate::suggestion::{Suggestion, SuggestionDraft, SuggestionOutcome};

/// Identifier of one socket connection.
pub type ConnectionId = Uuid;

/// The unit of collaboration: one document inside one project.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentKey {
    pub project_id: String,
    pub document_id: String,
}

impl DocumentKey {
    pub fn new(project_id: impl Into<String>, document_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            document_id: document_id.into(),
        }
    }
}

impl fmt::Display for DocumentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.project_id, self.document_id)
    }
}

/// What an authenticated identity is allowed to do in a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    #[default]
    Annotator,
    Reviewer,
    /// The AI annotation engine. Never appears in presence.
    Engine,
}

/// Where a committed annotation came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AnnotationSource {
    Human,
    Suggestion {
        #[serde(rename = "suggestionId")]
        suggestion_id: String,
    },
    Resolution {
        #[serde(rename = "conflictId")]
        conflict_id: String,
    },
}

/// A labelled half-open character span `[start, end)` on a document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Annotation {
    pub id: String,
    pub annotator_id: String,
    pub label: String,
    pub start: u32,
    pub end: u32,
    #[serde(default)]
    pub text: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, String>,
    pub source: AnnotationSource,
    pub created_at: DateTime<Utc>,
}

impl Annotation {
    /// Materialize a draft with a fresh id.
    pub fn from_draft(
        draft: AnnotationDraft,
        annotator_id: impl Into<String>,
        source: AnnotationSource,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            annotator_id: annotator_id.into(),
            label: draft.label,
            start: draft.start,
            end: draft.end,
            text: draft.text,
            attributes: draft.attributes,
            source,
            created_at: Utc::now(),
        }
    }

    /// Half-open overlap: touching spans (`a.end == b.start`) do not overlap.
    pub fn overlaps(&self, other: &Annotation) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// True when one span lies entirely inside the other (identical included).
    pub fn nests_with(&self, other: &Annotation) -> bool {
        (self.start <= other.start && other.end <= self.end)
            || (other.start <= self.start && self.end <= other.end)
    }
}

/// Client-supplied annotation content before an id is assigned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnnotationDraft {
    pub label: String,
    pub start: u32,
    pub end: u32,
    #[serde(default)]
    pub text: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, String>,
}

impl AnnotationDraft {
    pub fn new(label: impl Into<String>, start: u32, end: u32, text: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            start,
            end,
            text: text.into(),
            attributes: BTreeMap::new(),
        }
    }

    /// Reject empty or inverted spans.
    pub fn validate(&self) -> Result<(), CollabError> {
        if self.start >= self.end {
            return Err(CollabError::InvalidSpan {
                start: self.start,
                end: self.end,
            });
        }
        Ok(())
    }
}

// ───────────────────────────────────────────────────────────────────
// Inbound
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticatePayload {
    pub token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ActivityPayload {
    status: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcceptSuggestionPayload {
    pub suggestion_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectSuggestionPayload {
    pub suggestion_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolveConflictPayload {
    pub conflict_id: String,
    pub resolution: Resolution,
}

/// A parsed inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Authenticate(AuthenticatePayload),
    Heartbeat,
    UserJoined(JoinPayload),
    UserLeft,
    Activity(PresenceStatus),
    Suggestion(SuggestionDraft),
    AcceptSuggestion(AcceptSuggestionPayload),
    RejectSuggestion(RejectSuggestionPayload),
    AnnotationSubmitted(AnnotationDraft),
    ResolveConflict(ResolveConflictPayload),
    ProgressUpdate(TaskStats),
}

#[derive(Deserialize)]
struct RawEnvelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: Value,
}

fn payload<T: DeserializeOwned>(kind: &str, value: Value) -> Result<T, CollabError> {
    // A missing payload is the same as an empty object.
    let value = if value.is_null() {
        Value::Object(serde_json::Map::new())
    } else {
        value
    };
    serde_json::from_value(value).map_err(|e| CollabError::MalformedMessage {
        kind: kind.to_string(),
        reason: e.to_string(),
    })
}

impl Inbound {
    /// Parse one text frame.
    pub fn parse(raw: &str) -> Result<Self, CollabError> {
        let envelope: RawEnvelope =
            serde_json::from_str(raw).map_err(|e| CollabError::MalformedMessage {
                kind: "envelope".to_string(),
                reason: e.to_string(),
            })?;
        let RawEnvelope { kind, payload: body } = envelope;

        let msg = match kind.as_str() {
            "authenticate" => Self::Authenticate(payload(&kind, body)?),
            "heartbeat" => Self::Heartbeat,
            "user_joined" => Self::UserJoined(payload(&kind, body)?),
            "user_left" => Self::UserLeft,
            "activity" => {
                let activity: ActivityPayload = payload(&kind, body)?;
                Self::Activity(activity.status.parse()?)
            }
            "suggestion" => Self::Suggestion(payload(&kind, body)?),
            "accept_suggestion" => Self::AcceptSuggestion(payload(&kind, body)?),
            "reject_suggestion" => Self::RejectSuggestion(payload(&kind, body)?),
            "annotation_submitted" => Self::AnnotationSubmitted(payload(&kind, body)?),
            "resolve_conflict" => Self::ResolveConflict(payload(&kind, body)?),
            "progress_update" => Self::ProgressUpdate(payload(&kind, body)?),
            _ => return Err(CollabError::UnknownMessageType(kind)),
        };
        Ok(msg)
    }

    /// The envelope `type` this message was parsed from.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Authenticate(_) => "authenticate",
            Self::Heartbeat => "heartbeat",
            Self::UserJoined(_) => "user_joined",
            Self::UserLeft => "user_left",
            Self::Activity(_) => "activity",
            Self::Suggestion(_) => "suggestion",
            Self::AcceptSuggestion(_) => "accept_suggestion",
            Self::RejectSuggestion(_) => "reject_suggestion",
            Self::AnnotationSubmitted(_) => "annotation_submitted",
            Self::ResolveConflict(_) => "resolve_conflict",
            Self::ProgressUpdate(_) => "progress_update",
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Outbound
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticatedPayload {
    pub connection_id: ConnectionId,
    pub user_id: String,
    pub role: Role,
    pub project_id: String,
    pub document_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatAckPayload {
    pub server_time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserLeftPayload {
    pub user_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuggestionResolvedPayload {
    pub suggestion: Suggestion,
    pub outcome: SuggestionOutcome,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeduplicatedPayload {
    pub existing_annotation_id: String,
}

/// Whether a room can serve annotation features right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomMode {
    Full,
    /// The annotation store is unreachable; only presence works.
    PresenceOnly,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomModePayload {
    pub mode: RoomMode,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

/// One-time catch-up state sent to a new member.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSnapshot {
    pub project_id: String,
    pub document_id: String,
    pub mode: RoomMode,
    pub presence: Vec<PresenceEntry>,
    pub suggestions: Vec<Suggestion>,
    pub conflicts: Vec<Conflict>,
    pub annotations: Vec<Annotation>,
    pub progress: ProgressSnapshot,
}

/// A message sent from the server to one or more connections.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum Outbound {
    Authenticated(AuthenticatedPayload),
    Snapshot(RoomSnapshot),
    HeartbeatAck(HeartbeatAckPayload),
    UserJoined(PresenceEntry),
    UserLeft(UserLeftPayload),
    PresenceUpdated(PresenceEntry),
    Suggestion(Suggestion),
    SuggestionResolved(SuggestionResolvedPayload),
    AnnotationCommitted(Annotation),
    AnnotationDeduplicated(DeduplicatedPayload),
    ConflictDetected(Conflict),
    ConflictResolved(ResolutionRecord),
    ProgressUpdate(ProgressSnapshot),
    RoomMode(RoomModePayload),
    Error(ErrorPayload),
}

impl Outbound {
    /// Build the wire form of an error.
    pub fn error(err: &CollabError) -> Self {
        Self::Error(ErrorPayload {
            code: err.code().to_string(),
            message: err.to_string(),
            details: err.details(),
        })
    }

    pub fn heartbeat_ack() -> Self {
        Self::HeartbeatAck(HeartbeatAckPayload {
            server_time: Utc::now(),
        })
    }

    /// Serialize to a JSON text frame.
    pub fn encode(&self) -> Result<String, CollabError> {
        serde_json::to_string(self).map_err(|e| CollabError::MalformedMessage {
            kind: self.kind().to_string(),
            reason: e.to_string(),
        })
    }

    /// Parse a server frame (used by clients).
    pub fn decode(raw: &str) -> Result<Self, CollabError> {
        serde_json::from_str(raw).map_err(|e| CollabError::MalformedMessage {
            kind: "outbound".to_string(),
            reason: e.to_string(),
        })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Authenticated(_) => "authenticated",
            Self::Snapshot(_) => "snapshot",
            Self::HeartbeatAck(_) => "heartbeat_ack",
            Self::UserJoined(_) => "user_joined",
            Self::UserLeft(_) => "user_left",
            Self::PresenceUpdated(_) => "presence_updated",
            Self::Suggestion(_) => "suggestion",
            Self::SuggestionResolved(_) => "suggestion_resolved",
            Self::AnnotationCommitted(_) => "annotation_committed",
            Self::AnnotationDeduplicated(_) => "annotation_deduplicated",
            Self::ConflictDetected(_) => "conflict_detected",
            Self::ConflictResolved(_) => "conflict_resolved",
            Self::ProgressUpdate(_) => "progress_update",
            Self::RoomMode(_) => "room_mode",
            Self::Error(_) => "error",
        }
    }
}

/// Client-side helper: wrap a payload in an envelope.
pub fn envelope(kind: &str, payload: Value) -> String {
    serde_json::json!({ "type": kind, "payload": payload }).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_authenticate() {
        let raw = envelope("authenticate", json!({"token": "abc", "documentId": "doc1"}));
        match Inbound::parse(&raw).unwrap() {
            Inbound::Authenticate(p) => {
                assert_eq!(p.token, "abc");
                assert_eq!(p.document_id.as_deref(), Some("doc1"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_parse_payloadless_messages() {
        assert_eq!(Inbound::parse(r#"{"type":"heartbeat"}"#).unwrap(), Inbound::Heartbeat);
        assert_eq!(
            Inbound::parse(r#"{"type":"user_left","payload":{}}"#).unwrap(),
            Inbound::UserLeft
        );
        assert_eq!(
            Inbound::parse(r#"{"type":"user_joined"}"#).unwrap(),
            Inbound::UserJoined(JoinPayload::default())
        );
    }

    #[test]
    fn test_unknown_type_is_distinct_from_malformed() {
        let err = Inbound::parse(r#"{"type":"chat","payload":{}}"#).unwrap_err();
        assert_eq!(err.code(), "UnknownMessageType");

        let err = Inbound::parse(r#"{"type":"annotation_submitted","payload":{"start":1}}"#)
            .unwrap_err();
        assert_eq!(err.code(), "MalformedMessage");

        let err = Inbound::parse("not json").unwrap_err();
        assert_eq!(err.code(), "MalformedMessage");
    }

    #[test]
    fn test_activity_rejects_unknown_status() {
        let ok = Inbound::parse(&envelope("activity", json!({"status": "annotating"}))).unwrap();
        assert_eq!(ok, Inbound::Activity(PresenceStatus::Annotating));

        let err = Inbound::parse(&envelope("activity", json!({"status": "sleeping"}))).unwrap_err();
        assert_eq!(err.code(), "InvalidStatus");
    }

    #[test]
    fn test_resolution_wire_forms() {
        let chosen = envelope(
            "resolve_conflict",
            json!({"conflictId": "c1", "resolution": {"chosenAnnotationId": "a1"}}),
        );
        match Inbound::parse(&chosen).unwrap() {
            Inbound::ResolveConflict(p) => {
                assert_eq!(p.resolution, Resolution::ChosenAnnotationId("a1".into()))
            }
            other => panic!("unexpected {other:?}"),
        }

        let reject_all = envelope(
            "resolve_conflict",
            json!({"conflictId": "c1", "resolution": "rejectAll"}),
        );
        match Inbound::parse(&reject_all).unwrap() {
            Inbound::ResolveConflict(p) => assert_eq!(p.resolution, Resolution::RejectAll),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_outbound_envelope_shape() {
        let err = Outbound::error(&CollabError::UnknownMessageType("chat".into()));
        let value: Value = serde_json::from_str(&err.encode().unwrap()).unwrap();
        assert_eq!(value["type"], "error");
        assert_eq!(value["payload"]["code"], "UnknownMessageType");
        assert!(value["payload"].get("details").is_none());

        let left = Outbound::UserLeft(UserLeftPayload { user_id: "u1".into() });
        let value: Value = serde_json::from_str(&left.encode().unwrap()).unwrap();
        assert_eq!(value["type"], "user_left");
        assert_eq!(value["payload"]["userId"], "u1");
    }

    #[test]
    fn test_outbound_decode_matches_encode() {
        let msg = Outbound::RoomMode(RoomModePayload { mode: RoomMode::PresenceOnly });
        let text = msg.encode().unwrap();
        assert!(text.contains("presence_only"));
        assert_eq!(Outbound::decode(&text).unwrap(), msg);
    }

    #[test]
    fn test_draft_validation() {
        assert!(AnnotationDraft::new("PERSON", 0, 8, "John Doe").validate().is_ok());
        assert_eq!(
            AnnotationDraft::new("PERSON", 8, 8, "").validate().unwrap_err().code(),
            "InvalidSpan"
        );
        assert!(AnnotationDraft::new("PERSON", 9, 3, "").validate().is_err());
    }

    #[test]
    fn test_half_open_overlap() {
        let a = Annotation::from_draft(AnnotationDraft::new("X", 0, 5, ""), "u", AnnotationSource::Human);
        let b = Annotation::from_draft(AnnotationDraft::new("X", 5, 9, ""), "u", AnnotationSource::Human);
        let c = Annotation::from_draft(AnnotationDraft::new("X", 4, 6, ""), "u", AnnotationSource::Human);
        assert!(!a.overlaps(&b));
        assert!(a.overlaps(&c));
        assert!(b.overlaps(&c));
        assert!(!a.nests_with(&c));
    }

    #[test]
    fn test_document_key_display() {
        assert_eq!(DocumentKey::new("p1", "doc1").to_string(), "p1/doc1");
    }
}
