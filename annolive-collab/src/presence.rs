//! Presence tracking for one document room.
//!
//! "Who is on this document and what are they doing." Each user has at most
//! one entry per document no matter how many sockets they hold; the entry
//! goes away when the last of those sockets disconnects or the user sends an
//! explicit `user_left`.
//!
//! ```text
//! authenticate ──► join()  ──► user_joined      (delta)
//! activity     ──► touch() ──► presence_updated (delta)
//! idle sweep   ──► sweep_idle() ──► presence_updated (status = idle)
//! socket close ──► disconnect() ──► user_left   (only for the last socket)
//! ```
//!
//! Every mutation returns a [`PresenceDelta`] rather than a full snapshot;
//! the full list is only sent once, in the joiner's catch-up snapshot.

use std::collections::{BTreeSet, HashMap};
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CollabError;
use crate::protocol::{ConnectionId, Outbound, Role, UserLeftPayload};

/// What a present user is doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
    Online,
    Idle,
    Annotating,
}

impl PresenceStatus {
    /// Idle users do not count towards active annotators/reviewers.
    pub fn is_active(self) -> bool {
        self != PresenceStatus::Idle
    }
}

impl FromStr for PresenceStatus {
    type Err = CollabError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "online" => Ok(Self::Online),
            "idle" => Ok(Self::Idle),
            "annotating" => Ok(Self::Annotating),
            other => Err(CollabError::InvalidStatus(other.to_string())),
        }
    }
}

/// Wire form of one present user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceEntry {
    pub user_id: String,
    pub name: String,
    pub role: Role,
    pub status: PresenceStatus,
    pub current_document: String,
    pub last_activity: DateTime<Utc>,
}

/// A single presence change, broadcast as-is.
#[derive(Debug, Clone, PartialEq)]
pub enum PresenceDelta {
    Joined(PresenceEntry),
    Updated(PresenceEntry),
    Left { user_id: String },
}

impl PresenceDelta {
    pub fn into_outbound(self) -> Outbound {
        match self {
            PresenceDelta::Joined(entry) => Outbound::UserJoined(entry),
            PresenceDelta::Updated(entry) => Outbound::PresenceUpdated(entry),
            PresenceDelta::Left { user_id } => Outbound::UserLeft(UserLeftPayload { user_id }),
        }
    }
}

#[derive(Debug, Clone)]
struct Tracked {
    entry: PresenceEntry,
    connections: BTreeSet<ConnectionId>,
}

/// Presence set of one document.
#[derive(Debug)]
pub struct PresenceTracker {
    document_id: String,
    users: HashMap<String, Tracked>,
}

impl PresenceTracker {
    pub fn new(document_id: impl Into<String>) -> Self {
        Self {
            document_id: document_id.into(),
            users: HashMap::new(),
        }
    }

    /// Add (or replace) the entry for `user_id` and attach `conn` to it.
    ///
    /// A join for a user who is already present updates the entry in place.
    pub fn join(
        &mut self,
        conn: ConnectionId,
        user_id: &str,
        name: &str,
        role: Role,
        now: DateTime<Utc>,
    ) -> PresenceDelta {
        let entry = PresenceEntry {
            user_id: user_id.to_string(),
            name: name.to_string(),
            role,
            status: PresenceStatus::Online,
            current_document: self.document_id.clone(),
            last_activity: now,
        };

        let tracked = self.users.entry(user_id.to_string()).or_insert_with(|| Tracked {
            entry: entry.clone(),
            connections: BTreeSet::new(),
        });
        tracked.entry = entry;
        tracked.connections.insert(conn);

        log::debug!(
            "Presence: {user_id} joined {} ({} socket(s))",
            self.document_id,
            tracked.connections.len()
        );
        PresenceDelta::Joined(tracked.entry.clone())
    }

    /// Explicit leave: drop the entry regardless of how many sockets remain.
    pub fn leave(&mut self, user_id: &str) -> Option<PresenceDelta> {
        self.users.remove(user_id).map(|_| {
            log::debug!("Presence: {user_id} left {}", self.document_id);
            PresenceDelta::Left {
                user_id: user_id.to_string(),
            }
        })
    }

    /// A socket went away. The entry is removed only with its last socket.
    pub fn disconnect(&mut self, conn: ConnectionId, user_id: &str) -> Option<PresenceDelta> {
        let tracked = self.users.get_mut(user_id)?;
        tracked.connections.remove(&conn);
        if tracked.connections.is_empty() {
            self.leave(user_id)
        } else {
            None
        }
    }

    /// Record activity with a new status. `None` when the user is not present.
    pub fn touch(
        &mut self,
        user_id: &str,
        status: PresenceStatus,
        now: DateTime<Utc>,
    ) -> Option<PresenceDelta> {
        let tracked = self.users.get_mut(user_id)?;
        tracked.entry.status = status;
        tracked.entry.last_activity = now;
        Some(PresenceDelta::Updated(tracked.entry.clone()))
    }

    /// Move users with no activity for `idle_after` to `idle`.
    pub fn sweep_idle(&mut self, now: DateTime<Utc>, idle_after: Duration) -> Vec<PresenceDelta> {
        let mut deltas: Vec<PresenceDelta> = self
            .users
            .values_mut()
            .filter(|t| t.entry.status != PresenceStatus::Idle)
            .filter(|t| now - t.entry.last_activity >= idle_after)
            .map(|t| {
                t.entry.status = PresenceStatus::Idle;
                PresenceDelta::Updated(t.entry.clone())
            })
            .collect();
        deltas.sort_by(|a, b| delta_user(a).cmp(delta_user(b)));
        deltas
    }

    pub fn get(&self, user_id: &str) -> Option<&PresenceEntry> {
        self.users.get(user_id).map(|t| &t.entry)
    }

    /// All entries ordered by user id.
    pub fn entries(&self) -> Vec<PresenceEntry> {
        let mut entries: Vec<PresenceEntry> = self.users.values().map(|t| t.entry.clone()).collect();
        entries.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        entries
    }

    /// Non-idle users with the given role.
    pub fn active_count(&self, role: Role) -> usize {
        self.users
            .values()
            .filter(|t| t.entry.role == role && t.entry.status.is_active())
            .count()
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

fn delta_user(delta: &PresenceDelta) -> &str {
    match delta {
        PresenceDelta::Joined(e) | PresenceDelta::Updated(e) => &e.user_id,
        PresenceDelta::Left { user_id } => user_id,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn tracker() -> PresenceTracker {
        PresenceTracker::new("doc1")
    }

    #[test]
    fn test_status_parse() {
        assert_eq!("online".parse::<PresenceStatus>().unwrap(), PresenceStatus::Online);
        assert_eq!("idle".parse::<PresenceStatus>().unwrap(), PresenceStatus::Idle);
        assert_eq!(
            "annotating".parse::<PresenceStatus>().unwrap(),
            PresenceStatus::Annotating
        );
        assert_eq!("away".parse::<PresenceStatus>().unwrap_err().code(), "InvalidStatus");
    }

    #[test]
    fn test_rejoin_replaces_entry() {
        let mut p = tracker();
        let now = Utc::now();
        p.join(Uuid::new_v4(), "alice", "Alice", Role::Annotator, now);
        p.touch("alice", PresenceStatus::Annotating, now);
        let delta = p.join(Uuid::new_v4(), "alice", "Alice R.", Role::Annotator, now);

        assert_eq!(p.len(), 1);
        match delta {
            PresenceDelta::Joined(entry) => {
                assert_eq!(entry.name, "Alice R.");
                assert_eq!(entry.status, PresenceStatus::Online);
                assert_eq!(entry.current_document, "doc1");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_disconnect_keeps_entry_until_last_socket() {
        let mut p = tracker();
        let now = Utc::now();
        let (c1, c2) = (Uuid::new_v4(), Uuid::new_v4());
        p.join(c1, "alice", "Alice", Role::Annotator, now);
        p.join(c2, "alice", "Alice", Role::Annotator, now);

        assert!(p.disconnect(c1, "alice").is_none());
        assert_eq!(p.len(), 1);
        assert_eq!(
            p.disconnect(c2, "alice"),
            Some(PresenceDelta::Left { user_id: "alice".into() })
        );
        assert!(p.is_empty());
    }

    #[test]
    fn test_explicit_leave_drops_entry() {
        let mut p = tracker();
        let now = Utc::now();
        p.join(Uuid::new_v4(), "bob", "Bob", Role::Reviewer, now);
        assert!(p.leave("bob").is_some());
        assert!(p.leave("bob").is_none());
        assert!(p.touch("bob", PresenceStatus::Online, now).is_none());
    }

    #[test]
    fn test_join_leave_sequences_never_duplicate() {
        // Deterministic pseudo-random walk over join/leave/touch/disconnect.
        let mut seed: u64 = 0x9E37_79B9_7F4A_7C15;
        let mut next = move || {
            seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            (seed >> 33) as usize
        };

        let conns: Vec<ConnectionId> = (0..3).map(|_| Uuid::new_v4()).collect();
        for _round in 0..50 {
            let mut p = tracker();
            let mut expected: Option<PresenceStatus> = None;
            let mut attached: BTreeSet<ConnectionId> = BTreeSet::new();
            for _step in 0..40 {
                let now = Utc::now();
                let conn = conns[next() % conns.len()];
                match next() % 4 {
                    0 => {
                        p.join(conn, "u1", "User", Role::Annotator, now);
                        attached.insert(conn);
                        expected = Some(PresenceStatus::Online);
                    }
                    1 => {
                        p.leave("u1");
                        attached.clear();
                        expected = None;
                    }
                    2 => {
                        if p.touch("u1", PresenceStatus::Annotating, now).is_some() {
                            expected = Some(PresenceStatus::Annotating);
                        }
                    }
                    _ => {
                        p.disconnect(conn, "u1");
                        attached.remove(&conn);
                        if attached.is_empty() {
                            expected = None;
                        }
                    }
                }
                assert!(p.len() <= 1);
                assert_eq!(p.get("u1").map(|e| e.status), expected);
            }
        }
    }

    #[test]
    fn test_sweep_idle() {
        let mut p = tracker();
        let start = Utc::now();
        p.join(Uuid::new_v4(), "alice", "Alice", Role::Annotator, start);
        p.join(Uuid::new_v4(), "bob", "Bob", Role::Reviewer, start);
        p.touch("bob", PresenceStatus::Annotating, start + Duration::seconds(100));

        let deltas = p.sweep_idle(start + Duration::seconds(130), Duration::seconds(120));
        assert_eq!(deltas.len(), 1);
        assert_eq!(p.get("alice").unwrap().status, PresenceStatus::Idle);
        assert_eq!(p.get("bob").unwrap().status, PresenceStatus::Annotating);

        // Already idle users are not reported twice.
        assert!(p.sweep_idle(start + Duration::seconds(140), Duration::seconds(120)).is_empty());
    }

    #[test]
    fn test_active_count_by_role() {
        let mut p = tracker();
        let now = Utc::now();
        p.join(Uuid::new_v4(), "a1", "A1", Role::Annotator, now);
        p.join(Uuid::new_v4(), "a2", "A2", Role::Annotator, now);
        p.join(Uuid::new_v4(), "r1", "R1", Role::Reviewer, now);
        p.touch("a2", PresenceStatus::Idle, now);

        assert_eq!(p.active_count(Role::Annotator), 1);
        assert_eq!(p.active_count(Role::Reviewer), 1);
    }

    #[test]
    fn test_delta_to_outbound() {
        let out = PresenceDelta::Left { user_id: "u".into() }.into_outbound();
        assert_eq!(out.kind(), "user_left");
    }
}
