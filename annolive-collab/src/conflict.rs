//! Conflict detection and resolution for one document.
//!
//! The detector keeps a cache of committed annotations plus a [`SpanIndex`]
//! over their spans. A new annotation is compared with every committed
//! annotation it overlaps; each overlapping pair is classified in this order,
//! first match wins:
//!
//! 1. different labels → `label_mismatch`
//! 2. same label, identical or nested ranges, same attributes → duplicate
//! 3. same label, partial overlap → `boundary`
//! 4. same label, nested ranges, different attributes → `overlap`
//!
//! Newcomers still held by an open conflict take part in the comparison too.
//! Pairs are grouped per kind, so a newcomer produces at most one conflict of
//! each kind. A duplicate is only reported when no other pair conflicts. The
//! newcomer is held inside its conflicts and is not committed until a
//! resolution picks it.
//!
//! Resolution is split into [`ConflictDetector::plan_resolution`] (read-only
//! validation) and [`ConflictDetector::apply_resolution`] so the caller can
//! write to the annotation store in between and leave the conflict open if
//! the store refuses. A winner that still overlaps committed annotations
//! outside the conflict is not committed; it is checked again and raises
//! follow-up conflicts instead.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CollabError;
use crate::protocol::{Annotation, AnnotationDraft, AnnotationSource};
use crate::span_index::SpanIndex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    Overlap,
    LabelMismatch,
    Boundary,
}

/// Summary of one annotation taking part in a conflict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictingAnnotation {
    pub annotation_id: String,
    pub annotator_id: String,
    pub label: String,
    pub start: u32,
    pub end: u32,
    pub text: String,
}

impl From<&Annotation> for ConflictingAnnotation {
    fn from(a: &Annotation) -> Self {
        Self {
            annotation_id: a.id.clone(),
            annotator_id: a.annotator_id.clone(),
            label: a.label.clone(),
            start: a.start,
            end: a.end,
            text: a.text.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conflict {
    pub id: String,
    pub document_id: String,
    #[serde(rename = "type")]
    pub kind: ConflictKind,
    pub conflicting_annotations: Vec<ConflictingAnnotation>,
    pub detected_at: DateTime<Utc>,
}

impl Conflict {
    pub fn involves(&self, annotation_id: &str) -> bool {
        self.conflicting_annotations
            .iter()
            .any(|c| c.annotation_id == annotation_id)
    }
}

/// How a reviewer settles a conflict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Resolution {
    /// Keep one of the conflicting annotations.
    ChosenAnnotationId(String),
    MergedAnnotation(AnnotationDraft),
    CustomAnnotation(AnnotationDraft),
    /// Discard every conflicting annotation.
    RejectAll,
}

/// The outcome of a resolved conflict, kept so a losing reviewer can be told who won.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolutionRecord {
    pub conflict_id: String,
    pub resolved_by: String,
    pub resolved_at: DateTime<Utc>,
    pub resolution: Resolution,
    /// The authoritative annotation for the span, `None` after `rejectAll`
    /// or while the winner waits on follow-up conflicts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub committed: Option<Annotation>,
    pub removed_annotation_ids: Vec<String>,
    /// Conflicts raised because the winner overlaps annotations outside this conflict.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub follow_up_conflict_ids: Vec<String>,
}

/// Store operations a resolution needs before it can be applied.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolutionPlan {
    pub record: ResolutionRecord,
    /// Annotation to write to the store (`None` if the winner is already committed).
    pub commit: Option<Annotation>,
    /// Committed annotations to delete from the store.
    pub remove: Vec<String>,
    /// Winner that collides with committed annotations outside the conflict.
    pub recheck: Option<Annotation>,
}

/// A resolution applied to the detector.
#[derive(Debug, Clone, PartialEq)]
pub struct AppliedResolution {
    pub record: ResolutionRecord,
    /// Follow-up conflicts raised by a colliding winner, already open.
    pub raised: Vec<Conflict>,
}

/// Result of checking a new annotation.
#[derive(Debug, Clone, PartialEq)]
pub enum CheckOutcome {
    /// No conflict; the caller should commit and then [`ConflictDetector::insert`].
    Clean(Annotation),
    /// Same label and span content already committed.
    Duplicate { existing_id: String },
    /// One conflict per kind, already registered as open.
    Conflicted(Vec<Conflict>),
}

#[derive(Debug)]
pub struct ConflictDetector {
    document_id: String,
    committed: HashMap<String, Annotation>,
    index: SpanIndex,
    /// Newcomers waiting on an open conflict.
    held: HashMap<String, Annotation>,
    held_index: SpanIndex,
    open: Vec<Conflict>,
    resolved: HashMap<String, ResolutionRecord>,
    resolved_order: VecDeque<String>,
    max_resolved: usize,
}

impl ConflictDetector {
    pub fn new(document_id: impl Into<String>, max_resolved: usize) -> Self {
        Self {
            document_id: document_id.into(),
            committed: HashMap::new(),
            index: SpanIndex::default(),
            held: HashMap::new(),
            held_index: SpanIndex::default(),
            open: Vec::new(),
            resolved: HashMap::new(),
            resolved_order: VecDeque::new(),
            max_resolved,
        }
    }

    /// Replace the committed cache with the store's view.
    pub fn load(&mut self, annotations: Vec<Annotation>) {
        self.committed.clear();
        self.index.clear();
        for annotation in annotations {
            self.insert(annotation);
        }
    }

    /// Index an annotation the store has accepted.
    pub fn insert(&mut self, annotation: Annotation) {
        self.index.insert(&annotation.id, annotation.start, annotation.end);
        self.committed.insert(annotation.id.clone(), annotation);
    }

    pub fn remove(&mut self, id: &str) -> Option<Annotation> {
        self.index.remove(id);
        self.committed.remove(id)
    }

    fn hold(&mut self, annotation: Annotation) {
        self.held_index.insert(&annotation.id, annotation.start, annotation.end);
        self.held.insert(annotation.id.clone(), annotation);
    }

    fn release(&mut self, id: &str) -> Option<Annotation> {
        self.held_index.remove(id);
        self.held.remove(id)
    }

    /// Committed annotations overlapping `annotation`, minus `skip`.
    fn collisions(&self, annotation: &Annotation, skip: &[String]) -> Vec<String> {
        self.index
            .overlapping(annotation.start, annotation.end)
            .into_iter()
            .filter(|id| *id != annotation.id && !skip.contains(id))
            .collect()
    }

    /// Classify `annotation` against committed and held annotations and
    /// register any conflicts.
    pub fn check(&mut self, annotation: Annotation, now: DateTime<Utc>) -> CheckOutcome {
        let (start, end) = (annotation.start, annotation.end);
        let mut overlapping: Vec<&Annotation> = self
            .index
            .overlapping(start, end)
            .into_iter()
            .filter_map(|id| self.committed.get(&id))
            .chain(
                self.held_index
                    .overlapping(start, end)
                    .into_iter()
                    .filter_map(|id| self.held.get(&id)),
            )
            .filter(|existing| existing.id != annotation.id)
            .collect();
        overlapping.sort_by(|a, b| (a.start, a.end, &a.id).cmp(&(b.start, b.end, &b.id)));

        let mut groups: Vec<(ConflictKind, Vec<&Annotation>)> = Vec::new();
        let mut duplicate_of: Option<&Annotation> = None;
        for existing in overlapping {
            let kind = if existing.label != annotation.label {
                ConflictKind::LabelMismatch
            } else if existing.nests_with(&annotation) {
                if existing.attributes == annotation.attributes {
                    duplicate_of.get_or_insert(existing);
                    continue;
                }
                ConflictKind::Overlap
            } else {
                ConflictKind::Boundary
            };

            match groups.iter_mut().find(|(k, _)| *k == kind) {
                Some((_, members)) => members.push(existing),
                None => groups.push((kind, vec![existing])),
            }
        }

        if groups.is_empty() {
            return match duplicate_of {
                Some(existing) => {
                    log::debug!(
                        "Annotation {} duplicates {} on {}",
                        annotation.id,
                        existing.id,
                        self.document_id
                    );
                    CheckOutcome::Duplicate { existing_id: existing.id.clone() }
                }
                None => CheckOutcome::Clean(annotation),
            };
        }

        groups.sort_by_key(|(kind, _)| *kind);
        let conflicts: Vec<Conflict> = groups
            .into_iter()
            .map(|(kind, members)| {
                let mut conflicting: Vec<ConflictingAnnotation> =
                    members.into_iter().map(ConflictingAnnotation::from).collect();
                conflicting.push(ConflictingAnnotation::from(&annotation));
                Conflict {
                    id: Uuid::new_v4().to_string(),
                    document_id: self.document_id.clone(),
                    kind,
                    conflicting_annotations: conflicting,
                    detected_at: now,
                }
            })
            .collect();

        log::info!(
            "Annotation {} on {} raised {} conflict(s)",
            annotation.id,
            self.document_id,
            conflicts.len()
        );
        self.hold(annotation);
        self.open.extend(conflicts.iter().cloned());
        CheckOutcome::Conflicted(conflicts)
    }

    /// Validate a resolution without touching any state.
    pub fn plan_resolution(
        &self,
        conflict_id: &str,
        user_id: &str,
        resolution: Resolution,
        now: DateTime<Utc>,
    ) -> Result<ResolutionPlan, CollabError> {
        if let Some(record) = self.resolved.get(conflict_id) {
            return Err(CollabError::ConflictAlreadyResolved {
                conflict_id: conflict_id.to_string(),
                winner: serde_json::to_value(record).unwrap_or_default(),
            });
        }
        let conflict = self
            .open
            .iter()
            .find(|c| c.id == conflict_id)
            .ok_or_else(|| CollabError::ConflictNotFound(conflict_id.to_string()))?;

        let member_ids: Vec<&str> = conflict
            .conflicting_annotations
            .iter()
            .map(|c| c.annotation_id.as_str())
            .collect();

        let source = AnnotationSource::Resolution {
            conflict_id: conflict_id.to_string(),
        };
        let (winner, commit) = match &resolution {
            Resolution::ChosenAnnotationId(chosen) => {
                if !member_ids.contains(&chosen.as_str()) {
                    return Err(CollabError::InvalidResolution(format!(
                        "annotation {chosen} is not part of conflict {conflict_id}"
                    )));
                }
                if let Some(existing) = self.committed.get(chosen) {
                    (Some(existing.clone()), None)
                } else if let Some(newcomer) = self.held.get(chosen) {
                    (Some(newcomer.clone()), Some(newcomer.clone()))
                } else {
                    return Err(CollabError::InvalidResolution(format!(
                        "annotation {chosen} no longer exists"
                    )));
                }
            }
            Resolution::MergedAnnotation(draft) | Resolution::CustomAnnotation(draft) => {
                draft
                    .validate()
                    .map_err(|e| CollabError::InvalidResolution(e.to_string()))?;
                let annotation = Annotation::from_draft(draft.clone(), user_id, source);
                (Some(annotation.clone()), Some(annotation))
            }
            Resolution::RejectAll => (None, None),
        };

        let winner_id = winner.as_ref().map(|w| w.id.as_str());
        let losers: Vec<String> = member_ids
            .iter()
            .filter(|id| Some(**id) != winner_id)
            .map(|id| id.to_string())
            .collect();
        let remove: Vec<String> = losers
            .iter()
            .filter(|id| self.committed.contains_key(*id))
            .cloned()
            .collect();

        let (winner, commit, recheck) = match commit {
            Some(annotation) if !self.collisions(&annotation, &remove).is_empty() => {
                log::debug!(
                    "Winner {} of conflict {conflict_id} still overlaps committed annotations",
                    annotation.id
                );
                (None, None, Some(annotation))
            }
            commit => (winner, commit, None),
        };

        Ok(ResolutionPlan {
            record: ResolutionRecord {
                conflict_id: conflict_id.to_string(),
                resolved_by: user_id.to_string(),
                resolved_at: now,
                resolution,
                committed: winner,
                removed_annotation_ids: losers,
                follow_up_conflict_ids: Vec::new(),
            },
            commit,
            remove,
            recheck,
        })
    }

    /// Apply a plan whose store writes have succeeded.
    pub fn apply_resolution(&mut self, plan: ResolutionPlan) -> AppliedResolution {
        let ResolutionPlan {
            mut record,
            commit,
            remove,
            recheck,
        } = plan;

        self.open.retain(|c| c.id != record.conflict_id);
        for id in &remove {
            self.remove(id);
        }
        if let Some(annotation) = commit {
            self.release(&annotation.id);
            self.insert(annotation);
        }

        // Held newcomers stay around while another open conflict still needs them.
        let stale: Vec<String> = self
            .held
            .keys()
            .filter(|id| !self.open.iter().any(|c| c.involves(id.as_str())))
            .cloned()
            .collect();
        for id in stale {
            self.release(&id);
        }

        let mut raised = Vec::new();
        if let Some(annotation) = recheck {
            self.release(&annotation.id);
            match self.check(annotation, record.resolved_at) {
                CheckOutcome::Conflicted(conflicts) => {
                    record.follow_up_conflict_ids = conflicts.iter().map(|c| c.id.clone()).collect();
                    raised = conflicts;
                }
                CheckOutcome::Duplicate { existing_id } => {
                    record.committed = self.committed.get(&existing_id).cloned();
                }
                CheckOutcome::Clean(annotation) => {
                    log::warn!(
                        "Winner {} of conflict {} no longer collides; dropped without a store write",
                        annotation.id,
                        record.conflict_id
                    );
                }
            }
        }


        log::info!(
            "Conflict {} on {} resolved by {}",
            record.conflict_id,
            self.document_id,
            record.resolved_by
        );
        self.resolved.insert(record.conflict_id.clone(), record.clone());
        self.resolved_order.push_back(record.conflict_id.clone());
        while self.resolved_order.len() > self.max_resolved {
            if let Some(oldest) = self.resolved_order.pop_front() {
                self.resolved.remove(&oldest);
            }
        }
        AppliedResolution { record, raised }
    }

    /// Open conflicts in detection order.
    pub fn open_conflicts(&self) -> &[Conflict] {
        &self.open
    }

    pub fn resolved_record(&self, conflict_id: &str) -> Option<&ResolutionRecord> {
        self.resolved.get(conflict_id)
    }

    /// Committed annotations ordered by span.
    pub fn annotations(&self) -> Vec<Annotation> {
        let mut out: Vec<Annotation> = self.committed.values().cloned().collect();
        out.sort_by(|a, b| (a.start, a.end, &a.id).cmp(&(b.start, b.end, &b.id)));
        out
    }

    pub fn committed(&self, id: &str) -> Option<&Annotation> {
        self.committed.get(id)
    }

    pub fn committed_count(&self) -> usize {
        self.committed.len()
    }

    pub fn held_count(&self) -> usize {
        self.held.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ann(id: &str, user: &str, label: &str, start: u32, end: u32) -> Annotation {
        let mut a = Annotation::from_draft(
            AnnotationDraft::new(label, start, end, ""),
            user,
            AnnotationSource::Human,
        );
        a.id = id.to_string();
        a
    }

    fn detector_with(existing: Vec<Annotation>) -> ConflictDetector {
        let mut d = ConflictDetector::new("doc1", 16);
        d.load(existing);
        d
    }

    fn conflicted(outcome: CheckOutcome) -> Vec<Conflict> {
        match outcome {
            CheckOutcome::Conflicted(c) => c,
            other => panic!("expected conflicts, got {other:?}"),
        }
    }

    #[test]
    fn test_label_mismatch_scenario() {
        let mut d = detector_with(vec![ann("a", "alice", "PERSON", 0, 8)]);
        let conflicts = conflicted(d.check(ann("b", "bob", "ORG", 4, 12), Utc::now()));

        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].kind, ConflictKind::LabelMismatch);
        let ids: Vec<&str> = conflicts[0]
            .conflicting_annotations
            .iter()
            .map(|c| c.annotation_id.as_str())
            .collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(d.open_conflicts().len(), 1);
        assert!(d.committed("b").is_none());
        assert_eq!(d.held_count(), 1);
    }

    #[test]
    fn test_touching_spans_are_clean() {
        let mut d = detector_with(vec![ann("a", "alice", "PERSON", 0, 8)]);
        assert!(matches!(
            d.check(ann("b", "bob", "ORG", 8, 12), Utc::now()),
            CheckOutcome::Clean(_)
        ));
    }

    #[test]
    fn test_duplicate_is_deduplicated() {
        let mut d = detector_with(vec![ann("a", "alice", "PERSON", 0, 8)]);
        let outcome = d.check(ann("b", "bob", "PERSON", 2, 6), Utc::now());
        assert_eq!(outcome, CheckOutcome::Duplicate { existing_id: "a".into() });
        assert!(d.open_conflicts().is_empty());
    }

    #[test]
    fn test_boundary_and_overlap() {
        let mut d = detector_with(vec![ann("a", "alice", "PERSON", 0, 8)]);
        let boundary = conflicted(d.check(ann("b", "bob", "PERSON", 4, 12), Utc::now()));
        assert_eq!(boundary[0].kind, ConflictKind::Boundary);

        let mut nested = ann("c", "carol", "PERSON", 2, 6);
        nested.attributes.insert("gender".into(), "f".into());
        let overlap = conflicted(d.check(nested, Utc::now()));
        assert_eq!(overlap[0].kind, ConflictKind::Overlap);
    }

    #[test]
    fn test_one_conflict_per_kind() {
        let mut d = detector_with(vec![
            ann("a", "alice", "PERSON", 0, 4),
            ann("b", "bob", "ORG", 6, 10),
            ann("c", "carol", "LOC", 10, 14),
        ]);
        let conflicts = conflicted(d.check(ann("n", "nina", "PERSON", 2, 12), Utc::now()));
        assert_eq!(conflicts.len(), 2);
        assert_eq!(conflicts[0].kind, ConflictKind::LabelMismatch);
        assert_eq!(conflicts[0].conflicting_annotations.len(), 3);
        assert_eq!(conflicts[1].kind, ConflictKind::Boundary);
    }

    #[test]
    fn test_duplicate_does_not_hide_label_mismatch() {
        let mut d = detector_with(vec![
            ann("a", "alice", "PERSON", 0, 20),
            ann("b", "bob", "ORG", 30, 40),
        ]);
        // Nests `a` with the same label, but also overlaps `b`.
        let conflicts = conflicted(d.check(ann("n", "nina", "PERSON", 0, 40), Utc::now()));

        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].kind, ConflictKind::LabelMismatch);
        let ids: Vec<&str> = conflicts[0]
            .conflicting_annotations
            .iter()
            .map(|c| c.annotation_id.as_str())
            .collect();
        assert_eq!(ids, vec!["b", "n"]);
        assert_eq!(d.held_count(), 1);
    }

    #[test]
    fn test_held_newcomer_takes_part_in_checks() {
        let mut d = detector_with(vec![ann("a", "alice", "PERSON", 0, 8)]);
        let first = conflicted(d.check(ann("b", "bob", "ORG", 4, 12), Utc::now())).remove(0);

        // Only touches `a`, but overlaps the held `b`.
        let second = conflicted(d.check(ann("c", "carol", "LOC", 8, 12), Utc::now())).remove(0);
        assert_eq!(second.kind, ConflictKind::LabelMismatch);
        assert!(second.involves("b") && second.involves("c"));
        assert_eq!(d.open_conflicts().len(), 2);

        let plan = d
            .plan_resolution(&first.id, "rev", Resolution::ChosenAnnotationId("b".into()), Utc::now())
            .unwrap();
        d.apply_resolution(plan);
        let committed: Vec<String> = d.annotations().into_iter().map(|a| a.id).collect();
        assert_eq!(committed, vec!["b".to_string()]);
        assert_eq!(d.open_conflicts().len(), 1);
        assert_eq!(d.held_count(), 1);

        let plan = d
            .plan_resolution(&second.id, "rev", Resolution::ChosenAnnotationId("c".into()), Utc::now())
            .unwrap();
        assert_eq!(plan.remove, vec!["b".to_string()]);
        d.apply_resolution(plan);
        let committed: Vec<String> = d.annotations().into_iter().map(|a| a.id).collect();
        assert_eq!(committed, vec!["c".to_string()]);
        assert!(d.open_conflicts().is_empty());
        assert_eq!(d.held_count(), 0);
    }

    #[test]
    fn test_custom_winner_colliding_outside_raises_follow_up() {
        let mut d = detector_with(vec![
            ann("a", "alice", "PERSON", 0, 8),
            ann("z", "zoe", "ORG", 20, 30),
        ]);
        let conflict = conflicted(d.check(ann("b", "bob", "ORG", 4, 12), Utc::now())).remove(0);

        let plan = d
            .plan_resolution(
                &conflict.id,
                "rev",
                Resolution::CustomAnnotation(AnnotationDraft::new("PERSON", 0, 25, "")),
                Utc::now(),
            )
            .unwrap();
        assert!(plan.commit.is_none());
        assert_eq!(plan.remove, vec!["a".to_string()]);

        let applied = d.apply_resolution(plan);
        assert!(applied.record.committed.is_none());
        assert_eq!(applied.raised.len(), 1);
        let follow_up = &applied.raised[0];
        assert_eq!(applied.record.follow_up_conflict_ids, vec![follow_up.id.clone()]);
        assert_eq!(follow_up.kind, ConflictKind::LabelMismatch);
        assert!(follow_up.involves("z"));

        // Nothing overlapping reached the committed set.
        let committed: Vec<String> = d.annotations().into_iter().map(|a| a.id).collect();
        assert_eq!(committed, vec!["z".to_string()]);
        assert_eq!(d.open_conflicts().len(), 1);
        assert_eq!(d.held_count(), 1);

        let winner = follow_up.conflicting_annotations[1].annotation_id.clone();
        let plan = d
            .plan_resolution(&follow_up.id, "rev", Resolution::ChosenAnnotationId(winner.clone()), Utc::now())
            .unwrap();
        assert_eq!(plan.commit.as_ref().map(|a| a.id.as_str()), Some(winner.as_str()));
        let record = d.apply_resolution(plan).record;
        assert_eq!(record.removed_annotation_ids, vec!["z".to_string()]);
        assert_eq!(d.annotations().len(), 1);
        assert!(d.committed(&winner).is_some());
        assert_eq!(d.held_count(), 0);
    }

    #[test]
    fn test_choose_newcomer_commits_it() {
        let mut d = detector_with(vec![ann("a", "alice", "PERSON", 0, 8)]);
        let conflict = conflicted(d.check(ann("b", "bob", "ORG", 4, 12), Utc::now())).remove(0);

        let plan = d
            .plan_resolution(&conflict.id, "rev", Resolution::ChosenAnnotationId("b".into()), Utc::now())
            .unwrap();
        assert_eq!(plan.remove, vec!["a".to_string()]);
        assert_eq!(plan.commit.as_ref().map(|a| a.id.as_str()), Some("b"));

        let record = d.apply_resolution(plan).record;
        assert_eq!(record.removed_annotation_ids, vec!["a".to_string()]);
        assert!(d.committed("a").is_none());
        assert!(d.committed("b").is_some());
        assert!(d.open_conflicts().is_empty());
        assert_eq!(d.held_count(), 0);
    }

    #[test]
    fn test_resolve_twice_fails_with_winner() {
        let mut d = detector_with(vec![ann("a", "alice", "PERSON", 0, 8)]);
        let conflict = conflicted(d.check(ann("b", "bob", "ORG", 4, 12), Utc::now())).remove(0);

        let plan = d
            .plan_resolution(&conflict.id, "rev1", Resolution::ChosenAnnotationId("a".into()), Utc::now())
            .unwrap();
        assert!(plan.commit.is_none());
        d.apply_resolution(plan);
        let committed_before = d.committed_count();

        let err = d
            .plan_resolution(&conflict.id, "rev2", Resolution::RejectAll, Utc::now())
            .unwrap_err();
        assert_eq!(err.code(), "ConflictAlreadyResolved");
        assert_eq!(err.details().unwrap()["resolvedBy"], "rev1");
        assert_eq!(d.committed_count(), committed_before);
        assert_eq!(d.resolved_record(&conflict.id).unwrap().resolved_by, "rev1");
        assert!(d.open_conflicts().is_empty());
    }

    #[test]
    fn test_reject_all_clears_span() {
        let mut d = detector_with(vec![ann("a", "alice", "PERSON", 0, 8)]);
        let conflict = conflicted(d.check(ann("b", "bob", "ORG", 4, 12), Utc::now())).remove(0);
        let plan = d
            .plan_resolution(&conflict.id, "rev", Resolution::RejectAll, Utc::now())
            .unwrap();
        let record = d.apply_resolution(plan).record;
        assert!(record.committed.is_none());
        assert_eq!(d.committed_count(), 0);
        assert_eq!(d.held_count(), 0);
    }

    #[test]
    fn test_custom_annotation_replaces_members() {
        let mut d = detector_with(vec![ann("a", "alice", "PERSON", 0, 8)]);
        let conflict = conflicted(d.check(ann("b", "bob", "ORG", 4, 12), Utc::now())).remove(0);
        let plan = d
            .plan_resolution(
                &conflict.id,
                "rev",
                Resolution::CustomAnnotation(AnnotationDraft::new("PERSON", 0, 12, "")),
                Utc::now(),
            )
            .unwrap();
        let record = d.apply_resolution(plan).record;
        let winner = record.committed.unwrap();
        assert_eq!(winner.annotator_id, "rev");
        assert_eq!(
            winner.source,
            AnnotationSource::Resolution { conflict_id: conflict.id.clone() }
        );
        assert_eq!(d.annotations().len(), 1);
    }

    #[test]
    fn test_invalid_choice_keeps_conflict_open() {
        let mut d = detector_with(vec![ann("a", "alice", "PERSON", 0, 8)]);
        let conflict = conflicted(d.check(ann("b", "bob", "ORG", 4, 12), Utc::now())).remove(0);
        let err = d
            .plan_resolution(&conflict.id, "rev", Resolution::ChosenAnnotationId("zzz".into()), Utc::now())
            .unwrap_err();
        assert_eq!(err.code(), "InvalidResolution");
        assert_eq!(d.open_conflicts().len(), 1);

        let err = d
            .plan_resolution("missing", "rev", Resolution::RejectAll, Utc::now())
            .unwrap_err();
        assert_eq!(err.code(), "ConflictNotFound");
    }

    #[test]
    fn test_resolution_wire_shape() {
        let chosen: Resolution = serde_json::from_str(r#"{"chosenAnnotationId":"a1"}"#).unwrap();
        assert_eq!(chosen, Resolution::ChosenAnnotationId("a1".into()));
        let reject: Resolution = serde_json::from_str(r#""rejectAll""#).unwrap();
        assert_eq!(reject, Resolution::RejectAll);

        let conflict = Conflict {
            id: "c1".into(),
            document_id: "doc1".into(),
            kind: ConflictKind::LabelMismatch,
            conflicting_annotations: vec![],
            detected_at: Utc::now(),
        };
        let json = serde_json::to_value(&conflict).unwrap();
        assert_eq!(json["type"], "label_mismatch");
        assert!(json["conflictingAnnotations"].is_array());
    }
}
