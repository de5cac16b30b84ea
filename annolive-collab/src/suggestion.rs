//! AI suggestion stream for one document.
//!
//! The engine pushes suggestions; annotators accept or reject them. A
//! suggestion moves `pending → accepted` or `pending → rejected` exactly
//! once. Repeating the transition (from the same or another user) is not an
//! error: the caller gets the already-resolved suggestion back, tagged with
//! who won.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CollabError;
use crate::protocol::{Annotation, AnnotationDraft, AnnotationSource, DocumentKey};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuggestionStatus {
    Pending,
    Accepted,
    Rejected,
}

/// One proposed span inside a suggestion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuggestedSpan {
    pub label: String,
    pub start: u32,
    pub end: u32,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub confidence: f64,
}

/// What the engine sends; the stream fills in id, status and timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuggestionDraft {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub text: String,
    pub annotations: Vec<SuggestedSpan>,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub latency_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Suggestion {
    pub id: String,
    pub document_id: String,
    pub text: String,
    pub annotations: Vec<SuggestedSpan>,
    pub confidence: f64,
    pub latency_ms: u64,
    pub timestamp: DateTime<Utc>,
    pub status: SuggestionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reject_reason: Option<String>,
}

impl Suggestion {
    /// Turn every suggested span into an annotation owned by `user_id`.
    pub fn to_annotations(&self, user_id: &str) -> Vec<Annotation> {
        self.annotations
            .iter()
            .map(|span| {
                let draft = AnnotationDraft::new(span.label.clone(), span.start, span.end, span.text.clone());
                Annotation::from_draft(
                    draft,
                    user_id,
                    AnnotationSource::Suggestion {
                        suggestion_id: self.id.clone(),
                    },
                )
            })
            .collect()
    }
}

/// How an accept/reject call was applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuggestionOutcome {
    /// This call performed the transition.
    Applied,
    AlreadyResolvedByYou,
    AlreadyResolvedByOther,
}

/// Result of an accept/reject call.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub suggestion: Suggestion,
    pub outcome: SuggestionOutcome,
}

impl Transition {
    pub fn is_applied(&self) -> bool {
        self.outcome == SuggestionOutcome::Applied
    }
}

/// Fire-and-forget record for the AI engine's learning loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuggestionFeedback {
    pub document: DocumentKey,
    pub suggestion_id: String,
    pub status: SuggestionStatus,
    pub user_id: String,
    pub confidence: f64,
    pub latency_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl SuggestionFeedback {
    pub fn from_suggestion(document: &DocumentKey, suggestion: &Suggestion) -> Self {
        Self {
            document: document.clone(),
            suggestion_id: suggestion.id.clone(),
            status: suggestion.status,
            user_id: suggestion.resolved_by.clone().unwrap_or_default(),
            confidence: suggestion.confidence,
            latency_ms: suggestion.latency_ms,
            reason: suggestion.reject_reason.clone(),
        }
    }
}

/// Pending and recently resolved suggestions of one document.
#[derive(Debug)]
pub struct SuggestionStream {
    document_id: String,
    suggestions: HashMap<String, Suggestion>,
    /// Arrival order, used for snapshots and pruning.
    order: VecDeque<String>,
    max_pending: usize,
    max_resolved: usize,
}

impl SuggestionStream {
    pub fn new(document_id: impl Into<String>, max_pending: usize, max_resolved: usize) -> Self {
        Self {
            document_id: document_id.into(),
            suggestions: HashMap::new(),
            order: VecDeque::new(),
            max_pending,
            max_resolved,
        }
    }

    /// Register a new pending suggestion.
    pub fn push(&mut self, draft: SuggestionDraft, now: DateTime<Utc>) -> Result<Suggestion, CollabError> {
        let pending = self.pending_count();
        if pending >= self.max_pending {
            return Err(CollabError::SuggestionBacklogFull(pending));
        }
        for span in &draft.annotations {
            if span.start >= span.end {
                return Err(CollabError::InvalidSpan {
                    start: span.start,
                    end: span.end,
                });
            }
        }

        let id = draft
            .id
            .unwrap_or_else(|| format!("sug_{}", Uuid::new_v4().simple()));
        match self.suggestions.get(&id).map(|s| s.status) {
            None => {}
            Some(SuggestionStatus::Pending) => {
                return Err(CollabError::MalformedMessage {
                    kind: "suggestion".to_string(),
                    reason: format!("duplicate suggestion id {id}"),
                });
            }
            // The engine re-sent something a user already settled.
            Some(_) => return Err(CollabError::SuggestionAlreadyResolved(id)),
        }

        let suggestion = Suggestion {
            id: id.clone(),
            document_id: self.document_id.clone(),
            text: draft.text,
            annotations: draft.annotations,
            confidence: draft.confidence,
            latency_ms: draft.latency_ms,
            timestamp: now,
            status: SuggestionStatus::Pending,
            resolved_by: None,
            resolved_at: None,
            reject_reason: None,
        };
        self.suggestions.insert(id.clone(), suggestion.clone());
        self.order.push_back(id);
        Ok(suggestion)
    }

    pub fn accept(&mut self, id: &str, user_id: &str, now: DateTime<Utc>) -> Result<Transition, CollabError> {
        self.transition(id, user_id, SuggestionStatus::Accepted, None, now)
    }

    pub fn reject(
        &mut self,
        id: &str,
        user_id: &str,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Transition, CollabError> {
        self.transition(id, user_id, SuggestionStatus::Rejected, reason, now)
    }

    fn transition(
        &mut self,
        id: &str,
        user_id: &str,
        target: SuggestionStatus,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Transition, CollabError> {
        let suggestion = self
            .suggestions
            .get_mut(id)
            .ok_or_else(|| CollabError::SuggestionNotFound(id.to_string()))?;

        if suggestion.status != SuggestionStatus::Pending {
            let outcome = if suggestion.resolved_by.as_deref() == Some(user_id) {
                SuggestionOutcome::AlreadyResolvedByYou
            } else {
                SuggestionOutcome::AlreadyResolvedByOther
            };
            log::debug!("Suggestion {id} already {:?}; {user_id} gets a no-op", suggestion.status);
            return Ok(Transition {
                suggestion: suggestion.clone(),
                outcome,
            });
        }

        suggestion.status = target;
        suggestion.resolved_by = Some(user_id.to_string());
        suggestion.resolved_at = Some(now);
        suggestion.reject_reason = reason;
        let resolved = suggestion.clone();

        self.prune_resolved();
        Ok(Transition {
            suggestion: resolved,
            outcome: SuggestionOutcome::Applied,
        })
    }

    /// Forget the oldest resolved suggestions beyond `max_resolved`.
    fn prune_resolved(&mut self) {
        let resolved = self.suggestions.len() - self.pending_count();
        let mut excess = resolved.saturating_sub(self.max_resolved);
        if excess == 0 {
            return;
        }
        let suggestions = &mut self.suggestions;
        self.order.retain(|id| {
            if excess == 0 {
                return true;
            }
            match suggestions.get(id).map(|s| s.status) {
                Some(SuggestionStatus::Pending) => true,
                Some(_) => {
                    suggestions.remove(id);
                    excess -= 1;
                    false
                }
                None => false,
            }
        });
    }

    pub fn get(&self, id: &str) -> Option<&Suggestion> {
        self.suggestions.get(id)
    }

    /// Pending suggestions in arrival order.
    pub fn pending(&self) -> Vec<Suggestion> {
        self.order
            .iter()
            .filter_map(|id| self.suggestions.get(id))
            .filter(|s| s.status == SuggestionStatus::Pending)
            .cloned()
            .collect()
    }

    pub fn pending_count(&self) -> usize {
        self.suggestions
            .values()
            .filter(|s| s.status == SuggestionStatus::Pending)
            .count()
    }

    pub fn len(&self) -> usize {
        self.suggestions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.suggestions.is_empty()
    }
}
