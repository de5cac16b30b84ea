//! Progress aggregation.
//!
//! A [`ProgressSnapshot`] is a view: it is recomputed from [`TaskStats`] and
//! the presence set every time, never mutated on its own.

use serde::{Deserialize, Serialize};

use crate::presence::PresenceTracker;
use crate::protocol::Role;

/// Task counters owned by the annotation store (or pushed by the engine).
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStats {
    pub total_tasks: u64,
    pub completed_tasks: u64,
    pub in_progress_tasks: u64,
    pub pending_tasks: u64,
    /// Time spent on completed tasks.
    #[serde(default)]
    pub total_time_minutes: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressSnapshot {
    pub total_tasks: u64,
    pub completed_tasks: u64,
    pub in_progress_tasks: u64,
    pub pending_tasks: u64,
    /// Percentage in `[0, 100]`, one decimal.
    pub completion_rate: f64,
    pub avg_time_per_task_minutes: f64,
    pub active_annotators: usize,
    pub active_reviewers: usize,
}

fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

/// Recompute the snapshot for one document.
pub fn recompute(stats: &TaskStats, presence: &PresenceTracker) -> ProgressSnapshot {
    let completion_rate = if stats.total_tasks == 0 {
        0.0
    } else {
        round_to(stats.completed_tasks as f64 * 100.0 / stats.total_tasks as f64, 1)
    };
    let avg_time_per_task_minutes = if stats.completed_tasks == 0 {
        0.0
    } else {
        round_to(stats.total_time_minutes / stats.completed_tasks as f64, 2)
    };

    ProgressSnapshot {
        total_tasks: stats.total_tasks,
        completed_tasks: stats.completed_tasks,
        in_progress_tasks: stats.in_progress_tasks,
        pending_tasks: stats.pending_tasks,
        completion_rate,
        avg_time_per_task_minutes,
        active_annotators: presence.active_count(Role::Annotator),
        active_reviewers: presence.active_count(Role::Reviewer),
    }
}
