//! Task, subtask and orchestrator-state snapshots the Healer reads.
//!
//! These are read-only views of what the orchestrator owns; the Healer never
//! persists them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Task status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Open,
    InProgress,
    Blocked,
    Closed,
}

/// A task tracked by the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub status: TaskStatus,
    pub updated_at: DateTime<Utc>,
}

/// Subtask status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SubtaskStatus {
    #[default]
    Pending,
    InProgress,
    Done,
    Verified,
    Failed,
}

impl SubtaskStatus {
    /// Finished subtasks are never considered stuck.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Verified)
    }
}

/// A unit of work inside a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subtask {
    pub id: String,
    pub description: String,
    #[serde(default)]
    pub status: SubtaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Consecutive failures on this subtask
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_failure_reason: Option<String>,
}

impl Subtask {
    pub fn new(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            status: SubtaskStatus::Pending,
            started_at: None,
            completed_at: None,
            error: None,
            failure_count: None,
            last_failure_reason: None,
        }
    }

    #[must_use]
    pub fn failures(&self) -> u32 {
        self.failure_count.unwrap_or(0)
    }
}

/// A subtask paired with the id of the task that owns it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubtaskWithTaskId {
    pub task_id: String,
    #[serde(flatten)]
    pub subtask: Subtask,
}

/// Orchestrator phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OrchestratorPhase {
    #[default]
    Idle,
    Orienting,
    SelectingTask,
    Decomposing,
    ExecutingSubtask,
    Verifying,
    Committing,
    UpdatingTask,
    Logging,
    Done,
    Failed,
}

/// Read-only snapshot of the orchestrator session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestratorState {
    pub session_id: String,
    #[serde(default)]
    pub phase: OrchestratorPhase,
    /// Task currently being worked on
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<Task>,
    #[serde(default)]
    pub subtasks: Vec<Subtask>,
}

impl OrchestratorState {
    /// Look up a subtask by id.
    #[must_use]
    pub fn subtask(&self, id: &str) -> Option<&Subtask> {
        self.subtasks.iter().find(|s| s.id == id)
    }

    #[must_use]
    pub fn task_id(&self) -> Option<&str> {
        self.task.as_ref().map(|t| t.id.as_str())
    }
}
