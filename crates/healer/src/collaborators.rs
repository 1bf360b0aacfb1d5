//! Interfaces to the systems the Healer drives but does not own.
//!
//! The code agent, the verification runner, the working tree and the task
//! ledger all live outside this crate. Spells reach them only through these
//! traits, so callers can wire real backends or test fakes.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::types::Scenario;

/// Work item handed to the code agent by a `fix_*` spell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoverySubtask {
    pub id: String,
    pub description: String,
    pub scenario: Scenario,
    /// Guidance text rendered from heuristics
    pub guidance: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_output: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvokeOptions {
    /// Directory the agent works in
    pub cwd: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_turns: Option<u32>,
}

/// What the code agent reports back.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvokeResult {
    pub success: bool,
    pub subtask_id: String,
    #[serde(default)]
    pub files_modified: Vec<String>,
    #[serde(default)]
    pub turns: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationReport {
    pub success: bool,
    #[serde(default)]
    pub output: String,
}

/// LLM-backed code-modification agent.
#[async_trait]
pub trait CodeInvoker: Send + Sync {
    async fn invoke(
        &self,
        subtask: &RecoverySubtask,
        options: &InvokeOptions,
    ) -> anyhow::Result<InvokeResult>;
}

/// Runs the project's typecheck/test command.
#[async_trait]
pub trait VerificationRunner: Send + Sync {
    async fn verify(&self, project_root: &Path) -> anyhow::Result<VerificationReport>;
}

/// Working tree operations. Git plumbing lives behind this trait.
#[async_trait]
pub trait WorkspaceOps: Send + Sync {
    /// Discard uncommitted changes, returning the paths reverted.
    async fn rewind_uncommitted(&self, project_root: &Path) -> anyhow::Result<Vec<String>>;
}

/// Task store the orchestrator reads its work from.
#[async_trait]
pub trait TaskLedger: Send + Sync {
    /// Append notes to the progress log, scoped to a task when one is known.
    async fn append_notes(&self, task_id: Option<&str>, notes: &str) -> anyhow::Result<()>;

    /// Block a task and record the follow-up that should unblock it.
    async fn mark_blocked(&self, task_id: &str, reason: &str, followup: &str)
        -> anyhow::Result<()>;
}

/// Workspace that never touches disk.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopWorkspace;

#[async_trait]
impl WorkspaceOps for NoopWorkspace {
    async fn rewind_uncommitted(&self, _project_root: &Path) -> anyhow::Result<Vec<String>> {
        Ok(Vec::new())
    }
}

/// Ledger that accepts and drops every write.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTaskLedger;

#[async_trait]
impl TaskLedger for NoopTaskLedger {
    async fn append_notes(&self, _task_id: Option<&str>, _notes: &str) -> anyhow::Result<()> {
        Ok(())
    }

    async fn mark_blocked(
        &self,
        _task_id: &str,
        _reason: &str,
        _followup: &str,
    ) -> anyhow::Result<()> {
        Ok(())
    }
}
