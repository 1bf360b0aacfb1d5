//! Spell execution.
//!
//! Two executors share one trait. [`BasicExecutor`] only touches the working
//! tree and the task ledger; [`FullExecutor`] adds the code agent and the
//! verification runner, which the `fix_*` spells need.

use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::collaborators::{
    CodeInvoker, InvokeOptions, RecoverySubtask, TaskLedger, VerificationRunner, WorkspaceOps,
};
use crate::model::{OrchestratorState, Subtask};
use crate::patterns::render_guidance;
use crate::stuck::truncate_chars;
use crate::types::{Heuristics, Scenario, SpellId, SpellResult};

/// Longest error excerpt carried into follow-ups and agent prompts.
const MAX_ERROR_EXCERPT_CHARS: usize = 2000;

/// Turn cap handed to the code agent for a single fix.
const FIX_MAX_TURNS: u32 = 30;

/// Everything a spell may read while it runs.
#[derive(Debug, Clone, Copy)]
pub struct SpellContext<'a> {
    pub scenario: Scenario,
    pub heuristics: &'a Heuristics,
    pub state: &'a OrchestratorState,
    /// Task the failure belongs to: the one the event names, else the active one
    pub task_id: Option<&'a str>,
    pub project_root: &'a Path,
    /// Subtask the triggering event was about, if any
    pub subtask: Option<&'a Subtask>,
    /// Raw failure output from the triggering event
    pub failure_output: Option<&'a str>,
}

/// Casts spells against the collaborators it was built with.
#[async_trait]
pub trait SpellExecutor: Send + Sync {
    /// Whether this executor can cast spells that need the code agent.
    fn supports_llm(&self) -> bool;

    /// Cast one spell. Collaborator failures surface as `Err`.
    async fn cast(&self, spell: SpellId, ctx: &SpellContext<'_>) -> anyhow::Result<SpellResult>;
}

/// Executor for spells that need no code agent.
#[derive(Clone)]
pub struct BasicExecutor {
    workspace: Arc<dyn WorkspaceOps>,
    tasks: Arc<dyn TaskLedger>,
}

impl BasicExecutor {
    pub fn new(workspace: Arc<dyn WorkspaceOps>, tasks: Arc<dyn TaskLedger>) -> Self {
        Self { workspace, tasks }
    }

    async fn rewind(&self, ctx: &SpellContext<'_>) -> anyhow::Result<SpellResult> {
        let files = self.workspace.rewind_uncommitted(ctx.project_root).await?;
        if files.is_empty() {
            debug!("Working tree already clean");
            return Ok(SpellResult::success(
                "Working tree already clean, nothing to rewind",
                false,
            ));
        }

        info!(files = files.len(), "Rewound uncommitted changes");
        Ok(
            SpellResult::success(format!("Rewound {} uncommitted file(s)", files.len()), true)
                .with_files(files),
        )
    }

    async fn update_progress(&self, ctx: &SpellContext<'_>) -> anyhow::Result<SpellResult> {
        let guidance = render_guidance(ctx.heuristics);
        self.tasks.append_notes(ctx.task_id, &guidance).await?;

        let summary = match ctx.task_id {
            Some(id) => format!("Recorded guidance for task {id}"),
            None => "Recorded guidance in progress notes".to_string(),
        };
        Ok(SpellResult::success(summary, true))
    }

    async fn mark_blocked(&self, ctx: &SpellContext<'_>) -> anyhow::Result<SpellResult> {
        let Some(task_id) = ctx.task_id else {
            return Ok(SpellResult::failure("No active task to mark blocked"));
        };

        let reason = format!(
            "Healer could not resolve {} after {} failure(s)",
            ctx.scenario, ctx.heuristics.failure_count
        );
        let followup = build_followup(ctx);
        self.tasks.mark_blocked(task_id, &reason, &followup).await?;

        info!(task_id, scenario = %ctx.scenario, "Marked task blocked");
        Ok(SpellResult::success(
            format!("Marked task {task_id} blocked with follow-up"),
            true,
        ))
    }
}

#[async_trait]
impl SpellExecutor for BasicExecutor {
    fn supports_llm(&self) -> bool {
        false
    }

    async fn cast(&self, spell: SpellId, ctx: &SpellContext<'_>) -> anyhow::Result<SpellResult> {
        match spell {
            SpellId::RewindUncommittedChanges => self.rewind(ctx).await,
            SpellId::UpdateProgressWithGuidance => self.update_progress(ctx).await,
            SpellId::MarkTaskBlockedWithFollowup => self.mark_blocked(ctx).await,
            SpellId::FixTypecheckErrors | SpellId::FixTestErrors => {
                warn!(%spell, "Spell requires the code agent, which is not configured");
                Ok(SpellResult::failure(format!(
                    "{spell} requires a code agent; none is configured"
                )))
            }
        }
    }
}

/// Executor that can also drive the code agent and re-verify.
#[derive(Clone)]
pub struct FullExecutor {
    basic: BasicExecutor,
    invoker: Arc<dyn CodeInvoker>,
    verifier: Arc<dyn VerificationRunner>,
}

impl FullExecutor {
    pub fn new(
        basic: BasicExecutor,
        invoker: Arc<dyn CodeInvoker>,
        verifier: Arc<dyn VerificationRunner>,
    ) -> Self {
        Self {
            basic,
            invoker,
            verifier,
        }
    }

    /// Ask the agent for a fix, then re-verify.
    ///
    /// Success needs both modified files and a passing verification run.
    async fn fix(&self, spell: SpellId, ctx: &SpellContext<'_>) -> anyhow::Result<SpellResult> {
        let recovery = build_recovery_subtask(spell, ctx);
        let options = InvokeOptions {
            cwd: ctx.project_root.to_path_buf(),
            max_turns: Some(FIX_MAX_TURNS),
        };

        debug!(%spell, subtask_id = %recovery.id, "Invoking code agent");
        let invoked = self.invoker.invoke(&recovery, &options).await?;

        let changes_applied = invoked.success && !invoked.files_modified.is_empty();
        if !changes_applied {
            return Ok(SpellResult::failure(format!(
                "Code agent made no changes after {} turn(s)",
                invoked.turns
            )));
        }

        let files = invoked.files_modified;
        let count = files.len();

        let (passed, error) = match self.verifier.verify(ctx.project_root).await {
            Ok(report) if report.success => (true, None),
            Ok(report) => (
                false,
                Some(truncate_chars(report.output.trim(), MAX_ERROR_EXCERPT_CHARS)),
            ),
            Err(e) => (false, Some(format!("verification could not run: {e:#}"))),
        };

        let mut result = if passed {
            info!(%spell, files = count, "Fix verified");
            SpellResult::success(
                format!("Modified {count} file(s); verification passes"),
                true,
            )
        } else {
            warn!(%spell, files = count, "Fix applied but verification still fails");
            SpellResult {
                changes_applied: true,
                error,
                ..SpellResult::failure(format!(
                    "Modified {count} file(s) but checks still fail"
                ))
            }
        };
        result.verification_passed = Some(passed);
        Ok(result.with_files(files))
    }
}

#[async_trait]
impl SpellExecutor for FullExecutor {
    fn supports_llm(&self) -> bool {
        true
    }

    async fn cast(&self, spell: SpellId, ctx: &SpellContext<'_>) -> anyhow::Result<SpellResult> {
        if spell.requires_llm() {
            self.fix(spell, ctx).await
        } else {
            self.basic.cast(spell, ctx).await
        }
    }
}

fn build_recovery_subtask(spell: SpellId, ctx: &SpellContext<'_>) -> RecoverySubtask {
    let base = ctx.subtask.map_or(ctx.state.session_id.as_str(), |s| s.id.as_str());
    let description = match spell {
        SpellId::FixTestErrors => {
            "Make the failing tests pass. Fix the code under test; only change a test when it is wrong."
        }
        _ => "Fix the type errors reported below without changing behaviour.",
    };

    RecoverySubtask {
        id: format!("{base}-{spell}"),
        description: description.to_string(),
        scenario: ctx.scenario,
        guidance: render_guidance(ctx.heuristics),
        failure_output: ctx
            .failure_output
            .map(|out| truncate_chars(out, MAX_ERROR_EXCERPT_CHARS)),
    }
}

/// Draft the follow-up description recorded with a blocked task.
fn build_followup(ctx: &SpellContext<'_>) -> String {
    let heuristics = ctx.heuristics;
    let mut msg = String::new();

    msg.push_str(&format!("## Follow-up: {}\n\n", ctx.scenario));
    if let Some(subtask) = ctx.subtask {
        msg.push_str(&format!(
            "- **Subtask**: {} ({})\n",
            subtask.id, subtask.description
        ));
    }
    msg.push_str(&format!("- **Failures**: {}\n", heuristics.failure_count));
    if !heuristics.error_patterns.is_empty() {
        msg.push_str(&format!(
            "- **Detected**: {}\n",
            heuristics.error_patterns.join(", ")
        ));
    }

    if let Some(error) = ctx.failure_output.filter(|e| !e.trim().is_empty()) {
        msg.push_str("\n### Last Error\n\n```\n");
        msg.push_str(&truncate_chars(error.trim(), MAX_ERROR_EXCERPT_CHARS));
        msg.push_str("\n```\n");
    }

    msg.push_str("\nResolve the failure above, then unblock the task.\n");
    msg
}
