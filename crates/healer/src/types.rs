//! Core Healer types: scenarios, spells, results and outcomes.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::HealerError;

/// Classified failure situation that selects a spell list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Scenario {
    /// Init script failed on typecheck
    InitScriptTypecheckFailure,
    /// Init script failed on tests
    InitScriptTestFailure,
    /// Init script failed for any other reason (network, disk, permissions)
    InitScriptFailure,
    /// Post-work verification failed
    VerificationFailed,
    /// A subtask failed during execution
    SubtaskFailed,
    /// Unexpected orchestrator runtime error
    RuntimeError,
    /// A subtask made no progress past the stuck threshold
    StuckSubtask,
}

impl Scenario {
    /// Whether this is one of the init-script scenarios.
    #[must_use]
    pub fn is_init_script(self) -> bool {
        matches!(
            self,
            Self::InitScriptTypecheckFailure | Self::InitScriptTestFailure | Self::InitScriptFailure
        )
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::InitScriptTypecheckFailure => "InitScriptTypecheckFailure",
            Self::InitScriptTestFailure => "InitScriptTestFailure",
            Self::InitScriptFailure => "InitScriptFailure",
            Self::VerificationFailed => "VerificationFailed",
            Self::SubtaskFailed => "SubtaskFailed",
            Self::RuntimeError => "RuntimeError",
            Self::StuckSubtask => "StuckSubtask",
        };
        f.write_str(name)
    }
}

/// Spell identifiers. Each spell is a controlled recovery operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpellId {
    /// Ask the code agent to fix type errors, then re-verify
    FixTypecheckErrors,
    /// Ask the code agent to fix failing tests, then re-verify
    FixTestErrors,
    /// Revert the working tree to the last commit
    RewindUncommittedChanges,
    /// Mark the owning task blocked and draft a follow-up
    MarkTaskBlockedWithFollowup,
    /// Write heuristics-derived guidance into task notes
    UpdateProgressWithGuidance,
}

impl SpellId {
    /// Every known spell.
    pub const ALL: [Self; 5] = [
        Self::FixTypecheckErrors,
        Self::FixTestErrors,
        Self::RewindUncommittedChanges,
        Self::MarkTaskBlockedWithFollowup,
        Self::UpdateProgressWithGuidance,
    ];

    /// Stable snake_case name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::FixTypecheckErrors => "fix_typecheck_errors",
            Self::FixTestErrors => "fix_test_errors",
            Self::RewindUncommittedChanges => "rewind_uncommitted_changes",
            Self::MarkTaskBlockedWithFollowup => "mark_task_blocked_with_followup",
            Self::UpdateProgressWithGuidance => "update_progress_with_guidance",
        }
    }

    /// Whether casting this spell needs the LLM-backed code agent.
    #[must_use]
    pub fn requires_llm(self) -> bool {
        matches!(self, Self::FixTypecheckErrors | Self::FixTestErrors)
    }

    /// Whether the spell contract includes a re-verification step.
    #[must_use]
    pub fn verifies(self) -> bool {
        self.requires_llm()
    }
}

impl fmt::Display for SpellId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SpellId {
    type Err = HealerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|spell| spell.as_str() == s)
            .ok_or_else(|| HealerError::UnknownSpell(s.to_string()))
    }
}

/// Result from casting a single spell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpellResult {
    /// Whether the spell achieved its contract
    pub success: bool,
    /// Human-readable summary of what happened
    pub summary: String,
    /// Whether the spell changed files or tasks
    pub changes_applied: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub files_modified: Option<Vec<String>>,
    /// Outcome of re-verification, for spells that verify
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification_passed: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SpellResult {
    /// A successful spell result.
    pub fn success(summary: impl Into<String>, changes_applied: bool) -> Self {
        Self {
            success: true,
            summary: summary.into(),
            changes_applied,
            files_modified: None,
            verification_passed: None,
            error: None,
        }
    }

    /// A failed spell result that changed nothing.
    pub fn failure(summary: impl Into<String>) -> Self {
        Self {
            success: false,
            summary: summary.into(),
            changes_applied: false,
            files_modified: None,
            verification_passed: None,
            error: None,
        }
    }

    /// A failed spell result carrying the underlying error message.
    pub fn from_error(spell: SpellId, error: &anyhow::Error) -> Self {
        let message = format!("{error:#}");
        Self {
            error: Some(message.clone()),
            ..Self::failure(format!("{spell} failed: {message}"))
        }
    }

    #[must_use]
    pub fn with_files(mut self, files: Vec<String>) -> Self {
        self.files_modified = Some(files);
        self
    }
}

/// One spell attempt inside an invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpellAttempt {
    pub spell: SpellId,
    pub result: SpellResult,
}

/// Final status of a Healer invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutcomeStatus {
    /// At least one spell succeeded
    Fixed,
    /// Every attempted spell failed
    Unresolved,
}

/// Overall result from a Healer invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealerOutcome {
    pub status: OutcomeStatus,
    pub scenario: Scenario,
    /// Spells attempted, in order
    pub spells_tried: Vec<SpellId>,
    /// Spells that met their contract (always a subset of `spells_tried`)
    pub spells_succeeded: Vec<SpellId>,
    /// Per-spell results, in attempt order
    pub attempts: Vec<SpellAttempt>,
    pub summary: String,
    /// Result of the last re-verification run, if any spell verified
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification_passed: Option<bool>,
}

impl HealerOutcome {
    /// Assemble an outcome from the attempts of one invocation.
    #[must_use]
    pub fn from_attempts(scenario: Scenario, attempts: Vec<SpellAttempt>) -> Self {
        let spells_tried: Vec<SpellId> = attempts.iter().map(|a| a.spell).collect();
        let spells_succeeded: Vec<SpellId> = attempts
            .iter()
            .filter(|a| a.result.success)
            .map(|a| a.spell)
            .collect();
        let verification_passed = attempts
            .iter()
            .rev()
            .find_map(|a| a.result.verification_passed);

        let status = if spells_succeeded.is_empty() {
            OutcomeStatus::Unresolved
        } else {
            OutcomeStatus::Fixed
        };

        let summary = match attempts.iter().find(|a| a.result.success) {
            Some(winner) => format!("{scenario}: {} succeeded - {}", winner.spell, winner.result.summary),
            None if attempts.is_empty() => format!("{scenario}: no spells available"),
            None => format!(
                "{scenario}: {} spell(s) tried, none succeeded",
                attempts.len()
            ),
        };

        Self {
            status,
            scenario,
            spells_tried,
            spells_succeeded,
            attempts,
            summary,
            verification_passed,
        }
    }

    #[must_use]
    pub fn is_fixed(&self) -> bool {
        self.status == OutcomeStatus::Fixed
    }

    /// Result recorded for a given spell, if it was attempted.
    #[must_use]
    pub fn result_for(&self, spell: SpellId) -> Option<&SpellResult> {
        self.attempts
            .iter()
            .find(|a| a.spell == spell)
            .map(|a| &a.result)
    }
}

/// Signals derived from the failure output to guide spell choice and guidance text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heuristics {
    pub scenario: Scenario,
    /// Number of times the subtask has failed
    pub failure_count: u32,
    /// The subtask reached the repeated-failure threshold
    #[serde(default)]
    pub repeated: bool,
    /// Detected error categories
    pub error_patterns: Vec<String>,
    pub has_missing_imports: bool,
    pub has_type_errors: bool,
    pub has_test_assertions: bool,
    /// Reserved: cross-session flakiness detection
    pub is_flaky: bool,
    /// Earlier healer runs this session on the same task, subtask and scenario
    pub previous_attempts: u32,
}
