//! Events consumed from the orchestrator and events emitted by the Healer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::model::{OrchestratorPhase, Subtask, Task};
use crate::stuck::StuckReason;
use crate::types::{HealerOutcome, Scenario, SpellId, SpellResult};

/// Structured failure types reported by the init script.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InitScriptFailureType {
    TypecheckFailed,
    TestFailed,
    NetworkError,
    DiskFull,
    PermissionDenied,
    Unknown,
}

/// Result of running the project's init script.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitScriptResult {
    pub ran: bool,
    /// false when the script aborted the session
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_type: Option<InitScriptFailureType>,
}

/// Events emitted by the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OrchestratorEvent {
    SessionStart {
        session_id: String,
        timestamp: DateTime<Utc>,
    },
    InitScriptComplete {
        result: InitScriptResult,
    },
    TaskSelected {
        task: Task,
    },
    SubtaskStart {
        subtask: Subtask,
    },
    SubtaskComplete {
        subtask: Subtask,
    },
    SubtaskFailed {
        subtask: Subtask,
        error: String,
    },
    SubtaskStuck {
        subtask: Subtask,
        task_id: String,
        reason: StuckReason,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        hours_stuck: Option<f64>,
    },
    VerificationStart {
        command: String,
    },
    VerificationComplete {
        command: String,
        passed: bool,
        output: String,
    },
    PhaseTransition {
        from: OrchestratorPhase,
        to: OrchestratorPhase,
    },
    SessionComplete {
        success: bool,
        summary: String,
    },
    Error {
        phase: OrchestratorPhase,
        error: String,
    },
}

impl OrchestratorEvent {
    /// The serialized `type` tag of this event.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SessionStart { .. } => "session_start",
            Self::InitScriptComplete { .. } => "init_script_complete",
            Self::TaskSelected { .. } => "task_selected",
            Self::SubtaskStart { .. } => "subtask_start",
            Self::SubtaskComplete { .. } => "subtask_complete",
            Self::SubtaskFailed { .. } => "subtask_failed",
            Self::SubtaskStuck { .. } => "subtask_stuck",
            Self::VerificationStart { .. } => "verification_start",
            Self::VerificationComplete { .. } => "verification_complete",
            Self::PhaseTransition { .. } => "phase_transition",
            Self::SessionComplete { .. } => "session_complete",
            Self::Error { .. } => "error",
        }
    }

    /// The subtask this event is about, when it names one.
    #[must_use]
    pub fn subtask(&self) -> Option<&Subtask> {
        match self {
            Self::SubtaskStart { subtask }
            | Self::SubtaskComplete { subtask }
            | Self::SubtaskFailed { subtask, .. }
            | Self::SubtaskStuck { subtask, .. } => Some(subtask),
            _ => None,
        }
    }

    /// Id of the subtask whose budget a healer run would consume.
    #[must_use]
    pub fn subtask_id(&self) -> Option<&str> {
        match self {
            Self::SubtaskFailed { subtask, .. } | Self::SubtaskStuck { subtask, .. } => {
                Some(subtask.id.as_str())
            }
            _ => None,
        }
    }

    /// Task the event names explicitly; only stuck sweeps carry one.
    #[must_use]
    pub fn task_id(&self) -> Option<&str> {
        match self {
            Self::SubtaskStuck { task_id, .. } => Some(task_id.as_str()),
            Self::TaskSelected { task } => Some(task.id.as_str()),
            _ => None,
        }
    }

    /// Raw failure output carried by the event, if any.
    #[must_use]
    pub fn failure_output(&self) -> Option<&str> {
        match self {
            Self::InitScriptComplete { result } => result
                .output
                .as_deref()
                .filter(|out| !out.trim().is_empty())
                .or(result.error.as_deref()),
            Self::VerificationComplete { output, .. } => Some(output.as_str()),
            Self::SubtaskFailed { error, .. } => Some(error.as_str()),
            Self::SubtaskStuck { subtask, .. } => subtask
                .last_failure_reason
                .as_deref()
                .or(subtask.error.as_deref()),
            Self::Error { error, .. } => Some(error.as_str()),
            _ => None,
        }
    }

    /// Consecutive failure count of the subtask involved, or 0.
    #[must_use]
    pub fn failure_count(&self) -> u32 {
        match self {
            Self::SubtaskFailed { subtask, .. } | Self::SubtaskStuck { subtask, .. } => {
                subtask.failures()
            }
            _ => 0,
        }
    }
}

/// Observability events emitted while the Healer runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HealerEvent {
    /// An invocation passed classification and budget and is about to cast spells
    HealerStart {
        invocation_id: Uuid,
        scenario: Scenario,
        spells: Vec<SpellId>,
        #[serde(default = "Utc::now")]
        timestamp: DateTime<Utc>,
    },
    HealerSpellStart {
        invocation_id: Uuid,
        spell: SpellId,
        #[serde(default = "Utc::now")]
        timestamp: DateTime<Utc>,
    },
    HealerSpellComplete {
        invocation_id: Uuid,
        spell: SpellId,
        result: SpellResult,
        #[serde(default = "Utc::now")]
        timestamp: DateTime<Utc>,
    },
    HealerComplete {
        invocation_id: Uuid,
        outcome: HealerOutcome,
        #[serde(default = "Utc::now")]
        timestamp: DateTime<Utc>,
    },
}

impl HealerEvent {
    /// The serialized `type` tag of this event.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::HealerStart { .. } => "healer_start",
            Self::HealerSpellStart { .. } => "healer_spell_start",
            Self::HealerSpellComplete { .. } => "healer_spell_complete",
            Self::HealerComplete { .. } => "healer_complete",
        }
    }

    #[must_use]
    pub fn invocation_id(&self) -> Uuid {
        match self {
            Self::HealerStart { invocation_id, .. }
            | Self::HealerSpellStart { invocation_id, .. }
            | Self::HealerSpellComplete { invocation_id, .. }
            | Self::HealerComplete { invocation_id, .. } => *invocation_id,
        }
    }
}

/// Fire-and-forget receiver for [`HealerEvent`]s.
///
/// Implementations must return quickly; the Healer does not wait on them and
/// gives no back-pressure guarantee.
pub trait HealerEventSink: Send + Sync {
    fn emit(&self, event: HealerEvent);
}

impl<F> HealerEventSink for F
where
    F: Fn(HealerEvent) + Send + Sync,
{
    fn emit(&self, event: HealerEvent) {
        self(event);
    }
}

/// Default sink: writes each event to the `tracing` log.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingEventSink;

impl HealerEventSink for TracingEventSink {
    fn emit(&self, event: HealerEvent) {
        match &event {
            HealerEvent::HealerStart {
                invocation_id,
                scenario,
                spells,
                ..
            } => {
                let names: Vec<&str> = spells.iter().map(|s| s.as_str()).collect();
                info!(%invocation_id, %scenario, spells = ?names, "Healer starting");
            }
            HealerEvent::HealerSpellStart {
                invocation_id,
                spell,
                ..
            } => {
                debug!(%invocation_id, %spell, "Casting spell");
            }
            HealerEvent::HealerSpellComplete {
                invocation_id,
                spell,
                result,
                ..
            } => {
                if result.success {
                    info!(%invocation_id, %spell, summary = %result.summary, "Spell succeeded");
                } else {
                    warn!(%invocation_id, %spell, summary = %result.summary, "Spell failed");
                }
            }
            HealerEvent::HealerComplete {
                invocation_id,
                outcome,
                ..
            } => {
                info!(
                    %invocation_id,
                    scenario = %outcome.scenario,
                    status = ?outcome.status,
                    tried = outcome.spells_tried.len(),
                    succeeded = outcome.spells_succeeded.len(),
                    "Healer finished"
                );
            }
        }
    }
}
