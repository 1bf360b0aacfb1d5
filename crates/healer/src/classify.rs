//! Scenario classification.
//!
//! Maps an orchestrator event onto a [`Scenario`], honouring the healer's
//! enable switch and per-scenario toggles. Not matching is a normal result.

use crate::config::HealerConfig;
use crate::events::{InitScriptFailureType, OrchestratorEvent};
use crate::types::Scenario;

/// Event types the Healer may act on.
pub const HEALABLE_EVENTS: [&str; 5] = [
    "init_script_complete",
    "verification_complete",
    "subtask_failed",
    "subtask_stuck",
    "error",
];

/// A classified scenario plus annotations for spell selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScenarioMatch {
    pub scenario: Scenario,
    /// The subtask has failed at least `repeated_failure_threshold` times
    pub repeated: bool,
}

impl ScenarioMatch {
    #[must_use]
    pub fn new(scenario: Scenario) -> Self {
        Self {
            scenario,
            repeated: false,
        }
    }
}

/// Check if a scenario is enabled in the config.
#[must_use]
pub fn is_scenario_enabled(scenario: Scenario, config: &HealerConfig) -> bool {
    match scenario {
        Scenario::InitScriptTypecheckFailure
        | Scenario::InitScriptTestFailure
        | Scenario::InitScriptFailure => config.scenarios.on_init_failure,
        Scenario::VerificationFailed => config.scenarios.on_verification_failure,
        Scenario::SubtaskFailed => config.scenarios.on_subtask_failure,
        Scenario::RuntimeError => config.scenarios.on_runtime_error,
        Scenario::StuckSubtask => config.scenarios.on_stuck_subtask,
    }
}

/// Classify an event, returning `None` when the Healer should stay out of it.
#[must_use]
pub fn classify(event: &OrchestratorEvent, config: &HealerConfig) -> Option<ScenarioMatch> {
    if !config.enabled {
        return None;
    }

    let matched = match event {
        OrchestratorEvent::InitScriptComplete { result } if !result.success => {
            let scenario = match result.failure_type {
                Some(InitScriptFailureType::TypecheckFailed) => {
                    Scenario::InitScriptTypecheckFailure
                }
                Some(InitScriptFailureType::TestFailed) => Scenario::InitScriptTestFailure,
                _ => Scenario::InitScriptFailure,
            };
            ScenarioMatch::new(scenario)
        }
        OrchestratorEvent::VerificationComplete { passed: false, .. } => {
            ScenarioMatch::new(Scenario::VerificationFailed)
        }
        OrchestratorEvent::SubtaskFailed { subtask, .. } => ScenarioMatch {
            scenario: Scenario::SubtaskFailed,
            repeated: subtask.failures() >= config.repeated_failure_threshold,
        },
        OrchestratorEvent::SubtaskStuck { subtask, .. } => ScenarioMatch {
            scenario: Scenario::StuckSubtask,
            repeated: subtask.failures() >= config.repeated_failure_threshold,
        },
        OrchestratorEvent::Error { .. } => ScenarioMatch::new(Scenario::RuntimeError),
        _ => return None,
    };

    is_scenario_enabled(matched.scenario, config).then_some(matched)
}
