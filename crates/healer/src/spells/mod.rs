//! Spell registry and planning.
//!
//! Each scenario has a fixed, ordered list of spells. Planning narrows that
//! list by the project's allow/forbid lists and the executor's capabilities.

pub mod executor;

pub use executor::{BasicExecutor, FullExecutor, SpellContext, SpellExecutor};

use crate::classify::ScenarioMatch;
use crate::config::HealerConfig;
use crate::error::{HealerError, Result};
use crate::types::{Scenario, SpellId};

/// Ordered spells for a classified scenario.
#[must_use]
pub fn scenario_spells(matched: ScenarioMatch) -> Vec<SpellId> {
    use SpellId::{
        FixTestErrors, FixTypecheckErrors, MarkTaskBlockedWithFollowup,
        RewindUncommittedChanges, UpdateProgressWithGuidance,
    };

    match matched.scenario {
        Scenario::InitScriptTypecheckFailure => vec![
            FixTypecheckErrors,
            UpdateProgressWithGuidance,
            MarkTaskBlockedWithFollowup,
        ],
        Scenario::InitScriptTestFailure => vec![
            FixTestErrors,
            UpdateProgressWithGuidance,
            MarkTaskBlockedWithFollowup,
        ],
        Scenario::InitScriptFailure | Scenario::StuckSubtask => {
            vec![UpdateProgressWithGuidance, MarkTaskBlockedWithFollowup]
        }
        Scenario::VerificationFailed => vec![RewindUncommittedChanges, UpdateProgressWithGuidance],
        Scenario::SubtaskFailed if matched.repeated => {
            vec![MarkTaskBlockedWithFollowup, UpdateProgressWithGuidance]
        }
        Scenario::SubtaskFailed => vec![RewindUncommittedChanges, UpdateProgressWithGuidance],
        Scenario::RuntimeError => vec![
            RewindUncommittedChanges,
            UpdateProgressWithGuidance,
            MarkTaskBlockedWithFollowup,
        ],
    }
}

/// Constraints from the executor and config applied during planning.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlanOptions {
    /// Drop spells that need the code agent
    pub skip_llm_spells: bool,
    pub max_spells: Option<usize>,
}

impl PlanOptions {
    /// Options for an executor, capped by the config's per-invocation limit.
    #[must_use]
    pub fn for_executor(supports_llm: bool, config: &HealerConfig) -> Self {
        Self {
            skip_llm_spells: !supports_llm,
            max_spells: config.max_spells_per_invocation,
        }
    }
}

/// Plan the spells to cast, in order.
///
/// An empty `allowed` list allows every spell. `forbidden` always wins.
pub fn plan_spells(
    matched: ScenarioMatch,
    config: &HealerConfig,
    options: PlanOptions,
) -> Result<Vec<SpellId>> {
    let allowed = config.spells.allowed_ids()?;
    let forbidden = config.spells.forbidden_ids()?;

    if options.max_spells == Some(0) {
        return Err(HealerError::InvalidConfig(
            "maxSpellsPerInvocation must be at least 1".to_string(),
        ));
    }

    let mut spells: Vec<SpellId> = scenario_spells(matched)
        .into_iter()
        .filter(|spell| allowed.is_empty() || allowed.contains(spell))
        .filter(|spell| !forbidden.contains(spell))
        .filter(|spell| !(options.skip_llm_spells && spell.requires_llm()))
        .collect();

    if let Some(max) = options.max_spells {
        spells.truncate(max);
    }

    Ok(spells)
}
