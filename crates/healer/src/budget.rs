//! Invocation budget tracking.
//!
//! A session's [`HealerCounters`] are checked before any spell runs and
//! incremented after every attempt, whatever its outcome. Spending budget on
//! failed remediation is what bounds the healer loop. The counters also keep
//! a ledger of healing attempts keyed by a failure fingerprint, so the same
//! failure is not healed twice in one session.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};

use crate::classify::ScenarioMatch;
use crate::config::HealerConfig;
use crate::types::{HealerOutcome, OutcomeStatus, Scenario, SpellId};

/// Per-session invocation counters and healing ledger.
///
/// Counts only ever grow; [`increment_after_run`] is the sole mutator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealerCounters {
    session_invocations: u32,
    subtask_invocations: HashMap<String, u32>,
    #[serde(default)]
    spells_attempted: HashMap<SpellId, u32>,
    /// `taskId:scenario` pairs that already got a follow-up
    #[serde(default)]
    followup_keys: HashSet<String>,
    #[serde(default)]
    healing_attempts: HashMap<String, HealingAttempt>,
}

impl HealerCounters {
    /// Fresh counters for a new session.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn session_invocations(&self) -> u32 {
        self.session_invocations
    }

    /// Invocations charged to a subtask; 0 if it was never charged.
    #[must_use]
    pub fn subtask_invocations(&self, subtask_id: &str) -> u32 {
        self.subtask_invocations
            .get(subtask_id)
            .copied()
            .unwrap_or(0)
    }

    /// How many times a spell was cast this session.
    #[must_use]
    pub fn spell_attempts(&self, spell: SpellId) -> u32 {
        self.spells_attempted.get(&spell).copied().unwrap_or(0)
    }

    /// Whether a follow-up was already drafted for this task and scenario.
    #[must_use]
    pub fn has_followup(&self, task_id: &str, scenario: Scenario) -> bool {
        self.followup_keys.contains(&followup_key(task_id, scenario))
    }

    #[must_use]
    pub fn has_attempt(&self, key: &str) -> bool {
        self.healing_attempts.contains_key(key)
    }

    #[must_use]
    pub fn attempt(&self, key: &str) -> Option<&HealingAttempt> {
        self.healing_attempts.get(key)
    }

    /// Earlier runs on the same task, subtask and scenario, whatever the error.
    #[must_use]
    pub fn previous_attempts(&self, key: &HealingKey) -> u32 {
        let count = self
            .healing_attempts
            .values()
            .filter(|a| {
                a.scenario == key.scenario
                    && a.task_id == key.task_id
                    && a.subtask_id == key.subtask_id
            })
            .count();
        u32::try_from(count).unwrap_or(u32::MAX)
    }
}

fn followup_key(task_id: &str, scenario: Scenario) -> String {
    format!("{task_id}:{scenario}")
}

/// Fingerprint of one failure, used to deduplicate healing runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealingKey {
    /// `task:subtask:scenario:hash`, with `none` for a missing id
    pub key: String,
    pub error_hash: String,
    pub scenario: Scenario,
    pub task_id: Option<String>,
    pub subtask_id: Option<String>,
}

/// Short stable hash of an error string: the first 8 bytes of its SHA-256, hex encoded.
#[must_use]
pub fn hash_error(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    hex::encode(&digest[..8])
}

/// Build the dedup key for a classified failure.
///
/// The repeated annotation is part of the hash so that a subtask crossing
/// the repeated-failure threshold is healed again and can escalate.
#[must_use]
pub fn build_healing_key(
    matched: ScenarioMatch,
    task_id: Option<&str>,
    subtask_id: Option<&str>,
    error_output: &str,
) -> HealingKey {
    let scenario = matched.scenario;
    let error_hash = hash_error(&format!(
        "{scenario}:{}:{}",
        matched.repeated,
        error_output.trim()
    ));
    let key = format!(
        "{}:{}:{scenario}:{error_hash}",
        task_id.unwrap_or("none"),
        subtask_id.unwrap_or("none"),
    );

    HealingKey {
        key,
        error_hash,
        scenario,
        task_id: task_id.map(str::to_string),
        subtask_id: subtask_id.map(str::to_string),
    }
}

/// Record of one finished healing run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealingAttempt {
    pub key: String,
    pub scenario: Scenario,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtask_id: Option<String>,
    pub error_hash: String,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    pub status: OutcomeStatus,
    pub spells_tried: Vec<SpellId>,
    pub spells_succeeded: Vec<SpellId>,
    pub summary: String,
}

impl HealingAttempt {
    #[must_use]
    pub fn new(key: HealingKey, outcome: &HealerOutcome) -> Self {
        Self {
            key: key.key,
            scenario: key.scenario,
            task_id: key.task_id,
            subtask_id: key.subtask_id,
            error_hash: key.error_hash,
            timestamp: Utc::now(),
            status: outcome.status,
            spells_tried: outcome.spells_tried.clone(),
            spells_succeeded: outcome.spells_succeeded.clone(),
            summary: outcome.summary.clone(),
        }
    }
}

/// Result of checking the budget.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BudgetDecision {
    Allowed,
    SessionExhausted {
        used: u32,
        max: u32,
    },
    SubtaskExhausted {
        subtask_id: String,
        used: u32,
        max: u32,
    },
}

impl BudgetDecision {
    #[must_use]
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }

    /// Human-readable reason, suitable for logs.
    #[must_use]
    pub fn reason(&self) -> String {
        match self {
            Self::Allowed => "Within healer budget".to_string(),
            Self::SessionExhausted { used, max } => {
                format!("Session limit reached ({used}/{max})")
            }
            Self::SubtaskExhausted {
                subtask_id,
                used,
                max,
            } => format!("Subtask limit reached for '{subtask_id}' ({used}/{max})"),
        }
    }
}

/// Evaluate the budget, explaining any denial.
#[must_use]
pub fn evaluate_budget(
    counters: &HealerCounters,
    config: &HealerConfig,
    subtask_id: Option<&str>,
) -> BudgetDecision {
    if counters.session_invocations >= config.max_invocations_per_session {
        return BudgetDecision::SessionExhausted {
            used: counters.session_invocations,
            max: config.max_invocations_per_session,
        };
    }

    if let Some(id) = subtask_id {
        let used = counters.subtask_invocations(id);
        if used >= config.max_invocations_per_subtask {
            return BudgetDecision::SubtaskExhausted {
                subtask_id: id.to_string(),
                used,
                max: config.max_invocations_per_subtask,
            };
        }
    }

    BudgetDecision::Allowed
}

/// Whether another healer invocation fits in the budget.
#[must_use]
pub fn check_budget(
    counters: &HealerCounters,
    config: &HealerConfig,
    subtask_id: Option<&str>,
) -> bool {
    evaluate_budget(counters, config, subtask_id).is_allowed()
}

/// Charge one invocation to the session and, when given, to the subtask.
///
/// A finished run's attempt record also counts its spells, remembers a
/// drafted follow-up and enters the dedup ledger.
pub fn increment_after_run(
    counters: &mut HealerCounters,
    subtask_id: Option<&str>,
    attempt: Option<HealingAttempt>,
) {
    counters.session_invocations = counters.session_invocations.saturating_add(1);
    if let Some(id) = subtask_id {
        let entry = counters
            .subtask_invocations
            .entry(id.to_string())
            .or_insert(0);
        *entry = entry.saturating_add(1);
    }

    let Some(attempt) = attempt else {
        return;
    };
    for spell in &attempt.spells_tried {
        let entry = counters.spells_attempted.entry(*spell).or_insert(0);
        *entry = entry.saturating_add(1);
    }
    if let Some(task_id) = attempt.task_id.as_deref() {
        if attempt
            .spells_succeeded
            .contains(&SpellId::MarkTaskBlockedWithFollowup)
        {
            counters
                .followup_keys
                .insert(followup_key(task_id, attempt.scenario));
        }
    }
    counters
        .healing_attempts
        .insert(attempt.key.clone(), attempt);
}
