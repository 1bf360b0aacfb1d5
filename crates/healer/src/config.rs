//! Project and healer configuration.
//!
//! Mirrors the `healer` section of the project config file. Keys are
//! camelCase on disk; every field has a default so partial configs load.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{HealerError, Result};
use crate::types::SpellId;

fn default_true() -> bool {
    true
}

fn default_max_session() -> u32 {
    2
}

fn default_max_subtask() -> u32 {
    1
}

fn default_stuck_hours() -> f64 {
    2.0
}

fn default_repeated_threshold() -> u32 {
    3
}

fn default_root() -> PathBuf {
    PathBuf::from(".")
}

/// Top-level project configuration handed to the Healer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectConfig {
    /// Working tree the verifier and workspace collaborators operate on
    #[serde(default = "default_root")]
    pub root_dir: PathBuf,
    /// Healer section
    #[serde(default)]
    pub healer: HealerConfig,
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            root_dir: default_root(),
            healer: HealerConfig::default(),
        }
    }
}

impl ProjectConfig {
    /// Parse a project config from JSON.
    pub fn from_json_str(raw: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(raw)?;
        config.healer.validate()?;
        Ok(config)
    }

    /// Load a project config from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }
}

/// Healer mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum HealerMode {
    #[default]
    Conservative,
    Aggressive,
}

/// Scenario toggles. `on_init_failure` covers every init-script scenario.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealerScenarioConfig {
    #[serde(default = "default_true")]
    pub on_init_failure: bool,
    #[serde(default = "default_true")]
    pub on_verification_failure: bool,
    #[serde(default = "default_true")]
    pub on_subtask_failure: bool,
    #[serde(default = "default_true")]
    pub on_runtime_error: bool,
    #[serde(default)]
    pub on_stuck_subtask: bool,
}

impl Default for HealerScenarioConfig {
    fn default() -> Self {
        Self {
            on_init_failure: true,
            on_verification_failure: true,
            on_subtask_failure: true,
            on_runtime_error: true,
            on_stuck_subtask: false,
        }
    }
}

/// Spell allow/deny lists, by spell name.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HealerSpellsConfig {
    /// Allowed spells (empty = all allowed)
    #[serde(default)]
    pub allowed: Vec<String>,
    /// Forbidden spells
    #[serde(default)]
    pub forbidden: Vec<String>,
}

impl HealerSpellsConfig {
    /// Resolve the allow list into spell ids.
    pub fn allowed_ids(&self) -> Result<Vec<SpellId>> {
        parse_spell_names(&self.allowed)
    }

    /// Resolve the deny list into spell ids.
    pub fn forbidden_ids(&self) -> Result<Vec<SpellId>> {
        parse_spell_names(&self.forbidden)
    }
}

fn parse_spell_names(names: &[String]) -> Result<Vec<SpellId>> {
    names.iter().map(|name| name.parse::<SpellId>()).collect()
}

/// Healer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub scenarios: HealerScenarioConfig,
    #[serde(default)]
    pub spells: HealerSpellsConfig,
    #[serde(default = "default_max_session")]
    pub max_invocations_per_session: u32,
    #[serde(default = "default_max_subtask")]
    pub max_invocations_per_subtask: u32,
    #[serde(default)]
    pub mode: HealerMode,
    /// Hours without progress before a subtask counts as stuck
    #[serde(default = "default_stuck_hours")]
    pub stuck_threshold_hours: f64,
    /// Failure count at which a failed subtask is treated as repeated
    #[serde(default = "default_repeated_threshold")]
    pub repeated_failure_threshold: u32,
    /// Upper bound on spells attempted in one invocation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_spells_per_invocation: Option<usize>,
}

impl Default for HealerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            scenarios: HealerScenarioConfig::default(),
            spells: HealerSpellsConfig::default(),
            max_invocations_per_session: default_max_session(),
            max_invocations_per_subtask: default_max_subtask(),
            mode: HealerMode::default(),
            stuck_threshold_hours: default_stuck_hours(),
            repeated_failure_threshold: default_repeated_threshold(),
            max_spells_per_invocation: None,
        }
    }
}

impl HealerConfig {
    /// Reject configurations the Healer cannot act on.
    pub fn validate(&self) -> Result<()> {
        if !self.stuck_threshold_hours.is_finite() || self.stuck_threshold_hours <= 0.0 {
            return Err(HealerError::InvalidConfig(format!(
                "stuckThresholdHours must be a positive number, got {}",
                self.stuck_threshold_hours
            )));
        }
        if self.repeated_failure_threshold == 0 {
            return Err(HealerError::InvalidConfig(
                "repeatedFailureThreshold must be at least 1".to_string(),
            ));
        }
        if self.max_spells_per_invocation == Some(0) {
            return Err(HealerError::InvalidConfig(
                "maxSpellsPerInvocation must be at least 1 when set".to_string(),
            ));
        }
        self.spells.allowed_ids()?;
        self.spells.forbidden_ids()?;
        Ok(())
    }
}
