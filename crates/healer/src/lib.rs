//! Self-healing for autonomous coding-agent sessions.
//!
//! The Healer watches orchestrator events, decides whether a failure is worth
//! intervening on, and casts an ordered list of recovery spells under a
//! per-session and per-subtask budget. It never reports a fix while
//! verification still fails.
//!
//! Stuck detection and error pattern detection are also exposed as plain
//! functions for periodic sweeps outside the event loop.

pub mod budget;
pub mod classify;
pub mod collaborators;
pub mod config;
pub mod error;
pub mod events;
pub mod model;
pub mod patterns;
pub mod service;
pub mod spells;
pub mod stuck;
pub mod sweep;
pub mod types;

pub use budget::{
    build_healing_key, check_budget, evaluate_budget, hash_error, increment_after_run,
    BudgetDecision, HealerCounters, HealingAttempt, HealingKey,
};
pub use classify::{classify, is_scenario_enabled, ScenarioMatch};
pub use config::{HealerConfig, HealerMode, ProjectConfig};
pub use error::{HealerError, Result};
pub use events::{HealerEvent, HealerEventSink, OrchestratorEvent};
pub use patterns::{build_heuristics, detect_error_patterns, render_guidance};
pub use service::HealerService;
pub use spells::{plan_spells, scenario_spells, PlanOptions};
pub use stuck::{
    detect_stuck, extract_failure_patterns, is_subtask_stuck, is_task_stuck_by_time,
    scan_subtasks_for_stuck, scan_tasks_for_stuck, summarize_stuck_detection, StuckDetection,
    StuckOptions, StuckReason, StuckResult,
};
pub use types::{HealerOutcome, Heuristics, OutcomeStatus, Scenario, SpellId, SpellResult};
