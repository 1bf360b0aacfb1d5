//! Stuck detection for tasks and subtasks.
//!
//! Everything here is pure: callers pass the entities (and optionally the
//! clock) in, so the same functions serve the event-driven Healer and
//! periodic sweeps.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt::Write as _;
use std::sync::LazyLock;

use crate::config::HealerConfig;
use crate::model::{Subtask, SubtaskWithTaskId, Task, TaskStatus};

/// Longest normalized failure pattern kept, in bytes.
const MAX_PATTERN_LEN: usize = 200;

/// Subtask descriptions are cut to this many chars in summaries.
const SUMMARY_DESCRIPTION_CHARS: usize = 50;

/// Message lines that read like a failure report.
static FAILURE_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*(?:error|fatal|failed|failure)\b|\b(?:error|exception)\s*:|\b(?:failed|failing)\b")
        .unwrap()
});

/// Why an entity was flagged as stuck.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StuckReason {
    ConsecutiveFailures,
    TimeThresholdExceeded,
}

impl StuckReason {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ConsecutiveFailures => "consecutive_failures",
            Self::TimeThresholdExceeded => "time_threshold_exceeded",
        }
    }
}

impl std::fmt::Display for StuckReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Thresholds for stuck detection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StuckOptions {
    #[serde(default = "default_task_hours")]
    pub stuck_task_threshold_hours: f64,
    #[serde(default = "default_subtask_hours")]
    pub stuck_subtask_threshold_hours: f64,
    /// Also the minimum occurrences for a recurring failure pattern
    #[serde(default = "default_min_failures")]
    pub min_consecutive_failures: u32,
    #[serde(default = "default_true")]
    pub scan_trajectories: bool,
}

fn default_task_hours() -> f64 {
    4.0
}

fn default_subtask_hours() -> f64 {
    2.0
}

fn default_min_failures() -> u32 {
    3
}

fn default_true() -> bool {
    true
}

impl Default for StuckOptions {
    fn default() -> Self {
        Self {
            stuck_task_threshold_hours: default_task_hours(),
            stuck_subtask_threshold_hours: default_subtask_hours(),
            min_consecutive_failures: default_min_failures(),
            scan_trajectories: true,
        }
    }
}

impl StuckOptions {
    /// Options for a project, taking the subtask threshold from its healer config.
    #[must_use]
    pub fn for_config(config: &HealerConfig) -> Self {
        Self {
            stuck_subtask_threshold_hours: config.stuck_threshold_hours,
            ..Self::default()
        }
    }
}

/// Verdict for a single task or subtask.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StuckResult {
    pub stuck: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<StuckReason>,
    /// Exact elapsed hours, when a timestamp was available
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hours_stuck: Option<f64>,
}

impl StuckResult {
    fn not_stuck(hours: Option<f64>) -> Self {
        Self {
            stuck: false,
            reason: None,
            hours_stuck: hours,
        }
    }

    fn stuck(reason: StuckReason, hours: Option<f64>) -> Self {
        Self {
            stuck: true,
            reason: Some(reason),
            hours_stuck: hours,
        }
    }
}

/// Recorded agent session, reduced to what pattern mining reads.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Trajectory {
    pub session_id: String,
    #[serde(default)]
    pub steps: Vec<TrajectoryStep>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrajectoryStep {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observation: Option<Observation>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Observation {
    #[serde(default)]
    pub results: Vec<ObservationResult>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ObservationResult {
    /// Tool output; an `error` string field marks a failed call
    #[serde(default)]
    pub content: serde_json::Value,
}

/// A failure string that recurs across trajectory steps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailurePattern {
    pub pattern: String,
    pub occurrences: u32,
    /// Sessions the pattern was seen in, sorted and distinct
    pub session_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StuckTask {
    pub task: Task,
    pub result: StuckResult,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StuckSubtask {
    pub task_id: String,
    pub subtask: Subtask,
    pub result: StuckResult,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StuckStats {
    pub tasks_scanned: usize,
    pub subtasks_scanned: usize,
    pub trajectories_scanned: usize,
    pub stuck_task_count: usize,
    pub stuck_subtask_count: usize,
}

/// Aggregate result of a stuck sweep.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StuckDetection {
    pub stuck_tasks: Vec<StuckTask>,
    pub stuck_subtasks: Vec<StuckSubtask>,
    pub failure_patterns: Vec<FailurePattern>,
    pub stats: StuckStats,
}

impl StuckDetection {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stuck_tasks.is_empty() && self.stuck_subtasks.is_empty()
    }
}

#[allow(clippy::cast_precision_loss)]
fn hours_between(since: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
    (now - since).num_milliseconds() as f64 / 3_600_000.0
}

/// Check whether a task has sat in progress past the threshold.
#[must_use]
pub fn is_task_stuck_by_time(task: &Task, opts: &StuckOptions) -> StuckResult {
    is_task_stuck_by_time_at(task, opts, Utc::now())
}

/// [`is_task_stuck_by_time`] against an explicit clock.
#[must_use]
pub fn is_task_stuck_by_time_at(task: &Task, opts: &StuckOptions, now: DateTime<Utc>) -> StuckResult {
    if task.status != TaskStatus::InProgress {
        return StuckResult::not_stuck(None);
    }

    let hours = hours_between(task.updated_at, now);
    if hours >= opts.stuck_task_threshold_hours {
        StuckResult::stuck(StuckReason::TimeThresholdExceeded, Some(hours))
    } else {
        StuckResult::not_stuck(Some(hours))
    }
}

/// Check whether a subtask is stuck by failure count or elapsed time.
#[must_use]
pub fn is_subtask_stuck(subtask: &Subtask, opts: &StuckOptions) -> StuckResult {
    is_subtask_stuck_at(subtask, opts, Utc::now())
}

/// [`is_subtask_stuck`] against an explicit clock.
///
/// Failure count is checked before elapsed time, so a subtask that fails
/// fast is still flagged.
#[must_use]
pub fn is_subtask_stuck_at(
    subtask: &Subtask,
    opts: &StuckOptions,
    now: DateTime<Utc>,
) -> StuckResult {
    if subtask.status.is_terminal() {
        return StuckResult::not_stuck(None);
    }

    let hours = subtask.started_at.map(|started| hours_between(started, now));

    if subtask.failures() >= opts.min_consecutive_failures {
        return StuckResult::stuck(StuckReason::ConsecutiveFailures, hours);
    }

    match hours {
        Some(h) if h >= opts.stuck_subtask_threshold_hours => {
            StuckResult::stuck(StuckReason::TimeThresholdExceeded, hours)
        }
        _ => StuckResult::not_stuck(hours),
    }
}

/// Normalize an error message into a grouping key.
///
/// Digits are dropped so line numbers and timestamps do not split groups.
#[must_use]
pub fn normalize_error_pattern(error: &str) -> String {
    let stripped: String = error.chars().filter(|c| !c.is_ascii_digit()).collect();
    let mut normalized = stripped.split_whitespace().collect::<Vec<_>>().join(" ");

    if normalized.len() > MAX_PATTERN_LEN {
        let mut end = MAX_PATTERN_LEN;
        while !normalized.is_char_boundary(end) {
            end -= 1;
        }
        normalized.truncate(end);
    }
    normalized
}

fn step_candidates(step: &TrajectoryStep) -> Vec<&str> {
    let mut candidates = Vec::new();

    if let Some(observation) = &step.observation {
        candidates.extend(
            observation
                .results
                .iter()
                .filter_map(|r| r.content.get("error").and_then(serde_json::Value::as_str)),
        );
    }

    if let Some(message) = &step.message {
        candidates.extend(message.lines().filter(|line| FAILURE_LINE.is_match(line)));
    }

    candidates
}

/// Mine failure strings that recur at least `min_consecutive_failures` times.
///
/// Sorted by occurrences (most first), then by pattern.
#[must_use]
pub fn extract_failure_patterns(
    trajectories: &[Trajectory],
    opts: &StuckOptions,
) -> Vec<FailurePattern> {
    let mut groups: HashMap<String, (u32, BTreeSet<&str>)> = HashMap::new();

    for trajectory in trajectories {
        for step in &trajectory.steps {
            for candidate in step_candidates(step) {
                let key = normalize_error_pattern(candidate);
                if key.is_empty() {
                    continue;
                }
                let entry = groups.entry(key).or_default();
                entry.0 += 1;
                entry.1.insert(trajectory.session_id.as_str());
            }
        }
    }

    let mut patterns: Vec<FailurePattern> = groups
        .into_iter()
        .filter(|(_, (occurrences, _))| *occurrences >= opts.min_consecutive_failures)
        .map(|(pattern, (occurrences, sessions))| FailurePattern {
            pattern,
            occurrences,
            session_ids: sessions.into_iter().map(str::to_string).collect(),
        })
        .collect();

    patterns.sort_by(|a, b| {
        b.occurrences
            .cmp(&a.occurrences)
            .then_with(|| a.pattern.cmp(&b.pattern))
    });
    patterns
}

/// Pair every stuck task with its verdict.
#[must_use]
pub fn scan_tasks_for_stuck(
    tasks: &[Task],
    opts: &StuckOptions,
    now: DateTime<Utc>,
) -> Vec<StuckTask> {
    tasks
        .iter()
        .filter_map(|task| {
            let result = is_task_stuck_by_time_at(task, opts, now);
            result.stuck.then(|| StuckTask {
                task: task.clone(),
                result,
            })
        })
        .collect()
}

/// Pair every stuck subtask with its verdict and owning task id.
#[must_use]
pub fn scan_subtasks_for_stuck(
    subtasks: &[SubtaskWithTaskId],
    opts: &StuckOptions,
    now: DateTime<Utc>,
) -> Vec<StuckSubtask> {
    subtasks
        .iter()
        .filter_map(|entry| {
            let result = is_subtask_stuck_at(&entry.subtask, opts, now);
            result.stuck.then(|| StuckSubtask {
                task_id: entry.task_id.clone(),
                subtask: entry.subtask.clone(),
                result,
            })
        })
        .collect()
}

/// Run a full stuck sweep.
#[must_use]
pub fn detect_stuck(
    tasks: &[Task],
    subtasks: &[SubtaskWithTaskId],
    trajectories: &[Trajectory],
    opts: &StuckOptions,
) -> StuckDetection {
    detect_stuck_at(tasks, subtasks, trajectories, opts, Utc::now())
}

/// [`detect_stuck`] against an explicit clock.
#[must_use]
pub fn detect_stuck_at(
    tasks: &[Task],
    subtasks: &[SubtaskWithTaskId],
    trajectories: &[Trajectory],
    opts: &StuckOptions,
    now: DateTime<Utc>,
) -> StuckDetection {
    let stuck_tasks = scan_tasks_for_stuck(tasks, opts, now);
    let stuck_subtasks = scan_subtasks_for_stuck(subtasks, opts, now);

    let (failure_patterns, trajectories_scanned) = if opts.scan_trajectories {
        (extract_failure_patterns(trajectories, opts), trajectories.len())
    } else {
        (Vec::new(), 0)
    };

    let stats = StuckStats {
        tasks_scanned: tasks.len(),
        subtasks_scanned: subtasks.len(),
        trajectories_scanned,
        stuck_task_count: stuck_tasks.len(),
        stuck_subtask_count: stuck_subtasks.len(),
    };

    StuckDetection {
        stuck_tasks,
        stuck_subtasks,
        failure_patterns,
        stats,
    }
}

/// Cut `text` to `max` chars, marking the cut with an ellipsis.
pub(crate) fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

/// Human-readable report of a stuck sweep.
#[must_use]
pub fn summarize_stuck_detection(result: &StuckDetection) -> String {
    if result.is_empty() {
        return "No stuck items".to_string();
    }

    let mut out = String::new();
    let stats = &result.stats;
    let _ = write!(
        out,
        "Scanned {} tasks, {} subtasks, {} trajectories",
        stats.tasks_scanned, stats.subtasks_scanned, stats.trajectories_scanned
    );

    if !result.stuck_tasks.is_empty() {
        let _ = write!(out, "\n\nStuck tasks ({}):", result.stuck_tasks.len());
        for stuck in &result.stuck_tasks {
            let _ = write!(out, "\n  - {}: {}", stuck.task.id, stuck.task.title);
            if let Some(hours) = stuck.result.hours_stuck {
                let _ = write!(out, " ({hours:.1}h)");
            }
        }
    }

    if !result.stuck_subtasks.is_empty() {
        let _ = write!(out, "\n\nStuck subtasks ({}):", result.stuck_subtasks.len());
        for stuck in &result.stuck_subtasks {
            let desc = truncate_chars(&stuck.subtask.description, SUMMARY_DESCRIPTION_CHARS);
            let reason = stuck
                .result
                .reason
                .map_or("unknown", StuckReason::as_str);
            let _ = write!(
                out,
                "\n  - {} (task {}): {} ({}, {} failures)",
                stuck.subtask.id,
                stuck.task_id,
                desc,
                reason,
                stuck.subtask.failures()
            );
        }
    }

    if !result.failure_patterns.is_empty() {
        let _ = write!(
            out,
            "\n\nRecurring failures ({}):",
            result.failure_patterns.len()
        );
        for pattern in &result.failure_patterns {
            let _ = write!(
                out,
                "\n  - {}x in {} session(s): {}",
                pattern.occurrences,
                pattern.session_ids.len(),
                pattern.pattern
            );
        }
    }

    out
}
