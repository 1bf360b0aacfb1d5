//! HealerService end-to-end tests
//!
//! Drives `maybe_run` / `run` with fake collaborators and checks budget
//! accounting, spell ordering, verification honesty and emitted events.

use async_trait::async_trait;
use chrono::Utc;
use std::path::Path;
use std::sync::{Arc, Mutex};

use healer::budget::{increment_after_run, HealerCounters};
use healer::collaborators::{
    CodeInvoker, InvokeOptions, InvokeResult, NoopTaskLedger, NoopWorkspace, RecoverySubtask,
    TaskLedger, VerificationReport, VerificationRunner, WorkspaceOps,
};
use healer::config::{HealerConfig, ProjectConfig};
use healer::events::{HealerEvent, HealerEventSink, InitScriptFailureType, InitScriptResult, OrchestratorEvent};
use healer::model::{OrchestratorPhase, OrchestratorState, Subtask, Task, TaskStatus};
use healer::stuck::StuckReason;
use healer::types::{OutcomeStatus, Scenario, SpellId};
use healer::{HealerError, HealerService};

// ============================================================================
// Fakes
// ============================================================================

struct FakeInvoker {
    files: Vec<String>,
    fail: bool,
    calls: Mutex<Vec<RecoverySubtask>>,
}

impl FakeInvoker {
    fn editing(files: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            files: files.iter().map(|f| (*f).to_string()).collect(),
            fail: false,
            calls: Mutex::new(Vec::new()),
        })
    }

    fn broken() -> Arc<Self> {
        Arc::new(Self {
            files: Vec::new(),
            fail: true,
            calls: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl CodeInvoker for FakeInvoker {
    async fn invoke(
        &self,
        subtask: &RecoverySubtask,
        _options: &InvokeOptions,
    ) -> anyhow::Result<InvokeResult> {
        self.calls.lock().unwrap().push(subtask.clone());
        if self.fail {
            anyhow::bail!("agent crashed");
        }
        Ok(InvokeResult {
            success: true,
            subtask_id: subtask.id.clone(),
            files_modified: self.files.clone(),
            turns: 3,
        })
    }
}

struct FakeVerifier {
    passes: bool,
}

#[async_trait]
impl VerificationRunner for FakeVerifier {
    async fn verify(&self, _project_root: &Path) -> anyhow::Result<VerificationReport> {
        Ok(VerificationReport {
            success: self.passes,
            output: if self.passes {
                "ok".to_string()
            } else {
                "error TS2322: still broken".to_string()
            },
        })
    }
}

struct BrokenWorkspace;

#[async_trait]
impl WorkspaceOps for BrokenWorkspace {
    async fn rewind_uncommitted(&self, _project_root: &Path) -> anyhow::Result<Vec<String>> {
        anyhow::bail!("git not available")
    }
}

struct DirtyWorkspace;

#[async_trait]
impl WorkspaceOps for DirtyWorkspace {
    async fn rewind_uncommitted(&self, _project_root: &Path) -> anyhow::Result<Vec<String>> {
        Ok(vec!["src/index.ts".to_string()])
    }
}

#[derive(Default)]
struct RecordingLedger {
    notes: Mutex<Vec<String>>,
    blocked: Mutex<Vec<String>>,
    fail: bool,
}

#[async_trait]
impl TaskLedger for RecordingLedger {
    async fn append_notes(&self, _task_id: Option<&str>, notes: &str) -> anyhow::Result<()> {
        if self.fail {
            anyhow::bail!("ledger is read-only");
        }
        self.notes.lock().unwrap().push(notes.to_string());
        Ok(())
    }

    async fn mark_blocked(&self, task_id: &str, _reason: &str, _followup: &str) -> anyhow::Result<()> {
        if self.fail {
            anyhow::bail!("ledger is read-only");
        }
        self.blocked.lock().unwrap().push(task_id.to_string());
        Ok(())
    }
}

fn recording_sink() -> (Arc<dyn HealerEventSink>, Arc<Mutex<Vec<HealerEvent>>>) {
    let events = Arc::new(Mutex::new(Vec::new()));
    let captured = Arc::clone(&events);
    let sink: Arc<dyn HealerEventSink> =
        Arc::new(move |event: HealerEvent| captured.lock().unwrap().push(event));
    (sink, events)
}

// ============================================================================
// Fixtures
// ============================================================================

fn state() -> OrchestratorState {
    OrchestratorState {
        session_id: "session-1".to_string(),
        phase: OrchestratorPhase::ExecutingSubtask,
        task: Some(Task {
            id: "task-1".to_string(),
            title: "Build the parser".to_string(),
            description: None,
            status: TaskStatus::InProgress,
            updated_at: Utc::now(),
        }),
        subtasks: Vec::new(),
    }
}

fn typecheck_failure() -> OrchestratorEvent {
    OrchestratorEvent::InitScriptComplete {
        result: InitScriptResult {
            ran: true,
            success: false,
            exit_code: Some(1),
            output: Some("src/a.ts(1,1): error TS2345: Argument of type 'string'".to_string()),
            error: None,
            failure_type: Some(InitScriptFailureType::TypecheckFailed),
        },
    }
}

fn verification_failure() -> OrchestratorEvent {
    OrchestratorEvent::VerificationComplete {
        command: "bun test".to_string(),
        passed: false,
        output: "3 tests failed".to_string(),
    }
}

fn subtask_failure(id: &str, failures: u32) -> OrchestratorEvent {
    let mut subtask = Subtask::new(id, "Write the tokenizer");
    subtask.failure_count = Some(failures);
    OrchestratorEvent::SubtaskFailed {
        subtask,
        error: "TypeError: tokens is undefined".to_string(),
    }
}

fn verification_failure_with(output: &str) -> OrchestratorEvent {
    OrchestratorEvent::VerificationComplete {
        command: "bun test".to_string(),
        passed: false,
        output: output.to_string(),
    }
}

fn stuck_subtask(id: &str, task_id: &str) -> OrchestratorEvent {
    let mut subtask = Subtask::new(id, "Wire the cache");
    subtask.failure_count = Some(1);
    OrchestratorEvent::SubtaskStuck {
        subtask,
        task_id: task_id.to_string(),
        reason: StuckReason::TimeThresholdExceeded,
        hours_stuck: Some(3.0),
    }
}

fn non_healable_events() -> Vec<OrchestratorEvent> {
    vec![
        OrchestratorEvent::SessionStart {
            session_id: "session-1".to_string(),
            timestamp: Utc::now(),
        },
        OrchestratorEvent::SubtaskStart {
            subtask: Subtask::new("sub-1", "Write the tokenizer"),
        },
        OrchestratorEvent::SubtaskComplete {
            subtask: Subtask::new("sub-1", "Write the tokenizer"),
        },
        OrchestratorEvent::VerificationStart {
            command: "bun test".to_string(),
        },
        OrchestratorEvent::PhaseTransition {
            from: OrchestratorPhase::Verifying,
            to: OrchestratorPhase::Committing,
        },
        OrchestratorEvent::SessionComplete {
            success: false,
            summary: "gave up".to_string(),
        },
    ]
}

fn full_service(invoker: Arc<FakeInvoker>, verifier_passes: bool) -> HealerService {
    HealerService::full(
        invoker,
        Arc::new(FakeVerifier {
            passes: verifier_passes,
        }),
        Arc::new(NoopWorkspace),
        Arc::new(NoopTaskLedger),
    )
}

// ============================================================================
// Gating
// ============================================================================

#[tokio::test]
async fn test_disabled_healer_returns_none_for_every_event() {
    let service = HealerService::noop();
    let project = ProjectConfig {
        healer: HealerConfig {
            enabled: false,
            ..Default::default()
        },
        ..Default::default()
    };
    let mut counters = HealerCounters::new();

    let mut events = non_healable_events();
    events.extend([typecheck_failure(), verification_failure(), subtask_failure("sub-1", 1)]);

    for event in &events {
        let outcome = service
            .maybe_run(event, &state(), &project, &mut counters)
            .await
            .unwrap();
        assert!(outcome.is_none(), "{}", event.kind());
    }
    assert_eq!(counters, HealerCounters::new());
}

#[tokio::test]
async fn test_non_healable_events_return_none() {
    let service = HealerService::noop();
    let project = ProjectConfig::default();
    let mut counters = HealerCounters::new();

    for event in &non_healable_events() {
        let outcome = service
            .maybe_run(event, &state(), &project, &mut counters)
            .await
            .unwrap();
        assert!(outcome.is_none(), "{}", event.kind());
    }
    assert_eq!(counters.session_invocations(), 0);
}

#[tokio::test]
async fn test_session_budget_exhausted_leaves_counters_unchanged() {
    let (sink, events) = recording_sink();
    let service = HealerService::noop().with_event_sink(sink);
    let project = ProjectConfig::default();

    let mut counters = HealerCounters::new();
    for _ in 0..project.healer.max_invocations_per_session {
        increment_after_run(&mut counters, None, None);
    }
    let before = counters.clone();

    let outcome = service
        .maybe_run(&verification_failure(), &state(), &project, &mut counters)
        .await
        .unwrap();

    assert!(outcome.is_none());
    assert_eq!(counters, before);
    assert!(events.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_subtask_budget_exhausted_returns_none() {
    let service = HealerService::noop();
    let project = ProjectConfig::default();
    let mut counters = HealerCounters::new();
    increment_after_run(&mut counters, Some("sub-1"), None);

    let outcome = service
        .maybe_run(&subtask_failure("sub-1", 1), &state(), &project, &mut counters)
        .await
        .unwrap();
    assert!(outcome.is_none());
    assert_eq!(counters.subtask_invocations("sub-1"), 1);

    let other = service
        .maybe_run(&subtask_failure("sub-2", 1), &state(), &project, &mut counters)
        .await
        .unwrap();
    assert!(other.is_some());
    assert_eq!(counters.subtask_invocations("sub-2"), 1);
}

// ============================================================================
// Budget accounting
// ============================================================================

#[tokio::test]
async fn test_session_counter_increments_once_on_success() {
    let service = full_service(FakeInvoker::editing(&["src/a.ts"]), true);
    let mut counters = HealerCounters::new();

    let outcome = service
        .maybe_run(&typecheck_failure(), &state(), &ProjectConfig::default(), &mut counters)
        .await
        .unwrap()
        .unwrap();

    assert!(outcome.is_fixed());
    assert_eq!(counters.session_invocations(), 1);
}

#[tokio::test]
async fn test_session_counter_increments_once_when_every_spell_fails() {
    let ledger = Arc::new(RecordingLedger {
        fail: true,
        ..Default::default()
    });
    let service = HealerService::basic(Arc::new(BrokenWorkspace), ledger);
    let mut counters = HealerCounters::new();

    let outcome = service
        .maybe_run(&subtask_failure("sub-1", 1), &state(), &ProjectConfig::default(), &mut counters)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(outcome.status, OutcomeStatus::Unresolved);
    assert!(outcome.spells_succeeded.is_empty());
    assert_eq!(
        outcome.spells_tried,
        vec![SpellId::RewindUncommittedChanges, SpellId::UpdateProgressWithGuidance]
    );
    assert_eq!(counters.session_invocations(), 1);
    assert_eq!(counters.subtask_invocations("sub-1"), 1);
}

// ============================================================================
// Spell contracts
// ============================================================================

#[tokio::test]
async fn test_typecheck_fix_verified() {
    let invoker = FakeInvoker::editing(&["src/a.ts"]);
    let service = full_service(Arc::clone(&invoker), true);
    let mut counters = HealerCounters::new();

    let outcome = service
        .maybe_run(&typecheck_failure(), &state(), &ProjectConfig::default(), &mut counters)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(outcome.scenario, Scenario::InitScriptTypecheckFailure);
    assert!(outcome.spells_succeeded.contains(&SpellId::FixTypecheckErrors));
    // First success ends the invocation
    assert_eq!(outcome.spells_tried, vec![SpellId::FixTypecheckErrors]);
    assert_eq!(outcome.verification_passed, Some(true));

    let calls = invoker.calls.lock().unwrap();
    assert_eq!(calls.len(), 1);
    assert!(calls[0].guidance.contains("TypeScript compilation error"));
}

#[tokio::test]
async fn test_fix_that_still_fails_verification_is_not_a_success() {
    let service = full_service(FakeInvoker::editing(&["src/a.ts"]), false);
    let mut counters = HealerCounters::new();

    let outcome = service
        .maybe_run(&typecheck_failure(), &state(), &ProjectConfig::default(), &mut counters)
        .await
        .unwrap()
        .unwrap();

    assert!(outcome.spells_tried.contains(&SpellId::FixTypecheckErrors));
    assert!(!outcome.spells_succeeded.contains(&SpellId::FixTypecheckErrors));

    let fix = outcome.result_for(SpellId::FixTypecheckErrors).unwrap();
    assert!(!fix.success);
    assert!(fix.changes_applied);
    assert!(fix.summary.contains("still fail"));
    assert_eq!(outcome.verification_passed, Some(false));

    // Guidance is written next
    assert_eq!(outcome.spells_tried[1], SpellId::UpdateProgressWithGuidance);
}

#[tokio::test]
async fn test_basic_service_never_attempts_fix_spells() {
    let ledger = Arc::new(RecordingLedger::default());
    let service = HealerService::basic(Arc::new(NoopWorkspace), ledger.clone());
    assert!(!service.supports_llm());
    let mut counters = HealerCounters::new();

    let outcome = service
        .maybe_run(&typecheck_failure(), &state(), &ProjectConfig::default(), &mut counters)
        .await
        .unwrap()
        .unwrap();

    assert!(outcome.spells_tried.iter().all(|s| !s.requires_llm()));
    assert_eq!(outcome.spells_tried, vec![SpellId::UpdateProgressWithGuidance]);
    assert_eq!(ledger.notes.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_collaborator_error_does_not_abort_later_spells() {
    let service = HealerService::full(
        FakeInvoker::broken(),
        Arc::new(FakeVerifier { passes: true }),
        Arc::new(NoopWorkspace),
        Arc::new(RecordingLedger::default()),
    );
    let mut counters = HealerCounters::new();

    let outcome = service
        .maybe_run(&typecheck_failure(), &state(), &ProjectConfig::default(), &mut counters)
        .await
        .unwrap()
        .unwrap();

    let fix = outcome.result_for(SpellId::FixTypecheckErrors).unwrap();
    assert!(!fix.success);
    assert!(fix.summary.contains("agent crashed"));
    assert!(outcome.spells_succeeded.contains(&SpellId::UpdateProgressWithGuidance));
}

#[tokio::test]
async fn test_verification_failure_rewinds_first() {
    let service = HealerService::basic(Arc::new(DirtyWorkspace), Arc::new(NoopTaskLedger));
    let mut counters = HealerCounters::new();

    let outcome = service
        .maybe_run(&verification_failure(), &state(), &ProjectConfig::default(), &mut counters)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(outcome.spells_succeeded, vec![SpellId::RewindUncommittedChanges]);
    let rewind = outcome.result_for(SpellId::RewindUncommittedChanges).unwrap();
    assert_eq!(rewind.files_modified, Some(vec!["src/index.ts".to_string()]));
}

#[tokio::test]
async fn test_clean_tree_rewind_still_succeeds() {
    let service = HealerService::noop();
    let mut counters = HealerCounters::new();

    let outcome = service
        .maybe_run(&verification_failure(), &state(), &ProjectConfig::default(), &mut counters)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(outcome.spells_tried, vec![SpellId::RewindUncommittedChanges]);
    assert_eq!(outcome.spells_succeeded, vec![SpellId::RewindUncommittedChanges]);
    let rewind = outcome.result_for(SpellId::RewindUncommittedChanges).unwrap();
    assert!(!rewind.changes_applied);
}

#[tokio::test]
async fn test_stuck_subtask_blocks_its_own_task() {
    let ledger = Arc::new(RecordingLedger::default());
    let service = HealerService::basic(Arc::new(NoopWorkspace), ledger.clone());
    let mut project = ProjectConfig::default();
    project.healer.scenarios.on_stuck_subtask = true;
    project.healer.spells.forbidden = vec!["update_progress_with_guidance".to_string()];

    // Active task is task-1; the sweep found a subtask of task-9
    let mut counters = HealerCounters::new();
    let outcome = service
        .maybe_run(&stuck_subtask("sub-9", "task-9"), &state(), &project, &mut counters)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(outcome.spells_succeeded, vec![SpellId::MarkTaskBlockedWithFollowup]);

    // No active task at all
    let mut counters = HealerCounters::new();
    let idle = OrchestratorState {
        task: None,
        ..state()
    };
    let outcome = service
        .maybe_run(&stuck_subtask("sub-10", "task-10"), &idle, &project, &mut counters)
        .await
        .unwrap()
        .unwrap();
    assert!(outcome.is_fixed());

    assert_eq!(
        *ledger.blocked.lock().unwrap(),
        vec!["task-9".to_string(), "task-10".to_string()]
    );
}

#[tokio::test]
async fn test_repeated_subtask_failure_blocks_task_first() {
    let ledger = Arc::new(RecordingLedger::default());
    let service = HealerService::basic(Arc::new(DirtyWorkspace), ledger.clone());
    let mut counters = HealerCounters::new();

    let outcome = service
        .maybe_run(&subtask_failure("sub-1", 3), &state(), &ProjectConfig::default(), &mut counters)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(outcome.spells_tried, vec![SpellId::MarkTaskBlockedWithFollowup]);
    assert_eq!(*ledger.blocked.lock().unwrap(), vec!["task-1".to_string()]);
}

// ============================================================================
// Dedup
// ============================================================================

#[tokio::test]
async fn test_identical_failure_is_healed_once_per_session() {
    let ledger = Arc::new(RecordingLedger::default());
    let service = HealerService::basic(Arc::new(BrokenWorkspace), ledger.clone());
    let project = ProjectConfig::default();
    let mut counters = HealerCounters::new();

    let first = service
        .maybe_run(&verification_failure(), &state(), &project, &mut counters)
        .await
        .unwrap();
    assert!(first.is_some());

    let before = counters.clone();
    let again = service
        .maybe_run(&verification_failure(), &state(), &project, &mut counters)
        .await
        .unwrap();
    assert!(again.is_none());
    assert_eq!(counters, before);
    assert_eq!(ledger.notes.lock().unwrap().len(), 1);

    // A different failure is still healed
    let other = service
        .maybe_run(
            &verification_failure_with("error TS2304: Cannot find name 'z'"),
            &state(),
            &project,
            &mut counters,
        )
        .await
        .unwrap();
    assert!(other.is_some());
    assert_eq!(counters.session_invocations(), 2);
    assert_eq!(counters.spell_attempts(SpellId::RewindUncommittedChanges), 2);
    assert_eq!(ledger.notes.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn test_followup_is_drafted_once_per_task_and_scenario() {
    let ledger = Arc::new(RecordingLedger::default());
    let service = HealerService::basic(Arc::new(NoopWorkspace), ledger.clone());
    let project = ProjectConfig::default();
    let mut counters = HealerCounters::new();

    let first = service
        .maybe_run(&subtask_failure("sub-1", 3), &state(), &project, &mut counters)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.spells_succeeded, vec![SpellId::MarkTaskBlockedWithFollowup]);
    assert!(counters.has_followup("task-1", Scenario::SubtaskFailed));

    // Another subtask of the same task fails repeatedly
    let second = service
        .maybe_run(&subtask_failure("sub-2", 3), &state(), &project, &mut counters)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(second.spells_tried, vec![SpellId::UpdateProgressWithGuidance]);
    assert_eq!(*ledger.blocked.lock().unwrap(), vec!["task-1".to_string()]);
}

#[tokio::test]
async fn test_repeated_failure_escalates_despite_same_error() {
    let ledger = Arc::new(RecordingLedger::default());
    let service = HealerService::basic(Arc::new(NoopWorkspace), ledger.clone());
    let mut project = ProjectConfig::default();
    project.healer.max_invocations_per_subtask = 5;
    let mut counters = HealerCounters::new();

    let first = service
        .maybe_run(&subtask_failure("sub-1", 1), &state(), &project, &mut counters)
        .await
        .unwrap();
    assert!(first.is_some());

    let second = service
        .maybe_run(&subtask_failure("sub-1", 2), &state(), &project, &mut counters)
        .await
        .unwrap();
    assert!(second.is_none());

    let third = service
        .maybe_run(&subtask_failure("sub-1", 3), &state(), &project, &mut counters)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(third.spells_tried, vec![SpellId::MarkTaskBlockedWithFollowup]);
    assert_eq!(counters.subtask_invocations("sub-1"), 2);
}

// ============================================================================
// Errors
// ============================================================================

#[tokio::test]
async fn test_unknown_spell_is_an_error_and_consumes_no_budget() {
    let service = HealerService::noop();
    let mut project = ProjectConfig::default();
    project.healer.spells.allowed = vec!["summon_dragon".to_string()];
    let mut counters = HealerCounters::new();

    let err = service
        .maybe_run(&verification_failure(), &state(), &project, &mut counters)
        .await
        .unwrap_err();

    assert!(matches!(err, HealerError::UnknownSpell(ref name) if name == "summon_dragon"));
    assert_eq!(counters, HealerCounters::new());
}

#[tokio::test]
async fn test_run_requires_a_scenario() {
    let service = HealerService::noop();
    let mut counters = HealerCounters::new();

    let err = service
        .run(
            &OrchestratorEvent::VerificationStart {
                command: "bun test".to_string(),
            },
            &state(),
            &ProjectConfig::default(),
            &mut counters,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, HealerError::NoScenario(ref kind) if kind == "verification_start"));

    let outcome = service
        .run(&verification_failure(), &state(), &ProjectConfig::default(), &mut counters)
        .await
        .unwrap();
    assert_eq!(outcome.scenario, Scenario::VerificationFailed);
}

// ============================================================================
// Events
// ============================================================================

#[tokio::test]
async fn test_events_bracket_each_invocation() {
    let (sink, events) = recording_sink();
    let service = full_service(FakeInvoker::editing(&["src/a.ts"]), false).with_event_sink(sink);
    let mut counters = HealerCounters::new();

    let outcome = service
        .maybe_run(&typecheck_failure(), &state(), &ProjectConfig::default(), &mut counters)
        .await
        .unwrap()
        .unwrap();

    let events = events.lock().unwrap();
    let kinds: Vec<&str> = events.iter().map(HealerEvent::kind).collect();
    assert_eq!(kinds.first(), Some(&"healer_start"));
    assert_eq!(kinds.last(), Some(&"healer_complete"));
    assert_eq!(kinds.iter().filter(|k| **k == "healer_start").count(), 1);
    assert_eq!(
        kinds.iter().filter(|k| **k == "healer_spell_complete").count(),
        outcome.spells_tried.len()
    );

    let id = events[0].invocation_id();
    assert!(events.iter().all(|e| e.invocation_id() == id));
}

#[tokio::test]
async fn test_no_events_without_a_match() {
    let (sink, events) = recording_sink();
    let service = HealerService::noop().with_event_sink(sink);
    let mut counters = HealerCounters::new();

    for event in &non_healable_events() {
        service
            .maybe_run(event, &state(), &ProjectConfig::default(), &mut counters)
            .await
            .unwrap();
    }
    assert!(events.lock().unwrap().is_empty());
}
