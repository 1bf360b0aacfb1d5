//! The Healer façade.
//!
//! [`HealerService::maybe_run`] is the single entrypoint the orchestrator
//! calls after every event: classify, check budget and the dedup ledger,
//! plan, cast spells in order, charge the budget and report.

use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::budget::{
    build_healing_key, evaluate_budget, increment_after_run, HealerCounters, HealingAttempt,
};
use crate::classify::classify;
use crate::collaborators::{
    CodeInvoker, NoopTaskLedger, NoopWorkspace, TaskLedger, VerificationRunner, WorkspaceOps,
};
use crate::config::ProjectConfig;
use crate::error::{HealerError, Result};
use crate::events::{HealerEvent, HealerEventSink, OrchestratorEvent, TracingEventSink};
use crate::model::OrchestratorState;
use crate::patterns::build_heuristics;
use crate::spells::{
    plan_spells, BasicExecutor, FullExecutor, PlanOptions, SpellContext, SpellExecutor,
};
use crate::types::{HealerOutcome, SpellAttempt, SpellId, SpellResult};

/// Self-healing service bound to one executor and one event sink.
pub struct HealerService {
    executor: Box<dyn SpellExecutor>,
    sink: Arc<dyn HealerEventSink>,
}

impl HealerService {
    /// Service over any executor, logging events through `tracing`.
    pub fn new(executor: Box<dyn SpellExecutor>) -> Self {
        Self {
            executor,
            sink: Arc::new(TracingEventSink),
        }
    }

    /// Service without a code agent; `fix_*` spells are never planned.
    pub fn basic(workspace: Arc<dyn WorkspaceOps>, tasks: Arc<dyn TaskLedger>) -> Self {
        Self::new(Box::new(BasicExecutor::new(workspace, tasks)))
    }

    /// Service with a code agent and a verification runner.
    pub fn full(
        invoker: Arc<dyn CodeInvoker>,
        verifier: Arc<dyn VerificationRunner>,
        workspace: Arc<dyn WorkspaceOps>,
        tasks: Arc<dyn TaskLedger>,
    ) -> Self {
        let basic = BasicExecutor::new(workspace, tasks);
        Self::new(Box::new(FullExecutor::new(basic, invoker, verifier)))
    }

    /// Service whose collaborators do nothing.
    pub fn noop() -> Self {
        Self::basic(Arc::new(NoopWorkspace), Arc::new(NoopTaskLedger))
    }

    /// Replace the event sink.
    #[must_use]
    pub fn with_event_sink(mut self, sink: Arc<dyn HealerEventSink>) -> Self {
        self.sink = sink;
        self
    }

    #[must_use]
    pub fn supports_llm(&self) -> bool {
        self.executor.supports_llm()
    }

    /// Heal the failure behind `event`, if it is one the Healer handles.
    ///
    /// Returns `Ok(None)` when no scenario matches, the budget is spent, or
    /// the same failure was already healed this session; counters are
    /// untouched in all three cases. Otherwise every planned spell is tried
    /// until one succeeds and the budget is charged once, whatever the
    /// outcome. Configuration errors are returned before any budget is
    /// consumed.
    pub async fn maybe_run(
        &self,
        event: &OrchestratorEvent,
        state: &OrchestratorState,
        project: &ProjectConfig,
        counters: &mut HealerCounters,
    ) -> Result<Option<HealerOutcome>> {
        let config = &project.healer;

        let Some(matched) = classify(event, config) else {
            debug!(event = event.kind(), "No healer scenario for event");
            return Ok(None);
        };

        config.validate()?;
        let mut spells = plan_spells(
            matched,
            config,
            PlanOptions::for_executor(self.executor.supports_llm(), config),
        )?;

        let subtask_id = event.subtask_id();
        let decision = evaluate_budget(counters, config, subtask_id);
        if !decision.is_allowed() {
            info!(
                scenario = %matched.scenario,
                reason = %decision.reason(),
                "Healer budget exhausted, skipping"
            );
            return Ok(None);
        }

        let task_id = event.task_id().or_else(|| state.task_id());
        let key = build_healing_key(
            matched,
            task_id,
            subtask_id,
            event.failure_output().unwrap_or_default(),
        );
        if counters.has_attempt(&key.key) {
            info!(
                scenario = %matched.scenario,
                key = %key.key,
                "Failure already healed this session, skipping"
            );
            return Ok(None);
        }

        if let Some(task_id) = task_id {
            if counters.has_followup(task_id, matched.scenario) {
                debug!(task_id, scenario = %matched.scenario, "Follow-up already drafted");
                spells.retain(|spell| *spell != SpellId::MarkTaskBlockedWithFollowup);
            }
        }

        let mut heuristics = build_heuristics(
            matched.scenario,
            event.failure_output(),
            event.failure_count(),
        );
        heuristics.repeated = matched.repeated;
        heuristics.previous_attempts = counters.previous_attempts(&key);
        let invocation_id = Uuid::new_v4();

        self.sink.emit(HealerEvent::HealerStart {
            invocation_id,
            scenario: matched.scenario,
            spells: spells.clone(),
            timestamp: chrono::Utc::now(),
        });

        let ctx = SpellContext {
            scenario: matched.scenario,
            heuristics: &heuristics,
            state,
            task_id,
            project_root: &project.root_dir,
            subtask: event.subtask(),
            failure_output: event.failure_output(),
        };

        let mut attempts = Vec::with_capacity(spells.len());
        for spell in spells {
            self.sink.emit(HealerEvent::HealerSpellStart {
                invocation_id,
                spell,
                timestamp: chrono::Utc::now(),
            });

            let result = match self.executor.cast(spell, &ctx).await {
                Ok(result) => result,
                Err(e) => SpellResult::from_error(spell, &e),
            };
            let succeeded = result.success;

            self.sink.emit(HealerEvent::HealerSpellComplete {
                invocation_id,
                spell,
                result: result.clone(),
                timestamp: chrono::Utc::now(),
            });
            attempts.push(SpellAttempt { spell, result });

            if succeeded {
                break;
            }
        }

        let outcome = HealerOutcome::from_attempts(matched.scenario, attempts);
        increment_after_run(
            counters,
            subtask_id,
            Some(HealingAttempt::new(key, &outcome)),
        );

        self.sink.emit(HealerEvent::HealerComplete {
            invocation_id,
            outcome: outcome.clone(),
            timestamp: chrono::Utc::now(),
        });

        Ok(Some(outcome))
    }

    /// Like [`maybe_run`](Self::maybe_run), but `None` becomes [`HealerError::NoScenario`].
    pub async fn run(
        &self,
        event: &OrchestratorEvent,
        state: &OrchestratorState,
        project: &ProjectConfig,
        counters: &mut HealerCounters,
    ) -> Result<HealerOutcome> {
        self.maybe_run(event, state, project, counters)
            .await?
            .ok_or_else(|| HealerError::NoScenario(event.kind().to_string()))
    }
}

impl Default for HealerService {
    fn default() -> Self {
        Self::noop()
    }
}

impl std::fmt::Debug for HealerService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealerService")
            .field("supports_llm", &self.executor.supports_llm())
            .finish_non_exhaustive()
    }
}
