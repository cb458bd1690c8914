/// Sequential workflow runner
///
/// Interprets a definition's steps in order. Conditions gate the run, actions
/// go through the registry and the retry executor, and every step leaves one
/// entry in the trace. Expected failures end up in the `RunResult`; only a
/// malformed definition is returned as an error.

use crate::error::{EngineError, EngineResult};
use crate::runtime::actions::ActionRegistry;
use crate::runtime::condition::ConditionEvaluator;
use crate::runtime::retry::{execute_with_retry, RetryPolicy};
use crate::workflow::types::{
    RunOutcome, RunResult, Step, StepOutcome, StepResult, TriggerEvent, WorkflowDefinition,
};
use chrono::Utc;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

/// Mutable state of one run
struct RunContext<'a> {
    workflow_id: &'a str,
    trigger: &'a TriggerEvent,
    trace: Vec<StepResult>,
    last_output: Value,
}

impl RunContext<'_> {
    /// The document conditions are evaluated against
    fn document(&self) -> Value {
        json!({
            "workflow_id": self.workflow_id,
            "trigger": self.trigger,
            "steps": self.trace,
            "last_output": self.last_output,
        })
    }
}

/// Executes workflow definitions step by step
pub struct WorkflowRunner {
    actions: Arc<ActionRegistry>,
    conditions: ConditionEvaluator,
    retry: RetryPolicy,
    shutdown: CancellationToken,
}

impl WorkflowRunner {
    pub fn new(actions: Arc<ActionRegistry>, retry: RetryPolicy, shutdown: CancellationToken) -> Self {
        Self {
            actions,
            conditions: ConditionEvaluator::new(),
            retry,
            shutdown,
        }
    }

    pub fn actions(&self) -> &Arc<ActionRegistry> {
        &self.actions
    }

    /// Token whose cancellation stops runs between steps and aborts backoff waits
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Run `definition` once for `trigger`
    pub async fn run(
        &self,
        definition: &WorkflowDefinition,
        trigger: TriggerEvent,
    ) -> EngineResult<RunResult> {
        definition.validate()?;

        let started_at = Utc::now();
        let run_id = uuid::Uuid::new_v4();
        tracing::info!(
            "🚀 Starting run {} of workflow {} ({} steps)",
            run_id,
            definition.id,
            definition.steps.len()
        );

        let mut context = RunContext {
            workflow_id: &definition.id,
            trigger: &trigger,
            trace: Vec::with_capacity(definition.steps.len()),
            last_output: Value::Null,
        };
        let mut outcome = RunOutcome::Success;
        let mut run_error = None;

        for (step_index, step) in definition.steps.iter().enumerate() {
            if self.shutdown.is_cancelled() {
                tracing::warn!(
                    "🛑 Shutdown requested, stopping workflow {} before step {}",
                    definition.id,
                    step_index
                );
                outcome = RunOutcome::Failed;
                run_error = Some(EngineError::ShutdownInProgress.to_string());
                break;
            }

            let step_started = Instant::now();
            match step {
                Step::Condition { predicate } => {
                    let (met, warning) =
                        match self.conditions.try_evaluate(predicate, &context.document()) {
                            Ok(met) => (met, None),
                            Err(e) => {
                                tracing::warn!(
                                    "⚠️ Condition at step {} of {} treated as false: {}",
                                    step_index,
                                    definition.id,
                                    e
                                );
                                (false, Some(e.to_string()))
                            }
                        };

                    context.trace.push(StepResult {
                        step_index,
                        kind: step.kind(),
                        action_type: None,
                        outcome: if met { StepOutcome::Success } else { StepOutcome::Halted },
                        error: warning,
                        attempts: 0,
                        duration_ms: elapsed_ms(step_started),
                        output: Some(Value::Bool(met)),
                    });

                    if !met {
                        tracing::info!("⏸️ Workflow {} halted at step {}", definition.id, step_index);
                        outcome = RunOutcome::Halted;
                        break;
                    }
                }
                Step::Action { action_type, params } => {
                    let handler = match self.actions.resolve(action_type) {
                        Ok(handler) => handler,
                        Err(e) => {
                            tracing::error!("❌ Step {} of {}: {}", step_index, definition.id, e);
                            context.trace.push(StepResult {
                                step_index,
                                kind: step.kind(),
                                action_type: Some(action_type.clone()),
                                outcome: StepOutcome::Failed,
                                error: Some(e.to_string()),
                                attempts: 0,
                                duration_ms: elapsed_ms(step_started),
                                output: None,
                            });
                            outcome = RunOutcome::Failed;
                            run_error = Some(e.to_string());
                            break;
                        }
                    };

                    tracing::debug!("⚡ Step {}: action '{}'", step_index, action_type);
                    let retried = execute_with_retry(
                        action_type,
                        handler.as_ref(),
                        params,
                        &self.retry,
                        &self.shutdown,
                    )
                    .await;

                    match retried.result {
                        Ok(output) => {
                            context.trace.push(StepResult {
                                step_index,
                                kind: step.kind(),
                                action_type: Some(action_type.clone()),
                                outcome: StepOutcome::Success,
                                error: None,
                                attempts: retried.attempts,
                                duration_ms: elapsed_ms(step_started),
                                output: Some(output.clone()),
                            });
                            context.last_output = output;
                        }
                        Err(e) => {
                            context.trace.push(StepResult {
                                step_index,
                                kind: step.kind(),
                                action_type: Some(action_type.clone()),
                                outcome: StepOutcome::Failed,
                                error: Some(e.to_string()),
                                attempts: retried.attempts,
                                duration_ms: elapsed_ms(step_started),
                                output: None,
                            });
                            outcome = RunOutcome::Failed;
                            run_error = Some(e.to_string());
                            break;
                        }
                    }
                }
            }
        }

        let RunContext { trace, .. } = context;
        match outcome {
            RunOutcome::Failed => tracing::error!(
                "❌ Workflow {} failed after {} step(s)",
                definition.id,
                trace.len()
            ),
            _ => tracing::info!(
                "✅ Workflow {} finished {:?} after {} step(s)",
                definition.id,
                outcome,
                trace.len()
            ),
        }

        Ok(RunResult {
            run_id,
            workflow_id: definition.id.clone(),
            trigger,
            outcome,
            trace,
            error: run_error,
            started_at,
            completed_at: Utc::now(),
        })
    }
}

fn elapsed_ms(since: Instant) -> u64 {
    u64::try_from(since.elapsed().as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::actions::DelayAction;
    use crate::testing::{action, condition, workflow, MockAction};
    use crate::workflow::types::StepKind;
    use std::time::Duration;

    struct Fixture {
        runner: WorkflowRunner,
        email: Arc<MockAction>,
        token: CancellationToken,
    }

    fn fixture(email: MockAction) -> Fixture {
        let registry = Arc::new(ActionRegistry::new());
        let email = Arc::new(email);
        registry.register("email", email.clone());
        registry.register("delay", Arc::new(DelayAction));
        registry.register("count", Arc::new(MockAction::returning(json!({ "count": 2 }))));

        let token = CancellationToken::new();
        let runner = WorkflowRunner::new(
            registry,
            RetryPolicy::new(3, Duration::ZERO),
            token.clone(),
        );
        Fixture { runner, email, token }
    }

    #[tokio::test]
    async fn all_steps_succeed() {
        let f = fixture(MockAction::returning(json!({ "sent": true })));
        let definition = workflow(
            "wf",
            vec![
                condition(true),
                action("delay", json!({ "seconds": 0 })),
                action("email", json!({ "to": "ops@example.com" })),
            ],
        );

        let result = f.runner.run(&definition, TriggerEvent::manual()).await.unwrap();

        assert_eq!(result.outcome, RunOutcome::Success);
        assert_eq!(result.trace.len(), 3);
        assert!(result.trace.iter().all(|s| s.outcome == StepOutcome::Success));
        assert_eq!(result.trace[2].output, Some(json!({ "sent": true })));
        assert_eq!(result.trace[2].attempts, 1);
        assert_eq!(f.email.seen_params()[0]["to"], "ops@example.com");
        assert!(result.error.is_none());
        assert!(result.completed_at >= result.started_at);
    }

    #[tokio::test]
    async fn false_condition_halts_before_side_effects() {
        let f = fixture(MockAction::returning(json!({})));
        let definition = workflow("wf", vec![condition(false), action("email", json!({}))]);

        let result = f.runner.run(&definition, TriggerEvent::manual()).await.unwrap();

        assert_eq!(result.outcome, RunOutcome::Halted);
        assert_eq!(result.trace.len(), 1);
        assert_eq!(result.trace[0].kind, StepKind::Condition);
        assert_eq!(result.trace[0].outcome, StepOutcome::Halted);
        assert_eq!(f.email.call_count(), 0);
    }

    #[tokio::test]
    async fn unknown_action_type_fails_the_run() {
        let f = fixture(MockAction::returning(json!({})));
        let definition = workflow(
            "wf",
            vec![
                action("delay", json!({ "seconds": 0 })),
                action("fax", json!({})),
                action("email", json!({})),
            ],
        );

        let result = f.runner.run(&definition, TriggerEvent::manual()).await.unwrap();

        assert_eq!(result.outcome, RunOutcome::Failed);
        assert_eq!(result.trace.len(), 2);
        assert_eq!(result.trace[1].outcome, StepOutcome::Failed);
        assert!(result.trace[1].error.as_deref().unwrap().contains("unknown action type"));
        assert_eq!(f.email.call_count(), 0);
    }

    #[tokio::test]
    async fn exhausted_retries_skip_remaining_steps() {
        let f = fixture(MockAction::failing("gateway down"));
        let definition = workflow(
            "wf",
            vec![action("email", json!({})), action("delay", json!({ "seconds": 0 }))],
        );

        let result = f.runner.run(&definition, TriggerEvent::manual()).await.unwrap();

        assert_eq!(result.outcome, RunOutcome::Failed);
        assert_eq!(result.trace.len(), 1);
        assert_eq!(result.trace[0].attempts, 3);
        assert_eq!(f.email.call_count(), 3);
        assert!(result.error.as_deref().unwrap().contains("gateway down"));
    }

    #[tokio::test]
    async fn conditions_see_previous_output_and_trigger_payload() {
        let f = fixture(MockAction::returning(json!({})));
        let definition = workflow(
            "wf",
            vec![
                action("count", json!({})),
                condition("ctx.last_output.count == 2 and ctx.trigger.payload.region == 'eu'"),
                condition(json!({ "field": "$.steps[0].outcome", "operator": "eq", "value": "success" })),
                action("email", json!({})),
            ],
        );

        let trigger = TriggerEvent::webhook(json!({ "region": "eu" }));
        let result = f.runner.run(&definition, trigger).await.unwrap();

        assert_eq!(result.outcome, RunOutcome::Success);
        assert_eq!(f.email.call_count(), 1);
    }

    #[tokio::test]
    async fn broken_condition_halts_with_a_warning() {
        let f = fixture(MockAction::returning(json!({})));
        let definition = workflow("wf", vec![condition("this is not lua"), action("email", json!({}))]);

        let result = f.runner.run(&definition, TriggerEvent::manual()).await.unwrap();

        assert_eq!(result.outcome, RunOutcome::Halted);
        assert!(result.trace[0].error.is_some());
        assert_eq!(f.email.call_count(), 0);
    }

    #[tokio::test]
    async fn endless_lua_condition_halts_the_run() {
        let f = fixture(MockAction::returning(json!({})));
        let definition = workflow(
            "wf",
            vec![
                condition("(function() while true do end return true end)()"),
                action("email", json!({})),
            ],
        );

        let result = tokio::time::timeout(
            Duration::from_secs(10),
            f.runner.run(&definition, TriggerEvent::manual()),
        )
        .await
        .expect("condition should be aborted by the instruction limit")
        .unwrap();

        assert_eq!(result.outcome, RunOutcome::Halted);
        assert!(result.trace[0].error.as_deref().unwrap().contains("instruction limit"));
        assert_eq!(f.email.call_count(), 0);
    }

    #[tokio::test]
    async fn shutdown_stops_before_the_next_step() {
        let f = fixture(MockAction::returning(json!({})));
        f.token.cancel();

        let result = f
            .runner
            .run(&workflow("wf", vec![action("email", json!({}))]), TriggerEvent::manual())
            .await
            .unwrap();

        assert_eq!(result.outcome, RunOutcome::Failed);
        assert!(result.trace.is_empty());
        assert_eq!(result.error, Some(EngineError::ShutdownInProgress.to_string()));
        assert_eq!(f.email.call_count(), 0);
    }

    #[tokio::test]
    async fn malformed_definition_is_an_error() {
        let f = fixture(MockAction::returning(json!({})));
        let definition = workflow("wf", vec![Step::Condition { predicate: Value::Null }]);

        let err = f.runner.run(&definition, TriggerEvent::manual()).await.unwrap_err();
        assert!(matches!(err, EngineError::DefinitionMalformed(_)));
    }

    #[tokio::test]
    async fn empty_workflow_succeeds() {
        let f = fixture(MockAction::returning(json!({})));
        let result = f.runner.run(&workflow("wf", vec![]), TriggerEvent::scheduled()).await.unwrap();
        assert_eq!(result.outcome, RunOutcome::Success);
        assert!(result.trace.is_empty());
    }
}
