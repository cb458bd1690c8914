/// Core workflow type definitions
///
/// Defines workflow definitions, steps, trigger events and the run records the
/// runner produces. These types are serialized to JSON for persistence and
/// for the execution log.

use crate::error::{EngineError, EngineResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// Weakly typed action parameters; validated by the handler, not the runner.
pub type ActionParams = Map<String, Value>;

/// A complete workflow definition: a trigger plus an ordered list of steps
///
/// Stored as JSON in SQLite. A run always executes against the snapshot it
/// was handed, even if the stored copy changes mid-run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Unique workflow identifier (e.g., "wf-daily-report")
    pub id: String,
    /// Human-readable workflow name
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// What starts a run
    pub trigger: Trigger,
    /// Steps executed in order, one at a time
    pub steps: Vec<Step>,
    /// Inactive workflows are stored but never scheduled on startup
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

/// What starts a workflow run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Trigger {
    /// Only started through an explicit trigger call
    Manual,
    /// Standard 5-field crontab expression, e.g. "0 9 * * 1-5"
    Cron { expression: String },
    /// Started by POST /webhook/{id}; the request body becomes the trigger payload
    Webhook,
}

/// One unit of a workflow definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Step {
    /// Gate: when the predicate is not met the run halts here
    Condition {
        #[serde(default)]
        predicate: Value,
    },
    /// Side-effecting call into the action registry
    Action {
        action_type: String,
        #[serde(default)]
        params: ActionParams,
    },
}

/// Discriminant of a step, used in trace records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Condition,
    Action,
}

impl Step {
    pub fn kind(&self) -> StepKind {
        match self {
            Step::Condition { .. } => StepKind::Condition,
            Step::Action { .. } => StepKind::Action,
        }
    }
}

impl WorkflowDefinition {
    /// Parse a definition from loosely structured JSON, mapping shape errors
    /// to `DefinitionMalformed`.
    pub fn from_json(value: Value) -> EngineResult<Self> {
        let definition: WorkflowDefinition = serde_json::from_value(value)
            .map_err(|e| EngineError::DefinitionMalformed(e.to_string()))?;
        definition.validate()?;
        Ok(definition)
    }

    /// Check the fields serde cannot: non-empty ids and action types,
    /// conditions that actually carry a predicate.
    pub fn validate(&self) -> EngineResult<()> {
        if self.id.trim().is_empty() {
            return Err(EngineError::DefinitionMalformed("workflow id is empty".to_string()));
        }

        for (index, step) in self.steps.iter().enumerate() {
            match step {
                Step::Condition { predicate } if predicate.is_null() => {
                    return Err(EngineError::DefinitionMalformed(format!(
                        "step {index}: condition has no predicate"
                    )));
                }
                Step::Action { action_type, .. } if action_type.trim().is_empty() => {
                    return Err(EngineError::DefinitionMalformed(format!(
                        "step {index}: action has no action_type"
                    )));
                }
                _ => {}
            }
        }

        Ok(())
    }

    /// The cron expression, if this workflow is time-triggered
    pub fn cron_expression(&self) -> Option<&str> {
        match &self.trigger {
            Trigger::Cron { expression } => Some(expression.as_str()),
            _ => None,
        }
    }
}

/// Where a run request came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSource {
    Schedule,
    Manual,
    Webhook,
}

/// The event that started a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerEvent {
    pub source: TriggerSource,
    /// Webhook body, or an empty object for schedule/manual fires
    pub payload: Value,
    pub fired_at: DateTime<Utc>,
}

impl TriggerEvent {
    pub fn manual() -> Self {
        Self::new(TriggerSource::Manual, json!({}))
    }

    pub fn scheduled() -> Self {
        Self::new(TriggerSource::Schedule, json!({}))
    }

    pub fn webhook(payload: Value) -> Self {
        Self::new(TriggerSource::Webhook, payload)
    }

    fn new(source: TriggerSource, payload: Value) -> Self {
        Self {
            source,
            payload,
            fired_at: Utc::now(),
        }
    }
}

/// Terminal state of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Success,
    Failed,
    /// A condition step was not met; later steps never ran
    Halted,
}

/// Result of one step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    Success,
    Failed,
    Halted,
}

/// One entry of the ordered run trace
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub step_index: usize,
    pub kind: StepKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_type: Option<String>,
    pub outcome: StepOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Handler invocations made for this step (0 for conditions and unresolved actions)
    pub attempts: u32,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
}

/// Everything a finished run reduces to before it is written to the log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    pub run_id: uuid::Uuid,
    pub workflow_id: String,
    pub trigger: TriggerEvent,
    pub outcome: RunOutcome,
    pub trace: Vec<StepResult>,
    /// First unrecoverable error, if the run failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

impl RunResult {
    /// A run that failed before any step executed (missing or malformed definition)
    pub fn failed_before_start(
        workflow_id: &str,
        trigger: TriggerEvent,
        started_at: DateTime<Utc>,
        error: &EngineError,
    ) -> Self {
        Self {
            run_id: uuid::Uuid::new_v4(),
            workflow_id: workflow_id.to_string(),
            trigger,
            outcome: RunOutcome::Failed,
            trace: Vec::new(),
            error: Some(error.to_string()),
            started_at,
            completed_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tagged_steps_and_triggers() {
        let definition = WorkflowDefinition::from_json(json!({
            "id": "wf-1",
            "name": "Morning digest",
            "trigger": { "type": "cron", "expression": "0 9 * * *" },
            "steps": [
                { "kind": "condition", "predicate": true },
                { "kind": "action", "action_type": "email", "params": { "to": "ops@example.com" } }
            ]
        }))
        .unwrap();

        assert!(definition.active);
        assert_eq!(definition.cron_expression(), Some("0 9 * * *"));
        assert_eq!(definition.steps[0].kind(), StepKind::Condition);
        assert_eq!(definition.steps[1].kind(), StepKind::Action);
    }

    #[test]
    fn condition_without_predicate_is_malformed() {
        let err = WorkflowDefinition::from_json(json!({
            "id": "wf-1",
            "name": "broken",
            "trigger": { "type": "manual" },
            "steps": [{ "kind": "condition" }]
        }))
        .unwrap_err();

        assert!(matches!(err, EngineError::DefinitionMalformed(_)));
    }

    #[test]
    fn unknown_step_kind_is_malformed() {
        let err = WorkflowDefinition::from_json(json!({
            "id": "wf-1",
            "name": "broken",
            "trigger": { "type": "manual" },
            "steps": [{ "kind": "loop" }]
        }))
        .unwrap_err();

        assert!(matches!(err, EngineError::DefinitionMalformed(_)));
    }

    #[test]
    fn empty_action_type_is_malformed() {
        let definition = WorkflowDefinition {
            id: "wf-1".into(),
            name: "broken".into(),
            description: None,
            trigger: Trigger::Manual,
            steps: vec![Step::Action {
                action_type: "  ".into(),
                params: ActionParams::new(),
            }],
            active: true,
        };

        assert!(matches!(
            definition.validate(),
            Err(EngineError::DefinitionMalformed(_))
        ));
    }
}
