/// Engine error taxonomy
///
/// Every failure the engine can report, from schedule registration through
/// action execution and log persistence. Handler-level failures live in
/// `runtime::actions::ActionError` and only reach this type once retries are
/// exhausted.

use thiserror::Error;

/// Errors produced by the scheduling and execution engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// An action step names a type nobody registered.
    #[error("unknown action type: '{0}'")]
    UnknownActionType(String),

    /// A cron expression was rejected at schedule-add time.
    #[error("invalid schedule expression '{expression}': {reason}")]
    InvalidScheduleExpression { expression: String, reason: String },

    /// A predicate could not be evaluated. Non-fatal: the condition counts as not met.
    #[error("condition evaluation warning: {0}")]
    ConditionEvaluation(String),

    /// The retry budget for an action ran out.
    #[error("action '{action_type}' failed after {attempts} attempt(s): {message}")]
    ActionExecutionFailure {
        action_type: String,
        attempts: u32,
        message: String,
    },

    /// The definition is missing required fields or has the wrong shape.
    #[error("malformed workflow definition: {0}")]
    DefinitionMalformed(String),

    /// No workflow with this id exists.
    #[error("workflow not found: {0}")]
    DefinitionNotFound(String),

    /// A webhook arrived for a workflow that is not webhook-triggered.
    #[error("workflow '{0}' is not webhook-triggered")]
    NotWebhookTriggered(String),

    /// Only active workflows can hold a cron job.
    #[error("workflow '{0}' is inactive; activate it before scheduling")]
    WorkflowInactive(String),

    /// A run panicked; the worker caught it and recorded the run as failed.
    #[error("run of workflow '{workflow_id}' panicked: {message}")]
    RunPanicked { workflow_id: String, message: String },

    /// The scheduler is shutting down; no new work or retries are accepted.
    #[error("scheduler shutdown in progress")]
    ShutdownInProgress,

    /// A completion was recorded for a log entry that does not exist or is already complete.
    #[error("no running log entry with id {0}")]
    LogEntryNotFound(i64),

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The cron backend refused an operation.
    #[error("scheduler error: {0}")]
    Scheduler(String),
}

impl EngineError {
    /// Shorthand used by the schedule validators.
    pub fn invalid_schedule(expression: &str, reason: impl Into<String>) -> Self {
        Self::InvalidScheduleExpression {
            expression: expression.to_string(),
            reason: reason.into(),
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
