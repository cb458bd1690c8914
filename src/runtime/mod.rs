/// Runtime execution engine
///
/// This module turns stored workflow definitions into runs:
/// - Action registry and the built-in delivery handlers
/// - Retry with exponential backoff around each action
/// - Condition evaluation (literal, Lua, JSONPath)
/// - The sequential step runner
/// - Cron scheduling, the work queue and per-workflow single flight

// Action-type lookup and built-in handlers
pub mod actions;

// Bounded retries around one handler call
pub mod retry;

// Predicate evaluation for condition steps
pub mod condition;

// Step-by-step workflow interpreter
pub mod runner;

// Cron triggers, work queue and worker tasks
pub mod scheduler;

// Re-export main types
pub use actions::{ActionError, ActionHandler, ActionRegistry};
pub use condition::ConditionEvaluator;
pub use retry::{execute_with_retry, RetryPolicy};
pub use runner::WorkflowRunner;
pub use scheduler::{JobCallback, ReconcileReport, RunAcceptance, ScheduledJob, WorkflowScheduler};
