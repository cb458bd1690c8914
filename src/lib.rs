/// flowpilot: lightweight workflow automation engine
///
/// Stores workflow definitions, fires them on cron schedules, webhooks or
/// manual triggers, runs their steps with retrying actions and records every
/// run in a durable execution log.

// Core configuration and setup
pub mod config;

// Engine error taxonomy
pub mod error;

// Workflow management layer - definitions, storage and cache
pub mod workflow;

// Runtime execution engine - actions, retries, conditions, runner, scheduler
pub mod runtime;

// Execution history
pub mod logs;

// HTTP API layer - REST endpoints for workflow management and webhook triggers
pub mod api;

// Server setup and initialization
pub mod server;

// In-memory doubles for tests and embedders
pub mod testing;

// Re-export commonly used types for external consumers
pub use error::{EngineError, EngineResult};
pub use runtime::{ActionRegistry, WorkflowRunner, WorkflowScheduler};
pub use server::start_server;
pub use workflow::{RunOutcome, RunResult, Step, Trigger, TriggerEvent, WorkflowDefinition};
