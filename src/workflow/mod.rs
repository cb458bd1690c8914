/// Workflow management layer
///
/// Workflow definitions, their SQLite persistence, and the read-through
/// cache the scheduler's workers load definitions from.

// Core workflow type definitions
pub mod types;

// SQLite persistence layer for workflow storage
pub mod storage;

// Read-through definition cache using ArcSwap
pub mod cache;

// Re-export commonly used types
pub use cache::CachedDefinitions;
pub use storage::{DefinitionSource, WorkflowMetadata, WorkflowStore};
pub use types::{
    ActionParams, RunOutcome, RunResult, Step, StepResult, Trigger, TriggerEvent, WorkflowDefinition,
};
