/// Execution history
///
/// Every run produces exactly one log entry: created as `running` when a
/// worker picks the request up, completed once with the run's result, and
/// eventually removed by retention cleanup.

pub mod sqlite;

pub use sqlite::SqliteLogSink;

use crate::error::EngineResult;
use crate::workflow::types::{RunOutcome, RunResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Number of entries kept by the periodic cleanup unless configured otherwise
pub const DEFAULT_LOG_RETENTION: u32 = 1000;

/// Error recorded on entries a previous process left `running`
pub const ORPHANED_RUN_MESSAGE: &str = "process restarted before the run completed";

/// Lifecycle state of a log entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogStatus {
    Running,
    Success,
    Failed,
}

impl LogStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogStatus::Running => "running",
            LogStatus::Success => "success",
            LogStatus::Failed => "failed",
        }
    }

    pub fn parse(status: &str) -> Option<Self> {
        match status {
            "running" => Some(LogStatus::Running),
            "success" => Some(LogStatus::Success),
            "failed" => Some(LogStatus::Failed),
            _ => None,
        }
    }

    /// Halted runs stopped on purpose, so they are logged as successes.
    pub fn from_outcome(outcome: RunOutcome) -> Self {
        match outcome {
            RunOutcome::Success | RunOutcome::Halted => LogStatus::Success,
            RunOutcome::Failed => LogStatus::Failed,
        }
    }
}

/// One row of execution history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: i64,
    pub workflow_id: String,
    pub status: LogStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    /// The serialized `RunResult`, trace included
    pub execution_data: Option<Value>,
}

/// Durable, append-only run records
#[async_trait]
pub trait ExecutionLogSink: Send + Sync {
    /// Create a `running` entry and return its id
    async fn record_start(&self, workflow_id: &str) -> EngineResult<i64>;

    /// Complete a `running` entry; fails with `LogEntryNotFound` if the id is
    /// unknown or was already completed.
    async fn record_completion(&self, log_id: i64, result: &RunResult) -> EngineResult<()>;

    /// Most recently started entries first
    async fn list_recent(&self, limit: u32) -> EngineResult<Vec<LogEntry>>;

    /// Delete every entry except the `keep` most recently started, never
    /// touching `running` ones. Returns the number of deleted rows.
    async fn trim_retain_latest(&self, keep: u32) -> EngineResult<u64>;

    /// Mark every `running` entry `failed` with `message`. Only safe before
    /// any worker has started; returns the number of entries closed.
    async fn fail_orphaned_runs(&self, message: &str) -> EngineResult<u64>;
}
