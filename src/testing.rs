/// In-memory doubles for tests and embedders
///
/// `MockAction` stands in for a delivery handler, `MemoryDefinitions` for the
/// workflow store and `MemoryLogSink` for the SQLite execution log. None of
/// them touch the network or disk.

use crate::error::{EngineError, EngineResult};
use crate::logs::{ExecutionLogSink, LogEntry, LogStatus};
use crate::runtime::actions::{ActionError, ActionHandler};
use crate::workflow::storage::DefinitionSource;
use crate::workflow::types::{ActionParams, RunResult, Step, Trigger, WorkflowDefinition};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

/// Manual-trigger workflow with the given steps
pub fn workflow(id: &str, steps: Vec<Step>) -> WorkflowDefinition {
    WorkflowDefinition {
        id: id.to_string(),
        name: format!("test workflow {id}"),
        description: None,
        trigger: Trigger::Manual,
        steps,
        active: true,
    }
}

/// Action params from a JSON object literal; anything else yields empty params
pub fn params(value: Value) -> ActionParams {
    match value {
        Value::Object(map) => map,
        _ => ActionParams::new(),
    }
}

pub fn action(action_type: &str, value: Value) -> Step {
    Step::Action {
        action_type: action_type.to_string(),
        params: params(value),
    }
}

pub fn condition(predicate: impl Into<Value>) -> Step {
    Step::Condition {
        predicate: predicate.into(),
    }
}

enum Behaviour {
    Return(Value),
    Fail(String),
    Reject(String),
    Panic(String),
    FailThenReturn { failures: u32, value: Value },
}

/// Scripted action handler that counts calls and concurrent executions
pub struct MockAction {
    behaviour: Behaviour,
    delay: Duration,
    calls: AtomicU32,
    active: AtomicUsize,
    peak: AtomicUsize,
    seen: Mutex<Vec<ActionParams>>,
}

impl MockAction {
    fn new(behaviour: Behaviour) -> Self {
        Self {
            behaviour,
            delay: Duration::ZERO,
            calls: AtomicU32::new(0),
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        }
    }

    /// Always succeeds with `value`
    pub fn returning(value: Value) -> Self {
        Self::new(Behaviour::Return(value))
    }

    /// Always fails with a retryable error
    pub fn failing(message: &str) -> Self {
        Self::new(Behaviour::Fail(message.to_string()))
    }

    /// Always fails with `InvalidParams`
    pub fn rejecting(message: &str) -> Self {
        Self::new(Behaviour::Reject(message.to_string()))
    }

    /// Panics inside `execute`
    pub fn panicking(message: &str) -> Self {
        Self::new(Behaviour::Panic(message.to_string()))
    }

    /// Fails `failures` times, then succeeds with `value`
    pub fn failing_then_returning(failures: u32, value: Value) -> Self {
        Self::new(Behaviour::FailThenReturn { failures, value })
    }

    /// Sleep this long inside every call
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Highest number of calls observed running at the same time
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Params of every call, in call order
    pub fn seen_params(&self) -> Vec<ActionParams> {
        self.seen.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

#[async_trait]
impl ActionHandler for MockAction {
    async fn execute(&self, params: &ActionParams) -> Result<Value, ActionError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(params.clone());

        let running = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(running, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.active.fetch_sub(1, Ordering::SeqCst);

        match &self.behaviour {
            Behaviour::Return(value) => Ok(value.clone()),
            Behaviour::Fail(message) => Err(ActionError::Failed(message.clone())),
            Behaviour::Reject(message) => Err(ActionError::InvalidParams(message.clone())),
            Behaviour::Panic(message) => panic!("{message}"),
            Behaviour::FailThenReturn { failures, value } => {
                if call <= *failures {
                    Err(ActionError::Failed(format!("transient failure #{call}")))
                } else {
                    Ok(value.clone())
                }
            }
        }
    }
}

/// Definition source backed by a HashMap
#[derive(Default)]
pub struct MemoryDefinitions {
    definitions: Mutex<HashMap<String, WorkflowDefinition>>,
    lookups: AtomicUsize,
}

impl MemoryDefinitions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, definition: WorkflowDefinition) {
        self.definitions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(definition.id.clone(), definition);
    }

    pub fn remove(&self, workflow_id: &str) -> Option<WorkflowDefinition> {
        self.definitions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(workflow_id)
    }

    /// Number of `get_workflow_definition` calls served
    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DefinitionSource for MemoryDefinitions {
    async fn get_workflow_definition(
        &self,
        workflow_id: &str,
    ) -> EngineResult<Option<WorkflowDefinition>> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .definitions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(workflow_id)
            .cloned())
    }
}

/// Execution log kept in a Vec, with the same semantics as the SQLite sink
#[derive(Default)]
pub struct MemoryLogSink {
    entries: Mutex<Vec<LogEntry>>,
    last_id: AtomicI64,
}

impl MemoryLogSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every entry in insertion order
    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Entries that are no longer `running`
    pub fn completed(&self) -> Vec<LogEntry> {
        self.entries()
            .into_iter()
            .filter(|entry| entry.status != LogStatus::Running)
            .collect()
    }

    /// Decoded run results of completed entries, in insertion order
    pub fn results(&self) -> Vec<RunResult> {
        self.completed()
            .into_iter()
            .filter_map(|entry| entry.execution_data)
            .filter_map(|data| serde_json::from_value(data).ok())
            .collect()
    }
}

#[async_trait]
impl ExecutionLogSink for MemoryLogSink {
    async fn record_start(&self, workflow_id: &str) -> EngineResult<i64> {
        let id = self.last_id.fetch_add(1, Ordering::SeqCst) + 1;
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.push(LogEntry {
            id,
            workflow_id: workflow_id.to_string(),
            status: LogStatus::Running,
            started_at: Utc::now(),
            completed_at: None,
            error_message: None,
            execution_data: None,
        });
        Ok(id)
    }

    async fn record_completion(&self, log_id: i64, result: &RunResult) -> EngineResult<()> {
        let execution_data = serde_json::to_value(result)?;
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = entries
            .iter_mut()
            .find(|entry| entry.id == log_id && entry.status == LogStatus::Running)
            .ok_or(EngineError::LogEntryNotFound(log_id))?;

        entry.status = LogStatus::from_outcome(result.outcome);
        entry.completed_at = Some(result.completed_at);
        entry.error_message = result.error.clone();
        entry.execution_data = Some(execution_data);
        Ok(())
    }

    async fn list_recent(&self, limit: u32) -> EngineResult<Vec<LogEntry>> {
        let mut entries = self.entries();
        entries.sort_by(|a, b| b.started_at.cmp(&a.started_at).then(b.id.cmp(&a.id)));
        entries.truncate(limit as usize);
        Ok(entries)
    }

    async fn trim_retain_latest(&self, keep: u32) -> EngineResult<u64> {
        let newest: Vec<i64> = self
            .list_recent(keep)
            .await?
            .into_iter()
            .map(|entry| entry.id)
            .collect();

        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|entry| entry.status == LogStatus::Running || newest.contains(&entry.id));
        Ok((before - entries.len()) as u64)
    }

    async fn fail_orphaned_runs(&self, message: &str) -> EngineResult<u64> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let mut closed = 0;
        for entry in entries.iter_mut().filter(|entry| entry.status == LogStatus::Running) {
            entry.status = LogStatus::Failed;
            entry.completed_at = Some(Utc::now());
            entry.error_message = Some(message.to_string());
            closed += 1;
        }
        Ok(closed)
    }
}
