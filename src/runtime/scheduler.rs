/// Workflow job scheduler
///
/// Owns every cron trigger (through tokio-cron-scheduler), the work queue that
/// fires feed into, and the worker tasks that execute runs. A fire never runs
/// a workflow itself: it enqueues a `RunRequest`, and the dispatcher hands it
/// to a worker while guaranteeing at most one run per workflow id at a time.
///
/// Lifecycle: `new` → `reconcile_on_startup` / `schedule` → `start` →
/// `shutdown`. Jobs may be added before `start`; requests enqueued before
/// `start` wait in the queue.

use crate::config::SchedulerConfig;
use crate::error::{EngineError, EngineResult};
use crate::logs::ExecutionLogSink;
use crate::runtime::runner::WorkflowRunner;
use crate::workflow::storage::DefinitionSource;
use crate::workflow::types::{RunResult, Trigger, TriggerEvent, WorkflowDefinition};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::Serialize;
use serde_json::Value;
use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{mpsc, RwLock};
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

/// Invoked with the workflow id every time a job fires
pub type JobCallback = Arc<dyn Fn(String) -> BoxFuture<'static, ()> + Send + Sync>;

/// One queued execution
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub request_id: Uuid,
    pub workflow_id: String,
    pub trigger: TriggerEvent,
}

impl RunRequest {
    pub fn new(workflow_id: impl Into<String>, trigger: TriggerEvent) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            workflow_id: workflow_id.into(),
            trigger,
        }
    }
}

/// Returned when a run request is accepted onto the work queue
#[derive(Debug, Clone, Serialize)]
pub struct RunAcceptance {
    pub request_id: Uuid,
    pub workflow_id: String,
    pub accepted_at: DateTime<Utc>,
}

/// Snapshot of one recurring job
#[derive(Debug, Clone, Serialize)]
pub struct ScheduledJob {
    pub workflow_id: String,
    pub expression: String,
    pub next_fire_time: Option<DateTime<Utc>>,
    pub job_id: Uuid,
}

/// Outcome of startup reconciliation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// Cron workflows that now have a job
    pub registered: usize,
    /// Active workflows without a cron trigger
    pub skipped: usize,
    /// Cron workflows whose stored expression was rejected
    pub failed: usize,
}

/// Entry of the job table
struct JobEntry {
    job_uuid: Uuid,
    expression: String,
    /// Parsed pattern, used for next-fire previews
    pattern: croner::Cron,
    /// Fires carrying an older generation belong to a replaced job and are dropped
    generation: u64,
}

type JobTable = Arc<RwLock<HashMap<String, JobEntry>>>;

/// Everything a worker needs to execute a request
struct Executor {
    definitions: Arc<dyn DefinitionSource>,
    runner: Arc<WorkflowRunner>,
    logs: Arc<dyn ExecutionLogSink>,
    /// workflow_id → pending request; a present key means a run is in flight
    slots: Mutex<HashMap<String, Option<RunRequest>>>,
    workers: TaskTracker,
    shutdown: CancellationToken,
}

pub struct WorkflowScheduler {
    cron: RwLock<JobScheduler>,
    jobs: JobTable,
    next_generation: AtomicU64,
    queue: mpsc::UnboundedSender<RunRequest>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<RunRequest>>>,
    executor: Arc<Executor>,
    settings: SchedulerConfig,
    started: AtomicBool,
    stopped: AtomicBool,
}

impl WorkflowScheduler {
    /// Build a scheduler; shutdown cancels the runner's token.
    pub async fn new(
        definitions: Arc<dyn DefinitionSource>,
        runner: Arc<WorkflowRunner>,
        logs: Arc<dyn ExecutionLogSink>,
        settings: SchedulerConfig,
    ) -> EngineResult<Self> {
        let cron = JobScheduler::new()
            .await
            .map_err(|e| EngineError::Scheduler(e.to_string()))?;
        let (queue, receiver) = mpsc::unbounded_channel();
        let shutdown = runner.shutdown_token();

        Ok(Self {
            cron: RwLock::new(cron),
            jobs: Arc::new(RwLock::new(HashMap::new())),
            next_generation: AtomicU64::new(0),
            queue,
            receiver: Mutex::new(Some(receiver)),
            executor: Arc::new(Executor {
                definitions,
                runner,
                logs,
                slots: Mutex::new(HashMap::new()),
                workers: TaskTracker::new(),
                shutdown,
            }),
            settings,
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        })
    }

    /// Start the timing loop, the dispatcher and the periodic log cleanup
    pub async fn start(&self) -> EngineResult<()> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(EngineError::ShutdownInProgress);
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        tracing::info!("⏰ Starting workflow scheduler");

        let receiver = self
            .receiver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(receiver) = receiver {
            let executor = Arc::clone(&self.executor);
            self.executor.workers.spawn(dispatch_loop(executor, receiver));
        }

        let interval = self.settings.cleanup_interval();
        if interval.is_zero() {
            tracing::warn!("⚠️ Log cleanup interval is zero, periodic cleanup disabled");
        } else {
            let logs = Arc::clone(&self.executor.logs);
            let token = self.executor.shutdown.clone();
            let keep = self.settings.log_retention;
            let cleanup = Job::new_repeated_async(interval, move |_uuid, _lock| {
                let logs = Arc::clone(&logs);
                let token = token.clone();
                Box::pin(async move {
                    if token.is_cancelled() {
                        return;
                    }
                    if let Err(e) = logs.trim_retain_latest(keep).await {
                        tracing::error!("❌ Periodic log cleanup failed: {}", e);
                    }
                })
            })
            .map_err(|e| EngineError::Scheduler(e.to_string()))?;

            self.cron
                .read()
                .await
                .add(cleanup)
                .await
                .map_err(|e| EngineError::Scheduler(e.to_string()))?;
        }

        self.cron
            .read()
            .await
            .start()
            .await
            .map_err(|e| EngineError::Scheduler(e.to_string()))?;

        tracing::info!(
            "✅ Workflow scheduler started with {} job(s)",
            self.jobs.read().await.len()
        );
        Ok(())
    }

    /// Register `callback` to fire on `expression` for `workflow_id`,
    /// replacing any job the id already has.
    ///
    /// The expression is validated before the table is touched, so a bad
    /// expression leaves an existing job in place.
    pub async fn add_or_replace_job(
        &self,
        workflow_id: &str,
        expression: &str,
        callback: JobCallback,
    ) -> EngineResult<ScheduledJob> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(EngineError::ShutdownInProgress);
        }

        let (normalized, pattern) = parse_cron(expression)?;
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst) + 1;

        let jobs = Arc::clone(&self.jobs);
        let token = self.executor.shutdown.clone();
        let owner = workflow_id.to_string();
        let job = Job::new_async(normalized.as_str(), move |_uuid, _lock| {
            let jobs = Arc::clone(&jobs);
            let token = token.clone();
            let owner = owner.clone();
            let callback = Arc::clone(&callback);
            Box::pin(async move {
                fire_if_current(&jobs, &token, owner, generation, &callback).await;
            })
        })
        .map_err(|e| EngineError::invalid_schedule(expression, e.to_string()))?;
        let job_uuid = job.guid();

        let mut jobs = self.jobs.write().await;
        let cron = self.cron.read().await;
        if let Some(previous) = jobs.remove(workflow_id) {
            if let Err(e) = cron.remove(&previous.job_uuid).await {
                tracing::warn!("⚠️ Failed to remove old job for {}: {}", workflow_id, e);
            }
            tracing::debug!("🛑 Replaced cron job for {} ({})", workflow_id, previous.expression);
        }
        cron.add(job)
            .await
            .map_err(|e| EngineError::Scheduler(e.to_string()))?;

        let entry = JobEntry {
            job_uuid,
            expression: expression.trim().to_string(),
            pattern,
            generation,
        };
        let snapshot = scheduled_job(workflow_id, &entry);
        jobs.insert(workflow_id.to_string(), entry);

        tracing::info!("🔥 Scheduled {} on '{}'", workflow_id, expression.trim());
        Ok(snapshot)
    }

    /// Schedule `workflow_id` to enqueue a scheduled run on every fire
    pub async fn schedule(&self, workflow_id: &str, expression: &str) -> EngineResult<ScheduledJob> {
        let callback = self.enqueue_on_fire();
        self.add_or_replace_job(workflow_id, expression, callback).await
    }

    /// Callback that turns a fire into a scheduled `RunRequest` on the work queue
    pub(crate) fn enqueue_on_fire(&self) -> JobCallback {
        let queue = self.queue.clone();
        Arc::new(move |workflow_id: String| {
            let queue = queue.clone();
            Box::pin(async move {
                tracing::debug!("🔔 Cron fired for {}", workflow_id);
                if queue.send(RunRequest::new(workflow_id, TriggerEvent::scheduled())).is_err() {
                    tracing::warn!("⚠️ Work queue closed, dropping scheduled run");
                }
            })
        })
    }

    /// Remove the job for `workflow_id`; returns whether one existed
    pub async fn remove_job(&self, workflow_id: &str) -> EngineResult<bool> {
        let mut jobs = self.jobs.write().await;
        let Some(entry) = jobs.remove(workflow_id) else {
            return Ok(false);
        };

        self.cron
            .read()
            .await
            .remove(&entry.job_uuid)
            .await
            .map_err(|e| EngineError::Scheduler(e.to_string()))?;
        tracing::info!("🗑️ Unscheduled {}", workflow_id);
        Ok(true)
    }

    pub async fn unschedule(&self, workflow_id: &str) -> EngineResult<bool> {
        self.remove_job(workflow_id).await
    }

    /// Enqueue a one-shot manual run; the job table is not touched.
    pub fn run_now(&self, workflow_id: &str) -> EngineResult<RunAcceptance> {
        self.run_now_with(workflow_id, TriggerEvent::manual())
    }

    pub fn run_now_with(&self, workflow_id: &str, trigger: TriggerEvent) -> EngineResult<RunAcceptance> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(EngineError::ShutdownInProgress);
        }

        let request = RunRequest::new(workflow_id, trigger);
        let acceptance = RunAcceptance {
            request_id: request.request_id,
            workflow_id: request.workflow_id.clone(),
            accepted_at: Utc::now(),
        };
        self.queue
            .send(request)
            .map_err(|_| EngineError::ShutdownInProgress)?;

        tracing::debug!("📥 Queued run {} for {}", acceptance.request_id, workflow_id);
        Ok(acceptance)
    }

    /// Manual trigger for a stored workflow
    pub async fn trigger_now(&self, workflow_id: &str) -> EngineResult<RunAcceptance> {
        self.require_definition(workflow_id).await?;
        self.run_now(workflow_id)
    }

    /// Webhook trigger; the body becomes the trigger payload.
    pub async fn trigger_webhook(&self, workflow_id: &str, payload: Value) -> EngineResult<RunAcceptance> {
        let definition = self.require_definition(workflow_id).await?;
        if definition.trigger != Trigger::Webhook {
            return Err(EngineError::NotWebhookTriggered(workflow_id.to_string()));
        }
        self.run_now_with(workflow_id, TriggerEvent::webhook(payload))
    }

    async fn require_definition(&self, workflow_id: &str) -> EngineResult<WorkflowDefinition> {
        self.executor
            .definitions
            .get_workflow_definition(workflow_id)
            .await?
            .ok_or_else(|| EngineError::DefinitionNotFound(workflow_id.to_string()))
    }

    /// Register a job for every active cron workflow
    ///
    /// A bad stored expression is logged and counted; it never stops the
    /// remaining workflows from being scheduled.
    pub async fn reconcile_on_startup(
        &self,
        definitions: &[WorkflowDefinition],
    ) -> EngineResult<ReconcileReport> {
        let mut report = ReconcileReport::default();

        for definition in definitions {
            let expression = match (definition.active, definition.cron_expression()) {
                (true, Some(expression)) => expression,
                _ => {
                    report.skipped += 1;
                    continue;
                }
            };

            match self.schedule(&definition.id, expression).await {
                Ok(_) => report.registered += 1,
                Err(EngineError::ShutdownInProgress) => return Err(EngineError::ShutdownInProgress),
                Err(e) => {
                    tracing::error!("❌ Could not schedule {}: {}", definition.id, e);
                    report.failed += 1;
                }
            }
        }

        tracing::info!(
            "📊 Reconciled schedules: {} registered, {} skipped, {} failed",
            report.registered,
            report.skipped,
            report.failed
        );
        Ok(report)
    }

    /// Trim the execution log down to the configured retention
    pub async fn periodic_cleanup(&self) -> EngineResult<u64> {
        self.executor
            .logs
            .trim_retain_latest(self.settings.log_retention)
            .await
    }

    /// Stop firing, abort backoff waits, and wait up to the grace period for
    /// in-flight runs. Idempotent and safe to call without `start`.
    pub async fn shutdown(&self) -> EngineResult<()> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        tracing::info!("⏹️ Shutting down workflow scheduler");

        self.executor.shutdown.cancel();
        self.jobs.write().await.clear();

        if self.started.load(Ordering::SeqCst) {
            if let Err(e) = self.cron.write().await.shutdown().await {
                tracing::warn!("⚠️ Cron loop did not stop cleanly: {}", e);
            }
        }

        self.executor.workers.close();
        let grace = self.settings.shutdown_grace();
        if tokio::time::timeout(grace, self.executor.workers.wait())
            .await
            .is_err()
        {
            tracing::warn!(
                "⚠️ Abandoning {} in-flight run(s) after {:?} grace period",
                self.in_flight(),
                grace
            );
        }

        tracing::info!("✅ Workflow scheduler stopped");
        Ok(())
    }

    /// Snapshot of the job table, ordered by workflow id
    pub async fn jobs(&self) -> Vec<ScheduledJob> {
        let jobs = self.jobs.read().await;
        let mut snapshot: Vec<ScheduledJob> = jobs
            .iter()
            .map(|(workflow_id, entry)| scheduled_job(workflow_id, entry))
            .collect();
        snapshot.sort_by(|a, b| a.workflow_id.cmp(&b.workflow_id));
        snapshot
    }

    pub async fn job(&self, workflow_id: &str) -> Option<ScheduledJob> {
        self.jobs
            .read()
            .await
            .get(workflow_id)
            .map(|entry| scheduled_job(workflow_id, entry))
    }

    /// Number of workflow ids with a run executing
    pub fn in_flight(&self) -> usize {
        self.executor
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub async fn recent_logs(&self, limit: u32) -> EngineResult<Vec<crate::logs::LogEntry>> {
        self.executor.logs.list_recent(limit).await
    }
}

/// Check a 5-field crontab expression without registering anything
pub fn validate_cron_expression(expression: &str) -> EngineResult<()> {
    parse_cron(expression).map(|_| ())
}

/// Validate a 5-field crontab expression and return the seconds-prefixed form
/// the cron backend expects, plus the parsed pattern.
fn parse_cron(expression: &str) -> EngineResult<(String, croner::Cron)> {
    let trimmed = expression.trim();
    let fields = trimmed.split_whitespace().count();
    if fields != 5 {
        return Err(EngineError::invalid_schedule(
            expression,
            format!("expected 5 fields (minute hour day-of-month month day-of-week), got {fields}"),
        ));
    }

    let normalized = format!("0 {trimmed}");
    let pattern = normalized
        .parse::<croner::Cron>()
        .map_err(|e| EngineError::invalid_schedule(expression, e.to_string()))?;
    Ok((normalized, pattern))
}

fn scheduled_job(workflow_id: &str, entry: &JobEntry) -> ScheduledJob {
    ScheduledJob {
        workflow_id: workflow_id.to_string(),
        expression: entry.expression.clone(),
        next_fire_time: entry.pattern.iter_after(Utc::now()).next(),
        job_id: entry.job_uuid,
    }
}

/// Body of every cron fire: drop it if shutdown started or the job was
/// replaced/removed since this timer was created.
async fn fire_if_current(
    jobs: &JobTable,
    token: &CancellationToken,
    workflow_id: String,
    generation: u64,
    callback: &JobCallback,
) -> bool {
    if token.is_cancelled() {
        return false;
    }

    let current = jobs.read().await.get(&workflow_id).map(|entry| entry.generation);
    if current != Some(generation) {
        tracing::debug!("⏭️ Dropping stale fire for {} (generation {})", workflow_id, generation);
        return false;
    }

    callback(workflow_id).await;
    true
}

/// Drain the work queue until shutdown
async fn dispatch_loop(executor: Arc<Executor>, mut receiver: mpsc::UnboundedReceiver<RunRequest>) {
    tracing::debug!("📬 Dispatcher started");
    loop {
        tokio::select! {
            biased;
            _ = executor.shutdown.cancelled() => break,
            request = receiver.recv() => match request {
                Some(request) => dispatch(&executor, request),
                None => break,
            },
        }
    }

    let dropped = std::iter::from_fn(|| receiver.try_recv().ok()).count();
    if dropped > 0 {
        tracing::warn!("🛑 Dropped {} queued run request(s) on shutdown", dropped);
    }
    tracing::debug!("📪 Dispatcher stopped");
}

/// Start a worker for the request, or park it in the id's pending slot
fn dispatch(executor: &Arc<Executor>, request: RunRequest) {
    let mut slots = executor.slots.lock().unwrap_or_else(PoisonError::into_inner);
    match slots.get_mut(&request.workflow_id) {
        Some(pending) => {
            tracing::debug!(
                "⏳ {} already running, parking request {}",
                request.workflow_id,
                request.request_id
            );
            if let Some(superseded) = pending.replace(request) {
                tracing::debug!("🔁 Superseded pending request {}", superseded.request_id);
            }
        }
        None => {
            slots.insert(request.workflow_id.clone(), None);
            drop(slots);
            executor
                .workers
                .spawn(drive_worker(Arc::clone(executor), request));
        }
    }
}

/// Execute a request, then any request parked for the same id meanwhile
async fn drive_worker(executor: Arc<Executor>, first: RunRequest) {
    let workflow_id = first.workflow_id.clone();
    let mut request = first;

    loop {
        executor.execute(request).await;

        let next = {
            let mut slots = executor.slots.lock().unwrap_or_else(PoisonError::into_inner);
            match slots.get_mut(&workflow_id).and_then(Option::take) {
                Some(next) if !executor.shutdown.is_cancelled() => Some(next),
                pending => {
                    if let Some(dropped) = pending {
                        tracing::warn!(
                            "🛑 Dropping pending run {} for {} on shutdown",
                            dropped.request_id,
                            workflow_id
                        );
                    }
                    slots.remove(&workflow_id);
                    None
                }
            }
        };

        match next {
            Some(next) => request = next,
            None => break,
        }
    }
}

impl Executor {
    /// Run one request and record it: exactly one log entry per request
    async fn execute(&self, request: RunRequest) {
        let RunRequest {
            request_id,
            workflow_id,
            trigger,
        } = request;
        tracing::debug!("🏃 Executing request {} for {}", request_id, workflow_id);

        let log_id = match self.logs.record_start(&workflow_id).await {
            Ok(id) => Some(id),
            Err(e) => {
                tracing::error!("❌ Could not open log entry for {}: {}", workflow_id, e);
                None
            }
        };

        let started_at = Utc::now();
        let result = match self.definitions.get_workflow_definition(&workflow_id).await {
            Ok(Some(definition)) => {
                let run = AssertUnwindSafe(self.runner.run(&definition, trigger.clone()));
                match run.catch_unwind().await {
                    Ok(Ok(result)) => result,
                    Ok(Err(e)) => {
                        RunResult::failed_before_start(&workflow_id, trigger, started_at, &e)
                    }
                    Err(panic) => {
                        let e = EngineError::RunPanicked {
                            workflow_id: workflow_id.clone(),
                            message: panic_message(panic.as_ref()),
                        };
                        tracing::error!("💥 {}", e);
                        RunResult::failed_before_start(&workflow_id, trigger, started_at, &e)
                    }
                }
            }
            Ok(None) => {
                let e = EngineError::DefinitionNotFound(workflow_id.clone());
                tracing::error!("❌ {}", e);
                RunResult::failed_before_start(&workflow_id, trigger, started_at, &e)
            }
            Err(e) => {
                tracing::error!("❌ Could not load {}: {}", workflow_id, e);
                RunResult::failed_before_start(&workflow_id, trigger, started_at, &e)
            }
        };

        if let Some(log_id) = log_id {
            if let Err(e) = self.logs.record_completion(log_id, &result).await {
                tracing::error!("❌ Could not complete log entry {}: {}", log_id, e);
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
