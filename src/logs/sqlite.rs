/// SQLite-backed execution log
///
/// Shares the pool with the workflow store. Timestamps are stored as RFC 3339
/// text with microsecond precision so they sort lexically.

use crate::error::{EngineError, EngineResult};
use crate::logs::{ExecutionLogSink, LogEntry, LogStatus};
use crate::workflow::types::RunResult;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::{
    sqlite::{SqlitePool, SqliteRow},
    Row,
};

#[derive(Debug, Clone)]
pub struct SqliteLogSink {
    pool: SqlitePool,
}

impl SqliteLogSink {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create the execution_logs table (idempotent)
    pub async fn init_schema(&self) -> EngineResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS execution_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                workflow_id TEXT NOT NULL,
                status TEXT NOT NULL,
                started_at TEXT NOT NULL,
                completed_at TEXT,
                error_message TEXT,
                execution_data TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_execution_logs_started_at ON execution_logs(started_at)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl ExecutionLogSink for SqliteLogSink {
    async fn record_start(&self, workflow_id: &str) -> EngineResult<i64> {
        let result = sqlx::query(
            "INSERT INTO execution_logs (workflow_id, status, started_at) VALUES (?, ?, ?)",
        )
        .bind(workflow_id)
        .bind(LogStatus::Running.as_str())
        .bind(timestamp(Utc::now()))
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    async fn record_completion(&self, log_id: i64, result: &RunResult) -> EngineResult<()> {
        let execution_data = serde_json::to_string(result)?;

        let updated = sqlx::query(
            r#"
            UPDATE execution_logs
            SET status = ?, completed_at = ?, error_message = ?, execution_data = ?
            WHERE id = ? AND status = 'running'
            "#,
        )
        .bind(LogStatus::from_outcome(result.outcome).as_str())
        .bind(timestamp(result.completed_at))
        .bind(result.error.as_deref())
        .bind(&execution_data)
        .bind(log_id)
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(EngineError::LogEntryNotFound(log_id));
        }
        Ok(())
    }

    async fn list_recent(&self, limit: u32) -> EngineResult<Vec<LogEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT id, workflow_id, status, started_at, completed_at, error_message, execution_data
            FROM execution_logs
            ORDER BY started_at DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(log_entry).collect()
    }

    async fn trim_retain_latest(&self, keep: u32) -> EngineResult<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM execution_logs
            WHERE status != 'running'
              AND id NOT IN (
                SELECT id FROM execution_logs
                ORDER BY started_at DESC, id DESC
                LIMIT ?
              )
            "#,
        )
        .bind(i64::from(keep))
        .execute(&self.pool)
        .await?;

        let deleted = result.rows_affected();
        if deleted > 0 {
            tracing::info!("🧹 Trimmed {} execution log entries (kept {})", deleted, keep);
        }
        Ok(deleted)
    }

    async fn fail_orphaned_runs(&self, message: &str) -> EngineResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE execution_logs
            SET status = ?, completed_at = ?, error_message = ?
            WHERE status = 'running'
            "#,
        )
        .bind(LogStatus::Failed.as_str())
        .bind(timestamp(Utc::now()))
        .bind(message)
        .execute(&self.pool)
        .await?;

        let closed = result.rows_affected();
        if closed > 0 {
            tracing::warn!("⚠️ Marked {} orphaned run(s) as failed", closed);
        }
        Ok(closed)
    }
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(text: &str) -> EngineResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .map(|at| at.with_timezone(&Utc))
        .map_err(|e| EngineError::Storage(sqlx::Error::Decode(Box::new(e))))
}

fn log_entry(row: &SqliteRow) -> EngineResult<LogEntry> {
    let status: String = row.get("status");
    let status = LogStatus::parse(&status).ok_or_else(|| {
        EngineError::Storage(sqlx::Error::Decode(
            format!("unknown log status '{status}'").into(),
        ))
    })?;

    let started_at: String = row.get("started_at");
    let completed_at: Option<String> = row.get("completed_at");
    let execution_data: Option<String> = row.get("execution_data");

    Ok(LogEntry {
        id: row.get("id"),
        workflow_id: row.get("workflow_id"),
        status,
        started_at: parse_timestamp(&started_at)?,
        completed_at: completed_at.as_deref().map(parse_timestamp).transpose()?,
        error_message: row.get("error_message"),
        execution_data: execution_data
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::types::{RunOutcome, TriggerEvent};
    use sqlx::sqlite::SqlitePoolOptions;

    async fn sink() -> SqliteLogSink {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let sink = SqliteLogSink::new(pool);
        sink.init_schema().await.unwrap();
        sink
    }

    fn result(workflow_id: &str, outcome: RunOutcome, error: Option<&str>) -> RunResult {
        RunResult {
            run_id: uuid::Uuid::new_v4(),
            workflow_id: workflow_id.into(),
            trigger: TriggerEvent::manual(),
            outcome,
            trace: Vec::new(),
            error: error.map(str::to_string),
            started_at: Utc::now(),
            completed_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn start_then_complete() {
        let sink = sink().await;
        let id = sink.record_start("wf").await.unwrap();

        let running = sink.list_recent(10).await.unwrap();
        assert_eq!(running[0].status, LogStatus::Running);
        assert!(running[0].completed_at.is_none());

        sink.record_completion(id, &result("wf", RunOutcome::Failed, Some("boom")))
            .await
            .unwrap();

        let entry = &sink.list_recent(10).await.unwrap()[0];
        assert_eq!(entry.id, id);
        assert_eq!(entry.status, LogStatus::Failed);
        assert_eq!(entry.error_message.as_deref(), Some("boom"));
        assert!(entry.completed_at.is_some());
        assert_eq!(entry.execution_data.as_ref().unwrap()["outcome"], "failed");
    }

    #[tokio::test]
    async fn completion_is_recorded_once() {
        let sink = sink().await;
        let id = sink.record_start("wf").await.unwrap();
        let done = result("wf", RunOutcome::Success, None);

        sink.record_completion(id, &done).await.unwrap();
        let err = sink.record_completion(id, &done).await.unwrap_err();
        assert!(matches!(err, EngineError::LogEntryNotFound(i) if i == id));

        let err = sink.record_completion(9999, &done).await.unwrap_err();
        assert!(matches!(err, EngineError::LogEntryNotFound(9999)));
    }

    #[tokio::test]
    async fn halted_runs_complete_as_success() {
        let sink = sink().await;
        let id = sink.record_start("wf").await.unwrap();
        sink.record_completion(id, &result("wf", RunOutcome::Halted, None))
            .await
            .unwrap();

        let entry = &sink.list_recent(1).await.unwrap()[0];
        assert_eq!(entry.status, LogStatus::Success);
        assert_eq!(entry.execution_data.as_ref().unwrap()["outcome"], "halted");
    }

    #[tokio::test]
    async fn list_recent_is_newest_first() {
        let sink = sink().await;
        let first = sink.record_start("a").await.unwrap();
        let second = sink.record_start("b").await.unwrap();
        let third = sink.record_start("c").await.unwrap();

        let ids: Vec<i64> = sink.list_recent(2).await.unwrap().iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![third, second]);
        assert!(first < second);
    }

    #[tokio::test]
    async fn trim_keeps_the_newest_entries() {
        let sink = sink().await;
        let mut ids = Vec::new();
        for i in 0..1500 {
            let id = sink.record_start(&format!("wf-{}", i % 7)).await.unwrap();
            sink.record_completion(id, &result("wf", RunOutcome::Success, None))
                .await
                .unwrap();
            ids.push(id);
        }

        let deleted = sink.trim_retain_latest(1000).await.unwrap();
        assert_eq!(deleted, 500);

        let kept = sink.list_recent(2000).await.unwrap();
        assert_eq!(kept.len(), 1000);
        assert_eq!(kept.first().unwrap().id, ids[1499]);
        assert_eq!(kept.last().unwrap().id, ids[500]);

        assert_eq!(sink.trim_retain_latest(1000).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn trim_never_deletes_running_entries() {
        let sink = sink().await;
        let stuck = sink.record_start("slow").await.unwrap();
        for _ in 0..3 {
            let id = sink.record_start("fast").await.unwrap();
            sink.record_completion(id, &result("fast", RunOutcome::Success, None))
                .await
                .unwrap();
        }

        sink.trim_retain_latest(1).await.unwrap();

        let remaining: Vec<i64> = sink.list_recent(10).await.unwrap().iter().map(|e| e.id).collect();
        assert_eq!(remaining.len(), 2);
        assert!(remaining.contains(&stuck));
    }

    #[tokio::test]
    async fn orphaned_runs_are_closed_as_failed() {
        let sink = sink().await;
        let orphan = sink.record_start("crashed").await.unwrap();
        let done = sink.record_start("fine").await.unwrap();
        sink.record_completion(done, &result("fine", RunOutcome::Success, None))
            .await
            .unwrap();

        assert_eq!(sink.fail_orphaned_runs("restarted").await.unwrap(), 1);

        let entries = sink.list_recent(10).await.unwrap();
        let closed = entries.iter().find(|e| e.id == orphan).unwrap();
        assert_eq!(closed.status, LogStatus::Failed);
        assert_eq!(closed.error_message.as_deref(), Some("restarted"));
        assert!(closed.completed_at.is_some());
        let untouched = entries.iter().find(|e| e.id == done).unwrap();
        assert_eq!(untouched.status, LogStatus::Success);

        // Closed entries fall under normal retention again.
        assert_eq!(sink.trim_retain_latest(1).await.unwrap(), 1);
        assert_eq!(sink.fail_orphaned_runs("restarted").await.unwrap(), 0);
    }
}
