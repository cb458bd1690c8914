/// SQLite persistence layer for workflow storage
///
/// Handles workflow CRUD operations in the main SQLite database.
/// Workflows are stored as JSON for flexibility while keeping the fields the
/// scheduler filters on (name, active) in their own columns.

use crate::error::EngineResult;
use crate::workflow::types::WorkflowDefinition;
use async_trait::async_trait;
use sqlx::{sqlite::SqlitePool, Row};

/// Definition lookup used by the scheduler's workers
///
/// Implemented by the SQLite store, by the read-through cache in front of it,
/// and by in-memory doubles in tests.
#[async_trait]
pub trait DefinitionSource: Send + Sync {
    /// Load a workflow definition; `Ok(None)` when the id is unknown.
    async fn get_workflow_definition(&self, workflow_id: &str)
        -> EngineResult<Option<WorkflowDefinition>>;
}

/// SQLite-based workflow storage manager
#[derive(Debug, Clone)]
pub struct WorkflowStore {
    /// SQLite connection pool shared with the execution log
    pool: SqlitePool,
}

impl WorkflowStore {
    /// Create new storage instance with database connection
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Initialize the workflow storage schema
    ///
    /// Safe to call multiple times (uses IF NOT EXISTS).
    pub async fn init_schema(&self) -> EngineResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS workflows (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                definition TEXT NOT NULL,
                active INTEGER NOT NULL DEFAULT 1,
                created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
                updated_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_workflows_active ON workflows(active)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Store a new workflow or update existing one
    ///
    /// Uses UPSERT to handle both create and update operations atomically.
    pub async fn save_workflow(&self, workflow: &WorkflowDefinition) -> EngineResult<()> {
        workflow.validate()?;
        let definition_json = serde_json::to_string(workflow)?;

        sqlx::query(
            r#"
            INSERT INTO workflows (id, name, definition, active, updated_at)
            VALUES (?, ?, ?, ?, CURRENT_TIMESTAMP)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                definition = excluded.definition,
                active = excluded.active,
                updated_at = CURRENT_TIMESTAMP
            "#,
        )
        .bind(&workflow.id)
        .bind(&workflow.name)
        .bind(&definition_json)
        .bind(workflow.active)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Retrieve a workflow by ID
    pub async fn get_workflow(&self, id: &str) -> EngineResult<Option<WorkflowDefinition>> {
        let row = sqlx::query("SELECT definition FROM workflows WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let definition_json: String = row.get("definition");
                Ok(Some(parse_definition(&definition_json)?))
            }
            None => Ok(None),
        }
    }

    /// List all workflows with basic metadata
    pub async fn list_workflows(&self) -> EngineResult<Vec<WorkflowMetadata>> {
        let rows = sqlx::query(
            "SELECT id, name, active, CAST(created_at AS TEXT) AS created_at, CAST(updated_at AS TEXT) AS updated_at \
             FROM workflows ORDER BY updated_at DESC, id",
        )
        .fetch_all(&self.pool)
        .await?;

        let workflows = rows
            .into_iter()
            .map(|row| WorkflowMetadata {
                id: row.get("id"),
                name: row.get("name"),
                active: row.get::<i64, _>("active") != 0,
                created_at: row.get("created_at"),
                updated_at: row.get("updated_at"),
            })
            .collect();

        Ok(workflows)
    }

    /// Load every active workflow for startup reconciliation
    ///
    /// Rows whose stored JSON no longer parses are skipped with a warning so
    /// one bad row cannot keep the rest from being scheduled.
    pub async fn list_active(&self) -> EngineResult<Vec<WorkflowDefinition>> {
        let rows = sqlx::query("SELECT id, definition FROM workflows WHERE active = 1 ORDER BY id")
            .fetch_all(&self.pool)
            .await?;

        let mut workflows = Vec::with_capacity(rows.len());
        for row in rows {
            let id: String = row.get("id");
            let definition_json: String = row.get("definition");
            match parse_definition(&definition_json) {
                Ok(workflow) => workflows.push(workflow),
                Err(e) => tracing::warn!("⚠️ Skipping unreadable workflow {}: {}", id, e),
            }
        }

        Ok(workflows)
    }

    /// Delete a workflow by ID
    pub async fn delete_workflow(&self, id: &str) -> EngineResult<bool> {
        let result = sqlx::query("DELETE FROM workflows WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl DefinitionSource for WorkflowStore {
    async fn get_workflow_definition(
        &self,
        workflow_id: &str,
    ) -> EngineResult<Option<WorkflowDefinition>> {
        self.get_workflow(workflow_id).await
    }
}

fn parse_definition(definition_json: &str) -> EngineResult<WorkflowDefinition> {
    let value: serde_json::Value = serde_json::from_str(definition_json)?;
    WorkflowDefinition::from_json(value)
}

/// Basic workflow metadata for listing operations
#[derive(Debug, serde::Serialize)]
pub struct WorkflowMetadata {
    pub id: String,
    pub name: String,
    pub active: bool,
    pub created_at: String,
    pub updated_at: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::types::{Step, Trigger};
    use sqlx::sqlite::SqlitePoolOptions;

    async fn store() -> WorkflowStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let store = WorkflowStore::new(pool);
        store.init_schema().await.unwrap();
        store
    }

    fn workflow(id: &str, trigger: Trigger, active: bool) -> WorkflowDefinition {
        WorkflowDefinition {
            id: id.into(),
            name: format!("workflow {id}"),
            description: None,
            trigger,
            steps: vec![Step::Condition {
                predicate: serde_json::json!(true),
            }],
            active,
        }
    }

    #[tokio::test]
    async fn list_active_skips_inactive_workflows() {
        let store = store().await;
        store
            .save_workflow(&workflow("a", Trigger::Cron { expression: "0 9 * * *".into() }, true))
            .await
            .unwrap();
        store.save_workflow(&workflow("b", Trigger::Manual, false)).await.unwrap();
        store.save_workflow(&workflow("c", Trigger::Webhook, true)).await.unwrap();

        let active: Vec<String> = store
            .list_active()
            .await
            .unwrap()
            .into_iter()
            .map(|w| w.id)
            .collect();
        assert_eq!(active, vec!["a", "c"]);
    }

    #[tokio::test]
    async fn save_is_an_upsert() {
        let store = store().await;
        let mut wf = workflow("a", Trigger::Manual, true);
        store.save_workflow(&wf).await.unwrap();

        wf.name = "renamed".into();
        wf.active = false;
        store.save_workflow(&wf).await.unwrap();

        let listed = store.list_workflows().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, "renamed");
        assert!(!listed[0].active);
        assert_eq!(store.get_workflow("a").await.unwrap(), Some(wf));
    }

    #[tokio::test]
    async fn delete_reports_whether_a_row_existed() {
        let store = store().await;
        store.save_workflow(&workflow("a", Trigger::Manual, true)).await.unwrap();

        assert!(store.delete_workflow("a").await.unwrap());
        assert!(!store.delete_workflow("a").await.unwrap());
        assert_eq!(store.get_workflow_definition("a").await.unwrap(), None);
    }
}
