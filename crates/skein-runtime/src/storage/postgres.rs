//! PostgreSQL storage backend.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use uuid::Uuid;

use skein_core::config::DatabaseConfig;
use skein_core::store::{StepLock, WorkflowStore};
use skein_core::workflow::{
    ActivityKey, ActivityStep, QueueToken, WorkflowQueueItem, WorkflowStep,
};
use skein_core::{Result, SkeinError};

use super::migrations::MigrationRunner;

const WORKFLOW_COLUMNS: &str = "id, workflow_type, input, status, result, error, \
     created_at, last_updated, queue_token";

const ACTIVITY_COLUMNS: &str = "workflow_id, sequence_id, kind, name, key_hash, key, eta, \
     status, parameters, result, error, queue_token, created_at, last_updated";

/// Storage backed by PostgreSQL.
///
/// Several processes may share one database: wake-ups are leased with
/// `FOR UPDATE SKIP LOCKED` and step locks live in a lease table.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Open a connection pool from configuration.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.pool_size)
            .acquire_timeout(Duration::from_secs(config.pool_timeout_secs))
            .connect(&config.url)
            .await
            .map_err(|e| SkeinError::Database(format!("Failed to connect: {}", e)))?;

        let store = Self::new(pool);
        if config.run_migrations {
            store.migrate().await?;
        }
        Ok(store)
    }

    /// Apply pending schema migrations.
    pub async fn migrate(&self) -> Result<Vec<String>> {
        MigrationRunner::new(self.pool.clone()).run().await
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn workflow_from_row(row: &PgRow) -> Result<WorkflowStep> {
    let status: String = row.try_get("status")?;
    let queue_token: Option<Uuid> = row.try_get("queue_token")?;
    Ok(WorkflowStep {
        id: row.try_get("id")?,
        workflow_type: row.try_get("workflow_type")?,
        input: row.try_get("input")?,
        status: status.parse()?,
        result: row.try_get("result")?,
        error: row.try_get("error")?,
        created_at: row.try_get("created_at")?,
        last_updated: row.try_get("last_updated")?,
        queue_token: queue_token.map(QueueToken::from_uuid),
    })
}

fn activity_from_row(row: &PgRow) -> Result<ActivityStep> {
    let kind: String = row.try_get("kind")?;
    let status: String = row.try_get("status")?;
    let queue_token: Option<Uuid> = row.try_get("queue_token")?;
    Ok(ActivityStep {
        workflow_id: row.try_get("workflow_id")?,
        sequence_id: row.try_get("sequence_id")?,
        kind: kind.parse()?,
        name: row.try_get("name")?,
        key_hash: row.try_get("key_hash")?,
        key: row.try_get("key")?,
        eta: row.try_get("eta")?,
        status: status.parse()?,
        parameters: row.try_get("parameters")?,
        result: row.try_get("result")?,
        error: row.try_get("error")?,
        queue_token: queue_token.map(QueueToken::from_uuid),
        created_at: row.try_get("created_at")?,
        last_updated: row.try_get("last_updated")?,
    })
}

fn queue_item_from_row(row: &PgRow) -> Result<WorkflowQueueItem> {
    let token: Uuid = row.try_get("token")?;
    Ok(WorkflowQueueItem {
        workflow_id: row.try_get("workflow_id")?,
        token: QueueToken::from_uuid(token),
        due_at: row.try_get("due_at")?,
        leased_until: row.try_get("leased_until")?,
    })
}

fn to_interval(duration: Duration) -> Result<chrono::Duration> {
    chrono::Duration::from_std(duration)
        .map_err(|e| SkeinError::Config(format!("invalid duration: {}", e)))
}

#[async_trait]
impl WorkflowStore for PgStore {
    async fn insert_workflow(&self, workflow: &WorkflowStep) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO skein_workflows (
                id, workflow_type, input, status, result, error,
                created_at, last_updated, queue_token
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(&workflow.id)
        .bind(&workflow.workflow_type)
        .bind(&workflow.input)
        .bind(workflow.status.as_str())
        .bind(&workflow.result)
        .bind(&workflow.error)
        .bind(workflow.created_at)
        .bind(workflow.last_updated)
        .bind(workflow.queue_token.map(|t| t.as_uuid()))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_workflow(&self, workflow_id: &str) -> Result<Option<WorkflowStep>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM skein_workflows WHERE id = $1",
            WORKFLOW_COLUMNS
        ))
        .bind(workflow_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(workflow_from_row).transpose()
    }

    async fn update_workflow(&self, workflow: &WorkflowStep) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE skein_workflows
            SET status = $2, result = $3, error = $4, last_updated = $5, queue_token = $6
            WHERE id = $1 AND status NOT IN ('completed', 'failed')
            "#,
        )
        .bind(&workflow.id)
        .bind(workflow.status.as_str())
        .bind(&workflow.result)
        .bind(&workflow.error)
        .bind(workflow.last_updated)
        .bind(workflow.queue_token.map(|t| t.as_uuid()))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            return Ok(true);
        }

        let exists = sqlx::query("SELECT 1 FROM skein_workflows WHERE id = $1")
            .bind(&workflow.id)
            .fetch_optional(&self.pool)
            .await?;
        match exists {
            Some(_) => Ok(false),
            None => Err(SkeinError::NotFound(format!(
                "workflow {} not found",
                workflow.id
            ))),
        }
    }

    async fn insert_activity(&self, step: &ActivityStep) -> Result<ActivityStep> {
        // Concurrent inserts can compute the same sequence number; the
        // primary key turns the loser into a Conflict and the caller re-reads.
        let sequence_id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO skein_activities (
                workflow_id, sequence_id, kind, name, key_hash, key, eta,
                status, parameters, result, error, queue_token, created_at, last_updated
            )
            SELECT $1, COALESCE(MAX(sequence_id), 0) + 1, $2, $3, $4, $5, $6,
                   $7, $8, $9, $10, $11, $12, $13
            FROM skein_activities
            WHERE workflow_id = $1
            RETURNING sequence_id
            "#,
        )
        .bind(&step.workflow_id)
        .bind(step.kind.as_str())
        .bind(&step.name)
        .bind(&step.key_hash)
        .bind(&step.key)
        .bind(step.eta)
        .bind(step.status.as_str())
        .bind(&step.parameters)
        .bind(&step.result)
        .bind(&step.error)
        .bind(step.queue_token.map(|t| t.as_uuid()))
        .bind(step.created_at)
        .bind(step.last_updated)
        .fetch_one(&self.pool)
        .await?;

        let mut stored = step.clone();
        stored.sequence_id = sequence_id;
        Ok(stored)
    }

    async fn get_activity(
        &self,
        workflow_id: &str,
        key: &ActivityKey,
    ) -> Result<Option<ActivityStep>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM skein_activities \
             WHERE workflow_id = $1 AND kind = $2 AND key_hash = $3 AND key = $4",
            ACTIVITY_COLUMNS
        ))
        .bind(workflow_id)
        .bind(key.kind.as_str())
        .bind(&key.key_hash)
        .bind(&key.key)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(activity_from_row).transpose()
    }

    async fn update_activity(&self, step: &ActivityStep) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE skein_activities
            SET eta = $3, status = $4, result = $5, error = $6,
                queue_token = $7, last_updated = $8
            WHERE workflow_id = $1 AND sequence_id = $2
            "#,
        )
        .bind(&step.workflow_id)
        .bind(step.sequence_id)
        .bind(step.eta)
        .bind(step.status.as_str())
        .bind(&step.result)
        .bind(&step.error)
        .bind(step.queue_token.map(|t| t.as_uuid()))
        .bind(step.last_updated)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(SkeinError::NotFound(format!(
                "step {} of workflow {} not found",
                step.sequence_id, step.workflow_id
            )));
        }
        Ok(())
    }

    async fn list_activities(&self, workflow_id: &str) -> Result<Vec<ActivityStep>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM skein_activities WHERE workflow_id = $1 ORDER BY sequence_id",
            ACTIVITY_COLUMNS
        ))
        .bind(workflow_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(activity_from_row).collect()
    }

    async fn get_event(
        &self,
        workflow_id: &str,
        event_name: &str,
    ) -> Result<Option<ActivityStep>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM skein_activities \
             WHERE workflow_id = $1 AND kind = 'event' AND status = 'running' \
               AND parameters @> jsonb_build_array($2::text) \
             ORDER BY sequence_id LIMIT 1",
            ACTIVITY_COLUMNS
        ))
        .bind(workflow_id)
        .bind(event_name)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(activity_from_row).transpose()
    }

    async fn enqueue_wakeup(
        &self,
        workflow_id: &str,
        due: DateTime<Utc>,
        existing: Option<&QueueToken>,
    ) -> Result<QueueToken> {
        let token = QueueToken::new();
        let mut tx = self.pool.begin().await?;

        if let Some(existing) = existing {
            sqlx::query("DELETE FROM skein_queue WHERE token = $1")
                .bind(existing.as_uuid())
                .execute(&mut *tx)
                .await?;
        }

        sqlx::query("INSERT INTO skein_queue (token, workflow_id, due_at) VALUES ($1, $2, $3)")
            .bind(token.as_uuid())
            .bind(workflow_id)
            .bind(due)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(token)
    }

    async fn remove_wakeups(&self, tokens: &[QueueToken]) -> Result<()> {
        if tokens.is_empty() {
            return Ok(());
        }
        let ids: Vec<Uuid> = tokens.iter().map(|t| t.as_uuid()).collect();
        sqlx::query("DELETE FROM skein_queue WHERE token = ANY($1)")
            .bind(&ids)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn due_wakeups(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        lease: Duration,
    ) -> Result<Vec<WorkflowQueueItem>> {
        let leased_until = now + to_interval(lease)?;
        let rows = sqlx::query(
            r#"
            WITH due AS (
                SELECT token
                FROM skein_queue
                WHERE due_at <= $1
                  AND (leased_until IS NULL OR leased_until <= $1)
                ORDER BY due_at ASC
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE skein_queue
            SET leased_until = $3
            WHERE token IN (SELECT token FROM due)
            RETURNING token, workflow_id, due_at, leased_until
            "#,
        )
        .bind(now)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .bind(leased_until)
        .fetch_all(&self.pool)
        .await?;

        let mut items = rows
            .iter()
            .map(queue_item_from_row)
            .collect::<Result<Vec<_>>>()?;
        items.sort_by_key(|item| item.due_at);
        Ok(items)
    }

    async fn pending_wakeups(&self, workflow_id: &str) -> Result<Vec<WorkflowQueueItem>> {
        let rows = sqlx::query(
            r#"
            SELECT token, workflow_id, due_at, leased_until
            FROM skein_queue
            WHERE workflow_id = $1
            ORDER BY due_at ASC
            "#,
        )
        .bind(workflow_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(queue_item_from_row).collect()
    }

    async fn acquire_lock(
        &self,
        workflow_id: &str,
        sequence_id: i64,
        ttl: Duration,
    ) -> Result<Option<StepLock>> {
        let holder = Uuid::new_v4();
        let expires_at: Option<DateTime<Utc>> = sqlx::query_scalar(
            r#"
            INSERT INTO skein_locks (workflow_id, sequence_id, holder, expires_at)
            VALUES ($1, $2, $3, NOW() + make_interval(secs => $4))
            ON CONFLICT (workflow_id, sequence_id) DO UPDATE SET
                holder = EXCLUDED.holder,
                expires_at = EXCLUDED.expires_at
            WHERE skein_locks.expires_at <= NOW()
            RETURNING expires_at
            "#,
        )
        .bind(workflow_id)
        .bind(sequence_id)
        .bind(holder)
        .bind(ttl.as_secs_f64())
        .fetch_optional(&self.pool)
        .await?;

        Ok(expires_at.map(|expires_at| StepLock {
            workflow_id: workflow_id.to_string(),
            sequence_id,
            holder,
            expires_at,
        }))
    }

    async fn release_lock(&self, lock: &StepLock) -> Result<()> {
        sqlx::query(
            "DELETE FROM skein_locks WHERE workflow_id = $1 AND sequence_id = $2 AND holder = $3",
        )
        .bind(&lock.workflow_id)
        .bind(lock.sequence_id)
        .bind(lock.holder)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
