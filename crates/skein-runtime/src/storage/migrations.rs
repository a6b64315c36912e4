//! Schema migrations for the PostgreSQL store.
//!
//! Only one process applies migrations at a time; the runner holds a
//! PostgreSQL advisory lock on a single connection while it works.

use std::collections::HashSet;

use sqlx::postgres::PgConnection;
use sqlx::PgPool;
use tracing::{debug, info, warn};

use skein_core::{Result, SkeinError};

/// Advisory lock ID ("SKEIN" in ASCII).
const MIGRATION_LOCK_ID: i64 = 0x534B45494E;

const SKEIN_SCHEMA_SQL: &str = include_str!("../../migrations/0001_skein.sql");

/// A single migration.
#[derive(Debug, Clone)]
pub struct Migration {
    /// Unique name, e.g. `0001_skein`.
    pub name: String,
    pub sql: String,
}

impl Migration {
    pub fn new(name: impl Into<String>, sql: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sql: sql.into(),
        }
    }
}

/// Migrations shipped with skein, in order.
pub fn builtin_migrations() -> Vec<Migration> {
    vec![Migration::new("0001_skein", SKEIN_SCHEMA_SQL)]
}

/// Applies pending migrations.
pub struct MigrationRunner {
    pool: PgPool,
}

impl MigrationRunner {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Apply every built-in migration that has not been applied yet.
    ///
    /// Returns the names of the migrations applied by this call.
    pub async fn run(&self) -> Result<Vec<String>> {
        let mut conn = self.pool.acquire().await?;

        debug!("Acquiring migration lock");
        sqlx::query("SELECT pg_advisory_lock($1)")
            .bind(MIGRATION_LOCK_ID)
            .execute(&mut *conn)
            .await
            .map_err(|e| {
                SkeinError::Database(format!("Failed to acquire migration lock: {}", e))
            })?;

        let result = apply_pending(&mut conn).await;

        if let Err(e) = sqlx::query("SELECT pg_advisory_unlock($1)")
            .bind(MIGRATION_LOCK_ID)
            .execute(&mut *conn)
            .await
        {
            warn!("Failed to release migration lock: {}", e);
        }

        result
    }
}

async fn apply_pending(conn: &mut PgConnection) -> Result<Vec<String>> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS skein_migrations (
            id SERIAL PRIMARY KEY,
            name VARCHAR(255) UNIQUE NOT NULL,
            applied_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
    )
    .execute(&mut *conn)
    .await
    .map_err(|e| SkeinError::Database(format!("Failed to create migrations table: {}", e)))?;

    let rows: Vec<(String,)> = sqlx::query_as("SELECT name FROM skein_migrations")
        .fetch_all(&mut *conn)
        .await?;
    let applied: HashSet<String> = rows.into_iter().map(|(name,)| name).collect();
    debug!("Already applied migrations: {:?}", applied);

    let mut newly_applied = Vec::new();
    for migration in builtin_migrations() {
        if applied.contains(&migration.name) {
            continue;
        }

        info!("Applying migration: {}", migration.name);
        sqlx::raw_sql(&migration.sql)
            .execute(&mut *conn)
            .await
            .map_err(|e| {
                SkeinError::Database(format!(
                    "Failed to apply migration '{}': {}",
                    migration.name, e
                ))
            })?;

        sqlx::query("INSERT INTO skein_migrations (name) VALUES ($1)")
            .bind(&migration.name)
            .execute(&mut *conn)
            .await?;

        newly_applied.push(migration.name);
    }

    Ok(newly_applied)
}
