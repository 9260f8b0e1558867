use anyhow::Result;
use sqlx::SqlitePool;
use tracing::info;

/// Database schema version
const CURRENT_SCHEMA_VERSION: i64 = 1;

/// Run all necessary database migrations
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at INTEGER NOT NULL
        )",
    )
    .execute(pool)
    .await?;

    let current: i64 =
        sqlx::query_scalar("SELECT COALESCE(MAX(version), 0) FROM schema_version")
            .fetch_one(pool)
            .await?;

    for version in (current + 1)..=CURRENT_SCHEMA_VERSION {
        info!("Applying migration to version {}", version);
        apply_migration(pool, version).await?;
        sqlx::query("INSERT INTO schema_version (version, applied_at) VALUES (?1, ?2)")
            .bind(version)
            .bind(chrono::Utc::now().timestamp_millis())
            .execute(pool)
            .await?;
    }

    Ok(())
}

async fn apply_migration(pool: &SqlitePool, version: i64) -> Result<()> {
    match version {
        1 => apply_migration_v1(pool).await,
        _ => Err(anyhow::anyhow!("Unknown migration version: {}", version)),
    }
}

/// Migration v1: Initial schema
async fn apply_migration_v1(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        "CREATE TABLE executions (
            id TEXT PRIMARY KEY,
            workflow_id TEXT NOT NULL,
            status TEXT NOT NULL,
            started_at INTEGER NOT NULL,
            completed_at INTEGER,
            urls_processed INTEGER NOT NULL DEFAULT 0,
            urls_discovered INTEGER NOT NULL DEFAULT 0,
            items_extracted INTEGER NOT NULL DEFAULT 0,
            errors INTEGER NOT NULL DEFAULT 0,
            phase_stats TEXT NOT NULL DEFAULT '{}'
        )",
    )
    .execute(pool)
    .await?;

    // Frontier tasks are never deleted; they form the audit trail.
    sqlx::query(
        "CREATE TABLE frontier_tasks (
            id TEXT PRIMARY KEY,
            execution_id TEXT NOT NULL,
            phase_id TEXT NOT NULL,
            url TEXT NOT NULL,
            url_hash TEXT NOT NULL,
            state TEXT NOT NULL,
            depth INTEGER NOT NULL DEFAULT 0,
            attempts INTEGER NOT NULL DEFAULT 0,
            fail_reason TEXT,
            created_at INTEGER NOT NULL,
            claimed_at INTEGER,
            finished_at INTEGER,
            UNIQUE (execution_id, url_hash)
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE TABLE extracted_items (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            execution_id TEXT NOT NULL,
            task_id TEXT NOT NULL,
            phase_id TEXT NOT NULL,
            data_json TEXT NOT NULL,
            extracted_at INTEGER NOT NULL
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE TABLE node_executions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            execution_id TEXT NOT NULL,
            task_id TEXT NOT NULL,
            node_id TEXT NOT NULL,
            status TEXT NOT NULL,
            error TEXT,
            duration_ms INTEGER NOT NULL,
            started_at INTEGER NOT NULL
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE TABLE error_logs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            execution_id TEXT NOT NULL,
            task_id TEXT,
            category TEXT NOT NULL,
            message TEXT NOT NULL,
            created_at INTEGER NOT NULL
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE TABLE recovery_rules (
            id TEXT PRIMARY KEY,
            pattern TEXT NOT NULL,
            conditions_json TEXT NOT NULL DEFAULT '{}',
            action TEXT NOT NULL,
            action_params_json TEXT NOT NULL DEFAULT '{}',
            priority INTEGER NOT NULL DEFAULT 0,
            max_retries INTEGER NOT NULL DEFAULT 3,
            retry_delay_ms INTEGER NOT NULL DEFAULT 2000,
            success_count INTEGER NOT NULL DEFAULT 0,
            failure_count INTEGER NOT NULL DEFAULT 0,
            is_learned INTEGER NOT NULL DEFAULT 0,
            enabled INTEGER NOT NULL DEFAULT 1,
            created_at INTEGER NOT NULL
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE TABLE recovery_config (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE TABLE incidents (
            id TEXT PRIMARY KEY,
            execution_id TEXT NOT NULL,
            task_id TEXT NOT NULL,
            error_pattern TEXT NOT NULL,
            attempts_json TEXT NOT NULL DEFAULT '[]',
            total_attempts INTEGER NOT NULL DEFAULT 0,
            diagnostics_json TEXT,
            status TEXT NOT NULL DEFAULT 'open',
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )",
    )
    .execute(pool)
    .await?;

    for index in [
        "CREATE INDEX idx_frontier_claim ON frontier_tasks (execution_id, phase_id, state)",
        "CREATE INDEX idx_frontier_state ON frontier_tasks (state, claimed_at)",
        "CREATE INDEX idx_items_execution ON extracted_items (execution_id)",
        "CREATE INDEX idx_node_exec_task ON node_executions (execution_id, task_id)",
        "CREATE INDEX idx_error_logs_execution ON error_logs (execution_id)",
        "CREATE INDEX idx_rules_priority ON recovery_rules (enabled, priority)",
        "CREATE INDEX idx_incidents_status ON incidents (status)",
    ] {
        sqlx::query(index).execute(pool).await?;
    }

    Ok(())
}
