use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use tracing::info;

pub mod migrations;

use crate::config::DatabaseConfig;
use crate::error::{CrawlError, CrawlResult};
use crate::recovery::{Incident, IncidentStatus, RecoveryRule};

/// Storage layer over one SQLite pool; repositories are cheap handles
/// cloning the pool.
#[derive(Clone)]
pub struct Storage {
    pool: SqlitePool,
}

impl Storage {
    pub async fn open(config: &DatabaseConfig) -> CrawlResult<Self> {
        if let Some(parent) = config.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| CrawlError::internal(format!("create data dir: {}", e)))?;
        }
        Self::open_at(&config.path, config.max_connections).await
    }

    pub async fn open_at(path: &Path, max_connections: u32) -> CrawlResult<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(std::time::Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        migrations::run_migrations(&pool)
            .await
            .map_err(|e| CrawlError::internal(format!("migrations: {}", e)))?;

        info!("Storage opened: {}", path.display());
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn executions(&self) -> ExecutionRepository {
        ExecutionRepository { pool: self.pool.clone() }
    }

    pub fn items(&self) -> ExtractedItemsRepository {
        ExtractedItemsRepository { pool: self.pool.clone() }
    }

    pub fn node_runs(&self) -> NodeExecutionRepository {
        NodeExecutionRepository { pool: self.pool.clone() }
    }

    pub fn recovery(&self) -> ErrorRecoveryRepository {
        ErrorRecoveryRepository { pool: self.pool.clone() }
    }
}

/// Execution lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionStatus {
    Running,
    Completed,
    Stopped,
    Failed,
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Stopped => write!(f, "stopped"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl FromStr for ExecutionStatus {
    type Err = CrawlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "stopped" => Ok(Self::Stopped),
            "failed" => Ok(Self::Failed),
            other => Err(CrawlError::internal(format!("invalid execution status: {}", other))),
        }
    }
}

/// Per-phase aggregate counters, stored as an additive JSON map.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseStats {
    pub processed: i64,
    pub errors: i64,
    pub duration_ms: i64,
}

impl PhaseStats {
    pub fn add(&mut self, other: &PhaseStats) {
        self.processed += other.processed;
        self.errors += other.errors;
        self.duration_ms += other.duration_ms;
    }
}

/// One run of a workflow.
#[derive(Debug, Clone)]
pub struct Execution {
    pub id: String,
    pub workflow_id: String,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub urls_processed: i64,
    pub urls_discovered: i64,
    pub items_extracted: i64,
    pub errors: i64,
    pub phase_stats: HashMap<String, PhaseStats>,
}

/// Accumulated counter deltas for one execution, applied in a single
/// batched write.
#[derive(Debug, Clone, Default)]
pub struct StatsUpdate {
    pub execution_id: String,
    pub urls_processed: i64,
    pub urls_discovered: i64,
    pub items_extracted: i64,
    pub errors: i64,
    pub phases: HashMap<String, PhaseStats>,
}

/// Error-log row buffered by the aggregator.
#[derive(Debug, Clone)]
pub struct ErrorLogRow {
    pub execution_id: String,
    pub task_id: Option<String>,
    pub category: String,
    pub message: String,
}

#[derive(Clone)]
pub struct ExecutionRepository {
    pool: SqlitePool,
}

impl ExecutionRepository {
    pub async fn create(&self, execution_id: &str, workflow_id: &str) -> CrawlResult<Execution> {
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO executions (id, workflow_id, status, started_at) VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(execution_id)
        .bind(workflow_id)
        .bind(ExecutionStatus::Running.to_string())
        .bind(now.timestamp_millis())
        .execute(&self.pool)
        .await?;

        Ok(Execution {
            id: execution_id.to_string(),
            workflow_id: workflow_id.to_string(),
            status: ExecutionStatus::Running,
            started_at: now,
            completed_at: None,
            urls_processed: 0,
            urls_discovered: 0,
            items_extracted: 0,
            errors: 0,
            phase_stats: HashMap::new(),
        })
    }

    pub async fn get(&self, execution_id: &str) -> CrawlResult<Execution> {
        let row = sqlx::query(
            "SELECT id, workflow_id, status, started_at, completed_at,
                    urls_processed, urls_discovered, items_extracted, errors, phase_stats
             FROM executions WHERE id = ?1",
        )
        .bind(execution_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| CrawlError::ExecutionNotFound { execution_id: execution_id.to_string() })?;

        let status: String = row.try_get("status")?;
        let phase_stats: String = row.try_get("phase_stats")?;
        let started_at: i64 = row.try_get("started_at")?;
        let completed_at: Option<i64> = row.try_get("completed_at")?;

        Ok(Execution {
            id: row.try_get("id")?,
            workflow_id: row.try_get("workflow_id")?,
            status: status.parse()?,
            started_at: DateTime::from_timestamp_millis(started_at).unwrap_or_else(Utc::now),
            completed_at: completed_at.and_then(DateTime::from_timestamp_millis),
            urls_processed: row.try_get("urls_processed")?,
            urls_discovered: row.try_get("urls_discovered")?,
            items_extracted: row.try_get("items_extracted")?,
            errors: row.try_get("errors")?,
            phase_stats: serde_json::from_str(&phase_stats).unwrap_or_default(),
        })
    }

    /// Apply N executions' worth of counter deltas in one transaction.
    /// Counters add; phase entries merge into the existing per-phase map,
    /// never overwrite it, so concurrent flushes for different phases of
    /// the same execution cannot stomp each other.
    pub async fn batch_update_stats(&self, updates: &[StatsUpdate]) -> CrawlResult<()> {
        if updates.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;

        for update in updates {
            sqlx::query(
                "UPDATE executions SET
                    urls_processed = urls_processed + ?1,
                    urls_discovered = urls_discovered + ?2,
                    items_extracted = items_extracted + ?3,
                    errors = errors + ?4
                 WHERE id = ?5",
            )
            .bind(update.urls_processed)
            .bind(update.urls_discovered)
            .bind(update.items_extracted)
            .bind(update.errors)
            .bind(&update.execution_id)
            .execute(&mut *tx)
            .await?;

            if !update.phases.is_empty() {
                let current: Option<String> =
                    sqlx::query_scalar("SELECT phase_stats FROM executions WHERE id = ?1")
                        .bind(&update.execution_id)
                        .fetch_optional(&mut *tx)
                        .await?;
                let mut merged: HashMap<String, PhaseStats> = current
                    .as_deref()
                    .and_then(|s| serde_json::from_str(s).ok())
                    .unwrap_or_default();
                for (phase_id, delta) in &update.phases {
                    merged.entry(phase_id.clone()).or_default().add(delta);
                }
                sqlx::query("UPDATE executions SET phase_stats = ?1 WHERE id = ?2")
                    .bind(serde_json::to_string(&merged).unwrap_or_else(|_| "{}".to_string()))
                    .bind(&update.execution_id)
                    .execute(&mut *tx)
                    .await?;
            }
        }

        tx.commit().await?;
        Ok(())
    }

    pub async fn update_phase_stats(
        &self,
        execution_id: &str,
        phase_id: &str,
        delta: PhaseStats,
    ) -> CrawlResult<()> {
        let mut phases = HashMap::new();
        phases.insert(phase_id.to_string(), delta);
        self.batch_update_stats(&[StatsUpdate {
            execution_id: execution_id.to_string(),
            phases,
            ..StatsUpdate::default()
        }])
        .await
    }

    pub async fn batch_insert_errors(&self, rows: &[ErrorLogRow]) -> CrawlResult<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let now = Utc::now().timestamp_millis();
        let mut tx = self.pool.begin().await?;
        for row in rows {
            sqlx::query(
                "INSERT INTO error_logs (execution_id, task_id, category, message, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )
            .bind(&row.execution_id)
            .bind(&row.task_id)
            .bind(&row.category)
            .bind(&row.message)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Terminal transition; `completed_at` is set exactly once.
    pub async fn complete(&self, execution_id: &str, status: ExecutionStatus) -> CrawlResult<()> {
        sqlx::query(
            "UPDATE executions SET status = ?1, completed_at = ?2
             WHERE id = ?3 AND completed_at IS NULL",
        )
        .bind(status.to_string())
        .bind(Utc::now().timestamp_millis())
        .bind(execution_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn error_log_count(&self, execution_id: &str) -> CrawlResult<i64> {
        let count =
            sqlx::query_scalar("SELECT COUNT(*) FROM error_logs WHERE execution_id = ?1")
                .bind(execution_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }
}

#[derive(Clone)]
pub struct ExtractedItemsRepository {
    pool: SqlitePool,
}

impl ExtractedItemsRepository {
    pub async fn store_batch(
        &self,
        execution_id: &str,
        task_id: &str,
        phase_id: &str,
        items: &[serde_json::Value],
    ) -> CrawlResult<()> {
        if items.is_empty() {
            return Ok(());
        }
        let now = Utc::now().timestamp_millis();
        let mut tx = self.pool.begin().await?;
        for item in items {
            sqlx::query(
                "INSERT INTO extracted_items (execution_id, task_id, phase_id, data_json, extracted_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )
            .bind(execution_id)
            .bind(task_id)
            .bind(phase_id)
            .bind(item.to_string())
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn for_execution(&self, execution_id: &str) -> CrawlResult<Vec<serde_json::Value>> {
        let rows = sqlx::query(
            "SELECT data_json FROM extracted_items WHERE execution_id = ?1 ORDER BY id",
        )
        .bind(execution_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .filter_map(|row| {
                let json: String = row.try_get("data_json").ok()?;
                serde_json::from_str(&json).ok()
            })
            .collect())
    }

    pub async fn count(&self, execution_id: &str) -> CrawlResult<i64> {
        let count =
            sqlx::query_scalar("SELECT COUNT(*) FROM extracted_items WHERE execution_id = ?1")
                .bind(execution_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }
}

/// Per-node audit row.
#[derive(Debug, Clone)]
pub struct NodeExecutionRecord {
    pub execution_id: String,
    pub task_id: String,
    pub node_id: String,
    pub status: String,
    pub error: Option<String>,
    pub duration_ms: i64,
}

#[derive(Clone)]
pub struct NodeExecutionRepository {
    pool: SqlitePool,
}

impl NodeExecutionRepository {
    pub async fn record(&self, record: &NodeExecutionRecord) -> CrawlResult<()> {
        sqlx::query(
            "INSERT INTO node_executions
                (execution_id, task_id, node_id, status, error, duration_ms, started_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )
        .bind(&record.execution_id)
        .bind(&record.task_id)
        .bind(&record.node_id)
        .bind(&record.status)
        .bind(&record.error)
        .bind(record.duration_ms)
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn for_task(&self, task_id: &str) -> CrawlResult<Vec<NodeExecutionRecord>> {
        let rows = sqlx::query(
            "SELECT execution_id, task_id, node_id, status, error, duration_ms
             FROM node_executions WHERE task_id = ?1 ORDER BY id",
        )
        .bind(task_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok(NodeExecutionRecord {
                    execution_id: row.try_get("execution_id")?,
                    task_id: row.try_get("task_id")?,
                    node_id: row.try_get("node_id")?,
                    status: row.try_get("status")?,
                    error: row.try_get("error")?,
                    duration_ms: row.try_get("duration_ms")?,
                })
            })
            .collect()
    }
}

/// Rule CRUD, the recovery key/value config store, and incidents.
#[derive(Clone)]
pub struct ErrorRecoveryRepository {
    pool: SqlitePool,
}

impl ErrorRecoveryRepository {
    pub async fn insert_rule(&self, rule: &RecoveryRule) -> CrawlResult<()> {
        sqlx::query(
            "INSERT INTO recovery_rules
                (id, pattern, conditions_json, action, action_params_json, priority,
                 max_retries, retry_delay_ms, success_count, failure_count,
                 is_learned, enabled, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        )
        .bind(&rule.id)
        .bind(&rule.pattern)
        .bind(serde_json::to_string(&rule.conditions).unwrap_or_else(|_| "{}".to_string()))
        .bind(rule.action.as_str())
        .bind(serde_json::to_string(&rule.action_params).unwrap_or_else(|_| "{}".to_string()))
        .bind(rule.priority)
        .bind(rule.max_retries as i64)
        .bind(rule.retry_delay_ms as i64)
        .bind(rule.success_count as i64)
        .bind(rule.failure_count as i64)
        .bind(rule.is_learned)
        .bind(rule.enabled)
        .bind(rule.created_at.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_rule_enabled(&self, rule_id: &str, enabled: bool) -> CrawlResult<()> {
        sqlx::query("UPDATE recovery_rules SET enabled = ?1 WHERE id = ?2")
            .bind(enabled)
            .bind(rule_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Atomic outcome increment; the engine reads these back at snapshot
    /// refresh, never mid-classification.
    pub async fn record_outcome(&self, rule_id: &str, success: bool) -> CrawlResult<()> {
        let column = if success { "success_count" } else { "failure_count" };
        let sql = format!(
            "UPDATE recovery_rules SET {} = {} + 1 WHERE id = ?1",
            column, column
        );
        sqlx::query(&sql).bind(rule_id).execute(&self.pool).await?;
        Ok(())
    }

    pub async fn load_rules(&self) -> CrawlResult<Vec<RecoveryRule>> {
        let rows = sqlx::query(
            "SELECT id, pattern, conditions_json, action, action_params_json, priority,
                    max_retries, retry_delay_ms, success_count, failure_count,
                    is_learned, enabled, created_at
             FROM recovery_rules",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let conditions_json: String = row.try_get("conditions_json")?;
                let params_json: String = row.try_get("action_params_json")?;
                let action: String = row.try_get("action")?;
                let created_at: i64 = row.try_get("created_at")?;
                let max_retries: i64 = row.try_get("max_retries")?;
                let retry_delay_ms: i64 = row.try_get("retry_delay_ms")?;
                let success_count: i64 = row.try_get("success_count")?;
                let failure_count: i64 = row.try_get("failure_count")?;
                Ok(RecoveryRule {
                    id: row.try_get("id")?,
                    pattern: row.try_get("pattern")?,
                    conditions: serde_json::from_str(&conditions_json).unwrap_or_default(),
                    action: action.parse()?,
                    action_params: serde_json::from_str(&params_json).unwrap_or_default(),
                    priority: row.try_get("priority")?,
                    max_retries: max_retries as u32,
                    retry_delay_ms: retry_delay_ms as u64,
                    success_count: success_count as u64,
                    failure_count: failure_count as u64,
                    is_learned: row.try_get("is_learned")?,
                    enabled: row.try_get("enabled")?,
                    created_at: DateTime::from_timestamp_millis(created_at)
                        .unwrap_or_else(Utc::now),
                })
            })
            .collect()
    }

    pub async fn set_config(&self, key: &str, value: &str) -> CrawlResult<()> {
        sqlx::query(
            "INSERT INTO recovery_config (key, value) VALUES (?1, ?2)
             ON CONFLICT (key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_config(&self, key: &str) -> CrawlResult<Option<String>> {
        let value = sqlx::query_scalar("SELECT value FROM recovery_config WHERE key = ?1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(value)
    }

    pub async fn create_incident(&self, incident: &Incident) -> CrawlResult<()> {
        sqlx::query(
            "INSERT INTO incidents
                (id, execution_id, task_id, error_pattern, attempts_json,
                 total_attempts, diagnostics_json, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        )
        .bind(&incident.id)
        .bind(&incident.execution_id)
        .bind(&incident.task_id)
        .bind(&incident.error_pattern)
        .bind(serde_json::to_string(&incident.attempts).unwrap_or_else(|_| "[]".to_string()))
        .bind(incident.total_attempts as i64)
        .bind(&incident.diagnostics_json)
        .bind(incident.status.to_string())
        .bind(incident.created_at.timestamp_millis())
        .bind(incident.created_at.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Operator-side status transition; the hot crawl path never updates
    /// incidents after creation.
    pub async fn update_incident_status(
        &self,
        incident_id: &str,
        status: IncidentStatus,
    ) -> CrawlResult<()> {
        sqlx::query("UPDATE incidents SET status = ?1, updated_at = ?2 WHERE id = ?3")
            .bind(status.to_string())
            .bind(Utc::now().timestamp_millis())
            .bind(incident_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn list_incidents(&self, status: Option<IncidentStatus>) -> CrawlResult<Vec<Incident>> {
        let rows = match status {
            Some(status) => {
                sqlx::query(
                    "SELECT id, execution_id, task_id, error_pattern, attempts_json,
                            total_attempts, diagnostics_json, status, created_at
                     FROM incidents WHERE status = ?1 ORDER BY created_at DESC",
                )
                .bind(status.to_string())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    "SELECT id, execution_id, task_id, error_pattern, attempts_json,
                            total_attempts, diagnostics_json, status, created_at
                     FROM incidents ORDER BY created_at DESC",
                )
                .fetch_all(&self.pool)
                .await?
            }
        };

        rows.into_iter()
            .map(|row| {
                let attempts_json: String = row.try_get("attempts_json")?;
                let status: String = row.try_get("status")?;
                let created_at: i64 = row.try_get("created_at")?;
                let total_attempts: i64 = row.try_get("total_attempts")?;
                Ok(Incident {
                    id: row.try_get("id")?,
                    execution_id: row.try_get("execution_id")?,
                    task_id: row.try_get("task_id")?,
                    error_pattern: row.try_get("error_pattern")?,
                    attempts: serde_json::from_str(&attempts_json).unwrap_or_default(),
                    total_attempts: total_attempts as u32,
                    diagnostics_json: row.try_get("diagnostics_json")?,
                    status: status.parse()?,
                    created_at: DateTime::from_timestamp_millis(created_at)
                        .unwrap_or_else(Utc::now),
                })
            })
            .collect()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Scratch database backed by a tempfile; the guard keeps the file
    /// alive for the test's duration.
    pub async fn scratch_storage() -> (Storage, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open_at(&dir.path().join("test.db"), 5).await.unwrap();
        (storage, dir)
    }
}
