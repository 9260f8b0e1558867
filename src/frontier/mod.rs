use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{CrawlError, CrawlResult};
use crate::storage::Storage;

/// Frontier task lifecycle. Tasks are never deleted; completed and failed
/// rows stay behind as the audit trail of the crawl.
///
/// Seed URLs enter as `pending`; URLs found by extraction nodes enter as
/// `discovered` so the trail distinguishes operator input from crawl
/// output. Both are claimable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskState {
    Pending,
    Discovered,
    Processing,
    Completed,
    Failed,
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Discovered => write!(f, "discovered"),
            Self::Processing => write!(f, "processing"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl FromStr for TaskState {
    type Err = CrawlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "discovered" => Ok(Self::Discovered),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(CrawlError::internal(format!("invalid task state: {}", other))),
        }
    }
}

/// One claimable unit of crawl work.
#[derive(Debug, Clone)]
pub struct FrontierTask {
    pub id: String,
    pub execution_id: String,
    pub phase_id: String,
    pub url: String,
    pub state: TaskState,
    pub depth: u32,
    pub attempts: u32,
    pub fail_reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Durable URL queue with per-execution dedup and lease-based claims.
///
/// Claims use a visibility timeout: a `processing` row whose `claimed_at`
/// is older than the timeout is treated as abandoned by a dead worker and
/// handed out again.
#[derive(Clone)]
pub struct FrontierQueue {
    pool: SqlitePool,
    visibility_timeout: Duration,
}

impl FrontierQueue {
    pub fn new(storage: &Storage, visibility_timeout: Duration) -> Self {
        Self { pool: storage.pool().clone(), visibility_timeout }
    }

    /// Enqueue one seed URL. Returns `true` if the URL was new for this
    /// execution; a duplicate (after normalization) is silently dropped
    /// and returns `false`.
    pub async fn enqueue(
        &self,
        execution_id: &str,
        phase_id: &str,
        url: &str,
        depth: u32,
    ) -> CrawlResult<bool> {
        self.enqueue_with_state(execution_id, phase_id, url, depth, TaskState::Pending)
            .await
    }

    /// Enqueue a URL found by an extraction node. Same dedup as `enqueue`,
    /// but the row enters as `discovered` so provenance stays visible.
    pub async fn enqueue_discovered(
        &self,
        execution_id: &str,
        phase_id: &str,
        url: &str,
        depth: u32,
    ) -> CrawlResult<bool> {
        self.enqueue_with_state(execution_id, phase_id, url, depth, TaskState::Discovered)
            .await
    }

    async fn enqueue_with_state(
        &self,
        execution_id: &str,
        phase_id: &str,
        url: &str,
        depth: u32,
        state: TaskState,
    ) -> CrawlResult<bool> {
        let normalized = match normalize_url(url) {
            Some(normalized) => normalized,
            None => {
                warn!("Dropping unparseable URL: {}", url);
                return Ok(false);
            }
        };
        let hash = url_hash(&normalized);

        let result = sqlx::query(
            "INSERT INTO frontier_tasks
                (id, execution_id, phase_id, url, url_hash, state, depth, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT (execution_id, url_hash) DO NOTHING",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(execution_id)
        .bind(phase_id)
        .bind(&normalized)
        .bind(&hash)
        .bind(state.to_string())
        .bind(depth as i64)
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Enqueue many URLs; returns how many were new.
    pub async fn enqueue_batch(
        &self,
        execution_id: &str,
        phase_id: &str,
        urls: &[String],
        depth: u32,
    ) -> CrawlResult<u64> {
        let mut inserted = 0;
        for url in urls {
            if self.enqueue(execution_id, phase_id, url, depth).await? {
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    /// Claim up to `limit` tasks for one phase. The claim is a single
    /// UPDATE over a subselect, so two workers racing on the same rows
    /// can never both win; SQLite serializes the statement.
    pub async fn dequeue(
        &self,
        execution_id: &str,
        phase_id: &str,
        limit: u32,
    ) -> CrawlResult<Vec<FrontierTask>> {
        let now = Utc::now().timestamp_millis();
        let cutoff = now - self.visibility_timeout.as_millis() as i64;

        let rows = sqlx::query(
            "UPDATE frontier_tasks
             SET state = 'processing', claimed_at = ?1, attempts = attempts + 1
             WHERE id IN (
                 SELECT id FROM frontier_tasks
                 WHERE execution_id = ?2 AND phase_id = ?3
                   AND (state IN ('pending', 'discovered')
                        OR (state = 'processing' AND claimed_at < ?4))
                 ORDER BY created_at
                 LIMIT ?5
             )
             RETURNING id, execution_id, phase_id, url, state, depth, attempts,
                       fail_reason, created_at",
        )
        .bind(now)
        .bind(execution_id)
        .bind(phase_id)
        .bind(cutoff)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let tasks = rows
            .into_iter()
            .map(row_to_task)
            .collect::<CrawlResult<Vec<_>>>()?;
        if !tasks.is_empty() {
            debug!("Claimed {} task(s) for phase {}", tasks.len(), phase_id);
        }
        Ok(tasks)
    }

    pub async fn complete(&self, task_id: &str) -> CrawlResult<()> {
        self.finish(task_id, TaskState::Completed, None).await
    }

    pub async fn fail(&self, task_id: &str, reason: &str) -> CrawlResult<()> {
        self.finish(task_id, TaskState::Failed, Some(reason)).await
    }

    async fn finish(
        &self,
        task_id: &str,
        state: TaskState,
        reason: Option<&str>,
    ) -> CrawlResult<()> {
        sqlx::query(
            "UPDATE frontier_tasks
             SET state = ?1, fail_reason = ?2, finished_at = ?3
             WHERE id = ?4 AND state = 'processing'",
        )
        .bind(state.to_string())
        .bind(reason)
        .bind(Utc::now().timestamp_millis())
        .bind(task_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Put a claimed task back for another attempt. Attempts stay counted;
    /// the recovery rule's max_retries caps them at the executor level.
    pub async fn release_for_retry(&self, task_id: &str) -> CrawlResult<()> {
        sqlx::query(
            "UPDATE frontier_tasks SET state = 'pending', claimed_at = NULL
             WHERE id = ?1 AND state = 'processing'",
        )
        .bind(task_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Claimable tasks for one phase: pending, discovered, plus
    /// lease-expired processing rows.
    pub async fn pending_count(&self, execution_id: &str, phase_id: &str) -> CrawlResult<i64> {
        let cutoff =
            Utc::now().timestamp_millis() - self.visibility_timeout.as_millis() as i64;
        let count = sqlx::query_scalar(
            "SELECT COUNT(*) FROM frontier_tasks
             WHERE execution_id = ?1 AND phase_id = ?2
               AND (state IN ('pending', 'discovered')
                    OR (state = 'processing' AND claimed_at < ?3))",
        )
        .bind(execution_id)
        .bind(phase_id)
        .bind(cutoff)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    /// Any tasks still in flight for one phase?
    pub async fn in_flight_count(&self, execution_id: &str, phase_id: &str) -> CrawlResult<i64> {
        let count = sqlx::query_scalar(
            "SELECT COUNT(*) FROM frontier_tasks
             WHERE execution_id = ?1 AND phase_id = ?2 AND state = 'processing'",
        )
        .bind(execution_id)
        .bind(phase_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    /// State counts per phase for one execution.
    pub async fn stats(
        &self,
        execution_id: &str,
    ) -> CrawlResult<HashMap<(String, TaskState), i64>> {
        let rows = sqlx::query(
            "SELECT phase_id, state, COUNT(*) AS n
             FROM frontier_tasks WHERE execution_id = ?1
             GROUP BY phase_id, state",
        )
        .bind(execution_id)
        .fetch_all(&self.pool)
        .await?;

        let mut stats = HashMap::new();
        for row in rows {
            let phase_id: String = row.try_get("phase_id")?;
            let state: String = row.try_get("state")?;
            let count: i64 = row.try_get("n")?;
            stats.insert((phase_id, state.parse()?), count);
        }
        Ok(stats)
    }

    pub async fn get(&self, task_id: &str) -> CrawlResult<Option<FrontierTask>> {
        let row = sqlx::query(
            "SELECT id, execution_id, phase_id, url, state, depth, attempts,
                    fail_reason, created_at
             FROM frontier_tasks WHERE id = ?1",
        )
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(row_to_task).transpose()
    }
}

fn row_to_task(row: sqlx::sqlite::SqliteRow) -> CrawlResult<FrontierTask> {
    let state: String = row.try_get("state")?;
    let depth: i64 = row.try_get("depth")?;
    let attempts: i64 = row.try_get("attempts")?;
    let created_at: i64 = row.try_get("created_at")?;
    Ok(FrontierTask {
        id: row.try_get("id")?,
        execution_id: row.try_get("execution_id")?,
        phase_id: row.try_get("phase_id")?,
        url: row.try_get("url")?,
        state: state.parse()?,
        depth: depth as u32,
        attempts: attempts as u32,
        fail_reason: row.try_get("fail_reason")?,
        created_at: DateTime::from_timestamp_millis(created_at).unwrap_or_else(Utc::now),
    })
}

/// Canonical form used for dedup: lowercase scheme and host, default
/// ports dropped, fragment stripped, query kept as-is.
pub fn normalize_url(raw: &str) -> Option<String> {
    let mut parsed = url::Url::parse(raw).ok()?;
    // Url already lowercases scheme and host and drops default ports.
    parsed.set_fragment(None);
    Some(parsed.to_string())
}

fn url_hash(normalized: &str) -> String {
    let digest = Sha256::digest(normalized.as_bytes());
    format!("{:x}", digest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::test_support::scratch_storage;

    async fn queue_with_timeout(
        storage: &Storage,
        timeout: Duration,
    ) -> FrontierQueue {
        FrontierQueue::new(storage, timeout)
    }

    #[tokio::test]
    async fn duplicate_urls_enqueue_once() {
        let (storage, _dir) = scratch_storage().await;
        let queue = queue_with_timeout(&storage, Duration::from_secs(60)).await;

        assert!(queue.enqueue("exec-1", "p1", "https://example.com/a", 0).await.unwrap());
        assert!(!queue.enqueue("exec-1", "p1", "https://example.com/a", 0).await.unwrap());
        // Fragment and default port differences normalize away.
        assert!(!queue
            .enqueue("exec-1", "p1", "HTTPS://EXAMPLE.COM:443/a#top", 0)
            .await
            .unwrap());
        // A different execution gets its own dedup scope.
        assert!(queue.enqueue("exec-2", "p1", "https://example.com/a", 0).await.unwrap());

        assert_eq!(queue.pending_count("exec-1", "p1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn query_strings_stay_distinct() {
        let (storage, _dir) = scratch_storage().await;
        let queue = queue_with_timeout(&storage, Duration::from_secs(60)).await;

        assert!(queue.enqueue("exec-1", "p1", "https://example.com/a?page=1", 0).await.unwrap());
        assert!(queue.enqueue("exec-1", "p1", "https://example.com/a?page=2", 0).await.unwrap());
        assert_eq!(queue.pending_count("exec-1", "p1").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn discovered_urls_keep_their_provenance_until_claimed() {
        let (storage, _dir) = scratch_storage().await;
        let queue = queue_with_timeout(&storage, Duration::from_secs(60)).await;

        queue.enqueue("exec-1", "p1", "https://example.com/seed", 0).await.unwrap();
        assert!(queue
            .enqueue_discovered("exec-1", "p1", "https://example.com/found", 1)
            .await
            .unwrap());
        // Dedup spans both entry states.
        assert!(!queue
            .enqueue_discovered("exec-1", "p1", "https://example.com/seed", 1)
            .await
            .unwrap());

        let stats = queue.stats("exec-1").await.unwrap();
        assert_eq!(stats.get(&("p1".to_string(), TaskState::Pending)), Some(&1));
        assert_eq!(stats.get(&("p1".to_string(), TaskState::Discovered)), Some(&1));

        // Both entry states count as claimable and are handed out together.
        assert_eq!(queue.pending_count("exec-1", "p1").await.unwrap(), 2);
        let claimed = queue.dequeue("exec-1", "p1", 10).await.unwrap();
        assert_eq!(claimed.len(), 2);
        assert!(claimed.iter().all(|t| t.state == TaskState::Processing));
    }

    #[tokio::test]
    async fn claims_never_hand_a_task_to_two_workers() {
        let (storage, _dir) = scratch_storage().await;
        let queue = queue_with_timeout(&storage, Duration::from_secs(60)).await;

        for i in 0..10 {
            queue
                .enqueue("exec-1", "p1", &format!("https://example.com/{}", i), 0)
                .await
                .unwrap();
        }

        let (first, second) = tokio::join!(
            queue.dequeue("exec-1", "p1", 10),
            queue.dequeue("exec-1", "p1", 10),
        );
        let first = first.unwrap();
        let second = second.unwrap();

        assert_eq!(first.len() + second.len(), 10);
        let mut ids: Vec<_> = first.iter().chain(second.iter()).map(|t| t.id.clone()).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 10);
    }

    #[tokio::test]
    async fn expired_lease_is_reclaimed() {
        let (storage, _dir) = scratch_storage().await;
        let queue = queue_with_timeout(&storage, Duration::from_millis(50)).await;

        queue.enqueue("exec-1", "p1", "https://example.com/a", 0).await.unwrap();
        let claimed = queue.dequeue("exec-1", "p1", 1).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].attempts, 1);

        // Within the lease the task is invisible.
        assert!(queue.dequeue("exec-1", "p1", 1).await.unwrap().is_empty());

        tokio::time::sleep(Duration::from_millis(80)).await;
        let reclaimed = queue.dequeue("exec-1", "p1", 1).await.unwrap();
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].id, claimed[0].id);
        assert_eq!(reclaimed[0].attempts, 2);
    }

    #[tokio::test]
    async fn completed_tasks_stay_in_the_table() {
        let (storage, _dir) = scratch_storage().await;
        let queue = queue_with_timeout(&storage, Duration::from_secs(60)).await;

        queue.enqueue("exec-1", "p1", "https://example.com/a", 0).await.unwrap();
        let task = &queue.dequeue("exec-1", "p1", 1).await.unwrap()[0];
        queue.complete(&task.id).await.unwrap();

        let stored = queue.get(&task.id).await.unwrap().unwrap();
        assert_eq!(stored.state, TaskState::Completed);
        assert!(queue.dequeue("exec-1", "p1", 1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_task_records_reason() {
        let (storage, _dir) = scratch_storage().await;
        let queue = queue_with_timeout(&storage, Duration::from_secs(60)).await;

        queue.enqueue("exec-1", "p1", "https://example.com/a", 0).await.unwrap();
        let task = &queue.dequeue("exec-1", "p1", 1).await.unwrap()[0];
        queue.fail(&task.id, "no_elements_found").await.unwrap();

        let stored = queue.get(&task.id).await.unwrap().unwrap();
        assert_eq!(stored.state, TaskState::Failed);
        assert_eq!(stored.fail_reason.as_deref(), Some("no_elements_found"));
    }

    #[tokio::test]
    async fn release_for_retry_makes_task_claimable_again() {
        let (storage, _dir) = scratch_storage().await;
        let queue = queue_with_timeout(&storage, Duration::from_secs(60)).await;

        queue.enqueue("exec-1", "p1", "https://example.com/a", 0).await.unwrap();
        let task = &queue.dequeue("exec-1", "p1", 1).await.unwrap()[0];
        queue.release_for_retry(&task.id).await.unwrap();

        let again = queue.dequeue("exec-1", "p1", 1).await.unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].attempts, 2);
    }
}
