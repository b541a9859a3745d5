//! Durable local cache for jobs, checkpoints, and execution events.
//!
//! Backed by one SQLite file in WAL mode. The store lets the agent
//! survive backend outages (completed-but-unreported results) and
//! crashes (per-node checkpoints). Mutating operations return a success
//! flag and never panic the caller; only initialization is fatal, so a
//! corrupt file refuses to start the agent.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

use crate::domain::errors::{RobotError, RobotResult};
use crate::domain::models::checkpoint::CheckpointState;

/// Local lifecycle of a cached job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheStatus {
    Cached,
    InProgress,
    /// Finished locally, pending backend sync.
    Completed,
    /// Failed locally, pending backend sync.
    Failed,
    /// Backend acknowledged the outcome.
    Synced,
}

impl CacheStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cached => "cached",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Synced => "synced",
        }
    }

    pub fn parse_str(s: &str) -> Option<Self> {
        match s {
            "cached" => Some(Self::Cached),
            "in_progress" => Some(Self::InProgress),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "synced" => Some(Self::Synced),
            _ => None,
        }
    }
}

/// One `cached_jobs` row.
#[derive(Debug, Clone)]
pub struct CachedJobRecord {
    pub job_id: String,
    pub workflow: serde_json::Value,
    pub original_status: String,
    pub cache_status: CacheStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub sync_attempts: i64,
    pub created_at: DateTime<Utc>,
}

/// One `execution_history` row.
#[derive(Debug, Clone)]
pub struct JobEventRecord {
    pub job_id: String,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

pub struct OfflineStore {
    pool: SqlitePool,
    robot_id: String,
}

impl OfflineStore {
    /// Open (or create) the store at `db_path`.
    ///
    /// Fails on unreadable paths or a corrupt database file.
    pub async fn open(db_path: &Path, robot_id: impl Into<String>) -> RobotResult<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| RobotError::Storage(format!("create {}: {}", parent.display(), e)))?;
            }
        }
        let url = format!("sqlite:{}", db_path.display());
        Self::open_url(&url, robot_id).await
    }

    /// In-memory store for tests.
    pub async fn in_memory(robot_id: impl Into<String>) -> RobotResult<Self> {
        Self::open_url("sqlite::memory:", robot_id).await
    }

    async fn open_url(url: &str, robot_id: impl Into<String>) -> RobotResult<Self> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(|e| RobotError::Storage(format!("invalid database url: {}", e)))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| RobotError::Storage(format!("open offline store: {}", e)))?;

        let store = Self {
            pool,
            robot_id: robot_id.into(),
        };
        store.verify_integrity().await?;
        store.init_schema().await?;
        Ok(store)
    }

    async fn verify_integrity(&self) -> RobotResult<()> {
        let row = sqlx::query("PRAGMA quick_check")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| RobotError::Storage(format!("integrity check failed: {}", e)))?;
        let verdict: String = row
            .try_get(0)
            .map_err(|e| RobotError::Storage(format!("integrity check failed: {}", e)))?;
        if verdict != "ok" {
            return Err(RobotError::Storage(format!(
                "offline store is corrupt: {}",
                verdict
            )));
        }
        Ok(())
    }

    async fn init_schema(&self) -> RobotResult<()> {
        let statements = [
            r#"CREATE TABLE IF NOT EXISTS cached_jobs (
                job_id TEXT PRIMARY KEY,
                robot_id TEXT NOT NULL,
                workflow_json TEXT NOT NULL,
                original_status TEXT NOT NULL DEFAULT 'pending',
                cached_status TEXT NOT NULL DEFAULT 'cached',
                started_at TEXT,
                completed_at TEXT,
                result_json TEXT,
                error_message TEXT,
                sync_attempts INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            )"#,
            r#"CREATE TABLE IF NOT EXISTS job_checkpoints (
                job_id TEXT NOT NULL,
                checkpoint_id TEXT NOT NULL,
                node_id TEXT NOT NULL,
                state_json TEXT NOT NULL,
                created_at TEXT NOT NULL,
                PRIMARY KEY (job_id, checkpoint_id)
            )"#,
            r#"CREATE TABLE IF NOT EXISTS execution_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                job_id TEXT NOT NULL,
                event_type TEXT NOT NULL,
                payload_json TEXT,
                created_at TEXT NOT NULL
            )"#,
            "CREATE INDEX IF NOT EXISTS idx_cached_jobs_status ON cached_jobs (cached_status)",
            "CREATE INDEX IF NOT EXISTS idx_checkpoints_job ON job_checkpoints (job_id)",
            "CREATE INDEX IF NOT EXISTS idx_history_job ON execution_history (job_id)",
        ];
        for stmt in statements {
            sqlx::query(stmt)
                .execute(&self.pool)
                .await
                .map_err(|e| RobotError::Storage(format!("init schema: {}", e)))?;
        }
        Ok(())
    }

    /// Cache a claimed job before execution starts.
    pub async fn cache_job(
        &self,
        job_id: &str,
        workflow: &serde_json::Value,
        original_status: &str,
    ) -> bool {
        let result = sqlx::query(
            r#"INSERT INTO cached_jobs
               (job_id, robot_id, workflow_json, original_status, cached_status, created_at)
               VALUES (?, ?, ?, ?, 'cached', ?)
               ON CONFLICT(job_id) DO UPDATE SET
                   workflow_json = excluded.workflow_json,
                   original_status = excluded.original_status,
                   cached_status = 'cached'"#,
        )
        .bind(job_id)
        .bind(&self.robot_id)
        .bind(workflow.to_string())
        .bind(original_status)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await;
        self.check("cache_job", job_id, result)
    }

    pub async fn mark_in_progress(&self, job_id: &str) -> bool {
        let result = sqlx::query(
            "UPDATE cached_jobs SET cached_status = 'in_progress', started_at = ? WHERE job_id = ?",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(job_id)
        .execute(&self.pool)
        .await;
        self.check("mark_in_progress", job_id, result)
    }

    /// Record the local outcome. Idempotent: a re-call with the same
    /// job-id overwrites the previous outcome.
    pub async fn mark_completed(
        &self,
        job_id: &str,
        success: bool,
        result: Option<&serde_json::Value>,
        error: Option<&str>,
    ) -> bool {
        let status = if success { "completed" } else { "failed" };
        let outcome = sqlx::query(
            r#"UPDATE cached_jobs SET
                   cached_status = ?,
                   completed_at = ?,
                   result_json = ?,
                   error_message = ?
               WHERE job_id = ?"#,
        )
        .bind(status)
        .bind(Utc::now().to_rfc3339())
        .bind(result.map(|v| v.to_string()))
        .bind(error)
        .bind(job_id)
        .execute(&self.pool)
        .await;
        self.check("mark_completed", job_id, outcome)
    }

    /// Finished-but-unreported jobs, oldest completion first.
    pub async fn get_jobs_to_sync(&self) -> Vec<CachedJobRecord> {
        self.fetch_jobs(
            "SELECT * FROM cached_jobs WHERE cached_status IN ('completed', 'failed')
             ORDER BY completed_at ASC",
        )
        .await
    }

    pub async fn mark_synced(&self, job_id: &str) -> bool {
        let result =
            sqlx::query("UPDATE cached_jobs SET cached_status = 'synced' WHERE job_id = ?")
                .bind(job_id)
                .execute(&self.pool)
                .await;
        self.check("mark_synced", job_id, result)
    }

    pub async fn increment_sync_attempts(&self, job_id: &str) -> bool {
        let result =
            sqlx::query("UPDATE cached_jobs SET sync_attempts = sync_attempts + 1 WHERE job_id = ?")
                .bind(job_id)
                .execute(&self.pool)
                .await;
        self.check("increment_sync_attempts", job_id, result)
    }

    /// Jobs that were executing when the process died; crash recovery
    /// input.
    pub async fn get_in_progress_jobs(&self) -> Vec<CachedJobRecord> {
        self.fetch_jobs("SELECT * FROM cached_jobs WHERE cached_status = 'in_progress'")
            .await
    }

    pub async fn get_cached_jobs(&self) -> Vec<CachedJobRecord> {
        self.fetch_jobs("SELECT * FROM cached_jobs ORDER BY created_at ASC")
            .await
    }

    async fn fetch_jobs(&self, sql: &str) -> Vec<CachedJobRecord> {
        match sqlx::query(sql).fetch_all(&self.pool).await {
            Ok(rows) => rows.iter().filter_map(row_to_job).collect(),
            Err(e) => {
                warn!(error = %e, "offline store query failed");
                Vec::new()
            }
        }
    }

    pub async fn save_checkpoint(
        &self,
        job_id: &str,
        checkpoint_id: &str,
        node_id: &str,
        state: &CheckpointState,
    ) -> bool {
        let state_json = match serde_json::to_string(state) {
            Ok(json) => json,
            Err(e) => {
                warn!(job_id, error = %e, "checkpoint serialization failed");
                return false;
            }
        };
        let result = sqlx::query(
            r#"INSERT OR REPLACE INTO job_checkpoints
               (job_id, checkpoint_id, node_id, state_json, created_at)
               VALUES (?, ?, ?, ?, ?)"#,
        )
        .bind(job_id)
        .bind(checkpoint_id)
        .bind(node_id)
        .bind(state_json)
        .bind(state.created_at.to_rfc3339())
        .execute(&self.pool)
        .await;
        self.check("save_checkpoint", job_id, result)
    }

    /// The resume point: latest checkpoint by creation order.
    pub async fn get_latest_checkpoint(&self, job_id: &str) -> Option<CheckpointState> {
        let row = sqlx::query(
            "SELECT state_json FROM job_checkpoints WHERE job_id = ?
             ORDER BY created_at DESC, rowid DESC LIMIT 1",
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await;
        match row {
            Ok(Some(row)) => {
                let json: String = row.try_get("state_json").ok()?;
                match serde_json::from_str(&json) {
                    Ok(state) => Some(state),
                    Err(e) => {
                        warn!(job_id, error = %e, "checkpoint deserialization failed");
                        None
                    }
                }
            }
            Ok(None) => None,
            Err(e) => {
                warn!(job_id, error = %e, "checkpoint lookup failed");
                None
            }
        }
    }

    pub async fn checkpoint_count(&self, job_id: &str) -> u64 {
        match sqlx::query("SELECT COUNT(*) AS n FROM job_checkpoints WHERE job_id = ?")
            .bind(job_id)
            .fetch_one(&self.pool)
            .await
        {
            Ok(row) => row.try_get::<i64, _>("n").unwrap_or(0) as u64,
            Err(e) => {
                warn!(job_id, error = %e, "checkpoint count failed");
                0
            }
        }
    }

    /// Remove all checkpoints for a job. Called only after the backend
    /// acknowledged the completion or the job was explicitly cancelled.
    /// A second call is a no-op.
    pub async fn clear_checkpoints(&self, job_id: &str) -> bool {
        let result = sqlx::query("DELETE FROM job_checkpoints WHERE job_id = ?")
            .bind(job_id)
            .execute(&self.pool)
            .await;
        self.check("clear_checkpoints", job_id, result)
    }

    pub async fn log_event(
        &self,
        job_id: &str,
        event_type: &str,
        payload: serde_json::Value,
    ) -> bool {
        let result = sqlx::query(
            "INSERT INTO execution_history (job_id, event_type, payload_json, created_at)
             VALUES (?, ?, ?, ?)",
        )
        .bind(job_id)
        .bind(event_type)
        .bind(payload.to_string())
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await;
        self.check("log_event", job_id, result)
    }

    pub async fn get_job_history(&self, job_id: &str) -> Vec<JobEventRecord> {
        let rows = sqlx::query(
            "SELECT job_id, event_type, payload_json, created_at FROM execution_history
             WHERE job_id = ? ORDER BY id ASC",
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await;
        match rows {
            Ok(rows) => rows
                .iter()
                .filter_map(|row| {
                    Some(JobEventRecord {
                        job_id: row.try_get("job_id").ok()?,
                        event_type: row.try_get("event_type").ok()?,
                        payload: row
                            .try_get::<Option<String>, _>("payload_json")
                            .ok()?
                            .and_then(|s| serde_json::from_str(&s).ok())
                            .unwrap_or(serde_json::Value::Null),
                        created_at: parse_ts(row.try_get("created_at").ok()?)?,
                    })
                })
                .collect(),
            Err(e) => {
                warn!(job_id, error = %e, "history query failed");
                Vec::new()
            }
        }
    }

    /// Delete synced jobs older than `age_days`; returns rows removed.
    pub async fn cleanup_old_synced_jobs(&self, age_days: u32) -> u64 {
        let cutoff = (Utc::now() - chrono::Duration::days(i64::from(age_days))).to_rfc3339();
        match sqlx::query(
            "DELETE FROM cached_jobs WHERE cached_status = 'synced' AND completed_at < ?",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await
        {
            Ok(done) => done.rows_affected(),
            Err(e) => {
                warn!(error = %e, "cleanup failed");
                0
            }
        }
    }

    /// Row counts per cache status.
    pub async fn queue_stats(&self) -> HashMap<String, i64> {
        match sqlx::query(
            "SELECT cached_status, COUNT(*) AS n FROM cached_jobs GROUP BY cached_status",
        )
        .fetch_all(&self.pool)
        .await
        {
            Ok(rows) => rows
                .iter()
                .filter_map(|row| {
                    Some((row.try_get("cached_status").ok()?, row.try_get("n").ok()?))
                })
                .collect(),
            Err(e) => {
                warn!(error = %e, "queue stats failed");
                HashMap::new()
            }
        }
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    fn check(
        &self,
        op: &str,
        job_id: &str,
        result: Result<sqlx::sqlite::SqliteQueryResult, sqlx::Error>,
    ) -> bool {
        match result {
            Ok(_) => true,
            Err(e) => {
                warn!(op, job_id, error = %e, "offline store write failed");
                false
            }
        }
    }
}

fn parse_ts(raw: String) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&raw)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

fn row_to_job(row: &sqlx::sqlite::SqliteRow) -> Option<CachedJobRecord> {
    let cache_status: String = row.try_get("cached_status").ok()?;
    Some(CachedJobRecord {
        job_id: row.try_get("job_id").ok()?,
        workflow: row
            .try_get::<String, _>("workflow_json")
            .ok()
            .and_then(|s| serde_json::from_str(&s).ok())?,
        original_status: row.try_get("original_status").ok()?,
        cache_status: CacheStatus::parse_str(&cache_status)?,
        started_at: row
            .try_get::<Option<String>, _>("started_at")
            .ok()?
            .and_then(parse_ts),
        completed_at: row
            .try_get::<Option<String>, _>("completed_at")
            .ok()?
            .and_then(parse_ts),
        result: row
            .try_get::<Option<String>, _>("result_json")
            .ok()?
            .and_then(|s| serde_json::from_str(&s).ok()),
        error_message: row.try_get("error_message").ok()?,
        sync_attempts: row.try_get("sync_attempts").ok()?,
        created_at: parse_ts(row.try_get("created_at").ok()?)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> OfflineStore {
        OfflineStore::in_memory("robot-test").await.unwrap()
    }

    fn doc() -> serde_json::Value {
        serde_json::json!({"nodes": {}, "metadata": {"name": "t"}})
    }

    #[tokio::test]
    async fn test_cache_and_progress_lifecycle() {
        let store = store().await;
        assert!(store.cache_job("j1", &doc(), "pending").await);
        assert!(store.mark_in_progress("j1").await);

        let in_progress = store.get_in_progress_jobs().await;
        assert_eq!(in_progress.len(), 1);
        assert_eq!(in_progress[0].cache_status, CacheStatus::InProgress);
        assert!(in_progress[0].started_at.is_some());
    }

    #[tokio::test]
    async fn test_mark_completed_is_idempotent() {
        let store = store().await;
        store.cache_job("j1", &doc(), "pending").await;
        let result = serde_json::json!({"ok": true});

        assert!(store.mark_completed("j1", true, Some(&result), None).await);
        assert!(store.mark_completed("j1", true, Some(&result), None).await);

        let pending = store.get_jobs_to_sync().await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].cache_status, CacheStatus::Completed);
        assert_eq!(pending[0].result, Some(result));
    }

    #[tokio::test]
    async fn test_sync_flow() {
        let store = store().await;
        store.cache_job("j1", &doc(), "pending").await;
        store.cache_job("j2", &doc(), "pending").await;
        store.mark_completed("j1", true, None, None).await;
        store.mark_completed("j2", false, None, Some("node x failed")).await;

        let pending = store.get_jobs_to_sync().await;
        assert_eq!(pending.len(), 2);

        assert!(store.increment_sync_attempts("j1").await);
        assert!(store.mark_synced("j1").await);

        let pending = store.get_jobs_to_sync().await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].job_id, "j2");
        assert_eq!(pending[0].error_message.as_deref(), Some("node x failed"));

        let stats = store.queue_stats().await;
        assert_eq!(stats.get("synced"), Some(&1));
        assert_eq!(stats.get("failed"), Some(&1));
    }

    #[tokio::test]
    async fn test_checkpoint_latest_and_clear() {
        let store = store().await;

        let mut first = CheckpointState::new("j1", "demo");
        first.current_node_id = "a".into();
        first.created_at = Utc::now() - chrono::Duration::seconds(10);
        let mut second = CheckpointState::new("j1", "demo");
        second.current_node_id = "b".into();

        store
            .save_checkpoint("j1", &first.checkpoint_id.clone(), "a", &first)
            .await;
        store
            .save_checkpoint("j1", &second.checkpoint_id.clone(), "b", &second)
            .await;
        assert_eq!(store.checkpoint_count("j1").await, 2);

        let latest = store.get_latest_checkpoint("j1").await.unwrap();
        assert_eq!(latest.current_node_id, "b");

        assert!(store.clear_checkpoints("j1").await);
        assert_eq!(store.checkpoint_count("j1").await, 0);
        // Second clear is a no-op, not an error.
        assert!(store.clear_checkpoints("j1").await);
        assert!(store.get_latest_checkpoint("j1").await.is_none());
    }

    #[tokio::test]
    async fn test_event_log() {
        let store = store().await;
        store
            .log_event("j1", "job.started", serde_json::json!({"total_nodes": 3}))
            .await;
        store
            .log_event("j1", "job.completed", serde_json::json!({}))
            .await;
        store.log_event("j2", "job.started", serde_json::json!({})).await;

        let history = store.get_job_history("j1").await;
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].event_type, "job.started");
        assert_eq!(history[0].payload["total_nodes"], 3);
    }

    #[tokio::test]
    async fn test_cleanup_old_synced() {
        let store = store().await;
        store.cache_job("old", &doc(), "pending").await;
        store.mark_completed("old", true, None, None).await;
        store.mark_synced("old").await;
        // Backdate the completion.
        sqlx::query("UPDATE cached_jobs SET completed_at = ? WHERE job_id = 'old'")
            .bind((Utc::now() - chrono::Duration::days(30)).to_rfc3339())
            .execute(&store.pool)
            .await
            .unwrap();

        store.cache_job("fresh", &doc(), "pending").await;
        store.mark_completed("fresh", true, None, None).await;
        store.mark_synced("fresh").await;

        assert_eq!(store.cleanup_old_synced_jobs(7).await, 1);
        assert_eq!(store.get_cached_jobs().await.len(), 1);
    }

    #[tokio::test]
    async fn test_open_on_disk_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("offline_queue.db");

        {
            let store = OfflineStore::open(&path, "robot-1").await.unwrap();
            store.cache_job("j1", &doc(), "pending").await;
            store.close().await;
        }

        let store = OfflineStore::open(&path, "robot-1").await.unwrap();
        assert_eq!(store.get_cached_jobs().await.len(), 1);
    }
}
