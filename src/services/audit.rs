//! Append-only audit trail.
//!
//! One JSON record per line under `log_dir/audit/audit_<date>.jsonl`,
//! rotated by size with a fixed number of retained backups. Events also
//! mirror to tracing at a level mapped from their severity, and a
//! bounded in-memory ring supports querying recent events without
//! touching the filesystem.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;

/// Audit event vocabulary. String forms are dotted `<category>.<event>`
/// names, stable across releases because downstream tooling filters on
/// them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditEventType {
    // Robot lifecycle
    RobotStarted,
    RobotStopped,
    RobotRegistered,
    // Connection
    ConnectionEstablished,
    ConnectionLost,
    ConnectionReconnecting,
    ConnectionFailed,
    // Job lifecycle
    JobReceived,
    JobClaimed,
    JobStarted,
    JobCompleted,
    JobFailed,
    JobCancelled,
    JobCached,
    JobSynced,
    // Execution
    WorkflowLoaded,
    NodeStarted,
    NodeCompleted,
    NodeFailed,
    NodeSkipped,
    NodeRetried,
    // Checkpoints
    CheckpointSaved,
    CheckpointRestored,
    CheckpointCleared,
    // Errors
    ErrorTransient,
    ErrorPermanent,
    ErrorUnknown,
    // Circuit breaker
    CircuitOpened,
    CircuitHalfOpen,
    CircuitClosed,
}

impl AuditEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RobotStarted => "robot.started",
            Self::RobotStopped => "robot.stopped",
            Self::RobotRegistered => "robot.registered",
            Self::ConnectionEstablished => "connection.established",
            Self::ConnectionLost => "connection.lost",
            Self::ConnectionReconnecting => "connection.reconnecting",
            Self::ConnectionFailed => "connection.failed",
            Self::JobReceived => "job.received",
            Self::JobClaimed => "job.claimed",
            Self::JobStarted => "job.started",
            Self::JobCompleted => "job.completed",
            Self::JobFailed => "job.failed",
            Self::JobCancelled => "job.cancelled",
            Self::JobCached => "job.cached",
            Self::JobSynced => "job.synced",
            Self::WorkflowLoaded => "execution.workflow_loaded",
            Self::NodeStarted => "execution.node_started",
            Self::NodeCompleted => "execution.node_completed",
            Self::NodeFailed => "execution.node_failed",
            Self::NodeSkipped => "execution.node_skipped",
            Self::NodeRetried => "execution.node_retried",
            Self::CheckpointSaved => "checkpoint.saved",
            Self::CheckpointRestored => "checkpoint.restored",
            Self::CheckpointCleared => "checkpoint.cleared",
            Self::ErrorTransient => "error.transient",
            Self::ErrorPermanent => "error.permanent",
            Self::ErrorUnknown => "error.unknown",
            Self::CircuitOpened => "circuit.opened",
            Self::CircuitHalfOpen => "circuit.half_open",
            Self::CircuitClosed => "circuit.closed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditSeverity {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl AuditSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Critical => "critical",
        }
    }
}

/// One audit record; serialized as a single JSONL line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub severity: AuditSeverity,
    pub message: String,
    pub robot_id: String,
    pub job_id: Option<String>,
    pub node_id: Option<String>,
    pub details: serde_json::Value,
}

/// Filter for querying the in-memory ring.
#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    pub event_types: Option<Vec<AuditEventType>>,
    pub job_id: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl AuditFilter {
    fn matches(&self, entry: &AuditEntry) -> bool {
        if let Some(ref types) = self.event_types {
            if !types.iter().any(|t| t.as_str() == entry.event_type) {
                return false;
            }
        }
        if let Some(ref job_id) = self.job_id {
            if entry.job_id.as_deref() != Some(job_id.as_str()) {
                return false;
            }
        }
        if let Some(since) = self.since {
            if entry.timestamp < since {
                return false;
            }
        }
        true
    }
}

const MAX_RING_ENTRIES: usize = 1000;

#[derive(Debug, Clone)]
pub struct AuditConfig {
    /// Rotate the active file once it reaches this size.
    pub max_file_bytes: u64,
    /// Rotated backups to retain per file.
    pub max_backups: u32,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            max_file_bytes: 10 * 1024 * 1024,
            max_backups: 5,
        }
    }
}

pub struct AuditLogger {
    dir: PathBuf,
    robot_id: String,
    config: AuditConfig,
    recent: Mutex<VecDeque<AuditEntry>>,
    write_lock: Mutex<()>,
}

impl AuditLogger {
    /// Create the logger, ensuring the audit directory exists.
    pub fn new(dir: impl Into<PathBuf>, robot_id: impl Into<String>, config: AuditConfig) -> std::io::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            robot_id: robot_id.into(),
            config,
            recent: Mutex::new(VecDeque::new()),
            write_lock: Mutex::new(()),
        })
    }

    fn active_path(&self) -> PathBuf {
        self.dir
            .join(format!("audit_{}.jsonl", Utc::now().format("%Y-%m-%d")))
    }

    /// Record an event.
    pub async fn log(
        &self,
        event_type: AuditEventType,
        severity: AuditSeverity,
        message: impl Into<String>,
        job_id: Option<&str>,
        node_id: Option<&str>,
        details: serde_json::Value,
    ) {
        let entry = AuditEntry {
            timestamp: Utc::now(),
            event_type: event_type.as_str().to_string(),
            severity,
            message: message.into(),
            robot_id: self.robot_id.clone(),
            job_id: job_id.map(String::from),
            node_id: node_id.map(String::from),
            details,
        };

        match severity {
            AuditSeverity::Debug => tracing::debug!(event = entry.event_type, "{}", entry.message),
            AuditSeverity::Info => tracing::info!(event = entry.event_type, "{}", entry.message),
            AuditSeverity::Warning => tracing::warn!(event = entry.event_type, "{}", entry.message),
            AuditSeverity::Error | AuditSeverity::Critical => {
                tracing::error!(event = entry.event_type, "{}", entry.message)
            }
        }

        {
            let mut recent = self.recent.lock().await;
            while recent.len() >= MAX_RING_ENTRIES {
                recent.pop_front();
            }
            recent.push_back(entry.clone());
        }

        if let Err(e) = self.write_entry(&entry).await {
            warn!(error = %e, "audit write failed");
        }
    }

    async fn write_entry(&self, entry: &AuditEntry) -> std::io::Result<()> {
        let line = serde_json::to_string(entry).map_err(std::io::Error::other)?;
        let _guard = self.write_lock.lock().await;

        let path = self.active_path();
        self.rotate_if_needed(&path).await?;

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.write_all(b"\n").await?;
        Ok(())
    }

    async fn rotate_if_needed(&self, path: &Path) -> std::io::Result<()> {
        let size = match tokio::fs::metadata(path).await {
            Ok(meta) => meta.len(),
            Err(_) => return Ok(()),
        };
        if size < self.config.max_file_bytes {
            return Ok(());
        }

        // Shift audit.jsonl.{n} up, dropping the oldest.
        let backup = |n: u32| PathBuf::from(format!("{}.{}", path.display(), n));
        let oldest = backup(self.config.max_backups);
        if oldest.exists() {
            tokio::fs::remove_file(&oldest).await?;
        }
        for n in (1..self.config.max_backups).rev() {
            let from = backup(n);
            if from.exists() {
                tokio::fs::rename(&from, backup(n + 1)).await?;
            }
        }
        tokio::fs::rename(path, backup(1)).await?;
        Ok(())
    }

    /// Most recent entries, newest last.
    pub async fn get_recent(&self, limit: usize) -> Vec<AuditEntry> {
        let recent = self.recent.lock().await;
        recent
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect()
    }

    pub async fn query(&self, filter: AuditFilter) -> Vec<AuditEntry> {
        let recent = self.recent.lock().await;
        let mut results: Vec<AuditEntry> = recent
            .iter()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect();
        if let Some(limit) = filter.limit {
            let skip = results.len().saturating_sub(limit);
            results.drain(..skip);
        }
        results
    }

    // Named helpers keep call sites terse and event payloads uniform.

    pub async fn robot_started(&self, details: serde_json::Value) {
        self.log(
            AuditEventType::RobotStarted,
            AuditSeverity::Info,
            "Robot agent started",
            None,
            None,
            details,
        )
        .await;
    }

    pub async fn robot_stopped(&self, reason: Option<&str>) {
        self.log(
            AuditEventType::RobotStopped,
            AuditSeverity::Info,
            "Robot agent stopped",
            None,
            None,
            serde_json::json!({ "reason": reason }),
        )
        .await;
    }

    pub async fn robot_registered(&self, hostname: &str) {
        self.log(
            AuditEventType::RobotRegistered,
            AuditSeverity::Info,
            format!("Robot registered from {}", hostname),
            None,
            None,
            serde_json::json!({ "hostname": hostname }),
        )
        .await;
    }

    pub async fn connection_established(&self) {
        self.log(
            AuditEventType::ConnectionEstablished,
            AuditSeverity::Info,
            "Backend connection established",
            None,
            None,
            serde_json::Value::Null,
        )
        .await;
    }

    pub async fn connection_lost(&self, reason: Option<&str>) {
        self.log(
            AuditEventType::ConnectionLost,
            AuditSeverity::Warning,
            "Backend connection lost",
            None,
            None,
            serde_json::json!({ "reason": reason }),
        )
        .await;
    }

    pub async fn connection_reconnecting(&self, attempt: u32) {
        self.log(
            AuditEventType::ConnectionReconnecting,
            AuditSeverity::Warning,
            format!("Reconnecting to backend (attempt {})", attempt),
            None,
            None,
            serde_json::json!({ "attempt": attempt }),
        )
        .await;
    }

    pub async fn job_received(&self, job_id: &str, workflow_name: &str) {
        self.log(
            AuditEventType::JobReceived,
            AuditSeverity::Info,
            format!("Job received: {}", workflow_name),
            Some(job_id),
            None,
            serde_json::json!({ "workflow_name": workflow_name }),
        )
        .await;
    }

    pub async fn job_claimed(&self, job_id: &str) {
        self.log(
            AuditEventType::JobClaimed,
            AuditSeverity::Info,
            "Job claimed",
            Some(job_id),
            None,
            serde_json::Value::Null,
        )
        .await;
    }

    pub async fn job_started(&self, job_id: &str, total_nodes: usize) {
        self.log(
            AuditEventType::JobStarted,
            AuditSeverity::Info,
            format!("Job started with {} nodes", total_nodes),
            Some(job_id),
            None,
            serde_json::json!({ "total_nodes": total_nodes }),
        )
        .await;
    }

    pub async fn job_completed(&self, job_id: &str, duration_ms: u64) {
        self.log(
            AuditEventType::JobCompleted,
            AuditSeverity::Info,
            format!("Job completed in {}ms", duration_ms),
            Some(job_id),
            None,
            serde_json::json!({ "duration_ms": duration_ms }),
        )
        .await;
    }

    pub async fn job_failed(&self, job_id: &str, error: &str, duration_ms: u64) {
        self.log(
            AuditEventType::JobFailed,
            AuditSeverity::Error,
            format!("Job failed: {}", error),
            Some(job_id),
            None,
            serde_json::json!({ "error": error, "duration_ms": duration_ms }),
        )
        .await;
    }

    pub async fn job_cancelled(&self, job_id: &str, reason: Option<&str>) {
        self.log(
            AuditEventType::JobCancelled,
            AuditSeverity::Warning,
            "Job cancelled",
            Some(job_id),
            None,
            serde_json::json!({ "reason": reason }),
        )
        .await;
    }

    pub async fn job_cached(&self, job_id: &str) {
        self.log(
            AuditEventType::JobCached,
            AuditSeverity::Info,
            "Job cached to offline store",
            Some(job_id),
            None,
            serde_json::Value::Null,
        )
        .await;
    }

    pub async fn job_synced(&self, job_id: &str) {
        self.log(
            AuditEventType::JobSynced,
            AuditSeverity::Info,
            "Cached job outcome synced to backend",
            Some(job_id),
            None,
            serde_json::Value::Null,
        )
        .await;
    }

    pub async fn node_started(&self, job_id: &str, node_id: &str, node_type: &str) {
        self.log(
            AuditEventType::NodeStarted,
            AuditSeverity::Debug,
            format!("Node started: {}", node_type),
            Some(job_id),
            Some(node_id),
            serde_json::json!({ "node_type": node_type }),
        )
        .await;
    }

    pub async fn node_completed(
        &self,
        job_id: &str,
        node_id: &str,
        node_type: &str,
        duration_ms: u64,
    ) {
        self.log(
            AuditEventType::NodeCompleted,
            AuditSeverity::Info,
            format!("Node completed: {}", node_type),
            Some(job_id),
            Some(node_id),
            serde_json::json!({ "node_type": node_type, "duration_ms": duration_ms }),
        )
        .await;
    }

    pub async fn node_failed(&self, job_id: &str, node_id: &str, node_type: &str, error: &str) {
        self.log(
            AuditEventType::NodeFailed,
            AuditSeverity::Error,
            format!("Node failed: {}", error),
            Some(job_id),
            Some(node_id),
            serde_json::json!({ "node_type": node_type, "error": error }),
        )
        .await;
    }

    pub async fn node_skipped(&self, job_id: &str, node_id: &str) {
        self.log(
            AuditEventType::NodeSkipped,
            AuditSeverity::Debug,
            "Node skipped (already executed)",
            Some(job_id),
            Some(node_id),
            serde_json::Value::Null,
        )
        .await;
    }

    pub async fn checkpoint_saved(&self, job_id: &str, node_id: &str, checkpoint_id: &str) {
        self.log(
            AuditEventType::CheckpointSaved,
            AuditSeverity::Debug,
            "Checkpoint saved",
            Some(job_id),
            Some(node_id),
            serde_json::json!({ "checkpoint_id": checkpoint_id }),
        )
        .await;
    }

    pub async fn checkpoint_restored(&self, job_id: &str, checkpoint_id: &str, node_id: &str) {
        self.log(
            AuditEventType::CheckpointRestored,
            AuditSeverity::Info,
            format!("Execution restored at node {}", node_id),
            Some(job_id),
            Some(node_id),
            serde_json::json!({
                "checkpoint_id": checkpoint_id,
                "restored_at_node": node_id,
            }),
        )
        .await;
    }

    pub async fn checkpoint_cleared(&self, job_id: &str) {
        self.log(
            AuditEventType::CheckpointCleared,
            AuditSeverity::Debug,
            "Checkpoints cleared",
            Some(job_id),
            None,
            serde_json::Value::Null,
        )
        .await;
    }

    pub async fn circuit_state_changed(&self, circuit_name: &str, new_state: &str) {
        let event_type = match new_state {
            "open" => AuditEventType::CircuitOpened,
            "half_open" => AuditEventType::CircuitHalfOpen,
            _ => AuditEventType::CircuitClosed,
        };
        let severity = if new_state == "open" {
            AuditSeverity::Warning
        } else {
            AuditSeverity::Info
        };
        self.log(
            event_type,
            severity,
            format!("Circuit '{}' is now {}", circuit_name, new_state),
            None,
            None,
            serde_json::json!({ "circuit": circuit_name, "state": new_state }),
        )
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn logger(dir: &Path) -> AuditLogger {
        AuditLogger::new(dir, "robot-test", AuditConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn test_writes_jsonl_records() {
        let dir = tempfile::tempdir().unwrap();
        let audit = logger(dir.path());

        audit.job_claimed("j1").await;
        audit.job_started("j1", 3).await;

        let path = audit.active_path();
        let content = std::fs::read_to_string(path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["event_type"], "job.claimed");
        assert_eq!(first["severity"], "info");
        assert_eq!(first["robot_id"], "robot-test");
        assert_eq!(first["job_id"], "j1");
        assert_eq!(first["node_id"], serde_json::Value::Null);
    }

    #[tokio::test]
    async fn test_query_by_type_and_job() {
        let dir = tempfile::tempdir().unwrap();
        let audit = logger(dir.path());

        audit.job_claimed("j1").await;
        audit.job_claimed("j2").await;
        audit.job_completed("j1", 10).await;

        let claims = audit
            .query(AuditFilter {
                event_types: Some(vec![AuditEventType::JobClaimed]),
                ..Default::default()
            })
            .await;
        assert_eq!(claims.len(), 2);

        let j1 = audit
            .query(AuditFilter {
                job_id: Some("j1".into()),
                ..Default::default()
            })
            .await;
        assert_eq!(j1.len(), 2);

        let recent = audit.get_recent(1).await;
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].event_type, "job.completed");
    }

    #[tokio::test]
    async fn test_rotation_keeps_backups() {
        let dir = tempfile::tempdir().unwrap();
        let audit = AuditLogger::new(
            dir.path(),
            "robot-test",
            AuditConfig {
                max_file_bytes: 200,
                max_backups: 2,
            },
        )
        .unwrap();

        for i in 0..20 {
            audit.job_claimed(&format!("job-{}", i)).await;
        }

        let entries: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        // Active file plus at most two rotated backups.
        assert!(entries.iter().any(|n| n.ends_with(".jsonl")));
        assert!(entries.iter().any(|n| n.ends_with(".jsonl.1")));
        assert!(entries.len() <= 3);
    }

    #[tokio::test]
    async fn test_checkpoint_restored_payload() {
        let dir = tempfile::tempdir().unwrap();
        let audit = logger(dir.path());
        audit.checkpoint_restored("j1", "cp-9", "B").await;

        let entries = audit.get_recent(1).await;
        assert_eq!(entries[0].event_type, "checkpoint.restored");
        assert_eq!(entries[0].details["restored_at_node"], "B");
    }
}
