//! Port to the orchestrator backend.
//!
//! The backend holds the authoritative queue and job state. The robot
//! only ever touches it through this trait; the production adapter runs
//! SQL against the `jobs` and `robots` tables, tests use an in-memory
//! fake.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::errors::RobotResult;
use crate::domain::models::job::Job;
use crate::domain::models::robot::{PresenceSnapshot, RobotRegistration, RobotStatusKind};

/// Stage names written into the job progress field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStage {
    Queued,
    Starting,
    LoadingWorkflow,
    Executing,
    Completing,
    Completed,
    Failed,
    Cancelled,
}

impl ProgressStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Starting => "starting",
            Self::LoadingWorkflow => "loading_workflow",
            Self::Executing => "executing",
            Self::Completing => "completing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Terminal stages are flushed immediately and never coalesced away.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Coalesced progress document written into `jobs.progress`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressUpdate {
    pub job_id: String,
    pub stage: ProgressStage,
    pub percent_complete: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_node_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_node_name: Option<String>,
    #[serde(default)]
    pub completed_nodes: u32,
    #[serde(default)]
    pub total_nodes: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl ProgressUpdate {
    pub fn new(job_id: impl Into<String>, stage: ProgressStage) -> Self {
        Self {
            job_id: job_id.into(),
            stage,
            percent_complete: 0.0,
            message: None,
            current_node_id: None,
            current_node_name: None,
            completed_nodes: 0,
            total_nodes: 0,
            success: None,
            error: None,
            updated_at: Utc::now(),
        }
    }
}

/// Operations the robot performs against the orchestrator.
///
/// Completions must tolerate lease expiry: a late `complete_job` on a
/// job already released to another robot is accepted without error.
#[async_trait]
pub trait BackendQueue: Send + Sync {
    /// Minimal liveness probe.
    async fn ping(&self) -> RobotResult<()>;

    /// Claim the highest-priority pending job for this robot, if any.
    async fn claim_job(&self, robot_id: &str, environment: &str) -> RobotResult<Option<Job>>;

    /// Optimistically lock a specific job; true when the row was still
    /// unclaimed.
    async fn try_lock_job(&self, job_id: &str, robot_id: &str) -> RobotResult<bool>;

    /// Extend the lease on a claimed job.
    async fn extend_lease(&self, job_id: &str, seconds: i64) -> RobotResult<()>;

    /// Return an unfinished job to the queue for another robot.
    async fn release_job(&self, job_id: &str) -> RobotResult<()>;

    async fn complete_job(&self, job_id: &str, result: &serde_json::Value) -> RobotResult<()>;

    async fn fail_job(&self, job_id: &str, error: &str) -> RobotResult<()>;

    /// Mark a job cancelled on the backend.
    async fn cancel_job(&self, job_id: &str, reason: &str) -> RobotResult<()>;

    /// Write the progress field. Callers must treat failures as
    /// non-fatal.
    async fn update_progress(&self, update: &ProgressUpdate) -> RobotResult<()>;

    /// Read the orchestrator-set cancellation flag.
    async fn cancel_requested(&self, job_id: &str) -> RobotResult<bool>;

    /// Insert or update this robot's registration row (upsert by
    /// hostname).
    async fn upsert_registration(&self, registration: &RobotRegistration) -> RobotResult<()>;

    async fn update_robot_status(
        &self,
        robot_id: &str,
        status: RobotStatusKind,
    ) -> RobotResult<()>;

    async fn update_presence(
        &self,
        robot_id: &str,
        presence: &PresenceSnapshot,
    ) -> RobotResult<()>;
}
