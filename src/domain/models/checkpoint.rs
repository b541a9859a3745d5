//! Checkpoint state captured after each node completion, plus the agent's
//! own restart checkpoint.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use uuid::Uuid;

use crate::domain::models::variable::VariableMap;

/// One recorded node failure within a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub node_id: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Diagnostic browser-session hints.
///
/// These fields are informational only: a checkpoint cannot restore a
/// live browser, so browser-dependent nodes must tolerate a cold start
/// after a resume.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BrowserStateHint {
    pub has_browser: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_page: Option<String>,
    #[serde(default)]
    pub page_count: u32,
}

/// Execution snapshot written after a node completes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointState {
    pub checkpoint_id: String,
    pub job_id: String,
    pub workflow_name: String,
    /// The node that just completed; the resume point.
    pub current_node_id: String,
    /// Ordered sequence of executed node ids.
    pub execution_path: Vec<String>,
    /// Set form of the path, for idempotent skip on resume.
    pub executed_nodes: HashSet<String>,
    /// Serializable subset of the workflow variables.
    pub variables: VariableMap,
    pub error_history: Vec<ErrorRecord>,
    pub browser_state: BrowserStateHint,
    pub created_at: DateTime<Utc>,
}

impl CheckpointState {
    pub fn new(job_id: impl Into<String>, workflow_name: impl Into<String>) -> Self {
        Self {
            checkpoint_id: Uuid::new_v4().to_string(),
            job_id: job_id.into(),
            workflow_name: workflow_name.into(),
            current_node_id: String::new(),
            execution_path: Vec::new(),
            executed_nodes: HashSet::new(),
            variables: VariableMap::new(),
            error_history: Vec::new(),
            browser_state: BrowserStateHint::default(),
            created_at: Utc::now(),
        }
    }
}

/// Aggregate counters carried across agent restarts.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AgentStats {
    pub jobs_completed: u64,
    pub jobs_failed: u64,
    pub jobs_cancelled: u64,
    pub nodes_executed: u64,
    pub circuit_breaker_opens: u64,
    pub checkpoints_restored: u64,
}

/// The agent's own restart checkpoint, written periodically and on
/// shutdown.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentCheckpoint {
    pub checkpoint_id: String,
    pub robot_id: String,
    pub state: String,
    /// Jobs in flight at checkpoint time; used to detect orphans on
    /// restart.
    pub current_job_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub stats: AgentStats,
    pub created_at: DateTime<Utc>,
}

impl AgentCheckpoint {
    pub fn new(robot_id: impl Into<String>, state: impl Into<String>, stats: AgentStats) -> Self {
        Self {
            checkpoint_id: Uuid::new_v4().to_string(),
            robot_id: robot_id.into(),
            state: state.into(),
            current_job_ids: Vec::new(),
            last_heartbeat: None,
            stats,
            created_at: Utc::now(),
        }
    }
}
