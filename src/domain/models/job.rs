//! Job model: one claimable unit of work on the backend queue.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::models::variable::VariableMap;

/// Lifecycle status of a job as recorded on the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    /// Terminal statuses are never claimed again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// One pending workflow execution.
///
/// The workflow document is carried as raw JSON and parsed by the
/// executor at start time; the queue never inspects it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub document: serde_json::Value,
    #[serde(default)]
    pub initial_variables: VariableMap,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub retry_count: i32,
    #[serde(default = "default_environment")]
    pub environment: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimed_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_deadline: Option<DateTime<Utc>>,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

fn default_environment() -> String {
    "default".to_string()
}

impl Job {
    pub fn new(id: impl Into<String>, document: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            document,
            initial_variables: VariableMap::new(),
            priority: 0,
            retry_count: 0,
            environment: default_environment(),
            tenant: None,
            claimed_by: None,
            lease_deadline: None,
            status: JobStatus::Pending,
            created_at: Some(Utc::now()),
        }
    }

    pub fn with_variables(mut self, variables: VariableMap) -> Self {
        self.initial_variables = variables;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip() {
        for s in [
            JobStatus::Pending,
            JobStatus::Running,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Cancelled,
        ] {
            assert_eq!(JobStatus::parse_str(s.as_str()), Some(s));
        }
        assert_eq!(JobStatus::parse_str("bogus"), None);
    }

    #[test]
    fn test_terminal() {
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
    }

    #[test]
    fn test_builder() {
        let job = Job::new("job-1", serde_json::json!({}))
            .with_priority(5)
            .with_variables(VariableMap::new());
        assert_eq!(job.priority, 5);
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.environment, "default");
    }
}
