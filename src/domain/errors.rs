//! Domain errors for the robot agent.

use thiserror::Error;

/// Errors surfaced by the robot agent subsystems.
///
/// The taxonomy follows the error-handling design: transient backend
/// errors are retried through the connection manager, circuit-open errors
/// stay inside the claim loop, job errors are recorded on the job, and
/// config/storage errors abort startup.
#[derive(Debug, Error)]
pub enum RobotError {
    /// Transient backend error (connection lost, timeout, 5xx-equivalent).
    #[error("Backend error: {0}")]
    Transient(String),

    /// No live backend session and connecting failed.
    #[error("Not connected to backend: {0}")]
    NotConnected(String),

    /// Backend operation exceeded its deadline.
    #[error("Operation timed out after {seconds}s")]
    OperationTimeout { seconds: u64 },

    /// Call blocked by an open circuit breaker.
    #[error("Circuit '{name}' is open, retry in {seconds_remaining}s")]
    CircuitOpen { name: String, seconds_remaining: u64 },

    /// A job failed during execution.
    #[error("Job {job_id} failed: {message}")]
    JobExecution { job_id: String, message: String },

    /// A job was cancelled.
    #[error("Job {job_id} cancelled: {reason}")]
    JobCancelled { job_id: String, reason: String },

    /// Invalid or missing configuration; fatal at startup.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Offline store failure; fatal at startup, logged afterwards.
    #[error("Storage error: {0}")]
    Storage(String),

    /// A workflow document failed to parse or validate.
    #[error("Workflow error: {0}")]
    Workflow(String),

    /// JSON (de)serialization failure.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invariant violation; indicates a bug, not an operational condition.
    #[error("Invariant violated: {0}")]
    Invariant(String),
}

pub type RobotResult<T> = Result<T, RobotError>;

impl RobotError {
    /// Whether the error is worth retrying through the connection manager.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Transient(_) | Self::NotConnected(_) | Self::OperationTimeout { .. }
        )
    }
}

impl From<serde_json::Error> for RobotError {
    fn from(err: serde_json::Error) -> Self {
        RobotError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(RobotError::Transient("boom".into()).is_transient());
        assert!(RobotError::OperationTimeout { seconds: 10 }.is_transient());
        assert!(!RobotError::Config("missing url".into()).is_transient());
        assert!(!RobotError::CircuitOpen {
            name: "robot-1".into(),
            seconds_remaining: 30
        }
        .is_transient());
    }

    #[test]
    fn test_display() {
        let err = RobotError::CircuitOpen {
            name: "robot-1".into(),
            seconds_remaining: 42,
        };
        assert_eq!(err.to_string(), "Circuit 'robot-1' is open, retry in 42s");
    }
}
