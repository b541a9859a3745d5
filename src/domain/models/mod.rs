//! Domain models.

pub mod checkpoint;
pub mod config;
pub mod job;
pub mod robot;
pub mod schedule;
pub mod variable;
pub mod workflow;

pub use checkpoint::{AgentCheckpoint, AgentStats, BrowserStateHint, CheckpointState, ErrorRecord};
pub use config::{
    CircuitBreakerSettings, ConnectionSettings, RobotConfig, SchedulerSettings,
};
pub use job::{Job, JobStatus};
pub use robot::{
    AgentState, PresenceSnapshot, RobotCapabilities, RobotRegistration, RobotStatusKind,
};
pub use schedule::{ExecutionRecord, RunStatus, Schedule, ScheduleSpec, ScheduleStatus};
pub use variable::{variables_from_json, VariableMap, VariableValue, NON_SERIALIZABLE_PREFIX};
pub use workflow::{Connection, NodeDescriptor, WorkflowDocument, EXEC_IN, EXEC_OUT};
