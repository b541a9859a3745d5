//! Robot identity, lifecycle state, capabilities, and presence.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Agent lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    Stopped,
    Starting,
    Running,
    Paused,
    ShuttingDown,
}

impl AgentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::ShuttingDown => "shutting_down",
        }
    }
}

/// Status recorded in the backend `robots` row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RobotStatusKind {
    Online,
    Busy,
    Idle,
    Paused,
    Offline,
}

impl RobotStatusKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Busy => "busy",
            Self::Idle => "idle",
            Self::Paused => "paused",
            Self::Offline => "offline",
        }
    }
}

/// What this robot can run; advertised in the registration row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RobotCapabilities {
    pub platform: String,
    pub cpu_count: usize,
    pub memory_gb: f64,
    /// Automation engines linked into this build (browser, desktop, ...).
    pub engines: Vec<String>,
    pub tags: Vec<String>,
    pub max_concurrent_jobs: usize,
}

impl RobotCapabilities {
    /// Probe the host for platform facts; engines and tags come from
    /// configuration.
    pub fn detect(engines: Vec<String>, tags: Vec<String>, max_concurrent_jobs: usize) -> Self {
        let mut system = sysinfo::System::new();
        system.refresh_memory();
        let memory_gb = system.total_memory() as f64 / (1024.0 * 1024.0 * 1024.0);
        Self {
            platform: std::env::consts::OS.to_string(),
            cpu_count: num_cpus::get(),
            memory_gb: (memory_gb * 10.0).round() / 10.0,
            engines,
            tags,
            max_concurrent_jobs,
        }
    }
}

/// Registration row upserted at startup and updated by the presence loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RobotRegistration {
    pub robot_id: String,
    pub name: String,
    pub hostname: String,
    pub status: RobotStatusKind,
    pub environment: String,
    pub capabilities: RobotCapabilities,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_heartbeat: Option<DateTime<Utc>>,
}

/// Periodic presence snapshot pushed into the registration row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceSnapshot {
    pub status: RobotStatusKind,
    pub current_jobs: usize,
    pub capacity: usize,
    pub cpu_percent: f32,
    pub memory_percent: f32,
    pub timestamp: DateTime<Utc>,
}
