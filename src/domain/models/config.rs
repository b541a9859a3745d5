//! Robot agent configuration.
//!
//! Field names deliberately match the `CASARE_*` environment variables
//! (after prefix stripping) so figment's env provider maps them without
//! aliases. Nested sections use the `__` separator, e.g.
//! `CASARE_CIRCUIT_BREAKER__FAILURE_THRESHOLD`.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RobotConfig {
    /// Persistent robot id; generated and persisted on first run when
    /// absent.
    pub robot_id: Option<String>,
    /// Display name; defaults to `Robot-<hostname>`.
    pub robot_name: Option<String>,
    pub environment: String,
    /// Comma-separated capability tags.
    pub robot_tags: String,
    /// Automation engines linked into this build.
    pub engines: Vec<String>,

    /// Backend connection URL; also read from `POSTGRES_URL` /
    /// `DATABASE_URL`.
    pub database_url: Option<String>,

    pub batch_size: usize,
    pub max_concurrent_jobs: usize,

    /// Claim-loop base delay, seconds.
    pub poll_interval: f64,
    /// Adaptive claim-loop delay cap, seconds.
    pub poll_interval_max: f64,
    pub heartbeat_interval: f64,
    pub presence_interval: f64,
    pub visibility_timeout: u64,
    pub shutdown_grace: u64,
    pub job_timeout: u64,
    pub node_timeout: f64,
    pub heartbeat_timeout: f64,
    /// Cancellation-flag poll cadence, seconds.
    pub cancellation_check_interval: f64,
    /// Progress coalescing window, seconds.
    pub progress_flush_interval: f64,

    pub enable_checkpointing: bool,
    pub enable_circuit_breaker: bool,
    pub enable_realtime: bool,
    pub resume_from_checkpoint: bool,
    pub checkpoint_retention: usize,

    /// Operation-log retention, days.
    pub log_retention_days: u32,
    /// Resource sampling cadence, seconds.
    pub resource_sample_interval: f64,

    /// Override for `~/.casare_rpa`.
    pub data_dir: Option<PathBuf>,

    pub circuit_breaker: CircuitBreakerSettings,
    pub connection: ConnectionSettings,
    pub scheduler: SchedulerSettings,
}

impl Default for RobotConfig {
    fn default() -> Self {
        Self {
            robot_id: None,
            robot_name: None,
            environment: "default".to_string(),
            robot_tags: String::new(),
            engines: vec!["browser".to_string(), "desktop".to_string()],
            database_url: None,
            batch_size: 1,
            max_concurrent_jobs: 1,
            poll_interval: 1.0,
            poll_interval_max: 2.0,
            heartbeat_interval: 10.0,
            presence_interval: 5.0,
            visibility_timeout: 30,
            shutdown_grace: 60,
            job_timeout: 3600,
            node_timeout: 120.0,
            heartbeat_timeout: 10.0,
            cancellation_check_interval: 2.0,
            progress_flush_interval: 1.0,
            enable_checkpointing: true,
            enable_circuit_breaker: true,
            enable_realtime: true,
            resume_from_checkpoint: true,
            checkpoint_retention: 10,
            log_retention_days: 14,
            resource_sample_interval: 30.0,
            data_dir: None,
            circuit_breaker: CircuitBreakerSettings::default(),
            connection: ConnectionSettings::default(),
            scheduler: SchedulerSettings::default(),
        }
    }
}

impl RobotConfig {
    /// Tags split out of the comma-separated env form.
    pub fn tags(&self) -> Vec<String> {
        self.robot_tags
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(String::from)
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerSettings {
    pub failure_threshold: u32,
    pub open_timeout_seconds: u64,
    pub success_threshold: u32,
    pub half_open_max_calls: u32,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_timeout_seconds: 60,
            success_threshold: 2,
            half_open_max_calls: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionSettings {
    pub initial_delay_seconds: f64,
    pub max_delay_seconds: f64,
    pub backoff_multiplier: f64,
    pub jitter: bool,
    /// Zero means retry forever.
    pub max_reconnect_attempts: u32,
    pub connection_timeout_seconds: f64,
    pub operation_timeout_seconds: f64,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            initial_delay_seconds: 1.0,
            max_delay_seconds: 300.0,
            backoff_multiplier: 2.0,
            jitter: true,
            max_reconnect_attempts: 0,
            connection_timeout_seconds: 30.0,
            operation_timeout_seconds: 10.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    pub check_interval_seconds: u64,
    pub max_concurrent_executions: usize,
    pub execution_timeout_seconds: u64,
    pub retry_delay_seconds: u64,
    pub max_retries: u32,
    pub history_max_entries: usize,
    pub history_retention_days: u32,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            check_interval_seconds: 60,
            max_concurrent_executions: 3,
            execution_timeout_seconds: 3600,
            retry_delay_seconds: 300,
            max_retries: 3,
            history_max_entries: 1000,
            history_retention_days: 30,
        }
    }
}
