//! CasareRPA robot agent core.
//!
//! The headless worker half of CasareRPA: a long-running agent that
//! claims workflow jobs from the orchestrator queue, executes them with
//! per-node crash-recovery checkpoints, reports coalesced progress, and
//! survives backend outages through a local offline store. Subsystems:
//! - connection-resilient backend access behind a circuit breaker
//! - bounded-concurrency job executor with per-job cancellation
//! - checkpoint capture/restore over a SQLite offline store
//! - JSONL audit trail and in-memory metrics
//! - time-based workflow scheduler with retry and history

pub mod adapters;
pub mod application;
pub mod cli;
pub mod domain;
pub mod infrastructure;
pub mod services;

pub use application::agent::RobotAgent;
pub use application::job_executor::{JobExecutor, JobExecutorConfig};
pub use domain::errors::{RobotError, RobotResult};
pub use domain::models::config::RobotConfig;
