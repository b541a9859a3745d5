//! Shared test fixtures: an in-memory backend fake and workflow
//! document builders.

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;

use casare_robot::domain::errors::{RobotError, RobotResult};
use casare_robot::domain::models::job::Job;
use casare_robot::domain::models::robot::{
    PresenceSnapshot, RobotRegistration, RobotStatusKind,
};
use casare_robot::domain::ports::backend::{BackendQueue, ProgressUpdate};

/// Backend fake: a queue of pending jobs plus recorders for every write
/// the robot makes. `fail_all` simulates a backend outage.
#[derive(Default)]
pub struct MockBackend {
    pub pending: Mutex<VecDeque<Job>>,
    pub completed: Mutex<HashMap<String, serde_json::Value>>,
    pub failed: Mutex<HashMap<String, String>>,
    pub cancelled: Mutex<HashMap<String, String>>,
    pub released: Mutex<Vec<String>>,
    pub progress: Mutex<Vec<ProgressUpdate>>,
    pub cancel_flags: Mutex<HashSet<String>>,
    pub lease_extensions: Mutex<Vec<(String, i64)>>,
    pub registrations: Mutex<Vec<RobotRegistration>>,
    pub status_updates: Mutex<Vec<(String, RobotStatusKind)>>,
    pub presence_updates: Mutex<Vec<PresenceSnapshot>>,
    pub claim_calls: AtomicU32,
    pub fail_all: AtomicBool,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_job(&self, job: Job) {
        self.pending.lock().unwrap().push_back(job);
    }

    pub fn set_cancel_requested(&self, job_id: &str) {
        self.cancel_flags.lock().unwrap().insert(job_id.to_string());
    }

    pub fn set_unreachable(&self, down: bool) {
        self.fail_all.store(down, Ordering::SeqCst);
    }

    fn gate(&self) -> RobotResult<()> {
        if self.fail_all.load(Ordering::SeqCst) {
            Err(RobotError::Transient("backend unreachable".into()))
        } else {
            Ok(())
        }
    }

    pub fn last_progress(&self) -> Option<ProgressUpdate> {
        self.progress.lock().unwrap().last().cloned()
    }

    pub fn progress_for(&self, job_id: &str) -> Vec<ProgressUpdate> {
        self.progress
            .lock()
            .unwrap()
            .iter()
            .filter(|u| u.job_id == job_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl BackendQueue for MockBackend {
    async fn ping(&self) -> RobotResult<()> {
        self.gate()
    }

    async fn claim_job(&self, robot_id: &str, _environment: &str) -> RobotResult<Option<Job>> {
        self.claim_calls.fetch_add(1, Ordering::SeqCst);
        self.gate()?;
        let mut pending = self.pending.lock().unwrap();
        Ok(pending.pop_front().map(|mut job| {
            job.claimed_by = Some(robot_id.to_string());
            job
        }))
    }

    async fn try_lock_job(&self, job_id: &str, _robot_id: &str) -> RobotResult<bool> {
        self.gate()?;
        let mut pending = self.pending.lock().unwrap();
        let position = pending.iter().position(|j| j.id == job_id);
        if let Some(index) = position {
            pending.remove(index);
            return Ok(true);
        }
        // Unknown to the queue: treat as reclaimable (released by lease
        // expiry).
        Ok(true)
    }

    async fn extend_lease(&self, job_id: &str, seconds: i64) -> RobotResult<()> {
        self.gate()?;
        self.lease_extensions
            .lock()
            .unwrap()
            .push((job_id.to_string(), seconds));
        Ok(())
    }

    async fn release_job(&self, job_id: &str) -> RobotResult<()> {
        self.gate()?;
        self.released.lock().unwrap().push(job_id.to_string());
        Ok(())
    }

    async fn complete_job(&self, job_id: &str, result: &serde_json::Value) -> RobotResult<()> {
        self.gate()?;
        self.completed
            .lock()
            .unwrap()
            .insert(job_id.to_string(), result.clone());
        Ok(())
    }

    async fn fail_job(&self, job_id: &str, error: &str) -> RobotResult<()> {
        self.gate()?;
        self.failed
            .lock()
            .unwrap()
            .insert(job_id.to_string(), error.to_string());
        Ok(())
    }

    async fn cancel_job(&self, job_id: &str, reason: &str) -> RobotResult<()> {
        self.gate()?;
        self.cancelled
            .lock()
            .unwrap()
            .insert(job_id.to_string(), reason.to_string());
        Ok(())
    }

    async fn update_progress(&self, update: &ProgressUpdate) -> RobotResult<()> {
        self.gate()?;
        self.progress.lock().unwrap().push(update.clone());
        Ok(())
    }

    async fn cancel_requested(&self, job_id: &str) -> RobotResult<bool> {
        self.gate()?;
        Ok(self.cancel_flags.lock().unwrap().contains(job_id))
    }

    async fn upsert_registration(&self, registration: &RobotRegistration) -> RobotResult<()> {
        self.gate()?;
        self.registrations.lock().unwrap().push(registration.clone());
        Ok(())
    }

    async fn update_robot_status(
        &self,
        robot_id: &str,
        status: RobotStatusKind,
    ) -> RobotResult<()> {
        self.gate()?;
        self.status_updates
            .lock()
            .unwrap()
            .push((robot_id.to_string(), status));
        Ok(())
    }

    async fn update_presence(
        &self,
        _robot_id: &str,
        presence: &PresenceSnapshot,
    ) -> RobotResult<()> {
        self.gate()?;
        self.presence_updates.lock().unwrap().push(presence.clone());
        Ok(())
    }
}

/// A linear workflow document in the designer's JSON shape.
pub fn linear_workflow(name: &str, nodes: &[(&str, &str, serde_json::Value)]) -> serde_json::Value {
    let node_map: serde_json::Map<String, serde_json::Value> = nodes
        .iter()
        .map(|(id, node_type, config)| {
            (
                id.to_string(),
                serde_json::json!({ "type": node_type, "config": config }),
            )
        })
        .collect();
    let connections: Vec<serde_json::Value> = nodes
        .windows(2)
        .map(|pair| {
            serde_json::json!({
                "source_node": pair[0].0,
                "source_port": "exec_out",
                "target_node": pair[1].0,
                "target_port": "exec_in",
            })
        })
        .collect();
    serde_json::json!({
        "metadata": { "name": name, "description": "" },
        "nodes": node_map,
        "connections": connections,
        "variables": {},
    })
}

/// Three no-op nodes `a -> b -> c`.
pub fn three_step_workflow(name: &str) -> serde_json::Value {
    linear_workflow(
        name,
        &[
            ("a", "flow.start", serde_json::json!({})),
            ("b", "basic.log", serde_json::json!({})),
            ("c", "basic.log", serde_json::json!({})),
        ],
    )
}

/// Start node then a long delay, for cancellation and shutdown tests.
pub fn slow_workflow(name: &str, delay_ms: u64) -> serde_json::Value {
    linear_workflow(
        name,
        &[
            ("a", "flow.start", serde_json::json!({})),
            ("slow", "basic.delay", serde_json::json!({ "delay_ms": delay_ms })),
            ("done", "basic.log", serde_json::json!({})),
        ],
    )
}
