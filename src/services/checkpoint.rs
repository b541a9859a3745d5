//! Checkpoint capture and restore.
//!
//! After every node completion the manager snapshots the execution path,
//! the executed-node set, and the serializable subset of workflow
//! variables into the offline store. On a restart the latest checkpoint
//! seeds the engine so already-completed nodes are skipped. Checkpoints
//! for a job are cleared only after its completion was acknowledged (or
//! the job was cancelled); failures keep them for the next attempt.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use crate::adapters::sqlite::offline_store::OfflineStore;
use crate::domain::models::checkpoint::{BrowserStateHint, CheckpointState, ErrorRecord};
use crate::domain::models::variable::{VariableMap, VariableValue};
use crate::services::audit::AuditLogger;

/// State handed back to the executor for a resumed job.
#[derive(Debug, Clone)]
pub struct RestoredState {
    pub checkpoint_id: String,
    pub current_node_id: String,
    pub execution_path: Vec<String>,
    pub executed_nodes: HashSet<String>,
    /// Variables with non-serializable placeholders filtered out.
    pub variables: VariableMap,
}

#[derive(Debug, Default)]
struct JobTracking {
    workflow_name: String,
    execution_path: Vec<String>,
    executed: HashSet<String>,
    variables: VariableMap,
    error_history: Vec<ErrorRecord>,
}

pub struct CheckpointManager {
    store: Arc<OfflineStore>,
    audit: Arc<AuditLogger>,
    enabled: bool,
    jobs: RwLock<HashMap<String, JobTracking>>,
}

impl CheckpointManager {
    pub fn new(store: Arc<OfflineStore>, audit: Arc<AuditLogger>, enabled: bool) -> Self {
        Self {
            store,
            audit,
            enabled,
            jobs: RwLock::new(HashMap::new()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Begin tracking a job.
    pub async fn start_job(&self, job_id: &str, workflow_name: &str) {
        let mut jobs = self.jobs.write().await;
        jobs.insert(
            job_id.to_string(),
            JobTracking {
                workflow_name: workflow_name.to_string(),
                ..Default::default()
            },
        );
    }

    /// Drop the in-memory tracking once a job leaves the executor.
    pub async fn end_job(&self, job_id: &str) {
        self.jobs.write().await.remove(job_id);
    }

    /// Capture a checkpoint after `node_id` completed.
    ///
    /// Returns the checkpoint id, or `None` when checkpointing is
    /// disabled or the write failed (the job keeps running either way).
    pub async fn on_node_complete(
        &self,
        job_id: &str,
        node_id: &str,
        variables: &VariableMap,
        browser_state: BrowserStateHint,
    ) -> Option<String> {
        if !self.enabled {
            return None;
        }

        let state = {
            let mut jobs = self.jobs.write().await;
            let tracking = jobs.get_mut(job_id)?;

            tracking.execution_path.push(node_id.to_string());
            tracking.executed.insert(node_id.to_string());
            for (key, value) in sanitize_variables(variables) {
                tracking.variables.insert(key, value);
            }

            CheckpointState {
                checkpoint_id: Uuid::new_v4().to_string(),
                job_id: job_id.to_string(),
                workflow_name: tracking.workflow_name.clone(),
                current_node_id: node_id.to_string(),
                execution_path: tracking.execution_path.clone(),
                executed_nodes: tracking.executed.clone(),
                variables: tracking.variables.clone(),
                error_history: tracking.error_history.clone(),
                browser_state,
                created_at: chrono::Utc::now(),
            }
        };

        let checkpoint_id = state.checkpoint_id.clone();
        if !self
            .store
            .save_checkpoint(job_id, &checkpoint_id, node_id, &state)
            .await
        {
            return None;
        }
        self.audit
            .checkpoint_saved(job_id, node_id, &checkpoint_id)
            .await;
        Some(checkpoint_id)
    }

    /// Record a node failure in the error history carried by subsequent
    /// checkpoints.
    pub async fn record_error(&self, job_id: &str, node_id: &str, message: &str) {
        let mut jobs = self.jobs.write().await;
        if let Some(tracking) = jobs.get_mut(job_id) {
            tracking.error_history.push(ErrorRecord {
                node_id: node_id.to_string(),
                message: message.to_string(),
                timestamp: chrono::Utc::now(),
            });
        }
    }

    /// Load the latest checkpoint and re-seed the in-memory tracking.
    ///
    /// Placeholder variables are left behind: a value that could not be
    /// serialized is never re-injected into the resumed context. Browser
    /// state is intentionally not restored.
    pub async fn restore(&self, job_id: &str) -> Option<RestoredState> {
        if !self.enabled {
            return None;
        }
        let checkpoint = self.store.get_latest_checkpoint(job_id).await?;

        let variables: VariableMap = checkpoint
            .variables
            .iter()
            .filter(|(_, v)| !v.is_non_serializable())
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        {
            let mut jobs = self.jobs.write().await;
            jobs.insert(
                job_id.to_string(),
                JobTracking {
                    workflow_name: checkpoint.workflow_name.clone(),
                    execution_path: checkpoint.execution_path.clone(),
                    executed: checkpoint.executed_nodes.clone(),
                    variables: variables.clone(),
                    error_history: checkpoint.error_history.clone(),
                },
            );
        }

        self.audit
            .checkpoint_restored(job_id, &checkpoint.checkpoint_id, &checkpoint.current_node_id)
            .await;
        debug!(
            job_id,
            node = %checkpoint.current_node_id,
            executed = checkpoint.executed_nodes.len(),
            "restored from checkpoint"
        );

        Some(RestoredState {
            checkpoint_id: checkpoint.checkpoint_id,
            current_node_id: checkpoint.current_node_id,
            execution_path: checkpoint.execution_path,
            executed_nodes: checkpoint.executed_nodes,
            variables,
        })
    }

    /// Remove all checkpoints for a job after its outcome was
    /// acknowledged.
    pub async fn clear(&self, job_id: &str) {
        if self.store.clear_checkpoints(job_id).await {
            self.audit.checkpoint_cleared(job_id).await;
        }
    }

    pub async fn executed_nodes(&self, job_id: &str) -> HashSet<String> {
        let jobs = self.jobs.read().await;
        jobs.get(job_id)
            .map(|t| t.executed.clone())
            .unwrap_or_default()
    }

    pub async fn is_node_executed(&self, job_id: &str, node_id: &str) -> bool {
        let jobs = self.jobs.read().await;
        jobs.get(job_id)
            .map(|t| t.executed.contains(node_id))
            .unwrap_or(false)
    }

    pub async fn update_variable(&self, job_id: &str, key: &str, value: VariableValue) {
        let mut jobs = self.jobs.write().await;
        if let Some(tracking) = jobs.get_mut(job_id) {
            for (k, v) in sanitize_variables(&HashMap::from([(key.to_string(), value)])) {
                tracking.variables.insert(k, v);
            }
        }
    }
}

/// Replace values without a JSON representation by the typed
/// placeholder. Primitives take the fast path; collections are checked
/// recursively.
fn sanitize_variables(variables: &VariableMap) -> VariableMap {
    variables
        .iter()
        .map(|(key, value)| {
            let sanitized = if value.is_json_safe() {
                value.clone()
            } else {
                VariableValue::non_serializable(value.type_name())
            };
            (key.clone(), sanitized)
        })
        .collect()
}
