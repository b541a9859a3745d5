//! Port to the workflow engine.
//!
//! The engine owns graph traversal and node execution; the robot core
//! only consumes its lifecycle events. A resumed run receives the set of
//! already-executed nodes to skip. Browser sessions are never restored
//! across runs: nodes that assumed a live browser must tolerate a cold
//! start after a resume.

use async_trait::async_trait;
use std::collections::HashSet;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::domain::errors::RobotResult;
use crate::domain::models::checkpoint::BrowserStateHint;
use crate::domain::models::variable::VariableMap;
use crate::domain::models::workflow::WorkflowDocument;

/// Node lifecycle events emitted while a workflow runs.
#[derive(Debug, Clone)]
pub enum NodeEvent {
    Started {
        node_id: String,
        node_type: String,
        name: String,
    },
    Completed {
        node_id: String,
        node_type: String,
        duration_ms: u64,
        /// Snapshot of the execution context's variables after this node.
        variables: VariableMap,
        browser_state: BrowserStateHint,
    },
    Failed {
        node_id: String,
        node_type: String,
        error: String,
    },
    Skipped {
        node_id: String,
    },
}

impl NodeEvent {
    pub fn node_id(&self) -> &str {
        match self {
            Self::Started { node_id, .. }
            | Self::Completed { node_id, .. }
            | Self::Failed { node_id, .. }
            | Self::Skipped { node_id } => node_id,
        }
    }
}

/// One engine invocation.
#[derive(Debug, Clone)]
pub struct EngineRequest {
    pub job_id: String,
    pub document: WorkflowDocument,
    pub variables: VariableMap,
    /// Nodes to skip (already executed before a resume).
    pub skip_nodes: HashSet<String>,
    pub node_timeout: Duration,
}

/// Terminal result of an engine invocation.
#[derive(Debug, Clone)]
pub struct EngineOutcome {
    pub success: bool,
    pub error: Option<String>,
    /// Final variable state.
    pub variables: VariableMap,
}

/// External workflow engine boundary.
#[async_trait]
pub trait WorkflowEngine: Send + Sync {
    /// Run a workflow to completion, streaming node events as they
    /// happen. The events channel closing early must not panic the
    /// engine.
    async fn run(
        &self,
        request: EngineRequest,
        events: mpsc::Sender<NodeEvent>,
    ) -> RobotResult<EngineOutcome>;
}
