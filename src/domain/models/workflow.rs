//! Workflow document model.
//!
//! The document is produced by the designer and consumed as-is. The robot
//! core treats node descriptors as opaque keys handed to the workflow
//! engine; only the graph shape is validated here.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use crate::domain::errors::{RobotError, RobotResult};
use crate::domain::models::variable::VariableMap;

/// Well-known execution input port name.
pub const EXEC_IN: &str = "exec_in";
/// Well-known execution output port name.
pub const EXEC_OUT: &str = "exec_out";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowMetadata {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
}

/// One node in the workflow graph. Configuration is opaque to the core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDescriptor {
    #[serde(rename = "type")]
    pub node_type: String,
    #[serde(default)]
    pub config: HashMap<String, serde_json::Value>,
    /// Designer canvas position; irrelevant at execution time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<[f64; 2]>,
}

/// A directed edge between two node ports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connection {
    pub source_node: String,
    pub source_port: String,
    pub target_node: String,
    pub target_port: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDocument {
    #[serde(default)]
    pub metadata: WorkflowMetadata,
    pub nodes: HashMap<String, NodeDescriptor>,
    #[serde(default)]
    pub connections: Vec<Connection>,
    #[serde(default)]
    pub variables: VariableMap,
    #[serde(default)]
    pub settings: HashMap<String, serde_json::Value>,
}

impl WorkflowDocument {
    /// Parse a document from its JSON form.
    pub fn from_json(value: &serde_json::Value) -> RobotResult<Self> {
        let doc: WorkflowDocument = serde_json::from_value(value.clone())
            .map_err(|e| RobotError::Workflow(format!("invalid workflow document: {}", e)))?;
        doc.validate()?;
        Ok(doc)
    }

    pub fn from_str(raw: &str) -> RobotResult<Self> {
        let value: serde_json::Value = serde_json::from_str(raw)
            .map_err(|e| RobotError::Workflow(format!("invalid workflow JSON: {}", e)))?;
        Self::from_json(&value)
    }

    pub fn name(&self) -> &str {
        if self.metadata.name.is_empty() {
            "unnamed"
        } else {
            &self.metadata.name
        }
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Nodes with no incoming `exec_in` connection; execution entry points.
    pub fn start_nodes(&self) -> Vec<&str> {
        let targets: HashSet<&str> = self
            .connections
            .iter()
            .filter(|c| c.target_port == EXEC_IN)
            .map(|c| c.target_node.as_str())
            .collect();
        let mut starts: Vec<&str> = self
            .nodes
            .keys()
            .map(String::as_str)
            .filter(|id| !targets.contains(id))
            .collect();
        starts.sort_unstable();
        starts
    }

    /// Successors of a node along execution edges, in connection order.
    pub fn exec_successors(&self, node_id: &str) -> Vec<&str> {
        self.connections
            .iter()
            .filter(|c| c.source_node == node_id && c.source_port == EXEC_OUT)
            .map(|c| c.target_node.as_str())
            .collect()
    }

    /// Structural validation: connections reference existing nodes and at
    /// least one start node exists.
    pub fn validate(&self) -> RobotResult<()> {
        if self.nodes.is_empty() {
            return Err(RobotError::Workflow("workflow has no nodes".into()));
        }
        for conn in &self.connections {
            if !self.nodes.contains_key(&conn.source_node) {
                return Err(RobotError::Workflow(format!(
                    "connection references unknown source node '{}'",
                    conn.source_node
                )));
            }
            if !self.nodes.contains_key(&conn.target_node) {
                return Err(RobotError::Workflow(format!(
                    "connection references unknown target node '{}'",
                    conn.target_node
                )));
            }
        }
        if self.start_nodes().is_empty() {
            return Err(RobotError::Workflow(
                "workflow has no start node (every node has an incoming exec_in)".into(),
            ));
        }
        Ok(())
    }
}
