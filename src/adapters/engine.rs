//! Reference workflow engine.
//!
//! Walks the execution chain from the start node, emitting lifecycle
//! events for each node. Real automation engines (browser, desktop,
//! office) are linked by the embedding application behind the same
//! port; this engine carries the traversal contract, honors the resume
//! skip-set, and understands a handful of basic node types so the agent
//! can run end to end without external automation.

use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::domain::errors::RobotResult;
use crate::domain::models::checkpoint::BrowserStateHint;
use crate::domain::models::variable::{VariableMap, VariableValue};
use crate::domain::models::workflow::NodeDescriptor;
use crate::domain::ports::engine::{EngineOutcome, EngineRequest, NodeEvent, WorkflowEngine};

pub struct SequentialEngine;

impl SequentialEngine {
    pub fn new() -> Self {
        Self
    }

    /// Run one node's behavior, mutating the variable map. Returns an
    /// error message on failure.
    async fn run_node(
        node_id: &str,
        node: &NodeDescriptor,
        variables: &mut VariableMap,
        node_timeout: Duration,
    ) -> Result<(), String> {
        let behavior = async {
            match node.node_type.as_str() {
                "basic.delay" => {
                    let delay_ms = node
                        .config
                        .get("delay_ms")
                        .and_then(|v| v.as_u64())
                        .unwrap_or(0);
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                    Ok(())
                }
                "basic.set_variable" => {
                    let name = node
                        .config
                        .get("name")
                        .and_then(|v| v.as_str())
                        .ok_or_else(|| "set_variable requires 'name'".to_string())?;
                    let value = node
                        .config
                        .get("value")
                        .cloned()
                        .unwrap_or(serde_json::Value::Null);
                    variables.insert(name.to_string(), VariableValue::from_json(value));
                    Ok(())
                }
                "basic.fail" => {
                    let message = node
                        .config
                        .get("message")
                        .and_then(|v| v.as_str())
                        .unwrap_or("node failed");
                    Err(message.to_string())
                }
                // Unknown node types are structural no-ops here; real
                // engines dispatch them to their node catalogue.
                _ => Ok(()),
            }
        };
        match tokio::time::timeout(node_timeout, behavior).await {
            Ok(result) => result,
            Err(_) => Err(format!(
                "node {} timed out after {}s",
                node_id,
                node_timeout.as_secs()
            )),
        }
    }
}

impl Default for SequentialEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WorkflowEngine for SequentialEngine {
    async fn run(
        &self,
        request: EngineRequest,
        events: mpsc::Sender<NodeEvent>,
    ) -> RobotResult<EngineOutcome> {
        let document = &request.document;
        document.validate()?;

        let mut variables = request.variables.clone();
        let mut current = document.start_nodes().first().map(|s| s.to_string());

        while let Some(node_id) = current {
            let Some(node) = document.nodes.get(&node_id) else {
                break;
            };
            let next = document
                .exec_successors(&node_id)
                .first()
                .map(|s| s.to_string());

            if request.skip_nodes.contains(&node_id) {
                let _ = events
                    .send(NodeEvent::Skipped {
                        node_id: node_id.clone(),
                    })
                    .await;
                current = next;
                continue;
            }

            let _ = events
                .send(NodeEvent::Started {
                    node_id: node_id.clone(),
                    node_type: node.node_type.clone(),
                    name: node_id.clone(),
                })
                .await;

            let started = tokio::time::Instant::now();
            let result =
                Self::run_node(&node_id, node, &mut variables, request.node_timeout).await;
            let duration_ms = started.elapsed().as_millis() as u64;

            match result {
                Ok(()) => {
                    let _ = events
                        .send(NodeEvent::Completed {
                            node_id: node_id.clone(),
                            node_type: node.node_type.clone(),
                            duration_ms,
                            variables: variables.clone(),
                            browser_state: BrowserStateHint::default(),
                        })
                        .await;
                }
                Err(error) => {
                    let _ = events
                        .send(NodeEvent::Failed {
                            node_id: node_id.clone(),
                            node_type: node.node_type.clone(),
                            error: error.clone(),
                        })
                        .await;
                    return Ok(EngineOutcome {
                        success: false,
                        error: Some(format!("node {} failed: {}", node_id, error)),
                        variables,
                    });
                }
            }
            current = next;
        }

        Ok(EngineOutcome {
            success: true,
            error: None,
            variables,
        })
    }
}
