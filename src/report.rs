//! Per-node and run-level state reports.

use crate::error::FlowResult;
use crate::sample::{Attributes, ContainerPath, NodeKind};
use crate::workflow::WorkflowState;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Snapshot of one tracked node.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeReport {
    /// The node.
    pub path: ContainerPath,
    /// Level of the node.
    pub kind: NodeKind,
    /// Current workflow state, flattened into the report.
    #[serde(flatten)]
    pub state: WorkflowState,
    /// Current attributes.
    pub attributes: Attributes,
    /// Time of the last state change.
    pub updated_at: DateTime<Utc>,
}

/// State of every tracked node of a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    /// Tracked nodes, sorted by path.
    pub nodes: Vec<NodeReport>,
    /// Every tracked node reached `Done` or `Error`.
    pub complete: bool,
    /// The run was shut down.
    pub cancelled: bool,
    /// When the report was taken.
    pub generated_at: DateTime<Utc>,
}

impl RunReport {
    /// Sorts `nodes` and computes completion.
    pub fn new(mut nodes: Vec<NodeReport>, cancelled: bool) -> Self {
        nodes.sort_by(|a, b| a.path.cmp(&b.path));
        let complete = !nodes.is_empty() && nodes.iter().all(|n| n.state.is_terminal());
        Self {
            nodes,
            complete,
            cancelled,
            generated_at: Utc::now(),
        }
    }

    /// Every tracked node reached `Done` or `Error`.
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Report of the node at `path`.
    pub fn node(&self, path: &ContainerPath) -> Option<&NodeReport> {
        self.nodes.iter().find(|n| &n.path == path)
    }

    /// State of the node at `path`.
    pub fn state_of(&self, path: &ContainerPath) -> Option<&WorkflowState> {
        self.node(path).map(|n| &n.state)
    }

    /// Nodes that ended in `Error`.
    pub fn failures(&self) -> impl Iterator<Item = &NodeReport> {
        self.nodes.iter().filter(|n| n.state.is_error())
    }

    /// Nodes that reached `Done`.
    pub fn done_count(&self) -> usize {
        self.nodes
            .iter()
            .filter(|n| n.state == WorkflowState::Done)
            .count()
    }

    /// Pretty-printed JSON.
    pub fn to_json(&self) -> FlowResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::FailureReason;

    fn node(path: ContainerPath, state: WorkflowState) -> NodeReport {
        NodeReport {
            kind: path.kind(),
            path,
            state,
            attributes: Attributes::new(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_completion() {
        let plate = ContainerPath::plate("00");
        let a = plate.well(0, 0).unwrap();
        let b = plate.well(0, 1).unwrap();
        let failed = WorkflowState::Error {
            reason: FailureReason::Timeout {
                state: "imaging".into(),
            },
        };

        let report = RunReport::new(
            vec![node(b.clone(), failed.clone()), node(a.clone(), WorkflowState::Done)],
            false,
        );
        assert!(report.is_complete());
        assert_eq!(report.nodes[0].path, a);
        assert_eq!(report.done_count(), 1);
        assert_eq!(report.failures().count(), 1);
        assert_eq!(report.state_of(&b), Some(&failed));

        let running = RunReport::new(vec![node(a, WorkflowState::Imaging)], false);
        assert!(!running.is_complete());
        assert!(!RunReport::new(Vec::new(), false).is_complete());
    }

    #[test]
    fn test_json_shape() {
        let path = ContainerPath::plate("00").well(1, 1).unwrap();
        let report = RunReport::new(
            vec![node(
                path,
                WorkflowState::Error {
                    reason: FailureReason::Timeout {
                        state: "imaging".into(),
                    },
                },
            )],
            true,
        );
        let value: serde_json::Value = serde_json::from_str(&report.to_json().unwrap()).unwrap();
        let first = &value["nodes"][0];
        assert_eq!(first["path"], "00/W1,1");
        assert_eq!(first["state"], "error");
        assert_eq!(first["reason"]["code"], "timeout");
        assert_eq!(value["cancelled"], true);
    }
}
