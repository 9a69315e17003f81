//! Graph form of a workflow and the linear ↔ graph conversion.
//!
//! ```text
//!  linear:  [s1, s2, s3]
//!
//!  graph:   start ──► s1 ──► s2 ──► s3 ──► end
//!           (250,0)  (250,150) ...        (250,(n+1)·150)
//! ```
//!
//! Converting to a graph is lossless. Flattening back is lossy on purpose:
//! edges, positions and decision nodes are dropped, arbitrary topology is
//! never preserved. Step data survives because the store keeps the step list
//! independently of the node wrappers.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::WorkflowStep;

/// Horizontal position of every node in the generated layout.
pub const LAYOUT_X: f64 = 250.0;
/// Vertical distance between consecutive nodes in the generated layout.
pub const LAYOUT_ROW_HEIGHT: f64 = 150.0;

pub const START_NODE_ID: &str = "start";
pub const END_NODE_ID: &str = "end";

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

impl Position {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Start,
    Step,
    Decision,
    End,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionCondition {
    pub value: String,
    pub target_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionNode {
    pub question: String,
    pub conditions: Vec<DecisionCondition>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NodeData {
    Step(WorkflowStep),
    Decision(DecisionNode),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowNode {
    pub id: String,
    pub kind: NodeKind,
    pub data: NodeData,
    pub position: Position,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowEdge {
    pub id: String,
    pub source: String,
    pub target: String,
    pub label: Option<String>,
    pub condition: Option<String>,
}

impl WorkflowEdge {
    pub fn new(id: impl Into<String>, source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            target: target.into(),
            label: None,
            condition: None,
        }
    }
}

/// Partial node update. `None` leaves the field as is.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodePatch {
    pub kind: Option<NodeKind>,
    pub data: Option<NodeData>,
    pub position: Option<Position>,
}

/// Partial edge update. `Some(None)` clears an optional field.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EdgePatch {
    pub source: Option<String>,
    pub target: Option<String>,
    pub label: Option<Option<String>>,
    pub condition: Option<Option<String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowGraph {
    pub nodes: Vec<WorkflowNode>,
    pub edges: Vec<WorkflowEdge>,
}

impl WorkflowGraph {
    pub fn node(&self, id: &str) -> Option<&WorkflowNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn edge(&self, id: &str) -> Option<&WorkflowEdge> {
        self.edges.iter().find(|e| e.id == id)
    }

    /// Insert a node with a fresh id and return that id.
    pub fn add_node(&mut self, kind: NodeKind, data: NodeData, position: Position) -> String {
        let id = Uuid::new_v4().to_string();
        self.nodes.push(WorkflowNode {
            id: id.clone(),
            kind,
            data,
            position,
        });
        id
    }

    /// Returns `false` if no node has this id.
    pub fn update_node(&mut self, id: &str, patch: NodePatch) -> bool {
        let Some(node) = self.nodes.iter_mut().find(|n| n.id == id) else {
            return false;
        };
        if let Some(kind) = patch.kind {
            node.kind = kind;
        }
        if let Some(data) = patch.data {
            node.data = data;
        }
        if let Some(position) = patch.position {
            node.position = position;
        }
        true
    }

    /// Remove a node and every edge touching it.
    pub fn remove_node(&mut self, id: &str) -> bool {
        let before = self.nodes.len();
        self.nodes.retain(|n| n.id != id);
        if self.nodes.len() == before {
            return false;
        }
        self.edges.retain(|e| e.source != id && e.target != id);
        true
    }

    /// Insert an edge with a fresh id and return that id.
    pub fn add_edge(&mut self, source: impl Into<String>, target: impl Into<String>, label: Option<String>) -> String {
        let id = Uuid::new_v4().to_string();
        let mut edge = WorkflowEdge::new(id.clone(), source, target);
        edge.label = label;
        self.edges.push(edge);
        id
    }

    pub fn update_edge(&mut self, id: &str, patch: EdgePatch) -> bool {
        let Some(edge) = self.edges.iter_mut().find(|e| e.id == id) else {
            return false;
        };
        if let Some(source) = patch.source {
            edge.source = source;
        }
        if let Some(target) = patch.target {
            edge.target = target;
        }
        if let Some(label) = patch.label {
            edge.label = label;
        }
        if let Some(condition) = patch.condition {
            edge.condition = condition;
        }
        true
    }

    pub fn remove_edge(&mut self, id: &str) -> bool {
        let before = self.edges.len();
        self.edges.retain(|e| e.id != id);
        self.edges.len() != before
    }

    /// Step payloads carried by `Step` nodes, in node order.
    pub fn step_nodes(&self) -> impl Iterator<Item = &WorkflowStep> {
        self.nodes.iter().filter_map(|n| match (&n.kind, &n.data) {
            (NodeKind::Step, NodeData::Step(step)) => Some(step),
            _ => None,
        })
    }
}

fn marker_node(id: &str, kind: NodeKind, name: &str, description: &str, row: usize) -> WorkflowNode {
    WorkflowNode {
        id: id.to_string(),
        kind,
        data: NodeData::Step(WorkflowStep::new(id, name, description)),
        position: Position::new(LAYOUT_X, row as f64 * LAYOUT_ROW_HEIGHT),
    }
}

/// Build the chained graph for an ordered step list.
pub fn linear_to_graph(steps: &[WorkflowStep]) -> WorkflowGraph {
    let mut nodes = Vec::with_capacity(steps.len() + 2);
    nodes.push(marker_node(START_NODE_ID, NodeKind::Start, "Start", "Start of workflow", 0));
    nodes.extend(steps.iter().enumerate().map(|(i, step)| WorkflowNode {
        id: step.id.clone(),
        kind: NodeKind::Step,
        data: NodeData::Step(step.clone()),
        position: Position::new(LAYOUT_X, (i + 1) as f64 * LAYOUT_ROW_HEIGHT),
    }));
    nodes.push(marker_node(END_NODE_ID, NodeKind::End, "End", "End of workflow", steps.len() + 1));

    let mut edges = Vec::with_capacity(steps.len() + 1);
    let first = steps.first().map_or(END_NODE_ID, |s| s.id.as_str());
    edges.push(WorkflowEdge::new("start-to-first", START_NODE_ID, first));
    for pair in steps.windows(2) {
        let (a, b) = (&pair[0].id, &pair[1].id);
        edges.push(WorkflowEdge::new(format!("{a}-to-{b}"), a.as_str(), b.as_str()));
    }
    if let Some(last) = steps.last() {
        edges.push(WorkflowEdge::new("last-to-end", last.id.as_str(), END_NODE_ID));
    }

    WorkflowGraph { nodes, edges }
}

/// Flatten a graph back to an ordered step list.
///
/// `retained` is the step list kept alongside the graph. Its order wins;
/// step nodes with a matching id contribute their (possibly edited) data,
/// and step nodes added while in graph form are appended in node order.
/// Steps whose node was removed are kept, never dropped.
pub fn graph_to_linear(graph: &WorkflowGraph, retained: &[WorkflowStep]) -> Vec<WorkflowStep> {
    let mut steps: Vec<WorkflowStep> = retained
        .iter()
        .map(|step| {
            graph
                .step_nodes()
                .find(|s| s.id == step.id)
                .cloned()
                .unwrap_or_else(|| step.clone())
        })
        .collect();

    for step in graph.step_nodes() {
        if !retained.iter().any(|r| r.id == step.id) {
            steps.push(step.clone());
        }
    }
    steps
}

#[cfg(test)]
mod tests {
    use super::*;

    fn three_steps() -> Vec<WorkflowStep> {
        vec![
            WorkflowStep::new("step1", "Collect", "Collect invoices"),
            WorkflowStep::new("step2", "Check", "Check totals"),
            WorkflowStep::new("step3", "Pay", "Schedule payment"),
        ]
    }

    #[test]
    fn test_linear_to_graph_layout() {
        let graph = linear_to_graph(&three_steps());

        assert_eq!(graph.nodes.len(), 5);
        assert_eq!(graph.nodes[0].id, START_NODE_ID);
        assert_eq!(graph.nodes[0].position, Position::new(250.0, 0.0));
        assert_eq!(graph.nodes[2].position, Position::new(250.0, 300.0));
        assert_eq!(graph.nodes[4].id, END_NODE_ID);
        assert_eq!(graph.nodes[4].position, Position::new(250.0, 600.0));

        let chain: Vec<(&str, &str)> = graph
            .edges
            .iter()
            .map(|e| (e.source.as_str(), e.target.as_str()))
            .collect();
        assert_eq!(
            chain,
            vec![("start", "step1"), ("step1", "step2"), ("step2", "step3"), ("step3", "end")]
        );
    }

    #[test]
    fn test_empty_steps_link_start_to_end() {
        let graph = linear_to_graph(&[]);
        assert_eq!(graph.nodes.len(), 2);
        assert_eq!(graph.edges.len(), 1);
        assert_eq!(graph.edges[0].source, START_NODE_ID);
        assert_eq!(graph.edges[0].target, END_NODE_ID);
    }

    #[test]
    fn test_roundtrip_preserves_steps() {
        let steps = three_steps();
        let graph = linear_to_graph(&steps);
        assert_eq!(graph_to_linear(&graph, &steps), steps);
    }

    #[test]
    fn test_flatten_picks_up_graph_edits() {
        let steps = three_steps();
        let mut graph = linear_to_graph(&steps);

        let mut edited = steps[1].clone();
        edited.name = "Verify".into();
        assert!(graph.update_node(
            "step2",
            NodePatch {
                data: Some(NodeData::Step(edited)),
                ..NodePatch::default()
            }
        ));
        let added = WorkflowStep::new("step4", "Archive", "File the invoice");
        graph.add_node(NodeKind::Step, NodeData::Step(added), Position::new(500.0, 150.0));
        assert!(graph.remove_node("step3"));

        let flat = graph_to_linear(&graph, &steps);
        let names: Vec<&str> = flat.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["Collect", "Verify", "Pay", "Archive"]);
    }

    #[test]
    fn test_remove_node_drops_incident_edges() {
        let mut graph = linear_to_graph(&three_steps());
        assert!(graph.remove_node("step2"));
        assert!(graph.edges.iter().all(|e| e.source != "step2" && e.target != "step2"));
        assert!(!graph.remove_node("step2"));
    }

    #[test]
    fn test_edge_crud() {
        let mut graph = linear_to_graph(&three_steps());
        let id = graph.add_edge("step1", "step3", Some("skip".into()));
        assert!(graph.update_edge(
            &id,
            EdgePatch {
                condition: Some(Some("amount < 100".into())),
                label: Some(None),
                ..EdgePatch::default()
            }
        ));
        let edge = graph.edge(&id).unwrap();
        assert_eq!(edge.condition.as_deref(), Some("amount < 100"));
        assert!(edge.label.is_none());
        assert!(graph.remove_edge(&id));
        assert!(!graph.remove_edge(&id));
    }
}
