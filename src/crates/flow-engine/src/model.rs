//! The diagram data model: nodes, edges, and the indexes built over them.
//!
//! The engine does not parse diagrams from source formats — it consumes an
//! already-compiled [`Diagram`]. Construction here is plain data assembly;
//! no graph-structure validation beyond what [`Diagram::compile`] checks.

use std::collections::HashMap;

use serde_json::Value;

use crate::envelope::{ContentType, TransformRule};
use crate::error::{EngineError, Result};

/// Canonical output ports for condition nodes.
pub const PORT_COND_TRUE: &str = "condtrue";
/// Canonical output ports for condition nodes.
pub const PORT_COND_FALSE: &str = "condfalse";
/// The port/input name used when an edge declares no explicit label.
pub const DEFAULT_PORT: &str = "default";

/// A node's computational role.
///
/// This is a closed tag set read directly by the core (`Start` and
/// `Condition` drive scheduling special-cases); everything else is an
/// opaque `Other` handled entirely by the registered handler.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum NodeType {
    /// Diagram entry point; ready iff its execution count is zero.
    Start,
    /// Terminal node; execution completes once every reachable endpoint is
    /// in a terminal state.
    Endpoint,
    /// Emits on exactly one of `condtrue`/`condfalse` per invocation.
    Condition,
    /// Supports the "first" special input and per-node `max_iteration`.
    PersonJob,
    /// Any other handler-defined node type, identified by name.
    Other(String),
}

impl NodeType {
    /// Parse a node type tag from a diagram's node definition.
    pub fn parse(tag: &str) -> Self {
        match tag {
            "start" => NodeType::Start,
            "endpoint" => NodeType::Endpoint,
            "condition" => NodeType::Condition,
            "person_job" => NodeType::PersonJob,
            other => NodeType::Other(other.to_string()),
        }
    }

    /// The handler-registry key for this node type.
    pub fn registry_key(&self) -> &str {
        match self {
            NodeType::Start => "start",
            NodeType::Endpoint => "endpoint",
            NodeType::Condition => "condition",
            NodeType::PersonJob => "person_job",
            NodeType::Other(name) => name.as_str(),
        }
    }
}

/// A node's static configuration.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Cap on invocations per epoch; `None` falls back to the engine-wide
    /// safety cap.
    pub max_iteration: Option<u32>,
    /// Whether a condition node's outgoing edges may be dropped from a
    /// fan-in target's required set when that target has other sources.
    pub skippable: bool,
    /// Arbitrary handler-specific configuration.
    pub params: Value,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            max_iteration: None,
            skippable: false,
            params: Value::Null,
        }
    }
}

/// A node in the diagram.
#[derive(Debug, Clone)]
pub struct Node {
    /// Unique id, stable across an execution.
    pub id: String,
    /// Computational role.
    pub node_type: NodeType,
    /// Static configuration.
    pub config: NodeConfig,
}

impl Node {
    /// Build a node with default configuration.
    pub fn new(id: impl Into<String>, node_type: NodeType) -> Self {
        Self {
            id: id.into(),
            node_type,
            config: NodeConfig::default(),
        }
    }

    /// Build a node with explicit configuration.
    pub fn with_config(id: impl Into<String>, node_type: NodeType, config: NodeConfig) -> Self {
        Self {
            id: id.into(),
            node_type,
            config,
        }
    }
}

/// A directed edge from one node's output port to another's input port.
#[derive(Debug, Clone)]
pub struct Edge {
    /// Unique id, stable across an execution.
    pub id: String,
    /// Source node id.
    pub source_node_id: String,
    /// Source output port (`"default"`, `"condtrue"`, `"condfalse"`, …).
    pub source_output: String,
    /// Target node id.
    pub target_node_id: String,
    /// Target input port (`"default"`, `"first"`, …).
    pub target_input: String,
    /// Content type this edge expects its payload to arrive as.
    pub content_type: ContentType,
    /// Value-transformation rules applied before coercion.
    pub transform_rules: Vec<TransformRule>,
    /// Higher runs first among siblings sharing a source.
    pub execution_priority: i32,
}

impl Edge {
    /// `true` iff this edge carries a condition node's branch decision.
    pub fn is_conditional(&self) -> bool {
        self.source_output == PORT_COND_TRUE || self.source_output == PORT_COND_FALSE
    }
}

/// A compiled diagram: nodes, edges, and the indexes the scheduler and
/// resolver need to avoid rescanning the edge list on every lookup.
#[derive(Debug, Clone)]
pub struct Diagram {
    nodes: HashMap<String, Node>,
    edges: HashMap<String, Edge>,
    incoming: HashMap<String, Vec<String>>,
    outgoing: HashMap<String, Vec<String>>,
    node_order: Vec<String>,
}

impl Diagram {
    /// Compile nodes and edges into an indexed diagram.
    ///
    /// Validates that every edge references nodes present in `nodes`.
    pub fn compile(nodes: Vec<Node>, edges: Vec<Edge>) -> Result<Self> {
        let mut node_order = Vec::with_capacity(nodes.len());
        let mut node_map = HashMap::with_capacity(nodes.len());
        for node in nodes {
            node_order.push(node.id.clone());
            node_map.insert(node.id.clone(), node);
        }

        let mut incoming: HashMap<String, Vec<String>> = HashMap::new();
        let mut outgoing: HashMap<String, Vec<String>> = HashMap::new();
        let mut edge_map = HashMap::with_capacity(edges.len());

        for edge in edges {
            if !node_map.contains_key(&edge.source_node_id) {
                return Err(EngineError::Validation(format!(
                    "edge '{}' references unknown source node '{}'",
                    edge.id, edge.source_node_id
                )));
            }
            if !node_map.contains_key(&edge.target_node_id) {
                return Err(EngineError::Validation(format!(
                    "edge '{}' references unknown target node '{}'",
                    edge.id, edge.target_node_id
                )));
            }
            outgoing
                .entry(edge.source_node_id.clone())
                .or_default()
                .push(edge.id.clone());
            incoming
                .entry(edge.target_node_id.clone())
                .or_default()
                .push(edge.id.clone());
            edge_map.insert(edge.id.clone(), edge);
        }

        Ok(Self {
            nodes: node_map,
            edges: edge_map,
            incoming,
            outgoing,
            node_order,
        })
    }

    /// Look up a node by id.
    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    /// Look up an edge by id.
    pub fn edge(&self, id: &str) -> Option<&Edge> {
        self.edges.get(id)
    }

    /// All nodes, in the order they were supplied to [`Diagram::compile`].
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.node_order.iter().filter_map(move |id| self.nodes.get(id))
    }

    /// Incoming edges for a node, in no particular order.
    pub fn incoming_edges(&self, node_id: &str) -> impl Iterator<Item = &Edge> {
        self.incoming
            .get(node_id)
            .into_iter()
            .flatten()
            .filter_map(move |id| self.edges.get(id))
    }

    /// Outgoing edges for a node, in no particular order.
    pub fn outgoing_edges(&self, node_id: &str) -> impl Iterator<Item = &Edge> {
        self.outgoing
            .get(node_id)
            .into_iter()
            .flatten()
            .filter_map(move |id| self.edges.get(id))
    }

    /// Count of distinct source nodes feeding into `node_id`.
    pub fn distinct_source_count(&self, node_id: &str) -> usize {
        let mut sources: Vec<&str> = self
            .incoming_edges(node_id)
            .map(|e| e.source_node_id.as_str())
            .collect();
        sources.sort_unstable();
        sources.dedup();
        sources.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn edge(id: &str, src: &str, out: &str, tgt: &str, inp: &str) -> Edge {
        Edge {
            id: id.into(),
            source_node_id: src.into(),
            source_output: out.into(),
            target_node_id: tgt.into(),
            target_input: inp.into(),
            content_type: ContentType::RawText,
            transform_rules: vec![],
            execution_priority: 0,
        }
    }

    #[test]
    fn compile_rejects_dangling_edge() {
        let nodes = vec![Node::new("a", NodeType::Start)];
        let edges = vec![edge("e1", "a", "default", "missing", "default")];
        assert!(Diagram::compile(nodes, edges).is_err());
    }

    #[test]
    fn distinct_source_count_dedupes_multi_edges_from_same_source() {
        let nodes = vec![
            Node::new("a", NodeType::Start),
            Node::new("b", NodeType::Other("x".into())),
        ];
        let edges = vec![
            edge("e1", "a", "default", "b", "one"),
            edge("e2", "a", "condtrue", "b", "two"),
        ];
        let diagram = Diagram::compile(nodes, edges).unwrap();
        assert_eq!(diagram.distinct_source_count("b"), 1);
    }

    #[test]
    fn is_conditional_detects_branch_ports() {
        let e = edge("e1", "a", PORT_COND_TRUE, "b", DEFAULT_PORT);
        assert!(e.is_conditional());
        let e2 = edge("e2", "a", DEFAULT_PORT, "b", DEFAULT_PORT);
        assert!(!e2.is_conditional());
    }
}
