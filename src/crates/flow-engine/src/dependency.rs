//! Static dependency bootstrap: zero-indegree seeding and the
//! priority-dependency map used to withhold lower-priority siblings.
//!
//! After bootstrap, readiness is entirely token-driven (see
//! [`crate::token::TokenManager::has_new_inputs`]); this module only
//! answers "what can run before any token has been published".

use std::collections::HashMap;

use crate::model::Diagram;

/// Precomputed dependency bookkeeping derived once from a diagram's static
/// edge structure.
#[derive(Debug)]
pub struct DependencyTracker {
    indegree: HashMap<String, usize>,
    /// For a source node with differently-prioritized outgoing edges, the
    /// lower-priority targets that should wait on the higher-priority ones.
    priority_dependencies: HashMap<String, Vec<String>>,
}

impl DependencyTracker {
    /// Build the tracker from a diagram's edges.
    ///
    /// Conditional edges (condition-node branches) never contribute to
    /// static indegree — their targets become ready purely from tokens.
    /// Skippable-condition edges into a multi-source target are excluded
    /// too, mirroring the token manager's skippable-edge rule so bootstrap
    /// and steady-state readiness agree.
    pub fn build(diagram: &Diagram) -> Self {
        let mut indegree: HashMap<String, usize> = HashMap::new();
        for node in diagram.nodes() {
            indegree.insert(node.id.clone(), 0);
        }

        for node in diagram.nodes() {
            for edge in diagram.incoming_edges(&node.id) {
                if edge.is_conditional() {
                    continue;
                }
                let source_skippable = diagram
                    .node(&edge.source_node_id)
                    .map(|n| matches!(n.node_type, crate::model::NodeType::Condition) && n.config.skippable)
                    .unwrap_or(false);
                if source_skippable && diagram.distinct_source_count(&node.id) > 1 {
                    continue;
                }
                *indegree.entry(node.id.clone()).or_insert(0) += 1;
            }
        }

        let mut priority_dependencies: HashMap<String, Vec<String>> = HashMap::new();
        for node in diagram.nodes() {
            let mut siblings: Vec<(i32, String)> = diagram
                .outgoing_edges(&node.id)
                .map(|e| (e.execution_priority, e.target_node_id.clone()))
                .collect();
            if siblings.len() < 2 {
                continue;
            }
            siblings.sort_by(|a, b| b.0.cmp(&a.0));
            for window in siblings.windows(2) {
                let (higher_prio, higher_target) = &window[0];
                let (lower_prio, lower_target) = &window[1];
                if higher_prio > lower_prio {
                    priority_dependencies
                        .entry(lower_target.clone())
                        .or_default()
                        .push(higher_target.clone());
                }
            }
        }

        Self {
            indegree,
            priority_dependencies,
        }
    }

    /// Nodes with zero static indegree: the initial ready set before any
    /// token has been published.
    pub fn zero_indegree_nodes(&self) -> Vec<String> {
        self.indegree
            .iter()
            .filter(|(_, &count)| count == 0)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Higher-priority siblings (sharing a source with `node_id`) that
    /// `node_id` should wait behind.
    pub fn priority_blockers(&self, node_id: &str) -> &[String] {
        self.priority_dependencies
            .get(node_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::ContentType;
    use crate::model::{Edge, Node, NodeType, DEFAULT_PORT, PORT_COND_TRUE};

    fn edge(id: &str, src: &str, out: &str, tgt: &str, prio: i32) -> Edge {
        Edge {
            id: id.into(),
            source_node_id: src.into(),
            source_output: out.into(),
            target_node_id: tgt.into(),
            target_input: DEFAULT_PORT.into(),
            content_type: ContentType::RawText,
            transform_rules: vec![],
            execution_priority: prio,
        }
    }

    #[test]
    fn zero_indegree_includes_unconnected_start() {
        let nodes = vec![Node::new("a", NodeType::Start)];
        let diagram = Diagram::compile(nodes, vec![]).unwrap();
        let dep = DependencyTracker::build(&diagram);
        assert_eq!(dep.zero_indegree_nodes(), vec!["a".to_string()]);
    }

    #[test]
    fn conditional_edges_excluded_from_static_indegree() {
        let nodes = vec![
            Node::new("c", NodeType::Condition),
            Node::new("t", NodeType::Other("x".into())),
        ];
        let edges = vec![edge("e1", "c", PORT_COND_TRUE, "t", 0)];
        let diagram = Diagram::compile(nodes, edges).unwrap();
        let dep = DependencyTracker::build(&diagram);
        let zero: Vec<String> = dep.zero_indegree_nodes();
        assert!(zero.contains(&"t".to_string()));
    }

    #[test]
    fn priority_dependency_orders_siblings() {
        let nodes = vec![
            Node::new("s", NodeType::Start),
            Node::new("h", NodeType::Other("x".into())),
            Node::new("l", NodeType::Other("x".into())),
        ];
        let edges = vec![
            edge("eh", "s", DEFAULT_PORT, "h", 10),
            edge("el", "s", DEFAULT_PORT, "l", 0),
        ];
        let diagram = Diagram::compile(nodes, edges).unwrap();
        let dep = DependencyTracker::build(&diagram);
        assert_eq!(dep.priority_blockers("l"), &["h".to_string()]);
        assert!(dep.priority_blockers("h").is_empty());
    }
}
