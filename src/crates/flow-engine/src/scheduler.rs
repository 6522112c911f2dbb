//! The scheduler: assembles per-node policies, seeds the initial ready set,
//! and answers "which nodes can run right now".
//!
//! Bootstrap readiness comes from [`crate::dependency::DependencyTracker`];
//! steady-state readiness is delegated to
//! [`crate::token::TokenManager::has_new_inputs`]. The scheduler's own job
//! is gluing those two together with loop caps, priority ordering, and
//! concurrency-policy gating.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::dependency::DependencyTracker;
use crate::model::{Diagram, NodeType};
use crate::state::StateTracker;
use crate::token::{ConcurrencyPolicy, JoinPolicy, TokenManager};

/// Stable sort key used to order a ready batch: earlier classes run first.
fn priority_class(node_type: &NodeType) -> u8 {
    match node_type {
        NodeType::Start => 0,
        NodeType::Condition => 1,
        NodeType::PersonJob => 2,
        _ => 3,
    }
}

/// Schedules node invocations over a diagram: combines static dependency
/// bootstrap, token-driven readiness, loop caps, and concurrency policies.
pub struct NodeScheduler {
    dependency: DependencyTracker,
    join_policies: HashMap<String, JoinPolicy>,
    concurrency_policies: HashMap<String, ConcurrencyPolicy>,
    running: Mutex<HashMap<(String, u64), usize>>,
    /// Fallback per-epoch iteration cap for nodes with no explicit
    /// `max_iteration`, sourced from [`crate::config::EngineConfig::max_iterations_per_epoch`].
    default_max_iterations: u32,
}

impl NodeScheduler {
    /// Build a scheduler for `diagram`, assembling default join and
    /// concurrency policies for every node. `default_max_iterations` is the
    /// configured engine-wide iteration cap applied to nodes that declare no
    /// `max_iteration` of their own.
    pub fn new(diagram: &Diagram, default_max_iterations: u32) -> Self {
        let dependency = DependencyTracker::build(diagram);
        let mut join_policies = HashMap::new();
        let mut concurrency_policies = HashMap::new();
        for node in diagram.nodes() {
            join_policies.insert(node.id.clone(), JoinPolicy::default_for(&node.node_type));
            concurrency_policies.insert(node.id.clone(), ConcurrencyPolicy::default());
        }
        Self {
            dependency,
            join_policies,
            concurrency_policies,
            running: Mutex::new(HashMap::new()),
            default_max_iterations,
        }
    }

    /// Override a node's join policy (defaults assembled in [`Self::new`]).
    pub fn set_join_policy(&mut self, node_id: &str, policy: JoinPolicy) {
        self.join_policies.insert(node_id.to_string(), policy);
    }

    /// Override a node's concurrency policy (defaults assembled in [`Self::new`]).
    pub fn set_concurrency_policy(&mut self, node_id: &str, policy: ConcurrencyPolicy) {
        self.concurrency_policies.insert(node_id.to_string(), policy);
    }

    /// The initial ready set before any token has been published, derived
    /// from static zero-indegree nodes.
    pub fn bootstrap_ready_nodes(&self) -> Vec<String> {
        self.dependency.zero_indegree_nodes()
    }

    /// Compute the set of nodes ready to run in `epoch`, in dispatch order.
    pub fn get_ready_nodes(&self, diagram: &Diagram, token_manager: &TokenManager, state: &StateTracker, epoch: u64) -> Vec<String> {
        let mut ready: Vec<(u8, i64, String)> = Vec::new();

        for node in diagram.nodes() {
            let has_incoming = diagram.incoming_edges(&node.id).next().is_some();

            let is_ready = if matches!(node.node_type, NodeType::Start) && !has_incoming {
                state.get_execution_count(&node.id) == 0
            } else {
                let join_policy = self
                    .join_policies
                    .get(&node.id)
                    .cloned()
                    .unwrap_or(JoinPolicy::All);
                token_manager.has_new_inputs(diagram, state, &node.id, epoch, &join_policy)
                    && state.can_execute_in_loop(&node.id, epoch, node.config.max_iteration, self.default_max_iterations)
                    && !self.has_pending_higher_priority_siblings(state, &node.id)
            };

            if !is_ready {
                continue;
            }

            let concurrency = self
                .concurrency_policies
                .get(&node.id)
                .copied()
                .unwrap_or_default();
            let running_count = *self
                .running
                .lock()
                .unwrap()
                .get(&(node.id.clone(), epoch))
                .unwrap_or(&0);
            if !concurrency.can_arm(running_count) {
                continue;
            }

            ready.push((priority_class(&node.node_type), node.config.max_iteration.unwrap_or(0) as i64, node.id.clone()));
        }

        ready.sort_by(|a, b| a.0.cmp(&b.0));
        ready.into_iter().map(|(_, _, id)| id).collect()
    }

    fn has_pending_higher_priority_siblings(&self, state: &StateTracker, node_id: &str) -> bool {
        self.dependency
            .priority_blockers(node_id)
            .iter()
            .any(|blocker| !state.get_node_state(blocker).is_terminal())
    }

    /// Record that a node started running in `epoch` (bumps the in-flight
    /// counter used by concurrency-policy gating).
    pub fn mark_node_running(&self, node_id: &str, epoch: u64) {
        let mut running = self.running.lock().unwrap();
        *running.entry((node_id.to_string(), epoch)).or_insert(0) += 1;
    }

    /// Record that a node's invocation finished (success, failure, or
    /// maxiter), freeing one concurrency slot.
    pub fn mark_node_complete(&self, node_id: &str, epoch: u64) {
        let mut running = self.running.lock().unwrap();
        if let Some(count) = running.get_mut(&(node_id.to_string(), epoch)) {
            *count = count.saturating_sub(1);
        }
    }

    /// Snapshot of per-node current in-flight counts, for observability.
    pub fn get_execution_stats(&self, epoch: u64) -> HashMap<String, usize> {
        self.running
            .lock()
            .unwrap()
            .iter()
            .filter(|((_, e), _)| *e == epoch)
            .map(|((node, _), count)| (node.clone(), *count))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{ContentType, Envelope};
    use crate::model::{Edge, Node, DEFAULT_PORT};

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
    fn unconnected_start_is_ready_once_then_not_again() {
        let nodes = vec![Node::new("s", NodeType::Start)];
        let diagram = Diagram::compile(nodes, vec![]).unwrap();
        let scheduler = NodeScheduler::new(&diagram, crate::state::DEFAULT_MAX_ITERATIONS_PER_EPOCH);
        let tm = TokenManager::new();
        let state = StateTracker::new();
        state.initialize_node("s");

        assert_eq!(scheduler.get_ready_nodes(&diagram, &tm, &state, 0), vec!["s".to_string()]);
        state.transition_to_running("s", 0);
        state.transition_to_completed("s", Envelope::empty("s"));
        assert!(scheduler.get_ready_nodes(&diagram, &tm, &state, 0).is_empty());
    }

    #[test]
    fn higher_priority_sibling_withholds_lower_priority() {
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
        let scheduler = NodeScheduler::new(&diagram, crate::state::DEFAULT_MAX_ITERATIONS_PER_EPOCH);
        let tm = TokenManager::new();
        let state = StateTracker::new();
        for id in ["s", "h", "l"] {
            state.initialize_node(id);
        }
        tm.publish_token("eh", 0, Envelope::empty("s"));
        tm.publish_token("el", 0, Envelope::empty("s"));

        let ready = scheduler.get_ready_nodes(&diagram, &tm, &state, 0);
        assert!(ready.contains(&"h".to_string()));
        assert!(!ready.contains(&"l".to_string()));
    }
}
