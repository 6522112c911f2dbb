//! The token manager: publishes and consumes tokens on edges, tracks the
//! current epoch, records condition branch decisions, and answers the
//! scheduler's readiness questions.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::Utc;

use crate::envelope::Envelope;
use crate::model::{Diagram, Edge, NodeType, DEFAULT_PORT, PORT_COND_FALSE, PORT_COND_TRUE};
use crate::state::StateTracker;
use crate::token::types::{JoinPolicy, Token};

#[derive(Debug, Default)]
struct Inner {
    epoch: u64,
    edge_seq: HashMap<(String, u64), u64>,
    tokens: HashMap<(String, u64, u64), Envelope>,
    last_consumed: HashMap<(String, String, u64), u64>,
    branch_decisions: HashMap<String, String>,
}

/// Owns the edge/epoch token tables for one execution. All mutation happens
/// under a single lock; handler execution never happens while it is held.
#[derive(Debug, Default)]
pub struct TokenManager {
    inner: Mutex<Inner>,
}

impl TokenManager {
    /// Construct an empty token manager starting at epoch 0.
    pub fn new() -> Self {
        Self::default()
    }

    /// The epoch new tokens are published into unless told otherwise.
    pub fn current_epoch(&self) -> u64 {
        self.inner.lock().unwrap().epoch
    }

    /// Advance to a new epoch and return it. Loop controllers call this
    /// explicitly; the engine never calls it implicitly (see design notes
    /// on epoch isolation).
    pub fn begin_epoch(&self) -> u64 {
        let mut inner = self.inner.lock().unwrap();
        inner.epoch += 1;
        inner.epoch
    }

    /// Publish a single envelope as a token on `edge_id` within `epoch`.
    pub fn publish_token(&self, edge_id: &str, epoch: u64, envelope: Envelope) -> Token {
        let mut inner = self.inner.lock().unwrap();
        let seq_entry = inner.edge_seq.entry((edge_id.to_string(), epoch)).or_insert(0);
        *seq_entry += 1;
        let seq = *seq_entry;
        inner
            .tokens
            .insert((edge_id.to_string(), epoch, seq), envelope.clone());
        tracing::debug!(edge_id, epoch, seq, "published token");
        Token { epoch, seq, envelope, ts: Utc::now() }
    }

    /// Publish a node's per-port outputs onto its outgoing edges.
    ///
    /// Edges whose `source_output` has no matching entry in `outputs` are
    /// skipped — that's how a condition node emits on exactly one branch.
    /// For condition nodes, the branch actually taken is recorded so later
    /// readiness checks can filter the edge that wasn't.
    pub fn emit_outputs(
        &self,
        diagram: &Diagram,
        node_id: &str,
        node_type: &NodeType,
        epoch: u64,
        outputs: &HashMap<String, Envelope>,
    ) {
        if matches!(node_type, NodeType::Condition) {
            let decision = if outputs.contains_key(PORT_COND_TRUE) {
                Some(PORT_COND_TRUE)
            } else if outputs.contains_key(PORT_COND_FALSE) {
                Some(PORT_COND_FALSE)
            } else {
                None
            };
            if let Some(decision) = decision {
                self.inner
                    .lock()
                    .unwrap()
                    .branch_decisions
                    .insert(node_id.to_string(), decision.to_string());
            }
        }

        let edges: Vec<Edge> = diagram.outgoing_edges(node_id).cloned().collect();
        for edge in edges {
            if let Some(envelope) = outputs.get(edge.source_output.as_str()) {
                self.publish_token(&edge.id, epoch, envelope.clone());
            }
        }
    }

    /// Collect every not-yet-consumed inbound token for `node_id`, keyed by
    /// the edge's `target_input` (or `"default"`).
    pub fn consume_inbound(&self, diagram: &Diagram, node_id: &str, epoch: u64) -> HashMap<String, Envelope> {
        let mut inner = self.inner.lock().unwrap();
        let mut out = HashMap::new();
        let edges: Vec<Edge> = diagram.incoming_edges(node_id).cloned().collect();
        for edge in edges {
            let seq = inner
                .edge_seq
                .get(&(edge.id.clone(), epoch))
                .copied()
                .unwrap_or(0);
            let consumed = inner
                .last_consumed
                .get(&(node_id.to_string(), edge.id.clone(), epoch))
                .copied()
                .unwrap_or(0);
            if seq > consumed {
                if let Some(envelope) = inner.tokens.get(&(edge.id.clone(), epoch, seq)) {
                    let key = if edge.target_input.is_empty() {
                        DEFAULT_PORT.to_string()
                    } else {
                        edge.target_input.clone()
                    };
                    out.insert(key, envelope.clone());
                }
                inner
                    .last_consumed
                    .insert((node_id.to_string(), edge.id.clone(), epoch), seq);
            }
        }
        out
    }

    /// Evaluate whether `node_id` has enough new inbound tokens to run,
    /// per the skippable-edge promotion and branch-filtering rules.
    pub fn has_new_inputs(
        &self,
        diagram: &Diagram,
        state: &StateTracker,
        node_id: &str,
        epoch: u64,
        join_policy: &JoinPolicy,
    ) -> bool {
        let incoming: Vec<Edge> = diagram.incoming_edges(node_id).cloned().collect();
        if incoming.is_empty() {
            return true;
        }

        let exec_count = state.get_execution_count(node_id);
        let relevant: Vec<Edge> = incoming
            .into_iter()
            .filter(|e| {
                let source_is_start = diagram
                    .node(&e.source_node_id)
                    .map(|n| matches!(n.node_type, NodeType::Start))
                    .unwrap_or(false);
                !(source_is_start && exec_count > 0)
            })
            .collect();
        if relevant.is_empty() {
            return false;
        }

        let distinct_sources = diagram.distinct_source_count(node_id);
        let (mut skippable, mut active): (Vec<Edge>, Vec<Edge>) = (Vec::new(), Vec::new());
        for edge in relevant {
            let source_skippable = diagram
                .node(&edge.source_node_id)
                .map(|n| matches!(n.node_type, NodeType::Condition) && n.config.skippable)
                .unwrap_or(false);
            if source_skippable && distinct_sources > 1 {
                skippable.push(edge);
            } else {
                active.push(edge);
            }
        }

        // Deadlock avoidance: if every relevant edge was skippable, none of
        // them can be dropped, or the node would never become ready.
        if active.is_empty() && !skippable.is_empty() {
            active = skippable;
        }

        let inner = self.inner.lock().unwrap();
        let mut relevant_count = 0usize;
        let mut fresh_count = 0usize;
        for edge in &active {
            if edge.is_conditional() {
                let decision = inner.branch_decisions.get(&edge.source_node_id);
                if let Some(decision) = decision {
                    if decision != &edge.source_output {
                        continue;
                    }
                }
            }
            relevant_count += 1;
            let seq = inner
                .edge_seq
                .get(&(edge.id.clone(), epoch))
                .copied()
                .unwrap_or(0);
            let consumed = inner
                .last_consumed
                .get(&(node_id.to_string(), edge.id.clone(), epoch))
                .copied()
                .unwrap_or(0);
            if seq > consumed {
                fresh_count += 1;
            }
        }

        join_policy.is_ready(relevant_count, fresh_count)
    }

    /// The branch decision recorded for a condition node, if it has run.
    pub fn branch_decision(&self, node_id: &str) -> Option<String> {
        self.inner.lock().unwrap().branch_decisions.get(node_id).cloned()
    }
}
