//! Input resolution: turns a node's incoming tokens into the `{port ->
//! envelope}` map its handler actually receives.
//!
//! Pipeline: select eligible edges (source completed, iteration/branch_id
//! match), apply the PersonJob "first" filter, coerce/transform each value,
//! pack into ports, merge process-wide variables, then fill in declared
//! defaults.

use std::collections::HashMap;

use serde_json::Value;

use crate::envelope::{apply_rules, coerce, ContentType, Envelope};
use crate::error::{EngineError, Result};
use crate::model::{Diagram, Node, DEFAULT_PORT};
use crate::state::{NodeState, StateTracker};
use crate::token::TokenManager;

/// A required input with no value and no declared default.
fn missing_input(node: &Node, input: &str) -> EngineError {
    EngineError::input_resolution(node.id.clone(), input)
}

/// Resolve the full input map for `node`, given its freshly consumed
/// tokens and the process-wide variables map.
///
/// `strict_io` controls whether unconvertible content-type coercions error
/// (`true`) or pass through with a warning (`false`), per
/// [`crate::envelope::coerce`].
pub fn resolve_inputs(
    diagram: &Diagram,
    token_manager: &TokenManager,
    state: &StateTracker,
    node: &Node,
    epoch: u64,
    exec_count: u32,
    variables: &HashMap<String, Value>,
    strict_io: bool,
) -> Result<HashMap<String, Envelope>> {
    let raw = token_manager.consume_inbound(diagram, &node.id, epoch);

    let first_only = diagram
        .incoming_edges(&node.id)
        .any(|e| e.target_input == "first" || e.target_input.starts_with("first."));
    let selected: HashMap<String, Envelope> = if first_only && exec_count <= 1 {
        raw.into_iter()
            .filter(|(port, _)| port == "first" || port.starts_with("first."))
            .collect()
    } else if first_only {
        raw.into_iter()
            .filter(|(port, _)| port != "first" && !port.starts_with("first."))
            .collect()
    } else {
        raw
    };

    let mut resolved = HashMap::with_capacity(selected.len());
    for edge in diagram.incoming_edges(&node.id) {
        let port = if edge.target_input.is_empty() {
            DEFAULT_PORT.to_string()
        } else {
            edge.target_input.clone()
        };
        let Some(envelope) = selected.get(&port) else {
            continue;
        };

        // Source must have actually finished before its token counts as an
        // input; a token published then orphaned by a later reset can't
        // linger in as "last seen".
        if !matches!(
            state.get_node_state(&edge.source_node_id),
            NodeState::Completed | NodeState::MaxIterReached
        ) {
            continue;
        }
        if let Some(iteration) = envelope.iteration() {
            if iteration as u64 != epoch {
                continue;
            }
        }
        if let Some(branch_id) = envelope.branch_id() {
            if let Some(decision) = token_manager.branch_decision(&edge.source_node_id) {
                if decision != branch_id {
                    continue;
                }
            }
        }

        let transformed_body = apply_rules(envelope.as_json(), &edge.transform_rules);
        let transformed = Envelope {
            body: crate::envelope::Body::Json(transformed_body),
            content_type: envelope.content_type,
            produced_by: envelope.produced_by.clone(),
            meta: envelope.meta.clone(),
        };
        let final_envelope = if transformed.content_type == edge.content_type {
            transformed
        } else {
            coerce(&transformed, edge.content_type, &node.id, strict_io)?
        };
        resolved.insert(port, final_envelope);
    }

    for (key, value) in variables {
        resolved
            .entry(key.clone())
            .or_insert_with(|| Envelope::object(value.clone(), "__variables__"));
    }

    Ok(resolved)
}

/// Fill in declared defaults for any required input still missing after
/// [`resolve_inputs`]. `required` lists every input port the node must
/// receive, with an optional JSON default value.
pub fn apply_defaults(
    node: &Node,
    mut resolved: HashMap<String, Envelope>,
    required: &[(String, Option<Value>)],
) -> Result<HashMap<String, Envelope>> {
    for (input, default) in required {
        if resolved.contains_key(input) {
            continue;
        }
        match default {
            Some(value) => {
                resolved.insert(input.clone(), Envelope::object(value.clone(), node.id.clone()));
            }
            None => return Err(missing_input(node, input)),
        }
    }
    Ok(resolved)
}

/// Convenience wrapper re-tagging a resolved envelope, used when a handler
/// needs a specific content type regardless of what the edge declared.
pub fn coerce_to(envelope: &Envelope, target: ContentType, node_id: &str, strict_io: bool) -> Result<Envelope> {
    coerce(envelope, target, node_id, strict_io)
}
