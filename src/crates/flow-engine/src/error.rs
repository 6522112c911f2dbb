//! Error types for the execution engine.
//!
//! All fallible engine operations return [`Result<T>`], an alias over
//! [`EngineError`]. Node-level failures (a handler returning an error) are
//! represented the same way a scheduling or resolution failure is — the
//! caller decides whether a particular variant ends the whole execution or
//! just the one node.
//!
//! # Examples
//!
//! ```rust
//! use flow_engine::error::{EngineError, Result};
//!
//! fn resolve(name: &str) -> Result<()> {
//!     if name.is_empty() {
//!         return Err(EngineError::input_resolution("start", "missing required input"));
//!     }
//!     Ok(())
//! }
//! ```

use thiserror::Error;

/// Convenience result type using [`EngineError`].
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors produced by the scheduler, token manager, resolver, and engine.
///
/// `max_iteration_exceeded` is deliberately absent here: reaching a node's
/// iteration cap is surfaced as a [`crate::state::NodeState::MaxIterReached`]
/// state transition, not as an error.
#[derive(Error, Debug)]
pub enum EngineError {
    /// The diagram itself is malformed (dangling edge, unknown node type, …).
    #[error("diagram validation failed: {0}")]
    Validation(String),

    /// No handler is registered for a node's type.
    #[error("no handler registered for node type '{0}'")]
    HandlerNotFound(String),

    /// A required input could not be resolved and had no declared default.
    #[error("node '{node}' missing required input '{input}'")]
    InputResolution {
        /// Node whose inputs could not be resolved.
        node: String,
        /// Name of the missing input port.
        input: String,
    },

    /// An envelope could not be coerced to the content type an edge declares.
    #[error("cannot coerce {from:?} to {to:?} on edge into '{node}'")]
    Transformation {
        /// Node the failing edge targets.
        node: String,
        /// Content type carried by the source envelope.
        from: crate::envelope::ContentType,
        /// Content type the edge declares.
        to: crate::envelope::ContentType,
    },

    /// A node's handler returned an error.
    #[error("node '{node}' handler failed: {source}")]
    HandlerFailure {
        /// Node whose handler failed.
        node: String,
        /// Underlying error from the handler.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Execution was cancelled before it completed.
    #[error("execution cancelled")]
    Cancelled,

    /// An internal invariant was violated; this indicates an engine bug.
    #[error("internal engine error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Build an [`EngineError::InputResolution`].
    pub fn input_resolution(node: impl Into<String>, input: impl Into<String>) -> Self {
        Self::InputResolution {
            node: node.into(),
            input: input.into(),
        }
    }

    /// Build an [`EngineError::HandlerFailure`] from any boxed error.
    pub fn handler_failure(
        node: impl Into<String>,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self::HandlerFailure {
            node: node.into(),
            source: source.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn input_resolution_carries_node_and_input() {
        let err = EngineError::input_resolution("start", "first");
        assert_eq!(
            err.to_string(),
            "node 'start' missing required input 'first'"
        );
    }

    #[test]
    fn handler_not_found_formats_type_name() {
        let err = EngineError::HandlerNotFound("person_job".into());
        assert!(err.to_string().contains("person_job"));
    }
}
