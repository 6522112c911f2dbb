//! The handler registry contract.
//!
//! Everything node-type-specific — LLM calls, HTTP requests, code
//! execution — lives behind this trait, outside the engine. A handler
//! receives an [`ExecutionRequest`] and the envelopes the resolver already
//! assembled; it must not reach into the scheduler or token manager
//! directly.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::envelope::Envelope;
use crate::error::Result;
use crate::model::Node;

/// Everything a handler needs about the node it's running for, plus
/// process-wide context. Mirrors the fields a caller would expect to find
/// on the request object passed down through `execute_single_node`.
pub struct ExecutionRequest<'a> {
    /// The node being executed.
    pub node: &'a Node,
    /// This execution's id, stable for the lifetime of the run.
    pub execution_id: &'a str,
    /// 1-based invocation count for this node (includes the current one).
    pub execution_count: u32,
    /// Current epoch.
    pub epoch: u64,
    /// Process-wide variables, readable and writable by handlers.
    pub variables: &'a std::sync::Mutex<HashMap<String, Value>>,
    /// Free-form metadata a handler can attach to for downstream handlers
    /// or observability.
    pub metadata: HashMap<String, Value>,
    /// Narrow capability for a loop-controller handler to start a fresh
    /// epoch, without exposing the rest of the token manager. Returns the
    /// new epoch.
    pub advance_epoch: &'a (dyn Fn() -> u64 + Send + Sync),
}

impl<'a> ExecutionRequest<'a> {
    /// Read a process-wide variable.
    pub fn get_variable(&self, key: &str) -> Option<Value> {
        self.variables.lock().unwrap().get(key).cloned()
    }

    /// Write a process-wide variable (e.g. a loop-controller exporting its
    /// index).
    pub fn set_variable(&self, key: impl Into<String>, value: Value) {
        self.variables.lock().unwrap().insert(key.into(), value);
    }

    /// Start a new epoch; tokens from the old epoch are never consumed in
    /// the new one. See the design note on epoch isolation.
    pub fn begin_epoch(&self) -> u64 {
        (self.advance_epoch)()
    }
}

/// A pluggable per-node-type executor.
///
/// Implementations are looked up by [`HandlerRegistry::create_handler`]
/// using [`crate::model::NodeType::registry_key`].
#[async_trait]
pub trait Handler: Send + Sync {
    /// Run the node given its resolved inputs, producing the envelopes to
    /// publish on its outgoing ports (keyed by port name).
    async fn execute(
        &self,
        request: &ExecutionRequest<'_>,
        inputs: &HashMap<String, Envelope>,
    ) -> Result<HashMap<String, Envelope>>;
}

impl fmt::Debug for dyn Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<dyn Handler>")
    }
}

/// Resolves node types to their handler implementations.
///
/// Registration happens once at engine boot; lookups afterward are
/// read-only, so no lock is needed on the read path.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn Handler>>,
}

impl HandlerRegistry {
    /// Construct an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a node-type key (see
    /// [`crate::model::NodeType::registry_key`]).
    pub fn register(&mut self, node_type: impl Into<String>, handler: Arc<dyn Handler>) {
        self.handlers.insert(node_type.into(), handler);
    }

    /// Look up the handler for a node type, if registered.
    pub fn get(&self, node_type: &str) -> Option<Arc<dyn Handler>> {
        self.handlers.get(node_type).cloned()
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("registered_types", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::NodeType;

    struct EchoHandler;

    #[async_trait]
    impl Handler for EchoHandler {
        async fn execute(
            &self,
            _request: &ExecutionRequest<'_>,
            inputs: &HashMap<String, Envelope>,
        ) -> Result<HashMap<String, Envelope>> {
            Ok(inputs.clone())
        }
    }

    #[tokio::test]
    async fn registry_resolves_by_type_key() {
        let mut registry = HandlerRegistry::new();
        registry.register(NodeType::PersonJob.registry_key(), Arc::new(EchoHandler));
        assert!(registry.get("person_job").is_some());
        assert!(registry.get("nonexistent").is_none());
    }
}
