//! The execution engine: the main dispatch loop tying the scheduler, token
//! manager, state tracker, resolver, and handler registry together.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use futures::future::join_all;
use serde_json::Value;

use crate::config::EngineConfig;
use crate::envelope::Envelope;
use crate::error::{EngineError, Result};
use crate::events::{Event, EventPipeline};
use crate::handler::{ExecutionRequest, HandlerRegistry};
use crate::model::{Diagram, Node, NodeType};
use crate::resolver::resolve_inputs;
use crate::scheduler::NodeScheduler;
use crate::state::{NodeState, StateTracker};
use crate::token::TokenManager;

/// Runs one diagram to completion: repeatedly asks the scheduler for ready
/// nodes, dispatches their handlers, and routes outputs back through the
/// token manager until nothing more can run.
pub struct ExecutionEngine {
    diagram: Arc<Diagram>,
    config: EngineConfig,
    state: Arc<StateTracker>,
    tokens: Arc<TokenManager>,
    scheduler: Arc<NodeScheduler>,
    handlers: Arc<HandlerRegistry>,
    events: Arc<EventPipeline>,
    variables: Arc<Mutex<HashMap<String, Value>>>,
    cancelled: Arc<AtomicBool>,
}

impl ExecutionEngine {
    /// Build an engine for `diagram`, scheduling per the default policies
    /// [`NodeScheduler::new`] assembles.
    pub fn new(diagram: Diagram, handlers: HandlerRegistry, config: EngineConfig) -> Self {
        let diagram = Arc::new(diagram);
        let scheduler = Arc::new(NodeScheduler::new(&diagram, config.max_iterations_per_epoch));
        Self {
            diagram,
            events: Arc::new(EventPipeline::new(config.event_queue_capacity)),
            config,
            state: Arc::new(StateTracker::new()),
            tokens: Arc::new(TokenManager::new()),
            scheduler,
            handlers: Arc::new(handlers),
            variables: Arc::new(Mutex::new(HashMap::new())),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Subscribe to engine events.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    /// Access the state tracker, for observability (current node states,
    /// execution history, last outputs).
    pub fn state_tracker(&self) -> &StateTracker {
        &self.state
    }

    /// Request cancellation. The engine stops dispatching new nodes as soon
    /// as its current batch finishes; already-dispatched handlers run to
    /// completion.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Run the diagram to completion under a generated execution id.
    pub async fn run_new(&self, initial_variables: HashMap<String, Value>) -> Result<String> {
        let execution_id = uuid::Uuid::new_v4().to_string();
        self.run(&execution_id, initial_variables).await?;
        Ok(execution_id)
    }

    /// Run the diagram to completion, seeding `initial_variables` as the
    /// process-wide variables map.
    pub async fn run(&self, execution_id: &str, initial_variables: HashMap<String, Value>) -> Result<()> {
        for node in self.diagram.nodes() {
            self.state.initialize_node(&node.id);
        }
        *self.variables.lock().unwrap() = initial_variables;

        self.events.publish(Event::ExecutionStarted {
            execution_id: execution_id.to_string(),
            at: Utc::now(),
        });

        loop {
            if self.cancelled.load(Ordering::SeqCst) {
                self.events.publish(Event::ExecutionError {
                    execution_id: execution_id.to_string(),
                    error: EngineError::Cancelled.to_string(),
                    at: Utc::now(),
                });
                return Err(EngineError::Cancelled);
            }

            let epoch = self.tokens.current_epoch();
            let ready = self
                .scheduler
                .get_ready_nodes(&self.diagram, &self.tokens, &self.state, epoch);

            if ready.is_empty() {
                break;
            }

            let batch = ready.into_iter().map(|node_id| {
                let engine = self.clone_handles();
                let execution_id = execution_id.to_string();
                async move { engine.execute_node(&node_id, epoch, &execution_id).await }
            });

            let results: Vec<Result<()>> = tokio::select! {
                results = join_all(batch) => results,
                _ = wait_then_elapse_grace(&self.cancelled, self.config.cancellation_grace_period) => {
                    self.events.publish(Event::ExecutionError {
                        execution_id: execution_id.to_string(),
                        error: EngineError::Cancelled.to_string(),
                        at: Utc::now(),
                    });
                    return Err(EngineError::Cancelled);
                }
            };
            for result in results {
                if let Err(err @ EngineError::HandlerNotFound(_)) | Err(err @ EngineError::Internal(_)) = result {
                    self.events.publish(Event::ExecutionError {
                        execution_id: execution_id.to_string(),
                        error: err.to_string(),
                        at: Utc::now(),
                    });
                    return Err(err);
                }
            }
        }

        self.events.publish(Event::ExecutionCompleted {
            execution_id: execution_id.to_string(),
            at: Utc::now(),
        });
        Ok(())
    }

    /// Shallow clone of the shared handles this engine needs to execute one
    /// node concurrently with others in the same batch.
    fn clone_handles(&self) -> EngineHandles {
        EngineHandles {
            diagram: self.diagram.clone(),
            config: self.config.clone(),
            state: self.state.clone(),
            tokens: self.tokens.clone(),
            scheduler: self.scheduler.clone(),
            handlers: self.handlers.clone(),
            events: self.events.clone(),
            variables: self.variables.clone(),
        }
    }
}

/// Shared, cloneable handles used to run a single node invocation; split
/// out so a batch of concurrent invocations doesn't each need a reference
/// back to the whole engine.
struct EngineHandles {
    diagram: Arc<Diagram>,
    config: EngineConfig,
    state: Arc<StateTracker>,
    tokens: Arc<TokenManager>,
    scheduler: Arc<NodeScheduler>,
    handlers: Arc<HandlerRegistry>,
    events: Arc<EventPipeline>,
    variables: Arc<Mutex<HashMap<String, Value>>>,
}

impl EngineHandles {
    async fn execute_node(self, node_id: &str, epoch: u64, execution_id: &str) -> Result<()> {
        let node = self
            .diagram
            .node(node_id)
            .ok_or_else(|| EngineError::Internal(format!("scheduler returned unknown node '{node_id}'")))?
            .clone();

        self.scheduler.mark_node_running(node_id, epoch);
        let exec_count = self.state.transition_to_running(node_id, epoch);
        self.events.publish(Event::NodeStarted {
            execution_id: execution_id.to_string(),
            node_id: node_id.to_string(),
            execution_count: exec_count,
            at: Utc::now(),
        });

        let result = self.run_handler_or_maxiter(&node, epoch, exec_count, execution_id).await;
        self.scheduler.mark_node_complete(node_id, epoch);
        result
    }

    async fn run_handler_or_maxiter(
        &self,
        node: &Node,
        epoch: u64,
        exec_count: u32,
        execution_id: &str,
    ) -> Result<()> {
        let iterations = self.state.get_iterations_in_epoch(&node.id, epoch);
        let cap = node.config.max_iteration.unwrap_or(self.config.max_iterations_per_epoch);
        if iterations > cap {
            let envelope = Envelope::empty(node.id.clone()).with_meta("status", "maxiter_reached");
            self.tokens
                .emit_outputs(&self.diagram, &node.id, &node.node_type, epoch, &maxiter_outputs(&envelope));
            self.state.transition_to_maxiter(&node.id, Some(envelope));
            return Ok(());
        }

        let variables_snapshot = self.variables.lock().unwrap().clone();
        let inputs = match resolve_inputs(
            &self.diagram,
            &self.tokens,
            &self.state,
            node,
            epoch,
            exec_count,
            &variables_snapshot,
            self.config.strict_io,
        ) {
            Ok(inputs) => inputs,
            Err(err) => {
                self.state.transition_to_failed(&node.id, err.to_string());
                self.events.publish(Event::NodeError {
                    execution_id: execution_id.to_string(),
                    node_id: node.id.clone(),
                    error: err.to_string(),
                    at: Utc::now(),
                });
                return Ok(());
            }
        };

        let Some(handler) = self.handlers.get(node.node_type.registry_key()) else {
            return Err(EngineError::HandlerNotFound(node.node_type.registry_key().to_string()));
        };

        let tokens_for_epoch = self.tokens.clone();
        let advance_epoch = move || tokens_for_epoch.begin_epoch();
        let request = ExecutionRequest {
            node,
            execution_id,
            execution_count: exec_count,
            epoch,
            variables: &self.variables,
            metadata: HashMap::new(),
            advance_epoch: &advance_epoch,
        };

        let started = std::time::Instant::now();
        match handler.execute(&request, &inputs).await {
            Ok(mut outputs) => {
                let elapsed = started.elapsed();
                for envelope in outputs.values_mut() {
                    envelope
                        .meta
                        .insert("execution_time_ms".to_string(), Value::from(elapsed.as_millis() as u64));
                }
                self.tokens
                    .emit_outputs(&self.diagram, &node.id, &node.node_type, epoch, &outputs);
                let primary_output = outputs
                    .get(crate::model::DEFAULT_PORT)
                    .or_else(|| outputs.values().next())
                    .cloned()
                    .unwrap_or_else(|| Envelope::empty(node.id.clone()));
                self.state.transition_to_completed(&node.id, primary_output.clone());
                self.events.publish(Event::NodeCompleted {
                    execution_id: execution_id.to_string(),
                    node_id: node.id.clone(),
                    duration: elapsed,
                    output: primary_output,
                    at: Utc::now(),
                });
                Ok(())
            }
            Err(err) => {
                self.state.transition_to_failed(&node.id, err.to_string());
                self.events.publish(Event::NodeError {
                    execution_id: execution_id.to_string(),
                    node_id: node.id.clone(),
                    error: err.to_string(),
                    at: Utc::now(),
                });
                Ok(())
            }
        }
    }
}

/// Polls for cancellation, then sleeps out `grace` before resolving. Raced
/// against the in-flight batch in [`ExecutionEngine::run`]: a batch that
/// finishes before the grace period elapses wins the race and completes
/// normally; one that's still running once the grace period elapses is
/// abandoned and the run reports [`EngineError::Cancelled`].
async fn wait_then_elapse_grace(cancelled: &AtomicBool, grace: std::time::Duration) {
    const POLL_INTERVAL: std::time::Duration = std::time::Duration::from_millis(10);
    loop {
        if cancelled.load(Ordering::SeqCst) {
            tokio::time::sleep(grace).await;
            return;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

fn maxiter_outputs(envelope: &Envelope) -> HashMap<String, Envelope> {
    let mut map = HashMap::with_capacity(1);
    map.insert(crate::model::DEFAULT_PORT.to_string(), envelope.clone());
    map
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::ContentType;
    use crate::handler::Handler;
    use crate::model::{Edge, NodeConfig, DEFAULT_PORT};
    use async_trait::async_trait;

    struct EchoHandler;

    #[async_trait]
    impl Handler for EchoHandler {
        async fn execute(
            &self,
            request: &ExecutionRequest<'_>,
            inputs: &HashMap<String, Envelope>,
        ) -> Result<HashMap<String, Envelope>> {
            let mut out = HashMap::new();
            let body = inputs
                .get(DEFAULT_PORT)
                .map(|e| e.as_text())
                .unwrap_or_default();
            out.insert(DEFAULT_PORT.to_string(), Envelope::text(body, request.node.id.clone()));
            Ok(out)
        }
    }

    struct StartHandler;

    #[async_trait]
    impl Handler for StartHandler {
        async fn execute(
            &self,
            request: &ExecutionRequest<'_>,
            _inputs: &HashMap<String, Envelope>,
        ) -> Result<HashMap<String, Envelope>> {
            let mut out = HashMap::new();
            out.insert(DEFAULT_PORT.to_string(), Envelope::text("hello", request.node.id.clone()));
            Ok(out)
        }
    }

    fn edge(id: &str, src: &str, tgt: &str) -> Edge {
        Edge {
            id: id.into(),
            source_node_id: src.into(),
            source_output: DEFAULT_PORT.into(),
            target_node_id: tgt.into(),
            target_input: DEFAULT_PORT.into(),
            content_type: ContentType::RawText,
            transform_rules: vec![],
            execution_priority: 0,
        }
    }

    #[tokio::test]
    async fn linear_pipeline_runs_start_to_endpoint() {
        let nodes = vec![
            Node::new("start", NodeType::Start),
            Node::new("job", NodeType::Other("job".into())),
            Node::new("end", NodeType::Endpoint),
        ];
        let edges = vec![edge("e1", "start", "job"), edge("e2", "job", "end")];
        let diagram = Diagram::compile(nodes, edges).unwrap();

        let mut registry = HandlerRegistry::new();
        registry.register("start", Arc::new(StartHandler));
        registry.register("job", Arc::new(EchoHandler));
        registry.register("endpoint", Arc::new(EchoHandler));

        let engine = ExecutionEngine::new(diagram, registry, EngineConfig::default());
        engine.run("exec-1", HashMap::new()).await.unwrap();

        assert_eq!(engine.state.get_execution_count("start"), 1);
        assert_eq!(engine.state.get_execution_count("job"), 1);
        assert_eq!(engine.state.get_execution_count("end"), 1);
        let output = engine.state.get_last_output("end").unwrap();
        assert_eq!(output.as_text(), "hello");
    }

    #[tokio::test]
    async fn unconnected_start_runs_once_and_terminates() {
        let nodes = vec![Node::new("start", NodeType::Start)];
        let diagram = Diagram::compile(nodes, vec![]).unwrap();
        let mut registry = HandlerRegistry::new();
        registry.register("start", Arc::new(StartHandler));
        let engine = ExecutionEngine::new(diagram, registry, EngineConfig::default());
        engine.run("exec-1", HashMap::new()).await.unwrap();
        assert_eq!(engine.state.get_execution_count("start"), 1);
    }

    #[tokio::test]
    async fn missing_handler_surfaces_as_error() {
        let nodes = vec![Node::new("start", NodeType::Start)];
        let diagram = Diagram::compile(nodes, vec![]).unwrap();
        let registry = HandlerRegistry::new();
        let engine = ExecutionEngine::new(diagram, registry, EngineConfig::default());
        let err = engine.run("exec-1", HashMap::new()).await.unwrap_err();
        assert!(matches!(err, EngineError::HandlerNotFound(_)));
    }

    struct MaxIterHandler;

    #[async_trait]
    impl Handler for MaxIterHandler {
        async fn execute(
            &self,
            request: &ExecutionRequest<'_>,
            _inputs: &HashMap<String, Envelope>,
        ) -> Result<HashMap<String, Envelope>> {
            let mut out = HashMap::new();
            out.insert(
                DEFAULT_PORT.to_string(),
                Envelope::text(format!("run-{}", request.execution_count), request.node.id.clone()),
            );
            Ok(out)
        }
    }

    #[tokio::test]
    async fn node_with_max_iteration_one_stops_after_single_run() {
        let mut config = NodeConfig::default();
        config.max_iteration = Some(1);
        let nodes = vec![
            Node::new("start", NodeType::Start),
            Node::with_config("p", NodeType::PersonJob, config),
        ];
        let edges = vec![edge("e1", "start", "p")];
        let diagram = Diagram::compile(nodes, edges).unwrap();
        let mut registry = HandlerRegistry::new();
        registry.register("start", Arc::new(StartHandler));
        registry.register("person_job", Arc::new(MaxIterHandler));
        let engine = ExecutionEngine::new(diagram, registry, EngineConfig::default());
        engine.run("exec-1", HashMap::new()).await.unwrap();
        assert_eq!(engine.state.get_execution_count("p"), 1);
        assert_eq!(engine.state.get_node_state("p"), NodeState::Completed);
    }
}
