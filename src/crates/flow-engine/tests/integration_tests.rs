//! End-to-end scenarios exercising the scheduler, token manager, and
//! resolver together through the full [`ExecutionEngine`] dispatch loop.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use flow_engine::config::EngineConfig;
use flow_engine::engine::ExecutionEngine;
use flow_engine::envelope::{ContentType, Envelope};
use flow_engine::error::Result;
use flow_engine::handler::{ExecutionRequest, Handler, HandlerRegistry};
use flow_engine::model::{
    Diagram, Edge, Node, NodeConfig, NodeType, DEFAULT_PORT, PORT_COND_FALSE, PORT_COND_TRUE,
};
use flow_engine::state::NodeState;

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

struct StartHandler(&'static str);

#[async_trait]
impl Handler for StartHandler {
    async fn execute(
        &self,
        request: &ExecutionRequest<'_>,
        _inputs: &HashMap<String, Envelope>,
    ) -> Result<HashMap<String, Envelope>> {
        let mut out = HashMap::new();
        out.insert(DEFAULT_PORT.to_string(), Envelope::text(self.0, request.node.id.clone()));
        Ok(out)
    }
}

struct EchoHandler;

#[async_trait]
impl Handler for EchoHandler {
    async fn execute(
        &self,
        request: &ExecutionRequest<'_>,
        inputs: &HashMap<String, Envelope>,
    ) -> Result<HashMap<String, Envelope>> {
        let mut out = HashMap::new();
        let body = inputs.get(DEFAULT_PORT).map(|e| e.as_text()).unwrap_or_default();
        out.insert(DEFAULT_PORT.to_string(), Envelope::text(body, request.node.id.clone()));
        Ok(out)
    }
}

/// S1 — Linear: Start -> Job -> Endpoint.
#[tokio::test]
async fn s1_linear_pipeline_propagates_value_to_endpoint() {
    let nodes = vec![
        Node::new("start", NodeType::Start),
        Node::new("job", NodeType::Other("job".into())),
        Node::new("end", NodeType::Endpoint),
    ];
    let edges = vec![
        edge("e1", "start", DEFAULT_PORT, "job", DEFAULT_PORT),
        edge("e2", "job", DEFAULT_PORT, "end", DEFAULT_PORT),
    ];
    let diagram = Diagram::compile(nodes, edges).unwrap();

    let mut registry = HandlerRegistry::new();
    registry.register("start", Arc::new(StartHandler("hello")));
    registry.register("job", Arc::new(EchoHandler));
    registry.register("endpoint", Arc::new(EchoHandler));

    let engine = ExecutionEngine::new(diagram, registry, EngineConfig::default());
    engine.run("s1", HashMap::new()).await.unwrap();

    assert_eq!(engine.state_tracker().get_node_state("end"), NodeState::Completed);
    assert_eq!(engine.state_tracker().get_last_output("end").unwrap().as_text(), "hello");
}

struct ConditionHandler {
    take_true: bool,
}

#[async_trait]
impl Handler for ConditionHandler {
    async fn execute(
        &self,
        request: &ExecutionRequest<'_>,
        _inputs: &HashMap<String, Envelope>,
    ) -> Result<HashMap<String, Envelope>> {
        let mut out = HashMap::new();
        let port = if self.take_true { PORT_COND_TRUE } else { PORT_COND_FALSE };
        out.insert(port.to_string(), Envelope::text("yes", request.node.id.clone()));
        Ok(out)
    }
}

/// S2 — Branch: only the taken branch's target ever runs; the other stays
/// Pending/untouched.
#[tokio::test]
async fn s2_condition_runs_only_the_taken_branch() {
    let nodes = vec![
        Node::new("start", NodeType::Start),
        Node::new("cond", NodeType::Condition),
        Node::new("t", NodeType::Other("t".into())),
        Node::new("f", NodeType::Other("f".into())),
    ];
    let edges = vec![
        edge("e1", "start", DEFAULT_PORT, "cond", DEFAULT_PORT),
        edge("e2", "cond", PORT_COND_TRUE, "t", DEFAULT_PORT),
        edge("e3", "cond", PORT_COND_FALSE, "f", DEFAULT_PORT),
    ];
    let diagram = Diagram::compile(nodes, edges).unwrap();

    let mut registry = HandlerRegistry::new();
    registry.register("start", Arc::new(StartHandler("go")));
    registry.register("condition", Arc::new(ConditionHandler { take_true: true }));
    registry.register("t", Arc::new(EchoHandler));
    registry.register("f", Arc::new(EchoHandler));

    let engine = ExecutionEngine::new(diagram, registry, EngineConfig::default());
    engine.run("s2", HashMap::new()).await.unwrap();

    assert_eq!(engine.state_tracker().get_execution_count("t"), 1);
    assert_eq!(engine.state_tracker().get_execution_count("f"), 0);
}

/// S4 — Fan-in all: J only runs once both A and B have delivered a token.
#[tokio::test]
async fn s4_fan_in_all_waits_for_every_source() {
    let nodes = vec![
        Node::new("start", NodeType::Start),
        Node::new("a", NodeType::Other("a".into())),
        Node::new("b", NodeType::Other("b".into())),
        Node::new("j", NodeType::Other("j".into())),
    ];
    let edges = vec![
        edge("e1", "start", DEFAULT_PORT, "a", DEFAULT_PORT),
        edge("e2", "start", DEFAULT_PORT, "b", DEFAULT_PORT),
        edge("e3", "a", DEFAULT_PORT, "j", "one"),
        edge("e4", "b", DEFAULT_PORT, "j", "two"),
    ];
    let diagram = Diagram::compile(nodes, edges).unwrap();

    let mut registry = HandlerRegistry::new();
    registry.register("start", Arc::new(StartHandler("go")));
    registry.register("a", Arc::new(EchoHandler));
    registry.register("b", Arc::new(EchoHandler));
    registry.register("j", Arc::new(EchoHandler));

    let engine = ExecutionEngine::new(diagram, registry, EngineConfig::default());
    engine.run("s4", HashMap::new()).await.unwrap();

    assert_eq!(engine.state_tracker().get_execution_count("j"), 1);
}

/// S5 — Skippable condition: a skippable branch dropped from the target's
/// required set doesn't block the target when its other source fires.
#[tokio::test]
async fn s5_skippable_edge_does_not_block_other_source() {
    let mut cond_config = NodeConfig::default();
    cond_config.skippable = true;
    let nodes = vec![
        Node::new("start", NodeType::Start),
        Node::with_config("cond", NodeType::Condition, cond_config),
        Node::new("y", NodeType::Other("y".into())),
        Node::new("x", NodeType::Other("x".into())),
    ];
    let edges = vec![
        edge("e1", "start", DEFAULT_PORT, "cond", DEFAULT_PORT),
        edge("e2", "start", DEFAULT_PORT, "y", DEFAULT_PORT),
        edge("e3", "cond", PORT_COND_FALSE, "x", "one"),
        edge("e4", "y", DEFAULT_PORT, "x", "two"),
    ];
    let diagram = Diagram::compile(nodes, edges).unwrap();

    let mut registry = HandlerRegistry::new();
    registry.register("start", Arc::new(StartHandler("go")));
    registry.register("condition", Arc::new(ConditionHandler { take_true: true }));
    registry.register("y", Arc::new(EchoHandler));
    registry.register("x", Arc::new(EchoHandler));

    let engine = ExecutionEngine::new(diagram, registry, EngineConfig::default());
    engine.run("s5", HashMap::new()).await.unwrap();

    assert_eq!(engine.state_tracker().get_execution_count("x"), 1);
}

/// S6 — Priority: the higher-priority sibling runs before the lower one.
#[tokio::test]
async fn s6_higher_priority_sibling_runs_first() {
    let order = Arc::new(Mutex::new(Vec::new()));

    struct OrderTrackingHandler {
        order: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Handler for OrderTrackingHandler {
        async fn execute(
            &self,
            request: &ExecutionRequest<'_>,
            _inputs: &HashMap<String, Envelope>,
        ) -> Result<HashMap<String, Envelope>> {
            self.order.lock().unwrap().push(request.node.id.clone());
            let mut out = HashMap::new();
            out.insert(DEFAULT_PORT.to_string(), Envelope::empty(request.node.id.clone()));
            Ok(out)
        }
    }

    let nodes = vec![
        Node::new("start", NodeType::Start),
        Node::new("h", NodeType::Other("x".into())),
        Node::new("l", NodeType::Other("x".into())),
    ];
    let mut high_prio_edge = edge("eh", "start", DEFAULT_PORT, "h", DEFAULT_PORT);
    high_prio_edge.execution_priority = 10;
    let low_prio_edge = edge("el", "start", DEFAULT_PORT, "l", DEFAULT_PORT);
    let edges = vec![high_prio_edge, low_prio_edge];
    let diagram = Diagram::compile(nodes, edges).unwrap();

    let mut registry = HandlerRegistry::new();
    registry.register("start", Arc::new(StartHandler("go")));
    registry.register("x", Arc::new(OrderTrackingHandler { order: order.clone() }));

    let engine = ExecutionEngine::new(diagram, registry, EngineConfig::default());
    engine.run("s6", HashMap::new()).await.unwrap();

    let recorded = order.lock().unwrap();
    let h_index = recorded.iter().position(|n| n == "h").unwrap();
    let l_index = recorded.iter().position(|n| n == "l").unwrap();
    assert!(h_index < l_index);
}

/// S3 — Loop: Start -> P(max_iteration) -> Cond -> condfalse -> P. The
/// loop-back edge re-triggers P once per condition evaluation; P's own
/// per-epoch cap (not a MaxIterReached transition) is what eventually stops
/// the loop, since the scheduler withholds P once it has already reached
/// its cap rather than ever dispatching it a `cap + 1`th time.
#[tokio::test]
async fn s3_loop_runs_exactly_max_iteration_times_then_completes() {
    let mut p_config = NodeConfig::default();
    p_config.max_iteration = Some(3);
    let mut cond_config = NodeConfig::default();
    cond_config.skippable = true;

    let nodes = vec![
        Node::new("start", NodeType::Start),
        Node::with_config("p", NodeType::PersonJob, p_config),
        Node::with_config("cond", NodeType::Condition, cond_config),
    ];
    let edges = vec![
        edge("e1", "start", DEFAULT_PORT, "p", DEFAULT_PORT),
        edge("e2", "p", DEFAULT_PORT, "cond", DEFAULT_PORT),
        edge("e3", "cond", PORT_COND_FALSE, "p", DEFAULT_PORT),
    ];
    let diagram = Diagram::compile(nodes, edges).unwrap();

    let mut registry = HandlerRegistry::new();
    registry.register("start", Arc::new(StartHandler("go")));
    registry.register("person_job", Arc::new(EchoHandler));
    registry.register("condition", Arc::new(ConditionHandler { take_true: false }));

    let engine = ExecutionEngine::new(diagram, registry, EngineConfig::default());
    engine.run("s3", HashMap::new()).await.unwrap();

    assert_eq!(engine.state_tracker().get_execution_count("p"), 3);
    assert_eq!(engine.state_tracker().get_node_state("p"), NodeState::Completed);
}

/// Boundary: a node with max_iteration=1 and no loop-back edge is never
/// re-triggered; it simply runs its one and only invocation to completion.
#[tokio::test]
async fn max_iteration_one_blocks_second_run() {
    let mut config = NodeConfig::default();
    config.max_iteration = Some(1);
    let nodes = vec![
        Node::new("start", NodeType::Start),
        Node::with_config("p", NodeType::PersonJob, config),
    ];
    let edges = vec![edge("e1", "start", DEFAULT_PORT, "p", DEFAULT_PORT)];
    let diagram = Diagram::compile(nodes, edges).unwrap();

    let mut registry = HandlerRegistry::new();
    registry.register("start", Arc::new(StartHandler("go")));
    registry.register("person_job", Arc::new(EchoHandler));

    let engine = ExecutionEngine::new(diagram, registry, EngineConfig::default());
    engine.run("maxiter", HashMap::new()).await.unwrap();

    assert_eq!(engine.state_tracker().get_execution_count("p"), 1);
    assert_eq!(engine.state_tracker().get_node_state("p"), NodeState::Completed);
}

/// Boundary: a single unconnected start node runs once and terminates.
#[tokio::test]
async fn unconnected_start_terminates() {
    let nodes = vec![Node::new("start", NodeType::Start)];
    let diagram = Diagram::compile(nodes, vec![]).unwrap();

    let mut registry = HandlerRegistry::new();
    registry.register("start", Arc::new(StartHandler("go")));

    let engine = ExecutionEngine::new(diagram, registry, EngineConfig::default());
    engine.run("solo", HashMap::new()).await.unwrap();

    assert_eq!(engine.state_tracker().get_execution_count("start"), 1);
}
