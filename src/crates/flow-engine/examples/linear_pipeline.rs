//! Minimal linear pipeline: Start -> Job -> Endpoint.
//!
//! Run with `cargo run --example linear_pipeline`.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use flow_engine::config::EngineConfig;
use flow_engine::engine::ExecutionEngine;
use flow_engine::envelope::{ContentType, Envelope};
use flow_engine::error::Result;
use flow_engine::handler::{ExecutionRequest, Handler, HandlerRegistry};
use flow_engine::model::{Diagram, Edge, Node, NodeType, DEFAULT_PORT};

struct StartHandler;

#[async_trait]
impl Handler for StartHandler {
    async fn execute(
        &self,
        request: &ExecutionRequest<'_>,
        _inputs: &HashMap<String, Envelope>,
    ) -> Result<HashMap<String, Envelope>> {
        let mut out = HashMap::new();
        out.insert(
            DEFAULT_PORT.to_string(),
            Envelope::text("hello from the entry node", request.node.id.clone()),
        );
        Ok(out)
    }
}

struct UppercaseHandler;

#[async_trait]
impl Handler for UppercaseHandler {
    async fn execute(
        &self,
        request: &ExecutionRequest<'_>,
        inputs: &HashMap<String, Envelope>,
    ) -> Result<HashMap<String, Envelope>> {
        let text = inputs.get(DEFAULT_PORT).map(|e| e.as_text()).unwrap_or_default();
        let mut out = HashMap::new();
        out.insert(
            DEFAULT_PORT.to_string(),
            Envelope::text(text.to_uppercase(), request.node.id.clone()),
        );
        Ok(out)
    }
}

struct PrintHandler;

#[async_trait]
impl Handler for PrintHandler {
    async fn execute(
        &self,
        request: &ExecutionRequest<'_>,
        inputs: &HashMap<String, Envelope>,
    ) -> Result<HashMap<String, Envelope>> {
        let text = inputs.get(DEFAULT_PORT).map(|e| e.as_text()).unwrap_or_default();
        println!("endpoint received: {text}");
        let mut out = HashMap::new();
        out.insert(DEFAULT_PORT.to_string(), Envelope::text(text, request.node.id.clone()));
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

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let nodes = vec![
        Node::new("start", NodeType::Start),
        Node::new("upper", NodeType::Other("upper".into())),
        Node::new("end", NodeType::Endpoint),
    ];
    let edges = vec![edge("e1", "start", "upper"), edge("e2", "upper", "end")];
    let diagram = Diagram::compile(nodes, edges)?;

    let mut registry = HandlerRegistry::new();
    registry.register("start", Arc::new(StartHandler));
    registry.register("upper", Arc::new(UppercaseHandler));
    registry.register("endpoint", Arc::new(PrintHandler));

    let engine = ExecutionEngine::new(diagram, registry, EngineConfig::default());
    engine.run("linear-pipeline-demo", HashMap::new()).await
}
