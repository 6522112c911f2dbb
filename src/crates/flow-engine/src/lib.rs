//! # flow-engine - Token-Based Execution Engine for Diagram Workflows
//!
//! `flow-engine` runs directed graphs of heterogeneous computational nodes
//! — LLM calls, code execution, HTTP requests, condition branches — with
//! dynamic control flow, iteration, conditional branching, and
//! fan-in/fan-out. It is the scheduling and data-routing core of a visual
//! workflow platform; node handlers, diagram loading, and persistence are
//! deliberately out of scope and live behind the [`handler`] contract.
//!
//! ## Core Concepts
//!
//! - [`model::Diagram`] — an indexed, immutable graph of [`model::Node`]s
//!   and [`model::Edge`]s, compiled once at boot.
//! - [`envelope::Envelope`] — the typed payload ([`envelope::ContentType`])
//!   that travels across every edge.
//! - [`token`] — tokens placed on edges per epoch, with join and
//!   concurrency policies governing when a node is ready.
//! - [`state::StateTracker`] — per-node lifecycle state and execution
//!   history.
//! - [`scheduler::NodeScheduler`] — combines static dependency bootstrap,
//!   token-driven readiness, loop caps, and priority ordering.
//! - [`resolver`] — turns a node's consumed tokens into the input map its
//!   handler receives.
//! - [`engine::ExecutionEngine`] — the main dispatch loop.
//! - [`events::EventPipeline`] — fire-and-forget progress events.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::collections::HashMap;
//! use std::sync::Arc;
//!
//! use async_trait::async_trait;
//! use flow_engine::config::EngineConfig;
//! use flow_engine::engine::ExecutionEngine;
//! use flow_engine::envelope::Envelope;
//! use flow_engine::error::Result;
//! use flow_engine::handler::{ExecutionRequest, Handler, HandlerRegistry};
//! use flow_engine::model::{Diagram, Node, NodeType, DEFAULT_PORT};
//!
//! struct Echo;
//!
//! #[async_trait]
//! impl Handler for Echo {
//!     async fn execute(
//!         &self,
//!         request: &ExecutionRequest<'_>,
//!         inputs: &HashMap<String, Envelope>,
//!     ) -> Result<HashMap<String, Envelope>> {
//!         let mut out = HashMap::new();
//!         out.insert(DEFAULT_PORT.to_string(), Envelope::text("hello", request.node.id.clone()));
//!         Ok(out)
//!     }
//! }
//!
//! # #[tokio::main]
//! # async fn main() -> Result<()> {
//! let nodes = vec![Node::new("start", NodeType::Start)];
//! let diagram = Diagram::compile(nodes, vec![])?;
//!
//! let mut registry = HandlerRegistry::new();
//! registry.register("start", Arc::new(Echo));
//!
//! let engine = ExecutionEngine::new(diagram, registry, EngineConfig::default());
//! engine.run("exec-1", HashMap::new()).await
//! # }
//! ```
//!
//! ## Module Organization
//!
//! - [`model`] — diagram data model (nodes, edges, the compiled [`model::Diagram`]).
//! - [`envelope`] — typed payloads and the content-type coercion matrix.
//! - [`state`] — per-node lifecycle state and execution history.
//! - [`token`] — token publish/consume, join and concurrency policies.
//! - [`dependency`] — static zero-indegree bootstrap and priority ordering.
//! - [`scheduler`] — readiness evaluation and dispatch ordering.
//! - [`resolver`] — input selection, transformation, and defaults.
//! - [`handler`] — the pluggable per-node-type executor contract.
//! - [`events`] — the fire-and-forget event pipeline.
//! - [`config`] — boot-time engine configuration.
//! - [`engine`] — the main dispatch loop.
//! - [`error`] — the engine's error taxonomy.

pub mod config;
pub mod dependency;
pub mod engine;
pub mod envelope;
pub mod error;
pub mod events;
pub mod handler;
pub mod model;
pub mod resolver;
pub mod scheduler;
pub mod state;
pub mod token;

pub use config::EngineConfig;
pub use engine::ExecutionEngine;
pub use envelope::{ContentType, Envelope};
pub use error::{EngineError, Result};
pub use events::{Event, EventPipeline};
pub use handler::{ExecutionRequest, Handler, HandlerRegistry};
pub use model::{Diagram, Edge, Node, NodeConfig, NodeType};
pub use scheduler::NodeScheduler;
pub use state::{ExecutionRecord, NodeState, StateTracker};
pub use token::{ConcurrencyPolicy, JoinPolicy, Token, TokenManager};
