//! Per-node runtime state: the current status and the append-only
//! execution history.
//!
//! [`StateTracker`] is the single owner of both. It mirrors the original
//! `StateTracker`/`ExecutionTracker` split: a node's *current* state answers
//! "is it safe to run this node again", while its *history* answers
//! "what happened the last N times".

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::envelope::Envelope;

/// Safety cap on invocations per `(node, epoch)` when a node declares no
/// explicit `max_iteration`.
pub const DEFAULT_MAX_ITERATIONS_PER_EPOCH: u32 = 100;

/// A node's current lifecycle state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeState {
    /// Not yet invoked (or reset) in the current epoch.
    Pending,
    /// Currently executing.
    Running,
    /// Finished successfully.
    Completed,
    /// Finished with an error.
    Failed(String),
    /// Declined to run because its iteration cap was reached.
    MaxIterReached,
    /// Never became eligible to run (e.g. the branch not taken).
    Skipped,
}

impl NodeState {
    /// `true` for any state that will not further progress without an
    /// external reset.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            NodeState::Completed | NodeState::Failed(_) | NodeState::MaxIterReached | NodeState::Skipped
        )
    }
}

/// One closed invocation of a node, kept for history/observability.
#[derive(Debug, Clone)]
pub struct ExecutionRecord {
    /// 1-based invocation count at the time this record was opened.
    pub execution_number: u32,
    /// When the invocation started.
    pub started_at: Instant,
    /// When the invocation ended, if it has.
    pub ended_at: Option<Instant>,
    /// Outcome, once closed.
    pub status: Option<NodeState>,
    /// The envelope the invocation produced, if it completed successfully.
    pub output: Option<Envelope>,
    /// Error message, if it failed.
    pub error: Option<String>,
}

impl ExecutionRecord {
    /// Wall-clock duration, if the record has been closed.
    pub fn duration(&self) -> Option<Duration> {
        self.ended_at.map(|end| end.duration_since(self.started_at))
    }

    /// `true` once `ended_at`/`status` have been filled in.
    pub fn is_complete(&self) -> bool {
        self.status.is_some()
    }

    /// `true` iff the record closed as [`NodeState::Completed`].
    pub fn was_successful(&self) -> bool {
        matches!(self.status, Some(NodeState::Completed))
    }
}

/// Aggregate counters over a node's execution history.
#[derive(Debug, Clone, Default)]
pub struct ExecutionSummary {
    /// Total closed invocations.
    pub total: u32,
    /// Invocations that completed successfully.
    pub succeeded: u32,
    /// Invocations that failed.
    pub failed: u32,
    /// Sum of closed invocation durations.
    pub total_duration: Duration,
}

#[derive(Debug, Default)]
struct NodeRuntime {
    state: Option<NodeState>,
    execution_count: u32,
    iterations_per_epoch: HashMap<u64, u32>,
    history: Vec<ExecutionRecord>,
}

/// Owns every node's current state and execution history behind a single
/// lock. Critical sections here are expected to be short; handler
/// invocation happens entirely outside this lock.
#[derive(Debug, Default)]
pub struct StateTracker {
    nodes: Mutex<HashMap<String, NodeRuntime>>,
}

impl StateTracker {
    /// Construct an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a node as `Pending` with zero execution history.
    pub fn initialize_node(&self, node_id: &str) {
        let mut nodes = self.nodes.lock().unwrap();
        nodes.entry(node_id.to_string()).or_insert_with(|| NodeRuntime {
            state: Some(NodeState::Pending),
            ..Default::default()
        });
    }

    /// Current state of a node, or `Pending` if never initialized.
    pub fn get_node_state(&self, node_id: &str) -> NodeState {
        let nodes = self.nodes.lock().unwrap();
        nodes
            .get(node_id)
            .and_then(|n| n.state.clone())
            .unwrap_or(NodeState::Pending)
    }

    /// Total invocations across all epochs. Never reset by [`Self::reset_node`].
    pub fn get_execution_count(&self, node_id: &str) -> u32 {
        let nodes = self.nodes.lock().unwrap();
        nodes.get(node_id).map(|n| n.execution_count).unwrap_or(0)
    }

    /// Invocations of `node_id` within `epoch` so far.
    pub fn get_iterations_in_epoch(&self, node_id: &str, epoch: u64) -> u32 {
        let nodes = self.nodes.lock().unwrap();
        nodes
            .get(node_id)
            .and_then(|n| n.iterations_per_epoch.get(&epoch).copied())
            .unwrap_or(0)
    }

    /// `false` once a node has reached its per-epoch iteration cap.
    ///
    /// `default_cap` is the engine-wide fallback (from
    /// [`crate::config::EngineConfig::max_iterations_per_epoch`]) used when
    /// the node itself declares no `max_iteration`.
    pub fn can_execute_in_loop(&self, node_id: &str, epoch: u64, max_iteration: Option<u32>, default_cap: u32) -> bool {
        let cap = max_iteration.unwrap_or(default_cap);
        self.get_iterations_in_epoch(node_id, epoch) < cap
    }

    /// Mark a node `Running`, bump its execution count and per-epoch
    /// iteration counter, and open a new history record. Returns the
    /// invocation's 1-based execution number.
    pub fn transition_to_running(&self, node_id: &str, epoch: u64) -> u32 {
        let mut nodes = self.nodes.lock().unwrap();
        let runtime = nodes.entry(node_id.to_string()).or_default();
        runtime.state = Some(NodeState::Running);
        runtime.execution_count += 1;
        *runtime.iterations_per_epoch.entry(epoch).or_insert(0) += 1;
        runtime.history.push(ExecutionRecord {
            execution_number: runtime.execution_count,
            started_at: Instant::now(),
            ended_at: None,
            status: None,
            output: None,
            error: None,
        });
        runtime.execution_count
    }

    fn close_latest(
        &self,
        nodes: &mut HashMap<String, NodeRuntime>,
        node_id: &str,
        status: NodeState,
        output: Option<Envelope>,
        error: Option<String>,
    ) {
        let runtime = nodes.entry(node_id.to_string()).or_default();
        runtime.state = Some(status.clone());
        if let Some(record) = runtime.history.last_mut().filter(|r| !r.is_complete()) {
            record.ended_at = Some(Instant::now());
            record.status = Some(status);
            record.output = output;
            record.error = error;
        }
    }

    /// Close the open invocation as `Completed`, storing its output.
    pub fn transition_to_completed(&self, node_id: &str, output: Envelope) {
        let mut nodes = self.nodes.lock().unwrap();
        self.close_latest(&mut nodes, node_id, NodeState::Completed, Some(output), None);
    }

    /// Close the open invocation as `Failed`.
    pub fn transition_to_failed(&self, node_id: &str, error: impl Into<String>) {
        let mut nodes = self.nodes.lock().unwrap();
        let error = error.into();
        self.close_latest(&mut nodes, node_id, NodeState::Failed(error.clone()), None, Some(error));
    }

    /// Close the open invocation as `MaxIterReached`.
    pub fn transition_to_maxiter(&self, node_id: &str, output: Option<Envelope>) {
        let mut nodes = self.nodes.lock().unwrap();
        self.close_latest(&mut nodes, node_id, NodeState::MaxIterReached, output, None);
    }

    /// Mark a node `Skipped` without opening a history record (it never ran).
    pub fn transition_to_skipped(&self, node_id: &str) {
        let mut nodes = self.nodes.lock().unwrap();
        let runtime = nodes.entry(node_id.to_string()).or_default();
        runtime.state = Some(NodeState::Skipped);
    }

    /// Reset a node to `Pending`. Execution count and history are preserved
    /// so loops don't lose audit trail across iterations.
    pub fn reset_node(&self, node_id: &str) {
        let mut nodes = self.nodes.lock().unwrap();
        let runtime = nodes.entry(node_id.to_string()).or_default();
        runtime.state = Some(NodeState::Pending);
    }

    /// The output envelope of the most recent closed invocation, if any.
    pub fn get_last_output(&self, node_id: &str) -> Option<Envelope> {
        let nodes = self.nodes.lock().unwrap();
        nodes
            .get(node_id)
            .and_then(|n| n.history.iter().rev().find_map(|r| r.output.clone()))
    }

    /// Aggregate counters over a node's full history.
    pub fn get_execution_summary(&self, node_id: &str) -> ExecutionSummary {
        let nodes = self.nodes.lock().unwrap();
        let mut summary = ExecutionSummary::default();
        if let Some(runtime) = nodes.get(node_id) {
            for record in &runtime.history {
                if !record.is_complete() {
                    continue;
                }
                summary.total += 1;
                if record.was_successful() {
                    summary.succeeded += 1;
                } else if matches!(record.status, Some(NodeState::Failed(_))) {
                    summary.failed += 1;
                }
                if let Some(d) = record.duration() {
                    summary.total_duration += d;
                }
            }
        }
        summary
    }
}
