//! Fire-and-forget event pipeline.
//!
//! Events are advisory: the engine never blocks waiting for a subscriber to
//! drain its queue. A slow or wedged subscriber loses events rather than
//! stalling execution.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

use crate::envelope::Envelope;

/// Default bound on each subscriber's event queue.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// A typed engine event.
#[derive(Debug, Clone)]
pub enum Event {
    /// Execution began.
    ExecutionStarted { execution_id: String, at: DateTime<Utc> },
    /// Execution finished successfully.
    ExecutionCompleted { execution_id: String, at: DateTime<Utc> },
    /// Execution ended in an engine-level error.
    ExecutionError {
        execution_id: String,
        error: String,
        at: DateTime<Utc>,
    },
    /// A node began an invocation.
    NodeStarted {
        execution_id: String,
        node_id: String,
        execution_count: u32,
        at: DateTime<Utc>,
    },
    /// A node's invocation completed successfully.
    NodeCompleted {
        execution_id: String,
        node_id: String,
        duration: Duration,
        output: Envelope,
        at: DateTime<Utc>,
    },
    /// A node's invocation failed.
    NodeError {
        execution_id: String,
        node_id: String,
        error: String,
        at: DateTime<Utc>,
    },
}

/// Broadcasts [`Event`]s to any number of subscribers with bounded,
/// independent queues.
pub struct EventPipeline {
    sender: broadcast::Sender<Event>,
}

impl EventPipeline {
    /// Build a pipeline with the given per-subscriber queue capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Subscribe to the event stream. Dropping the returned receiver
    /// unsubscribes.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    /// Subscribe as a [`futures::Stream`], for callers that want `.next()`
    /// rather than polling `recv()` directly. Lagged events surface as
    /// `Err` items rather than being silently skipped.
    pub fn subscribe_stream(
        &self,
    ) -> impl futures::Stream<Item = std::result::Result<Event, tokio_stream::wrappers::errors::BroadcastStreamRecvError>>
    {
        tokio_stream::wrappers::BroadcastStream::new(self.subscribe())
    }

    /// Publish an event. Never blocks; if there are no subscribers this is
    /// a no-op, and a subscriber that has fallen behind its capacity will
    /// observe a lagged-receiver error on its next `recv` rather than
    /// stalling the publisher.
    pub fn publish(&self, event: Event) {
        if self.sender.receiver_count() == 0 {
            return;
        }
        if self.sender.send(event).is_err() {
            tracing::debug!("event published with no active subscribers");
        }
    }
}

impl Default for EventPipeline {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}
