//! Run progress as a stream of [`ExecutionEvent`]s.
//!
//! Observers subscribe to an [`EventEmitter`]; the executor publishes whether
//! or not anyone listens.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::trace::ExecutionStatus;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ExecutionEvent {
    ExecutionStarted {
        run_id: String,
        graph_id: String,
        node_count: usize,
    },
    NodeStarted {
        node_id: String,
        node_type: String,
    },
    NodeCompleted {
        node_id: String,
        status: String,
        duration_ms: u64,
    },
    NodeRetrying {
        node_id: String,
        attempt: usize,
        delay_ms: u64,
    },
    FallbackUsed {
        node_id: String,
        /// Alternative implementation id or fallback edge target.
        target: String,
    },
    ConditionFailed {
        node_id: String,
        expression: String,
        message: String,
    },
    InteractionRequested {
        node_id: String,
        prompt: String,
    },
    ExecutionFinished {
        run_id: String,
        status: ExecutionStatus,
        duration_ms: u64,
    },
}

/// Broadcast fan-out of [`ExecutionEvent`]s. Cloning shares the channel.
#[derive(Clone)]
pub struct EventEmitter {
    sender: broadcast::Sender<ExecutionEvent>,
}

impl EventEmitter {
    /// `capacity` events are buffered per subscriber before the oldest are lost.
    pub fn new(capacity: usize) -> Self {
        Self {
            sender: broadcast::channel(capacity).0,
        }
    }

    pub fn emit(&self, event: ExecutionEvent) {
        // No subscribers is not an error.
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new(256)
    }
}
