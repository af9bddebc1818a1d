//! Pipeline event stream for observability.
//!
//! Stage execution is a supervised task with observable completion: the
//! controller emits [`PipelineEvent`]s via a [`tokio::sync::broadcast`]
//! channel so front ends can render progress without polling file timestamps
//! or re-deriving logic.

use serde::{Deserialize, Serialize};

/// Events emitted while a stage run is in flight.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PipelineEvent {
    StageStarted {
        instance: String,
        stage: String,
        attempt: u32,
    },
    StageAttemptFailed {
        instance: String,
        stage: String,
        attempt: u32,
        signature: String,
        exit_code: i32,
        timed_out: bool,
    },
    RemediationApplied {
        instance: String,
        stage: String,
        detail: String,
    },
    StageRetrying {
        instance: String,
        stage: String,
        next_attempt: u32,
    },
    StageSucceeded {
        instance: String,
        stage: String,
        attempts: u32,
        duration_ms: u64,
    },
    StageFailed {
        instance: String,
        stage: String,
        error: String,
    },
    StageCancelled {
        instance: String,
        stage: String,
        attempt: u32,
    },
}

/// Event emitter wrapping a broadcast sender.
#[derive(Clone)]
pub struct EventEmitter {
    sender: tokio::sync::broadcast::Sender<PipelineEvent>,
}

impl EventEmitter {
    /// Create a new emitter with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = tokio::sync::broadcast::channel(capacity);
        Self { sender }
    }

    /// Emit an event to all current subscribers.
    ///
    /// If there are no active receivers the event is silently dropped.
    pub fn emit(&self, event: PipelineEvent) {
        let _ = self.sender.send(event);
    }

    /// Subscribe to events. Returns a broadcast receiver.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<PipelineEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new(256)
    }
}
