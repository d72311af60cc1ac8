//! Progress events and their per-subscriber fan-out.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio_stream::wrappers::UnboundedReceiverStream;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Started,
    Progress,
    Completed,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowEvent {
    #[serde(rename = "type")]
    pub kind: EventType,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl WorkflowEvent {
    pub fn new(kind: EventType, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            timestamp: Utc::now(),
            data: None,
        }
    }

    pub fn started(message: impl Into<String>) -> Self {
        Self::new(EventType::Started, message)
    }

    pub fn progress(message: impl Into<String>) -> Self {
        Self::new(EventType::Progress, message)
    }

    pub fn completed(message: impl Into<String>) -> Self {
        Self::new(EventType::Completed, message)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(EventType::Error, message)
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// Stream handed to one subscriber.
pub type EventStream = UnboundedReceiverStream<WorkflowEvent>;

#[derive(Default)]
struct HubState {
    subscribers: Vec<UnboundedSender<WorkflowEvent>>,
    closed: bool,
}

/// Single-producer fan-out. Every subscriber owns an unbounded queue, so
/// emitting never waits on a slow reader.
#[derive(Default)]
pub(crate) struct EventHub {
    state: Mutex<HubState>,
}

impl EventHub {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Hub for a workflow that is already terminal.
    pub(crate) fn closed() -> Self {
        Self {
            state: Mutex::new(HubState {
                subscribers: Vec::new(),
                closed: true,
            }),
        }
    }

    /// New subscriber whose first item is `current()`.
    ///
    /// `current` runs under the hub lock so no live event can slip in ahead
    /// of it. On a closed hub the stream ends right after that event.
    pub(crate) fn subscribe(&self, current: impl FnOnce() -> WorkflowEvent) -> EventStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.lock();
        // Receiver is alive, send cannot fail.
        let _ = tx.send(current());
        if !state.closed {
            state.subscribers.push(tx);
        }
        UnboundedReceiverStream::new(rx)
    }

    pub(crate) fn emit(&self, event: WorkflowEvent) {
        let mut state = self.lock();
        if state.closed {
            return;
        }
        state.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Deliver `event` as the last item of every open stream.
    ///
    /// Returns `false` when the hub was already closed.
    pub(crate) fn finish(&self, event: WorkflowEvent) -> bool {
        let mut state = self.lock();
        if state.closed {
            return false;
        }
        for tx in state.subscribers.drain(..) {
            let _ = tx.send(event.clone());
        }
        state.closed = true;
        true
    }

    /// Accept events again after a terminal one (retry, skip).
    pub(crate) fn reopen(&self) {
        self.lock().closed = false;
    }

    pub(crate) fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HubState> {
        // Every update to HubState is a single step, so a poisoned lock is still consistent.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
