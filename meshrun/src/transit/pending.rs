//! Outstanding requests awaiting a RESPONSE.
//!
//! Each entry owns the one-shot sender of its caller. Every way an entry can
//! end (response, timeout, node loss, shutdown, replacement) removes it from
//! the map first, so whichever path comes first settles the caller and the
//! others find nothing.
//!
//! An entry may also own the task pumping its request stream. Settling the
//! entry aborts that task, whatever the path.

use std::cell::RefCell;
use std::collections::HashMap;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::error::MeshError;
use crate::packet::Meta;
use crate::registry::NodeId;

use super::stream::ByteStream;

/// Successful result of a call.
#[derive(Debug, Default)]
pub struct Response {
    /// Result data.
    pub data: Value,
    /// Response metadata.
    pub meta: Meta,
    /// Response stream, when the handler replied with one.
    pub stream: Option<ByteStream>,
}

/// Caller side of a pending request.
pub type ResponseReceiver = oneshot::Receiver<Result<Response, MeshError>>;

#[derive(Debug)]
struct PendingEntry {
    node_id: NodeId,
    action: String,
    started: Duration,
    sender: oneshot::Sender<Result<Response, MeshError>>,
    timer: Option<JoinHandle<()>>,
    stream: Option<JoinHandle<()>>,
}

/// Table of pending requests keyed by request id.
#[derive(Debug, Default)]
pub struct PendingRequests {
    entries: RefCell<HashMap<String, PendingEntry>>,
}

impl PendingRequests {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register request `id` sent to `node_id`.
    ///
    /// An existing entry under the same id is rejected first.
    pub fn insert(
        &self,
        id: impl Into<String>,
        node_id: impl Into<NodeId>,
        action: impl Into<String>,
        started: Duration,
    ) -> ResponseReceiver {
        let id = id.into();
        let (sender, receiver) = oneshot::channel();
        let entry = PendingEntry {
            node_id: node_id.into(),
            action: action.into(),
            started,
            sender,
            timer: None,
            stream: None,
        };
        let previous = self.entries.borrow_mut().insert(id.clone(), entry);
        if let Some(previous) = previous {
            tracing::warn!(request_id = %id, "request id reused, rejecting previous entry");
            let err = MeshError::RequestRejected {
                action: previous.action.clone(),
                node_id: previous.node_id.clone(),
                reason: "replaced by a newer request with the same id".to_string(),
            };
            finish(previous, Err(err), true);
        }
        receiver
    }

    /// Attach the timeout task of `id`. Aborts it if `id` is already settled.
    pub fn set_timer(&self, id: &str, timer: JoinHandle<()>) {
        match self.entries.borrow_mut().get_mut(id) {
            Some(entry) => entry.timer = Some(timer),
            None => timer.abort(),
        }
    }

    /// Attach the task sending the request stream of `id`. Aborts it if
    /// `id` is already settled.
    pub fn set_stream(&self, id: &str, pump: JoinHandle<()>) {
        match self.entries.borrow_mut().get_mut(id) {
            Some(entry) => entry.stream = Some(pump),
            None => pump.abort(),
        }
    }

    /// Whether `id` is pending.
    pub fn contains(&self, id: &str) -> bool {
        self.entries.borrow().contains_key(id)
    }

    /// Target node of `id`.
    pub fn node_of(&self, id: &str) -> Option<NodeId> {
        self.entries.borrow().get(id).map(|e| e.node_id.clone())
    }

    /// Number of pending requests.
    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    /// Whether nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }

    /// Settle `id` with `result`. Returns false when `id` was not pending.
    pub fn settle(&self, id: &str, result: Result<Response, MeshError>) -> bool {
        let entry = self.entries.borrow_mut().remove(id);
        match entry {
            Some(entry) => {
                finish(entry, result, true);
                true
            }
            None => false,
        }
    }

    /// Fail `id` with a timeout. Called by the entry's own timer task.
    pub fn timeout(&self, id: &str, now: Duration) -> bool {
        let entry = self.entries.borrow_mut().remove(id);
        let Some(entry) = entry else {
            return false;
        };
        let elapsed = now.saturating_sub(entry.started);
        tracing::debug!(request_id = %id, node_id = %entry.node_id, ?elapsed, "request timed out");
        let err = MeshError::RequestTimeout {
            action: entry.action.clone(),
            node_id: entry.node_id.clone(),
            elapsed,
        };
        finish(entry, Err(err), false);
        true
    }

    /// Fail every request sent to `node_id`. Returns how many were pending.
    pub fn reject_node(&self, node_id: &str) -> usize {
        let drained: Vec<PendingEntry> = {
            let mut entries = self.entries.borrow_mut();
            let ids: Vec<String> = entries
                .iter()
                .filter(|(_, e)| e.node_id == node_id)
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| entries.remove(id)).collect()
        };
        let count = drained.len();
        for entry in drained {
            let err = MeshError::NodeUnavailable {
                node_id: entry.node_id.clone(),
            };
            finish(entry, Err(err), true);
        }
        if count > 0 {
            tracing::debug!(node_id = %node_id, count, "rejected pending requests of lost node");
        }
        count
    }

    /// Fail every pending request with `reason`.
    pub fn reject_all(&self, reason: &str) -> usize {
        let drained: Vec<PendingEntry> = self.entries.borrow_mut().drain().map(|(_, e)| e).collect();
        let count = drained.len();
        for entry in drained {
            let err = MeshError::RequestRejected {
                action: entry.action.clone(),
                node_id: entry.node_id.clone(),
                reason: reason.to_string(),
            };
            finish(entry, Err(err), true);
        }
        count
    }
}

fn finish(mut entry: PendingEntry, result: Result<Response, MeshError>, abort_timer: bool) {
    if let Some(timer) = entry.timer.take() {
        if abort_timer {
            timer.abort();
        }
    }
    if let Some(pump) = entry.stream.take() {
        pump.abort();
    }
    // The caller may have given up already.
    let _ = entry.sender.send(result);
}
