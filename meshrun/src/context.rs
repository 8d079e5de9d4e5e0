//! Call context handed to strategies and handlers.

use std::time::Duration;

use serde_json::Value;

use crate::packet::{EventPayload, Meta, RequestPayload};
use crate::registry::NodeId;
use crate::transit::stream::{ByteStream, ChunkSource};

/// Per-call context.
///
/// Built by the caller for outgoing calls and rebuilt from the REQUEST or
/// EVENT packet on the receiving node.
#[derive(Debug, Default)]
pub struct Context {
    /// Context id; doubles as the request correlation id on the wire.
    pub id: String,
    /// Root request id of the call chain.
    pub request_id: Option<String>,
    /// Parent context id.
    pub parent_id: Option<String>,
    /// Nesting level, 1 for top-level calls.
    pub level: u32,
    /// Service that issued the call.
    pub caller: Option<String>,
    /// Node the context originated from.
    pub node_id: Option<NodeId>,
    /// Action name, for action calls.
    pub action: Option<String>,
    /// Event name, for event deliveries.
    pub event: Option<String>,
    /// Groups the event was delivered to.
    pub event_groups: Option<Vec<String>>,
    /// Call parameters or event data.
    pub params: Value,
    /// Call metadata.
    pub meta: Meta,
    /// Timeout requested by the caller.
    pub timeout: Option<Duration>,
    /// Inbound byte stream, when the caller attached one.
    pub stream: Option<ByteStream>,
}

impl Context {
    /// Fresh top-level context for calling `action`.
    pub fn for_action(action: impl Into<String>, params: Value) -> Self {
        let id = new_context_id();
        Self {
            request_id: Some(id.clone()),
            id,
            level: 1,
            action: Some(action.into()),
            params,
            ..Self::default()
        }
    }

    /// Fresh top-level context for emitting `event`.
    pub fn for_event(event: impl Into<String>, data: Value) -> Self {
        let id = new_context_id();
        Self {
            request_id: Some(id.clone()),
            id,
            level: 1,
            event: Some(event.into()),
            params: data,
            ..Self::default()
        }
    }

    /// Rebuild the handler-side context of a REQUEST header.
    pub fn from_request(payload: &RequestPayload, stream: Option<ByteStream>) -> Self {
        Self {
            id: payload.id.clone(),
            request_id: payload.request_id.clone(),
            parent_id: payload.parent_id.clone(),
            level: payload.level,
            caller: payload.caller.clone(),
            node_id: Some(payload.sender.clone()),
            action: Some(payload.action.clone()),
            event: None,
            event_groups: None,
            params: payload.params.clone(),
            meta: payload.meta.clone().unwrap_or_default(),
            timeout: payload.timeout.map(Duration::from_millis),
            stream,
        }
    }

    /// Rebuild the handler-side context of an EVENT packet.
    pub fn from_event(payload: &EventPayload) -> Self {
        Self {
            id: payload.id.clone(),
            request_id: payload.request_id.clone(),
            parent_id: payload.parent_id.clone(),
            level: payload.level,
            caller: None,
            node_id: Some(payload.sender.clone()),
            action: None,
            event: Some(payload.event.clone()),
            event_groups: payload.groups.clone(),
            params: payload.data.clone(),
            meta: payload.meta.clone(),
            timeout: None,
            stream: None,
        }
    }

    /// Child context for a nested call made while handling this one.
    pub fn child(&self, action: impl Into<String>, params: Value) -> Self {
        Self {
            id: new_context_id(),
            request_id: self.request_id.clone().or_else(|| Some(self.id.clone())),
            parent_id: Some(self.id.clone()),
            level: self.level + 1,
            caller: self.caller.clone(),
            node_id: None,
            action: Some(action.into()),
            event: None,
            event_groups: None,
            params,
            meta: self.meta.clone(),
            timeout: self.timeout,
            stream: None,
        }
    }

    /// Look up a dotted path (`user.id`) in the params.
    pub fn param(&self, path: &str) -> Option<&Value> {
        lookup_path(&self.params, path)
    }

    /// Look up a dotted path in the metadata.
    pub fn meta_value(&self, path: &str) -> Option<&Value> {
        let (head, rest) = match path.split_once('.') {
            Some((head, rest)) => (head, Some(rest)),
            None => (path, None),
        };
        let root = self.meta.get(head)?;
        match rest {
            Some(rest) => lookup_path(root, rest),
            None => Some(root),
        }
    }
}

/// Options for a single call.
#[derive(Debug, Default)]
pub struct CallOptions {
    /// Timeout for each attempt; falls back to the broker default.
    pub timeout: Option<Duration>,
    /// Retries on retryable errors; falls back to the broker default.
    pub retries: Option<u32>,
    /// Pin the call to one node.
    pub node_id: Option<NodeId>,
    /// Metadata to send with the call.
    pub meta: Meta,
    /// Outbound byte stream.
    pub stream: Option<ChunkSource>,
}

impl CallOptions {
    /// Default options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the per-attempt timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set the number of retries.
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }

    /// Pin the call to `node_id`.
    pub fn with_node(mut self, node_id: impl Into<NodeId>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }

    /// Add one metadata entry.
    pub fn with_meta(mut self, key: impl Into<String>, value: Value) -> Self {
        self.meta.insert(key.into(), value);
        self
    }

    /// Attach an outbound byte stream.
    pub fn with_stream(mut self, stream: ChunkSource) -> Self {
        self.stream = Some(stream);
        self
    }
}

/// Generate a new globally unique context id.
pub fn new_context_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Resolve a dotted path inside a JSON value.
pub fn lookup_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(value);
    }
    path.split('.').try_fold(value, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}
