//! Error types for the meshrun coordination layer.
//!
//! [`MeshError`] is the single error taxonomy callers see. Errors raised on a
//! remote node travel back inside a RESPONSE packet as an [`ErrorPayload`]
//! and are rehydrated with [`MeshError::from_payload`], so a caller cannot
//! tell "failed locally" from "failed on the target" except through
//! [`MeshError::origin_node`].

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::codec::CodecError;
use crate::registry::NodeId;
use crate::transport::TransportError;

/// Errors produced by the registry, transit and circuit breaker.
#[derive(Debug, Clone, Error)]
pub enum MeshError {
    /// No endpoint exists (or none is available) for the action or event.
    #[error("service '{action}' is not found{}", on_node(.node_id))]
    ServiceNotFound {
        /// Action or event name that was requested.
        action: String,
        /// Node the call was pinned to, if any.
        node_id: Option<NodeId>,
    },

    /// The pending request timed out before a response arrived.
    #[error("request timed out when calling '{action}' on node '{node_id}' after {elapsed:?}")]
    RequestTimeout {
        /// Action that was called.
        action: String,
        /// Target node.
        node_id: NodeId,
        /// Time elapsed since the request was sent.
        elapsed: Duration,
    },

    /// The target node was marked disconnected while the request was pending.
    #[error("node '{node_id}' is unavailable")]
    NodeUnavailable {
        /// The lost node.
        node_id: NodeId,
    },

    /// The pending request was rejected locally (transit stopped, entry replaced,
    /// publish failure).
    #[error("request '{action}' to node '{node_id}' was rejected: {reason}")]
    RequestRejected {
        /// Action that was called.
        action: String,
        /// Target node.
        node_id: NodeId,
        /// Human-readable reason.
        reason: String,
    },

    /// The transporter failed to connect or publish.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Payload encoding or decoding failed.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// A received packet failed validation.
    #[error("malformed {kind} packet: {reason}")]
    MalformedPacket {
        /// Packet type name.
        kind: String,
        /// Why the packet was rejected.
        reason: String,
    },

    /// A received packet uses another protocol version.
    #[error("protocol version mismatch from node '{node_id}': got '{actual}', expected '{expected}'")]
    ProtocolVersionMismatch {
        /// Sender of the packet.
        node_id: NodeId,
        /// Version carried by the packet.
        actual: String,
        /// Version this node speaks.
        expected: String,
    },

    /// Application error raised by a handler, or a remote error with an
    /// unknown name.
    #[error("{message}")]
    Handler {
        /// Error class name (e.g. `ValidationError`).
        name: String,
        /// Human-readable message.
        message: String,
        /// Numeric code, HTTP-like.
        code: u16,
        /// Application-specific type tag.
        kind: Option<String>,
        /// Extra data.
        data: Option<Value>,
        /// Whether a retry may succeed.
        retryable: bool,
        /// Node that raised the error.
        node_id: Option<NodeId>,
    },
}

fn on_node(node_id: &Option<NodeId>) -> String {
    match node_id {
        Some(id) => format!(" on node '{}'", id),
        None => String::new(),
    }
}

/// Serialized error carried by a RESPONSE packet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    /// Error class name.
    pub name: String,
    /// Human-readable message.
    pub message: String,
    /// Numeric code.
    pub code: u16,
    /// Application-specific type tag.
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    /// Extra data.
    #[serde(default)]
    pub data: Option<Value>,
    /// Whether a retry may succeed.
    #[serde(default)]
    pub retryable: bool,
    /// Node where the error originated.
    #[serde(rename = "nodeID", default)]
    pub node_id: Option<NodeId>,
}

impl MeshError {
    /// Build an application error with code 500.
    pub fn handler(message: impl Into<String>) -> Self {
        Self::Handler {
            name: "MeshError".to_string(),
            message: message.into(),
            code: 500,
            kind: None,
            data: None,
            retryable: false,
            node_id: None,
        }
    }

    /// Build an application error with an explicit name and code.
    pub fn custom(name: impl Into<String>, message: impl Into<String>, code: u16) -> Self {
        Self::Handler {
            name: name.into(),
            message: message.into(),
            code,
            kind: None,
            data: None,
            retryable: false,
            node_id: None,
        }
    }

    /// Error class name as sent over the wire.
    pub fn name(&self) -> &str {
        match self {
            Self::ServiceNotFound { .. } => "ServiceNotFoundError",
            Self::RequestTimeout { .. } => "RequestTimeoutError",
            Self::NodeUnavailable { .. } => "NodeUnavailableError",
            Self::RequestRejected { .. } => "RequestRejectedError",
            Self::Transport(_) => "TransportError",
            Self::Codec(_) => "SerializationError",
            Self::MalformedPacket { .. } => "InvalidPacketDataError",
            Self::ProtocolVersionMismatch { .. } => "ProtocolVersionMismatchError",
            Self::Handler { name, .. } => name,
        }
    }

    /// HTTP-like numeric code.
    pub fn code(&self) -> u16 {
        match self {
            Self::ServiceNotFound { .. } => 404,
            Self::RequestTimeout { .. } => 504,
            Self::NodeUnavailable { .. } | Self::RequestRejected { .. } => 503,
            Self::Transport(_) => 502,
            Self::Codec(_) | Self::MalformedPacket { .. } | Self::ProtocolVersionMismatch { .. } => {
                500
            }
            Self::Handler { code, .. } => *code,
        }
    }

    /// Whether a caller-driven retry may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RequestTimeout { .. }
            | Self::NodeUnavailable { .. }
            | Self::RequestRejected { .. }
            | Self::Transport(_) => true,
            Self::ServiceNotFound { .. }
            | Self::Codec(_)
            | Self::MalformedPacket { .. }
            | Self::ProtocolVersionMismatch { .. } => false,
            Self::Handler { retryable, .. } => *retryable,
        }
    }

    /// Node on which the error originated, when known.
    pub fn origin_node(&self) -> Option<&NodeId> {
        match self {
            Self::ServiceNotFound { node_id, .. } | Self::Handler { node_id, .. } => {
                node_id.as_ref()
            }
            Self::RequestTimeout { node_id, .. }
            | Self::NodeUnavailable { node_id }
            | Self::RequestRejected { node_id, .. }
            | Self::ProtocolVersionMismatch { node_id, .. } => Some(node_id),
            Self::Transport(_) | Self::Codec(_) | Self::MalformedPacket { .. } => None,
        }
    }

    /// Serialize this error for a RESPONSE packet sent by `local_node`.
    ///
    /// Errors that already carry an origin keep it; the rest are stamped with
    /// the local node.
    pub fn to_payload(&self, local_node: &NodeId) -> ErrorPayload {
        let (kind, data) = match self {
            Self::Handler { kind, data, .. } => (kind.clone(), data.clone()),
            Self::ServiceNotFound { action, .. } => {
                (None, Some(serde_json::json!({ "action": action })))
            }
            Self::RequestTimeout {
                action, elapsed, ..
            } => (
                None,
                Some(serde_json::json!({
                    "action": action,
                    "elapsedMs": elapsed.as_millis() as u64,
                })),
            ),
            Self::RequestRejected { action, reason, .. } => (
                None,
                Some(serde_json::json!({ "action": action, "reason": reason })),
            ),
            _ => (None, None),
        };
        ErrorPayload {
            name: self.name().to_string(),
            message: self.to_string(),
            code: self.code(),
            kind,
            data,
            retryable: self.is_retryable(),
            node_id: Some(
                self.origin_node()
                    .cloned()
                    .unwrap_or_else(|| local_node.clone()),
            ),
        }
    }

    /// Rehydrate an error received from `sender`.
    ///
    /// Known names map back to their typed variants; anything else becomes a
    /// [`MeshError::Handler`] that preserves name, message and code.
    pub fn from_payload(payload: ErrorPayload, sender: &NodeId) -> Self {
        let origin = payload.node_id.clone().unwrap_or_else(|| sender.clone());
        let field = |key: &str| {
            payload
                .data
                .as_ref()
                .and_then(|d| d.get(key))
                .and_then(Value::as_str)
                .map(str::to_string)
        };
        match payload.name.as_str() {
            "ServiceNotFoundError" => Self::ServiceNotFound {
                action: field("action").unwrap_or_default(),
                node_id: Some(origin),
            },
            "RequestTimeoutError" => Self::RequestTimeout {
                action: field("action").unwrap_or_default(),
                node_id: origin,
                elapsed: Duration::from_millis(
                    payload
                        .data
                        .as_ref()
                        .and_then(|d| d.get("elapsedMs"))
                        .and_then(Value::as_u64)
                        .unwrap_or(0),
                ),
            },
            "NodeUnavailableError" => Self::NodeUnavailable { node_id: origin },
            "RequestRejectedError" => Self::RequestRejected {
                action: field("action").unwrap_or_default(),
                node_id: origin,
                reason: field("reason").unwrap_or(payload.message),
            },
            _ => Self::Handler {
                name: payload.name,
                message: payload.message,
                code: payload.code,
                kind: payload.kind,
                data: payload.data,
                retryable: payload.retryable,
                node_id: Some(origin),
            },
        }
    }
}

/// Convenience result alias.
pub type Result<T> = std::result::Result<T, MeshError>;
