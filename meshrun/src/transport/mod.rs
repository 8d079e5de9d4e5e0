//! Transport collaborator contract.
//!
//! Socket and broker adapters live outside this crate. The coordination layer
//! only needs something that can publish bytes to a [`Topic`] and push
//! received bytes into an inbox channel. One topic exists per packet type,
//! optionally suffixed by a target node id:
//!
//! ```text
//! MOL.INFO            broadcast INFO
//! MOL.REQ.node-2      REQUEST addressed to node-2
//! MOL-staging.EVENT   broadcast EVENT in namespace "staging"
//! ```

mod memory;

use std::fmt;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::packet::PacketType;
use crate::registry::NodeId;

pub use memory::{InMemoryHub, InMemoryTransporter};

/// Errors reported by a transporter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The transporter is not connected.
    #[error("transporter is not connected")]
    NotConnected,

    /// Connecting to the underlying medium failed.
    #[error("connect failed: {0}")]
    ConnectFailed(String),

    /// Publishing a packet failed.
    #[error("send to '{topic}' failed: {reason}")]
    SendFailed {
        /// Rendered topic.
        topic: String,
        /// Underlying reason.
        reason: String,
    },
}

/// Destination of a published packet.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Topic {
    /// Cluster namespace, empty for the default one.
    pub namespace: String,
    /// Packet type carried on this topic.
    pub kind: PacketType,
    /// Target node, `None` for broadcast.
    pub target: Option<NodeId>,
}

impl Topic {
    /// Broadcast topic for `kind`.
    pub fn broadcast(namespace: impl Into<String>, kind: PacketType) -> Self {
        Self {
            namespace: namespace.into(),
            kind,
            target: None,
        }
    }

    /// Topic for `kind` addressed to `target`.
    pub fn targeted(namespace: impl Into<String>, kind: PacketType, target: NodeId) -> Self {
        Self {
            namespace: namespace.into(),
            kind,
            target: Some(target),
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MOL")?;
        if !self.namespace.is_empty() {
            write!(f, "-{}", self.namespace)?;
        }
        write!(f, ".{}", self.kind)?;
        if let Some(target) = &self.target {
            write!(f, ".{}", target)?;
        }
        Ok(())
    }
}

/// Bytes received by a transporter, tagged with the packet type of the topic
/// they arrived on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingMessage {
    /// Packet type of the topic.
    pub kind: PacketType,
    /// Encoded payload.
    pub bytes: Vec<u8>,
}

/// Channel the transporter pushes received messages into.
pub type Inbox = mpsc::UnboundedSender<IncomingMessage>;

/// Pluggable transport.
///
/// Implementations subscribe, on `connect`, to every broadcast topic and to
/// every topic targeted at their own node, and forward what they receive to
/// the inbox.
#[async_trait(?Send)]
pub trait Transporter: fmt::Debug {
    /// Connect and start delivering inbound messages to `inbox`.
    async fn connect(&self, inbox: Inbox) -> Result<(), TransportError>;

    /// Stop delivering and release the medium.
    async fn disconnect(&self) -> Result<(), TransportError>;

    /// Publish encoded bytes on `topic`.
    async fn send(&self, topic: &Topic, bytes: Vec<u8>) -> Result<(), TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_rendering() {
        assert_eq!(Topic::broadcast("", PacketType::Info).to_string(), "MOL.INFO");
        assert_eq!(
            Topic::targeted("", PacketType::Request, "node-2".into()).to_string(),
            "MOL.REQ.node-2"
        );
        assert_eq!(
            Topic::broadcast("staging", PacketType::Event).to_string(),
            "MOL-staging.EVENT"
        );
    }
}
