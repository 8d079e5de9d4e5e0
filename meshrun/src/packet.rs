//! Wire protocol packets.
//!
//! A [`Packet`] is a closed tagged variant: one [`PacketPayload`] variant per
//! [`PacketType`], plus an optional target node (`None` = broadcast). Adding a
//! packet type is a compile-time checked change to the codec and the transit
//! dispatch table.
//!
//! # Stream framing
//!
//! ```text
//! seq 0   header   params/meta (meta only here)     stream = true
//! seq 1.. chunk    chunk bytes                      stream = true
//! seq n   end      no chunk, optional error         stream = false
//! ```
//!
//! The receiver acknowledges consumed chunks with [`StreamAckPayload`].

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ErrorPayload;
use crate::registry::NodeId;
use crate::strategy::StrategyKind;

/// Protocol version carried by every packet.
pub const PROTOCOL_VERSION: &str = "4";

/// Free-form metadata map carried alongside calls and events.
pub type Meta = Map<String, Value>;

/// Discriminant of a packet, used to name topics and pick a decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PacketType {
    /// Ask peers for their INFO.
    Discover,
    /// Full description of a node and its services.
    Info,
    /// Graceful shutdown notice.
    Disconnect,
    /// Periodic liveness signal.
    Heartbeat,
    /// Remote action call (or stream fragment of one).
    Request,
    /// Reply to a REQUEST (or stream fragment of one).
    Response,
    /// Event emission.
    Event,
    /// Round-trip probe.
    Ping,
    /// Reply to a PING.
    Pong,
    /// Gossip digest exchange request.
    GossipRequest,
    /// Gossip digest exchange response.
    GossipResponse,
    /// Stream flow-control acknowledgement.
    StreamAck,
}

impl PacketType {
    /// Every packet type, in topic subscription order.
    pub const ALL: [PacketType; 12] = [
        PacketType::Discover,
        PacketType::Info,
        PacketType::Disconnect,
        PacketType::Heartbeat,
        PacketType::Request,
        PacketType::Response,
        PacketType::Event,
        PacketType::Ping,
        PacketType::Pong,
        PacketType::GossipRequest,
        PacketType::GossipResponse,
        PacketType::StreamAck,
    ];

    /// Wire name used in topic names.
    pub fn as_str(self) -> &'static str {
        match self {
            PacketType::Discover => "DISCOVER",
            PacketType::Info => "INFO",
            PacketType::Disconnect => "DISCONNECT",
            PacketType::Heartbeat => "HEARTBEAT",
            PacketType::Request => "REQ",
            PacketType::Response => "RES",
            PacketType::Event => "EVENT",
            PacketType::Ping => "PING",
            PacketType::Pong => "PONG",
            PacketType::GossipRequest => "GOSSIP_REQ",
            PacketType::GossipResponse => "GOSSIP_RES",
            PacketType::StreamAck => "STREAM_ACK",
        }
    }

    /// Parse a wire name.
    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == name)
    }
}

impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Action as advertised in an INFO packet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionDescriptor {
    /// Fully qualified action name (`service.action`).
    pub name: String,
    /// Optional parameter schema, opaque to the registry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    /// Action-level timeout override in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    /// Action-level strategy override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<StrategyKind>,
    /// Whether the action is only callable locally.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub protected: bool,
}

impl ActionDescriptor {
    /// Create a descriptor with only a name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: None,
            timeout: None,
            strategy: None,
            protected: false,
        }
    }
}

/// Event subscription as advertised in an INFO packet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventDescriptor {
    /// Event name pattern, may contain `*` / `**` wildcards.
    pub name: String,
    /// Consumer group; defaults to the service name when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
}

/// Service as advertised in an INFO packet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceDescriptor {
    /// Service name.
    pub name: String,
    /// Optional version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Name with version prefix.
    #[serde(default)]
    pub full_name: String,
    /// Service settings.
    #[serde(default)]
    pub settings: Meta,
    /// Service metadata.
    #[serde(default)]
    pub metadata: Meta,
    /// Actions keyed by fully qualified name.
    #[serde(default)]
    pub actions: HashMap<String, ActionDescriptor>,
    /// Events keyed by name.
    #[serde(default)]
    pub events: HashMap<String, EventDescriptor>,
}

/// Client library information.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientInfo {
    /// Implementation family.
    #[serde(rename = "type")]
    pub kind: String,
    /// Library version.
    pub version: String,
    /// Language/runtime version.
    pub lang_version: String,
}

impl Default for ClientInfo {
    fn default() -> Self {
        Self {
            kind: "rust".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            lang_version: "stable".to_string(),
        }
    }
}

fn protocol_version() -> String {
    PROTOCOL_VERSION.to_string()
}

fn default_level() -> u32 {
    1
}

/// DISCOVER payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoverPayload {
    /// Protocol version.
    #[serde(default = "protocol_version")]
    pub ver: String,
    /// Sending node.
    pub sender: NodeId,
}

impl DiscoverPayload {
    /// Create a payload for `sender`.
    pub fn new(sender: impl Into<NodeId>) -> Self {
        Self {
            ver: protocol_version(),
            sender: sender.into(),
        }
    }
}

/// INFO payload: full description of a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InfoPayload {
    /// Protocol version.
    #[serde(default = "protocol_version")]
    pub ver: String,
    /// Described node.
    pub sender: NodeId,
    /// Advertised services.
    #[serde(default)]
    pub services: Vec<ServiceDescriptor>,
    /// Node IP addresses.
    #[serde(default)]
    pub ip_list: Vec<String>,
    /// Node hostname.
    #[serde(default)]
    pub hostname: String,
    /// Info version counter.
    pub seq: u64,
    /// Process lifetime identifier.
    #[serde(rename = "instanceID")]
    pub instance_id: String,
    /// Node metadata.
    #[serde(default)]
    pub metadata: Meta,
    /// Client library information.
    #[serde(default)]
    pub client: ClientInfo,
}

/// HEARTBEAT payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    /// Protocol version.
    #[serde(default = "protocol_version")]
    pub ver: String,
    /// Sending node.
    pub sender: NodeId,
    /// Self-reported CPU usage (0..100).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<f64>,
    /// Sender's current info seq.
    #[serde(default)]
    pub seq: u64,
}

impl HeartbeatPayload {
    /// Create a heartbeat payload.
    pub fn new(sender: impl Into<NodeId>, cpu: Option<f64>, seq: u64) -> Self {
        Self {
            ver: protocol_version(),
            sender: sender.into(),
            cpu,
            seq,
        }
    }
}

/// REQUEST payload. Also used for request stream fragments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestPayload {
    /// Protocol version.
    #[serde(default = "protocol_version")]
    pub ver: String,
    /// Calling node.
    pub sender: NodeId,
    /// Request correlation id.
    pub id: String,
    /// Fully qualified action name.
    pub action: String,
    /// Call parameters (null on stream chunks).
    #[serde(default)]
    pub params: Value,
    /// Call metadata; only present on non-stream requests and stream headers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Meta>,
    /// Caller-side timeout in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    /// Call nesting level.
    #[serde(default = "default_level")]
    pub level: u32,
    /// Parent context id.
    #[serde(rename = "parentID", default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    /// Root request id of the call chain.
    #[serde(rename = "requestID", default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    /// Service that issued the call.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caller: Option<String>,
    /// True while the request stream is open.
    #[serde(default)]
    pub stream: bool,
    /// Stream fragment sequence number.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    /// Stream chunk bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk: Option<Vec<u8>>,
    /// Error that terminated the stream on the sender side.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_error: Option<ErrorPayload>,
}

/// RESPONSE payload. Also used for response stream fragments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponsePayload {
    /// Protocol version.
    #[serde(default = "protocol_version")]
    pub ver: String,
    /// Responding node.
    pub sender: NodeId,
    /// Correlation id of the request.
    pub id: String,
    /// Whether the call succeeded.
    pub success: bool,
    /// Result data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Error when `success` is false.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorPayload>,
    /// Response metadata; only on non-stream responses and stream headers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Meta>,
    /// True while the response stream is open.
    #[serde(default)]
    pub stream: bool,
    /// Stream fragment sequence number.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    /// Stream chunk bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk: Option<Vec<u8>>,
}

/// EVENT payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventPayload {
    /// Protocol version.
    #[serde(default = "protocol_version")]
    pub ver: String,
    /// Emitting node.
    pub sender: NodeId,
    /// Event context id.
    pub id: String,
    /// Event name.
    pub event: String,
    /// Event data.
    #[serde(default)]
    pub data: Value,
    /// Target groups; `None` means every group.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub groups: Option<Vec<String>>,
    /// Broadcast or balanced delivery.
    #[serde(default)]
    pub broadcast: bool,
    /// Event metadata.
    #[serde(default)]
    pub meta: Meta,
    /// Nesting level.
    #[serde(default = "default_level")]
    pub level: u32,
    /// Parent context id.
    #[serde(rename = "parentID", default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    /// Root request id.
    #[serde(rename = "requestID", default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

/// DISCONNECT payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisconnectPayload {
    /// Protocol version.
    #[serde(default = "protocol_version")]
    pub ver: String,
    /// Leaving node.
    pub sender: NodeId,
}

impl DisconnectPayload {
    /// Create a payload for `sender`.
    pub fn new(sender: impl Into<NodeId>) -> Self {
        Self {
            ver: protocol_version(),
            sender: sender.into(),
        }
    }
}

/// PING payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PingPayload {
    /// Protocol version.
    #[serde(default = "protocol_version")]
    pub ver: String,
    /// Pinging node.
    pub sender: NodeId,
    /// Sender wall clock in milliseconds since the epoch.
    pub time: u64,
    /// Ping correlation id.
    pub id: String,
}

/// PONG payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PongPayload {
    /// Protocol version.
    #[serde(default = "protocol_version")]
    pub ver: String,
    /// Answering node.
    pub sender: NodeId,
    /// Echo of the ping's `time`.
    pub time: u64,
    /// Echo of the ping's `id`.
    pub id: String,
    /// Answering node's wall clock when the ping arrived.
    pub arrived: u64,
}

/// GOSSIP_REQ payload: the sender's view of node seqs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GossipRequestPayload {
    /// Protocol version.
    #[serde(default = "protocol_version")]
    pub ver: String,
    /// Requesting node.
    pub sender: NodeId,
    /// Online nodes known to the sender, with their seq.
    #[serde(default)]
    pub online: HashMap<NodeId, u64>,
    /// Offline nodes known to the sender, with their seq.
    #[serde(default)]
    pub offline: HashMap<NodeId, u64>,
}

/// GOSSIP_RES payload: fresher information held by the responder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GossipResponsePayload {
    /// Protocol version.
    #[serde(default = "protocol_version")]
    pub ver: String,
    /// Responding node.
    pub sender: NodeId,
    /// INFO payloads fresher than the requester's view.
    #[serde(default)]
    pub online: Vec<InfoPayload>,
    /// Nodes the responder knows offline at a newer seq.
    #[serde(default)]
    pub offline: HashMap<NodeId, u64>,
}

/// STREAM_ACK payload: the receiver consumed every chunk up to `seq`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamAckPayload {
    /// Protocol version.
    #[serde(default = "protocol_version")]
    pub ver: String,
    /// Acknowledging node.
    pub sender: NodeId,
    /// Stream (request) id.
    pub id: String,
    /// Highest consumed chunk seq.
    pub seq: u64,
}

/// Payload union, one variant per [`PacketType`].
#[derive(Debug, Clone, PartialEq)]
pub enum PacketPayload {
    /// DISCOVER.
    Discover(DiscoverPayload),
    /// INFO.
    Info(InfoPayload),
    /// DISCONNECT.
    Disconnect(DisconnectPayload),
    /// HEARTBEAT.
    Heartbeat(HeartbeatPayload),
    /// REQUEST.
    Request(RequestPayload),
    /// RESPONSE.
    Response(ResponsePayload),
    /// EVENT.
    Event(EventPayload),
    /// PING.
    Ping(PingPayload),
    /// PONG.
    Pong(PongPayload),
    /// GOSSIP_REQ.
    GossipRequest(GossipRequestPayload),
    /// GOSSIP_RES.
    GossipResponse(GossipResponsePayload),
    /// STREAM_ACK.
    StreamAck(StreamAckPayload),
}

/// Wire envelope. Constructed fresh per send.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    /// Target node, `None` for broadcast.
    pub target: Option<NodeId>,
    /// Type-specific payload.
    pub payload: PacketPayload,
}

impl Packet {
    /// Packet addressed to a single node.
    pub fn to(target: impl Into<NodeId>, payload: PacketPayload) -> Self {
        Self {
            target: Some(target.into()),
            payload,
        }
    }

    /// Packet addressed to every node.
    pub fn broadcast(payload: PacketPayload) -> Self {
        Self {
            target: None,
            payload,
        }
    }

    /// Discriminant of the payload.
    pub fn packet_type(&self) -> PacketType {
        match &self.payload {
            PacketPayload::Discover(_) => PacketType::Discover,
            PacketPayload::Info(_) => PacketType::Info,
            PacketPayload::Disconnect(_) => PacketType::Disconnect,
            PacketPayload::Heartbeat(_) => PacketType::Heartbeat,
            PacketPayload::Request(_) => PacketType::Request,
            PacketPayload::Response(_) => PacketType::Response,
            PacketPayload::Event(_) => PacketType::Event,
            PacketPayload::Ping(_) => PacketType::Ping,
            PacketPayload::Pong(_) => PacketType::Pong,
            PacketPayload::GossipRequest(_) => PacketType::GossipRequest,
            PacketPayload::GossipResponse(_) => PacketType::GossipResponse,
            PacketPayload::StreamAck(_) => PacketType::StreamAck,
        }
    }

    /// Sending node id.
    pub fn sender(&self) -> &str {
        match &self.payload {
            PacketPayload::Discover(p) => &p.sender,
            PacketPayload::Info(p) => &p.sender,
            PacketPayload::Disconnect(p) => &p.sender,
            PacketPayload::Heartbeat(p) => &p.sender,
            PacketPayload::Request(p) => &p.sender,
            PacketPayload::Response(p) => &p.sender,
            PacketPayload::Event(p) => &p.sender,
            PacketPayload::Ping(p) => &p.sender,
            PacketPayload::Pong(p) => &p.sender,
            PacketPayload::GossipRequest(p) => &p.sender,
            PacketPayload::GossipResponse(p) => &p.sender,
            PacketPayload::StreamAck(p) => &p.sender,
        }
    }

    /// Protocol version carried by the payload.
    pub fn version(&self) -> &str {
        match &self.payload {
            PacketPayload::Discover(p) => &p.ver,
            PacketPayload::Info(p) => &p.ver,
            PacketPayload::Disconnect(p) => &p.ver,
            PacketPayload::Heartbeat(p) => &p.ver,
            PacketPayload::Request(p) => &p.ver,
            PacketPayload::Response(p) => &p.ver,
            PacketPayload::Event(p) => &p.ver,
            PacketPayload::Ping(p) => &p.ver,
            PacketPayload::Pong(p) => &p.ver,
            PacketPayload::GossipRequest(p) => &p.ver,
            PacketPayload::GossipResponse(p) => &p.ver,
            PacketPayload::StreamAck(p) => &p.ver,
        }
    }

    /// Structural validation applied before a packet reaches any catalog.
    ///
    /// Returns a human-readable reason on failure.
    pub fn validate(&self) -> Result<(), String> {
        if self.sender().is_empty() {
            return Err("missing sender".to_string());
        }
        match &self.payload {
            PacketPayload::Info(p) => {
                if p.instance_id.is_empty() {
                    return Err("missing instanceID".to_string());
                }
                for service in &p.services {
                    if service.name.is_empty() {
                        return Err("service without name".to_string());
                    }
                }
                Ok(())
            }
            PacketPayload::Request(p) => {
                if p.id.is_empty() {
                    return Err("missing request id".to_string());
                }
                if p.action.is_empty() {
                    return Err("missing action name".to_string());
                }
                Ok(())
            }
            PacketPayload::Response(p) => {
                if p.id.is_empty() {
                    return Err("missing request id".to_string());
                }
                if !p.success && p.error.is_none() && !p.stream && p.seq.is_none() {
                    return Err("failed response without error".to_string());
                }
                Ok(())
            }
            PacketPayload::Event(p) => {
                if p.event.is_empty() {
                    return Err("missing event name".to_string());
                }
                Ok(())
            }
            PacketPayload::Ping(p) if p.id.is_empty() => Err("missing ping id".to_string()),
            PacketPayload::Pong(p) if p.id.is_empty() => Err("missing pong id".to_string()),
            PacketPayload::StreamAck(p) if p.id.is_empty() => {
                Err("missing stream id".to_string())
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_type_names_round_trip() {
        for kind in PacketType::ALL {
            assert_eq!(PacketType::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(PacketType::parse("NOPE"), None);
    }

    #[test]
    fn test_validate_rejects_missing_sender() {
        let packet = Packet::broadcast(PacketPayload::Discover(DiscoverPayload::new("")));
        assert!(packet.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_failed_response_without_error() {
        let packet = Packet::to(
            "node-a",
            PacketPayload::Response(ResponsePayload {
                ver: PROTOCOL_VERSION.to_string(),
                sender: "node-b".into(),
                id: "r1".into(),
                success: false,
                data: None,
                error: None,
                meta: None,
                stream: false,
                seq: None,
                chunk: None,
            }),
        );
        assert_eq!(
            packet.validate(),
            Err("failed response without error".to_string())
        );
    }
}
