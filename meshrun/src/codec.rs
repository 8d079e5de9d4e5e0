//! Pluggable packet serialization.
//!
//! The transit never looks at bytes itself: every packet goes through a
//! [`PacketCodec`]. The packet type travels out-of-band (in the topic), so the
//! codec only has to round-trip the payload of one [`PacketType`].
//!
//! # Example
//!
//! ```rust
//! use meshrun::codec::{JsonCodec, PacketCodec};
//! use meshrun::packet::{DisconnectPayload, Packet, PacketPayload, PacketType};
//!
//! let codec = JsonCodec;
//! let packet = Packet::broadcast(PacketPayload::Disconnect(DisconnectPayload::new("node-a")));
//!
//! let bytes = codec.serialize(&packet).unwrap();
//! let decoded = codec.deserialize(&bytes, PacketType::Disconnect).unwrap();
//! assert_eq!(decoded.sender(), "node-a");
//! ```

use std::fmt;

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use crate::packet::{Packet, PacketPayload, PacketType};

/// Error type for codec operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    /// Failed to encode a payload to bytes.
    #[error("encode error for {kind}: {message}")]
    Encode {
        /// Packet type being encoded.
        kind: PacketType,
        /// Underlying error message.
        message: String,
    },
    /// Failed to decode bytes to a payload.
    #[error("decode error for {kind}: {message}")]
    Decode {
        /// Packet type being decoded.
        kind: PacketType,
        /// Underlying error message.
        message: String,
    },
}

/// Packet serialization format.
///
/// Implementations must round-trip every payload type faithfully. The trait is
/// object safe so a broker can hold `Rc<dyn PacketCodec>` chosen at runtime.
pub trait PacketCodec: fmt::Debug {
    /// Encode the payload of `packet`.
    ///
    /// # Errors
    ///
    /// Returns `CodecError::Encode` if serialization fails.
    fn serialize(&self, packet: &Packet) -> Result<Vec<u8>, CodecError>;

    /// Decode bytes received on a topic of type `kind`.
    ///
    /// The returned packet has no target; the caller knows it from the topic.
    ///
    /// # Errors
    ///
    /// Returns `CodecError::Decode` if the bytes are not a valid payload.
    fn deserialize(&self, bytes: &[u8], kind: PacketType) -> Result<Packet, CodecError>;
}

/// JSON codec using serde_json.
///
/// Human-readable, handy for debugging and the default for tests.
#[derive(Clone, Default, Debug, Copy)]
pub struct JsonCodec;

impl JsonCodec {
    fn encode<T: Serialize>(kind: PacketType, payload: &T) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(payload).map_err(|e| CodecError::Encode {
            kind,
            message: e.to_string(),
        })
    }

    fn decode<T: DeserializeOwned>(kind: PacketType, bytes: &[u8]) -> Result<T, CodecError> {
        serde_json::from_slice(bytes).map_err(|e| CodecError::Decode {
            kind,
            message: e.to_string(),
        })
    }
}

impl PacketCodec for JsonCodec {
    fn serialize(&self, packet: &Packet) -> Result<Vec<u8>, CodecError> {
        let kind = packet.packet_type();
        match &packet.payload {
            PacketPayload::Discover(p) => Self::encode(kind, p),
            PacketPayload::Info(p) => Self::encode(kind, p),
            PacketPayload::Disconnect(p) => Self::encode(kind, p),
            PacketPayload::Heartbeat(p) => Self::encode(kind, p),
            PacketPayload::Request(p) => Self::encode(kind, p),
            PacketPayload::Response(p) => Self::encode(kind, p),
            PacketPayload::Event(p) => Self::encode(kind, p),
            PacketPayload::Ping(p) => Self::encode(kind, p),
            PacketPayload::Pong(p) => Self::encode(kind, p),
            PacketPayload::GossipRequest(p) => Self::encode(kind, p),
            PacketPayload::GossipResponse(p) => Self::encode(kind, p),
            PacketPayload::StreamAck(p) => Self::encode(kind, p),
        }
    }

    fn deserialize(&self, bytes: &[u8], kind: PacketType) -> Result<Packet, CodecError> {
        let payload = match kind {
            PacketType::Discover => PacketPayload::Discover(Self::decode(kind, bytes)?),
            PacketType::Info => PacketPayload::Info(Self::decode(kind, bytes)?),
            PacketType::Disconnect => PacketPayload::Disconnect(Self::decode(kind, bytes)?),
            PacketType::Heartbeat => PacketPayload::Heartbeat(Self::decode(kind, bytes)?),
            PacketType::Request => PacketPayload::Request(Self::decode(kind, bytes)?),
            PacketType::Response => PacketPayload::Response(Self::decode(kind, bytes)?),
            PacketType::Event => PacketPayload::Event(Self::decode(kind, bytes)?),
            PacketType::Ping => PacketPayload::Ping(Self::decode(kind, bytes)?),
            PacketType::Pong => PacketPayload::Pong(Self::decode(kind, bytes)?),
            PacketType::GossipRequest => PacketPayload::GossipRequest(Self::decode(kind, bytes)?),
            PacketType::GossipResponse => {
                PacketPayload::GossipResponse(Self::decode(kind, bytes)?)
            }
            PacketType::StreamAck => PacketPayload::StreamAck(Self::decode(kind, bytes)?),
        };
        Ok(Packet {
            target: None,
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{HeartbeatPayload, RequestPayload};

    #[test]
    fn test_heartbeat_wire_shape() {
        let packet = Packet::broadcast(PacketPayload::Heartbeat(HeartbeatPayload::new(
            "node-a",
            Some(12.5),
            3,
        )));
        let bytes = JsonCodec.serialize(&packet).expect("encode");
        let value: serde_json::Value = serde_json::from_slice(&bytes).expect("json");
        assert_eq!(value["sender"], "node-a");
        assert_eq!(value["cpu"], 12.5);
        assert_eq!(value["seq"], 3);
        assert_eq!(value["ver"], crate::packet::PROTOCOL_VERSION);
    }

    #[test]
    fn test_request_decodes_with_defaults() {
        let raw = br#"{"ver":"4","sender":"node-b","id":"r1","action":"math.add","params":{"a":1}}"#;
        let packet = JsonCodec
            .deserialize(raw, PacketType::Request)
            .expect("decode");
        match packet.payload {
            PacketPayload::Request(RequestPayload {
                id,
                action,
                stream,
                level,
                ..
            }) => {
                assert_eq!(id, "r1");
                assert_eq!(action, "math.add");
                assert!(!stream);
                assert_eq!(level, 1);
            }
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[test]
    fn test_garbage_is_decode_error() {
        let err = JsonCodec
            .deserialize(b"not json", PacketType::Info)
            .expect_err("must fail");
        assert!(matches!(
            err,
            CodecError::Decode {
                kind: PacketType::Info,
                ..
            }
        ));
    }
}
