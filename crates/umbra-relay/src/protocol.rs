//! Relay protocol message definitions.
//!
//! Every frame is an [`Envelope`] carrying the sender's protocol version and
//! one [`ProxyMessage`]. The message variant index is the type tag on the wire.
//! Published values travel as an encoded [`ValueMap`].

use bincode::Options;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::address::PeerAddress;
use crate::error::{ProxyError, Result};

/// Upper bound on an encoded frame or value
pub const MAX_MESSAGE_SIZE: u64 = 64 * 1024;

/// Value map key holding the publisher's direct host as raw bytes
pub const VALUE_HOST: &str = "h";
/// Value map key holding the publisher's direct port
pub const VALUE_PORT: &str = "p";
/// Value map key holding the publisher's signature
pub const VALUE_SIGNATURE: &str = "z";
/// Value map key used by raw puts
pub const VALUE_RAW: &str = "v";

/// Keys the relay protocol adds to published values
pub const RESERVED_VALUE_KEYS: [&str; 3] = [VALUE_HOST, VALUE_PORT, VALUE_SIGNATURE];

fn codec() -> impl Options {
    bincode::DefaultOptions::new().with_limit(MAX_MESSAGE_SIZE)
}

/// Wire type tags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// Keepalive
    KeepAlive = 0,
    /// Client asks a relay for service
    AllocRequest = 1,
    /// Relay accepted the client
    AllocOkReply = 2,
    /// Relay refused the client
    AllocFailReply = 3,
    /// Relay checks that a claimed client is reachable
    ProbeRequest = 4,
    /// Client answers a probe
    ProbeReply = 5,
    /// Peer is going away
    Close = 6,
    /// Client submits a DHT operation
    OpRequest = 7,
    /// Relay answers a DHT operation
    OpReply = 8,
}

/// DHT operation kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpType {
    /// Store a value
    Put,
    /// Fetch values
    Get,
    /// Remove a stored value
    Remove,
}

impl OpType {
    /// Numeric operation code
    #[must_use]
    pub const fn code(self) -> u8 {
        match self {
            OpType::Put => 1,
            OpType::Get => 2,
            OpType::Remove => 3,
        }
    }
}

/// Optional per-operation parameters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpOptions {
    /// DHT flags requested by the client
    pub flags: Option<u8>,
    /// GET timeout in seconds
    pub timeout_secs: Option<u64>,
    /// Maximum number of GET results
    pub num_want: Option<u32>,
}

/// Signed part of an allocation request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocPayload {
    /// Client's direct overlay host
    pub source_host: String,
    /// Client's direct overlay port
    pub source_port: u16,
    /// Relay host the client meant to reach
    pub target: String,
    /// Per-attempt identifier echoed by the probe
    pub uid: String,
}

impl AllocPayload {
    /// Encode for signing and verification
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::Codec`] if encoding fails.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(codec().serialize(self)?)
    }
}

/// A DHT operation relayed on behalf of a client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpRequest {
    /// Operation key derived by the client
    pub op_key: Vec<u8>,
    /// Client sequence number echoed in the reply
    pub op_seq: u64,
    /// Optional parameters
    pub op_options: Option<OpOptions>,
    /// Operation kind
    pub op_type: OpType,
    /// Masked value for PUT
    pub op_value: Option<Vec<u8>>,
}

/// Relay protocol messages
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProxyMessage {
    /// Keepalive (no payload)
    KeepAlive,

    /// Client asks a relay for service
    AllocRequest {
        /// Signed payload
        payload: AllocPayload,
        /// Signature over the encoded payload
        sig: Vec<u8>,
        /// Minimum relay version the client accepts
        min_ver: u32,
    },

    /// Relay accepted the client
    AllocOkReply {
        /// Relay instance identifier
        iid: String,
    },

    /// Relay refused the client
    AllocFailReply {
        /// Alternative relays to try
        contacts: Vec<PeerAddress>,
    },

    /// Relay checks that a claimed client is reachable
    ProbeRequest {
        /// Identifier from the allocation request
        uid: String,
        /// Relay host sending the probe
        source_host: String,
    },

    /// Client answers a probe
    ProbeReply,

    /// Peer is going away
    Close,

    /// Client submits a DHT operation
    OpRequest(OpRequest),

    /// Relay answers a DHT operation
    OpReply {
        /// Sequence number from the request
        op_seq: u64,
        /// Masked values for GET, absent for mutations and failed GETs
        op_values: Option<Vec<Vec<u8>>>,
    },
}

impl ProxyMessage {
    /// Get the wire type tag
    #[must_use]
    pub fn message_type(&self) -> MessageType {
        match self {
            ProxyMessage::KeepAlive => MessageType::KeepAlive,
            ProxyMessage::AllocRequest { .. } => MessageType::AllocRequest,
            ProxyMessage::AllocOkReply { .. } => MessageType::AllocOkReply,
            ProxyMessage::AllocFailReply { .. } => MessageType::AllocFailReply,
            ProxyMessage::ProbeRequest { .. } => MessageType::ProbeRequest,
            ProxyMessage::ProbeReply => MessageType::ProbeReply,
            ProxyMessage::Close => MessageType::Close,
            ProxyMessage::OpRequest(_) => MessageType::OpRequest,
            ProxyMessage::OpReply { .. } => MessageType::OpReply,
        }
    }
}

/// One frame on a relay link
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Sender's protocol version
    pub version: u32,
    /// Message body
    pub message: ProxyMessage,
}

impl Envelope {
    /// Wrap a message
    #[must_use]
    pub fn new(version: u32, message: ProxyMessage) -> Self {
        Self { version, message }
    }

    /// Serialize frame to bytes
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::Codec`] if the frame exceeds [`MAX_MESSAGE_SIZE`].
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(codec().serialize(self)?)
    }

    /// Deserialize frame from bytes
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::Codec`] for malformed, oversized or trailing input.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(codec().deserialize(bytes)?)
    }
}

/// A field of a published value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Field {
    /// Integer
    Int(i64),
    /// Raw bytes
    Bytes(Vec<u8>),
    /// Text
    Text(String),
}

impl Field {
    /// Integer content, if any
    #[must_use]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Field::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Byte content, if any
    #[must_use]
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Field::Bytes(v) => Some(v),
            _ => None,
        }
    }

    /// Text content, if any
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Field::Text(v) => Some(v),
            _ => None,
        }
    }
}

/// A published value: named fields in a stable order
pub type ValueMap = BTreeMap<String, Field>;

/// Encode a value map
///
/// # Errors
///
/// Returns [`ProxyError::Codec`] if the value exceeds [`MAX_MESSAGE_SIZE`].
pub fn encode_value(value: &ValueMap) -> Result<Vec<u8>> {
    Ok(codec().serialize(value)?)
}

/// Decode a value map
///
/// # Errors
///
/// Returns [`ProxyError::Codec`] for malformed input.
pub fn decode_value(bytes: &[u8]) -> Result<ValueMap> {
    Ok(codec().deserialize(bytes)?)
}

/// Reject caller values that use keys the protocol reserves
///
/// # Errors
///
/// Returns [`ProxyError::InvalidValue`] if any reserved key is present.
pub fn check_reserved(value: &ValueMap) -> Result<()> {
    if RESERVED_VALUE_KEYS.iter().any(|k| value.contains_key(*k)) {
        return Err(ProxyError::invalid_value("value uses a reserved key"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_request_roundtrip() {
        let msg = ProxyMessage::AllocRequest {
            payload: AllocPayload {
                source_host: "client.umbra".into(),
                source_port: 7000,
                target: "relay.umbra".into(),
                uid: "00ff".into(),
            },
            sig: vec![7u8; 64],
            min_ver: 2,
        };
        let bytes = Envelope::new(2, msg.clone()).to_bytes().unwrap();
        let decoded = Envelope::from_bytes(&bytes).unwrap();

        assert_eq!(decoded.version, 2);
        assert_eq!(decoded.message, msg);
    }

    #[test]
    fn test_op_request_roundtrip() {
        let msg = ProxyMessage::OpRequest(OpRequest {
            op_key: vec![1u8; 32],
            op_seq: 42,
            op_options: Some(OpOptions {
                flags: Some(2),
                timeout_secs: Some(120),
                num_want: None,
            }),
            op_type: OpType::Get,
            op_value: None,
        });
        let decoded = Envelope::from_bytes(&Envelope::new(2, msg.clone()).to_bytes().unwrap()).unwrap();
        assert_eq!(decoded.message, msg);
    }

    #[test]
    fn test_message_type_codes() {
        assert_eq!(ProxyMessage::KeepAlive.message_type() as u8, 0);
        assert_eq!(ProxyMessage::Close.message_type() as u8, 6);
        assert_eq!(
            ProxyMessage::OpReply {
                op_seq: 1,
                op_values: None
            }
            .message_type() as u8,
            8
        );
    }

    #[test]
    fn test_op_type_codes() {
        assert_eq!(OpType::Put.code(), 1);
        assert_eq!(OpType::Get.code(), 2);
        assert_eq!(OpType::Remove.code(), 3);
    }

    #[test]
    fn test_from_bytes_rejects_garbage() {
        assert!(Envelope::from_bytes(&[]).is_err());
        assert!(Envelope::from_bytes(&[0xFF; 16]).is_err());
    }

    #[test]
    fn test_from_bytes_rejects_trailing_bytes() {
        let mut bytes = Envelope::new(2, ProxyMessage::ProbeReply).to_bytes().unwrap();
        bytes.push(0);
        assert!(Envelope::from_bytes(&bytes).is_err());
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let msg = ProxyMessage::OpReply {
            op_seq: 1,
            op_values: Some(vec![vec![0u8; MAX_MESSAGE_SIZE as usize]]),
        };
        assert!(Envelope::new(2, msg).to_bytes().is_err());
    }

    #[test]
    fn test_value_roundtrip_and_order() {
        let mut value = ValueMap::new();
        value.insert("s".into(), Field::Int(1));
        value.insert("c".into(), Field::Int(0));
        value.insert("x".into(), Field::Bytes(vec![1, 2, 3]));

        let bytes = encode_value(&value).unwrap();
        assert_eq!(decode_value(&bytes).unwrap(), value);

        let mut reordered = ValueMap::new();
        reordered.insert("x".into(), Field::Bytes(vec![1, 2, 3]));
        reordered.insert("c".into(), Field::Int(0));
        reordered.insert("s".into(), Field::Int(1));
        assert_eq!(encode_value(&reordered).unwrap(), bytes);
    }

    #[test]
    fn test_check_reserved() {
        let mut value = ValueMap::new();
        value.insert("s".into(), Field::Int(1));
        assert!(check_reserved(&value).is_ok());

        for key in RESERVED_VALUE_KEYS {
            let mut bad = value.clone();
            bad.insert(key.into(), Field::Int(0));
            assert!(matches!(
                check_reserved(&bad),
                Err(ProxyError::InvalidValue(_))
            ));
        }
    }

    #[test]
    fn test_field_accessors() {
        assert_eq!(Field::Int(5).as_int(), Some(5));
        assert_eq!(Field::Int(5).as_text(), None);
        assert_eq!(Field::Text("a".into()).as_text(), Some("a"));
        assert_eq!(Field::Bytes(vec![1]).as_bytes(), Some(&[1u8][..]));
    }
}
