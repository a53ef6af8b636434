//! MQTT 3.1 wire protocol.
//!
//! - `codec` - cursor-based field readers/writers and the remaining-length
//!   varint
//! - `packet` - the fourteen control packets, each carrying its parsed fields
//!   plus the original encoded bytes

pub mod codec;
pub mod packet;

pub use packet::{
    ConnAck, Connect, Disconnect, Packet, PingReq, PingResp, PubAck, PubComp, PubRec, PubRel,
    Publish, SubAck, Subscribe, UnsubAck, Unsubscribe, Will,
};

use thiserror::Error;

/// Codec failures. Parse errors are logged by the channel and absorbed; they
/// never unwind across the selector loop.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("unexpected end of packet")]
    UnexpectedEnd,
    #[error("unknown packet type {0}")]
    UnknownPacketType(u8),
    #[error("malformed remaining length field")]
    MalformedRemainingLength,
    #[error("remaining length {0} exceeds the 268435455 byte maximum")]
    RemainingLengthTooLarge(usize),
    #[error("invalid utf-8 in string field")]
    InvalidString,
    #[error("invalid qos value {0}")]
    InvalidQos(u8),
    #[error("invalid connect return code {0}")]
    InvalidReturnCode(u8),
    #[error("{0:?} packet requires a message id")]
    MissingMessageId(PacketType),
    #[error("declared remaining length {declared} does not match body of {actual} bytes")]
    LengthMismatch { declared: usize, actual: usize },
}

/// Control packet type codes, high nibble of the fixed header byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    Connect = 1,
    ConnAck = 2,
    Publish = 3,
    PubAck = 4,
    PubRec = 5,
    PubRel = 6,
    PubComp = 7,
    Subscribe = 8,
    SubAck = 9,
    Unsubscribe = 10,
    UnsubAck = 11,
    PingReq = 12,
    PingResp = 13,
    Disconnect = 14,
}

impl PacketType {
    pub fn from_nibble(nibble: u8) -> Result<Self, ProtocolError> {
        match nibble {
            1 => Ok(Self::Connect),
            2 => Ok(Self::ConnAck),
            3 => Ok(Self::Publish),
            4 => Ok(Self::PubAck),
            5 => Ok(Self::PubRec),
            6 => Ok(Self::PubRel),
            7 => Ok(Self::PubComp),
            8 => Ok(Self::Subscribe),
            9 => Ok(Self::SubAck),
            10 => Ok(Self::Unsubscribe),
            11 => Ok(Self::UnsubAck),
            12 => Ok(Self::PingReq),
            13 => Ok(Self::PingResp),
            14 => Ok(Self::Disconnect),
            other => Err(ProtocolError::UnknownPacketType(other)),
        }
    }

    pub fn nibble(self) -> u8 {
        self as u8
    }
}

/// Quality of service for message delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum QoS {
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl QoS {
    pub fn from_bits(bits: u8) -> Result<Self, ProtocolError> {
        match bits {
            0 => Ok(Self::AtMostOnce),
            1 => Ok(Self::AtLeastOnce),
            2 => Ok(Self::ExactlyOnce),
            other => Err(ProtocolError::InvalidQos(other)),
        }
    }

    pub fn bits(self) -> u8 {
        self as u8
    }
}

/// ConnAck return codes, MQTT 3.1 §3.2.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ConnectReturnCode {
    Accepted = 0,
    UnacceptableProtocolVersion = 1,
    IdentifierRejected = 2,
    ServerUnavailable = 3,
    BadCredentials = 4,
    NotAuthorized = 5,
}

impl ConnectReturnCode {
    pub fn from_u8(value: u8) -> Result<Self, ProtocolError> {
        match value {
            0 => Ok(Self::Accepted),
            1 => Ok(Self::UnacceptableProtocolVersion),
            2 => Ok(Self::IdentifierRejected),
            3 => Ok(Self::ServerUnavailable),
            4 => Ok(Self::BadCredentials),
            5 => Ok(Self::NotAuthorized),
            other => Err(ProtocolError::InvalidReturnCode(other)),
        }
    }
}
