//! The fourteen MQTT 3.1 control packets.
//!
//! Every packet value owns its encoded bytes alongside its parsed fields, so
//! retransmission is a cursor rewind on the original buffer rather than a
//! re-encode, and a received frame can be echoed byte-identical.
//! Constructors encode; [`Packet::decode`] parses a complete frame as
//! assembled by the channel's framing reader (fixed header included).
//!
//! PubRel, Subscribe and Unsubscribe carry QoS 1 in their fixed-header flags
//! per MQTT 3.1, which is what makes them acknowledgeable.

use bytes::Bytes;

use super::codec;
use super::{ConnectReturnCode, PacketType, ProtocolError, QoS};

const DUP_FLAG: u8 = 0x08;
const RETAIN_FLAG: u8 = 0x01;

/// MQTT 3.1 protocol name carried in the Connect variable header.
const PROTOCOL_NAME: &str = "MQIsdp";
/// MQTT 3.1 protocol level.
pub const PROTOCOL_VERSION: u8 = 3;

fn frame(header: u8, body: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    let mut buf = Vec::with_capacity(2 + body.len());
    buf.push(header);
    codec::write_remaining_length(&mut buf, body.len())?;
    buf.extend_from_slice(body);
    Ok(buf)
}

fn header_byte(packet_type: PacketType, flags: u8) -> u8 {
    (packet_type.nibble() << 4) | (flags & 0x0F)
}

/// A will message announced in Connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Will {
    pub topic: String,
    pub message: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
}

/// CONNECT: client session request.
#[derive(Debug, Clone)]
pub struct Connect {
    pub protocol_version: u8,
    pub client_id: String,
    pub clean_session: bool,
    pub keep_alive_secs: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub will: Option<Will>,
    buf: Vec<u8>,
}

impl Connect {
    pub fn new(
        client_id: &str,
        clean_session: bool,
        keep_alive_secs: u16,
        username: Option<&str>,
        password: Option<&str>,
        will: Option<Will>,
    ) -> Result<Self, ProtocolError> {
        let mut flags = 0u8;
        if clean_session {
            flags |= 0x02;
        }
        if let Some(will) = &will {
            flags |= 0x04 | (will.qos.bits() << 3);
            if will.retain {
                flags |= 0x20;
            }
        }
        if username.is_some() {
            flags |= 0x80;
        }
        if password.is_some() {
            flags |= 0x40;
        }

        let mut body = Vec::new();
        codec::write_string(&mut body, PROTOCOL_NAME);
        body.push(PROTOCOL_VERSION);
        body.push(flags);
        codec::write_u16(&mut body, keep_alive_secs);
        codec::write_string(&mut body, client_id);
        if let Some(will) = &will {
            codec::write_string(&mut body, &will.topic);
            codec::write_bytes(&mut body, &will.message);
        }
        if let Some(username) = username {
            codec::write_string(&mut body, username);
        }
        if let Some(password) = password {
            codec::write_string(&mut body, password);
        }

        Ok(Self {
            protocol_version: PROTOCOL_VERSION,
            client_id: client_id.to_string(),
            clean_session,
            keep_alive_secs,
            username: username.map(str::to_string),
            password: password.map(str::to_string),
            will,
            buf: frame(header_byte(PacketType::Connect, 0), &body)?,
        })
    }

    fn decode(buf: Vec<u8>, body_start: usize) -> Result<Self, ProtocolError> {
        let mut cursor = body_start;
        let _protocol_name = codec::read_string(&buf, &mut cursor)?;
        let protocol_version = codec::read_u8(&buf, &mut cursor)?;
        let flags = codec::read_u8(&buf, &mut cursor)?;
        let keep_alive_secs = codec::read_u16(&buf, &mut cursor)?;
        let client_id = codec::read_string(&buf, &mut cursor)?;

        let will = if flags & 0x04 != 0 {
            let qos = QoS::from_bits((flags >> 3) & 0x03)?;
            let topic = codec::read_string(&buf, &mut cursor)?;
            let message = codec::read_bytes(&buf, &mut cursor)?;
            Some(Will {
                topic,
                message,
                qos,
                retain: flags & 0x20 != 0,
            })
        } else {
            None
        };
        let username = if flags & 0x80 != 0 {
            Some(codec::read_string(&buf, &mut cursor)?)
        } else {
            None
        };
        let password = if flags & 0x40 != 0 {
            Some(codec::read_string(&buf, &mut cursor)?)
        } else {
            None
        };

        Ok(Self {
            protocol_version,
            client_id,
            clean_session: flags & 0x02 != 0,
            keep_alive_secs,
            username,
            password,
            will,
            buf,
        })
    }
}

/// CONNACK: broker response to Connect.
#[derive(Debug, Clone)]
pub struct ConnAck {
    pub return_code: ConnectReturnCode,
    buf: Vec<u8>,
}

impl ConnAck {
    pub fn new(return_code: ConnectReturnCode) -> Self {
        let body = [0u8, return_code as u8];
        Self {
            return_code,
            // two-byte body never overflows the length field
            buf: frame(header_byte(PacketType::ConnAck, 0), &body).expect("connack frame"),
        }
    }

    fn decode(buf: Vec<u8>, body_start: usize) -> Result<Self, ProtocolError> {
        let mut cursor = body_start;
        let _reserved = codec::read_u8(&buf, &mut cursor)?;
        let return_code = ConnectReturnCode::from_u8(codec::read_u8(&buf, &mut cursor)?)?;
        Ok(Self { return_code, buf })
    }
}

/// PUBLISH: application message transfer in either direction.
#[derive(Debug, Clone)]
pub struct Publish {
    pub topic: String,
    pub message_id: Option<u16>,
    pub payload: Bytes,
    pub qos: QoS,
    pub dup: bool,
    pub retain: bool,
    buf: Vec<u8>,
}

impl Publish {
    pub fn new(
        topic: &str,
        qos: QoS,
        message_id: Option<u16>,
        payload: Bytes,
        retain: bool,
    ) -> Result<Self, ProtocolError> {
        if qos != QoS::AtMostOnce && message_id.is_none() {
            return Err(ProtocolError::MissingMessageId(PacketType::Publish));
        }
        let mut body = Vec::with_capacity(2 + topic.len() + 2 + payload.len());
        codec::write_string(&mut body, topic);
        if let Some(id) = message_id.filter(|_| qos != QoS::AtMostOnce) {
            codec::write_u16(&mut body, id);
        }
        body.extend_from_slice(&payload);

        let flags = (qos.bits() << 1) | if retain { RETAIN_FLAG } else { 0 };
        Ok(Self {
            topic: topic.to_string(),
            message_id: if qos == QoS::AtMostOnce { None } else { message_id },
            payload,
            qos,
            dup: false,
            retain,
            buf: frame(header_byte(PacketType::Publish, flags), &body)?,
        })
    }

    fn decode(buf: Vec<u8>, body_start: usize, flags: u8) -> Result<Self, ProtocolError> {
        let qos = QoS::from_bits((flags >> 1) & 0x03)?;
        let mut cursor = body_start;
        let topic = codec::read_string(&buf, &mut cursor)?;
        let message_id = if qos == QoS::AtMostOnce {
            None
        } else {
            Some(codec::read_u16(&buf, &mut cursor)?)
        };
        let payload = Bytes::copy_from_slice(&buf[cursor..]);
        Ok(Self {
            topic,
            message_id,
            payload,
            qos,
            dup: flags & DUP_FLAG != 0,
            retain: flags & RETAIN_FLAG != 0,
            buf,
        })
    }
}

macro_rules! message_id_packet {
    ($(#[$doc:meta])* $name:ident, $packet_type:expr, $flags:expr) => {
        $(#[$doc])*
        #[derive(Debug, Clone)]
        pub struct $name {
            pub message_id: u16,
            buf: Vec<u8>,
        }

        impl $name {
            pub fn new(message_id: u16) -> Self {
                let body = message_id.to_be_bytes();
                Self {
                    message_id,
                    buf: frame(header_byte($packet_type, $flags), &body)
                        .expect("two-byte ack frame"),
                }
            }

            fn decode(buf: Vec<u8>, body_start: usize) -> Result<Self, ProtocolError> {
                let mut cursor = body_start;
                let message_id = codec::read_u16(&buf, &mut cursor)?;
                Ok(Self { message_id, buf })
            }
        }
    };
}

message_id_packet!(
    /// PUBACK: acknowledges a QoS 1 Publish.
    PubAck,
    PacketType::PubAck,
    0
);
message_id_packet!(
    /// PUBREC: first half of the QoS 2 handshake.
    PubRec,
    PacketType::PubRec,
    0
);
message_id_packet!(
    /// PUBREL: second half of the QoS 2 handshake; itself acknowledgeable.
    PubRel,
    PacketType::PubRel,
    0x02
);
message_id_packet!(
    /// PUBCOMP: final half of the QoS 2 handshake.
    PubComp,
    PacketType::PubComp,
    0
);
message_id_packet!(
    /// UNSUBACK: acknowledges an Unsubscribe.
    UnsubAck,
    PacketType::UnsubAck,
    0
);

/// SUBSCRIBE: topic subscription request.
#[derive(Debug, Clone)]
pub struct Subscribe {
    pub message_id: u16,
    pub topics: Vec<(String, QoS)>,
    buf: Vec<u8>,
}

impl Subscribe {
    pub fn new(message_id: u16, topics: &[(&str, QoS)]) -> Result<Self, ProtocolError> {
        let mut body = Vec::new();
        codec::write_u16(&mut body, message_id);
        for (topic, qos) in topics {
            codec::write_string(&mut body, topic);
            body.push(qos.bits());
        }
        Ok(Self {
            message_id,
            topics: topics
                .iter()
                .map(|(topic, qos)| (topic.to_string(), *qos))
                .collect(),
            buf: frame(header_byte(PacketType::Subscribe, 0x02), &body)?,
        })
    }

    fn decode(buf: Vec<u8>, body_start: usize) -> Result<Self, ProtocolError> {
        let mut cursor = body_start;
        let message_id = codec::read_u16(&buf, &mut cursor)?;
        let mut topics = Vec::new();
        while cursor < buf.len() {
            let topic = codec::read_string(&buf, &mut cursor)?;
            let qos = QoS::from_bits(codec::read_u8(&buf, &mut cursor)? & 0x03)?;
            topics.push((topic, qos));
        }
        Ok(Self {
            message_id,
            topics,
            buf,
        })
    }
}

/// SUBACK: granted QoS per requested subscription, in request order.
#[derive(Debug, Clone)]
pub struct SubAck {
    pub message_id: u16,
    pub granted: Vec<QoS>,
    buf: Vec<u8>,
}

impl SubAck {
    pub fn new(message_id: u16, granted: Vec<QoS>) -> Result<Self, ProtocolError> {
        let mut body = Vec::with_capacity(2 + granted.len());
        codec::write_u16(&mut body, message_id);
        body.extend(granted.iter().map(|qos| qos.bits()));
        Ok(Self {
            message_id,
            granted,
            buf: frame(header_byte(PacketType::SubAck, 0), &body)?,
        })
    }

    fn decode(buf: Vec<u8>, body_start: usize) -> Result<Self, ProtocolError> {
        let mut cursor = body_start;
        let message_id = codec::read_u16(&buf, &mut cursor)?;
        let granted = buf[cursor..]
            .iter()
            .map(|byte| QoS::from_bits(byte & 0x03))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            message_id,
            granted,
            buf,
        })
    }
}

/// UNSUBSCRIBE: topic subscription removal.
#[derive(Debug, Clone)]
pub struct Unsubscribe {
    pub message_id: u16,
    pub topics: Vec<String>,
    buf: Vec<u8>,
}

impl Unsubscribe {
    pub fn new(message_id: u16, topics: &[&str]) -> Result<Self, ProtocolError> {
        let mut body = Vec::new();
        codec::write_u16(&mut body, message_id);
        for topic in topics {
            codec::write_string(&mut body, topic);
        }
        Ok(Self {
            message_id,
            topics: topics.iter().map(|t| t.to_string()).collect(),
            buf: frame(header_byte(PacketType::Unsubscribe, 0x02), &body)?,
        })
    }

    fn decode(buf: Vec<u8>, body_start: usize) -> Result<Self, ProtocolError> {
        let mut cursor = body_start;
        let message_id = codec::read_u16(&buf, &mut cursor)?;
        let mut topics = Vec::new();
        while cursor < buf.len() {
            topics.push(codec::read_string(&buf, &mut cursor)?);
        }
        Ok(Self {
            message_id,
            topics,
            buf,
        })
    }
}

macro_rules! empty_packet {
    ($(#[$doc:meta])* $name:ident, $packet_type:expr) => {
        $(#[$doc])*
        #[derive(Debug, Clone)]
        pub struct $name {
            buf: Vec<u8>,
        }

        impl $name {
            pub fn new() -> Self {
                Self {
                    buf: vec![header_byte($packet_type, 0), 0x00],
                }
            }

            fn decode(buf: Vec<u8>) -> Self {
                Self { buf }
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }
    };
}

empty_packet!(
    /// PINGREQ: keep-alive probe.
    PingReq,
    PacketType::PingReq
);
empty_packet!(
    /// PINGRESP: keep-alive answer.
    PingResp,
    PacketType::PingResp
);
empty_packet!(
    /// DISCONNECT: clean session end.
    Disconnect,
    PacketType::Disconnect
);

/// Any MQTT 3.1 control packet.
#[derive(Debug, Clone)]
pub enum Packet {
    Connect(Connect),
    ConnAck(ConnAck),
    Publish(Publish),
    PubAck(PubAck),
    PubRec(PubRec),
    PubRel(PubRel),
    PubComp(PubComp),
    Subscribe(Subscribe),
    SubAck(SubAck),
    Unsubscribe(Unsubscribe),
    UnsubAck(UnsubAck),
    PingReq(PingReq),
    PingResp(PingResp),
    Disconnect(Disconnect),
}

impl Packet {
    /// Parse one complete frame, fixed header included, taking ownership of
    /// the buffer. The declared remaining length must match the body.
    pub fn decode(buf: Vec<u8>) -> Result<Self, ProtocolError> {
        let mut cursor = 0usize;
        let header = codec::read_u8(&buf, &mut cursor)?;
        let packet_type = PacketType::from_nibble(header >> 4)?;
        let flags = header & 0x0F;
        let declared = codec::read_remaining_length(&buf, &mut cursor)?;
        let actual = buf.len() - cursor;
        if declared != actual {
            return Err(ProtocolError::LengthMismatch { declared, actual });
        }

        Ok(match packet_type {
            PacketType::Connect => Self::Connect(Connect::decode(buf, cursor)?),
            PacketType::ConnAck => Self::ConnAck(ConnAck::decode(buf, cursor)?),
            PacketType::Publish => Self::Publish(Publish::decode(buf, cursor, flags)?),
            PacketType::PubAck => Self::PubAck(PubAck::decode(buf, cursor)?),
            PacketType::PubRec => Self::PubRec(PubRec::decode(buf, cursor)?),
            PacketType::PubRel => Self::PubRel(PubRel::decode(buf, cursor)?),
            PacketType::PubComp => Self::PubComp(PubComp::decode(buf, cursor)?),
            PacketType::Subscribe => Self::Subscribe(Subscribe::decode(buf, cursor)?),
            PacketType::SubAck => Self::SubAck(SubAck::decode(buf, cursor)?),
            PacketType::Unsubscribe => Self::Unsubscribe(Unsubscribe::decode(buf, cursor)?),
            PacketType::UnsubAck => Self::UnsubAck(UnsubAck::decode(buf, cursor)?),
            PacketType::PingReq => Self::PingReq(PingReq::decode(buf)),
            PacketType::PingResp => Self::PingResp(PingResp::decode(buf)),
            PacketType::Disconnect => Self::Disconnect(Disconnect::decode(buf)),
        })
    }

    pub fn packet_type(&self) -> PacketType {
        match self {
            Self::Connect(_) => PacketType::Connect,
            Self::ConnAck(_) => PacketType::ConnAck,
            Self::Publish(_) => PacketType::Publish,
            Self::PubAck(_) => PacketType::PubAck,
            Self::PubRec(_) => PacketType::PubRec,
            Self::PubRel(_) => PacketType::PubRel,
            Self::PubComp(_) => PacketType::PubComp,
            Self::Subscribe(_) => PacketType::Subscribe,
            Self::SubAck(_) => PacketType::SubAck,
            Self::Unsubscribe(_) => PacketType::Unsubscribe,
            Self::UnsubAck(_) => PacketType::UnsubAck,
            Self::PingReq(_) => PacketType::PingReq,
            Self::PingResp(_) => PacketType::PingResp,
            Self::Disconnect(_) => PacketType::Disconnect,
        }
    }

    /// The encoded frame, byte-identical to what was or will be on the wire.
    pub fn bytes(&self) -> &[u8] {
        self.buf()
    }

    fn buf(&self) -> &Vec<u8> {
        match self {
            Self::Connect(p) => &p.buf,
            Self::ConnAck(p) => &p.buf,
            Self::Publish(p) => &p.buf,
            Self::PubAck(p) => &p.buf,
            Self::PubRec(p) => &p.buf,
            Self::PubRel(p) => &p.buf,
            Self::PubComp(p) => &p.buf,
            Self::Subscribe(p) => &p.buf,
            Self::SubAck(p) => &p.buf,
            Self::Unsubscribe(p) => &p.buf,
            Self::UnsubAck(p) => &p.buf,
            Self::PingReq(p) => &p.buf,
            Self::PingResp(p) => &p.buf,
            Self::Disconnect(p) => &p.buf,
        }
    }

    fn buf_mut(&mut self) -> &mut Vec<u8> {
        match self {
            Self::Connect(p) => &mut p.buf,
            Self::ConnAck(p) => &mut p.buf,
            Self::Publish(p) => &mut p.buf,
            Self::PubAck(p) => &mut p.buf,
            Self::PubRec(p) => &mut p.buf,
            Self::PubRel(p) => &mut p.buf,
            Self::PubComp(p) => &mut p.buf,
            Self::Subscribe(p) => &mut p.buf,
            Self::SubAck(p) => &mut p.buf,
            Self::Unsubscribe(p) => &mut p.buf,
            Self::UnsubAck(p) => &mut p.buf,
            Self::PingReq(p) => &mut p.buf,
            Self::PingResp(p) => &mut p.buf,
            Self::Disconnect(p) => &mut p.buf,
        }
    }

    /// The message id identifying this packet within the sender's session,
    /// for the variants that carry one.
    pub fn message_id(&self) -> Option<u16> {
        match self {
            Self::Publish(p) => p.message_id,
            Self::PubAck(p) => Some(p.message_id),
            Self::PubRec(p) => Some(p.message_id),
            Self::PubRel(p) => Some(p.message_id),
            Self::PubComp(p) => Some(p.message_id),
            Self::Subscribe(p) => Some(p.message_id),
            Self::SubAck(p) => Some(p.message_id),
            Self::Unsubscribe(p) => Some(p.message_id),
            Self::UnsubAck(p) => Some(p.message_id),
            _ => None,
        }
    }

    /// For packets whose protocol requires an acknowledgement (Publish at
    /// QoS 1 or 2, Subscribe, Unsubscribe, PubRel), the id their ack will
    /// carry.
    pub fn ack_id(&self) -> Option<u16> {
        match self {
            Self::Publish(p) if p.qos != QoS::AtMostOnce => p.message_id,
            Self::Subscribe(p) => Some(p.message_id),
            Self::Unsubscribe(p) => Some(p.message_id),
            Self::PubRel(p) => Some(p.message_id),
            _ => None,
        }
    }

    pub fn is_ackable(&self) -> bool {
        self.ack_id().is_some()
    }

    /// The duplicate bit of the fixed header.
    pub fn is_duplicate(&self) -> bool {
        self.buf()[0] & DUP_FLAG != 0
    }

    /// Flag this transmission as a retransmission. Patches the encoded
    /// buffer so the resent bytes carry the bit.
    pub fn set_duplicate(&mut self) {
        self.buf_mut()[0] |= DUP_FLAG;
        if let Self::Publish(p) = self {
            p.dup = true;
        }
    }
}

macro_rules! packet_from {
    ($($variant:ident),+) => {
        $(impl From<$variant> for Packet {
            fn from(packet: $variant) -> Self {
                Self::$variant(packet)
            }
        })+
    };
}

packet_from!(
    Connect,
    ConnAck,
    Publish,
    PubAck,
    PubRec,
    PubRel,
    PubComp,
    Subscribe,
    SubAck,
    Unsubscribe,
    UnsubAck,
    PingReq,
    PingResp,
    Disconnect
);
