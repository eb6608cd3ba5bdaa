//! BGP-4 messages as they travel on the wire (RFC 4271)
//!
//! Only the subset needed for IPv4 unicast peering is modelled; unknown
//! capabilities and path attributes are kept as raw bytes.

pub mod notification;
mod open;
mod update;

use std::convert::TryFrom;
use std::error;
use std::fmt;

use byteorder::{NetworkEndian, ReadBytesExt};
use bytes::{BufMut, BytesMut};

pub use notification::Notification;
pub use open::{Capability, Open};
pub use update::{prefix_len, Origin, PathAttribute, Update};

pub const BGP_MARKER: [u8; 16] = [0xff; 16];
pub const BGP_VERSION: u8 = 4;
pub const HEADER_LEN: usize = 19;
pub const MAX_MESSAGE_LEN: usize = 4096;
/// RFC 6793 [4.2.3.9]
pub const AS_TRANS: u16 = 23456;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MessageType {
    Open = 1,
    Update = 2,
    Notification = 3,
    KeepAlive = 4,
}

impl MessageType {
    fn min_length(self) -> usize {
        match self {
            MessageType::Open => 29,
            MessageType::Update => 23,
            MessageType::Notification => 21,
            MessageType::KeepAlive => HEADER_LEN,
        }
    }
}

impl TryFrom<u8> for MessageType {
    type Error = MessageError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(MessageType::Open),
            2 => Ok(MessageType::Update),
            3 => Ok(MessageType::Notification),
            4 => Ok(MessageType::KeepAlive),
            _ => Err(MessageError::BadType(value)),
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let word = match self {
            MessageType::Open => "OPEN",
            MessageType::Update => "UPDATE",
            MessageType::Notification => "NOTIFICATION",
            MessageType::KeepAlive => "KEEPALIVE",
        };
        write!(f, "{}", word)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Open(Open),
    Update(Update),
    Notification(Notification),
    KeepAlive,
}

impl Message {
    pub fn kind(&self) -> MessageType {
        match self {
            Message::Open(_) => MessageType::Open,
            Message::Update(_) => MessageType::Update,
            Message::Notification(_) => MessageType::Notification,
            Message::KeepAlive => MessageType::KeepAlive,
        }
    }

    /// Append the full message (header included) to `buf`
    ///
    /// `four_octet_asn` selects the AS_PATH encoding for UPDATEs and is
    /// ignored by the other message types. A message longer than
    /// `MAX_MESSAGE_LEN` is an error and leaves `buf` unchanged.
    pub fn encode(&self, buf: &mut BytesMut, four_octet_asn: bool) -> Result<(), MessageError> {
        let start = buf.len();
        buf.put_slice(&BGP_MARKER);
        // Length is patched once the body is written
        buf.put_u16(0);
        buf.put_u8(self.kind() as u8);
        match self {
            Message::Open(open) => open.encode(buf),
            Message::Update(update) => update.encode(buf, four_octet_asn),
            Message::Notification(notification) => notification.encode(buf),
            Message::KeepAlive => (),
        }
        let length = buf.len() - start;
        if length > MAX_MESSAGE_LEN {
            buf.truncate(start);
            return Err(MessageError::TooLong(length));
        }
        buf[start + 16..start + 18].copy_from_slice(&(length as u16).to_be_bytes());
        Ok(())
    }

    /// Decode a message body that was framed by `header`
    pub fn decode(header: &Header, body: &[u8], four_octet_asn: bool) -> Result<Self, MessageError> {
        let message = match header.kind {
            MessageType::Open => Message::Open(Open::decode(body)?),
            MessageType::Update => Message::Update(Update::decode(body, four_octet_asn)?),
            MessageType::Notification => Message::Notification(Notification::decode(body)?),
            MessageType::KeepAlive => Message::KeepAlive,
        };
        Ok(message)
    }
}

/// Validated fixed-size message header
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct Header {
    pub length: u16,
    pub kind: MessageType,
}

impl Header {
    /// Parse and validate the first `HEADER_LEN` bytes of a message
    pub fn parse(buf: &[u8]) -> Result<Self, MessageError> {
        if buf.len() < HEADER_LEN {
            return Err(MessageError::Truncated("header"));
        }
        if buf[..16] != BGP_MARKER {
            return Err(MessageError::BadMarker);
        }
        let mut rest = &buf[16..HEADER_LEN];
        let length = rest
            .read_u16::<NetworkEndian>()
            .map_err(|_| MessageError::Truncated("length"))?;
        let kind = MessageType::try_from(rest.read_u8().map_err(|_| MessageError::Truncated("type"))?)?;
        let len = length as usize;
        if len > MAX_MESSAGE_LEN || len < kind.min_length() {
            return Err(MessageError::BadLength(length));
        }
        if kind == MessageType::KeepAlive && len != HEADER_LEN {
            return Err(MessageError::BadLength(length));
        }
        Ok(Header { length, kind })
    }

    pub fn body_len(&self) -> usize {
        self.length as usize - HEADER_LEN
    }
}

/// A message that could not be decoded
///
/// Every variant maps onto the NOTIFICATION that should be sent
/// before the connection is closed.
#[derive(Debug, Clone, PartialEq)]
pub enum MessageError {
    /// Marker was not all ones
    BadMarker,
    /// Length outside of the allowed range for the message type. [length]
    BadLength(u16),
    /// Unknown message type. [type]
    BadType(u8),
    /// Payload ended before the named field could be read. [field]
    Truncated(&'static str),
    /// OPEN with a version other than 4. [version]
    UnsupportedVersion(u8),
    /// OPEN with a hold time of 1 or 2 seconds. [hold_time]
    UnacceptableHoldTime(u16),
    /// OPEN with a zero BGP identifier
    BadIdentifier,
    /// Attribute section could not be parsed. [reason]
    MalformedAttributes(String),
    /// UPDATE announcing prefixes without a mandatory attribute. [type code]
    MissingAttribute(u8),
    /// Prefix length greater than 32. [length]
    InvalidPrefix(u8),
    /// Outgoing message longer than `MAX_MESSAGE_LEN`. [length]
    TooLong(usize),
}

impl MessageError {
    /// NOTIFICATION (code, subcode) for this error, per RFC 4271 [6]
    pub fn notification(&self) -> Notification {
        use MessageError::*;
        let (code, subcode) = match self {
            BadMarker => (1, 1),
            BadLength(_) | TooLong(_) => (1, 2),
            BadType(_) => (1, 3),
            Truncated(_) => (1, 2),
            UnsupportedVersion(_) => (2, 1),
            BadIdentifier => (2, 3),
            UnacceptableHoldTime(_) => (2, 6),
            MalformedAttributes(_) => (3, 1),
            MissingAttribute(_) => (3, 3),
            InvalidPrefix(_) => (3, 10),
        };
        let mut notification = Notification::new(code, subcode);
        match self {
            BadLength(length) => notification.data = length.to_be_bytes().to_vec(),
            BadType(kind) => notification.data = vec![*kind],
            UnsupportedVersion(_) => notification.data = u16::from(BGP_VERSION).to_be_bytes().to_vec(),
            MissingAttribute(code) => notification.data = vec![*code],
            _ => (),
        }
        notification
    }
}

impl fmt::Display for MessageError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("Malformed message: ")?;
        use MessageError::*;
        match self {
            BadMarker => write!(f, "connection not synchronized (bad marker)"),
            BadLength(length) => write!(f, "bad message length {}", length),
            BadType(kind) => write!(f, "bad message type {}", kind),
            Truncated(field) => write!(f, "truncated while reading {}", field),
            UnsupportedVersion(version) => write!(f, "unsupported version {}", version),
            UnacceptableHoldTime(hold) => write!(f, "unacceptable hold time {}", hold),
            BadIdentifier => write!(f, "bad BGP identifier"),
            MalformedAttributes(reason) => write!(f, "malformed attribute list [{}]", reason),
            MissingAttribute(code) => write!(f, "missing well-known attribute {}", code),
            InvalidPrefix(length) => write!(f, "invalid prefix length {}", length),
            TooLong(length) => write!(f, "{} bytes exceeds the maximum message length", length),
        }
    }
}

impl error::Error for MessageError {}
