//! Protocol error types.

use std::fmt;

use super::ReasonCode;

/// Faults raised while decoding a packet off the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Not enough bytes buffered yet
    InsufficientData,
    InvalidPacketType(u8),
    /// Variable byte integer ran past four bytes
    InvalidRemainingLength,
    InvalidProtocolName,
    InvalidProtocolVersion(u8),
    InvalidQoS(u8),
    InvalidUtf8,
    InvalidPropertyId(u8),
    /// Property appeared in a packet type that does not allow it
    PropertyNotPermitted(u8),
    /// Non-repeatable property appeared twice
    DuplicateProperty(u8),
    InvalidFlags,
    MalformedPacket(&'static str),
    PacketTooLarge,
    InvalidReasonCode(u8),
    InvalidSubscriptionOptions,
}

impl DecodeError {
    /// Reason code reported to the peer for this fault.
    pub fn reason_code(&self) -> ReasonCode {
        match self {
            DecodeError::InvalidProtocolVersion(_) => ReasonCode::UnsupportedProtocolVersion,
            DecodeError::PacketTooLarge => ReasonCode::PacketTooLarge,
            DecodeError::InvalidFlags | DecodeError::InvalidPacketType(_) => {
                ReasonCode::ProtocolError
            }
            _ => ReasonCode::MalformedPacket,
        }
    }
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InsufficientData => write!(f, "insufficient data in buffer"),
            Self::InvalidPacketType(t) => write!(f, "invalid packet type: {}", t),
            Self::InvalidRemainingLength => write!(f, "invalid remaining length encoding"),
            Self::InvalidProtocolName => write!(f, "invalid protocol name"),
            Self::InvalidProtocolVersion(v) => write!(f, "invalid protocol version: {}", v),
            Self::InvalidQoS(q) => write!(f, "invalid QoS value: {}", q),
            Self::InvalidUtf8 => write!(f, "invalid UTF-8 string"),
            Self::InvalidPropertyId(id) => write!(f, "invalid property identifier: {:#04x}", id),
            Self::PropertyNotPermitted(id) => {
                write!(f, "property {:#04x} not permitted in this packet", id)
            }
            Self::DuplicateProperty(id) => write!(f, "duplicate property: {:#04x}", id),
            Self::InvalidFlags => write!(f, "invalid packet flags"),
            Self::MalformedPacket(msg) => write!(f, "malformed packet: {}", msg),
            Self::PacketTooLarge => write!(f, "packet too large"),
            Self::InvalidReasonCode(r) => write!(f, "invalid reason code: {:#04x}", r),
            Self::InvalidSubscriptionOptions => write!(f, "invalid subscription options"),
        }
    }
}

impl std::error::Error for DecodeError {}

/// Faults raised while encoding a packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodeError {
    PacketTooLarge,
    StringTooLong,
    /// Packet requires v5.0 but the connection negotiated v3.1.1
    VersionMismatch,
}

impl fmt::Display for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PacketTooLarge => write!(f, "packet too large"),
            Self::StringTooLong => write!(f, "string too long"),
            Self::VersionMismatch => write!(f, "packet not valid for negotiated version"),
        }
    }
}

impl std::error::Error for EncodeError {}

/// Faults above the codec: state machine violations and hook failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    Decode(DecodeError),
    Encode(EncodeError),
    /// Illegal packet for the current connection state; carries the reason
    /// code reported to the peer.
    Violation(ReasonCode, &'static str),
    KeepAliveTimeout,
    /// An extension hook failed
    HookFailure(&'static str),
}

impl ProtocolError {
    pub fn reason_code(&self) -> ReasonCode {
        match self {
            ProtocolError::Decode(e) => e.reason_code(),
            ProtocolError::Encode(_) => ReasonCode::UnspecifiedError,
            ProtocolError::Violation(code, _) => *code,
            ProtocolError::KeepAliveTimeout => ReasonCode::KeepAliveTimeout,
            ProtocolError::HookFailure(_) => ReasonCode::ImplementationSpecificError,
        }
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Decode(e) => write!(f, "decode error: {}", e),
            Self::Encode(e) => write!(f, "encode error: {}", e),
            Self::Violation(code, msg) => write!(f, "protocol violation ({}): {}", code, msg),
            Self::KeepAliveTimeout => write!(f, "keep alive timeout"),
            Self::HookFailure(msg) => write!(f, "hook failure: {}", msg),
        }
    }
}

impl std::error::Error for ProtocolError {}

impl From<DecodeError> for ProtocolError {
    fn from(e: DecodeError) -> Self {
        ProtocolError::Decode(e)
    }
}

impl From<EncodeError> for ProtocolError {
    fn from(e: EncodeError) -> Self {
        ProtocolError::Encode(e)
    }
}
