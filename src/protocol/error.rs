//! Wire errors

use std::fmt;

/// Why bytes from the broker could not be turned into a packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// The buffer ends in the middle of a field
    InsufficientData,
    /// Packet type nibble the client does not handle
    InvalidPacketType(u8),
    /// Variable byte integer longer than four bytes
    InvalidRemainingLength,
    /// CONNECT names a protocol other than "MQTT"
    InvalidProtocolName,
    InvalidProtocolVersion(u8),
    InvalidQoS(u8),
    InvalidUtf8,
    /// Reserved fixed-header or flag bits are set
    InvalidFlags,
    /// Structurally wrong packet, with the rule it broke
    MalformedPacket(&'static str),
    /// Remaining length above the configured `max_packet_size`
    PacketTooLarge,
    InvalidReasonCode(u8),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::InsufficientData => f.write_str("packet truncated"),
            DecodeError::InvalidPacketType(kind) => write!(f, "unsupported packet type {}", kind),
            DecodeError::InvalidRemainingLength => f.write_str("remaining length overflows 4 bytes"),
            DecodeError::InvalidProtocolName => f.write_str("protocol name is not MQTT"),
            DecodeError::InvalidProtocolVersion(level) => {
                write!(f, "unsupported protocol level {}", level)
            }
            DecodeError::InvalidQoS(qos) => write!(f, "QoS {} out of range", qos),
            DecodeError::InvalidUtf8 => f.write_str("string is not UTF-8"),
            DecodeError::InvalidFlags => f.write_str("reserved flag bits set"),
            DecodeError::MalformedPacket(rule) => write!(f, "malformed packet: {}", rule),
            DecodeError::PacketTooLarge => f.write_str("packet exceeds maximum size"),
            DecodeError::InvalidReasonCode(code) => write!(f, "unknown reason code 0x{:02X}", code),
        }
    }
}

impl std::error::Error for DecodeError {}

/// Why a packet could not be written
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodeError {
    /// Remaining length above 268,435,455
    PacketTooLarge,
    /// String or binary field above 65,535 bytes
    StringTooLong,
}

impl fmt::Display for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EncodeError::PacketTooLarge => f.write_str("packet exceeds the protocol size limit"),
            EncodeError::StringTooLong => f.write_str("field longer than 65535 bytes"),
        }
    }
}

impl std::error::Error for EncodeError {}
