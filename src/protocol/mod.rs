//! MQTT Protocol definitions and types
//!
//! The subset of MQTT v3.1.1 and v5.0 a subscribing client needs: connect,
//! subscribe, receive publishes, keep alive and disconnect.

mod error;
mod packet;
mod reason;

pub use error::{DecodeError, EncodeError};
pub use packet::*;
pub use reason::ReasonCode;

use serde::Deserialize;

/// MQTT Protocol Version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize)]
#[repr(u8)]
pub enum ProtocolVersion {
    /// MQTT v3.1.1 (protocol level 4)
    #[default]
    #[serde(rename = "3.1.1", alias = "v3.1.1", alias = "4")]
    V311 = 4,
    /// MQTT v5.0 (protocol level 5)
    #[serde(rename = "5", alias = "5.0", alias = "v5")]
    V5 = 5,
}

impl ProtocolVersion {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            4 => Some(ProtocolVersion::V311),
            5 => Some(ProtocolVersion::V5),
            _ => None,
        }
    }
}

impl std::fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtocolVersion::V311 => write!(f, "3.1.1"),
            ProtocolVersion::V5 => write!(f, "5.0"),
        }
    }
}

/// Quality of Service levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(u8)]
pub enum QoS {
    /// At most once delivery
    #[default]
    AtMostOnce = 0,
    /// At least once delivery
    AtLeastOnce = 1,
    /// Exactly once delivery
    ExactlyOnce = 2,
}

impl QoS {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(QoS::AtMostOnce),
            1 => Some(QoS::AtLeastOnce),
            2 => Some(QoS::ExactlyOnce),
            _ => None,
        }
    }
}
