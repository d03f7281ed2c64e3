//! Packets a subscribing client exchanges with its broker
//!
//! One set of types serves v3.1.1 and v5.0. Apart from CONNECT's Maximum
//! Packet Size, v5.0 properties are not modelled.

use bytes::Bytes;

use super::{ProtocolVersion, QoS, ReasonCode};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Connect(Box<Connect>),
    ConnAck(ConnAck),
    Publish(Publish),
    PubAck(PubAck),
    Subscribe(Subscribe),
    SubAck(SubAck),
    PingReq,
    PingResp,
    Disconnect(Disconnect),
}

impl Packet {
    /// Control packet type from the fixed header's upper nibble
    pub fn packet_type(&self) -> u8 {
        match self {
            Packet::Connect(_) => 1,
            Packet::ConnAck(_) => 2,
            Packet::Publish(_) => 3,
            Packet::PubAck(_) => 4,
            Packet::Subscribe(_) => 8,
            Packet::SubAck(_) => 9,
            Packet::PingReq => 12,
            Packet::PingResp => 13,
            Packet::Disconnect(_) => 14,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connect {
    /// Also selects the CONNECT layout on the wire
    pub protocol_version: ProtocolVersion,
    pub client_id: String,
    /// Clean session in v3.1.1, clean start in v5.0
    pub clean_start: bool,
    /// Seconds; 0 turns keepalive off
    pub keep_alive: u16,
    pub username: Option<String>,
    pub password: Option<Bytes>,
    /// Largest packet the client accepts; only sent to v5.0 brokers
    pub max_packet_size: Option<u32>,
}

impl Default for Connect {
    fn default() -> Self {
        Self {
            protocol_version: ProtocolVersion::V311,
            client_id: String::new(),
            clean_start: true,
            keep_alive: 30,
            username: None,
            password: None,
            max_packet_size: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConnAck {
    pub session_present: bool,
    /// v3.1.1 return codes are mapped onto their v5.0 equivalents
    pub reason_code: ReasonCode,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Publish {
    pub dup: bool,
    pub qos: QoS,
    pub retain: bool,
    pub topic: String,
    /// `Some` exactly when `qos` is above 0
    pub packet_id: Option<u16>,
    pub payload: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PubAck {
    pub packet_id: u16,
    /// Written only by v5.0, and only when not `Success`
    pub reason_code: ReasonCode,
}

impl PubAck {
    pub fn new(packet_id: u16) -> Self {
        Self {
            packet_id,
            reason_code: ReasonCode::Success,
        }
    }
}

/// One topic filter of a SUBSCRIBE
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub filter: String,
    pub qos: QoS,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscribe {
    pub packet_id: u16,
    pub subscriptions: Vec<Subscription>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubAck {
    pub packet_id: u16,
    /// One per filter, in SUBSCRIBE order
    pub reason_codes: Vec<ReasonCode>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Disconnect {
    pub reason_code: ReasonCode,
}
