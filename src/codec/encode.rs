//! Packet encoder
//!
//! Each packet body is assembled first, then framed with its fixed header.
//! CONNECT may carry a Maximum Packet Size property; every other v5.0
//! property block is written empty.

use bytes::{BufMut, BytesMut};

use super::{write_binary, write_string, write_variable_int};
use crate::protocol::{
    ConnAck, Connect, Disconnect, EncodeError, Packet, ProtocolVersion, PubAck, Publish, QoS,
    ReasonCode, SubAck, Subscribe,
};

/// CONNECT property identifier for Maximum Packet Size
const PROP_MAX_PACKET_SIZE: u8 = 0x27;

/// Writes packets for one protocol version
pub struct Encoder {
    protocol_version: ProtocolVersion,
}

impl Encoder {
    pub fn new(version: ProtocolVersion) -> Self {
        Self {
            protocol_version: version,
        }
    }

    pub fn set_protocol_version(&mut self, version: ProtocolVersion) {
        self.protocol_version = version;
    }

    fn v5(&self) -> bool {
        self.protocol_version == ProtocolVersion::V5
    }

    /// Append `packet` to `buf`
    pub fn encode(&self, packet: &Packet, buf: &mut BytesMut) -> Result<(), EncodeError> {
        let mut body = BytesMut::new();
        let header = match packet {
            Packet::Connect(connect) => {
                connect_body(connect, &mut body)?;
                0x10
            }
            Packet::ConnAck(connack) => {
                self.connack_body(connack, &mut body);
                0x20
            }
            Packet::Publish(publish) => {
                self.publish_body(publish, &mut body)?;
                publish_header(publish)
            }
            Packet::PubAck(puback) => {
                self.ack_body(puback, &mut body);
                0x40
            }
            Packet::Subscribe(subscribe) => {
                self.subscribe_body(subscribe, &mut body)?;
                0x82
            }
            Packet::SubAck(suback) => {
                self.suback_body(suback, &mut body);
                0x90
            }
            Packet::PingReq => 0xC0,
            Packet::PingResp => 0xD0,
            Packet::Disconnect(disconnect) => {
                self.disconnect_body(disconnect, &mut body);
                0xE0
            }
        };

        buf.reserve(body.len() + 5);
        buf.put_u8(header);
        write_variable_int(buf, body.len() as u32)?;
        buf.put_slice(&body);
        Ok(())
    }

    fn empty_properties(&self, body: &mut BytesMut) {
        if self.v5() {
            body.put_u8(0);
        }
    }

    fn connack_body(&self, connack: &ConnAck, body: &mut BytesMut) {
        body.put_u8(u8::from(connack.session_present));
        if self.v5() {
            body.put_u8(connack.reason_code as u8);
            self.empty_properties(body);
        } else {
            body.put_u8(connack.reason_code.to_v3_connack_code());
        }
    }

    fn publish_body(&self, publish: &Publish, body: &mut BytesMut) -> Result<(), EncodeError> {
        write_string(body, &publish.topic)?;
        if publish.qos != QoS::AtMostOnce {
            body.put_u16(publish.packet_id.unwrap_or(1));
        }
        self.empty_properties(body);
        body.put_slice(&publish.payload);
        Ok(())
    }

    fn ack_body(&self, puback: &PubAck, body: &mut BytesMut) {
        body.put_u16(puback.packet_id);
        if self.v5() && puback.reason_code != ReasonCode::Success {
            body.put_u8(puback.reason_code as u8);
        }
    }

    fn subscribe_body(&self, subscribe: &Subscribe, body: &mut BytesMut) -> Result<(), EncodeError> {
        body.put_u16(subscribe.packet_id);
        self.empty_properties(body);
        for subscription in &subscribe.subscriptions {
            write_string(body, &subscription.filter)?;
            body.put_u8(subscription.qos as u8);
        }
        Ok(())
    }

    fn suback_body(&self, suback: &SubAck, body: &mut BytesMut) {
        body.put_u16(suback.packet_id);
        self.empty_properties(body);
        body.extend(suback.reason_codes.iter().map(|code| {
            if self.v5() {
                *code as u8
            } else {
                code.to_v3_suback_code()
            }
        }));
    }

    fn disconnect_body(&self, disconnect: &Disconnect, body: &mut BytesMut) {
        if self.v5() && disconnect.reason_code != ReasonCode::Success {
            body.put_u8(disconnect.reason_code as u8);
        }
    }
}

fn publish_header(publish: &Publish) -> u8 {
    let mut header = 0x30 | (publish.qos as u8) << 1;
    if publish.dup {
        header |= 0x08;
    }
    if publish.retain {
        header |= 0x01;
    }
    header
}

/// CONNECT follows the version it announces, not the encoder's
fn connect_body(connect: &Connect, body: &mut BytesMut) -> Result<(), EncodeError> {
    write_string(body, "MQTT")?;
    body.put_u8(connect.protocol_version as u8);

    let mut flags = 0u8;
    if connect.clean_start {
        flags |= 0x02;
    }
    if connect.password.is_some() {
        flags |= 0x40;
    }
    if connect.username.is_some() {
        flags |= 0x80;
    }
    body.put_u8(flags);
    body.put_u16(connect.keep_alive);

    if connect.protocol_version == ProtocolVersion::V5 {
        match connect.max_packet_size {
            Some(limit) => {
                body.put_u8(5);
                body.put_u8(PROP_MAX_PACKET_SIZE);
                body.put_u32(limit);
            }
            None => body.put_u8(0),
        }
    }

    write_string(body, &connect.client_id)?;
    if let Some(username) = &connect.username {
        write_string(body, username)?;
    }
    if let Some(password) = &connect.password {
        write_binary(body, password)?;
    }
    Ok(())
}
