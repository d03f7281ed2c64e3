//! Packet decoder
//!
//! `Decoder::decode` is incremental: it yields `None` until a whole packet is
//! buffered. Packet bodies are walked with a `Cursor`.

use bytes::Bytes;

use super::{
    read_binary, read_string, read_u16, read_u32, read_variable_int, skip_properties,
    DEFAULT_MAX_PACKET_SIZE, MAX_REMAINING_LENGTH,
};
use crate::protocol::{
    ConnAck, Connect, DecodeError, Disconnect, Packet, ProtocolVersion, PubAck, Publish, QoS,
    ReasonCode, SubAck, Subscribe, Subscription,
};

/// Reads packets for one connection
pub struct Decoder {
    /// Largest remaining length accepted
    max_packet_size: usize,
    /// Set explicitly by a client, or learned from CONNECT by a broker
    protocol_version: Option<ProtocolVersion>,
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            protocol_version: None,
        }
    }

    pub fn with_max_packet_size(mut self, size: usize) -> Self {
        self.max_packet_size = size.min(MAX_REMAINING_LENGTH);
        self
    }

    pub fn set_protocol_version(&mut self, version: ProtocolVersion) {
        self.protocol_version = Some(version);
    }

    pub fn protocol_version(&self) -> Option<ProtocolVersion> {
        self.protocol_version
    }

    fn v5(&self) -> bool {
        self.protocol_version == Some(ProtocolVersion::V5)
    }

    /// Decode the packet at the start of `buf`: `(packet, bytes used)`
    ///
    /// A remaining length above the limit fails with `PacketTooLarge` as soon
    /// as the fixed header is readable, before the body arrives.
    pub fn decode(&mut self, buf: &[u8]) -> Result<Option<(Packet, usize)>, DecodeError> {
        let Some(&header) = buf.first() else {
            return Ok(None);
        };
        let (remaining, width) = match read_variable_int(&buf[1..]) {
            Ok(parsed) => parsed,
            Err(DecodeError::InsufficientData) => return Ok(None),
            Err(e) => return Err(e),
        };
        if remaining as usize > self.max_packet_size {
            return Err(DecodeError::PacketTooLarge);
        }

        let end = 1 + width + remaining as usize;
        let Some(body) = buf.get(1 + width..end) else {
            return Ok(None);
        };
        let mut body = Cursor::new(body);
        let flags = header & 0x0F;

        let packet = match header >> 4 {
            1 => self.connect(&mut body)?,
            2 => {
                expect_flags(flags, 0)?;
                self.connack(&mut body)?
            }
            3 => self.publish(flags, &mut body)?,
            4 => {
                expect_flags(flags, 0)?;
                self.puback(&mut body)?
            }
            8 => {
                expect_flags(flags, 0x02)?;
                self.subscribe(&mut body)?
            }
            9 => {
                expect_flags(flags, 0)?;
                self.suback(&mut body)?
            }
            12 => {
                expect_flags(flags, 0)?;
                Packet::PingReq
            }
            13 => {
                expect_flags(flags, 0)?;
                Packet::PingResp
            }
            14 => {
                expect_flags(flags, 0)?;
                self.disconnect(&mut body)?
            }
            kind => return Err(DecodeError::InvalidPacketType(kind)),
        };

        Ok(Some((packet, end)))
    }

    /// CONNECT fixes the version for the rest of the connection
    fn connect(&mut self, body: &mut Cursor<'_>) -> Result<Packet, DecodeError> {
        if body.string()? != "MQTT" {
            return Err(DecodeError::InvalidProtocolName);
        }
        let level = body.u8()?;
        let version =
            ProtocolVersion::from_u8(level).ok_or(DecodeError::InvalidProtocolVersion(level))?;
        self.protocol_version = Some(version);

        let flags = body.u8()?;
        if flags & 0x01 != 0 {
            return Err(DecodeError::InvalidFlags);
        }
        let keep_alive = body.u16()?;

        let max_packet_size = if version == ProtocolVersion::V5 {
            connect_max_packet_size(body.properties()?)?
        } else {
            None
        };

        let client_id = body.string()?.to_string();

        // A will is stepped over; the client never sends one
        if flags & 0x04 != 0 {
            if version == ProtocolVersion::V5 {
                body.properties()?;
            }
            body.string()?;
            body.binary()?;
        }

        let username = match flags & 0x80 {
            0 => None,
            _ => Some(body.string()?.to_string()),
        };
        let password = match flags & 0x40 {
            0 => None,
            _ => Some(Bytes::copy_from_slice(body.binary()?)),
        };

        Ok(Packet::Connect(Box::new(Connect {
            protocol_version: version,
            client_id,
            clean_start: flags & 0x02 != 0,
            keep_alive,
            username,
            password,
            max_packet_size,
        })))
    }

    fn connack(&self, body: &mut Cursor<'_>) -> Result<Packet, DecodeError> {
        let ack = body.u8()?;
        if ack & 0xFE != 0 {
            return Err(DecodeError::InvalidFlags);
        }
        let code = body.u8()?;
        let reason_code = if self.v5() {
            if !body.is_empty() {
                body.properties()?;
            }
            ReasonCode::from_u8(code).ok_or(DecodeError::InvalidReasonCode(code))?
        } else {
            ReasonCode::from_v3_connack_code(code)
        };

        Ok(Packet::ConnAck(ConnAck {
            session_present: ack & 0x01 != 0,
            reason_code,
        }))
    }

    fn publish(&self, flags: u8, body: &mut Cursor<'_>) -> Result<Packet, DecodeError> {
        let dup = flags & 0x08 != 0;
        let qos_bits = (flags >> 1) & 0x03;
        let qos = QoS::from_u8(qos_bits).ok_or(DecodeError::InvalidQoS(qos_bits))?;
        if dup && qos == QoS::AtMostOnce {
            return Err(DecodeError::MalformedPacket("DUP set on a QoS 0 PUBLISH"));
        }

        let topic = body.string()?;
        if topic.contains(['+', '#']) {
            return Err(DecodeError::MalformedPacket("wildcard in PUBLISH topic"));
        }

        let packet_id = match qos {
            QoS::AtMostOnce => None,
            _ => Some(body.packet_id()?),
        };
        if self.v5() {
            body.properties()?;
        }

        Ok(Packet::Publish(Publish {
            dup,
            qos,
            retain: flags & 0x01 != 0,
            topic: topic.to_string(),
            packet_id,
            payload: Bytes::copy_from_slice(body.rest()),
        }))
    }

    fn puback(&self, body: &mut Cursor<'_>) -> Result<Packet, DecodeError> {
        let packet_id = body.u16()?;
        let reason_code = if self.v5() && !body.is_empty() {
            let code = body.u8()?;
            ReasonCode::from_u8(code).ok_or(DecodeError::InvalidReasonCode(code))?
        } else {
            ReasonCode::Success
        };

        Ok(Packet::PubAck(PubAck {
            packet_id,
            reason_code,
        }))
    }

    fn subscribe(&self, body: &mut Cursor<'_>) -> Result<Packet, DecodeError> {
        let packet_id = body.packet_id()?;
        if self.v5() {
            body.properties()?;
        }

        let mut subscriptions = Vec::new();
        while !body.is_empty() {
            let filter = body.string()?;
            if filter.is_empty() {
                return Err(DecodeError::MalformedPacket("empty topic filter"));
            }
            let qos_bits = body.u8()? & 0x03;
            let qos = QoS::from_u8(qos_bits).ok_or(DecodeError::InvalidQoS(qos_bits))?;
            subscriptions.push(Subscription {
                filter: filter.to_string(),
                qos,
            });
        }
        if subscriptions.is_empty() {
            return Err(DecodeError::MalformedPacket("SUBSCRIBE without filters"));
        }

        Ok(Packet::Subscribe(Subscribe {
            packet_id,
            subscriptions,
        }))
    }

    fn suback(&self, body: &mut Cursor<'_>) -> Result<Packet, DecodeError> {
        let packet_id = body.u16()?;
        if self.v5() {
            body.properties()?;
        }

        let mut reason_codes = Vec::with_capacity(body.rest().len());
        for &code in body.rest() {
            let reason = if self.v5() {
                ReasonCode::from_u8(code)
            } else {
                ReasonCode::from_v3_suback_code(code)
            };
            reason_codes.push(reason.ok_or(DecodeError::InvalidReasonCode(code))?);
        }
        if reason_codes.is_empty() {
            return Err(DecodeError::MalformedPacket("SUBACK without reason codes"));
        }

        Ok(Packet::SubAck(SubAck {
            packet_id,
            reason_codes,
        }))
    }

    fn disconnect(&self, body: &mut Cursor<'_>) -> Result<Packet, DecodeError> {
        if !self.v5() {
            if !body.is_empty() {
                return Err(DecodeError::MalformedPacket("v3.1.1 DISCONNECT with a body"));
            }
            return Ok(Packet::Disconnect(Disconnect::default()));
        }

        let reason_code = if body.is_empty() {
            ReasonCode::Success
        } else {
            let code = body.u8()?;
            ReasonCode::from_u8(code).ok_or(DecodeError::InvalidReasonCode(code))?
        };
        Ok(Packet::Disconnect(Disconnect { reason_code }))
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

fn expect_flags(flags: u8, expected: u8) -> Result<(), DecodeError> {
    if flags == expected {
        Ok(())
    } else {
        Err(DecodeError::InvalidFlags)
    }
}

/// Position within one packet body
struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn rest(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        let byte = *self.rest().first().ok_or(DecodeError::InsufficientData)?;
        self.pos += 1;
        Ok(byte)
    }

    fn u16(&mut self) -> Result<u16, DecodeError> {
        let value = read_u16(self.rest())?;
        self.pos += 2;
        Ok(value)
    }

    /// Non-zero packet identifier
    fn packet_id(&mut self) -> Result<u16, DecodeError> {
        match self.u16()? {
            0 => Err(DecodeError::MalformedPacket("packet identifier 0")),
            id => Ok(id),
        }
    }

    fn string(&mut self) -> Result<&'a str, DecodeError> {
        let (text, width) = read_string(self.rest())?;
        self.pos += width;
        Ok(text)
    }

    fn binary(&mut self) -> Result<&'a [u8], DecodeError> {
        let (data, width) = read_binary(self.rest())?;
        self.pos += width;
        Ok(data)
    }

    /// A v5.0 property block, without its length prefix
    fn properties(&mut self) -> Result<&'a [u8], DecodeError> {
        let rest = self.rest();
        let total = skip_properties(rest)?;
        let (_, width) = read_variable_int(rest)?;
        self.pos += total;
        Ok(&rest[width..total])
    }
}

/// Walk CONNECT properties looking for Maximum Packet Size
fn connect_max_packet_size(mut props: &[u8]) -> Result<Option<u32>, DecodeError> {
    let mut found = None;
    while let Some((&id, rest)) = props.split_first() {
        let width = match id {
            0x27 => {
                found = Some(read_u32(rest)?);
                4
            }
            0x11 => 4,
            0x21 | 0x22 => 2,
            0x17 | 0x19 => 1,
            0x15 | 0x16 => read_binary(rest)?.1,
            0x26 => {
                let (_, key) = read_string(rest)?;
                let (_, value) = read_string(&rest[key..])?;
                key + value
            }
            _ => return Err(DecodeError::MalformedPacket("unknown CONNECT property")),
        };
        props = rest
            .get(width..)
            .ok_or(DecodeError::MalformedPacket("truncated CONNECT property"))?;
    }
    Ok(found)
}
