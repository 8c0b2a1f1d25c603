//! Packet encoder.
//!
//! Encodes for whichever protocol level the connection negotiated. The
//! `encode_within` entry point enforces the peer-advertised maximum packet
//! size: oversized packets first lose their optional properties (reason
//! string, then user properties) and are omitted entirely if still too
//! large.

use bytes::{BufMut, BytesMut};

use super::{variable_int_len, write_binary, write_string, write_variable_int};
use crate::protocol::{
    Auth, ConnAck, Connect, Disconnect, EncodeError, Packet, Properties, ProtocolVersion, PubAck,
    PubComp, PubRec, PubRel, Publish, QoS, ReasonCode, SubAck, Subscribe, UnsubAck, Unsubscribe,
};

/// Result of a size-capped encode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodeOutcome {
    Written,
    /// The packet could not be made to fit and was not written.
    Omitted,
}

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

    fn is_v5(&self) -> bool {
        self.protocol_version == ProtocolVersion::V5
    }

    /// Encode `packet` into `buf`.
    pub fn encode(&self, packet: &Packet, buf: &mut BytesMut) -> Result<(), EncodeError> {
        match packet {
            Packet::Connect(p) => self.encode_connect(p, buf),
            Packet::ConnAck(p) => self.encode_connack(p, buf),
            Packet::Publish(p) => self.encode_publish(p, buf),
            Packet::PubAck(p) => self.encode_ack(0x40, p.packet_id, p.reason_code, &p.properties, buf),
            Packet::PubRec(p) => self.encode_ack(0x50, p.packet_id, p.reason_code, &p.properties, buf),
            Packet::PubRel(p) => self.encode_ack(0x62, p.packet_id, p.reason_code, &p.properties, buf),
            Packet::PubComp(p) => self.encode_ack(0x70, p.packet_id, p.reason_code, &p.properties, buf),
            Packet::Subscribe(p) => self.encode_subscribe(p, buf),
            Packet::SubAck(p) => self.encode_suback(p, buf),
            Packet::Unsubscribe(p) => self.encode_unsubscribe(p, buf),
            Packet::UnsubAck(p) => self.encode_unsuback(p, buf),
            Packet::PingReq => {
                buf.put_u8(0xC0);
                buf.put_u8(0x00);
                Ok(())
            }
            Packet::PingResp => {
                buf.put_u8(0xD0);
                buf.put_u8(0x00);
                Ok(())
            }
            Packet::Disconnect(p) => self.encode_disconnect(p, buf),
            Packet::Auth(p) => self.encode_auth(p, buf),
        }
    }

    /// Encode `packet` into `buf`, honoring the peer's maximum packet size.
    ///
    /// Drop order when over the limit: reason string, then user properties,
    /// then the whole packet. `buf` is left untouched past its original
    /// length when the packet is omitted.
    pub fn encode_within(
        &self,
        packet: &Packet,
        limit: usize,
        buf: &mut BytesMut,
    ) -> Result<EncodeOutcome, EncodeError> {
        let mark = buf.len();

        self.encode(packet, buf)?;
        if buf.len() - mark <= limit {
            return Ok(EncodeOutcome::Written);
        }

        for strip_user_props in [false, true] {
            let Some(slimmed) = strip_optional(packet, strip_user_props) else {
                continue;
            };
            buf.truncate(mark);
            self.encode(&slimmed, buf)?;
            if buf.len() - mark <= limit {
                return Ok(EncodeOutcome::Written);
            }
        }

        buf.truncate(mark);
        Ok(EncodeOutcome::Omitted)
    }

    fn encode_connect(&self, packet: &Connect, buf: &mut BytesMut) -> Result<(), EncodeError> {
        let is_v5 = packet.protocol_version == ProtocolVersion::V5;

        // protocol name (6) + level (1) + flags (1) + keep alive (2)
        let mut remaining = 10;
        if is_v5 {
            remaining += props_size(&packet.properties);
        }
        remaining += 2 + packet.client_id.len();
        if let Some(ref will) = packet.will {
            if is_v5 {
                remaining += props_size(&will.properties);
            }
            remaining += 2 + will.topic.len() + 2 + will.payload.len();
        }
        if let Some(ref username) = packet.username {
            remaining += 2 + username.len();
        }
        if let Some(ref password) = packet.password {
            remaining += 2 + password.len();
        }

        buf.put_u8(0x10);
        write_variable_int(buf, remaining as u32)?;

        write_string(buf, "MQTT")?;
        buf.put_u8(packet.protocol_version as u8);

        let mut flags: u8 = 0;
        if packet.clean_start {
            flags |= 0x02;
        }
        if let Some(ref will) = packet.will {
            flags |= 0x04 | ((will.qos as u8) << 3);
            if will.retain {
                flags |= 0x20;
            }
        }
        if packet.password.is_some() {
            flags |= 0x40;
        }
        if packet.username.is_some() {
            flags |= 0x80;
        }
        buf.put_u8(flags);

        buf.put_u16(packet.keep_alive);

        if is_v5 {
            packet.properties.encode(buf)?;
        }

        write_string(buf, &packet.client_id)?;

        if let Some(ref will) = packet.will {
            if is_v5 {
                will.properties.encode(buf)?;
            }
            write_string(buf, &will.topic)?;
            write_binary(buf, &will.payload)?;
        }
        if let Some(ref username) = packet.username {
            write_string(buf, username)?;
        }
        if let Some(ref password) = packet.password {
            write_binary(buf, password)?;
        }

        Ok(())
    }

    fn encode_connack(&self, packet: &ConnAck, buf: &mut BytesMut) -> Result<(), EncodeError> {
        let mut remaining = 2;
        if self.is_v5() {
            remaining += props_size(&packet.properties);
        }

        buf.put_u8(0x20);
        write_variable_int(buf, remaining as u32)?;
        buf.put_u8(packet.session_present as u8);

        if self.is_v5() {
            buf.put_u8(packet.reason_code as u8);
            packet.properties.encode(buf)?;
        } else {
            buf.put_u8(packet.reason_code.to_v3_connack_code());
        }

        Ok(())
    }

    fn encode_publish(&self, packet: &Publish, buf: &mut BytesMut) -> Result<(), EncodeError> {
        let mut remaining = 2 + packet.topic.len();
        if packet.qos != QoS::AtMostOnce {
            remaining += 2;
        }
        if self.is_v5() {
            remaining += props_size(&packet.properties);
        }
        remaining += packet.payload.len();

        let mut first_byte: u8 = 0x30 | ((packet.qos as u8) << 1);
        if packet.dup {
            first_byte |= 0x08;
        }
        if packet.retain {
            first_byte |= 0x01;
        }
        buf.put_u8(first_byte);
        write_variable_int(buf, remaining as u32)?;

        write_string(buf, &packet.topic)?;
        if let Some(packet_id) = packet.packet_id {
            buf.put_u16(packet_id);
        }
        if self.is_v5() {
            packet.properties.encode(buf)?;
        }
        buf.put_slice(&packet.payload);

        Ok(())
    }

    /// PUBACK / PUBREC / PUBREL / PUBCOMP share one body layout. On v5 the
    /// reason code and properties are elided when defaulted; v3.1.1 is
    /// always the two-byte packet id.
    fn encode_ack(
        &self,
        first_byte: u8,
        packet_id: u16,
        reason_code: ReasonCode,
        properties: &Properties,
        buf: &mut BytesMut,
    ) -> Result<(), EncodeError> {
        let props_len = if self.is_v5() { properties.encoded_size() } else { 0 };

        if self.is_v5() && (reason_code != ReasonCode::Success || props_len > 0) {
            let remaining = if props_len > 0 {
                2 + 1 + variable_int_len(props_len as u32) + props_len
            } else {
                3
            };
            buf.put_u8(first_byte);
            write_variable_int(buf, remaining as u32)?;
            buf.put_u16(packet_id);
            buf.put_u8(reason_code as u8);
            if props_len > 0 {
                properties.encode(buf)?;
            }
        } else {
            buf.put_u8(first_byte);
            buf.put_u8(0x02);
            buf.put_u16(packet_id);
        }

        Ok(())
    }

    fn encode_subscribe(&self, packet: &Subscribe, buf: &mut BytesMut) -> Result<(), EncodeError> {
        let mut remaining = 2;
        if self.is_v5() {
            remaining += props_size(&packet.properties);
        }
        for sub in &packet.filters {
            remaining += 2 + sub.filter.len() + 1;
        }

        buf.put_u8(0x82);
        write_variable_int(buf, remaining as u32)?;
        buf.put_u16(packet.packet_id);
        if self.is_v5() {
            packet.properties.encode(buf)?;
        }
        for sub in &packet.filters {
            write_string(buf, &sub.filter)?;
            if self.is_v5() {
                buf.put_u8(sub.options.to_byte());
            } else {
                buf.put_u8(sub.options.qos as u8);
            }
        }

        Ok(())
    }

    fn encode_suback(&self, packet: &SubAck, buf: &mut BytesMut) -> Result<(), EncodeError> {
        let mut remaining = 2 + packet.reason_codes.len();
        if self.is_v5() {
            remaining += props_size(&packet.properties);
        }

        buf.put_u8(0x90);
        write_variable_int(buf, remaining as u32)?;
        buf.put_u16(packet.packet_id);
        if self.is_v5() {
            packet.properties.encode(buf)?;
        }
        for code in &packet.reason_codes {
            if self.is_v5() {
                buf.put_u8(*code as u8);
            } else {
                buf.put_u8(match code {
                    ReasonCode::Success => 0x00,
                    ReasonCode::GrantedQos1 => 0x01,
                    ReasonCode::GrantedQos2 => 0x02,
                    _ => 0x80,
                });
            }
        }

        Ok(())
    }

    fn encode_unsubscribe(
        &self,
        packet: &Unsubscribe,
        buf: &mut BytesMut,
    ) -> Result<(), EncodeError> {
        let mut remaining = 2;
        if self.is_v5() {
            remaining += props_size(&packet.properties);
        }
        for filter in &packet.filters {
            remaining += 2 + filter.len();
        }

        buf.put_u8(0xA2);
        write_variable_int(buf, remaining as u32)?;
        buf.put_u16(packet.packet_id);
        if self.is_v5() {
            packet.properties.encode(buf)?;
        }
        for filter in &packet.filters {
            write_string(buf, filter)?;
        }

        Ok(())
    }

    fn encode_unsuback(&self, packet: &UnsubAck, buf: &mut BytesMut) -> Result<(), EncodeError> {
        if self.is_v5() {
            let props_len = props_size(&packet.properties);
            let remaining = 2 + props_len + packet.reason_codes.len();

            buf.put_u8(0xB0);
            write_variable_int(buf, remaining as u32)?;
            buf.put_u16(packet.packet_id);
            packet.properties.encode(buf)?;
            for code in &packet.reason_codes {
                buf.put_u8(*code as u8);
            }
        } else {
            // v3.1.1 UNSUBACK has no payload.
            buf.put_u8(0xB0);
            buf.put_u8(0x02);
            buf.put_u16(packet.packet_id);
        }

        Ok(())
    }

    fn encode_disconnect(
        &self,
        packet: &Disconnect,
        buf: &mut BytesMut,
    ) -> Result<(), EncodeError> {
        if !self.is_v5() {
            buf.put_u8(0xE0);
            buf.put_u8(0x00);
            return Ok(());
        }

        let props_len = packet.properties.encoded_size();
        if packet.reason_code == ReasonCode::Success && props_len == 0 {
            buf.put_u8(0xE0);
            buf.put_u8(0x00);
            return Ok(());
        }

        let remaining = if props_len > 0 {
            1 + variable_int_len(props_len as u32) + props_len
        } else {
            1
        };
        buf.put_u8(0xE0);
        write_variable_int(buf, remaining as u32)?;
        buf.put_u8(packet.reason_code as u8);
        if props_len > 0 {
            packet.properties.encode(buf)?;
        }

        Ok(())
    }

    fn encode_auth(&self, packet: &Auth, buf: &mut BytesMut) -> Result<(), EncodeError> {
        if !self.is_v5() {
            return Err(EncodeError::VersionMismatch);
        }

        let props_len = packet.properties.encoded_size();
        if packet.reason_code == ReasonCode::Success && props_len == 0 {
            buf.put_u8(0xF0);
            buf.put_u8(0x00);
            return Ok(());
        }

        let remaining = if props_len > 0 {
            1 + variable_int_len(props_len as u32) + props_len
        } else {
            1
        };
        buf.put_u8(0xF0);
        write_variable_int(buf, remaining as u32)?;
        buf.put_u8(packet.reason_code as u8);
        if props_len > 0 {
            packet.properties.encode(buf)?;
        }

        Ok(())
    }
}

impl Default for Encoder {
    fn default() -> Self {
        Self::new(ProtocolVersion::V5)
    }
}

/// Property length prefix + property pairs.
fn props_size(props: &Properties) -> usize {
    let len = props.encoded_size();
    variable_int_len(len as u32) + len
}

/// Clone `packet` with its reason string removed, and with user properties
/// removed too when `strip_user_props` is set. Returns `None` when the
/// packet has nothing left to drop.
fn strip_optional(packet: &Packet, strip_user_props: bool) -> Option<Packet> {
    fn slim(props: &Properties, strip_user_props: bool) -> Option<Properties> {
        if props.reason_string.is_none() && (!strip_user_props || props.user_properties.is_empty())
        {
            return None;
        }
        let mut out = props.clone();
        out.reason_string = None;
        if strip_user_props {
            out.user_properties.clear();
        }
        Some(out)
    }

    match packet {
        Packet::ConnAck(p) => slim(&p.properties, strip_user_props).map(|properties| {
            Packet::ConnAck(ConnAck {
                properties,
                ..p.clone()
            })
        }),
        Packet::Publish(p) => {
            // PUBLISH has no reason string; only user properties can go.
            if !strip_user_props || p.properties.user_properties.is_empty() {
                return None;
            }
            let mut properties = p.properties.clone();
            properties.user_properties.clear();
            Some(Packet::Publish(Publish {
                properties,
                ..p.clone()
            }))
        }
        Packet::PubAck(p) => slim(&p.properties, strip_user_props).map(|properties| {
            Packet::PubAck(PubAck {
                properties,
                ..p.clone()
            })
        }),
        Packet::PubRec(p) => slim(&p.properties, strip_user_props).map(|properties| {
            Packet::PubRec(PubRec {
                properties,
                ..p.clone()
            })
        }),
        Packet::PubRel(p) => slim(&p.properties, strip_user_props).map(|properties| {
            Packet::PubRel(PubRel {
                properties,
                ..p.clone()
            })
        }),
        Packet::PubComp(p) => slim(&p.properties, strip_user_props).map(|properties| {
            Packet::PubComp(PubComp {
                properties,
                ..p.clone()
            })
        }),
        Packet::SubAck(p) => slim(&p.properties, strip_user_props).map(|properties| {
            Packet::SubAck(SubAck {
                properties,
                ..p.clone()
            })
        }),
        Packet::UnsubAck(p) => slim(&p.properties, strip_user_props).map(|properties| {
            Packet::UnsubAck(UnsubAck {
                properties,
                ..p.clone()
            })
        }),
        Packet::Disconnect(p) => slim(&p.properties, strip_user_props).map(|properties| {
            Packet::Disconnect(Disconnect {
                properties,
                ..p.clone()
            })
        }),
        Packet::Auth(p) => slim(&p.properties, strip_user_props).map(|properties| {
            Packet::Auth(Auth {
                properties,
                ..p.clone()
            })
        }),
        _ => None,
    }
}
