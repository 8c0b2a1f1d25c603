//! Packet decoder.
//!
//! `decode` consumes complete packets off the connection's assembly buffer,
//! returning `None` until a full packet has arrived. The negotiated protocol
//! version is latched from the CONNECT packet and selects the v3.1.1 or v5.0
//! reading of every later packet.

use std::sync::Arc;

use bytes::Bytes;

use super::{read_binary, read_string, read_u16, read_variable_int, MAX_REMAINING_LENGTH};
use crate::protocol::{
    Auth, ConnAck, Connect, DecodeError, Disconnect, Packet, Properties, PropertyContext,
    ProtocolVersion, PubAck, PubComp, PubRec, PubRel, Publish, QoS, ReasonCode, SubAck, Subscribe,
    SubscribeFilter, SubscriptionOptions, UnsubAck, Unsubscribe, Will,
};

pub struct Decoder {
    max_packet_size: usize,
    protocol_version: Option<ProtocolVersion>,
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            max_packet_size: MAX_REMAINING_LENGTH,
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

    fn is_v5(&self) -> bool {
        self.protocol_version == Some(ProtocolVersion::V5)
    }

    /// Decode one packet from the front of `buf`.
    /// Returns `Some((packet, bytes_consumed))` or `None` when more bytes are
    /// needed.
    pub fn decode(&mut self, buf: &[u8]) -> Result<Option<(Packet, usize)>, DecodeError> {
        if buf.len() < 2 {
            return Ok(None);
        }

        let first_byte = buf[0];
        let packet_type = first_byte >> 4;
        let flags = first_byte & 0x0F;

        let (remaining_length, len_bytes) = match read_variable_int(&buf[1..]) {
            Ok(r) => r,
            Err(DecodeError::InsufficientData) => return Ok(None),
            Err(e) => return Err(e),
        };

        // Inbound size cap: total packet, fixed header included.
        let total_len = 1 + len_bytes + remaining_length as usize;
        if total_len > self.max_packet_size {
            return Err(DecodeError::PacketTooLarge);
        }
        if buf.len() < total_len {
            return Ok(None);
        }

        let body = &buf[1 + len_bytes..total_len];

        let packet = match packet_type {
            1 => self.decode_connect(body)?,
            2 => self.decode_connack(flags, body)?,
            3 => self.decode_publish(flags, body)?,
            4 => {
                let (id, rc, props) = self.decode_ack(flags, 0x00, body, PropertyContext::PubAck)?;
                Packet::PubAck(PubAck {
                    packet_id: id,
                    reason_code: rc,
                    properties: props,
                })
            }
            5 => {
                let (id, rc, props) = self.decode_ack(flags, 0x00, body, PropertyContext::PubRec)?;
                Packet::PubRec(PubRec {
                    packet_id: id,
                    reason_code: rc,
                    properties: props,
                })
            }
            6 => {
                // PUBREL carries mandated flags 0010.
                let (id, rc, props) = self.decode_ack(flags, 0x02, body, PropertyContext::PubRel)?;
                Packet::PubRel(PubRel {
                    packet_id: id,
                    reason_code: rc,
                    properties: props,
                })
            }
            7 => {
                let (id, rc, props) =
                    self.decode_ack(flags, 0x00, body, PropertyContext::PubComp)?;
                Packet::PubComp(PubComp {
                    packet_id: id,
                    reason_code: rc,
                    properties: props,
                })
            }
            8 => self.decode_subscribe(flags, body)?,
            9 => self.decode_suback(flags, body)?,
            10 => self.decode_unsubscribe(flags, body)?,
            11 => self.decode_unsuback(flags, body)?,
            12 => {
                if flags != 0 {
                    return Err(DecodeError::InvalidFlags);
                }
                Packet::PingReq
            }
            13 => {
                if flags != 0 {
                    return Err(DecodeError::InvalidFlags);
                }
                Packet::PingResp
            }
            14 => self.decode_disconnect(flags, body)?,
            15 => self.decode_auth(flags, body)?,
            _ => return Err(DecodeError::InvalidPacketType(packet_type)),
        };

        Ok(Some((packet, total_len)))
    }

    fn decode_properties(
        &self,
        buf: &[u8],
        ctx: PropertyContext,
    ) -> Result<(Properties, usize), DecodeError> {
        if self.is_v5() {
            Properties::decode(buf, ctx)
        } else {
            Ok((Properties::default(), 0))
        }
    }

    fn decode_connect(&mut self, body: &[u8]) -> Result<Packet, DecodeError> {
        let mut pos = 0;

        let (protocol_name, n) = read_string(&body[pos..])?;
        pos += n;
        if protocol_name != "MQTT" {
            return Err(DecodeError::InvalidProtocolName);
        }

        let level = *body.get(pos).ok_or(DecodeError::InsufficientData)?;
        pos += 1;
        let protocol_version =
            ProtocolVersion::from_u8(level).ok_or(DecodeError::InvalidProtocolVersion(level))?;
        self.protocol_version = Some(protocol_version);

        let connect_flags = *body.get(pos).ok_or(DecodeError::InsufficientData)?;
        pos += 1;

        // Reserved bit 0 must be zero.
        if (connect_flags & 0x01) != 0 {
            return Err(DecodeError::InvalidFlags);
        }

        let clean_start = (connect_flags & 0x02) != 0;
        let will_flag = (connect_flags & 0x04) != 0;
        let will_qos = (connect_flags >> 3) & 0x03;
        let will_retain = (connect_flags & 0x20) != 0;
        let password_flag = (connect_flags & 0x40) != 0;
        let username_flag = (connect_flags & 0x80) != 0;

        if !username_flag && password_flag {
            return Err(DecodeError::InvalidFlags);
        }
        if !will_flag && (will_qos != 0 || will_retain) {
            return Err(DecodeError::InvalidFlags);
        }
        let will_qos = QoS::from_u8(will_qos).ok_or(DecodeError::InvalidQoS(will_qos))?;

        let keep_alive = read_u16(&body[pos..])?;
        pos += 2;

        let properties = {
            let (props, n) = self.decode_properties(&body[pos..], PropertyContext::Connect)?;
            pos += n;
            props
        };

        let (client_id, n) = read_string(&body[pos..])?;
        pos += n;
        let client_id = client_id.to_string();

        let will = if will_flag {
            let (will_props, n) = self.decode_properties(&body[pos..], PropertyContext::Will)?;
            pos += n;
            let (will_topic, n) = read_string(&body[pos..])?;
            pos += n;
            let (will_payload, n) = read_binary(&body[pos..])?;
            pos += n;
            Some(Will {
                topic: will_topic.to_string(),
                payload: Bytes::copy_from_slice(will_payload),
                qos: will_qos,
                retain: will_retain,
                properties: will_props,
            })
        } else {
            None
        };

        let username = if username_flag {
            let (s, n) = read_string(&body[pos..])?;
            pos += n;
            Some(s.to_string())
        } else {
            None
        };

        let password = if password_flag {
            let (data, _) = read_binary(&body[pos..])?;
            Some(Bytes::copy_from_slice(data))
        } else {
            None
        };

        Ok(Packet::Connect(Box::new(Connect {
            protocol_version,
            client_id,
            clean_start,
            keep_alive,
            username,
            password,
            will,
            properties,
        })))
    }

    fn decode_connack(&self, flags: u8, body: &[u8]) -> Result<Packet, DecodeError> {
        if flags != 0 {
            return Err(DecodeError::InvalidFlags);
        }
        if body.len() < 2 {
            return Err(DecodeError::InsufficientData);
        }

        // Only bit 0 (session present) of the acknowledge flags may be set.
        if (body[0] & 0xFE) != 0 {
            return Err(DecodeError::InvalidFlags);
        }
        let session_present = (body[0] & 0x01) != 0;

        let (reason_code, properties) = if self.is_v5() || self.protocol_version.is_none() {
            let rc = ReasonCode::from_u8(body[1]).ok_or(DecodeError::InvalidReasonCode(body[1]))?;
            let props = if body.len() > 2 {
                Properties::decode(&body[2..], PropertyContext::ConnAck)?.0
            } else {
                Properties::default()
            };
            (rc, props)
        } else {
            (
                ReasonCode::from_v3_connack_code(body[1]),
                Properties::default(),
            )
        };

        Ok(Packet::ConnAck(ConnAck {
            session_present,
            reason_code,
            properties,
        }))
    }

    fn decode_publish(&self, flags: u8, body: &[u8]) -> Result<Packet, DecodeError> {
        let dup = (flags & 0x08) != 0;
        let qos_bits = (flags >> 1) & 0x03;
        let retain = (flags & 0x01) != 0;

        let qos = QoS::from_u8(qos_bits).ok_or(DecodeError::InvalidQoS(qos_bits))?;
        if qos == QoS::AtMostOnce && dup {
            return Err(DecodeError::MalformedPacket("DUP must be 0 for QoS 0"));
        }

        let mut pos = 0;
        let (topic, n) = read_string(&body[pos..])?;
        pos += n;

        // Wildcards are never legal in a topic name.
        if topic.contains('+') || topic.contains('#') {
            return Err(DecodeError::MalformedPacket("topic contains wildcard"));
        }
        let topic: Arc<str> = Arc::from(topic);

        let packet_id = if qos != QoS::AtMostOnce {
            let id = read_u16(&body[pos..])?;
            if id == 0 {
                return Err(DecodeError::MalformedPacket("packet id cannot be 0"));
            }
            pos += 2;
            Some(id)
        } else {
            None
        };

        let (properties, n) = self.decode_properties(&body[pos..], PropertyContext::Publish)?;
        pos += n;

        Ok(Packet::Publish(Publish {
            dup,
            qos,
            retain,
            topic,
            packet_id,
            payload: Bytes::copy_from_slice(&body[pos..]),
            properties,
        }))
    }

    /// Shared body reader for the four QoS acknowledgement packets: packet
    /// id, optional reason code, optional properties.
    fn decode_ack(
        &self,
        flags: u8,
        expected_flags: u8,
        body: &[u8],
        ctx: PropertyContext,
    ) -> Result<(u16, ReasonCode, Properties), DecodeError> {
        if flags != expected_flags {
            return Err(DecodeError::InvalidFlags);
        }

        let packet_id = read_u16(body)?;

        if !self.is_v5() || body.len() <= 2 {
            return Ok((packet_id, ReasonCode::Success, Properties::default()));
        }

        let rc = ReasonCode::from_u8(body[2]).ok_or(DecodeError::InvalidReasonCode(body[2]))?;
        let props = if body.len() > 3 {
            Properties::decode(&body[3..], ctx)?.0
        } else {
            Properties::default()
        };

        Ok((packet_id, rc, props))
    }

    fn decode_subscribe(&self, flags: u8, body: &[u8]) -> Result<Packet, DecodeError> {
        if flags != 0x02 {
            return Err(DecodeError::InvalidFlags);
        }

        let packet_id = read_u16(body)?;
        if packet_id == 0 {
            return Err(DecodeError::MalformedPacket("packet id cannot be 0"));
        }
        let mut pos = 2;

        let (properties, n) = self.decode_properties(&body[pos..], PropertyContext::Subscribe)?;
        pos += n;

        let mut filters = Vec::new();
        while pos < body.len() {
            let (filter, n) = read_string(&body[pos..])?;
            pos += n;
            if filter.is_empty() {
                return Err(DecodeError::MalformedPacket("topic filter cannot be empty"));
            }

            let options_byte = *body.get(pos).ok_or(DecodeError::InsufficientData)?;
            pos += 1;

            let options = if self.is_v5() {
                SubscriptionOptions::from_byte(options_byte)
                    .ok_or(DecodeError::InvalidSubscriptionOptions)?
            } else {
                // v3.1.1 carries only the requested QoS.
                SubscriptionOptions {
                    qos: QoS::from_u8(options_byte & 0x03)
                        .ok_or(DecodeError::InvalidQoS(options_byte & 0x03))?,
                    ..Default::default()
                }
            };

            filters.push(SubscribeFilter {
                filter: filter.to_string(),
                options,
            });
        }

        if filters.is_empty() {
            return Err(DecodeError::MalformedPacket(
                "SUBSCRIBE must carry at least one filter",
            ));
        }

        Ok(Packet::Subscribe(Subscribe {
            packet_id,
            filters,
            properties,
        }))
    }

    fn decode_suback(&self, flags: u8, body: &[u8]) -> Result<Packet, DecodeError> {
        if flags != 0 {
            return Err(DecodeError::InvalidFlags);
        }

        let packet_id = read_u16(body)?;
        let mut pos = 2;

        let (properties, n) = self.decode_properties(&body[pos..], PropertyContext::SubAck)?;
        pos += n;

        let mut reason_codes = Vec::new();
        for &code in &body[pos..] {
            let rc = if self.is_v5() {
                ReasonCode::from_u8(code).ok_or(DecodeError::InvalidReasonCode(code))?
            } else {
                match code {
                    0x00 => ReasonCode::Success,
                    0x01 => ReasonCode::GrantedQos1,
                    0x02 => ReasonCode::GrantedQos2,
                    0x80 => ReasonCode::UnspecifiedError,
                    _ => return Err(DecodeError::InvalidReasonCode(code)),
                }
            };
            reason_codes.push(rc);
        }

        Ok(Packet::SubAck(SubAck {
            packet_id,
            reason_codes,
            properties,
        }))
    }

    fn decode_unsubscribe(&self, flags: u8, body: &[u8]) -> Result<Packet, DecodeError> {
        if flags != 0x02 {
            return Err(DecodeError::InvalidFlags);
        }

        let packet_id = read_u16(body)?;
        if packet_id == 0 {
            return Err(DecodeError::MalformedPacket("packet id cannot be 0"));
        }
        let mut pos = 2;

        let (properties, n) = self.decode_properties(&body[pos..], PropertyContext::Unsubscribe)?;
        pos += n;

        let mut filters = Vec::new();
        while pos < body.len() {
            let (filter, n) = read_string(&body[pos..])?;
            pos += n;
            if filter.is_empty() {
                return Err(DecodeError::MalformedPacket("topic filter cannot be empty"));
            }
            filters.push(filter.to_string());
        }

        if filters.is_empty() {
            return Err(DecodeError::MalformedPacket(
                "UNSUBSCRIBE must carry at least one filter",
            ));
        }

        Ok(Packet::Unsubscribe(Unsubscribe {
            packet_id,
            filters,
            properties,
        }))
    }

    fn decode_unsuback(&self, flags: u8, body: &[u8]) -> Result<Packet, DecodeError> {
        if flags != 0 {
            return Err(DecodeError::InvalidFlags);
        }

        let packet_id = read_u16(body)?;

        let (properties, reason_codes) = if self.is_v5() {
            let (props, mut pos) = Properties::decode(&body[2..], PropertyContext::UnsubAck)?;
            pos += 2;
            let mut codes = Vec::new();
            for &code in &body[pos..] {
                codes.push(ReasonCode::from_u8(code).ok_or(DecodeError::InvalidReasonCode(code))?);
            }
            (props, codes)
        } else {
            (Properties::default(), Vec::new())
        };

        Ok(Packet::UnsubAck(UnsubAck {
            packet_id,
            reason_codes,
            properties,
        }))
    }

    fn decode_disconnect(&self, flags: u8, body: &[u8]) -> Result<Packet, DecodeError> {
        if flags != 0 {
            return Err(DecodeError::InvalidFlags);
        }

        if !self.is_v5() {
            if !body.is_empty() {
                return Err(DecodeError::MalformedPacket("v3.1.1 DISCONNECT has no body"));
            }
            return Ok(Packet::Disconnect(Disconnect::default()));
        }

        if body.is_empty() {
            return Ok(Packet::Disconnect(Disconnect::default()));
        }

        let reason_code =
            ReasonCode::from_u8(body[0]).ok_or(DecodeError::InvalidReasonCode(body[0]))?;
        let properties = if body.len() > 1 {
            Properties::decode(&body[1..], PropertyContext::Disconnect)?.0
        } else {
            Properties::default()
        };

        Ok(Packet::Disconnect(Disconnect {
            reason_code,
            properties,
        }))
    }

    fn decode_auth(&self, flags: u8, body: &[u8]) -> Result<Packet, DecodeError> {
        if flags != 0 {
            return Err(DecodeError::InvalidFlags);
        }
        if !self.is_v5() {
            return Err(DecodeError::InvalidPacketType(15));
        }

        if body.is_empty() {
            return Ok(Packet::Auth(Auth::default()));
        }

        let reason_code =
            ReasonCode::from_u8(body[0]).ok_or(DecodeError::InvalidReasonCode(body[0]))?;
        let properties = if body.len() > 1 {
            Properties::decode(&body[1..], PropertyContext::Auth)?.0
        } else {
            Properties::default()
        };

        Ok(Packet::Auth(Auth {
            reason_code,
            properties,
        }))
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}
