//! MQTT v5.0 properties.
//!
//! Properties serialize as a variable-byte-integer total length followed by
//! `(identifier, value)` pairs. Which identifiers are legal depends on the
//! containing packet type; decoding validates against that set and rejects
//! unknown identifiers and duplicated non-repeatable identifiers, all as
//! malformed-packet faults.

use bytes::{BufMut, Bytes, BytesMut};

use crate::codec::{
    read_binary, read_string, read_u16, read_u32, read_variable_int, variable_int_len,
    write_binary, write_string, write_variable_int,
};
use crate::protocol::{DecodeError, EncodeError};

/// Property identifiers (MQTT v5.0 Table 2-4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PropertyId {
    PayloadFormatIndicator = 0x01,
    MessageExpiryInterval = 0x02,
    ContentType = 0x03,
    ResponseTopic = 0x08,
    CorrelationData = 0x09,
    SubscriptionIdentifier = 0x0B,
    SessionExpiryInterval = 0x11,
    AssignedClientIdentifier = 0x12,
    ServerKeepAlive = 0x13,
    AuthenticationMethod = 0x15,
    AuthenticationData = 0x16,
    RequestProblemInformation = 0x17,
    WillDelayInterval = 0x18,
    RequestResponseInformation = 0x19,
    ResponseInformation = 0x1A,
    ServerReference = 0x1C,
    ReasonString = 0x1F,
    ReceiveMaximum = 0x21,
    TopicAliasMaximum = 0x22,
    TopicAlias = 0x23,
    MaximumQos = 0x24,
    RetainAvailable = 0x25,
    UserProperty = 0x26,
    MaximumPacketSize = 0x27,
    WildcardSubscriptionAvailable = 0x28,
    SubscriptionIdentifierAvailable = 0x29,
    SharedSubscriptionAvailable = 0x2A,
}

/// Which packet a property list belongs to; selects the permitted set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyContext {
    Connect,
    Will,
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
    Disconnect,
    Auth,
}

impl PropertyId {
    pub fn from_u8(v: u8) -> Option<Self> {
        use PropertyId::*;
        Some(match v {
            0x01 => PayloadFormatIndicator,
            0x02 => MessageExpiryInterval,
            0x03 => ContentType,
            0x08 => ResponseTopic,
            0x09 => CorrelationData,
            0x0B => SubscriptionIdentifier,
            0x11 => SessionExpiryInterval,
            0x12 => AssignedClientIdentifier,
            0x13 => ServerKeepAlive,
            0x15 => AuthenticationMethod,
            0x16 => AuthenticationData,
            0x17 => RequestProblemInformation,
            0x18 => WillDelayInterval,
            0x19 => RequestResponseInformation,
            0x1A => ResponseInformation,
            0x1C => ServerReference,
            0x1F => ReasonString,
            0x21 => ReceiveMaximum,
            0x22 => TopicAliasMaximum,
            0x23 => TopicAlias,
            0x24 => MaximumQos,
            0x25 => RetainAvailable,
            0x26 => UserProperty,
            0x27 => MaximumPacketSize,
            0x28 => WildcardSubscriptionAvailable,
            0x29 => SubscriptionIdentifierAvailable,
            0x2A => SharedSubscriptionAvailable,
            _ => return None,
        })
    }

    /// Permitted-set check per MQTT v5.0 Table 2-4.
    pub fn permitted_in(self, ctx: PropertyContext) -> bool {
        use PropertyContext as C;
        use PropertyId::*;
        match self {
            PayloadFormatIndicator | MessageExpiryInterval | ContentType | ResponseTopic
            | CorrelationData => matches!(ctx, C::Publish | C::Will),
            SubscriptionIdentifier => matches!(ctx, C::Publish | C::Subscribe),
            SessionExpiryInterval => matches!(ctx, C::Connect | C::ConnAck | C::Disconnect),
            AssignedClientIdentifier | ServerKeepAlive | ResponseInformation | MaximumQos
            | RetainAvailable | WildcardSubscriptionAvailable | SubscriptionIdentifierAvailable
            | SharedSubscriptionAvailable => matches!(ctx, C::ConnAck),
            AuthenticationMethod | AuthenticationData => {
                matches!(ctx, C::Connect | C::ConnAck | C::Auth)
            }
            RequestProblemInformation | RequestResponseInformation => matches!(ctx, C::Connect),
            WillDelayInterval => matches!(ctx, C::Will),
            ServerReference => matches!(ctx, C::ConnAck | C::Disconnect),
            ReasonString => matches!(
                ctx,
                C::ConnAck
                    | C::PubAck
                    | C::PubRec
                    | C::PubRel
                    | C::PubComp
                    | C::SubAck
                    | C::UnsubAck
                    | C::Disconnect
                    | C::Auth
            ),
            ReceiveMaximum | TopicAliasMaximum | MaximumPacketSize => {
                matches!(ctx, C::Connect | C::ConnAck)
            }
            TopicAlias => matches!(ctx, C::Publish),
            UserProperty => true,
        }
    }
}

/// A decoded property list, one slot per identifier.
///
/// `subscription_identifiers` and `user_properties` are the two repeatable
/// properties and preserve wire order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Properties {
    pub payload_format_indicator: Option<u8>,
    pub message_expiry_interval: Option<u32>,
    pub content_type: Option<String>,
    pub response_topic: Option<String>,
    pub correlation_data: Option<Bytes>,
    pub subscription_identifiers: Vec<u32>,
    pub session_expiry_interval: Option<u32>,
    pub assigned_client_identifier: Option<String>,
    pub server_keep_alive: Option<u16>,
    pub authentication_method: Option<String>,
    pub authentication_data: Option<Bytes>,
    pub request_problem_information: Option<u8>,
    pub will_delay_interval: Option<u32>,
    pub request_response_information: Option<u8>,
    pub response_information: Option<String>,
    pub server_reference: Option<String>,
    pub reason_string: Option<String>,
    pub receive_maximum: Option<u16>,
    pub topic_alias_maximum: Option<u16>,
    pub topic_alias: Option<u16>,
    pub maximum_qos: Option<u8>,
    pub retain_available: Option<u8>,
    pub user_properties: Vec<(String, String)>,
    pub maximum_packet_size: Option<u32>,
    pub wildcard_subscription_available: Option<u8>,
    pub subscription_identifier_available: Option<u8>,
    pub shared_subscription_available: Option<u8>,
}

fn put_once<T>(slot: &mut Option<T>, value: T, id: PropertyId) -> Result<(), DecodeError> {
    if slot.is_some() {
        return Err(DecodeError::DuplicateProperty(id as u8));
    }
    *slot = Some(value);
    Ok(())
}

impl Properties {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.encoded_size() == 0
    }

    /// Decode a property list, validating identifiers against `ctx`.
    /// Returns the properties and the total bytes consumed (length prefix
    /// included).
    pub fn decode(buf: &[u8], ctx: PropertyContext) -> Result<(Self, usize), DecodeError> {
        if buf.is_empty() {
            return Err(DecodeError::InsufficientData);
        }

        let (prop_len, len_bytes) = read_variable_int(buf)?;
        let end = len_bytes + prop_len as usize;
        if buf.len() < end {
            return Err(DecodeError::InsufficientData);
        }

        let mut props = Properties::new();
        let mut pos = len_bytes;
        while pos < end {
            let id_byte = buf[pos];
            let id =
                PropertyId::from_u8(id_byte).ok_or(DecodeError::InvalidPropertyId(id_byte))?;
            if !id.permitted_in(ctx) {
                return Err(DecodeError::PropertyNotPermitted(id_byte));
            }
            pos += 1;
            pos += props.read_value(id, &buf[pos..end])?;
        }

        Ok((props, end))
    }

    /// Read one property value from `buf`, store it, and return the bytes
    /// consumed. Value-range rules (non-zero receive maximum, topic alias,
    /// packet size, subscription id) are enforced here.
    fn read_value(&mut self, id: PropertyId, buf: &[u8]) -> Result<usize, DecodeError> {
        use PropertyId::*;

        let byte = |b: &[u8]| -> Result<u8, DecodeError> {
            b.first().copied().ok_or(DecodeError::InsufficientData)
        };

        match id {
            PayloadFormatIndicator => {
                put_once(&mut self.payload_format_indicator, byte(buf)?, id)?;
                Ok(1)
            }
            MessageExpiryInterval => {
                put_once(&mut self.message_expiry_interval, read_u32(buf)?, id)?;
                Ok(4)
            }
            ContentType => {
                let (s, n) = read_string(buf)?;
                put_once(&mut self.content_type, s.into(), id)?;
                Ok(n)
            }
            ResponseTopic => {
                let (s, n) = read_string(buf)?;
                put_once(&mut self.response_topic, s.into(), id)?;
                Ok(n)
            }
            CorrelationData => {
                let (d, n) = read_binary(buf)?;
                put_once(&mut self.correlation_data, Bytes::copy_from_slice(d), id)?;
                Ok(n)
            }
            SubscriptionIdentifier => {
                let (v, n) = read_variable_int(buf)?;
                if v == 0 {
                    return Err(DecodeError::MalformedPacket(
                        "subscription identifier cannot be 0",
                    ));
                }
                self.subscription_identifiers.push(v);
                Ok(n)
            }
            SessionExpiryInterval => {
                put_once(&mut self.session_expiry_interval, read_u32(buf)?, id)?;
                Ok(4)
            }
            AssignedClientIdentifier => {
                let (s, n) = read_string(buf)?;
                put_once(&mut self.assigned_client_identifier, s.into(), id)?;
                Ok(n)
            }
            ServerKeepAlive => {
                put_once(&mut self.server_keep_alive, read_u16(buf)?, id)?;
                Ok(2)
            }
            AuthenticationMethod => {
                let (s, n) = read_string(buf)?;
                put_once(&mut self.authentication_method, s.into(), id)?;
                Ok(n)
            }
            AuthenticationData => {
                let (d, n) = read_binary(buf)?;
                put_once(&mut self.authentication_data, Bytes::copy_from_slice(d), id)?;
                Ok(n)
            }
            RequestProblemInformation => {
                put_once(&mut self.request_problem_information, byte(buf)?, id)?;
                Ok(1)
            }
            WillDelayInterval => {
                put_once(&mut self.will_delay_interval, read_u32(buf)?, id)?;
                Ok(4)
            }
            RequestResponseInformation => {
                put_once(&mut self.request_response_information, byte(buf)?, id)?;
                Ok(1)
            }
            ResponseInformation => {
                let (s, n) = read_string(buf)?;
                put_once(&mut self.response_information, s.into(), id)?;
                Ok(n)
            }
            ServerReference => {
                let (s, n) = read_string(buf)?;
                put_once(&mut self.server_reference, s.into(), id)?;
                Ok(n)
            }
            ReasonString => {
                let (s, n) = read_string(buf)?;
                put_once(&mut self.reason_string, s.into(), id)?;
                Ok(n)
            }
            ReceiveMaximum => {
                let v = read_u16(buf)?;
                if v == 0 {
                    return Err(DecodeError::MalformedPacket("receive maximum cannot be 0"));
                }
                put_once(&mut self.receive_maximum, v, id)?;
                Ok(2)
            }
            TopicAliasMaximum => {
                put_once(&mut self.topic_alias_maximum, read_u16(buf)?, id)?;
                Ok(2)
            }
            TopicAlias => {
                // Zero is rejected by the connection with "topic alias
                // invalid" rather than here as a malformed packet.
                put_once(&mut self.topic_alias, read_u16(buf)?, id)?;
                Ok(2)
            }
            MaximumQos => {
                put_once(&mut self.maximum_qos, byte(buf)?, id)?;
                Ok(1)
            }
            RetainAvailable => {
                put_once(&mut self.retain_available, byte(buf)?, id)?;
                Ok(1)
            }
            UserProperty => {
                let (k, kn) = read_string(buf)?;
                let (v, vn) = read_string(&buf[kn..])?;
                self.user_properties.push((k.to_string(), v.to_string()));
                Ok(kn + vn)
            }
            MaximumPacketSize => {
                let v = read_u32(buf)?;
                if v == 0 {
                    return Err(DecodeError::MalformedPacket(
                        "maximum packet size cannot be 0",
                    ));
                }
                put_once(&mut self.maximum_packet_size, v, id)?;
                Ok(4)
            }
            WildcardSubscriptionAvailable => {
                put_once(&mut self.wildcard_subscription_available, byte(buf)?, id)?;
                Ok(1)
            }
            SubscriptionIdentifierAvailable => {
                put_once(&mut self.subscription_identifier_available, byte(buf)?, id)?;
                Ok(1)
            }
            SharedSubscriptionAvailable => {
                put_once(&mut self.shared_subscription_available, byte(buf)?, id)?;
                Ok(1)
            }
        }
    }

    /// Encoded size of the property pairs, excluding the length prefix.
    pub fn encoded_size(&self) -> usize {
        fn opt(present: bool, value_len: usize) -> usize {
            if present {
                1 + value_len
            } else {
                0
            }
        }
        fn opt_str(s: &Option<String>) -> usize {
            s.as_ref().map_or(0, |s| 1 + 2 + s.len())
        }

        let mut size = 0;
        size += opt(self.payload_format_indicator.is_some(), 1);
        size += opt(self.message_expiry_interval.is_some(), 4);
        size += opt_str(&self.content_type);
        size += opt_str(&self.response_topic);
        size += self.correlation_data.as_ref().map_or(0, |d| 1 + 2 + d.len());
        size += self
            .subscription_identifiers
            .iter()
            .map(|v| 1 + variable_int_len(*v))
            .sum::<usize>();
        size += opt(self.session_expiry_interval.is_some(), 4);
        size += opt_str(&self.assigned_client_identifier);
        size += opt(self.server_keep_alive.is_some(), 2);
        size += opt_str(&self.authentication_method);
        size += self
            .authentication_data
            .as_ref()
            .map_or(0, |d| 1 + 2 + d.len());
        size += opt(self.request_problem_information.is_some(), 1);
        size += opt(self.will_delay_interval.is_some(), 4);
        size += opt(self.request_response_information.is_some(), 1);
        size += opt_str(&self.response_information);
        size += opt_str(&self.server_reference);
        size += opt_str(&self.reason_string);
        size += opt(self.receive_maximum.is_some(), 2);
        size += opt(self.topic_alias_maximum.is_some(), 2);
        size += opt(self.topic_alias.is_some(), 2);
        size += opt(self.maximum_qos.is_some(), 1);
        size += opt(self.retain_available.is_some(), 1);
        size += self
            .user_properties
            .iter()
            .map(|(k, v)| 1 + 2 + k.len() + 2 + v.len())
            .sum::<usize>();
        size += opt(self.maximum_packet_size.is_some(), 4);
        size += opt(self.wildcard_subscription_available.is_some(), 1);
        size += opt(self.subscription_identifier_available.is_some(), 1);
        size += opt(self.shared_subscription_available.is_some(), 1);
        size
    }

    /// Encode the length prefix and all present properties.
    pub fn encode(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
        write_variable_int(buf, self.encoded_size() as u32)?;

        if let Some(v) = self.payload_format_indicator {
            buf.put_u8(PropertyId::PayloadFormatIndicator as u8);
            buf.put_u8(v);
        }
        if let Some(v) = self.message_expiry_interval {
            buf.put_u8(PropertyId::MessageExpiryInterval as u8);
            buf.put_u32(v);
        }
        if let Some(ref s) = self.content_type {
            buf.put_u8(PropertyId::ContentType as u8);
            write_string(buf, s)?;
        }
        if let Some(ref s) = self.response_topic {
            buf.put_u8(PropertyId::ResponseTopic as u8);
            write_string(buf, s)?;
        }
        if let Some(ref d) = self.correlation_data {
            buf.put_u8(PropertyId::CorrelationData as u8);
            write_binary(buf, d)?;
        }
        for id in &self.subscription_identifiers {
            buf.put_u8(PropertyId::SubscriptionIdentifier as u8);
            write_variable_int(buf, *id)?;
        }
        if let Some(v) = self.session_expiry_interval {
            buf.put_u8(PropertyId::SessionExpiryInterval as u8);
            buf.put_u32(v);
        }
        if let Some(ref s) = self.assigned_client_identifier {
            buf.put_u8(PropertyId::AssignedClientIdentifier as u8);
            write_string(buf, s)?;
        }
        if let Some(v) = self.server_keep_alive {
            buf.put_u8(PropertyId::ServerKeepAlive as u8);
            buf.put_u16(v);
        }
        if let Some(ref s) = self.authentication_method {
            buf.put_u8(PropertyId::AuthenticationMethod as u8);
            write_string(buf, s)?;
        }
        if let Some(ref d) = self.authentication_data {
            buf.put_u8(PropertyId::AuthenticationData as u8);
            write_binary(buf, d)?;
        }
        if let Some(v) = self.request_problem_information {
            buf.put_u8(PropertyId::RequestProblemInformation as u8);
            buf.put_u8(v);
        }
        if let Some(v) = self.will_delay_interval {
            buf.put_u8(PropertyId::WillDelayInterval as u8);
            buf.put_u32(v);
        }
        if let Some(v) = self.request_response_information {
            buf.put_u8(PropertyId::RequestResponseInformation as u8);
            buf.put_u8(v);
        }
        if let Some(ref s) = self.response_information {
            buf.put_u8(PropertyId::ResponseInformation as u8);
            write_string(buf, s)?;
        }
        if let Some(ref s) = self.server_reference {
            buf.put_u8(PropertyId::ServerReference as u8);
            write_string(buf, s)?;
        }
        if let Some(ref s) = self.reason_string {
            buf.put_u8(PropertyId::ReasonString as u8);
            write_string(buf, s)?;
        }
        if let Some(v) = self.receive_maximum {
            buf.put_u8(PropertyId::ReceiveMaximum as u8);
            buf.put_u16(v);
        }
        if let Some(v) = self.topic_alias_maximum {
            buf.put_u8(PropertyId::TopicAliasMaximum as u8);
            buf.put_u16(v);
        }
        if let Some(v) = self.topic_alias {
            buf.put_u8(PropertyId::TopicAlias as u8);
            buf.put_u16(v);
        }
        if let Some(v) = self.maximum_qos {
            buf.put_u8(PropertyId::MaximumQos as u8);
            buf.put_u8(v);
        }
        if let Some(v) = self.retain_available {
            buf.put_u8(PropertyId::RetainAvailable as u8);
            buf.put_u8(v);
        }
        for (k, v) in &self.user_properties {
            buf.put_u8(PropertyId::UserProperty as u8);
            write_string(buf, k)?;
            write_string(buf, v)?;
        }
        if let Some(v) = self.maximum_packet_size {
            buf.put_u8(PropertyId::MaximumPacketSize as u8);
            buf.put_u32(v);
        }
        if let Some(v) = self.wildcard_subscription_available {
            buf.put_u8(PropertyId::WildcardSubscriptionAvailable as u8);
            buf.put_u8(v);
        }
        if let Some(v) = self.subscription_identifier_available {
            buf.put_u8(PropertyId::SubscriptionIdentifierAvailable as u8);
            buf.put_u8(v);
        }
        if let Some(v) = self.shared_subscription_available {
            buf.put_u8(PropertyId::SharedSubscriptionAvailable as u8);
            buf.put_u8(v);
        }

        Ok(())
    }
}
