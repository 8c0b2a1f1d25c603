//! Codec tests: round trips for every packet kind on both protocol
//! levels, variable-byte-integer boundaries, property validation, and the
//! outbound size cap.

#![allow(clippy::field_reassign_with_default)]

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use pretty_assertions::assert_eq;

use crate::codec::{
    read_variable_int, variable_int_len, write_variable_int, Decoder, EncodeOutcome, Encoder,
    MAX_REMAINING_LENGTH,
};
use crate::protocol::{
    Auth, ConnAck, Connect, DecodeError, Disconnect, Packet, Properties, ProtocolVersion, PubAck,
    PubComp, PubRec, PubRel, Publish, QoS, ReasonCode, SubAck, Subscribe, SubscribeFilter,
    SubscriptionOptions, UnsubAck, Unsubscribe, Will,
};

fn encode_packet(packet: &Packet, version: ProtocolVersion) -> BytesMut {
    let encoder = Encoder::new(version);
    let mut buf = BytesMut::new();
    encoder.encode(packet, &mut buf).unwrap();
    buf
}

fn decode_packet(buf: &[u8], version: Option<ProtocolVersion>) -> Result<Packet, DecodeError> {
    let mut decoder = Decoder::new();
    if let Some(v) = version {
        decoder.set_protocol_version(v);
    }
    match decoder.decode(buf)? {
        Some((packet, consumed)) => {
            assert_eq!(consumed, buf.len(), "decode must consume the whole packet");
            Ok(packet)
        }
        None => Err(DecodeError::InsufficientData),
    }
}

fn round_trip(packet: Packet, version: ProtocolVersion) {
    let encoded = encode_packet(&packet, version);
    assert_total_length(&encoded);
    let decoded = decode_packet(&encoded, Some(version)).unwrap();
    assert_eq!(packet, decoded);
}

/// The encoded length must equal fixed-header length + remaining length.
fn assert_total_length(encoded: &[u8]) {
    let (remaining, len_bytes) = read_variable_int(&encoded[1..]).unwrap();
    assert_eq!(encoded.len(), 1 + len_bytes + remaining as usize);
}

// ---------------------------------------------------------------------------
// CONNECT / CONNACK
// ---------------------------------------------------------------------------

#[test]
fn connect_v311_round_trip() {
    round_trip(
        Packet::Connect(Box::new(Connect {
            protocol_version: ProtocolVersion::V311,
            client_id: "client-a".to_string(),
            clean_start: false,
            keep_alive: 300,
            username: Some("user".to_string()),
            password: Some(Bytes::from_static(b"pass")),
            will: Some(Will {
                topic: "will/topic".to_string(),
                payload: Bytes::from_static(b"gone"),
                qos: QoS::AtLeastOnce,
                retain: true,
                properties: Properties::default(),
            }),
            properties: Properties::default(),
        })),
        ProtocolVersion::V311,
    );
}

#[test]
fn connect_v5_with_properties_round_trip() {
    let mut props = Properties::default();
    props.session_expiry_interval = Some(3600);
    props.receive_maximum = Some(100);
    props.maximum_packet_size = Some(1024 * 1024);
    props.topic_alias_maximum = Some(10);
    props.request_response_information = Some(1);
    props.user_properties.push(("k".to_string(), "v".to_string()));

    let mut will_props = Properties::default();
    will_props.will_delay_interval = Some(30);
    will_props.message_expiry_interval = Some(600);
    will_props.content_type = Some("text/plain".to_string());

    round_trip(
        Packet::Connect(Box::new(Connect {
            protocol_version: ProtocolVersion::V5,
            client_id: "client-b".to_string(),
            clean_start: true,
            keep_alive: 60,
            username: None,
            password: None,
            will: Some(Will {
                topic: "will".to_string(),
                payload: Bytes::from_static(b"bye"),
                qos: QoS::ExactlyOnce,
                retain: false,
                properties: will_props,
            }),
            properties: props,
        })),
        ProtocolVersion::V5,
    );
}

#[test]
fn connect_rejects_wrong_protocol_name() {
    // "MQXX" instead of "MQTT"
    let bytes = [
        0x10, 0x0D, 0x00, 0x04, b'M', b'Q', b'X', b'X', 0x04, 0x02, 0x00, 0x3C, 0x00, 0x01, b'a',
    ];
    assert_eq!(
        decode_packet(&bytes, None),
        Err(DecodeError::InvalidProtocolName)
    );
}

#[test]
fn connect_rejects_unknown_level() {
    let bytes = [
        0x10, 0x0D, 0x00, 0x04, b'M', b'Q', b'T', b'T', 0x03, 0x02, 0x00, 0x3C, 0x00, 0x01, b'a',
    ];
    assert_eq!(
        decode_packet(&bytes, None),
        Err(DecodeError::InvalidProtocolVersion(3))
    );
}

#[test]
fn connect_rejects_password_without_username() {
    // flags 0x42: clean start + password, no username
    let bytes = [
        0x10, 0x0D, 0x00, 0x04, b'M', b'Q', b'T', b'T', 0x04, 0x42, 0x00, 0x3C, 0x00, 0x01, b'a',
    ];
    assert_eq!(decode_packet(&bytes, None), Err(DecodeError::InvalidFlags));
}

#[test]
fn connack_round_trips_both_versions() {
    let mut props = Properties::default();
    props.assigned_client_identifier = Some("auto-1".to_string());
    props.receive_maximum = Some(20);
    props.shared_subscription_available = Some(1);

    round_trip(
        Packet::ConnAck(ConnAck {
            session_present: true,
            reason_code: ReasonCode::Success,
            properties: props,
        }),
        ProtocolVersion::V5,
    );
    round_trip(
        Packet::ConnAck(ConnAck {
            session_present: false,
            reason_code: ReasonCode::Success,
            properties: Properties::default(),
        }),
        ProtocolVersion::V311,
    );
}

#[test]
fn connack_v3_maps_reason_to_return_code() {
    let encoded = encode_packet(
        &Packet::ConnAck(ConnAck {
            session_present: false,
            reason_code: ReasonCode::NotAuthorized,
            properties: Properties::default(),
        }),
        ProtocolVersion::V311,
    );
    assert_eq!(&encoded[..], &[0x20, 0x02, 0x00, 0x05]);
}

// ---------------------------------------------------------------------------
// PUBLISH and acknowledgements
// ---------------------------------------------------------------------------

#[test]
fn publish_round_trips() {
    for version in [ProtocolVersion::V311, ProtocolVersion::V5] {
        round_trip(
            Packet::Publish(Publish {
                dup: false,
                qos: QoS::AtMostOnce,
                retain: false,
                topic: Arc::from("a/b"),
                packet_id: None,
                payload: Bytes::from_static(b"hello"),
                properties: Properties::default(),
            }),
            version,
        );
        round_trip(
            Packet::Publish(Publish {
                dup: true,
                qos: QoS::ExactlyOnce,
                retain: true,
                topic: Arc::from("a/b/c"),
                packet_id: Some(4242),
                payload: Bytes::new(),
                properties: Properties::default(),
            }),
            version,
        );
    }
}

#[test]
fn publish_v5_carries_properties() {
    let mut props = Properties::default();
    props.payload_format_indicator = Some(1);
    props.message_expiry_interval = Some(120);
    props.topic_alias = Some(3);
    props.response_topic = Some("reply/here".to_string());
    props.correlation_data = Some(Bytes::from_static(b"\x01\x02"));
    props.subscription_identifiers = vec![1, 268_435_455];

    round_trip(
        Packet::Publish(Publish {
            dup: false,
            qos: QoS::AtLeastOnce,
            retain: false,
            topic: Arc::from("sensors/1"),
            packet_id: Some(7),
            payload: Bytes::from_static(b"21.5"),
            properties: props,
        }),
        ProtocolVersion::V5,
    );
}

#[test]
fn publish_rejects_wildcard_topic_and_zero_id() {
    // topic "a/+" in a PUBLISH
    let bytes = [0x30, 0x07, 0x00, 0x03, b'a', b'/', b'+', b'x', b'y'];
    assert!(matches!(
        decode_packet(&bytes, Some(ProtocolVersion::V311)),
        Err(DecodeError::MalformedPacket(_))
    ));

    // QoS 1 with packet id 0
    let bytes = [0x32, 0x05, 0x00, 0x01, b'a', 0x00, 0x00];
    assert!(matches!(
        decode_packet(&bytes, Some(ProtocolVersion::V311)),
        Err(DecodeError::MalformedPacket(_))
    ));
}

#[test]
fn publish_rejects_dup_on_qos0() {
    let bytes = [0x38, 0x03, 0x00, 0x01, b'a'];
    assert!(matches!(
        decode_packet(&bytes, Some(ProtocolVersion::V311)),
        Err(DecodeError::MalformedPacket(_))
    ));
}

#[test]
fn acks_round_trip() {
    for version in [ProtocolVersion::V311, ProtocolVersion::V5] {
        round_trip(Packet::PubAck(PubAck::new(1)), version);
        round_trip(Packet::PubRec(PubRec::new(2)), version);
        round_trip(Packet::PubRel(PubRel::new(3)), version);
        round_trip(Packet::PubComp(PubComp::new(4)), version);
    }
}

#[test]
fn ack_reason_codes_survive_v5() {
    round_trip(
        Packet::PubAck(PubAck::with_reason(9, ReasonCode::QuotaExceeded)),
        ProtocolVersion::V5,
    );
    round_trip(
        Packet::PubRec(PubRec::with_reason(9, ReasonCode::ReceiveMaximumExceeded)),
        ProtocolVersion::V5,
    );
    round_trip(
        Packet::PubComp(PubComp::with_reason(9, ReasonCode::PacketIdentifierNotFound)),
        ProtocolVersion::V5,
    );
}

#[test]
fn success_ack_uses_short_form() {
    let encoded = encode_packet(&Packet::PubAck(PubAck::new(258)), ProtocolVersion::V5);
    assert_eq!(&encoded[..], &[0x40, 0x02, 0x01, 0x02]);
}

#[test]
fn pubrel_flags_are_mandated() {
    // PUBREL with flags 0000 is malformed
    let bytes = [0x60, 0x02, 0x00, 0x01];
    assert_eq!(
        decode_packet(&bytes, Some(ProtocolVersion::V5)),
        Err(DecodeError::InvalidFlags)
    );
}

// ---------------------------------------------------------------------------
// SUBSCRIBE family
// ---------------------------------------------------------------------------

#[test]
fn subscribe_round_trips() {
    let mut props = Properties::default();
    props.subscription_identifiers = vec![99];

    round_trip(
        Packet::Subscribe(Subscribe {
            packet_id: 11,
            filters: vec![
                SubscribeFilter {
                    filter: "a/+".to_string(),
                    options: SubscriptionOptions {
                        qos: QoS::AtLeastOnce,
                        no_local: true,
                        retain_as_published: true,
                        retain_handling: crate::protocol::RetainHandling::OnNewSubscribe,
                    },
                },
                SubscribeFilter {
                    filter: "$share/g/b/#".to_string(),
                    options: SubscriptionOptions {
                        qos: QoS::ExactlyOnce,
                        ..Default::default()
                    },
                },
            ],
            properties: props,
        }),
        ProtocolVersion::V5,
    );

    round_trip(
        Packet::Subscribe(Subscribe {
            packet_id: 12,
            filters: vec![SubscribeFilter {
                filter: "plain".to_string(),
                options: SubscriptionOptions {
                    qos: QoS::AtMostOnce,
                    ..Default::default()
                },
            }],
            properties: Properties::default(),
        }),
        ProtocolVersion::V311,
    );
}

#[test]
fn subscribe_rejects_empty_payload_and_reserved_bits() {
    // No filters at all
    let bytes = [0x82, 0x02, 0x00, 0x01];
    assert!(matches!(
        decode_packet(&bytes, Some(ProtocolVersion::V311)),
        Err(DecodeError::MalformedPacket(_))
    ));

    // v5 options byte with reserved bit set
    let bytes = [0x82, 0x07, 0x00, 0x01, 0x00, 0x00, 0x01, b'a', 0xC1];
    assert_eq!(
        decode_packet(&bytes, Some(ProtocolVersion::V5)),
        Err(DecodeError::InvalidSubscriptionOptions)
    );
}

#[test]
fn suback_round_trips() {
    round_trip(
        Packet::SubAck(SubAck {
            packet_id: 11,
            reason_codes: vec![
                ReasonCode::GrantedQos1,
                ReasonCode::TopicFilterInvalid,
                ReasonCode::SharedSubscriptionsNotSupported,
            ],
            properties: Properties::default(),
        }),
        ProtocolVersion::V5,
    );
    round_trip(
        Packet::SubAck(SubAck {
            packet_id: 12,
            reason_codes: vec![ReasonCode::Success, ReasonCode::GrantedQos2],
            properties: Properties::default(),
        }),
        ProtocolVersion::V311,
    );
}

#[test]
fn unsubscribe_round_trips() {
    round_trip(
        Packet::Unsubscribe(Unsubscribe {
            packet_id: 21,
            filters: vec!["a/+".to_string(), "$share/g/b".to_string()],
            properties: Properties::default(),
        }),
        ProtocolVersion::V5,
    );
}

#[test]
fn unsuback_round_trips() {
    round_trip(
        Packet::UnsubAck(UnsubAck {
            packet_id: 21,
            reason_codes: vec![ReasonCode::Success, ReasonCode::NoSubscriptionExisted],
            properties: Properties::default(),
        }),
        ProtocolVersion::V5,
    );
    // v3.1.1 UNSUBACK has no payload
    round_trip(
        Packet::UnsubAck(UnsubAck {
            packet_id: 22,
            reason_codes: Vec::new(),
            properties: Properties::default(),
        }),
        ProtocolVersion::V311,
    );
}

// ---------------------------------------------------------------------------
// PING / DISCONNECT / AUTH
// ---------------------------------------------------------------------------

#[test]
fn ping_round_trips() {
    for version in [ProtocolVersion::V311, ProtocolVersion::V5] {
        round_trip(Packet::PingReq, version);
        round_trip(Packet::PingResp, version);
    }
}

#[test]
fn disconnect_round_trips() {
    round_trip(Packet::Disconnect(Disconnect::default()), ProtocolVersion::V311);
    round_trip(Packet::Disconnect(Disconnect::default()), ProtocolVersion::V5);

    let mut props = Properties::default();
    props.session_expiry_interval = Some(30);
    props.server_reference = Some("other:1883".to_string());
    round_trip(
        Packet::Disconnect(Disconnect {
            reason_code: ReasonCode::ServerMoved,
            properties: props,
        }),
        ProtocolVersion::V5,
    );
}

#[test]
fn auth_round_trips_v5_only() {
    let mut props = Properties::default();
    props.authentication_method = Some("SCRAM-SHA-256".to_string());
    props.authentication_data = Some(Bytes::from_static(b"nonce"));
    round_trip(
        Packet::Auth(Auth {
            reason_code: ReasonCode::ContinueAuthentication,
            properties: props,
        }),
        ProtocolVersion::V5,
    );

    // AUTH on a v3.1.1 connection is not a legal packet type.
    let bytes = [0xF0, 0x00];
    assert_eq!(
        decode_packet(&bytes, Some(ProtocolVersion::V311)),
        Err(DecodeError::InvalidPacketType(15))
    );
}

// ---------------------------------------------------------------------------
// Variable byte integer boundaries
// ---------------------------------------------------------------------------

#[test]
fn variable_int_boundaries() {
    for (value, expected_len) in [
        (0u32, 1usize),
        (127, 1),
        (128, 2),
        (16_383, 2),
        (16_384, 3),
        (2_097_151, 3),
        (2_097_152, 4),
        (268_435_455, 4),
    ] {
        let mut buf = BytesMut::new();
        let written = write_variable_int(&mut buf, value).unwrap();
        assert_eq!(written, expected_len, "value {}", value);
        assert_eq!(variable_int_len(value), expected_len);

        let (read, consumed) = read_variable_int(&buf).unwrap();
        assert_eq!(read, value);
        assert_eq!(consumed, expected_len);
    }
}

#[test]
fn variable_int_rejects_over_maximum() {
    let mut buf = BytesMut::new();
    assert!(write_variable_int(&mut buf, MAX_REMAINING_LENGTH as u32 + 1).is_err());
}

#[test]
fn variable_int_rejects_fifth_continuation_byte() {
    assert_eq!(
        read_variable_int(&[0x80, 0x80, 0x80, 0x80, 0x01]),
        Err(DecodeError::InvalidRemainingLength)
    );
}

#[test]
fn decoder_enforces_packet_size_cap() {
    let publish = Packet::Publish(Publish {
        topic: Arc::from("t"),
        payload: Bytes::from(vec![0u8; 64]),
        ..Default::default()
    });
    let encoded = encode_packet(&publish, ProtocolVersion::V311);

    let mut decoder = Decoder::new().with_max_packet_size(16);
    decoder.set_protocol_version(ProtocolVersion::V311);
    assert_eq!(decoder.decode(&encoded), Err(DecodeError::PacketTooLarge));
}

#[test]
fn decoder_waits_for_full_packet() {
    let publish = Packet::Publish(Publish {
        topic: Arc::from("t"),
        payload: Bytes::from_static(b"payload"),
        ..Default::default()
    });
    let encoded = encode_packet(&publish, ProtocolVersion::V311);

    let mut decoder = Decoder::new();
    decoder.set_protocol_version(ProtocolVersion::V311);
    for end in 0..encoded.len() {
        assert!(decoder.decode(&encoded[..end]).unwrap().is_none());
    }
    assert!(decoder.decode(&encoded).unwrap().is_some());
}

// ---------------------------------------------------------------------------
// Property validation
// ---------------------------------------------------------------------------

/// Minimal v5 CONNECT carrying the given raw property bytes.
fn connect_v5_with_props(props: &[u8]) -> Vec<u8> {
    let mut body = vec![0x00, 0x04, b'M', b'Q', b'T', b'T', 0x05, 0x02, 0x00, 0x3C];
    body.push(props.len() as u8);
    body.extend_from_slice(props);
    body.extend_from_slice(&[0x00, 0x01, b'a']);

    let mut packet = vec![0x10, body.len() as u8];
    packet.extend(body);
    packet
}

#[test]
fn property_not_permitted_for_packet_type() {
    // Topic alias (0x23) is a PUBLISH property; in CONNECT it is malformed.
    let bytes = connect_v5_with_props(&[0x23, 0x00, 0x01]);
    assert_eq!(
        decode_packet(&bytes, None),
        Err(DecodeError::PropertyNotPermitted(0x23))
    );
}

#[test]
fn unknown_property_id_is_rejected() {
    let bytes = connect_v5_with_props(&[0x7F, 0x00]);
    assert_eq!(
        decode_packet(&bytes, None),
        Err(DecodeError::InvalidPropertyId(0x7F))
    );
}

#[test]
fn duplicate_property_is_rejected() {
    // session-expiry-interval twice
    let bytes = connect_v5_with_props(&[
        0x11, 0x00, 0x00, 0x00, 0x0A, 0x11, 0x00, 0x00, 0x00, 0x14,
    ]);
    assert_eq!(
        decode_packet(&bytes, None),
        Err(DecodeError::DuplicateProperty(0x11))
    );
}

#[test]
fn zero_receive_maximum_is_rejected() {
    let bytes = connect_v5_with_props(&[0x21, 0x00, 0x00]);
    assert!(matches!(
        decode_packet(&bytes, None),
        Err(DecodeError::MalformedPacket(_))
    ));
}

#[test]
fn repeatable_properties_preserve_order() {
    let mut props = Properties::default();
    props.user_properties = vec![
        ("a".to_string(), "1".to_string()),
        ("a".to_string(), "2".to_string()),
        ("b".to_string(), "3".to_string()),
    ];

    let mut buf = BytesMut::new();
    props.encode(&mut buf).unwrap();
    let (decoded, _) =
        Properties::decode(&buf, crate::protocol::PropertyContext::Auth).unwrap();
    assert_eq!(decoded.user_properties, props.user_properties);
}

// ---------------------------------------------------------------------------
// Outbound size cap
// ---------------------------------------------------------------------------

#[test]
fn oversized_packet_drops_reason_string_first() {
    let mut disconnect = Disconnect::with_reason(ReasonCode::NotAuthorized);
    disconnect.properties.reason_string = Some("x".repeat(200));
    let packet = Packet::Disconnect(disconnect);

    let encoder = Encoder::new(ProtocolVersion::V5);
    let mut buf = BytesMut::new();
    // Fits only once the reason string is gone.
    let outcome = encoder.encode_within(&packet, 16, &mut buf).unwrap();
    assert_eq!(outcome, EncodeOutcome::Written);

    let decoded = decode_packet(&buf, Some(ProtocolVersion::V5)).unwrap();
    match decoded {
        Packet::Disconnect(d) => {
            assert_eq!(d.reason_code, ReasonCode::NotAuthorized);
            assert!(d.properties.reason_string.is_none());
        }
        other => panic!("unexpected packet {:?}", other.kind()),
    }
}

#[test]
fn oversized_packet_drops_user_properties_second() {
    let mut disconnect = Disconnect::with_reason(ReasonCode::NotAuthorized);
    disconnect.properties.reason_string = Some("why".to_string());
    disconnect
        .properties
        .user_properties
        .push(("key".to_string(), "v".repeat(100)));
    let packet = Packet::Disconnect(disconnect);

    let encoder = Encoder::new(ProtocolVersion::V5);
    let mut buf = BytesMut::new();
    let outcome = encoder.encode_within(&packet, 16, &mut buf).unwrap();
    assert_eq!(outcome, EncodeOutcome::Written);

    match decode_packet(&buf, Some(ProtocolVersion::V5)).unwrap() {
        Packet::Disconnect(d) => {
            assert!(d.properties.reason_string.is_none());
            assert!(d.properties.user_properties.is_empty());
        }
        other => panic!("unexpected packet {:?}", other.kind()),
    }
}

#[test]
fn unshrinkable_packet_is_omitted() {
    let publish = Packet::Publish(Publish {
        topic: Arc::from("t"),
        payload: Bytes::from(vec![0u8; 128]),
        ..Default::default()
    });

    let encoder = Encoder::new(ProtocolVersion::V5);
    let mut buf = BytesMut::new();
    let outcome = encoder.encode_within(&publish, 64, &mut buf).unwrap();
    assert_eq!(outcome, EncodeOutcome::Omitted);
    assert!(buf.is_empty());
}
