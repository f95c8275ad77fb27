#![allow(clippy::unwrap_used, clippy::expect_used)]
//! Property-based tests for the binary codec and message chunking

use bytes::Bytes;
use once_cell::sync::Lazy;
use opcua_channel::config::{ChannelConfig, EncodingLimits};
use opcua_channel::core::messages::ChannelSecurityToken;
use opcua_channel::core::types::{
    Array, BuiltinType, ByteString, DataValue, DateTime, DiagnosticInfo, ExpandedNodeId,
    ExtensionObject, ExtensionObjectBody, LocalizedText, NodeId, QualifiedName, StatusCode,
    Variant, XmlElement,
};
use opcua_channel::core::{BinaryDecoder, BinaryEncoder};
use opcua_channel::protocol::{
    ChannelParameters, ChannelRole, ChunkDecoder, ChunkEncoder, MessageSecurityMode, MessageType,
    SecureChannel, SecurityPolicy,
};
use opcua_channel::utils::crypto::{Certificate, KeyPair};
use proptest::prelude::*;
use rand_core::OsRng;
use rsa::{RsaPrivateKey, RsaPublicKey};

fn make_key_pair(tag: u8) -> KeyPair {
    let private_key = RsaPrivateKey::new(&mut OsRng, 1024).expect("RSA key generation");
    let certificate =
        Certificate::from_parts(Bytes::from(vec![tag; 64]), RsaPublicKey::from(&private_key));
    KeyPair::new(certificate, private_key)
}

static CLIENT_KEYS: Lazy<KeyPair> = Lazy::new(|| make_key_pair(0xA1));
static SERVER_KEYS: Lazy<KeyPair> = Lazy::new(|| make_key_pair(0xB2));

fn parameters(chunk_size: usize) -> ChannelParameters {
    ChannelParameters::symmetric(&ChannelConfig {
        max_chunk_size: chunk_size,
        max_message_size: 0,
        max_chunk_count: 0,
    })
}

fn unsecured_pair() -> (SecureChannel, SecureChannel) {
    let limits = EncodingLimits::default();
    (
        SecureChannel::unsecured(ChannelRole::Client, limits.clone()),
        SecureChannel::unsecured(ChannelRole::Server, limits),
    )
}

fn secured_pair() -> (SecureChannel, SecureChannel) {
    let policy = SecurityPolicy::Basic256Sha256;
    let mode = MessageSecurityMode::SignAndEncrypt;
    let limits = EncodingLimits::default();
    let client = SecureChannel::new_client(
        policy,
        mode,
        Some(CLIENT_KEYS.clone()),
        Some(SERVER_KEYS.certificate.clone()),
        limits.clone(),
    )
    .unwrap();
    let server =
        SecureChannel::new_server(policy, mode, Some(SERVER_KEYS.clone()), limits).unwrap();
    server.set_remote_certificate(CLIENT_KEYS.certificate.clone());

    client.set_remote_nonce(server.generate_local_nonce());
    server.set_remote_nonce(client.generate_local_nonce());
    let token = ChannelSecurityToken {
        channel_id: 3,
        token_id: 1,
        created_at: Default::default(),
        revised_lifetime: 60_000,
    };
    client.install_token(token.clone()).unwrap();
    server.install_token(token).unwrap();
    (client, server)
}

fn scalar_variant() -> impl Strategy<Value = Variant> {
    prop_oneof![
        Just(Variant::Empty),
        any::<bool>().prop_map(Variant::Boolean),
        any::<i8>().prop_map(Variant::SByte),
        any::<u8>().prop_map(Variant::Byte),
        any::<i16>().prop_map(Variant::Int16),
        any::<u16>().prop_map(Variant::UInt16),
        any::<i32>().prop_map(Variant::Int32),
        any::<u32>().prop_map(Variant::UInt32),
        any::<i64>().prop_map(Variant::Int64),
        any::<u64>().prop_map(Variant::UInt64),
        // NaN never compares equal to itself
        (-1.0e6f32..1.0e6).prop_map(Variant::Float),
        (-1.0e12f64..1.0e12).prop_map(Variant::Double),
        proptest::option::of(".{0,40}").prop_map(Variant::String),
        proptest::collection::vec(any::<u8>(), 0..64)
            .prop_map(|b| Variant::ByteString(ByteString::from(b))),
        any::<u128>().prop_map(|g| Variant::Guid(uuid::Uuid::from_u128(g))),
        any::<u32>().prop_map(|s| Variant::StatusCode(StatusCode(s))),
        node_id().prop_map(|n| Variant::NodeId(Box::new(n))),
    ]
}

fn node_id() -> impl Strategy<Value = NodeId> {
    prop_oneof![
        (any::<u16>(), any::<u32>()).prop_map(|(ns, id)| NodeId::numeric(ns, id)),
        (any::<u16>(), "[a-zA-Z0-9.]{0,24}").prop_map(|(ns, id)| NodeId::string(ns, &id)),
        (any::<u16>(), any::<u128>())
            .prop_map(|(ns, g)| NodeId::guid(ns, uuid::Uuid::from_u128(g))),
        (any::<u16>(), proptest::collection::vec(any::<u8>(), 0..16))
            .prop_map(|(ns, b)| NodeId::opaque(ns, b)),
    ]
}

fn int32_array() -> impl Strategy<Value = Variant> {
    proptest::collection::vec(any::<i32>(), 0..32).prop_map(|values| {
        let values = values.into_iter().map(Variant::Int32).collect();
        Variant::from(Array::new(BuiltinType::Int32, values).unwrap())
    })
}

fn xml_element() -> impl Strategy<Value = XmlElement> {
    proptest::option::of("<[a-z]{1,8}>[a-z0-9 ]{0,16}</[a-z]{1,8}>").prop_map(XmlElement)
}

fn diagnostic_record() -> impl Strategy<Value = DiagnosticInfo> {
    (
        proptest::option::of(any::<i32>()),
        proptest::option::of(any::<i32>()),
        proptest::option::of(any::<i32>()),
        proptest::option::of(any::<i32>()),
        proptest::option::of(".{0,24}"),
        proptest::option::of(any::<u32>().prop_map(StatusCode)),
    )
        .prop_map(
            |(symbolic_id, namespace_uri, localized_text, locale, additional_info, inner_status_code)| {
                DiagnosticInfo {
                    symbolic_id,
                    namespace_uri,
                    localized_text,
                    locale,
                    additional_info,
                    inner_status_code,
                    inner_diagnostic_info: None,
                }
            },
        )
}

fn diagnostic_info() -> impl Strategy<Value = DiagnosticInfo> {
    diagnostic_record().prop_recursive(3, 4, 1, |inner| {
        (diagnostic_record(), inner).prop_map(|(mut info, inner)| {
            info.inner_diagnostic_info = Some(Box::new(inner));
            info
        })
    })
}

fn data_value() -> impl Strategy<Value = DataValue> {
    (
        proptest::option::of(scalar_variant()),
        proptest::option::of(any::<u32>().prop_map(StatusCode)),
        proptest::option::of(any::<i64>().prop_map(DateTime)),
        proptest::option::of(any::<u16>()),
        proptest::option::of(any::<i64>().prop_map(DateTime)),
        proptest::option::of(any::<u16>()),
    )
        .prop_map(
            |(value, status, source_timestamp, source_picoseconds, server_timestamp, server_picoseconds)| {
                DataValue {
                    value,
                    status,
                    source_timestamp,
                    source_picoseconds,
                    server_timestamp,
                    server_picoseconds,
                }
            },
        )
}

fn extension_object() -> impl Strategy<Value = ExtensionObject> {
    let body = prop_oneof![
        Just(ExtensionObjectBody::None),
        proptest::collection::vec(any::<u8>(), 0..48)
            .prop_map(|b| ExtensionObjectBody::ByteString(Bytes::from(b))),
        xml_element().prop_map(ExtensionObjectBody::Xml),
    ];
    (node_id(), body).prop_map(|(encoding_id, body)| ExtensionObject { encoding_id, body })
}

/// Built-in types that carry their own structure on the wire.
fn structured_variant() -> impl Strategy<Value = Variant> {
    prop_oneof![
        any::<i64>().prop_map(|t| Variant::DateTime(DateTime(t))),
        xml_element().prop_map(Variant::XmlElement),
        (node_id(), proptest::option::of("[a-z]+://[a-z.]{1,16}"), any::<u32>()).prop_map(
            |(node_id, namespace_uri, server_index)| {
                Variant::ExpandedNodeId(Box::new(ExpandedNodeId {
                    node_id,
                    namespace_uri,
                    server_index,
                }))
            }
        ),
        (any::<u16>(), proptest::option::of(".{0,40}")).prop_map(|(namespace_index, name)| {
            Variant::QualifiedName(Box::new(QualifiedName {
                namespace_index,
                name,
            }))
        }),
        (proptest::option::of("[a-z]{2}(-[A-Z]{2})?"), proptest::option::of(".{0,40}"))
            .prop_map(|(locale, text)| {
                Variant::LocalizedText(Box::new(LocalizedText { locale, text }))
            }),
        extension_object().prop_map(|e| Variant::ExtensionObject(Box::new(e))),
        data_value().prop_map(|v| Variant::DataValue(Box::new(v))),
        diagnostic_info().prop_map(|d| Variant::DiagnosticInfo(Box::new(d))),
    ]
}

fn double_matrix() -> impl Strategy<Value = Variant> {
    (1usize..4, 1usize..4, 1usize..3)
        .prop_flat_map(|(rows, cols, depth)| {
            let dimensions = vec![rows as i32, cols as i32, depth as i32];
            (
                Just(dimensions),
                proptest::collection::vec(-1.0e9f64..1.0e9, rows * cols * depth),
            )
        })
        .prop_map(|(dimensions, values)| {
            let values = values.into_iter().map(Variant::Double).collect();
            Variant::from(Array::matrix(BuiltinType::Double, values, dimensions).unwrap())
        })
}

/// An array of Variant holds each element wrapped, including empty ones.
fn variant_array() -> impl Strategy<Value = Variant> {
    proptest::collection::vec(prop_oneof![scalar_variant(), structured_variant()], 0..8).prop_map(
        |values| {
            let values = values
                .into_iter()
                .map(|v| Variant::Variant(Box::new(v)))
                .collect();
            Variant::from(Array::new(BuiltinType::Variant, values).unwrap())
        },
    )
}

fn encode_variant(value: &Variant) -> Bytes {
    let mut e = BinaryEncoder::new(EncodingLimits::default());
    e.write_variant(value).unwrap();
    e.finish()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn prop_variant_round_trip(value in prop_oneof![scalar_variant(), int32_array()]) {
        let bytes = encode_variant(&value);
        let mut d = BinaryDecoder::new(bytes, EncodingLimits::default());
        let decoded = d.read_variant().unwrap();
        prop_assert_eq!(decoded, value);
        prop_assert_eq!(d.remaining(), 0);
    }

    #[test]
    fn prop_structured_variant_round_trip(
        value in prop_oneof![structured_variant(), double_matrix(), variant_array()],
    ) {
        let bytes = encode_variant(&value);
        let mut d = BinaryDecoder::new(bytes, EncodingLimits::default());
        let decoded = d.read_variant().unwrap();
        prop_assert_eq!(decoded, value);
        prop_assert_eq!(d.remaining(), 0);
    }

    #[test]
    fn prop_node_id_round_trip(value in node_id()) {
        let mut e = BinaryEncoder::new(EncodingLimits::default());
        e.write_node_id(&value).unwrap();
        let mut d = BinaryDecoder::new(e.finish(), EncodingLimits::default());
        prop_assert_eq!(d.read_node_id().unwrap(), value);
    }

    #[test]
    fn prop_decoder_never_panics_on_garbage(data in proptest::collection::vec(any::<u8>(), 0..256)) {
        let limits = EncodingLimits {
            max_array_length: 64,
            max_string_length: 256,
            ..EncodingLimits::default()
        };
        let mut d = BinaryDecoder::new(Bytes::from(data), limits);
        let _ = d.read_variant();
    }

    #[test]
    fn prop_truncated_variant_is_rejected(value in scalar_variant(), cut in 1usize..8) {
        let bytes = encode_variant(&value);
        prop_assume!(bytes.len() > cut);
        let truncated = bytes.slice(..bytes.len() - cut);
        let mut d = BinaryDecoder::new(truncated, EncodingLimits::default());
        prop_assert!(d.read_variant().is_err());
    }

    #[test]
    fn prop_unsecured_chunks_fit_and_reassemble(
        body in proptest::collection::vec(any::<u8>(), 0..40_000),
        chunk_size in 8192usize..=16384,
    ) {
        let (client, server) = unsecured_pair();
        let mut encoder = ChunkEncoder::new(parameters(chunk_size));
        let chunks = encoder
            .encode_symmetric(&client, MessageType::SecureMessage, 9, &body)
            .unwrap();

        prop_assert!(chunks.iter().all(|c| c.len() <= chunk_size));
        let (last, rest) = chunks.split_last().unwrap();
        prop_assert!(rest.iter().all(|c| c[3] == b'C'));
        prop_assert_eq!(last[3], b'F');

        let mut decoder = ChunkDecoder::new(parameters(chunk_size));
        let decoded = decoder.decode_symmetric(&server, &chunks).unwrap();
        prop_assert_eq!(decoded.request_id, 9);
        prop_assert_eq!(&decoded.body[..], &body[..]);
    }
}

proptest! {
    // RSA and AES make each case slow
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn prop_encrypted_chunks_fit_and_reassemble(
        body in proptest::collection::vec(any::<u8>(), 0..24_000),
        chunk_size in 8192usize..=12000,
    ) {
        let (client, server) = secured_pair();
        let mut encoder = ChunkEncoder::new(parameters(chunk_size));
        let chunks = encoder
            .encode_symmetric(&client, MessageType::SecureMessage, 21, &body)
            .unwrap();

        prop_assert!(chunks.iter().all(|c| c.len() <= chunk_size));
        // Ciphertext never contains the plaintext body verbatim
        if body.len() >= 64 && body.iter().any(|b| *b != body[0]) {
            let needle = &body[..64];
            prop_assert!(!chunks.iter().any(|c| c.windows(64).any(|w| w == needle)));
        }

        let mut decoder = ChunkDecoder::new(parameters(chunk_size));
        let decoded = decoder.decode_symmetric(&server, &chunks).unwrap();
        prop_assert_eq!(decoded.token_id, Some(1));
        prop_assert_eq!(&decoded.body[..], &body[..]);
    }

    #[test]
    fn prop_flipped_bit_fails_security(
        body in proptest::collection::vec(any::<u8>(), 1..4000),
        position in any::<prop::sample::Index>(),
    ) {
        let (client, server) = secured_pair();
        let mut encoder = ChunkEncoder::new(parameters(8192));
        let chunks = encoder
            .encode_symmetric(&client, MessageType::SecureMessage, 5, &body)
            .unwrap();
        prop_assert_eq!(chunks.len(), 1);

        // Flip a bit inside the protected span, after the 16 header bytes
        let mut tampered = chunks[0].to_vec();
        let index = 16 + position.index(tampered.len() - 16);
        tampered[index] ^= 0x01;

        let mut decoder = ChunkDecoder::new(parameters(8192));
        prop_assert!(decoder
            .decode_symmetric(&server, &[Bytes::from(tampered)])
            .is_err());
    }
}
