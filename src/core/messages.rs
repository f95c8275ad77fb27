//! Transport and channel-level messages.
//!
//! `Hello` and `Acknowledge` travel outside any secure channel with a bare
//! 8-byte header. The OpenSecureChannel / CloseSecureChannel services and
//! `ServiceFault` travel as chunk bodies, each prefixed by the NodeId of its
//! binary encoding.

use crate::config::EncodingLimits;
use crate::core::decoder::BinaryDecoder;
use crate::core::encoder::BinaryEncoder;
use crate::core::registry::{BinaryStruct, CodecRegistry};
use crate::core::types::{
    ByteString, DateTime, DiagnosticInfo, ExtensionObject, NodeId, StatusCode,
};
use crate::error::{ProtocolError, Result};
use crate::protocol::headers::{ChunkType, MessageType, TRANSPORT_HEADER_SIZE};
use crate::protocol::policy::MessageSecurityMode;
use bytes::{BufMut, Bytes, BytesMut};

/// Protocol version advertised in Hello / Acknowledge / OpenSecureChannel.
pub const PROTOCOL_VERSION: u32 = 0;

/// Smallest receive/send buffer a peer may advertise.
pub const MIN_BUFFER_SIZE: u32 = 8192;

/// Maximum length of the endpoint URL in a Hello.
pub const MAX_ENDPOINT_URL_LENGTH: usize = 4096;

fn frame(message_type: MessageType, body: &[u8]) -> Result<Bytes> {
    let size = u32::try_from(TRANSPORT_HEADER_SIZE + body.len())
        .map_err(|_| ProtocolError::EncodingLimitExceeded("message size overflows u32".into()))?;
    let mut buf = BytesMut::with_capacity(size as usize);
    buf.put_slice(message_type.code());
    buf.put_u8(ChunkType::Final.marker());
    buf.put_u32_le(size);
    buf.put_slice(body);
    Ok(buf.freeze())
}

/// Client capabilities sent as the first message on a new connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hello {
    pub protocol_version: u32,
    pub receive_buffer_size: u32,
    pub send_buffer_size: u32,
    pub max_message_size: u32,
    pub max_chunk_count: u32,
    pub endpoint_url: String,
}

impl Hello {
    /// The complete `HEL` message including its transport header.
    pub fn encode(&self) -> Result<Bytes> {
        let limits = EncodingLimits {
            max_string_length: MAX_ENDPOINT_URL_LENGTH,
            ..EncodingLimits::default()
        };
        let mut e = BinaryEncoder::new(limits);
        e.write_u32(self.protocol_version);
        e.write_u32(self.receive_buffer_size);
        e.write_u32(self.send_buffer_size);
        e.write_u32(self.max_message_size);
        e.write_u32(self.max_chunk_count);
        e.write_string(Some(&self.endpoint_url))?;
        frame(MessageType::Hello, &e.finish())
    }

    /// Decodes the body that follows the transport header.
    pub fn decode(body: Bytes) -> Result<Self> {
        let limits = EncodingLimits {
            max_string_length: MAX_ENDPOINT_URL_LENGTH,
            ..EncodingLimits::default()
        };
        let mut d = BinaryDecoder::new(body, limits);
        Ok(Hello {
            protocol_version: d.read_u32()?,
            receive_buffer_size: d.read_u32()?,
            send_buffer_size: d.read_u32()?,
            max_message_size: d.read_u32()?,
            max_chunk_count: d.read_u32()?,
            endpoint_url: d.read_string()?.unwrap_or_default(),
        })
    }
}

/// Server reply to `Hello` carrying the revised buffer sizes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Acknowledge {
    pub protocol_version: u32,
    pub receive_buffer_size: u32,
    pub send_buffer_size: u32,
    pub max_message_size: u32,
    pub max_chunk_count: u32,
}

impl Acknowledge {
    pub fn encode(&self) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(20);
        buf.put_u32_le(self.protocol_version);
        buf.put_u32_le(self.receive_buffer_size);
        buf.put_u32_le(self.send_buffer_size);
        buf.put_u32_le(self.max_message_size);
        buf.put_u32_le(self.max_chunk_count);
        frame(MessageType::Acknowledge, &buf)
    }

    pub fn decode(body: Bytes) -> Result<Self> {
        let mut d = BinaryDecoder::new(body, EncodingLimits::default());
        let ack = Acknowledge {
            protocol_version: d.read_u32()?,
            receive_buffer_size: d.read_u32()?,
            send_buffer_size: d.read_u32()?,
            max_message_size: d.read_u32()?,
            max_chunk_count: d.read_u32()?,
        };
        if ack.receive_buffer_size < MIN_BUFFER_SIZE || ack.send_buffer_size < MIN_BUFFER_SIZE {
            return Err(ProtocolError::DecodingError(format!(
                "buffer sizes below minimum {MIN_BUFFER_SIZE}: receive={}, send={}",
                ack.receive_buffer_size, ack.send_buffer_size
            )));
        }
        Ok(ack)
    }
}

/// Header common to every service request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestHeader {
    pub authentication_token: NodeId,
    pub timestamp: DateTime,
    pub request_handle: u32,
    pub return_diagnostics: u32,
    pub audit_entry_id: Option<String>,
    pub timeout_hint: u32,
    pub additional_header: ExtensionObject,
}

impl RequestHeader {
    pub fn new(request_handle: u32, timeout_hint: u32) -> Self {
        RequestHeader {
            timestamp: DateTime::now(),
            request_handle,
            timeout_hint,
            ..Default::default()
        }
    }

    fn encode(&self, e: &mut BinaryEncoder) -> Result<()> {
        e.write_node_id(&self.authentication_token)?;
        e.write_date_time(self.timestamp);
        e.write_u32(self.request_handle);
        e.write_u32(self.return_diagnostics);
        e.write_string(self.audit_entry_id.as_deref())?;
        e.write_u32(self.timeout_hint);
        e.write_extension_object(&self.additional_header)
    }

    fn decode(d: &mut BinaryDecoder) -> Result<Self> {
        Ok(RequestHeader {
            authentication_token: d.read_node_id()?,
            timestamp: d.read_date_time()?,
            request_handle: d.read_u32()?,
            return_diagnostics: d.read_u32()?,
            audit_entry_id: d.read_string()?,
            timeout_hint: d.read_u32()?,
            additional_header: d.read_extension_object()?,
        })
    }
}

/// Header common to every service response.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResponseHeader {
    pub timestamp: DateTime,
    pub request_handle: u32,
    pub service_result: StatusCode,
    pub service_diagnostics: DiagnosticInfo,
    pub string_table: Option<Vec<Option<String>>>,
    pub additional_header: ExtensionObject,
}

impl ResponseHeader {
    pub fn new(request_handle: u32, service_result: StatusCode) -> Self {
        ResponseHeader {
            timestamp: DateTime::now(),
            request_handle,
            service_result,
            ..Default::default()
        }
    }

    fn encode(&self, e: &mut BinaryEncoder) -> Result<()> {
        e.write_date_time(self.timestamp);
        e.write_u32(self.request_handle);
        e.write_status_code(self.service_result);
        e.write_diagnostic_info(&self.service_diagnostics)?;
        e.write_array(self.string_table.as_deref(), |e, s| {
            e.write_string(s.as_deref())
        })?;
        e.write_extension_object(&self.additional_header)
    }

    fn decode(d: &mut BinaryDecoder) -> Result<Self> {
        Ok(ResponseHeader {
            timestamp: d.read_date_time()?,
            request_handle: d.read_u32()?,
            service_result: d.read_status_code()?,
            service_diagnostics: d.read_diagnostic_info()?,
            string_table: d.read_array(|d| d.read_string())?,
            additional_header: d.read_extension_object()?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityTokenRequestType {
    Issue = 0,
    Renew = 1,
}

impl SecurityTokenRequestType {
    fn from_i32(v: i32) -> Result<Self> {
        match v {
            0 => Ok(SecurityTokenRequestType::Issue),
            1 => Ok(SecurityTokenRequestType::Renew),
            other => Err(ProtocolError::DecodingError(format!(
                "invalid SecurityTokenRequestType: {other}"
            ))),
        }
    }
}

/// A server-issued security token identifying one key generation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelSecurityToken {
    pub channel_id: u32,
    pub token_id: u32,
    pub created_at: DateTime,
    /// Lifetime in milliseconds.
    pub revised_lifetime: u32,
}

impl ChannelSecurityToken {
    fn encode(&self, e: &mut BinaryEncoder) {
        e.write_u32(self.channel_id);
        e.write_u32(self.token_id);
        e.write_date_time(self.created_at);
        e.write_u32(self.revised_lifetime);
    }

    fn decode(d: &mut BinaryDecoder) -> Result<Self> {
        Ok(ChannelSecurityToken {
            channel_id: d.read_u32()?,
            token_id: d.read_u32()?,
            created_at: d.read_date_time()?,
            revised_lifetime: d.read_u32()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OpenSecureChannelRequest {
    pub request_header: RequestHeader,
    pub client_protocol_version: u32,
    pub request_type: SecurityTokenRequestType,
    pub security_mode: MessageSecurityMode,
    pub client_nonce: ByteString,
    pub requested_lifetime: u32,
}

impl BinaryStruct for OpenSecureChannelRequest {
    const ENCODING_ID: u32 = 446;

    fn encode(&self, e: &mut BinaryEncoder) -> Result<()> {
        self.request_header.encode(e)?;
        e.write_u32(self.client_protocol_version);
        e.write_i32(self.request_type as i32);
        e.write_i32(self.security_mode as i32);
        e.write_byte_string(&self.client_nonce)?;
        e.write_u32(self.requested_lifetime);
        Ok(())
    }

    fn decode(d: &mut BinaryDecoder) -> Result<Self> {
        Ok(OpenSecureChannelRequest {
            request_header: RequestHeader::decode(d)?,
            client_protocol_version: d.read_u32()?,
            request_type: SecurityTokenRequestType::from_i32(d.read_i32()?)?,
            security_mode: MessageSecurityMode::from_i32(d.read_i32()?)?,
            client_nonce: d.read_byte_string()?,
            requested_lifetime: d.read_u32()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OpenSecureChannelResponse {
    pub response_header: ResponseHeader,
    pub server_protocol_version: u32,
    pub security_token: ChannelSecurityToken,
    pub server_nonce: ByteString,
}

impl BinaryStruct for OpenSecureChannelResponse {
    const ENCODING_ID: u32 = 449;

    fn encode(&self, e: &mut BinaryEncoder) -> Result<()> {
        self.response_header.encode(e)?;
        e.write_u32(self.server_protocol_version);
        self.security_token.encode(e);
        e.write_byte_string(&self.server_nonce)
    }

    fn decode(d: &mut BinaryDecoder) -> Result<Self> {
        Ok(OpenSecureChannelResponse {
            response_header: ResponseHeader::decode(d)?,
            server_protocol_version: d.read_u32()?,
            security_token: ChannelSecurityToken::decode(d)?,
            server_nonce: d.read_byte_string()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CloseSecureChannelRequest {
    pub request_header: RequestHeader,
}

impl BinaryStruct for CloseSecureChannelRequest {
    const ENCODING_ID: u32 = 452;

    fn encode(&self, e: &mut BinaryEncoder) -> Result<()> {
        self.request_header.encode(e)
    }

    fn decode(d: &mut BinaryDecoder) -> Result<Self> {
        Ok(CloseSecureChannelRequest {
            request_header: RequestHeader::decode(d)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ServiceFault {
    pub response_header: ResponseHeader,
}

impl BinaryStruct for ServiceFault {
    const ENCODING_ID: u32 = 397;

    fn encode(&self, e: &mut BinaryEncoder) -> Result<()> {
        self.response_header.encode(e)
    }

    fn decode(d: &mut BinaryDecoder) -> Result<Self> {
        Ok(ServiceFault {
            response_header: ResponseHeader::decode(d)?,
        })
    }
}

/// A registry pre-loaded with the channel-level structures.
pub fn channel_registry() -> CodecRegistry {
    let mut registry = CodecRegistry::new();
    registry.register::<OpenSecureChannelRequest>();
    registry.register::<OpenSecureChannelResponse>();
    registry.register::<CloseSecureChannelRequest>();
    registry.register::<ServiceFault>();
    registry
}

/// Encodes a service message: encoding NodeId followed by the structure.
pub fn encode_message<T: BinaryStruct>(value: &T, limits: &EncodingLimits) -> Result<Bytes> {
    let mut e = BinaryEncoder::new(limits.clone());
    e.write_node_id(&NodeId::numeric(0, T::ENCODING_ID))?;
    value.encode(&mut e)?;
    Ok(e.finish())
}

/// Decodes a service message of type `T`. A `ServiceFault` in its place is
/// surfaced as [`ProtocolError::ServiceFault`].
pub fn decode_message<T: BinaryStruct>(body: Bytes, limits: &EncodingLimits) -> Result<T> {
    let mut d = BinaryDecoder::new(body, limits.clone());
    let encoding_id = d.read_node_id()?;
    match encoding_id.as_ns0_numeric() {
        Some(id) if id == T::ENCODING_ID => T::decode(&mut d),
        Some(id) if id == ServiceFault::ENCODING_ID => {
            let fault = ServiceFault::decode(&mut d)?;
            Err(ProtocolError::ServiceFault(
                fault.response_header.service_result,
            ))
        }
        _ => Err(ProtocolError::UnexpectedMessage(format!(
            "expected encoding id i={}, found {encoding_id}",
            T::ENCODING_ID
        ))),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_hello_frame_layout() {
        let hello = Hello {
            protocol_version: 0,
            receive_buffer_size: 65535,
            send_buffer_size: 65535,
            max_message_size: 2_097_152,
            max_chunk_count: 64,
            endpoint_url: "opc.tcp://localhost:4840".into(),
        };
        let bytes = hello.encode().unwrap();
        assert_eq!(&bytes[0..4], b"HELF");
        let size = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        assert_eq!(size as usize, bytes.len());
        assert_eq!(Hello::decode(bytes.slice(8..)).unwrap(), hello);
    }

    #[test]
    fn test_acknowledge_rejects_small_buffers() {
        let ack = Acknowledge {
            protocol_version: 0,
            receive_buffer_size: 1024,
            send_buffer_size: 65535,
            max_message_size: 0,
            max_chunk_count: 0,
        };
        let bytes = ack.encode().unwrap();
        assert!(Acknowledge::decode(bytes.slice(8..)).is_err());
    }

    #[test]
    fn test_open_request_round_trip() {
        let limits = EncodingLimits::default();
        let request = OpenSecureChannelRequest {
            request_header: RequestHeader::new(1, 10_000),
            client_protocol_version: PROTOCOL_VERSION,
            request_type: SecurityTokenRequestType::Issue,
            security_mode: MessageSecurityMode::SignAndEncrypt,
            client_nonce: vec![7u8; 32].into(),
            requested_lifetime: 3_600_000,
        };
        let bytes = encode_message(&request, &limits).unwrap();
        let decoded: OpenSecureChannelRequest = decode_message(bytes, &limits).unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn test_service_fault_surfaces_status() {
        let limits = EncodingLimits::default();
        let fault = ServiceFault {
            response_header: ResponseHeader::new(3, StatusCode::BAD_NONCE_INVALID),
        };
        let bytes = encode_message(&fault, &limits).unwrap();
        let err = decode_message::<OpenSecureChannelResponse>(bytes, &limits).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::ServiceFault(StatusCode::BAD_NONCE_INVALID)
        ));
    }
}
