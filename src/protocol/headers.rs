//! Chunk headers.
//!
//! ```text
//! 0        3   4          8              12
//! +--------+---+----------+--------------+---------------------+-----------------+
//! | type   |ct | size u32 | channel id   | security header     | sequence header |
//! +--------+---+----------+--------------+---------------------+-----------------+
//! ```
//!
//! `HEL`, `ACK` and `ERR` stop after the size field.

use crate::config::EncodingLimits;
use crate::core::decoder::BinaryDecoder;
use crate::core::encoder::BinaryEncoder;
use crate::core::types::{ByteString, StatusCode};
use crate::error::{ProtocolError, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Message type + chunk type + size.
pub const TRANSPORT_HEADER_SIZE: usize = 8;
/// Transport header + secure channel id.
pub const SECURE_MESSAGE_HEADER_SIZE: usize = 12;
pub const SYMMETRIC_SECURITY_HEADER_SIZE: usize = 4;
pub const SEQUENCE_HEADER_SIZE: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Hello,
    Acknowledge,
    Error,
    ReverseHello,
    OpenSecureChannel,
    CloseSecureChannel,
    SecureMessage,
}

impl MessageType {
    pub fn code(self) -> &'static [u8; 3] {
        match self {
            MessageType::Hello => b"HEL",
            MessageType::Acknowledge => b"ACK",
            MessageType::Error => b"ERR",
            MessageType::ReverseHello => b"RHE",
            MessageType::OpenSecureChannel => b"OPN",
            MessageType::CloseSecureChannel => b"CLO",
            MessageType::SecureMessage => b"MSG",
        }
    }

    pub fn from_code(code: &[u8]) -> Result<Self> {
        let t = match code {
            b"HEL" => MessageType::Hello,
            b"ACK" => MessageType::Acknowledge,
            b"ERR" => MessageType::Error,
            b"RHE" => MessageType::ReverseHello,
            b"OPN" => MessageType::OpenSecureChannel,
            b"CLO" => MessageType::CloseSecureChannel,
            b"MSG" => MessageType::SecureMessage,
            other => {
                return Err(ProtocolError::UnexpectedMessage(format!(
                    "unknown message type {:?}",
                    String::from_utf8_lossy(other)
                )))
            }
        };
        Ok(t)
    }

    /// Whether chunks of this type carry a secure channel id and security headers.
    pub fn is_secure(self) -> bool {
        matches!(
            self,
            MessageType::OpenSecureChannel
                | MessageType::CloseSecureChannel
                | MessageType::SecureMessage
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChunkType {
    Final,
    Continuation,
    Abort,
}

impl ChunkType {
    pub fn marker(self) -> u8 {
        match self {
            ChunkType::Final => b'F',
            ChunkType::Continuation => b'C',
            ChunkType::Abort => b'A',
        }
    }

    pub fn from_marker(marker: u8) -> Result<Self> {
        match marker {
            b'F' => Ok(ChunkType::Final),
            b'C' => Ok(ChunkType::Continuation),
            b'A' => Ok(ChunkType::Abort),
            other => Err(ProtocolError::DecodingError(format!(
                "invalid chunk type 0x{other:02X}"
            ))),
        }
    }
}

/// The fixed header at the start of every chunk of a secure message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub message_type: MessageType,
    pub chunk_type: ChunkType,
    pub message_size: u32,
    pub secure_channel_id: u32,
}

impl MessageHeader {
    pub fn write(&self, buf: &mut BytesMut) {
        buf.put_slice(self.message_type.code());
        buf.put_u8(self.chunk_type.marker());
        buf.put_u32_le(self.message_size);
        buf.put_u32_le(self.secure_channel_id);
    }

    pub fn read(buf: &mut impl Buf) -> Result<Self> {
        if buf.remaining() < SECURE_MESSAGE_HEADER_SIZE {
            return Err(ProtocolError::DecodingError(
                "chunk shorter than message header".into(),
            ));
        }
        let mut code = [0u8; 3];
        buf.copy_to_slice(&mut code);
        let message_type = MessageType::from_code(&code)?;
        let chunk_type = ChunkType::from_marker(buf.get_u8())?;
        Ok(MessageHeader {
            message_type,
            chunk_type,
            message_size: buf.get_u32_le(),
            secure_channel_id: buf.get_u32_le(),
        })
    }

    /// Reads the header without consuming `chunk`.
    pub fn peek(chunk: &[u8]) -> Result<Self> {
        let mut slice = chunk;
        Self::read(&mut slice)
    }
}

/// Security header of `OPN` chunks.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AsymmetricSecurityHeader {
    pub security_policy_uri: String,
    pub sender_certificate: ByteString,
    pub receiver_thumbprint: ByteString,
}

impl AsymmetricSecurityHeader {
    pub fn encoded_size(&self) -> usize {
        12 + self.security_policy_uri.len()
            + self.sender_certificate.len()
            + self.receiver_thumbprint.len()
    }

    pub fn write(&self, buf: &mut BytesMut, limits: &EncodingLimits) -> Result<()> {
        let mut e = BinaryEncoder::with_capacity(limits.clone(), self.encoded_size());
        e.write_string(Some(&self.security_policy_uri))?;
        e.write_byte_string(&self.sender_certificate)?;
        e.write_byte_string(&self.receiver_thumbprint)?;
        buf.put_slice(&e.finish());
        Ok(())
    }

    /// Reads the header from the front of `buf`, returning it and the bytes consumed.
    pub fn read(buf: &Bytes, limits: &EncodingLimits) -> Result<(Self, usize)> {
        let mut d = BinaryDecoder::new(buf.clone(), limits.clone());
        let header = AsymmetricSecurityHeader {
            security_policy_uri: d.read_string()?.unwrap_or_default(),
            sender_certificate: d.read_byte_string()?,
            receiver_thumbprint: d.read_byte_string()?,
        };
        let consumed = buf.len() - d.remaining();
        Ok((header, consumed))
    }
}

/// Security header of `MSG` and `CLO` chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SymmetricSecurityHeader {
    pub token_id: u32,
}

impl SymmetricSecurityHeader {
    pub fn write(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.token_id);
    }

    pub fn read(buf: &mut impl Buf) -> Result<Self> {
        if buf.remaining() < SYMMETRIC_SECURITY_HEADER_SIZE {
            return Err(ProtocolError::DecodingError(
                "chunk shorter than security header".into(),
            ));
        }
        Ok(SymmetricSecurityHeader {
            token_id: buf.get_u32_le(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequenceHeader {
    pub sequence_number: u32,
    pub request_id: u32,
}

impl SequenceHeader {
    pub fn write(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.sequence_number);
        buf.put_u32_le(self.request_id);
    }

    pub fn read(buf: &mut impl Buf) -> Result<Self> {
        if buf.remaining() < SEQUENCE_HEADER_SIZE {
            return Err(ProtocolError::DecodingError(
                "chunk shorter than sequence header".into(),
            ));
        }
        Ok(SequenceHeader {
            sequence_number: buf.get_u32_le(),
            request_id: buf.get_u32_le(),
        })
    }
}

/// An error reported by a peer: the body of an Abort chunk or an `ERR` message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorMessage {
    pub error: StatusCode,
    pub reason: Option<String>,
}

impl ErrorMessage {
    pub fn new(error: StatusCode, reason: &str) -> Self {
        ErrorMessage {
            error,
            reason: Some(reason.to_string()),
        }
    }

    pub fn from_error(error: &ProtocolError) -> Self {
        ErrorMessage::new(error.status_code(), &error.to_string())
    }

    pub fn encode(&self, limits: &EncodingLimits) -> Result<Bytes> {
        let mut e = BinaryEncoder::new(limits.clone());
        e.write_status_code(self.error);
        e.write_string(self.reason.as_deref())?;
        Ok(e.finish())
    }

    pub fn decode(body: Bytes, limits: &EncodingLimits) -> Result<Self> {
        let mut d = BinaryDecoder::new(body, limits.clone());
        Ok(ErrorMessage {
            error: d.read_status_code()?,
            reason: d.read_string()?,
        })
    }

    /// The complete `ERR` message including its transport header.
    pub fn encode_frame(&self, limits: &EncodingLimits) -> Result<Bytes> {
        let body = self.encode(limits)?;
        let mut buf = BytesMut::with_capacity(TRANSPORT_HEADER_SIZE + body.len());
        buf.put_slice(MessageType::Error.code());
        buf.put_u8(ChunkType::Final.marker());
        buf.put_u32_le((TRANSPORT_HEADER_SIZE + body.len()) as u32);
        buf.put_slice(&body);
        Ok(buf.freeze())
    }

    pub fn reason(&self) -> &str {
        self.reason.as_deref().unwrap_or("")
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_message_header_layout() {
        let header = MessageHeader {
            message_type: MessageType::SecureMessage,
            chunk_type: ChunkType::Continuation,
            message_size: 0x0102_0304,
            secure_channel_id: 9,
        };
        let mut buf = BytesMut::new();
        header.write(&mut buf);
        assert_eq!(&buf[..], b"MSGC\x04\x03\x02\x01\x09\x00\x00\x00");
        assert_eq!(MessageHeader::peek(&buf).unwrap(), header);
    }

    #[test]
    fn test_asymmetric_header_size_matches_encoding() {
        let limits = EncodingLimits::default();
        let header = AsymmetricSecurityHeader {
            security_policy_uri: "http://opcfoundation.org/UA/SecurityPolicy#None".into(),
            sender_certificate: ByteString::null(),
            receiver_thumbprint: vec![1u8; 20].into(),
        };
        let mut buf = BytesMut::new();
        header.write(&mut buf, &limits).unwrap();
        assert_eq!(buf.len(), header.encoded_size());
        let (decoded, consumed) = AsymmetricSecurityHeader::read(&buf.freeze(), &limits).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(consumed, header.encoded_size());
    }

    #[test]
    fn test_error_message_frame() {
        let limits = EncodingLimits::default();
        let msg = ErrorMessage::new(StatusCode::BAD_TCP_MESSAGE_TOO_LARGE, "too big");
        let frame = msg.encode_frame(&limits).unwrap();
        assert_eq!(&frame[0..4], b"ERRF");
        let decoded = ErrorMessage::decode(frame.slice(8..), &limits).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_unknown_chunk_type() {
        assert!(ChunkType::from_marker(b'X').is_err());
    }
}
