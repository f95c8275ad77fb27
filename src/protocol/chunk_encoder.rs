//! Splits a message body into secured chunks.
//!
//! Each chunk is laid out as
//!
//! ```text
//! | message header | security header | sequence header | body | padding | signature |
//!                                    |<----------- encrypted span ------------------>|
//! ```
//!
//! The signature covers everything before it, the encrypted span starts after
//! the security header. Sizes are chosen so that the encrypted span is a whole
//! number of cipher blocks and the chunk fits the peer's receive buffer.

use crate::core::messages::encode_message;
use crate::core::registry::BinaryStruct;
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::channel::{ChannelParameters, SecureChannel};
use crate::protocol::delegate::{
    AsymmetricDelegate, Delegate, Direction, SecurityDelegate, SymmetricDelegate,
};
use crate::protocol::headers::{
    AsymmetricSecurityHeader, ChunkType, ErrorMessage, MessageHeader, MessageType,
    SequenceHeader, SymmetricSecurityHeader, SECURE_MESSAGE_HEADER_SIZE, SEQUENCE_HEADER_SIZE,
    SYMMETRIC_SECURITY_HEADER_SIZE,
};
use crate::protocol::policy::SecurityPolicy;
use crate::protocol::security::SecretKeys;
use crate::utils::metrics::global_metrics;
use bytes::{BufMut, Bytes, BytesMut};
use tracing::{debug, trace};

/// Sequence numbers wrap back to 1 after this value.
pub const SEQUENCE_NUMBER_WRAP: u32 = u32::MAX - 1024;

/// Smallest sequence number a peer may continue with after a wrap.
pub const SEQUENCE_NUMBER_WRAP_LIMIT: u32 = 1024;

enum SecurityHeader {
    Asymmetric(AsymmetricSecurityHeader),
    Symmetric(SymmetricSecurityHeader),
}

impl SecurityHeader {
    fn encoded_size(&self) -> usize {
        match self {
            SecurityHeader::Asymmetric(h) => h.encoded_size(),
            SecurityHeader::Symmetric(_) => SYMMETRIC_SECURITY_HEADER_SIZE,
        }
    }
}

#[derive(Debug)]
pub struct ChunkEncoder {
    parameters: ChannelParameters,
    sequence_number: u32,
}

impl ChunkEncoder {
    pub fn new(parameters: ChannelParameters) -> Self {
        Self::with_sequence_number(parameters, 1)
    }

    /// An encoder whose next chunk carries `sequence_number`.
    pub fn with_sequence_number(parameters: ChannelParameters, sequence_number: u32) -> Self {
        ChunkEncoder {
            parameters,
            sequence_number,
        }
    }

    pub fn parameters(&self) -> &ChannelParameters {
        &self.parameters
    }

    /// The sequence number the next chunk will carry.
    pub fn peek_sequence_number(&self) -> u32 {
        self.sequence_number
    }

    fn next_sequence_number(&mut self) -> u32 {
        let sn = self.sequence_number;
        self.sequence_number = if sn >= SEQUENCE_NUMBER_WRAP { 1 } else { sn + 1 };
        sn
    }

    /// Encodes an `OPN` message protected with the certificates' keys.
    pub fn encode_asymmetric(
        &mut self,
        channel: &SecureChannel,
        request_id: u32,
        body: &[u8],
    ) -> Result<Vec<Bytes>> {
        let header = asymmetric_header(channel);
        let delegate = Delegate::Asymmetric(AsymmetricDelegate::new(channel, Direction::Outgoing));
        self.encode_chunks(
            &delegate,
            channel,
            MessageType::OpenSecureChannel,
            &SecurityHeader::Asymmetric(header),
            request_id,
            body,
            ChunkType::Final,
        )
    }

    /// Encodes a `MSG` or `CLO` message under the current token.
    pub fn encode_symmetric(
        &mut self,
        channel: &SecureChannel,
        message_type: MessageType,
        request_id: u32,
        body: &[u8],
    ) -> Result<Vec<Bytes>> {
        self.symmetric(channel, message_type, request_id, body, ChunkType::Final)
    }

    /// Encodes an `A` chunk that aborts the message `request_id`.
    pub fn encode_abort(
        &mut self,
        channel: &SecureChannel,
        request_id: u32,
        error: &ErrorMessage,
    ) -> Result<Bytes> {
        let body = error.encode(channel.limits())?;
        let mut chunks = self.symmetric(
            channel,
            MessageType::SecureMessage,
            request_id,
            &body,
            ChunkType::Abort,
        )?;
        if chunks.len() != 1 {
            return Err(ProtocolError::EncodingLimitExceeded(
                "abort reason does not fit a single chunk".into(),
            ));
        }
        Ok(chunks.remove(0))
    }

    /// Encodes a service structure prefixed by its encoding id as a `MSG` message.
    pub fn encode_struct<T: BinaryStruct>(
        &mut self,
        channel: &SecureChannel,
        request_id: u32,
        value: &T,
    ) -> Result<Vec<Bytes>> {
        let body = encode_message(value, channel.limits())?;
        self.encode_symmetric(channel, MessageType::SecureMessage, request_id, &body)
    }

    fn symmetric(
        &mut self,
        channel: &SecureChannel,
        message_type: MessageType,
        request_id: u32,
        body: &[u8],
        final_type: ChunkType,
    ) -> Result<Vec<Bytes>> {
        let security = channel.channel_security();
        let unsecured = SecretKeys::new(Vec::new(), Vec::new(), Vec::new());
        let (token_id, keys) = match &security {
            Some(security) => (
                security.current_token().token_id,
                channel.encryption_keys(security.current_keys()),
            ),
            None if channel.policy() == SecurityPolicy::None => (0, &unsecured),
            None => {
                return Err(ProtocolError::SecurityChecksFailed(
                    constants::ERR_MISSING_KEYS.into(),
                ))
            }
        };
        let delegate = Delegate::Symmetric(SymmetricDelegate::new(channel, keys));
        self.encode_chunks(
            &delegate,
            channel,
            message_type,
            &SecurityHeader::Symmetric(SymmetricSecurityHeader { token_id }),
            request_id,
            body,
            final_type,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn encode_chunks(
        &mut self,
        delegate: &Delegate<'_>,
        channel: &SecureChannel,
        message_type: MessageType,
        security_header: &SecurityHeader,
        request_id: u32,
        body: &[u8],
        final_type: ChunkType,
    ) -> Result<Vec<Bytes>> {
        let security_header_size = security_header.encoded_size();
        let cipher_block = delegate.cipher_text_block_size();
        let plain_block = delegate.plain_text_block_size();
        let signature_size = delegate.signature_size();
        let encrypted = delegate.is_encryption_enabled();
        let signed = delegate.is_signing_enabled();
        let padding_overhead = delegate.padding_overhead();

        if cipher_block == 0 || plain_block == 0 {
            return Err(ProtocolError::EncodingError(constants::ERR_MISSING_KEYS.into()));
        }

        let max_chunk_size = self.parameters.local_send_buffer_size;
        let max_block_count =
            max_chunk_size.saturating_sub(SECURE_MESSAGE_HEADER_SIZE + security_header_size)
                / cipher_block;
        let max_body_size = (plain_block * max_block_count)
            .saturating_sub(SEQUENCE_HEADER_SIZE + signature_size + padding_overhead);
        if max_body_size == 0 {
            return Err(ProtocolError::EncodingLimitExceeded(format!(
                "send buffer of {max_chunk_size} bytes cannot hold any body"
            )));
        }

        let max_chunks = self.parameters.remote_max_chunk_count;
        let chunk_count = body.len().div_ceil(max_body_size).max(1);
        if max_chunks > 0 && chunk_count > max_chunks {
            return Err(ProtocolError::EncodingLimitExceeded(format!(
                "message needs {chunk_count} chunks, remote allows {max_chunks}"
            )));
        }

        let mut chunks = Vec::with_capacity(chunk_count);
        let mut remaining = body;
        loop {
            let body_size = remaining.len().min(max_body_size);
            let (slice, rest) = remaining.split_at(body_size);
            remaining = rest;
            let chunk_type = if remaining.is_empty() {
                final_type
            } else {
                ChunkType::Continuation
            };

            let padding_size = if encrypted {
                let unpadded = SEQUENCE_HEADER_SIZE + body_size + signature_size + padding_overhead;
                (plain_block - unpadded % plain_block) % plain_block
            } else {
                0
            };
            let plain_text_size =
                SEQUENCE_HEADER_SIZE + body_size + padding_size + padding_overhead + signature_size;
            if plain_text_size % plain_block != 0 {
                return Err(ProtocolError::EncodingError(format!(
                    "plaintext of {plain_text_size} bytes is not block aligned"
                )));
            }
            let chunk_size = SECURE_MESSAGE_HEADER_SIZE
                + security_header_size
                + (plain_text_size / plain_block) * cipher_block;

            let header = MessageHeader {
                message_type,
                chunk_type,
                message_size: u32::try_from(chunk_size).map_err(|_| {
                    ProtocolError::EncodingLimitExceeded("chunk size overflows u32".into())
                })?,
                secure_channel_id: channel.channel_id(),
            };

            let mut buf = BytesMut::with_capacity(chunk_size);
            header.write(&mut buf);
            match security_header {
                SecurityHeader::Asymmetric(h) => h.write(&mut buf, channel.limits())?,
                SecurityHeader::Symmetric(h) => h.write(&mut buf),
            }
            let encrypted_start = buf.len();

            SequenceHeader {
                sequence_number: self.next_sequence_number(),
                request_id,
            }
            .write(&mut buf);
            buf.put_slice(slice);

            if encrypted {
                write_padding(&mut buf, padding_size, padding_overhead);
            }

            if signed {
                let signature = delegate.sign(&buf)?;
                if signature.len() != signature_size {
                    return Err(ProtocolError::SecurityChecksFailed(
                        constants::ERR_SIGNING_FAILED.into(),
                    ));
                }
                buf.put_slice(&signature);
            }

            if encrypted {
                let ciphertext = delegate.encrypt(&buf[encrypted_start..])?;
                buf.truncate(encrypted_start);
                buf.put_slice(&ciphertext);
            }

            if buf.len() != chunk_size {
                return Err(ProtocolError::EncodingError(format!(
                    "chunk is {} bytes, header says {chunk_size}",
                    buf.len()
                )));
            }

            trace!(
                ?message_type,
                ?chunk_type,
                chunk_size,
                body_size,
                padding_size,
                "Encoded chunk"
            );
            global_metrics().chunk_encoded(chunk_size as u64);
            chunks.push(buf.freeze());

            if remaining.is_empty() {
                break;
            }
        }

        debug!(
            mode = ?delegate.mode(),
            request_id,
            chunks = chunks.len(),
            body_len = body.len(),
            "Encoded message"
        );
        Ok(chunks)
    }
}

/// The asymmetric security header this side sends.
pub fn asymmetric_header(channel: &SecureChannel) -> AsymmetricSecurityHeader {
    let policy = channel.policy();
    if policy == SecurityPolicy::None {
        return AsymmetricSecurityHeader {
            security_policy_uri: policy.uri(),
            ..Default::default()
        };
    }
    AsymmetricSecurityHeader {
        security_policy_uri: policy.uri(),
        sender_certificate: channel
            .local_certificate()
            .map(|c| c.der().clone().into())
            .unwrap_or_default(),
        receiver_thumbprint: channel
            .remote_certificate()
            .map(|c| c.thumbprint().as_slice().into())
            .unwrap_or_default(),
    }
}

/// The padding size byte followed by `size` copies of it. Large cipher blocks
/// append one extra byte holding the high byte of `size`.
fn write_padding(buf: &mut BytesMut, size: usize, overhead: usize) {
    buf.put_bytes((size & 0xFF) as u8, size + 1);
    if overhead == 2 {
        buf.put_u8((size >> 8) as u8);
    }
}
