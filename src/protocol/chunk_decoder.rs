//! Reassembles and unprotects the chunks of one message.
//!
//! Every chunk is decrypted first, then its signature is checked over the
//! plaintext, then its padding is stripped and its sequence number checked.
//! The decoder keeps the last sequence number across messages, so one decoder
//! serves one channel for its whole life.

use crate::error::{constants, ProtocolError, Result};
use crate::protocol::channel::{Certificate, ChannelParameters, SecureChannel};
use crate::protocol::chunk_encoder::{SEQUENCE_NUMBER_WRAP, SEQUENCE_NUMBER_WRAP_LIMIT};
use crate::protocol::delegate::{
    AsymmetricDelegate, ChunkMode, Delegate, Direction, SecurityDelegate, SymmetricDelegate,
};
use crate::protocol::headers::{
    AsymmetricSecurityHeader, ChunkType, ErrorMessage, MessageHeader, MessageType,
    SequenceHeader, SymmetricSecurityHeader, SECURE_MESSAGE_HEADER_SIZE, SEQUENCE_HEADER_SIZE,
};
use crate::protocol::policy::SecurityPolicy;
use crate::protocol::security::{ChannelSecurity, SecretKeys};
use crate::utils::metrics::global_metrics;
use bytes::{BufMut, Bytes, BytesMut};
use std::sync::Arc;
use tracing::{debug, error, warn};

/// A reassembled message body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedMessage {
    pub message_type: MessageType,
    pub request_id: u32,
    pub body: Bytes,
    /// Token the chunks were protected with; `None` for asymmetric chunks.
    pub token_id: Option<u32>,
}

#[derive(Debug)]
pub struct ChunkDecoder {
    parameters: ChannelParameters,
    last_sequence_number: Option<u32>,
    last_request_id: u32,
}

impl ChunkDecoder {
    pub fn new(parameters: ChannelParameters) -> Self {
        ChunkDecoder {
            parameters,
            last_sequence_number: None,
            last_request_id: 0,
        }
    }

    pub fn parameters(&self) -> &ChannelParameters {
        &self.parameters
    }

    /// Request id of the most recently decoded chunk.
    pub fn last_request_id(&self) -> u32 {
        self.last_request_id
    }

    pub fn last_sequence_number(&self) -> Option<u32> {
        self.last_sequence_number
    }

    /// Decodes the chunks of an `OPN` message.
    pub fn decode_asymmetric(
        &mut self,
        channel: &SecureChannel,
        chunks: &[Bytes],
    ) -> Result<DecodedMessage> {
        self.decode(ChunkMode::Asymmetric, channel, chunks)
    }

    /// Decodes the chunks of a `MSG` or `CLO` message.
    pub fn decode_symmetric(
        &mut self,
        channel: &SecureChannel,
        chunks: &[Bytes],
    ) -> Result<DecodedMessage> {
        self.decode(ChunkMode::Symmetric, channel, chunks)
    }

    fn decode(
        &mut self,
        mode: ChunkMode,
        channel: &SecureChannel,
        chunks: &[Bytes],
    ) -> Result<DecodedMessage> {
        if chunks.is_empty() {
            return Err(ProtocolError::DecodingError(constants::ERR_NO_CHUNKS.into()));
        }
        let max_chunks = self.parameters.local_max_chunk_count;
        if max_chunks > 0 && chunks.len() > max_chunks {
            return Err(ProtocolError::EncodingLimitExceeded(format!(
                "message has {} chunks, limit is {max_chunks}",
                chunks.len()
            )));
        }

        let max_message_size = self.parameters.local_max_message_size;
        let mut body = BytesMut::new();
        let mut message_type = None;
        let mut request_id = None;
        let mut token_id = None;

        for chunk in chunks {
            let decoded = self.decode_chunk(mode, channel, chunk)?;
            match request_id {
                None => request_id = Some(decoded.request_id),
                Some(id) if id != decoded.request_id => {
                    return Err(ProtocolError::DecodingError(format!(
                        "chunk for request {} inside message for request {id}",
                        decoded.request_id
                    )));
                }
                Some(_) => {}
            }
            message_type = Some(decoded.header.message_type);
            token_id = decoded.token_id;

            if decoded.header.chunk_type == ChunkType::Abort {
                let abort = ErrorMessage::decode(decoded.body, channel.limits())?;
                warn!(
                    request_id = decoded.request_id,
                    status = %abort.error,
                    reason = abort.reason(),
                    "Message aborted by peer"
                );
                return Err(ProtocolError::MessageAborted {
                    request_id: decoded.request_id,
                    status: abort.error,
                    reason: abort.reason().to_string(),
                });
            }

            if max_message_size > 0 && body.len() + decoded.body.len() > max_message_size {
                return Err(ProtocolError::EncodingLimitExceeded(format!(
                    "message exceeds max message size {max_message_size}"
                )));
            }
            body.put_slice(&decoded.body);
        }

        let request_id = request_id.unwrap_or_default();
        debug!(
            ?mode,
            request_id,
            chunks = chunks.len(),
            body_len = body.len(),
            "Decoded message"
        );
        Ok(DecodedMessage {
            message_type: message_type.unwrap_or(MessageType::SecureMessage),
            request_id,
            body: body.freeze(),
            token_id,
        })
    }

    fn decode_chunk(
        &mut self,
        mode: ChunkMode,
        channel: &SecureChannel,
        chunk: &Bytes,
    ) -> Result<DecodedChunk> {
        let header = MessageHeader::peek(chunk)?;
        if header.message_size as usize != chunk.len() {
            return Err(ProtocolError::DecodingError(format!(
                "chunk is {} bytes, header says {}",
                chunk.len(),
                header.message_size
            )));
        }
        let max_chunk_size = self.parameters.local_receive_buffer_size;
        if max_chunk_size > 0 && chunk.len() > max_chunk_size {
            return Err(ProtocolError::EncodingLimitExceeded(format!(
                "chunk of {} bytes exceeds receive buffer {max_chunk_size}",
                chunk.len()
            )));
        }
        let expected_channel = channel.channel_id();
        if expected_channel != 0 && header.secure_channel_id != expected_channel {
            return Err(ProtocolError::SecureChannelIdInvalid {
                expected: expected_channel,
                received: header.secure_channel_id,
            });
        }

        let result = match mode {
            ChunkMode::Asymmetric => self.decode_asymmetric_chunk(channel, header, chunk),
            ChunkMode::Symmetric => self.decode_symmetric_chunk(channel, header, chunk),
        };
        match &result {
            Err(e @ ProtocolError::SecurityChecksFailed(_)) => {
                global_metrics().security_failure();
                error!(error = %e, channel_id = header.secure_channel_id, "Chunk failed security checks");
            }
            Err(e @ ProtocolError::SequenceNumberInvalid { .. }) => {
                global_metrics().sequence_error();
                error!(error = %e, channel_id = header.secure_channel_id, "Chunk out of sequence");
            }
            Ok(_) => global_metrics().chunk_decoded(chunk.len() as u64),
            Err(_) => {}
        }
        result
    }

    fn decode_asymmetric_chunk(
        &mut self,
        channel: &SecureChannel,
        header: MessageHeader,
        chunk: &Bytes,
    ) -> Result<DecodedChunk> {
        let (security_header, consumed) =
            AsymmetricSecurityHeader::read(&chunk.slice(SECURE_MESSAGE_HEADER_SIZE..), channel.limits())?;
        validate_asymmetric_header(channel, &security_header)?;

        let delegate = Delegate::Asymmetric(AsymmetricDelegate::new(channel, Direction::Incoming));
        let mut decoded =
            self.unprotect(&delegate, header, chunk, SECURE_MESSAGE_HEADER_SIZE + consumed)?;
        decoded.token_id = None;
        Ok(decoded)
    }

    fn decode_symmetric_chunk(
        &mut self,
        channel: &SecureChannel,
        header: MessageHeader,
        chunk: &Bytes,
    ) -> Result<DecodedChunk> {
        let mut rest = &chunk[SECURE_MESSAGE_HEADER_SIZE..];
        let token_id = SymmetricSecurityHeader::read(&mut rest)?.token_id;
        let security_header_end = chunk.len() - rest.len();

        let security = channel.channel_security();
        let unsecured = SecretKeys::new(Vec::new(), Vec::new(), Vec::new());
        let keys = match &security {
            Some(security) => resolve_keys(channel, security, token_id)?,
            None if channel.policy() == SecurityPolicy::None && token_id == 0 => &unsecured,
            None => return Err(ProtocolError::SecureChannelTokenUnknown(token_id)),
        };

        let delegate = Delegate::Symmetric(SymmetricDelegate::new(channel, keys));
        let mut decoded = self.unprotect(&delegate, header, chunk, security_header_end)?;
        decoded.token_id = Some(token_id);

        if let Some(security) = &security {
            if security.current_token().token_id == token_id {
                channel.retire_previous(security);
            }
        }
        Ok(decoded)
    }

    /// Decrypts, verifies and strips padding from `chunk`, whose encrypted
    /// span starts at `encrypted_start`.
    fn unprotect(
        &mut self,
        delegate: &Delegate<'_>,
        header: MessageHeader,
        chunk: &Bytes,
        encrypted_start: usize,
    ) -> Result<DecodedChunk> {
        let signature_size = delegate.signature_size();
        let cipher_block = delegate.cipher_text_block_size();

        let plain: Bytes = if delegate.is_encryption_enabled() {
            let encrypted = &chunk[encrypted_start..];
            if cipher_block == 0 || encrypted.len() % cipher_block != 0 {
                return Err(ProtocolError::SecurityChecksFailed(
                    constants::ERR_DECRYPTION_FAILED.into(),
                ));
            }
            let decrypted = delegate.decrypt(encrypted)?;
            let mut buf = BytesMut::with_capacity(encrypted_start + decrypted.len());
            buf.put_slice(&chunk[..encrypted_start]);
            buf.put_slice(&decrypted);
            buf.freeze()
        } else {
            chunk.clone()
        };

        if plain.len() < encrypted_start + SEQUENCE_HEADER_SIZE + signature_size {
            return Err(ProtocolError::DecodingError(
                constants::ERR_BUFFER_UNDERFLOW.into(),
            ));
        }
        let signed_end = plain.len() - signature_size;
        if delegate.is_signing_enabled() {
            delegate.verify(&plain[..signed_end], &plain[signed_end..])?;
        }

        let padding_size = if delegate.is_encryption_enabled() {
            padding_size(&plain[..signed_end], cipher_block)?
        } else {
            0
        };
        let body_start = encrypted_start + SEQUENCE_HEADER_SIZE;
        let body_end = signed_end
            .checked_sub(padding_size)
            .filter(|end| *end >= body_start)
            .ok_or_else(|| ProtocolError::SecurityChecksFailed(constants::ERR_INVALID_PADDING.into()))?;

        let mut seq = &plain[encrypted_start..body_start];
        let sequence = SequenceHeader::read(&mut seq)?;
        self.check_sequence_number(sequence.sequence_number)?;
        self.last_request_id = sequence.request_id;

        Ok(DecodedChunk {
            header,
            request_id: sequence.request_id,
            body: plain.slice(body_start..body_end),
            token_id: None,
        })
    }

    fn check_sequence_number(&mut self, received: u32) -> Result<()> {
        if let Some(last) = self.last_sequence_number {
            let expected = if last >= SEQUENCE_NUMBER_WRAP { 1 } else { last + 1 };
            let wrapped = last >= SEQUENCE_NUMBER_WRAP && received < SEQUENCE_NUMBER_WRAP_LIMIT;
            if received != expected && !wrapped {
                return Err(ProtocolError::SequenceNumberInvalid { expected, received });
            }
        }
        self.last_sequence_number = Some(received);
        Ok(())
    }
}

struct DecodedChunk {
    header: MessageHeader,
    request_id: u32,
    body: Bytes,
    token_id: Option<u32>,
}

/// Keys for `token_id`, falling back to the previous generation.
fn resolve_keys<'a>(
    channel: &SecureChannel,
    security: &'a Arc<ChannelSecurity>,
    token_id: u32,
) -> Result<&'a SecretKeys> {
    match security.keys_for_token(token_id) {
        Some(keys) => Ok(channel.decryption_keys(keys)),
        None => Err(ProtocolError::SecureChannelTokenUnknown(token_id)),
    }
}

/// Checks the policy URI and certificates of an incoming `OPN` chunk. A
/// server learns the client certificate here.
fn validate_asymmetric_header(
    channel: &SecureChannel,
    header: &AsymmetricSecurityHeader,
) -> Result<()> {
    let policy = SecurityPolicy::from_uri(&header.security_policy_uri)?;
    if policy != channel.policy() {
        return Err(ProtocolError::SecurityPolicyRejected(format!(
            "channel uses {}, peer sent {}",
            channel.policy(),
            header.security_policy_uri
        )));
    }
    if policy == SecurityPolicy::None {
        return Ok(());
    }

    let local = channel
        .local_certificate()
        .ok_or_else(|| ProtocolError::CertificateInvalid(constants::ERR_MISSING_KEY_PAIR.into()))?;
    if header.receiver_thumbprint.as_bytes() != &local.thumbprint()[..] {
        return Err(ProtocolError::CertificateInvalid(
            constants::ERR_THUMBPRINT_MISMATCH.into(),
        ));
    }

    if header.sender_certificate.is_empty() {
        return Err(ProtocolError::CertificateInvalid(
            constants::ERR_MISSING_REMOTE_CERT.into(),
        ));
    }
    let der = header.sender_certificate.as_bytes();
    match channel.remote_certificate() {
        Some(known) if known.der().as_ref() == der => Ok(()),
        Some(_) => Err(ProtocolError::CertificateInvalid(
            "sender certificate changed".into(),
        )),
        None => {
            channel.set_remote_certificate(Certificate::from_der(der)?);
            Ok(())
        }
    }
}

/// Padding length including its length byte(s), read from the end of the
/// signed span.
fn padding_size(signed: &[u8], cipher_block: usize) -> Result<usize> {
    let invalid = || ProtocolError::SecurityChecksFailed(constants::ERR_INVALID_PADDING.into());
    let last = signed.len().checked_sub(1).ok_or_else(invalid)?;
    if cipher_block <= 256 {
        Ok(signed[last] as usize + 1)
    } else {
        let low = *signed.get(last.checked_sub(1).ok_or_else(invalid)?).ok_or_else(invalid)?;
        Ok(u16::from_le_bytes([low, signed[last]]) as usize + 2)
    }
}
