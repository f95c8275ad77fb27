//! Chunk framing over a byte stream.
//!
//! Every message and chunk starts with a 3-byte type, a chunk marker and a
//! little-endian u32 total size, so frames are cut at the size field without
//! looking further.

use crate::error::{ProtocolError, Result};
use crate::protocol::headers::{ChunkType, MessageType, TRANSPORT_HEADER_SIZE};
use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::warn;

/// One complete message or chunk, header included.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub message_type: MessageType,
    pub chunk_type: ChunkType,
    pub bytes: Bytes,
}

impl Frame {
    /// The bytes after the 8-byte transport header.
    pub fn body(&self) -> Bytes {
        self.bytes.slice(TRANSPORT_HEADER_SIZE..)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ChunkCodec {
    max_chunk_size: usize,
}

impl ChunkCodec {
    pub fn new(max_chunk_size: usize) -> Self {
        ChunkCodec { max_chunk_size }
    }

    pub fn max_chunk_size(&self) -> usize {
        self.max_chunk_size
    }

    /// Applies the receive buffer size negotiated after Hello / Acknowledge.
    pub fn set_max_chunk_size(&mut self, max_chunk_size: usize) {
        self.max_chunk_size = max_chunk_size;
    }
}

impl Decoder for ChunkCodec {
    type Item = Frame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        if src.len() < TRANSPORT_HEADER_SIZE {
            return Ok(None);
        }

        let message_type = MessageType::from_code(&src[0..3])?;
        let chunk_type = ChunkType::from_marker(src[3])?;
        let size = (&src[4..8]).get_u32_le() as usize;

        if size < TRANSPORT_HEADER_SIZE {
            return Err(ProtocolError::DecodingError(format!(
                "frame size {size} is smaller than its header"
            )));
        }
        if self.max_chunk_size > 0 && size > self.max_chunk_size {
            warn!(size, max = self.max_chunk_size, "Rejecting oversized chunk");
            return Err(ProtocolError::EncodingLimitExceeded(format!(
                "chunk of {size} bytes exceeds max chunk size {}",
                self.max_chunk_size
            )));
        }

        if src.len() < size {
            src.reserve(size - src.len());
            return Ok(None);
        }

        let bytes = src.split_to(size).freeze();
        Ok(Some(Frame {
            message_type,
            chunk_type,
            bytes,
        }))
    }
}

impl Encoder<Bytes> for ChunkCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<()> {
        if self.max_chunk_size > 0 && item.len() > self.max_chunk_size {
            return Err(ProtocolError::EncodingLimitExceeded(format!(
                "chunk of {} bytes exceeds max chunk size {}",
                item.len(),
                self.max_chunk_size
            )));
        }
        dst.extend_from_slice(&item);
        Ok(())
    }
}
