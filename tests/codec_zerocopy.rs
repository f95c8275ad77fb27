//! Integration tests for zero-copy chunk framing
//!
//! These tests validate that frames cut from the receive buffer share its
//! allocation, and that framing works on arbitrary read boundaries.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use bytes::{BufMut, Bytes, BytesMut};
use futures::StreamExt;
use opcua_channel::config::{ChannelConfig, EncodingLimits};
use opcua_channel::core::codec::ChunkCodec;
use opcua_channel::core::messages::Hello;
use opcua_channel::error::ProtocolError;
use opcua_channel::protocol::{
    ChannelParameters, ChannelRole, ChunkEncoder, ChunkType, MessageType, SecureChannel,
};
use tokio_util::codec::{Decoder, Encoder, FramedRead};

fn hello() -> Bytes {
    ChannelParameters::hello(&ChannelConfig::default(), "opc.tcp://localhost:4840")
        .encode()
        .expect("hello encodes")
}

fn message_chunks(len: usize, chunk_size: usize) -> Vec<Bytes> {
    let parameters = ChannelParameters::symmetric(&ChannelConfig {
        max_chunk_size: chunk_size,
        ..ChannelConfig::default()
    });
    let channel = SecureChannel::unsecured(ChannelRole::Client, EncodingLimits::default());
    let body: Vec<u8> = (0..len).map(|i| i as u8).collect();
    ChunkEncoder::new(parameters)
        .encode_symmetric(&channel, MessageType::SecureMessage, 1, &body)
        .expect("encode")
}

#[test]
fn test_decode_splits_without_copy() {
    let mut codec = ChunkCodec::new(65_535);
    let first = hello();
    let second = hello();

    let mut buffer = BytesMut::new();
    buffer.put_slice(&first);
    buffer.put_slice(&second);
    let base = buffer.as_ptr();

    let frame = codec.decode(&mut buffer).expect("decode").expect("frame");
    assert_eq!(frame.message_type, MessageType::Hello);
    assert_eq!(frame.chunk_type, ChunkType::Final);
    assert_eq!(frame.bytes, first);
    // The frame points into the receive buffer
    assert_eq!(frame.bytes.as_ptr(), base);
    assert_eq!(buffer.len(), second.len());

    let frame = codec.decode(&mut buffer).expect("decode").expect("frame");
    assert_eq!(frame.bytes.as_ptr() as usize, base as usize + first.len());
    assert!(buffer.is_empty());
    assert!(codec.decode(&mut buffer).expect("decode").is_none());
}

#[test]
fn test_body_shares_frame_memory() {
    let mut codec = ChunkCodec::new(65_535);
    let mut buffer = BytesMut::from(&hello()[..]);
    let frame = codec.decode(&mut buffer).unwrap().unwrap();

    let body = frame.body();
    assert_eq!(body.as_ptr() as usize, frame.bytes.as_ptr() as usize + 8);
    let decoded = Hello::decode(body).expect("hello body");
    assert_eq!(decoded.endpoint_url, "opc.tcp://localhost:4840");
}

#[test]
fn test_byte_at_a_time() {
    let chunks = message_chunks(20_000, 8192);
    let wire: Vec<u8> = chunks.iter().flat_map(|c| c.iter().copied()).collect();

    let mut codec = ChunkCodec::new(8192);
    let mut buffer = BytesMut::new();
    let mut frames = Vec::new();
    for byte in wire {
        buffer.put_u8(byte);
        if let Some(frame) = codec.decode(&mut buffer).expect("decode") {
            frames.push(frame);
        }
    }

    assert_eq!(frames.len(), chunks.len());
    for (frame, chunk) in frames.iter().zip(&chunks) {
        assert_eq!(&frame.bytes, chunk);
    }
    assert_eq!(frames.last().unwrap().chunk_type, ChunkType::Final);
    assert!(frames[..frames.len() - 1]
        .iter()
        .all(|f| f.chunk_type == ChunkType::Continuation));
}

#[test]
fn test_header_rejected_before_body_arrives() {
    let mut codec = ChunkCodec::new(8192);
    let mut buffer = BytesMut::new();
    buffer.put_slice(b"MSGF");
    buffer.put_u32_le(1_000_000);

    assert!(matches!(
        codec.decode(&mut buffer),
        Err(ProtocolError::EncodingLimitExceeded(_))
    ));
}

#[test]
fn test_undersized_frame_rejected() {
    let mut codec = ChunkCodec::new(8192);
    let mut buffer = BytesMut::new();
    buffer.put_slice(b"HELF");
    buffer.put_u32_le(4);

    assert!(matches!(
        codec.decode(&mut buffer),
        Err(ProtocolError::DecodingError(_))
    ));
}

#[test]
fn test_bad_chunk_marker_rejected() {
    let mut codec = ChunkCodec::new(8192);
    let mut buffer = BytesMut::new();
    buffer.put_slice(b"MSGX");
    buffer.put_u32_le(16);

    assert!(codec.decode(&mut buffer).is_err());
}

#[test]
fn test_negotiated_size_applies_to_later_frames() {
    let chunks = message_chunks(30_000, 16_384);
    let mut codec = ChunkCodec::new(65_535);
    let mut buffer = BytesMut::from(&chunks[0][..]);
    assert!(codec.decode(&mut buffer).unwrap().is_some());

    codec.set_max_chunk_size(8192);
    assert_eq!(codec.max_chunk_size(), 8192);
    let mut buffer = BytesMut::from(&chunks[1][..]);
    assert!(codec.decode(&mut buffer).is_err());
}

#[test]
fn test_encode_appends_and_checks_size() {
    let mut codec = ChunkCodec::new(8192);
    let mut dst = BytesMut::new();
    let chunk = hello();
    codec.encode(chunk.clone(), &mut dst).expect("encode");
    codec.encode(chunk.clone(), &mut dst).expect("encode");
    assert_eq!(dst.len(), chunk.len() * 2);

    let oversized = Bytes::from(vec![0u8; 9000]);
    assert!(codec.encode(oversized, &mut dst).is_err());
    assert_eq!(dst.len(), chunk.len() * 2);
}

#[tokio::test]
async fn test_framed_read_over_stream() {
    let chunks = message_chunks(50_000, 8192);
    let mut wire = Vec::new();
    wire.extend_from_slice(&hello());
    for chunk in &chunks {
        wire.extend_from_slice(chunk);
    }

    let mut reader = FramedRead::new(&wire[..], ChunkCodec::new(8192));
    let first = reader.next().await.expect("frame").expect("ok");
    assert_eq!(first.message_type, MessageType::Hello);

    let mut count = 0;
    while let Some(frame) = reader.next().await {
        let frame = frame.expect("ok");
        assert_eq!(frame.message_type, MessageType::SecureMessage);
        assert_eq!(&frame.bytes, &chunks[count]);
        count += 1;
    }
    assert_eq!(count, chunks.len());
}

#[tokio::test]
async fn test_framed_read_truncated_stream_errors() {
    let chunk = hello();
    let truncated = &chunk[..chunk.len() - 3];

    let mut reader = FramedRead::new(truncated, ChunkCodec::new(8192));
    // Bytes left over at EOF surface as an error
    assert!(matches!(reader.next().await, Some(Err(_))));
}
