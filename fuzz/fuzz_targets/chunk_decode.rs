#![no_main]

use bytes::{Bytes, BytesMut};
use libfuzzer_sys::fuzz_target;
use opcua_channel::config::{ChannelConfig, EncodingLimits};
use opcua_channel::core::codec::ChunkCodec;
use opcua_channel::protocol::{
    ChannelParameters, ChannelRole, ChunkDecoder, ChunkType, MessageType, SecureChannel,
};
use tokio_util::codec::Decoder;

fuzz_target!(|data: &[u8]| {
    let config = ChannelConfig {
        max_chunk_size: 8192,
        max_message_size: 64 * 1024,
        max_chunk_count: 16,
    };
    let channel = SecureChannel::unsecured(ChannelRole::Client, EncodingLimits::default());
    let mut codec = ChunkCodec::new(config.max_chunk_size);
    let mut decoder = ChunkDecoder::new(ChannelParameters::symmetric(&config));

    // Reassemble whatever frames the stream yields the way a reader loop does
    let mut buffer = BytesMut::from(data);
    let mut pending: Vec<Bytes> = Vec::new();
    while let Ok(Some(frame)) = codec.decode(&mut buffer) {
        let final_chunk = frame.chunk_type != ChunkType::Continuation;
        let message_type = frame.message_type;
        pending.push(frame.bytes);
        if !final_chunk {
            continue;
        }
        let chunks = std::mem::take(&mut pending);
        let _ = match message_type {
            MessageType::OpenSecureChannel => decoder.decode_asymmetric(&channel, &chunks),
            MessageType::SecureMessage | MessageType::CloseSecureChannel => {
                decoder.decode_symmetric(&channel, &chunks)
            }
            _ => continue,
        };
    }
});
