#![no_main]

use bytes::Bytes;
use libfuzzer_sys::fuzz_target;
use opcua_channel::config::EncodingLimits;
use opcua_channel::core::BinaryDecoder;

fuzz_target!(|data: &[u8]| {
    let limits = EncodingLimits {
        max_message_size: 64 * 1024,
        max_array_length: 4096,
        max_string_length: 4096,
        max_recursion_depth: 32,
    };
    let bytes = Bytes::copy_from_slice(data);

    // Every entry point must fail cleanly on hostile input
    let _ = BinaryDecoder::new(bytes.clone(), limits.clone()).read_variant();
    let _ = BinaryDecoder::new(bytes.clone(), limits.clone()).read_data_value();
    let _ = BinaryDecoder::new(bytes.clone(), limits.clone()).read_diagnostic_info();
    let _ = BinaryDecoder::new(bytes.clone(), limits.clone()).read_expanded_node_id();
    let _ = BinaryDecoder::new(bytes, limits).read_extension_object();
});
