#![no_main]

use bytes::Bytes;
use libfuzzer_sys::fuzz_target;
use opcua_channel::config::EncodingLimits;
use opcua_channel::core::messages::{
    decode_message, Acknowledge, Hello, OpenSecureChannelResponse, ServiceFault,
};

fuzz_target!(|data: &[u8]| {
    let limits = EncodingLimits::default();
    let bytes = Bytes::copy_from_slice(data);

    let _ = Hello::decode(bytes.clone());
    let _ = Acknowledge::decode(bytes.clone());
    let _ = decode_message::<OpenSecureChannelResponse>(bytes.clone(), &limits);
    let _ = decode_message::<ServiceFault>(bytes, &limits);
});
