//! # Core Protocol Components
//!
//! The binary encoding of OPC UA built-in types and the messages built on it.
//!
//! ## Components
//! - **Types**: built-in types (NodeId, Variant, DataValue, ...)
//! - **Encoder / Decoder**: little-endian binary codec with limits
//! - **Registry**: ExtensionObject body codecs keyed by encoding id
//! - **Messages**: Hello, Acknowledge and the secure channel services
//! - **Codec**: Tokio codec cutting chunks out of a byte stream
//!
//! ## Security
//! - Every length prefix is checked against the configured limits before allocation
//! - Recursive types are depth-limited
//! - Chunks larger than the negotiated buffer are rejected from their header

pub mod codec;
pub mod decoder;
pub mod encoder;
pub mod messages;
pub mod registry;
pub mod types;

pub use decoder::BinaryDecoder;
pub use encoder::BinaryEncoder;
pub use registry::{BinaryStruct, CodecRegistry};
