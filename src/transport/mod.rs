//! # Transport Layer
//!
//! Byte-stream connections that carry OPC UA chunks.
//!
//! ## Components
//! - **TCP**: `opc.tcp://` URL parsing and connection setup with a timeout
//!
//! Chunks are cut from the stream by [`crate::core::codec::ChunkCodec`].

pub mod tcp;

pub use tcp::{connect, EndpointUrl, DEFAULT_PORT};
