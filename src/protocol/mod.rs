//! # Secure Channel Protocol
//!
//! Everything between a message body and the bytes on the wire:
//!
//! - **headers**: message, security and sequence headers
//! - **policy**: security policies and their algorithm suites
//! - **security**: symmetric key derivation and token generations
//! - **channel**: per-connection security state and negotiated parameters
//! - **delegate**: asymmetric / symmetric protection primitives
//! - **chunk_encoder** / **chunk_decoder**: fragmentation, padding, signing
//!   and encryption of messages
//!
//! ## Security
//! - Chunks are decrypted before their signature is verified, in both modes
//! - Sequence numbers must increase by exactly one per chunk
//! - At most two token generations decrypt at any time

pub mod channel;
pub mod chunk_decoder;
pub mod chunk_encoder;
pub mod delegate;
pub mod headers;
pub mod policy;
pub mod security;


pub use channel::{ChannelParameters, ChannelRole, SecureChannel};
pub use chunk_decoder::{ChunkDecoder, DecodedMessage};
pub use chunk_encoder::ChunkEncoder;
pub use delegate::ChunkMode;
pub use headers::{ChunkType, ErrorMessage, MessageType};
pub use policy::{MessageSecurityMode, SecurityPolicy};
pub use security::{generate_key_pair, ChannelSecurity, SecretKeys, SecurityKeys};
