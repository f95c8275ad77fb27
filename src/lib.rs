//! # opcua-channel
//!
//! The OPC UA secure channel message layer for clients: the binary encoding
//! of built-in types, message chunking with signing and encryption, security
//! token key derivation and a client connection that survives transport
//! failures.
//!
//! ## Layers
//! - [`core`]: built-in types, binary encoder/decoder, messages, stream framing
//! - [`protocol`]: headers, security policies, channel records, chunk encoder/decoder
//! - [`service`]: serialization queue, pending requests, client channel, state machine
//! - [`transport`]: `opc.tcp` endpoints
//! - [`utils`]: crypto primitives, logging, metrics, timeouts
//!
//! ## Example
//! ```rust,no_run
//! use opcua_channel::config::NetworkConfig;
//! use opcua_channel::service::ChannelManager;
//!
//! # async fn run() -> opcua_channel::error::Result<()> {
//! let config = NetworkConfig::from_file("channel.toml")?;
//! opcua_channel::utils::logging::init_logging(&config.logging)?;
//!
//! let manager = ChannelManager::from_config(config)?;
//! let channel = manager.connect().await?;
//! println!("open with channel id {}", channel.channel_id());
//! manager.disconnect().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod core;
pub mod error;
pub mod protocol;
pub mod service;
pub mod transport;
pub mod utils;

pub use config::NetworkConfig;
pub use error::{ProtocolError, Result};
pub use protocol::{ChunkDecoder, ChunkEncoder, SecureChannel};
pub use service::{ChannelManager, ClientChannel};
