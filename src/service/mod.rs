//! # Service Layer
//!
//! Client connection lifecycle on top of the protocol layer.
//!
//! ## Components
//! - **Queue**: ordered encode and bounded decode executors per channel
//! - **Pending**: request table with per-request timeouts
//! - **Client**: one open secure channel (bootstrap, renewal, requests, close)
//! - **Manager**: connection state machine with reconnect backoff

pub mod client;
pub mod manager;
pub mod pending;
pub mod queue;

pub use client::ClientChannel;
pub use manager::{
    ChannelConnector, ChannelManager, ConnectionState, ManagedChannel, ManagerConfig,
    UascConnector,
};
pub use pending::{PendingRequests, PendingResponse};
pub use queue::{Completion, SerializationQueue};
