//! # Utility Modules
//!
//! Supporting utilities shared by the protocol and service layers.
//!
//! ## Components
//! - **Crypto**: HMAC, P_SHA key expansion, AES-CBC, RSA, nonces, certificates
//! - **Logging**: `tracing-subscriber` setup
//! - **Metrics**: Thread-safe observability counters
//! - **Promise**: write-once shared results for the connection state machine
//! - **Timeout**: Async timeout wrappers
//!
//! ## Security
//! - Cryptographically secure RNG (`OsRng`)
//! - Constant-time signature comparison
//! - Key material zeroed on drop (zeroize crate)

pub mod crypto;
pub mod logging;
pub mod metrics;
pub mod promise;
pub mod timeout;

pub use promise::Promise;
