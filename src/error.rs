//! # Error Types
//!
//! Error handling for the secure channel message layer.
//!
//! Every variant maps onto an OPC UA status code through
//! [`ProtocolError::status_code`], which is what a peer sees when the error is
//! reported on the wire (Abort chunks, `ERR` messages, service faults).
//!
//! ## Error Categories
//! - **Encoding**: limits exceeded, malformed input, unsupported values
//! - **Security**: signature/decryption failures, sequence gaps, unknown tokens
//! - **Message**: aborts and service faults reported by the peer
//! - **Connection**: transport closed, timeouts, not connected
//! - **Configuration**: invalid settings or endpoint URLs
//!
//! Security errors are *fatal*: the channel that produced them must be closed.
//! Use [`ProtocolError::is_fatal`] to decide.
//!
//! `ProtocolError` is `Clone` so that a single failed connect attempt can be
//! handed to every caller waiting on it. I/O errors are carried behind an `Arc`
//! for that reason.
//!
//! ## Example Usage
//! ```rust
//! use opcua_channel::error::{ProtocolError, Result};
//!
//! fn check(len: usize, max: usize) -> Result<()> {
//!     if len > max {
//!         return Err(ProtocolError::EncodingLimitExceeded(format!("{len} > {max}")));
//!     }
//!     Ok(())
//! }
//!
//! let err = check(10, 5).unwrap_err();
//! assert!(!err.is_fatal());
//! ```

use crate::core::types::StatusCode;
use std::io;
use std::sync::Arc;
use thiserror::Error;

/// Error message constants to reduce allocations in error paths.
pub mod constants {
    /// Codec errors
    pub const ERR_BUFFER_UNDERFLOW: &str = "Not enough bytes remaining in buffer";
    pub const ERR_RECURSION_DEPTH: &str = "Max recursion depth exceeded";
    pub const ERR_NESTED_VARIANT: &str = "Variant cannot directly contain a Variant scalar";
    pub const ERR_INVALID_UTF8: &str = "String is not valid UTF-8";
    pub const ERR_MATRIX_DIMENSIONS: &str = "Matrix dimensions do not match element count";

    /// Chunk errors
    pub const ERR_INVALID_PADDING: &str = "Invalid padding";
    pub const ERR_SIGNATURE_INVALID: &str = "Chunk signature could not be verified";
    pub const ERR_DECRYPTION_FAILED: &str = "Chunk decryption failed";
    pub const ERR_ENCRYPTION_FAILED: &str = "Chunk encryption failed";
    pub const ERR_SIGNING_FAILED: &str = "Chunk signing failed";
    pub const ERR_NO_CHUNKS: &str = "No chunks to decode";
    pub const ERR_MISSING_KEYS: &str = "Channel has no symmetric keys installed";
    pub const ERR_MISSING_KEY_PAIR: &str = "Channel has no local key pair";
    pub const ERR_MISSING_REMOTE_CERT: &str = "Channel has no remote certificate";
    pub const ERR_THUMBPRINT_MISMATCH: &str = "Receiver certificate thumbprint mismatch";

    /// Connection errors
    pub const ERR_QUEUE_SHUTDOWN: &str = "Serialization queue is shut down";
}

// ProtocolError is the primary error type for all protocol operations
#[derive(Error, Debug, Clone)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(Arc<io::Error>),

    #[error("Encoding limits exceeded: {0}")]
    EncodingLimitExceeded(String),

    #[error("Encoding error: {0}")]
    EncodingError(String),

    #[error("Decoding error: {0}")]
    DecodingError(String),

    #[error("Security checks failed: {0}")]
    SecurityChecksFailed(String),

    #[error("Sequence number invalid: expected {expected}, received {received}")]
    SequenceNumberInvalid { expected: u32, received: u32 },

    #[error("Secure channel token unknown: {0}")]
    SecureChannelTokenUnknown(u32),

    #[error("Secure channel id invalid: expected {expected}, received {received}")]
    SecureChannelIdInvalid { expected: u32, received: u32 },

    #[error("Security policy rejected: {0}")]
    SecurityPolicyRejected(String),

    #[error("Certificate invalid: {0}")]
    CertificateInvalid(String),

    #[error("Message aborted (request {request_id}): {status} {reason}")]
    MessageAborted {
        request_id: u32,
        status: StatusCode,
        reason: String,
    },

    #[error("Remote error {status}: {reason}")]
    RemoteError { status: StatusCode, reason: String },

    #[error("Service fault: {0}")]
    ServiceFault(StatusCode),

    #[error("Request too large: {size} bytes (max {max})")]
    RequestTooLarge { size: usize, max: usize },

    #[error("Serialization queue full")]
    QueueFull,

    #[error("Unexpected message: {0}")]
    UnexpectedMessage(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Server not connected")]
    ServerNotConnected,

    #[error("Timeout occurred")]
    Timeout,

    #[error("Invalid endpoint URL: {0}")]
    InvalidEndpoint(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Custom error: {0}")]
    Custom(String),
}

impl From<io::Error> for ProtocolError {
    fn from(e: io::Error) -> Self {
        ProtocolError::Io(Arc::new(e))
    }
}

impl ProtocolError {
    /// The status code reported to a peer for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProtocolError::Io(_) => StatusCode::BAD_TCP_INTERNAL_ERROR,
            ProtocolError::EncodingLimitExceeded(_) => StatusCode::BAD_ENCODING_LIMITS_EXCEEDED,
            ProtocolError::EncodingError(_) => StatusCode::BAD_ENCODING_ERROR,
            ProtocolError::DecodingError(_) => StatusCode::BAD_DECODING_ERROR,
            ProtocolError::SecurityChecksFailed(_) => StatusCode::BAD_SECURITY_CHECKS_FAILED,
            ProtocolError::SequenceNumberInvalid { .. } => StatusCode::BAD_SEQUENCE_NUMBER_INVALID,
            ProtocolError::SecureChannelTokenUnknown(_) => {
                StatusCode::BAD_SECURE_CHANNEL_TOKEN_UNKNOWN
            }
            ProtocolError::SecureChannelIdInvalid { .. } => {
                StatusCode::BAD_SECURE_CHANNEL_ID_INVALID
            }
            ProtocolError::SecurityPolicyRejected(_) => StatusCode::BAD_SECURITY_POLICY_REJECTED,
            ProtocolError::CertificateInvalid(_) => StatusCode::BAD_CERTIFICATE_INVALID,
            ProtocolError::MessageAborted { status, .. } => *status,
            ProtocolError::RemoteError { status, .. } => *status,
            ProtocolError::ServiceFault(status) => *status,
            ProtocolError::RequestTooLarge { .. } => StatusCode::BAD_REQUEST_TOO_LARGE,
            ProtocolError::QueueFull => StatusCode::BAD_ENCODING_LIMITS_EXCEEDED,
            ProtocolError::UnexpectedMessage(_) => StatusCode::BAD_TCP_MESSAGE_TYPE_INVALID,
            ProtocolError::ConnectionClosed => StatusCode::BAD_CONNECTION_CLOSED,
            ProtocolError::ServerNotConnected => StatusCode::BAD_SERVER_NOT_CONNECTED,
            ProtocolError::Timeout => StatusCode::BAD_TIMEOUT,
            ProtocolError::InvalidEndpoint(_) => StatusCode::BAD_TCP_ENDPOINT_URL_INVALID,
            ProtocolError::ConfigError(_) => StatusCode::BAD_CONFIGURATION_ERROR,
            ProtocolError::Custom(_) => StatusCode::BAD_UNEXPECTED_ERROR,
        }
    }

    /// Whether the channel that produced this error must be closed.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ProtocolError::SecurityChecksFailed(_)
                | ProtocolError::SequenceNumberInvalid { .. }
                | ProtocolError::SecureChannelTokenUnknown(_)
                | ProtocolError::SecureChannelIdInvalid { .. }
                | ProtocolError::SecurityPolicyRejected(_)
                | ProtocolError::CertificateInvalid(_)
                | ProtocolError::RemoteError { .. }
        )
    }

    /// Whether the connection layer may retry after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProtocolError::Io(_) | ProtocolError::ConnectionClosed | ProtocolError::Timeout
        )
    }
}

/// Type alias for Results using ProtocolError
pub type Result<T> = std::result::Result<T, ProtocolError>;

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_security_errors_are_fatal() {
        assert!(ProtocolError::SecurityChecksFailed("x".into()).is_fatal());
        assert!(ProtocolError::SequenceNumberInvalid {
            expected: 2,
            received: 3
        }
        .is_fatal());
        assert!(ProtocolError::SecureChannelTokenUnknown(9).is_fatal());
        assert!(!ProtocolError::EncodingLimitExceeded("x".into()).is_fatal());
        assert!(!ProtocolError::ConnectionClosed.is_fatal());
    }

    #[test]
    fn test_abort_carries_its_status() {
        let err = ProtocolError::MessageAborted {
            request_id: 7,
            status: StatusCode::BAD_REQUEST_TOO_LARGE,
            reason: "too big".into(),
        };
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST_TOO_LARGE);
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_io_error_is_clone_and_retryable() {
        let err: ProtocolError = io::Error::new(io::ErrorKind::BrokenPipe, "gone").into();
        let copy = err.clone();
        assert!(copy.is_retryable());
        assert_eq!(copy.status_code(), StatusCode::BAD_TCP_INTERNAL_ERROR);
    }
}
