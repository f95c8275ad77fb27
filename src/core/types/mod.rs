//! Built-in OPC UA data types.
//!
//! Scalars map onto Rust primitives directly. The types defined here are the
//! ones that carry wire-level structure of their own: nullable byte strings,
//! 100ns timestamps, status codes, qualified names and localized text. The
//! identifier types live in [`node_id`], the self-describing containers in
//! [`variant`], [`data_value`] and [`extension_object`].

pub mod data_value;
pub mod extension_object;
pub mod node_id;
pub mod variant;

pub use data_value::{DataValue, DiagnosticInfo};
pub use extension_object::{ExtensionObject, ExtensionObjectBody};
pub use node_id::{ExpandedNodeId, Identifier, NodeId};
pub use variant::{Array, BuiltinType, Variant};

use bytes::Bytes;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// OPC UA GUIDs are plain UUIDs with a mixed-endian wire layout.
pub type Guid = uuid::Uuid;

/// A nullable sequence of bytes. `None` encodes as length `-1`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct ByteString(pub Option<Bytes>);

impl ByteString {
    pub fn null() -> Self {
        ByteString(None)
    }

    pub fn is_null(&self) -> bool {
        self.0.is_none()
    }

    /// The contents, with null treated as empty.
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_deref().unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.as_bytes().is_empty()
    }
}

impl From<Vec<u8>> for ByteString {
    fn from(v: Vec<u8>) -> Self {
        ByteString(Some(Bytes::from(v)))
    }
}

impl From<&[u8]> for ByteString {
    fn from(v: &[u8]) -> Self {
        ByteString(Some(Bytes::copy_from_slice(v)))
    }
}

impl From<Bytes> for ByteString {
    fn from(v: Bytes) -> Self {
        ByteString(Some(v))
    }
}

/// An XML fragment, carried on the wire as a UTF-8 ByteString.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct XmlElement(pub Option<String>);

impl From<&str> for XmlElement {
    fn from(s: &str) -> Self {
        XmlElement(Some(s.to_string()))
    }
}

/// Ticks between 1601-01-01 and 1970-01-01, in 100ns units.
const EPOCH_DELTA_TICKS: i64 = 116_444_736_000_000_000;

/// Timestamp as 100ns ticks since 1601-01-01 UTC.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DateTime(pub i64);

impl DateTime {
    pub const MIN: DateTime = DateTime(0);

    pub fn now() -> Self {
        let since_epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| (d.as_nanos() / 100) as i64)
            .unwrap_or(0);
        DateTime(since_epoch + EPOCH_DELTA_TICKS)
    }

    pub fn ticks(&self) -> i64 {
        self.0
    }
}

/// A 32-bit OPC UA status code. The top two bits carry the severity.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct StatusCode(pub u32);

impl StatusCode {
    pub const GOOD: StatusCode = StatusCode(0);
    pub const BAD_UNEXPECTED_ERROR: StatusCode = StatusCode(0x8001_0000);
    pub const BAD_INTERNAL_ERROR: StatusCode = StatusCode(0x8002_0000);
    pub const BAD_COMMUNICATION_ERROR: StatusCode = StatusCode(0x8005_0000);
    pub const BAD_ENCODING_ERROR: StatusCode = StatusCode(0x8006_0000);
    pub const BAD_DECODING_ERROR: StatusCode = StatusCode(0x8007_0000);
    pub const BAD_ENCODING_LIMITS_EXCEEDED: StatusCode = StatusCode(0x8008_0000);
    pub const BAD_TIMEOUT: StatusCode = StatusCode(0x800A_0000);
    pub const BAD_SERVER_NOT_CONNECTED: StatusCode = StatusCode(0x800D_0000);
    pub const BAD_CERTIFICATE_INVALID: StatusCode = StatusCode(0x8012_0000);
    pub const BAD_SECURITY_CHECKS_FAILED: StatusCode = StatusCode(0x8013_0000);
    pub const BAD_SECURE_CHANNEL_ID_INVALID: StatusCode = StatusCode(0x8022_0000);
    pub const BAD_NONCE_INVALID: StatusCode = StatusCode(0x8024_0000);
    pub const BAD_SECURITY_POLICY_REJECTED: StatusCode = StatusCode(0x8055_0000);
    pub const BAD_TCP_MESSAGE_TYPE_INVALID: StatusCode = StatusCode(0x807E_0000);
    pub const BAD_TCP_SECURE_CHANNEL_UNKNOWN: StatusCode = StatusCode(0x807F_0000);
    pub const BAD_TCP_MESSAGE_TOO_LARGE: StatusCode = StatusCode(0x8080_0000);
    pub const BAD_TCP_INTERNAL_ERROR: StatusCode = StatusCode(0x8082_0000);
    pub const BAD_TCP_ENDPOINT_URL_INVALID: StatusCode = StatusCode(0x8083_0000);
    pub const BAD_SECURE_CHANNEL_CLOSED: StatusCode = StatusCode(0x8086_0000);
    pub const BAD_SECURE_CHANNEL_TOKEN_UNKNOWN: StatusCode = StatusCode(0x8087_0000);
    pub const BAD_SEQUENCE_NUMBER_INVALID: StatusCode = StatusCode(0x8088_0000);
    pub const BAD_CONFIGURATION_ERROR: StatusCode = StatusCode(0x8089_0000);
    pub const BAD_CONNECTION_CLOSED: StatusCode = StatusCode(0x80AE_0000);
    pub const BAD_REQUEST_TOO_LARGE: StatusCode = StatusCode(0x80B8_0000);
    pub const BAD_RESPONSE_TOO_LARGE: StatusCode = StatusCode(0x80B9_0000);
    pub const BAD_PROTOCOL_VERSION_UNSUPPORTED: StatusCode = StatusCode(0x80BE_0000);

    pub fn is_good(&self) -> bool {
        self.0 & 0xC000_0000 == 0
    }

    pub fn is_bad(&self) -> bool {
        self.0 & 0x8000_0000 != 0
    }

    pub fn name(&self) -> Option<&'static str> {
        let name = match *self {
            StatusCode::GOOD => "Good",
            StatusCode::BAD_UNEXPECTED_ERROR => "Bad_UnexpectedError",
            StatusCode::BAD_INTERNAL_ERROR => "Bad_InternalError",
            StatusCode::BAD_COMMUNICATION_ERROR => "Bad_CommunicationError",
            StatusCode::BAD_ENCODING_ERROR => "Bad_EncodingError",
            StatusCode::BAD_DECODING_ERROR => "Bad_DecodingError",
            StatusCode::BAD_ENCODING_LIMITS_EXCEEDED => "Bad_EncodingLimitsExceeded",
            StatusCode::BAD_TIMEOUT => "Bad_Timeout",
            StatusCode::BAD_SERVER_NOT_CONNECTED => "Bad_ServerNotConnected",
            StatusCode::BAD_CERTIFICATE_INVALID => "Bad_CertificateInvalid",
            StatusCode::BAD_SECURITY_CHECKS_FAILED => "Bad_SecurityChecksFailed",
            StatusCode::BAD_SECURE_CHANNEL_ID_INVALID => "Bad_SecureChannelIdInvalid",
            StatusCode::BAD_NONCE_INVALID => "Bad_NonceInvalid",
            StatusCode::BAD_SECURITY_POLICY_REJECTED => "Bad_SecurityPolicyRejected",
            StatusCode::BAD_TCP_MESSAGE_TYPE_INVALID => "Bad_TcpMessageTypeInvalid",
            StatusCode::BAD_TCP_SECURE_CHANNEL_UNKNOWN => "Bad_TcpSecureChannelUnknown",
            StatusCode::BAD_TCP_MESSAGE_TOO_LARGE => "Bad_TcpMessageTooLarge",
            StatusCode::BAD_TCP_INTERNAL_ERROR => "Bad_TcpInternalError",
            StatusCode::BAD_TCP_ENDPOINT_URL_INVALID => "Bad_TcpEndpointUrlInvalid",
            StatusCode::BAD_SECURE_CHANNEL_CLOSED => "Bad_SecureChannelClosed",
            StatusCode::BAD_SECURE_CHANNEL_TOKEN_UNKNOWN => "Bad_SecureChannelTokenUnknown",
            StatusCode::BAD_SEQUENCE_NUMBER_INVALID => "Bad_SequenceNumberInvalid",
            StatusCode::BAD_CONFIGURATION_ERROR => "Bad_ConfigurationError",
            StatusCode::BAD_CONNECTION_CLOSED => "Bad_ConnectionClosed",
            StatusCode::BAD_REQUEST_TOO_LARGE => "Bad_RequestTooLarge",
            StatusCode::BAD_RESPONSE_TOO_LARGE => "Bad_ResponseTooLarge",
            StatusCode::BAD_PROTOCOL_VERSION_UNSUPPORTED => "Bad_ProtocolVersionUnsupported",
            _ => return None,
        };
        Some(name)
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{name} (0x{:08X})", self.0),
            None => write!(f, "0x{:08X}", self.0),
        }
    }
}

impl fmt::Debug for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StatusCode({self})")
    }
}

/// A name qualified by a namespace index.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct QualifiedName {
    pub namespace_index: u16,
    pub name: Option<String>,
}

impl QualifiedName {
    /// Names longer than this are decoded as null.
    pub const MAX_NAME_LENGTH: usize = 512;

    pub fn new(namespace_index: u16, name: &str) -> Self {
        QualifiedName {
            namespace_index,
            name: Some(name.to_string()),
        }
    }
}

/// Human readable text with an optional locale.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct LocalizedText {
    pub locale: Option<String>,
    pub text: Option<String>,
}

impl LocalizedText {
    pub fn new(locale: &str, text: &str) -> Self {
        LocalizedText {
            locale: Some(locale.to_string()),
            text: Some(text.to_string()),
        }
    }

    pub fn text(text: &str) -> Self {
        LocalizedText {
            locale: None,
            text: Some(text.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_code_severity() {
        assert!(StatusCode::GOOD.is_good());
        assert!(StatusCode::BAD_TIMEOUT.is_bad());
        assert!(!StatusCode::BAD_TIMEOUT.is_good());
    }

    #[test]
    fn test_status_code_display() {
        assert_eq!(
            StatusCode::BAD_SEQUENCE_NUMBER_INVALID.to_string(),
            "Bad_SequenceNumberInvalid (0x80880000)"
        );
        assert_eq!(StatusCode(0x8123_0000).to_string(), "0x81230000");
    }

    #[test]
    fn test_datetime_now_after_unix_epoch() {
        assert!(DateTime::now().ticks() > EPOCH_DELTA_TICKS);
    }

    #[test]
    fn test_null_byte_string_is_empty() {
        let b = ByteString::null();
        assert!(b.is_null());
        assert!(b.is_empty());
        assert_eq!(b.as_bytes(), &[] as &[u8]);
    }
}
