//! Security policies and the algorithm suites they select.

use crate::error::{ProtocolError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Symmetric cipher block size for every AES-based policy.
pub const AES_BLOCK_SIZE: usize = 16;

/// Pseudorandom function used to derive symmetric keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyDerivation {
    PSha1,
    PSha256,
}

/// Hash function behind HMACs and RSA signatures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    Sha1,
    Sha256,
}

impl HashAlgorithm {
    pub fn output_size(self) -> usize {
        match self {
            HashAlgorithm::Sha1 => 20,
            HashAlgorithm::Sha256 => 32,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AsymmetricEncryption {
    RsaPkcs1v15,
    RsaOaepSha1,
    RsaOaepSha256,
}

impl AsymmetricEncryption {
    /// Padding overhead subtracted from the key size per plaintext block.
    pub fn padding_overhead(self) -> usize {
        match self {
            AsymmetricEncryption::RsaPkcs1v15 => 11,
            AsymmetricEncryption::RsaOaepSha1 => 42,
            AsymmetricEncryption::RsaOaepSha256 => 66,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AsymmetricSignature {
    RsaPkcs1v15Sha1,
    RsaPkcs1v15Sha256,
    RsaPssSha256,
}

/// How much protection each chunk receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageSecurityMode {
    Invalid = 0,
    None = 1,
    Sign = 2,
    SignAndEncrypt = 3,
}

impl MessageSecurityMode {
    pub fn from_i32(v: i32) -> Result<Self> {
        match v {
            0 => Ok(MessageSecurityMode::Invalid),
            1 => Ok(MessageSecurityMode::None),
            2 => Ok(MessageSecurityMode::Sign),
            3 => Ok(MessageSecurityMode::SignAndEncrypt),
            other => Err(ProtocolError::DecodingError(format!(
                "invalid MessageSecurityMode: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SecurityPolicy {
    None,
    Basic128Rsa15,
    Basic256,
    Basic256Sha256,
    #[serde(rename = "Aes128_Sha256_RsaOaep")]
    Aes128Sha256RsaOaep,
    #[serde(rename = "Aes256_Sha256_RsaPss")]
    Aes256Sha256RsaPss,
}

const URI_PREFIX: &str = "http://opcfoundation.org/UA/SecurityPolicy#";

impl SecurityPolicy {
    pub const ALL: [SecurityPolicy; 6] = [
        SecurityPolicy::None,
        SecurityPolicy::Basic128Rsa15,
        SecurityPolicy::Basic256,
        SecurityPolicy::Basic256Sha256,
        SecurityPolicy::Aes128Sha256RsaOaep,
        SecurityPolicy::Aes256Sha256RsaPss,
    ];

    pub fn name(self) -> &'static str {
        match self {
            SecurityPolicy::None => "None",
            SecurityPolicy::Basic128Rsa15 => "Basic128Rsa15",
            SecurityPolicy::Basic256 => "Basic256",
            SecurityPolicy::Basic256Sha256 => "Basic256Sha256",
            SecurityPolicy::Aes128Sha256RsaOaep => "Aes128_Sha256_RsaOaep",
            SecurityPolicy::Aes256Sha256RsaPss => "Aes256_Sha256_RsaPss",
        }
    }

    pub fn uri(self) -> String {
        format!("{URI_PREFIX}{}", self.name())
    }

    pub fn from_uri(uri: &str) -> Result<Self> {
        uri.strip_prefix(URI_PREFIX)
            .and_then(|name| Self::ALL.into_iter().find(|p| p.name() == name))
            .ok_or_else(|| ProtocolError::SecurityPolicyRejected(uri.to_string()))
    }

    pub fn key_derivation(self) -> Option<KeyDerivation> {
        match self {
            SecurityPolicy::None => None,
            SecurityPolicy::Basic128Rsa15 | SecurityPolicy::Basic256 => Some(KeyDerivation::PSha1),
            _ => Some(KeyDerivation::PSha256),
        }
    }

    /// Hash used by the symmetric signature (HMAC).
    pub fn symmetric_hash(self) -> Option<HashAlgorithm> {
        match self.key_derivation()? {
            KeyDerivation::PSha1 => Some(HashAlgorithm::Sha1),
            KeyDerivation::PSha256 => Some(HashAlgorithm::Sha256),
        }
    }

    pub fn symmetric_signature_size(self) -> usize {
        self.symmetric_hash().map_or(0, HashAlgorithm::output_size)
    }

    pub fn symmetric_signature_key_length(self) -> usize {
        match self {
            SecurityPolicy::None => 0,
            SecurityPolicy::Basic128Rsa15 => 16,
            SecurityPolicy::Basic256 => 24,
            _ => 32,
        }
    }

    pub fn symmetric_encryption_key_length(self) -> usize {
        match self {
            SecurityPolicy::None => 0,
            SecurityPolicy::Basic128Rsa15 | SecurityPolicy::Aes128Sha256RsaOaep => 16,
            _ => 32,
        }
    }

    /// Cipher block size; 1 when the policy has no symmetric cipher.
    pub fn symmetric_block_size(self) -> usize {
        match self {
            SecurityPolicy::None => 1,
            _ => AES_BLOCK_SIZE,
        }
    }

    pub fn nonce_length(self) -> usize {
        match self {
            SecurityPolicy::None => 0,
            SecurityPolicy::Basic128Rsa15 => 16,
            _ => 32,
        }
    }

    pub fn asymmetric_encryption(self) -> Option<AsymmetricEncryption> {
        match self {
            SecurityPolicy::None => None,
            SecurityPolicy::Basic128Rsa15 => Some(AsymmetricEncryption::RsaPkcs1v15),
            SecurityPolicy::Aes256Sha256RsaPss => Some(AsymmetricEncryption::RsaOaepSha256),
            _ => Some(AsymmetricEncryption::RsaOaepSha1),
        }
    }

    pub fn asymmetric_signature(self) -> Option<AsymmetricSignature> {
        match self {
            SecurityPolicy::None => None,
            SecurityPolicy::Basic128Rsa15 | SecurityPolicy::Basic256 => {
                Some(AsymmetricSignature::RsaPkcs1v15Sha1)
            }
            SecurityPolicy::Aes256Sha256RsaPss => Some(AsymmetricSignature::RsaPssSha256),
            _ => Some(AsymmetricSignature::RsaPkcs1v15Sha256),
        }
    }
}

impl fmt::Display for SecurityPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
