//! Mode-specific security operations for the chunk encoder and decoder.
//!
//! OpenSecureChannel chunks are protected with the certificates' RSA keys
//! ([`AsymmetricDelegate`]), all other chunks with the token's derived keys
//! ([`SymmetricDelegate`]). Both implement [`SecurityDelegate`]; call sites
//! hold a [`Delegate`] and dispatch by match.

use crate::error::{constants, ProtocolError, Result};
use crate::protocol::channel::{Certificate, KeyPair, SecureChannel};
use crate::protocol::policy::SecurityPolicy;
use crate::protocol::security::SecretKeys;
use crate::utils::crypto;

/// Which security header a chunk carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkMode {
    Asymmetric,
    Symmetric,
}

/// Whether a delegate protects outgoing chunks or unprotects incoming ones.
///
/// Asymmetric block and signature sizes depend on it: outgoing chunks are
/// encrypted for the peer's key and signed with ours, incoming chunks the
/// other way round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outgoing,
    Incoming,
}

pub trait SecurityDelegate {
    fn cipher_text_block_size(&self) -> usize;
    fn plain_text_block_size(&self) -> usize;
    fn signature_size(&self) -> usize;
    fn is_signing_enabled(&self) -> bool;
    fn is_encryption_enabled(&self) -> bool;
    fn sign(&self, data: &[u8]) -> Result<Vec<u8>>;
    fn verify(&self, data: &[u8], signature: &[u8]) -> Result<()>;
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>>;
    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>>;

    /// Bytes of padding length written before the padding itself.
    fn padding_overhead(&self) -> usize {
        if !self.is_encryption_enabled() {
            0
        } else if self.cipher_text_block_size() > 256 {
            2
        } else {
            1
        }
    }
}

fn signature_invalid() -> ProtocolError {
    ProtocolError::SecurityChecksFailed(constants::ERR_SIGNATURE_INVALID.into())
}

#[derive(Debug)]
pub struct AsymmetricDelegate<'a> {
    policy: SecurityPolicy,
    key_pair: Option<&'a KeyPair>,
    remote_certificate: Option<Certificate>,
    direction: Direction,
}

impl<'a> AsymmetricDelegate<'a> {
    pub fn new(channel: &'a SecureChannel, direction: Direction) -> Self {
        AsymmetricDelegate {
            policy: channel.policy(),
            key_pair: channel.key_pair(),
            remote_certificate: channel.remote_certificate(),
            direction,
        }
    }

    fn enabled(&self) -> bool {
        self.policy != SecurityPolicy::None
    }

    fn local_key_size(&self) -> usize {
        self.key_pair.map(KeyPair::key_size).unwrap_or(0)
    }

    fn remote_key_size(&self) -> usize {
        self.remote_certificate
            .as_ref()
            .map(Certificate::key_size)
            .unwrap_or(0)
    }

    fn key_pair(&self) -> Result<&KeyPair> {
        self.key_pair
            .ok_or_else(|| ProtocolError::SecurityChecksFailed(constants::ERR_MISSING_KEY_PAIR.into()))
    }

    fn remote_certificate(&self) -> Result<&Certificate> {
        self.remote_certificate.as_ref().ok_or_else(|| {
            ProtocolError::SecurityChecksFailed(constants::ERR_MISSING_REMOTE_CERT.into())
        })
    }
}

impl SecurityDelegate for AsymmetricDelegate<'_> {
    fn cipher_text_block_size(&self) -> usize {
        if !self.enabled() {
            return 1;
        }
        match self.direction {
            Direction::Outgoing => self.remote_key_size(),
            Direction::Incoming => self.local_key_size(),
        }
    }

    fn plain_text_block_size(&self) -> usize {
        match self.policy.asymmetric_encryption() {
            Some(algorithm) => {
                crypto::rsa_plaintext_block_size(algorithm, self.cipher_text_block_size())
            }
            None => 1,
        }
    }

    fn signature_size(&self) -> usize {
        if !self.enabled() {
            return 0;
        }
        match self.direction {
            Direction::Outgoing => self.local_key_size(),
            Direction::Incoming => self.remote_key_size(),
        }
    }

    fn is_signing_enabled(&self) -> bool {
        self.enabled()
    }

    fn is_encryption_enabled(&self) -> bool {
        self.enabled()
    }

    fn sign(&self, data: &[u8]) -> Result<Vec<u8>> {
        let algorithm = self
            .policy
            .asymmetric_signature()
            .ok_or_else(|| ProtocolError::SecurityChecksFailed(constants::ERR_SIGNING_FAILED.into()))?;
        crypto::rsa_sign(&self.key_pair()?.private_key, algorithm, data)
    }

    fn verify(&self, data: &[u8], signature: &[u8]) -> Result<()> {
        let algorithm = self.policy.asymmetric_signature().ok_or_else(signature_invalid)?;
        let certificate = self.remote_certificate()?;
        if crypto::rsa_verify(certificate.public_key(), algorithm, data, signature) {
            Ok(())
        } else {
            Err(signature_invalid())
        }
    }

    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let algorithm = self.policy.asymmetric_encryption().ok_or_else(|| {
            ProtocolError::SecurityChecksFailed(constants::ERR_ENCRYPTION_FAILED.into())
        })?;
        crypto::rsa_encrypt_blocks(self.remote_certificate()?.public_key(), algorithm, plaintext)
    }

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let algorithm = self.policy.asymmetric_encryption().ok_or_else(|| {
            ProtocolError::SecurityChecksFailed(constants::ERR_DECRYPTION_FAILED.into())
        })?;
        crypto::rsa_decrypt_blocks(&self.key_pair()?.private_key, algorithm, ciphertext)
    }
}

#[derive(Debug)]
pub struct SymmetricDelegate<'a> {
    policy: SecurityPolicy,
    keys: &'a SecretKeys,
    signing: bool,
    encryption: bool,
}

impl<'a> SymmetricDelegate<'a> {
    /// `keys` must be the direction's keys: our keys when sending, the
    /// peer's when receiving.
    pub fn new(channel: &SecureChannel, keys: &'a SecretKeys) -> Self {
        SymmetricDelegate {
            policy: channel.policy(),
            keys,
            signing: channel.is_signing_enabled(),
            encryption: channel.is_encryption_enabled(),
        }
    }
}

impl SecurityDelegate for SymmetricDelegate<'_> {
    fn cipher_text_block_size(&self) -> usize {
        if self.encryption {
            self.policy.symmetric_block_size()
        } else {
            1
        }
    }

    fn plain_text_block_size(&self) -> usize {
        self.cipher_text_block_size()
    }

    fn signature_size(&self) -> usize {
        if self.signing {
            self.policy.symmetric_signature_size()
        } else {
            0
        }
    }

    fn is_signing_enabled(&self) -> bool {
        self.signing
    }

    fn is_encryption_enabled(&self) -> bool {
        self.encryption
    }

    fn sign(&self, data: &[u8]) -> Result<Vec<u8>> {
        let hash = self
            .policy
            .symmetric_hash()
            .ok_or_else(|| ProtocolError::SecurityChecksFailed(constants::ERR_SIGNING_FAILED.into()))?;
        crypto::hmac_sign(hash, self.keys.signature_key(), &[data])
    }

    fn verify(&self, data: &[u8], signature: &[u8]) -> Result<()> {
        let hash = self.policy.symmetric_hash().ok_or_else(signature_invalid)?;
        if crypto::hmac_verify(hash, self.keys.signature_key(), data, signature) {
            Ok(())
        } else {
            Err(signature_invalid())
        }
    }

    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut buf = plaintext.to_vec();
        crypto::aes_cbc_encrypt(
            self.keys.encryption_key(),
            self.keys.initialization_vector(),
            &mut buf,
        )?;
        Ok(buf)
    }

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let mut buf = ciphertext.to_vec();
        crypto::aes_cbc_decrypt(
            self.keys.encryption_key(),
            self.keys.initialization_vector(),
            &mut buf,
        )?;
        Ok(buf)
    }
}

/// Either delegate, dispatched statically.
#[derive(Debug)]
pub enum Delegate<'a> {
    Asymmetric(AsymmetricDelegate<'a>),
    Symmetric(SymmetricDelegate<'a>),
}

macro_rules! dispatch {
    ($self:ident, $d:ident => $body:expr) => {
        match $self {
            Delegate::Asymmetric($d) => $body,
            Delegate::Symmetric($d) => $body,
        }
    };
}

impl Delegate<'_> {
    pub fn mode(&self) -> ChunkMode {
        match self {
            Delegate::Asymmetric(_) => ChunkMode::Asymmetric,
            Delegate::Symmetric(_) => ChunkMode::Symmetric,
        }
    }
}

impl SecurityDelegate for Delegate<'_> {
    fn cipher_text_block_size(&self) -> usize {
        dispatch!(self, d => d.cipher_text_block_size())
    }

    fn plain_text_block_size(&self) -> usize {
        dispatch!(self, d => d.plain_text_block_size())
    }

    fn signature_size(&self) -> usize {
        dispatch!(self, d => d.signature_size())
    }

    fn is_signing_enabled(&self) -> bool {
        dispatch!(self, d => d.is_signing_enabled())
    }

    fn is_encryption_enabled(&self) -> bool {
        dispatch!(self, d => d.is_encryption_enabled())
    }

    fn sign(&self, data: &[u8]) -> Result<Vec<u8>> {
        dispatch!(self, d => d.sign(data))
    }

    fn verify(&self, data: &[u8], signature: &[u8]) -> Result<()> {
        dispatch!(self, d => d.verify(data, signature))
    }

    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        dispatch!(self, d => d.encrypt(plaintext))
    }

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        dispatch!(self, d => d.decrypt(ciphertext))
    }
}
