//! # Cryptographic Primitives
//!
//! Thin wrappers over the RustCrypto crates used by the chunk encoder and
//! decoder:
//! - HMAC-SHA1 / HMAC-SHA256 symmetric signatures, verified in constant time
//! - P_SHA1 / P_SHA256 key derivation
//! - AES-CBC in place, without padding (chunks are pre-padded)
//! - RSA block encryption (PKCS#1 v1.5, OAEP) and signatures (PKCS#1 v1.5, PSS)
//! - X.509 certificates reduced to their DER, RSA public key and SHA-1 thumbprint

use crate::error::{constants, ProtocolError, Result};
use crate::protocol::policy::{AsymmetricEncryption, AsymmetricSignature, HashAlgorithm};
use aes::cipher::{block_padding::NoPadding, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use bytes::Bytes;
use hmac::{Hmac, Mac};
use rand_core::{OsRng, RngCore};
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey};
use rsa::traits::PublicKeyParts;
use rsa::{Oaep, Pkcs1v15Encrypt, Pkcs1v15Sign, Pss, RsaPrivateKey, RsaPublicKey};
use sha1::Sha1;
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::Path;
use x509_cert::der::{Decode, Encode};

type HmacSha1 = Hmac<Sha1>;
type HmacSha256 = Hmac<Sha256>;

/// Generate a cryptographically secure random nonce of `len` bytes.
pub fn generate_nonce(len: usize) -> Vec<u8> {
    let mut nonce = vec![0u8; len];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

/// HMAC over the concatenation of `parts`.
pub fn hmac_sign(hash: HashAlgorithm, key: &[u8], parts: &[&[u8]]) -> Result<Vec<u8>> {
    let invalid = |_| ProtocolError::SecurityChecksFailed(constants::ERR_SIGNING_FAILED.into());
    match hash {
        HashAlgorithm::Sha1 => {
            let mut mac = HmacSha1::new_from_slice(key).map_err(invalid)?;
            for part in parts {
                mac.update(part);
            }
            Ok(mac.finalize().into_bytes().to_vec())
        }
        HashAlgorithm::Sha256 => {
            let mut mac = HmacSha256::new_from_slice(key).map_err(invalid)?;
            for part in parts {
                mac.update(part);
            }
            Ok(mac.finalize().into_bytes().to_vec())
        }
    }
}

/// Constant-time HMAC verification.
pub fn hmac_verify(hash: HashAlgorithm, key: &[u8], data: &[u8], signature: &[u8]) -> bool {
    match hash {
        HashAlgorithm::Sha1 => HmacSha1::new_from_slice(key)
            .map(|mut mac| {
                mac.update(data);
                mac.verify_slice(signature).is_ok()
            })
            .unwrap_or(false),
        HashAlgorithm::Sha256 => HmacSha256::new_from_slice(key)
            .map(|mut mac| {
                mac.update(data);
                mac.verify_slice(signature).is_ok()
            })
            .unwrap_or(false),
    }
}

/// P_hash(secret, seed) expanded to `len` bytes.
///
/// `A(0) = seed`, `A(i) = HMAC(secret, A(i-1))`, and the output is
/// `HMAC(secret, A(1) + seed) || HMAC(secret, A(2) + seed) || ...`.
pub fn p_hash(hash: HashAlgorithm, secret: &[u8], seed: &[u8], len: usize) -> Result<Vec<u8>> {
    let mut output = Vec::with_capacity(len + hash.output_size());
    let mut a = hmac_sign(hash, secret, &[seed])?;
    while output.len() < len {
        output.extend_from_slice(&hmac_sign(hash, secret, &[&a, seed])?);
        a = hmac_sign(hash, secret, &[&a])?;
    }
    output.truncate(len);
    Ok(output)
}

/// AES-CBC encryption of a block-aligned buffer, in place.
pub fn aes_cbc_encrypt(key: &[u8], iv: &[u8], buf: &mut [u8]) -> Result<()> {
    let failed = || ProtocolError::SecurityChecksFailed(constants::ERR_ENCRYPTION_FAILED.into());
    let len = buf.len();
    match key.len() {
        16 => cbc::Encryptor::<aes::Aes128>::new_from_slices(key, iv)
            .map_err(|_| failed())?
            .encrypt_padded_mut::<NoPadding>(buf, len)
            .map(|_| ())
            .map_err(|_| failed()),
        32 => cbc::Encryptor::<aes::Aes256>::new_from_slices(key, iv)
            .map_err(|_| failed())?
            .encrypt_padded_mut::<NoPadding>(buf, len)
            .map(|_| ())
            .map_err(|_| failed()),
        _ => Err(failed()),
    }
}

/// AES-CBC decryption of a block-aligned buffer, in place.
pub fn aes_cbc_decrypt(key: &[u8], iv: &[u8], buf: &mut [u8]) -> Result<()> {
    let failed = || ProtocolError::SecurityChecksFailed(constants::ERR_DECRYPTION_FAILED.into());
    match key.len() {
        16 => cbc::Decryptor::<aes::Aes128>::new_from_slices(key, iv)
            .map_err(|_| failed())?
            .decrypt_padded_mut::<NoPadding>(buf)
            .map(|_| ())
            .map_err(|_| failed()),
        32 => cbc::Decryptor::<aes::Aes256>::new_from_slices(key, iv)
            .map_err(|_| failed())?
            .decrypt_padded_mut::<NoPadding>(buf)
            .map(|_| ())
            .map_err(|_| failed()),
        _ => Err(failed()),
    }
}

/// Plaintext bytes per RSA block for `key_size` byte keys.
pub fn rsa_plaintext_block_size(algorithm: AsymmetricEncryption, key_size: usize) -> usize {
    key_size.saturating_sub(algorithm.padding_overhead())
}

fn rsa_encrypt_block(
    key: &RsaPublicKey,
    algorithm: AsymmetricEncryption,
    block: &[u8],
) -> rsa::Result<Vec<u8>> {
    let mut rng = OsRng;
    match algorithm {
        AsymmetricEncryption::RsaPkcs1v15 => key.encrypt(&mut rng, Pkcs1v15Encrypt, block),
        AsymmetricEncryption::RsaOaepSha1 => key.encrypt(&mut rng, Oaep::new::<Sha1>(), block),
        AsymmetricEncryption::RsaOaepSha256 => {
            key.encrypt(&mut rng, Oaep::new::<Sha256>(), block)
        }
    }
}

/// Encrypts `plaintext` one RSA block at a time. The input length must be a
/// multiple of the plaintext block size.
pub fn rsa_encrypt_blocks(
    key: &RsaPublicKey,
    algorithm: AsymmetricEncryption,
    plaintext: &[u8],
) -> Result<Vec<u8>> {
    let block_size = rsa_plaintext_block_size(algorithm, key.size());
    if block_size == 0 || plaintext.len() % block_size != 0 {
        return Err(ProtocolError::EncodingError(format!(
            "plaintext length {} is not a multiple of block size {block_size}",
            plaintext.len()
        )));
    }
    let mut out = Vec::with_capacity(plaintext.len() / block_size * key.size());
    for block in plaintext.chunks(block_size) {
        let encrypted = rsa_encrypt_block(key, algorithm, block).map_err(|_| {
            ProtocolError::SecurityChecksFailed(constants::ERR_ENCRYPTION_FAILED.into())
        })?;
        out.extend_from_slice(&encrypted);
    }
    Ok(out)
}

/// Decrypts `ciphertext` one RSA block (key size bytes) at a time.
pub fn rsa_decrypt_blocks(
    key: &RsaPrivateKey,
    algorithm: AsymmetricEncryption,
    ciphertext: &[u8],
) -> Result<Vec<u8>> {
    let failed = || ProtocolError::SecurityChecksFailed(constants::ERR_DECRYPTION_FAILED.into());
    let block_size = key.size();
    if ciphertext.len() % block_size != 0 {
        return Err(failed());
    }
    let mut out = Vec::with_capacity(ciphertext.len());
    for block in ciphertext.chunks(block_size) {
        let decrypted = match algorithm {
            AsymmetricEncryption::RsaPkcs1v15 => key.decrypt(Pkcs1v15Encrypt, block),
            AsymmetricEncryption::RsaOaepSha1 => key.decrypt(Oaep::new::<Sha1>(), block),
            AsymmetricEncryption::RsaOaepSha256 => key.decrypt(Oaep::new::<Sha256>(), block),
        }
        .map_err(|_| failed())?;
        out.extend_from_slice(&decrypted);
    }
    Ok(out)
}

pub fn rsa_sign(key: &RsaPrivateKey, algorithm: AsymmetricSignature, data: &[u8]) -> Result<Vec<u8>> {
    let signed = match algorithm {
        AsymmetricSignature::RsaPkcs1v15Sha1 => {
            key.sign(Pkcs1v15Sign::new::<Sha1>(), &Sha1::digest(data))
        }
        AsymmetricSignature::RsaPkcs1v15Sha256 => {
            key.sign(Pkcs1v15Sign::new::<Sha256>(), &Sha256::digest(data))
        }
        AsymmetricSignature::RsaPssSha256 => {
            key.sign_with_rng(&mut OsRng, Pss::new::<Sha256>(), &Sha256::digest(data))
        }
    };
    signed.map_err(|_| ProtocolError::SecurityChecksFailed(constants::ERR_SIGNING_FAILED.into()))
}

pub fn rsa_verify(
    key: &RsaPublicKey,
    algorithm: AsymmetricSignature,
    data: &[u8],
    signature: &[u8],
) -> bool {
    let verified = match algorithm {
        AsymmetricSignature::RsaPkcs1v15Sha1 => {
            key.verify(Pkcs1v15Sign::new::<Sha1>(), &Sha1::digest(data), signature)
        }
        AsymmetricSignature::RsaPkcs1v15Sha256 => {
            key.verify(Pkcs1v15Sign::new::<Sha256>(), &Sha256::digest(data), signature)
        }
        AsymmetricSignature::RsaPssSha256 => {
            key.verify(Pss::new::<Sha256>(), &Sha256::digest(data), signature)
        }
    };
    verified.is_ok()
}

/// SHA-1 of a DER certificate, as carried in the receiver thumbprint field.
pub fn thumbprint(der: &[u8]) -> [u8; 20] {
    Sha1::digest(der).into()
}

/// An X.509 certificate with its RSA public key extracted.
#[derive(Clone, PartialEq, Eq)]
pub struct Certificate {
    der: Bytes,
    public_key: RsaPublicKey,
    thumbprint: [u8; 20],
}

impl Certificate {
    /// Parses a DER certificate and extracts its RSA subject public key.
    pub fn from_der(der: &[u8]) -> Result<Self> {
        let cert = x509_cert::Certificate::from_der(der)
            .map_err(|e| ProtocolError::CertificateInvalid(e.to_string()))?;
        let spki = cert
            .tbs_certificate
            .subject_public_key_info
            .to_der()
            .map_err(|e| ProtocolError::CertificateInvalid(e.to_string()))?;
        let public_key = RsaPublicKey::from_public_key_der(&spki)
            .map_err(|e| ProtocolError::CertificateInvalid(e.to_string()))?;
        Ok(Self::from_parts(Bytes::copy_from_slice(der), public_key))
    }

    /// A certificate whose public key has already been extracted.
    pub fn from_parts(der: Bytes, public_key: RsaPublicKey) -> Self {
        let thumbprint = thumbprint(&der);
        Certificate {
            der,
            public_key,
            thumbprint,
        }
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let der = std::fs::read(path.as_ref()).map_err(|e| {
            ProtocolError::ConfigError(format!(
                "Failed to read certificate {}: {e}",
                path.as_ref().display()
            ))
        })?;
        Self::from_der(&der)
    }

    pub fn der(&self) -> &Bytes {
        &self.der
    }

    pub fn public_key(&self) -> &RsaPublicKey {
        &self.public_key
    }

    pub fn thumbprint(&self) -> &[u8; 20] {
        &self.thumbprint
    }

    /// RSA modulus size in bytes.
    pub fn key_size(&self) -> usize {
        self.public_key.size()
    }
}

impl fmt::Debug for Certificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Certificate")
            .field("der_len", &self.der.len())
            .field("key_bits", &(self.key_size() * 8))
            .finish()
    }
}

/// The local application instance certificate and its private key.
#[derive(Clone)]
pub struct KeyPair {
    pub certificate: Certificate,
    pub private_key: RsaPrivateKey,
}

impl KeyPair {
    pub fn new(certificate: Certificate, private_key: RsaPrivateKey) -> Self {
        KeyPair {
            certificate,
            private_key,
        }
    }

    /// Loads a DER certificate and a PEM private key (PKCS#8 or PKCS#1).
    pub fn from_files<P: AsRef<Path>>(certificate: P, private_key: P) -> Result<Self> {
        let certificate = Certificate::from_file(certificate)?;
        let pem = std::fs::read_to_string(private_key.as_ref()).map_err(|e| {
            ProtocolError::ConfigError(format!(
                "Failed to read private key {}: {e}",
                private_key.as_ref().display()
            ))
        })?;
        let private_key = RsaPrivateKey::from_pkcs8_pem(&pem)
            .or_else(|_| RsaPrivateKey::from_pkcs1_pem(&pem))
            .map_err(|e| ProtocolError::ConfigError(format!("Invalid private key: {e}")))?;
        Ok(KeyPair::new(certificate, private_key))
    }

    pub fn key_size(&self) -> usize {
        self.private_key.size()
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("certificate", &self.certificate)
            .finish_non_exhaustive()
    }
}
