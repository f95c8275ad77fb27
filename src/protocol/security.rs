//! # Channel Security
//!
//! Symmetric key derivation and the two-generation key store of a secure
//! channel.
//!
//! Keys for each direction come from the policy's pseudorandom function run
//! over the nonce pair with swapped roles:
//!
//! ```text
//! client keys = PRF(secret = server nonce, seed = client nonce)
//! server keys = PRF(secret = client nonce, seed = server nonce)
//! ```
//!
//! Each output is sliced into signing key, encryption key and IV, in that
//! order. Key material is zeroized when a generation is dropped.
//!
//! A [`ChannelSecurity`] is never mutated in place. Renewal builds a new value
//! whose previous generation is the old current one, and the channel swaps the
//! whole value in; readers holding the old value keep a consistent view.

use crate::core::messages::ChannelSecurityToken;
use crate::error::{ProtocolError, Result};
use crate::protocol::policy::{SecurityPolicy, AES_BLOCK_SIZE};
use crate::utils::crypto;
use std::fmt;
use tracing::{debug, instrument};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Key material for one direction of traffic.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SecretKeys {
    signature_key: Vec<u8>,
    encryption_key: Vec<u8>,
    initialization_vector: Vec<u8>,
}

impl SecretKeys {
    pub fn new(signature_key: Vec<u8>, encryption_key: Vec<u8>, initialization_vector: Vec<u8>) -> Self {
        SecretKeys {
            signature_key,
            encryption_key,
            initialization_vector,
        }
    }

    pub fn signature_key(&self) -> &[u8] {
        &self.signature_key
    }

    pub fn encryption_key(&self) -> &[u8] {
        &self.encryption_key
    }

    pub fn initialization_vector(&self) -> &[u8] {
        &self.initialization_vector
    }
}

impl fmt::Debug for SecretKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretKeys")
            .field("signature_key_len", &self.signature_key.len())
            .field("encryption_key_len", &self.encryption_key.len())
            .finish_non_exhaustive()
    }
}

/// Client-direction and server-direction keys of one token generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityKeys {
    pub client: SecretKeys,
    pub server: SecretKeys,
}

/// Derives both directions' keys from a nonce pair.
///
/// Deterministic for a given policy and nonce pair.
#[instrument(skip(client_nonce, server_nonce), fields(policy = %policy))]
pub fn generate_key_pair(
    policy: SecurityPolicy,
    client_nonce: &[u8],
    server_nonce: &[u8],
) -> Result<SecurityKeys> {
    let Some(hash) = policy.symmetric_hash() else {
        return Ok(SecurityKeys {
            client: SecretKeys::new(Vec::new(), Vec::new(), Vec::new()),
            server: SecretKeys::new(Vec::new(), Vec::new(), Vec::new()),
        });
    };

    let expected = policy.nonce_length();
    if client_nonce.len() < expected || server_nonce.len() < expected {
        return Err(ProtocolError::SecurityChecksFailed(format!(
            "nonce too short for {policy}: client={}, server={}, required={expected}",
            client_nonce.len(),
            server_nonce.len()
        )));
    }

    let signature_len = policy.symmetric_signature_key_length();
    let encryption_len = policy.symmetric_encryption_key_length();
    let total = signature_len + encryption_len + AES_BLOCK_SIZE;

    let slice = |material: Vec<u8>| {
        let signature_key = material[..signature_len].to_vec();
        let encryption_key = material[signature_len..signature_len + encryption_len].to_vec();
        let iv = material[signature_len + encryption_len..total].to_vec();
        SecretKeys::new(signature_key, encryption_key, iv)
    };

    let client = slice(crypto::p_hash(hash, server_nonce, client_nonce, total)?);
    let server = slice(crypto::p_hash(hash, client_nonce, server_nonce, total)?);

    debug!(
        signature_len,
        encryption_len, "Derived symmetric keys for both directions"
    );
    Ok(SecurityKeys { client, server })
}

/// The current token generation plus, during a renewal overlap, the previous one.
#[derive(Debug, Clone)]
pub struct ChannelSecurity {
    current_keys: SecurityKeys,
    current_token: ChannelSecurityToken,
    previous_keys: Option<SecurityKeys>,
    previous_token: Option<ChannelSecurityToken>,
}

impl ChannelSecurity {
    pub fn new(keys: SecurityKeys, token: ChannelSecurityToken) -> Self {
        ChannelSecurity {
            current_keys: keys,
            current_token: token,
            previous_keys: None,
            previous_token: None,
        }
    }

    /// A new value with `keys`/`token` current and this value's current
    /// generation demoted to previous. Anything older is dropped.
    pub fn renewed(&self, keys: SecurityKeys, token: ChannelSecurityToken) -> Self {
        ChannelSecurity {
            current_keys: keys,
            current_token: token,
            previous_keys: Some(self.current_keys.clone()),
            previous_token: Some(self.current_token.clone()),
        }
    }

    /// A copy without the previous generation, once the peer has switched.
    pub fn without_previous(&self) -> Self {
        ChannelSecurity::new(self.current_keys.clone(), self.current_token.clone())
    }

    pub fn current_keys(&self) -> &SecurityKeys {
        &self.current_keys
    }

    pub fn current_token(&self) -> &ChannelSecurityToken {
        &self.current_token
    }

    pub fn previous_keys(&self) -> Option<&SecurityKeys> {
        self.previous_keys.as_ref()
    }

    pub fn previous_token(&self) -> Option<&ChannelSecurityToken> {
        self.previous_token.as_ref()
    }

    pub fn has_previous(&self) -> bool {
        self.previous_token.is_some()
    }

    /// Keys for `token_id`: the current generation, then the previous one.
    pub fn keys_for_token(&self, token_id: u32) -> Option<&SecurityKeys> {
        if self.current_token.token_id == token_id {
            return Some(&self.current_keys);
        }
        match (&self.previous_token, &self.previous_keys) {
            (Some(token), Some(keys)) if token.token_id == token_id => Some(keys),
            _ => None,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn token(token_id: u32) -> ChannelSecurityToken {
        ChannelSecurityToken {
            channel_id: 1,
            token_id,
            created_at: Default::default(),
            revised_lifetime: 60_000,
        }
    }

    #[test]
    fn test_key_lengths_follow_policy() {
        let keys = generate_key_pair(SecurityPolicy::Basic256, &[1u8; 32], &[2u8; 32]).unwrap();
        assert_eq!(keys.client.signature_key().len(), 24);
        assert_eq!(keys.client.encryption_key().len(), 32);
        assert_eq!(keys.client.initialization_vector().len(), 16);

        let keys =
            generate_key_pair(SecurityPolicy::Aes128Sha256RsaOaep, &[1u8; 32], &[2u8; 32]).unwrap();
        assert_eq!(keys.server.signature_key().len(), 32);
        assert_eq!(keys.server.encryption_key().len(), 16);
    }

    #[test]
    fn test_short_nonce_rejected() {
        assert!(generate_key_pair(SecurityPolicy::Basic256Sha256, &[1u8; 8], &[2u8; 32]).is_err());
    }

    #[test]
    fn test_renewal_keeps_two_generations() {
        let k1 = generate_key_pair(SecurityPolicy::Basic256Sha256, &[1; 32], &[2; 32]).unwrap();
        let k2 = generate_key_pair(SecurityPolicy::Basic256Sha256, &[3; 32], &[4; 32]).unwrap();
        let k3 = generate_key_pair(SecurityPolicy::Basic256Sha256, &[5; 32], &[6; 32]).unwrap();

        let s1 = ChannelSecurity::new(k1.clone(), token(1));
        let s2 = s1.renewed(k2.clone(), token(2));
        assert_eq!(s2.keys_for_token(2), Some(&k2));
        assert_eq!(s2.keys_for_token(1), Some(&k1));

        let s3 = s2.renewed(k3.clone(), token(3));
        assert_eq!(s3.keys_for_token(3), Some(&k3));
        assert_eq!(s3.keys_for_token(2), Some(&k2));
        assert!(s3.keys_for_token(1).is_none());

        // The old value is untouched
        assert_eq!(s2.current_token().token_id, 2);
        assert!(s3.without_previous().keys_for_token(2).is_none());
    }
}
