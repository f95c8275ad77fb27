//! Secure channel records.
//!
//! A [`SecureChannel`] holds everything the chunk encoder and decoder need to
//! protect traffic for one connection: the negotiated policy and mode, the
//! certificates on both ends, the nonces exchanged during OpenSecureChannel,
//! the server-assigned channel id and the current [`ChannelSecurity`].
//!
//! Client and server channels differ only in which direction's keys they use
//! to send and which they use to receive.

use crate::config::{ChannelConfig, EncodingLimits};
use crate::core::messages::{Acknowledge, ChannelSecurityToken, Hello, PROTOCOL_VERSION};
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::policy::{MessageSecurityMode, SecurityPolicy};
use crate::protocol::security::{generate_key_pair, ChannelSecurity, SecretKeys, SecurityKeys};
use crate::utils::crypto;
pub use crate::utils::crypto::{Certificate, KeyPair};
use bytes::Bytes;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Buffer sizes and limits agreed during Hello / Acknowledge.
///
/// *Local* values bound what this side accepts, *remote* values bound what
/// this side may send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelParameters {
    pub local_max_message_size: usize,
    pub local_receive_buffer_size: usize,
    pub local_send_buffer_size: usize,
    pub local_max_chunk_count: usize,
    pub remote_max_message_size: usize,
    pub remote_receive_buffer_size: usize,
    pub remote_send_buffer_size: usize,
    pub remote_max_chunk_count: usize,
}

fn or_unlimited(remote: u32, local: usize) -> usize {
    if remote == 0 {
        local
    } else {
        remote as usize
    }
}

impl ChannelParameters {
    /// Parameters for a channel whose peer runs with the same configuration.
    pub fn symmetric(config: &ChannelConfig) -> Self {
        ChannelParameters {
            local_max_message_size: config.max_message_size,
            local_receive_buffer_size: config.max_chunk_size,
            local_send_buffer_size: config.max_chunk_size,
            local_max_chunk_count: config.max_chunk_count,
            remote_max_message_size: config.max_message_size,
            remote_receive_buffer_size: config.max_chunk_size,
            remote_send_buffer_size: config.max_chunk_size,
            remote_max_chunk_count: config.max_chunk_count,
        }
    }

    /// The Hello a client with `config` sends to `endpoint_url`.
    pub fn hello(config: &ChannelConfig, endpoint_url: &str) -> Hello {
        Hello {
            protocol_version: PROTOCOL_VERSION,
            receive_buffer_size: config.max_chunk_size as u32,
            send_buffer_size: config.max_chunk_size as u32,
            max_message_size: config.max_message_size as u32,
            max_chunk_count: config.max_chunk_count as u32,
            endpoint_url: endpoint_url.to_string(),
        }
    }

    /// Client side: our send buffer is bounded by the server's receive
    /// buffer and vice versa.
    pub fn negotiate(config: &ChannelConfig, ack: &Acknowledge) -> Self {
        ChannelParameters {
            local_max_message_size: config.max_message_size,
            local_receive_buffer_size: (ack.send_buffer_size as usize).min(config.max_chunk_size),
            local_send_buffer_size: (ack.receive_buffer_size as usize).min(config.max_chunk_size),
            local_max_chunk_count: config.max_chunk_count,
            remote_max_message_size: or_unlimited(ack.max_message_size, config.max_message_size),
            remote_receive_buffer_size: ack.receive_buffer_size as usize,
            remote_send_buffer_size: ack.send_buffer_size as usize,
            remote_max_chunk_count: or_unlimited(ack.max_chunk_count, config.max_chunk_count),
        }
    }

    /// Server side: parameters for a received Hello and the Acknowledge to reply with.
    pub fn from_hello(config: &ChannelConfig, hello: &Hello) -> (Self, Acknowledge) {
        let local_receive = (hello.send_buffer_size as usize).min(config.max_chunk_size);
        let local_send = (hello.receive_buffer_size as usize).min(config.max_chunk_size);
        let parameters = ChannelParameters {
            local_max_message_size: config.max_message_size,
            local_receive_buffer_size: local_receive,
            local_send_buffer_size: local_send,
            local_max_chunk_count: config.max_chunk_count,
            remote_max_message_size: or_unlimited(hello.max_message_size, config.max_message_size),
            remote_receive_buffer_size: hello.receive_buffer_size as usize,
            remote_send_buffer_size: hello.send_buffer_size as usize,
            remote_max_chunk_count: or_unlimited(hello.max_chunk_count, config.max_chunk_count),
        };
        let ack = Acknowledge {
            protocol_version: PROTOCOL_VERSION,
            receive_buffer_size: local_receive as u32,
            send_buffer_size: local_send as u32,
            max_message_size: config.max_message_size as u32,
            max_chunk_count: config.max_chunk_count as u32,
        };
        (parameters, ack)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelRole {
    Client,
    Server,
}

#[derive(Debug)]
pub struct SecureChannel {
    role: ChannelRole,
    policy: SecurityPolicy,
    mode: MessageSecurityMode,
    key_pair: Option<KeyPair>,
    remote_certificate: RwLock<Option<Certificate>>,
    channel_id: AtomicU32,
    local_nonce: RwLock<Bytes>,
    remote_nonce: RwLock<Bytes>,
    security: RwLock<Option<Arc<ChannelSecurity>>>,
    limits: EncodingLimits,
}

impl SecureChannel {
    /// A channel with no security at all.
    pub fn unsecured(role: ChannelRole, limits: EncodingLimits) -> Self {
        SecureChannel {
            role,
            policy: SecurityPolicy::None,
            mode: MessageSecurityMode::None,
            key_pair: None,
            remote_certificate: RwLock::new(None),
            channel_id: AtomicU32::new(0),
            local_nonce: RwLock::new(Bytes::new()),
            remote_nonce: RwLock::new(Bytes::new()),
            security: RwLock::new(None),
            limits,
        }
    }

    /// A client channel. Secured policies need our key pair and the server certificate.
    pub fn new_client(
        policy: SecurityPolicy,
        mode: MessageSecurityMode,
        key_pair: Option<KeyPair>,
        server_certificate: Option<Certificate>,
        limits: EncodingLimits,
    ) -> Result<Self> {
        if policy != SecurityPolicy::None {
            if key_pair.is_none() {
                return Err(ProtocolError::ConfigError(constants::ERR_MISSING_KEY_PAIR.into()));
            }
            if server_certificate.is_none() {
                return Err(ProtocolError::ConfigError(
                    constants::ERR_MISSING_REMOTE_CERT.into(),
                ));
            }
        }
        Self::new(ChannelRole::Client, policy, mode, key_pair, server_certificate, limits)
    }

    /// A server channel. The client certificate arrives with the first OpenSecureChannel.
    pub fn new_server(
        policy: SecurityPolicy,
        mode: MessageSecurityMode,
        key_pair: Option<KeyPair>,
        limits: EncodingLimits,
    ) -> Result<Self> {
        if policy != SecurityPolicy::None && key_pair.is_none() {
            return Err(ProtocolError::ConfigError(constants::ERR_MISSING_KEY_PAIR.into()));
        }
        Self::new(ChannelRole::Server, policy, mode, key_pair, None, limits)
    }

    fn new(
        role: ChannelRole,
        policy: SecurityPolicy,
        mode: MessageSecurityMode,
        key_pair: Option<KeyPair>,
        remote_certificate: Option<Certificate>,
        limits: EncodingLimits,
    ) -> Result<Self> {
        if policy == SecurityPolicy::None && mode != MessageSecurityMode::None {
            return Err(ProtocolError::ConfigError(format!(
                "security mode {mode:?} requires a security policy"
            )));
        }
        if policy != SecurityPolicy::None && mode == MessageSecurityMode::None {
            return Err(ProtocolError::ConfigError(format!(
                "security policy {policy} requires mode Sign or SignAndEncrypt"
            )));
        }
        let mut channel = Self::unsecured(role, limits);
        channel.policy = policy;
        channel.mode = mode;
        channel.key_pair = key_pair;
        channel.remote_certificate = RwLock::new(remote_certificate);
        Ok(channel)
    }

    pub fn role(&self) -> ChannelRole {
        self.role
    }

    pub fn policy(&self) -> SecurityPolicy {
        self.policy
    }

    pub fn mode(&self) -> MessageSecurityMode {
        self.mode
    }

    pub fn limits(&self) -> &EncodingLimits {
        &self.limits
    }

    pub fn channel_id(&self) -> u32 {
        self.channel_id.load(Ordering::Acquire)
    }

    pub fn set_channel_id(&self, id: u32) {
        self.channel_id.store(id, Ordering::Release);
    }

    pub fn key_pair(&self) -> Option<&KeyPair> {
        self.key_pair.as_ref()
    }

    pub fn local_certificate(&self) -> Option<&Certificate> {
        self.key_pair.as_ref().map(|kp| &kp.certificate)
    }

    pub fn remote_certificate(&self) -> Option<Certificate> {
        self.remote_certificate.read().clone()
    }

    pub fn set_remote_certificate(&self, certificate: Certificate) {
        *self.remote_certificate.write() = Some(certificate);
    }

    pub fn local_nonce(&self) -> Bytes {
        self.local_nonce.read().clone()
    }

    pub fn remote_nonce(&self) -> Bytes {
        self.remote_nonce.read().clone()
    }

    pub fn set_remote_nonce(&self, nonce: Bytes) {
        *self.remote_nonce.write() = nonce;
    }

    /// Generates and stores a fresh local nonce sized for the policy.
    pub fn generate_local_nonce(&self) -> Bytes {
        let nonce = Bytes::from(crypto::generate_nonce(self.policy.nonce_length()));
        *self.local_nonce.write() = nonce.clone();
        nonce
    }

    /// A consistent snapshot of the installed key generations.
    pub fn channel_security(&self) -> Option<Arc<ChannelSecurity>> {
        self.security.read().clone()
    }

    /// Derives keys from the stored nonces and installs `token` as the
    /// current generation, demoting any previous current one.
    pub fn install_token(&self, token: ChannelSecurityToken) -> Result<()> {
        let local = self.local_nonce();
        let remote = self.remote_nonce();
        let (client_nonce, server_nonce) = match self.role {
            ChannelRole::Client => (local, remote),
            ChannelRole::Server => (remote, local),
        };
        let keys = generate_key_pair(self.policy, &client_nonce, &server_nonce)?;
        self.install_keys(keys, token);
        Ok(())
    }

    /// Installs an already-derived generation.
    pub fn install_keys(&self, keys: SecurityKeys, token: ChannelSecurityToken) {
        let token_id = token.token_id;
        let lifetime = token.revised_lifetime;
        self.set_channel_id(token.channel_id);
        let renewed = {
            let mut slot = self.security.write();
            let next = match slot.as_deref() {
                Some(current) => current.renewed(keys, token),
                None => ChannelSecurity::new(keys, token),
            };
            slot.replace(Arc::new(next)).is_some()
        };
        info!(
            channel_id = self.channel_id(),
            token_id,
            lifetime_ms = lifetime,
            renewed,
            "Installed security token"
        );
    }

    /// Drops the previous generation once traffic under the current token is
    /// seen. A no-op if another generation was installed in the meantime.
    pub fn retire_previous(&self, observed: &Arc<ChannelSecurity>) {
        if !observed.has_previous() {
            return;
        }
        let swapped = {
            let mut slot = self.security.write();
            match slot.as_ref() {
                Some(current) if Arc::ptr_eq(current, observed) => {
                    *slot = Some(Arc::new(observed.without_previous()));
                    true
                }
                _ => false,
            }
        };
        if swapped {
            debug!(
                channel_id = self.channel_id(),
                token_id = observed.current_token().token_id,
                "Retired previous security token"
            );
        }
    }

    pub fn is_signing_enabled(&self) -> bool {
        self.policy != SecurityPolicy::None
            && matches!(
                self.mode,
                MessageSecurityMode::Sign | MessageSecurityMode::SignAndEncrypt
            )
    }

    pub fn is_encryption_enabled(&self) -> bool {
        self.policy != SecurityPolicy::None && self.mode == MessageSecurityMode::SignAndEncrypt
    }

    /// OpenSecureChannel chunks are signed and encrypted whenever the policy is not None.
    pub fn is_asymmetric_security_enabled(&self) -> bool {
        self.policy != SecurityPolicy::None
    }

    /// Keys this side uses to sign and encrypt outgoing chunks.
    pub fn encryption_keys<'a>(&self, keys: &'a SecurityKeys) -> &'a SecretKeys {
        match self.role {
            ChannelRole::Client => &keys.client,
            ChannelRole::Server => &keys.server,
        }
    }

    /// Keys this side uses to verify and decrypt incoming chunks.
    pub fn decryption_keys<'a>(&self, keys: &'a SecurityKeys) -> &'a SecretKeys {
        match self.role {
            ChannelRole::Client => &keys.server,
            ChannelRole::Server => &keys.client,
        }
    }
}
