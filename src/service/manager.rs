//! Connection state machine.
//!
//! ```text
//! NotConnected --connect--> Connecting --ok--> Connected --transport lost--> Reconnecting
//!      ^                        |                  |                            |   ^
//!      |                        +--err-------------|----------------------------|---+ (retry with backoff)
//!      |                                           |                            |
//!      +-------------- Disconnecting <--disconnect-+----------------------------+
//! ```
//!
//! The current state is an `Arc<State>` behind a `parking_lot::RwLock`. Every
//! transition compares the slot against the `Arc` the caller observed and
//! swaps it only on a pointer match, holding the write lock for just that step
//! and never across an `.await`. A caller that loses the race re-reads the slot
//! and acts on the new state, so `connect`, `disconnect` and `get_channel` can
//! be called concurrently from any task or thread.

use crate::config::{ClientConfig, NetworkConfig};
use crate::error::{ProtocolError, Result};
use crate::protocol::channel::{Certificate, KeyPair, SecureChannel};
use crate::service::client::{load_key_material, ClientChannel};
use crate::utils::metrics::global_metrics;
use crate::utils::timeout::{with_timeout_error, CLOSE_TIMEOUT};
use crate::utils::Promise;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

/// Upper bound on the reconnect delay, in delay units.
pub const MAX_RECONNECT_DELAY: u32 = 16;

/// The delay after `delay`: 1 after 0, doubling up to `max`.
pub fn next_delay(delay: u32, max: u32) -> u32 {
    if delay == 0 {
        1
    } else {
        delay.saturating_mul(2).min(max.max(1))
    }
}

/// A connection the manager can watch and close.
#[async_trait]
pub trait ManagedChannel: Send + Sync + 'static {
    /// Resolves once the transport is gone.
    async fn closed(&self) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// Creates a fresh connection for every connect or reconnect attempt.
#[async_trait]
pub trait ChannelConnector: Send + Sync + 'static {
    type Channel: ManagedChannel;

    async fn connect(&self) -> Result<Arc<Self::Channel>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    NotConnected,
    Connecting,
    Connected,
    Reconnecting,
    Disconnecting,
}

#[derive(Debug, Clone, Copy)]
pub struct ManagerConfig {
    pub reconnect_delay_unit: Duration,
    pub max_reconnect_delay: u32,
    pub close_timeout: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        ManagerConfig {
            reconnect_delay_unit: Duration::from_secs(1),
            max_reconnect_delay: MAX_RECONNECT_DELAY,
            close_timeout: CLOSE_TIMEOUT,
        }
    }
}

impl From<&ClientConfig> for ManagerConfig {
    fn from(config: &ClientConfig) -> Self {
        ManagerConfig {
            reconnect_delay_unit: config.reconnect_delay_unit,
            max_reconnect_delay: config.max_reconnect_delay,
            close_timeout: config.close_timeout,
        }
    }
}

/// One scheduled reconnect attempt.
struct Reconnect<C> {
    delay: u32,
    reconnected: Promise<Arc<C>>,
    /// Set by whichever of the timer and a disconnect gets there first.
    claimed: AtomicBool,
    timer: Mutex<Option<AbortHandle>>,
}

impl<C: Send + Sync + 'static> Reconnect<C> {
    fn new(delay: u32) -> Self {
        Reconnect {
            delay,
            reconnected: Promise::new(),
            claimed: AtomicBool::new(false),
            timer: Mutex::new(None),
        }
    }
}

enum State<C> {
    NotConnected,
    Connecting { connected: Arc<Promise<Arc<C>>> },
    Connected { channel: Arc<C> },
    Reconnecting(Arc<Reconnect<C>>),
    Disconnecting { disconnected: Arc<Promise<()>> },
}

impl<C> State<C> {
    fn kind(&self) -> ConnectionState {
        match self {
            State::NotConnected => ConnectionState::NotConnected,
            State::Connecting { .. } => ConnectionState::Connecting,
            State::Connected { .. } => ConnectionState::Connected,
            State::Reconnecting(_) => ConnectionState::Reconnecting,
            State::Disconnecting { .. } => ConnectionState::Disconnecting,
        }
    }
}

struct Inner<K: ChannelConnector> {
    connector: K,
    config: ManagerConfig,
    state: RwLock<Arc<State<K::Channel>>>,
}

impl<K: ChannelConnector> Inner<K> {
    fn cas(&self, current: &Arc<State<K::Channel>>, next: Arc<State<K::Channel>>) -> bool {
        let from = current.kind();
        let to = next.kind();
        let swapped = {
            let mut slot = self.state.write();
            let swapped = Arc::ptr_eq(&*slot, current);
            if swapped {
                *slot = next;
            }
            swapped
        };
        if swapped {
            debug!(?from, ?to, "Connection state changed");
        }
        swapped
    }

    fn spawn_connect(
        self: &Arc<Self>,
        state: Arc<State<K::Channel>>,
        connected: Arc<Promise<Arc<K::Channel>>>,
    ) {
        let inner = self.clone();
        tokio::spawn(async move {
            let result = inner.connector.connect().await;
            match &result {
                Ok(channel) => {
                    let next = Arc::new(State::Connected {
                        channel: channel.clone(),
                    });
                    if inner.cas(&state, next) {
                        info!("Channel connected");
                        inner.watch(channel.clone());
                    }
                    // Otherwise a disconnect took over and closes the channel.
                }
                Err(e) => {
                    debug!(error = %e, "Connect failed");
                    inner.cas(&state, Arc::new(State::NotConnected));
                }
            }
            connected.complete(result);
        });
    }

    /// Moves Connected to Reconnecting when `channel`'s transport goes away.
    fn watch(self: &Arc<Self>, channel: Arc<K::Channel>) {
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let reason = channel.closed().await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let current = inner.state.read().clone();
            let is_current =
                matches!(&*current, State::Connected { channel: c } if Arc::ptr_eq(c, &channel));
            if !is_current {
                return;
            }
            let reconnect = Arc::new(Reconnect::new(next_delay(
                0,
                inner.config.max_reconnect_delay,
            )));
            let next = Arc::new(State::Reconnecting(reconnect.clone()));
            if inner.cas(&current, next.clone()) {
                warn!(?reason, "Channel lost, reconnecting");
                inner.schedule_reconnect(next, reconnect);
            }
        });
    }

    fn schedule_reconnect(
        self: &Arc<Self>,
        state: Arc<State<K::Channel>>,
        reconnect: Arc<Reconnect<K::Channel>>,
    ) {
        let delay = self.config.reconnect_delay_unit * reconnect.delay;
        debug!(delay_units = reconnect.delay, ?delay, "Scheduling reconnect");

        let weak: Weak<Self> = Arc::downgrade(self);
        let attempt = reconnect.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if attempt.claimed.swap(true, Ordering::AcqRel) {
                return;
            }
            let Some(inner) = weak.upgrade() else {
                attempt
                    .reconnected
                    .complete(Err(ProtocolError::ConnectionClosed));
                return;
            };
            global_metrics().reconnect_attempt();
            let result = inner.connector.connect().await;
            match &result {
                Ok(channel) => {
                    let next = Arc::new(State::Connected {
                        channel: channel.clone(),
                    });
                    if inner.cas(&state, next) {
                        info!(delay_units = attempt.delay, "Channel reconnected");
                        inner.watch(channel.clone());
                    }
                }
                Err(e) => {
                    let retry = Arc::new(Reconnect::new(next_delay(
                        attempt.delay,
                        inner.config.max_reconnect_delay,
                    )));
                    let next = Arc::new(State::Reconnecting(retry.clone()));
                    if inner.cas(&state, next.clone()) {
                        debug!(error = %e, "Reconnect failed");
                        inner.schedule_reconnect(next, retry);
                    }
                }
            }
            attempt.reconnected.complete(result);
        });
        *reconnect.timer.lock() = Some(task.abort_handle());
    }

    fn spawn_disconnect(
        self: &Arc<Self>,
        previous: Arc<State<K::Channel>>,
        state: Arc<State<K::Channel>>,
        disconnected: Arc<Promise<()>>,
    ) {
        let inner = self.clone();
        tokio::spawn(async move {
            let channel = match &*previous {
                State::Connecting { connected } => connected.wait().await.ok(),
                State::Connected { channel } => Some(channel.clone()),
                State::Reconnecting(reconnect) => {
                    if reconnect.claimed.swap(true, Ordering::AcqRel) {
                        // The attempt already started; let it finish.
                        reconnect.reconnected.wait().await.ok()
                    } else {
                        if let Some(timer) = reconnect.timer.lock().take() {
                            timer.abort();
                        }
                        reconnect
                            .reconnected
                            .complete(Err(ProtocolError::ConnectionClosed));
                        None
                    }
                }
                State::NotConnected | State::Disconnecting { .. } => None,
            };

            let result = match channel {
                Some(channel) => with_timeout_error(channel.close(), inner.config.close_timeout).await,
                None => Ok(()),
            };
            if let Err(e) = &result {
                warn!(error = %e, "Channel did not close cleanly");
            }
            inner.cas(&state, Arc::new(State::NotConnected));
            info!("Channel disconnected");
            global_metrics().log_metrics();
            disconnected.complete(result);
        });
    }
}

/// Owns the client's connection and keeps it alive across transport failures.
pub struct ChannelManager<K: ChannelConnector> {
    inner: Arc<Inner<K>>,
}

impl<K: ChannelConnector> Clone for ChannelManager<K> {
    fn clone(&self) -> Self {
        ChannelManager {
            inner: self.inner.clone(),
        }
    }
}

impl<K: ChannelConnector> ChannelManager<K> {
    pub fn new(connector: K, config: ManagerConfig) -> Self {
        ChannelManager {
            inner: Arc::new(Inner {
                connector,
                config,
                state: RwLock::new(Arc::new(State::NotConnected)),
            }),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state.read().kind()
    }

    /// The connected channel, without waiting.
    pub fn current_channel(&self) -> Option<Arc<K::Channel>> {
        match &**self.inner.state.read() {
            State::Connected { channel } => Some(channel.clone()),
            _ => None,
        }
    }

    /// Connects if not connected and waits for the channel. Callers arriving
    /// while a connect is in flight share its outcome.
    pub async fn connect(&self) -> Result<Arc<K::Channel>> {
        loop {
            let current = self.inner.state.read().clone();
            match &*current {
                State::NotConnected => {
                    let connected = Arc::new(Promise::new());
                    let next = Arc::new(State::Connecting {
                        connected: connected.clone(),
                    });
                    if self.inner.cas(&current, next.clone()) {
                        self.inner.spawn_connect(next, connected.clone());
                        return connected.wait().await;
                    }
                }
                State::Connecting { connected } => return connected.wait().await,
                State::Connected { channel } => return Ok(channel.clone()),
                State::Reconnecting(reconnect) => return reconnect.reconnected.wait().await,
                State::Disconnecting { disconnected } => {
                    let _ = disconnected.wait().await;
                }
            }
        }
    }

    /// The channel of the current or pending connection. Fails with
    /// `ServerNotConnected` when nothing is connected or connecting.
    pub async fn get_channel(&self) -> Result<Arc<K::Channel>> {
        loop {
            let current = self.inner.state.read().clone();
            match &*current {
                State::NotConnected => return Err(ProtocolError::ServerNotConnected),
                State::Connecting { connected } => return connected.wait().await,
                State::Connected { channel } => return Ok(channel.clone()),
                State::Reconnecting(reconnect) => return reconnect.reconnected.wait().await,
                // A connect may follow the disconnect; look again once it settles.
                State::Disconnecting { disconnected } => {
                    let _ = disconnected.wait().await;
                }
            }
        }
    }

    /// Closes the channel, cancelling a pending reconnect or tearing down an
    /// in-flight connect once it settles.
    pub async fn disconnect(&self) -> Result<()> {
        loop {
            let current = self.inner.state.read().clone();
            match &*current {
                State::NotConnected => return Ok(()),
                State::Disconnecting { disconnected } => return disconnected.wait().await,
                State::Connecting { .. } | State::Connected { .. } | State::Reconnecting(_) => {
                    let disconnected = Arc::new(Promise::new());
                    let next = Arc::new(State::Disconnecting {
                        disconnected: disconnected.clone(),
                    });
                    if self.inner.cas(&current, next.clone()) {
                        self.inner
                            .spawn_disconnect(current.clone(), next, disconnected.clone());
                        return disconnected.wait().await;
                    }
                }
            }
        }
    }
}

impl<K: ChannelConnector> std::fmt::Debug for ChannelManager<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelManager")
            .field("state", &self.state())
            .field("config", &self.inner.config)
            .finish()
    }
}

#[async_trait]
impl ManagedChannel for ClientChannel {
    async fn closed(&self) -> Result<()> {
        ClientChannel::closed(self).await
    }

    async fn close(&self) -> Result<()> {
        ClientChannel::close(self).await
    }
}

/// Opens [`ClientChannel`]s over `opc.tcp`, loading key material once.
pub struct UascConnector {
    config: NetworkConfig,
    key_pair: Option<KeyPair>,
    server_certificate: Option<Certificate>,
}

impl UascConnector {
    pub fn new(config: NetworkConfig) -> Result<Self> {
        let (key_pair, server_certificate) = load_key_material(&config.client)?;
        Ok(Self::with_keys(config, key_pair, server_certificate))
    }

    pub fn with_keys(
        config: NetworkConfig,
        key_pair: Option<KeyPair>,
        server_certificate: Option<Certificate>,
    ) -> Self {
        UascConnector {
            config,
            key_pair,
            server_certificate,
        }
    }
}

#[async_trait]
impl ChannelConnector for UascConnector {
    type Channel = ClientChannel;

    async fn connect(&self) -> Result<Arc<ClientChannel>> {
        let client = &self.config.client;
        let channel = SecureChannel::new_client(
            client.security_policy,
            client.security_mode,
            self.key_pair.clone(),
            self.server_certificate.clone(),
            self.config.limits.clone(),
        )?;
        let channel = ClientChannel::open(client.clone(), self.config.channel, channel).await?;
        Ok(Arc::new(channel))
    }
}

impl ChannelManager<UascConnector> {
    /// A manager for the endpoint and security settings in `config`.
    pub fn from_config(config: NetworkConfig) -> Result<Self> {
        let manager_config = ManagerConfig::from(&config.client);
        Ok(Self::new(UascConnector::new(config)?, manager_config))
    }

    /// Sends a request on the current channel, connecting first if needed.
    pub async fn send_request(&self, body: Bytes) -> Result<Bytes> {
        self.connect().await?.send_request(body).await
    }
}
