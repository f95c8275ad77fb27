#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
//! Connection state machine tests against an in-memory connector.
//!
//! Time is paused, so reconnect delays are measured exactly.

use async_trait::async_trait;
use opcua_channel::error::{ProtocolError, Result};
use opcua_channel::service::{
    ChannelConnector, ChannelManager, ConnectionState, ManagedChannel, ManagerConfig,
};
use opcua_channel::utils::Promise;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

struct MockChannel {
    id: usize,
    lost: Promise<()>,
    closes: AtomicUsize,
    hang_on_close: bool,
}

impl MockChannel {
    fn drop_transport(&self) {
        self.lost.complete(Err(ProtocolError::ConnectionClosed));
    }
}

#[async_trait]
impl ManagedChannel for MockChannel {
    async fn closed(&self) -> Result<()> {
        self.lost.wait().await
    }

    async fn close(&self) -> Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        if self.hang_on_close {
            futures::future::pending::<()>().await;
        }
        self.lost.complete(Ok(()));
        Ok(())
    }
}

#[derive(Default)]
struct Shared {
    attempts: Mutex<Vec<Instant>>,
    /// `false` entries fail; an empty queue succeeds.
    outcomes: Mutex<VecDeque<bool>>,
    channels: Mutex<Vec<Arc<MockChannel>>>,
}

impl Shared {
    fn attempts(&self) -> Vec<Instant> {
        self.attempts.lock().clone()
    }

    fn channel(&self, index: usize) -> Arc<MockChannel> {
        self.channels.lock()[index].clone()
    }
}

#[derive(Clone)]
struct MockConnector {
    shared: Arc<Shared>,
    latency: Duration,
    hang_on_close: bool,
}

impl MockConnector {
    fn new() -> Self {
        MockConnector {
            shared: Arc::new(Shared::default()),
            latency: Duration::ZERO,
            hang_on_close: false,
        }
    }

    fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    fn with_outcomes(self, outcomes: &[bool]) -> Self {
        self.shared.outcomes.lock().extend(outcomes.iter().copied());
        self
    }
}

#[async_trait]
impl ChannelConnector for MockConnector {
    type Channel = MockChannel;

    async fn connect(&self) -> Result<Arc<MockChannel>> {
        self.shared.attempts.lock().push(Instant::now());
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let succeed = self.shared.outcomes.lock().pop_front().unwrap_or(true);
        if !succeed {
            return Err(ProtocolError::Io(Arc::new(std::io::Error::from(
                std::io::ErrorKind::ConnectionRefused,
            ))));
        }
        let mut channels = self.shared.channels.lock();
        let channel = Arc::new(MockChannel {
            id: channels.len(),
            lost: Promise::new(),
            closes: AtomicUsize::new(0),
            hang_on_close: self.hang_on_close,
        });
        channels.push(channel.clone());
        Ok(channel)
    }
}

fn config() -> ManagerConfig {
    ManagerConfig {
        reconnect_delay_unit: Duration::from_secs(1),
        max_reconnect_delay: 16,
        close_timeout: Duration::from_secs(5),
    }
}

async fn wait_for_state(manager: &ChannelManager<MockConnector>, state: ConnectionState) {
    for _ in 0..10_000 {
        if manager.state() == state {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("state never became {state:?}, stuck in {:?}", manager.state());
}

#[tokio::test(start_paused = true)]
async fn test_get_channel_requires_connect() {
    let connector = MockConnector::new();
    let manager = ChannelManager::new(connector.clone(), config());

    assert_eq!(manager.state(), ConnectionState::NotConnected);
    assert!(matches!(
        manager.get_channel().await,
        Err(ProtocolError::ServerNotConnected)
    ));
    assert!(connector.shared.attempts().is_empty());

    let channel = manager.connect().await.unwrap();
    assert_eq!(manager.state(), ConnectionState::Connected);
    let again = manager.get_channel().await.unwrap();
    assert!(Arc::ptr_eq(&channel, &again));
    assert!(Arc::ptr_eq(&channel, &manager.current_channel().unwrap()));
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_connects_share_one_attempt() {
    let connector = MockConnector::new().with_latency(Duration::from_secs(1));
    let manager = ChannelManager::new(connector.clone(), config());

    let results = futures::future::join_all((0..10).map(|_| {
        let manager = manager.clone();
        async move { manager.connect().await }
    }))
    .await;

    let first = results[0].as_ref().unwrap();
    for result in &results {
        assert!(Arc::ptr_eq(first, result.as_ref().unwrap()));
    }
    assert_eq!(connector.shared.attempts().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_failed_connect_returns_to_not_connected() {
    let connector = MockConnector::new().with_outcomes(&[false]);
    let manager = ChannelManager::new(connector.clone(), config());

    assert!(matches!(manager.connect().await, Err(ProtocolError::Io(_))));
    assert_eq!(manager.state(), ConnectionState::NotConnected);
    assert!(matches!(
        manager.get_channel().await,
        Err(ProtocolError::ServerNotConnected)
    ));

    // The next connect starts a fresh attempt
    manager.connect().await.unwrap();
    assert_eq!(connector.shared.attempts().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_backoff_doubles_up_to_cap() {
    // Initial connect succeeds, six reconnects fail, the seventh succeeds
    let connector =
        MockConnector::new().with_outcomes(&[true, false, false, false, false, false, false]);
    let manager = ChannelManager::new(connector.clone(), config());

    let first = manager.connect().await.unwrap();
    let lost_at = Instant::now();
    first.drop_transport();

    wait_for_state(&manager, ConnectionState::Reconnecting).await;
    let reconnected = manager.get_channel();
    let _ = reconnected.await;
    wait_for_state(&manager, ConnectionState::Connected).await;

    let attempts = connector.shared.attempts();
    assert_eq!(attempts.len(), 8);
    let mut gaps = vec![(attempts[1] - lost_at).as_secs()];
    gaps.extend(attempts[1..].windows(2).map(|w| (w[1] - w[0]).as_secs()));
    assert_eq!(gaps, vec![1, 2, 4, 8, 16, 16, 16]);

    let current = manager.current_channel().unwrap();
    assert_eq!(current.id, 1);
}

#[tokio::test(start_paused = true)]
async fn test_get_channel_waits_for_reconnect() {
    let connector = MockConnector::new();
    let manager = ChannelManager::new(connector.clone(), config());

    let first = manager.connect().await.unwrap();
    first.drop_transport();
    wait_for_state(&manager, ConnectionState::Reconnecting).await;

    let started = Instant::now();
    let second = manager.get_channel().await.unwrap();
    assert!(!Arc::ptr_eq(&first, &second));
    assert!(Instant::now() - started <= Duration::from_secs(1));
    assert_eq!(manager.state(), ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_closes_channel() {
    let connector = MockConnector::new();
    let manager = ChannelManager::new(connector.clone(), config());

    let channel = manager.connect().await.unwrap();
    manager.disconnect().await.unwrap();
    assert_eq!(manager.state(), ConnectionState::NotConnected);
    assert_eq!(channel.closes.load(Ordering::SeqCst), 1);

    // A deliberate close is not a transport loss
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(connector.shared.attempts().len(), 1);
    assert_eq!(manager.state(), ConnectionState::NotConnected);

    // Disconnecting again is a no-op
    manager.disconnect().await.unwrap();
    assert_eq!(channel.closes.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_cancels_scheduled_reconnect() {
    let connector = MockConnector::new();
    let manager = ChannelManager::new(connector.clone(), config());

    let channel = manager.connect().await.unwrap();
    channel.drop_transport();
    wait_for_state(&manager, ConnectionState::Reconnecting).await;

    manager.disconnect().await.unwrap();
    assert_eq!(manager.state(), ConnectionState::NotConnected);

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(connector.shared.attempts().len(), 1);
    assert_eq!(manager.state(), ConnectionState::NotConnected);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_waits_for_in_flight_reconnect() {
    let connector = MockConnector::new().with_latency(Duration::from_secs(5));
    let manager = ChannelManager::new(connector.clone(), config());

    let first = manager.connect().await.unwrap();
    first.drop_transport();
    wait_for_state(&manager, ConnectionState::Reconnecting).await;

    // The attempt starts after one second and takes five
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(connector.shared.attempts().len(), 2);

    manager.disconnect().await.unwrap();
    assert_eq!(manager.state(), ConnectionState::NotConnected);
    let second = connector.shared.channel(1);
    assert_eq!(second.closes.load(Ordering::SeqCst), 1);
    assert!(manager.current_channel().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_during_connect_tears_down_result() {
    let connector = MockConnector::new().with_latency(Duration::from_secs(2));
    let manager = ChannelManager::new(connector.clone(), config());

    let connecting = tokio::spawn({
        let manager = manager.clone();
        async move { manager.connect().await }
    });
    wait_for_state(&manager, ConnectionState::Connecting).await;

    manager.disconnect().await.unwrap();
    assert_eq!(manager.state(), ConnectionState::NotConnected);

    // The caller still sees the channel, but it has been closed
    let channel = connecting.await.unwrap().unwrap();
    assert_eq!(channel.closes.load(Ordering::SeqCst), 1);
    assert!(manager.current_channel().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_connect_after_disconnect_opens_new_channel() {
    let connector = MockConnector::new();
    let manager = ChannelManager::new(connector.clone(), config());

    let first = manager.connect().await.unwrap();
    manager.disconnect().await.unwrap();
    let second = manager.connect().await.unwrap();
    assert!(!Arc::ptr_eq(&first, &second));
    assert_eq!(manager.state(), ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_close_timeout_still_disconnects() {
    let mut connector = MockConnector::new();
    connector.hang_on_close = true;
    let manager = ChannelManager::new(connector.clone(), config());

    manager.connect().await.unwrap();
    let started = Instant::now();
    let result = manager.disconnect().await;
    assert!(matches!(result, Err(ProtocolError::Timeout)));
    let elapsed = Instant::now() - started;
    assert!(elapsed >= Duration::from_secs(5) && elapsed < Duration::from_secs(6));
    assert_eq!(manager.state(), ConnectionState::NotConnected);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_connect_and_disconnect_race_across_threads() {
    let connector = MockConnector::new();
    let manager = ChannelManager::new(connector.clone(), config());

    let tasks: Vec<_> = (0..8)
        .map(|worker| {
            let manager = manager.clone();
            tokio::spawn(async move {
                for round in 0..25 {
                    if (worker + round) % 3 == 0 {
                        manager.disconnect().await.unwrap();
                    } else {
                        manager.connect().await.unwrap();
                    }
                    tokio::task::yield_now().await;
                }
            })
        })
        .collect();
    for task in tasks {
        task.await.unwrap();
    }

    manager.disconnect().await.unwrap();
    assert_eq!(manager.state(), ConnectionState::NotConnected);
    assert!(manager.current_channel().is_none());

    // Every channel that was opened has been closed by some disconnect
    let channels = connector.shared.channels.lock().clone();
    assert_eq!(channels.len(), connector.shared.attempts().len());
    assert!(channels
        .iter()
        .all(|c| c.closes.load(Ordering::SeqCst) >= 1));
}
