#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
//! End-to-end client channel tests against an in-process `opc.tcp` server.
//!
//! The server is built from the crate's own codec and chunk pieces with the
//! None security policy. Request bodies steer it: most are echoed, a few
//! magic bodies trigger aborts, errors, silence or a hang-up.

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use opcua_channel::config::{ChannelConfig, ClientConfig, EncodingLimits, NetworkConfig};
use opcua_channel::core::codec::ChunkCodec;
use opcua_channel::core::messages::{
    decode_message, encode_message, ChannelSecurityToken, CloseSecureChannelRequest, Hello,
    OpenSecureChannelRequest, OpenSecureChannelResponse, ResponseHeader,
    SecurityTokenRequestType, PROTOCOL_VERSION,
};
use opcua_channel::core::types::{ByteString, DateTime, StatusCode};
use opcua_channel::error::{ProtocolError, Result};
use opcua_channel::protocol::{
    ChannelParameters, ChannelRole, ChunkDecoder, ChunkEncoder, ChunkType, ErrorMessage,
    MessageType, SecureChannel,
};
use opcua_channel::service::{ChannelManager, ClientChannel, ConnectionState};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{FramedRead, FramedWrite};

const CHANNEL_ID: u32 = 7;

#[derive(Default)]
struct ServerStats {
    connections: AtomicUsize,
    renewals: AtomicUsize,
    closes: AtomicUsize,
}

#[derive(Clone)]
struct ServerOptions {
    channel: ChannelConfig,
    lifetime_ms: u32,
    reject_hello: bool,
}

impl Default for ServerOptions {
    fn default() -> Self {
        ServerOptions {
            channel: ChannelConfig::default(),
            lifetime_ms: 600_000,
            reject_hello: false,
        }
    }
}

struct MockServer {
    addr: SocketAddr,
    stats: Arc<ServerStats>,
}

impl MockServer {
    async fn start(options: ServerOptions) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let stats = Arc::new(ServerStats::default());
        let server_stats = stats.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                server_stats.connections.fetch_add(1, Ordering::SeqCst);
                let options = options.clone();
                let stats = server_stats.clone();
                tokio::spawn(async move {
                    let _ = serve(stream, options, stats).await;
                });
            }
        });
        MockServer { addr, stats }
    }

    fn endpoint_url(&self) -> String {
        format!("opc.tcp://{}/mock", self.addr)
    }

    fn client_config(&self) -> ClientConfig {
        ClientConfig {
            endpoint_url: self.endpoint_url(),
            request_timeout: Duration::from_secs(5),
            close_timeout: Duration::from_secs(2),
            ..ClientConfig::default()
        }
    }

    async fn open(&self) -> Result<ClientChannel> {
        ClientChannel::open(
            self.client_config(),
            ChannelConfig::default(),
            SecureChannel::unsecured(ChannelRole::Client, EncodingLimits::default()),
        )
        .await
    }
}

async fn serve(stream: TcpStream, options: ServerOptions, stats: Arc<ServerStats>) -> Result<()> {
    let limits = EncodingLimits::default();
    let (read_half, write_half) = stream.into_split();
    let max_chunk = options.channel.max_chunk_size;
    let mut reader = FramedRead::new(read_half, ChunkCodec::new(max_chunk));
    let mut writer = FramedWrite::new(write_half, ChunkCodec::new(max_chunk));

    let frame = reader.next().await.ok_or(ProtocolError::ConnectionClosed)??;
    assert_eq!(frame.message_type, MessageType::Hello);
    let hello = Hello::decode(frame.body())?;
    if options.reject_hello {
        let error = ErrorMessage::new(StatusCode::BAD_TCP_ENDPOINT_URL_INVALID, "unknown endpoint");
        writer.send(error.encode_frame(&limits)?).await?;
        return Ok(());
    }
    let (parameters, ack) = ChannelParameters::from_hello(&options.channel, &hello);
    writer.send(ack.encode()?).await?;

    let channel = SecureChannel::unsecured(ChannelRole::Server, limits.clone());
    let mut encoder = ChunkEncoder::new(parameters);
    let mut decoder = ChunkDecoder::new(parameters);
    let mut token_id = 0;
    let mut partial: Vec<Bytes> = Vec::new();

    while let Some(frame) = reader.next().await {
        let frame = frame?;
        let message_type = frame.message_type;
        let chunk_type = frame.chunk_type;
        partial.push(frame.bytes);
        if chunk_type == ChunkType::Continuation {
            continue;
        }
        let chunks = std::mem::take(&mut partial);

        let reply = match message_type {
            MessageType::OpenSecureChannel => {
                let message = decoder.decode_asymmetric(&channel, &chunks)?;
                let request: OpenSecureChannelRequest = decode_message(message.body, &limits)?;
                if request.request_type == SecurityTokenRequestType::Renew {
                    stats.renewals.fetch_add(1, Ordering::SeqCst);
                }
                token_id += 1;
                let token = ChannelSecurityToken {
                    channel_id: CHANNEL_ID,
                    token_id,
                    created_at: DateTime::now(),
                    revised_lifetime: options.lifetime_ms,
                };
                channel.set_remote_nonce(Bytes::copy_from_slice(request.client_nonce.as_bytes()));
                channel.install_token(token.clone())?;
                let response = OpenSecureChannelResponse {
                    response_header: ResponseHeader::new(
                        request.request_header.request_handle,
                        StatusCode::GOOD,
                    ),
                    server_protocol_version: PROTOCOL_VERSION,
                    security_token: token,
                    server_nonce: ByteString::null(),
                };
                let body = encode_message(&response, &limits)?;
                encoder.encode_asymmetric(&channel, message.request_id, &body)?
            }
            MessageType::CloseSecureChannel => {
                let message = decoder.decode_symmetric(&channel, &chunks)?;
                let _: CloseSecureChannelRequest = decode_message(message.body, &limits)?;
                stats.closes.fetch_add(1, Ordering::SeqCst);
                return Ok(());
            }
            MessageType::SecureMessage => {
                let message = decoder.decode_symmetric(&channel, &chunks)?;
                match &message.body[..] {
                    b"hangup" => return Ok(()),
                    b"ignore" => continue,
                    b"abort" => {
                        let reason = ErrorMessage::new(StatusCode::BAD_TCP_INTERNAL_ERROR, "busy");
                        vec![encoder.encode_abort(&channel, message.request_id, &reason)?]
                    }
                    b"error" => {
                        let error =
                            ErrorMessage::new(StatusCode::BAD_TCP_INTERNAL_ERROR, "server fault");
                        vec![error.encode_frame(&limits)?]
                    }
                    body => encoder.encode_symmetric(
                        &channel,
                        MessageType::SecureMessage,
                        message.request_id,
                        body,
                    )?,
                }
            }
            other => {
                return Err(ProtocolError::UnexpectedMessage(format!("{other:?}")));
            }
        };

        for chunk in reply {
            writer.feed(chunk).await?;
        }
        writer.flush().await?;
    }
    Ok(())
}

async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within 2s");
}

#[tokio::test]
async fn test_open_and_echo() {
    let server = MockServer::start(ServerOptions::default()).await;
    let client = server.open().await.expect("open");

    assert!(client.is_open());
    assert_eq!(client.channel_id(), CHANNEL_ID);
    assert_eq!(client.endpoint().port, server.addr.port());
    assert_eq!(client.parameters().local_send_buffer_size, 65_535);

    let response = client
        .send_request(Bytes::from_static(b"ping"))
        .await
        .expect("echo");
    assert_eq!(&response[..], b"ping");
    assert_eq!(client.pending_requests(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_requests_get_their_own_responses() {
    let server = MockServer::start(ServerOptions::default()).await;
    let client = Arc::new(server.open().await.expect("open"));

    let mut tasks = tokio::task::JoinSet::new();
    for i in 0..50u32 {
        let client = client.clone();
        tasks.spawn(async move {
            let body = Bytes::from(format!("request-{i}").into_bytes());
            let response = client.send_request(body.clone()).await.expect("echo");
            assert_eq!(response, body);
        });
    }
    while let Some(result) = tasks.join_next().await {
        result.expect("task");
    }
    assert_eq!(client.pending_requests(), 0);
}

#[tokio::test]
async fn test_large_request_spans_chunks() {
    let server = MockServer::start(ServerOptions {
        channel: ChannelConfig {
            max_chunk_size: 8192,
            ..ChannelConfig::default()
        },
        ..ServerOptions::default()
    })
    .await;
    let client = server.open().await.expect("open");
    assert_eq!(client.parameters().local_send_buffer_size, 8192);

    let body: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
    let response = client.send_request(Bytes::from(body.clone())).await.expect("echo");
    assert_eq!(&response[..], &body[..]);
}

#[tokio::test]
async fn test_request_too_large_is_rejected_locally() {
    let server = MockServer::start(ServerOptions {
        channel: ChannelConfig {
            max_message_size: 4096,
            ..ChannelConfig::default()
        },
        ..ServerOptions::default()
    })
    .await;
    let client = server.open().await.expect("open");

    let result = client.send_request(Bytes::from(vec![0u8; 5000])).await;
    assert!(matches!(
        result,
        Err(ProtocolError::RequestTooLarge {
            size: 5000,
            max: 4096
        })
    ));
    // The channel is still usable
    assert!(client.send_request(Bytes::from_static(b"ok")).await.is_ok());
}

#[tokio::test]
async fn test_hello_rejected_by_server() {
    let server = MockServer::start(ServerOptions {
        reject_hello: true,
        ..ServerOptions::default()
    })
    .await;

    match server.open().await {
        Err(ProtocolError::RemoteError { status, reason }) => {
            assert_eq!(status, StatusCode::BAD_TCP_ENDPOINT_URL_INVALID);
            assert_eq!(reason, "unknown endpoint");
        }
        other => panic!("expected RemoteError, got {other:?}"),
    }
}

#[tokio::test]
async fn test_connect_refused() {
    // Bind and drop to find a port nobody listens on
    let addr = TcpListener::bind("127.0.0.1:0")
        .await
        .unwrap()
        .local_addr()
        .unwrap();
    let config = ClientConfig {
        endpoint_url: format!("opc.tcp://{addr}"),
        ..ClientConfig::default()
    };
    let result = ClientChannel::open(
        config,
        ChannelConfig::default(),
        SecureChannel::unsecured(ChannelRole::Client, EncodingLimits::default()),
    )
    .await;
    assert!(matches!(result, Err(ProtocolError::Io(_))));
}

#[tokio::test]
async fn test_server_channel_is_rejected() {
    let server = MockServer::start(ServerOptions::default()).await;
    let result = ClientChannel::open(
        server.client_config(),
        ChannelConfig::default(),
        SecureChannel::unsecured(ChannelRole::Server, EncodingLimits::default()),
    )
    .await;
    assert!(matches!(result, Err(ProtocolError::ConfigError(_))));
}

#[tokio::test]
async fn test_abort_fails_only_that_request() {
    let server = MockServer::start(ServerOptions::default()).await;
    let client = server.open().await.expect("open");

    match client.send_request(Bytes::from_static(b"abort")).await {
        Err(ProtocolError::MessageAborted { status, reason, .. }) => {
            assert_eq!(status, StatusCode::BAD_TCP_INTERNAL_ERROR);
            assert_eq!(reason, "busy");
        }
        other => panic!("expected MessageAborted, got {other:?}"),
    }

    assert!(client.is_open());
    let response = client.send_request(Bytes::from_static(b"after")).await.expect("echo");
    assert_eq!(&response[..], b"after");
}

#[tokio::test]
async fn test_server_error_closes_channel() {
    let server = MockServer::start(ServerOptions::default()).await;
    let client = server.open().await.expect("open");

    let result = client.send_request(Bytes::from_static(b"error")).await;
    assert!(matches!(result, Err(ProtocolError::RemoteError { .. })));
    assert!(matches!(
        client.closed().await,
        Err(ProtocolError::RemoteError { .. })
    ));
    assert!(!client.is_open());
    assert!(matches!(
        client.send_request(Bytes::from_static(b"late")).await,
        Err(ProtocolError::ConnectionClosed)
    ));
}

#[tokio::test]
async fn test_transport_loss_fails_pending_requests() {
    let server = MockServer::start(ServerOptions::default()).await;
    let client = Arc::new(server.open().await.expect("open"));

    let waiting = tokio::spawn({
        let client = client.clone();
        async move { client.send_request(Bytes::from_static(b"ignore")).await }
    });
    eventually(|| client.pending_requests() == 1).await;

    let result = client.send_request(Bytes::from_static(b"hangup")).await;
    assert!(matches!(result, Err(ProtocolError::ConnectionClosed)));
    assert!(matches!(
        waiting.await.unwrap(),
        Err(ProtocolError::ConnectionClosed)
    ));
    assert_eq!(client.pending_requests(), 0);
    assert!(client.closed().await.is_err());
}

#[tokio::test]
async fn test_request_timeout_leaves_channel_open() {
    let server = MockServer::start(ServerOptions::default()).await;
    let client = server.open().await.expect("open");

    let result = client
        .send_request_with_timeout(Bytes::from_static(b"ignore"), Duration::from_millis(100))
        .await;
    assert!(matches!(result, Err(ProtocolError::Timeout)));
    assert_eq!(client.pending_requests(), 0);

    let response = client.send_request(Bytes::from_static(b"next")).await.expect("echo");
    assert_eq!(&response[..], b"next");
}

#[tokio::test]
async fn test_close_sends_close_secure_channel() {
    let server = MockServer::start(ServerOptions::default()).await;
    let client = server.open().await.expect("open");

    client.close().await.expect("close");
    assert!(!client.is_open());
    assert!(client.closed().await.is_ok());
    eventually(|| server.stats.closes.load(Ordering::SeqCst) == 1).await;

    assert!(matches!(
        client.send_request(Bytes::from_static(b"late")).await,
        Err(ProtocolError::ConnectionClosed)
    ));
    // Closing twice is harmless
    client.close().await.expect("second close");
}

#[tokio::test]
async fn test_manual_renew_installs_new_token() {
    let server = MockServer::start(ServerOptions::default()).await;
    let client = server.open().await.expect("open");

    let token = client.renew().await.expect("renew");
    assert_eq!(token.token_id, 2);
    assert_eq!(token.channel_id, CHANNEL_ID);
    assert_eq!(server.stats.renewals.load(Ordering::SeqCst), 1);

    let security = client.channel().channel_security().expect("security");
    assert_eq!(security.current_token().token_id, 2);

    let response = client.send_request(Bytes::from_static(b"renewed")).await.expect("echo");
    assert_eq!(&response[..], b"renewed");
}

#[tokio::test]
async fn test_token_renews_before_expiry() {
    let server = MockServer::start(ServerOptions {
        lifetime_ms: 400,
        ..ServerOptions::default()
    })
    .await;
    let client = server.open().await.expect("open");

    // Renewal fires at 75% of the 400ms lifetime, then again on each new token
    tokio::time::sleep(Duration::from_millis(1000)).await;
    assert!(server.stats.renewals.load(Ordering::SeqCst) >= 2);
    assert!(client.is_open());

    let response = client.send_request(Bytes::from_static(b"still here")).await.expect("echo");
    assert_eq!(&response[..], b"still here");
}

fn network_config(server: &MockServer) -> NetworkConfig {
    let mut config = NetworkConfig::default();
    config.client = ClientConfig {
        reconnect_delay_unit: Duration::from_millis(50),
        ..server.client_config()
    };
    config
}

#[tokio::test]
async fn test_manager_connects_and_disconnects() {
    let server = MockServer::start(ServerOptions::default()).await;
    let manager = ChannelManager::from_config(network_config(&server)).expect("manager");

    let response = manager
        .send_request(Bytes::from_static(b"managed"))
        .await
        .expect("echo");
    assert_eq!(&response[..], b"managed");
    assert_eq!(manager.state(), ConnectionState::Connected);

    manager.disconnect().await.expect("disconnect");
    assert_eq!(manager.state(), ConnectionState::NotConnected);
    eventually(|| server.stats.closes.load(Ordering::SeqCst) == 1).await;
}

#[tokio::test]
async fn test_manager_reconnects_after_transport_loss() {
    let server = MockServer::start(ServerOptions::default()).await;
    let manager = ChannelManager::from_config(network_config(&server)).expect("manager");

    let first = manager.connect().await.expect("connect");
    let _ = first.send_request(Bytes::from_static(b"hangup")).await;

    let mut second = manager.get_channel().await;
    for _ in 0..50 {
        match &second {
            Ok(channel) if !Arc::ptr_eq(channel, &first) => break,
            _ => {
                tokio::time::sleep(Duration::from_millis(20)).await;
                second = manager.get_channel().await;
            }
        }
    }
    let second = second.expect("reconnected");
    assert!(!Arc::ptr_eq(&first, &second));
    assert_eq!(server.stats.connections.load(Ordering::SeqCst), 2);

    let response = second.send_request(Bytes::from_static(b"again")).await.expect("echo");
    assert_eq!(&response[..], b"again");
    manager.disconnect().await.expect("disconnect");
}
