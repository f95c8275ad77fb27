//! Client side of one secure channel connection.
//!
//! [`ClientChannel::open`] runs the whole bootstrap: TCP connect, Hello /
//! Acknowledge, parameter negotiation and the first OpenSecureChannel. Once
//! open, three tasks serve the connection:
//!
//! - a writer that puts encoded chunks on the socket in the order the encode
//!   queue produced them,
//! - a reader that cuts chunks from the socket, checks the channel id and hands
//!   complete messages to the decode queue,
//! - a renewal timer that reissues the security token at 75% of its lifetime.
//!
//! Any fatal error closes the connection and fails every pending request.

use crate::config::{ChannelConfig, ClientConfig, EncodingLimits, NetworkConfig};
use crate::core::codec::{ChunkCodec, Frame};
use crate::core::messages::{
    decode_message, encode_message, Acknowledge, ChannelSecurityToken, CloseSecureChannelRequest,
    OpenSecureChannelRequest, OpenSecureChannelResponse, RequestHeader, SecurityTokenRequestType,
    PROTOCOL_VERSION,
};
use crate::core::types::ByteString;
use crate::error::{ProtocolError, Result};
use crate::protocol::channel::{
    Certificate, ChannelParameters, ChannelRole, KeyPair, SecureChannel,
};
use crate::protocol::chunk_decoder::DecodedMessage;
use crate::protocol::chunk_encoder::ChunkEncoder;
use crate::protocol::delegate::ChunkMode;
use crate::protocol::headers::{ChunkType, ErrorMessage, MessageHeader, MessageType};
use crate::protocol::policy::SecurityPolicy;
use crate::service::pending::PendingRequests;
use crate::service::queue::SerializationQueue;
use crate::transport::tcp::{self, EndpointUrl};
use crate::utils::metrics::global_metrics;
use crate::utils::timeout::with_timeout_error;
use crate::utils::Promise;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, error, info, instrument, warn};

/// Builds the client [`SecureChannel`] described by `config`, loading key
/// material from the configured paths.
pub fn load_secure_channel(config: &ClientConfig, limits: EncodingLimits) -> Result<SecureChannel> {
    let (key_pair, server_certificate) = load_key_material(config)?;
    SecureChannel::new_client(
        config.security_policy,
        config.security_mode,
        key_pair,
        server_certificate,
        limits,
    )
}

pub(crate) fn load_key_material(
    config: &ClientConfig,
) -> Result<(Option<KeyPair>, Option<Certificate>)> {
    if config.security_policy == SecurityPolicy::None {
        return Ok((None, None));
    }
    let key_pair = match (&config.certificate_path, &config.private_key_path) {
        (Some(certificate), Some(private_key)) => Some(KeyPair::from_files(certificate, private_key)?),
        _ => None,
    };
    let server_certificate = config
        .server_certificate_path
        .as_ref()
        .map(Certificate::from_file)
        .transpose()?;
    Ok((key_pair, server_certificate))
}

fn millis(duration: Duration) -> u32 {
    u32::try_from(duration.as_millis()).unwrap_or(u32::MAX)
}

enum WriterCommand {
    Chunks(Vec<Bytes>),
    /// Flush, shut down the write half and acknowledge.
    Close(oneshot::Sender<()>),
}

#[derive(Default)]
struct PartialMessage {
    chunks: Vec<Bytes>,
}

/// Collects chunks until a Final or Abort chunk completes the message.
struct ChunkAssembler {
    max_chunk_count: usize,
    asymmetric: PartialMessage,
    symmetric: PartialMessage,
}

impl ChunkAssembler {
    fn new(parameters: &ChannelParameters) -> Self {
        ChunkAssembler {
            max_chunk_count: parameters.local_max_chunk_count,
            asymmetric: PartialMessage::default(),
            symmetric: PartialMessage::default(),
        }
    }

    fn push(&mut self, mode: ChunkMode, frame: Frame) -> Result<Option<Vec<Bytes>>> {
        let partial = match mode {
            ChunkMode::Asymmetric => &mut self.asymmetric,
            ChunkMode::Symmetric => &mut self.symmetric,
        };
        partial.chunks.push(frame.bytes);
        if self.max_chunk_count > 0 && partial.chunks.len() > self.max_chunk_count {
            return Err(ProtocolError::EncodingLimitExceeded(format!(
                "message exceeds max chunk count {}",
                self.max_chunk_count
            )));
        }
        match frame.chunk_type {
            ChunkType::Continuation => Ok(None),
            ChunkType::Final | ChunkType::Abort => Ok(Some(std::mem::take(&mut partial.chunks))),
        }
    }
}

struct Connection {
    endpoint: EndpointUrl,
    config: ClientConfig,
    channel: Arc<SecureChannel>,
    parameters: ChannelParameters,
    queue: SerializationQueue,
    pending: PendingRequests<Bytes>,
    outgoing: mpsc::UnboundedSender<WriterCommand>,
    closed: Promise<()>,
    /// Set once CloseSecureChannel is on its way; the peer hanging up after
    /// that is the expected end of the connection.
    closing: AtomicBool,
    established: AtomicBool,
    request_handles: AtomicU32,
    tasks: Mutex<Vec<AbortHandle>>,
}

impl Connection {
    fn next_request_handle(&self) -> u32 {
        self.request_handles.fetch_add(1, Ordering::Relaxed)
    }

    /// Encodes on the queue and hands the chunks to the writer in queue order.
    async fn send<F>(&self, request_id: u32, encode: F) -> Result<()>
    where
        F: FnOnce(&mut ChunkEncoder, &SecureChannel) -> Result<Vec<Bytes>>
            + Send
            + 'static,
    {
        let channel = self.channel.clone();
        let outgoing = self.outgoing.clone();
        let sent = match self.queue.encode(move |encoder| {
            let chunks = encode(encoder, &*channel)?;
            outgoing
                .send(WriterCommand::Chunks(chunks))
                .map_err(|_| ProtocolError::ConnectionClosed)
        }) {
            Ok(completion) => completion.await.and_then(|r| r),
            Err(e) => Err(e),
        };
        if let Err(e) = &sent {
            self.pending.cancel(request_id);
            warn!(request_id, error = %e, "Failed to send message");
        }
        sent
    }

    #[instrument(skip(self), fields(channel_id = self.channel.channel_id()))]
    async fn open_secure_channel(
        &self,
        request_type: SecurityTokenRequestType,
    ) -> Result<ChannelSecurityToken> {
        let nonce = self.channel.generate_local_nonce();
        let request = OpenSecureChannelRequest {
            request_header: RequestHeader::new(
                self.next_request_handle(),
                millis(self.config.request_timeout),
            ),
            client_protocol_version: PROTOCOL_VERSION,
            request_type,
            security_mode: self.channel.mode(),
            client_nonce: ByteString::from(nonce),
            requested_lifetime: millis(self.config.channel_lifetime),
        };
        let body = encode_message(&request, self.channel.limits())?;

        let response = self.pending.register(Some(self.config.request_timeout))?;
        let request_id = response.request_id();
        self.send(request_id, move |encoder, channel| {
            encoder.encode_asymmetric(channel, request_id, &body)
        })
        .await?;

        let body = response.wait().await?;
        let response: OpenSecureChannelResponse = decode_message(body, self.channel.limits())?;
        let status = response.response_header.service_result;
        if status.is_bad() {
            return Err(ProtocolError::ServiceFault(status));
        }

        let server_nonce = response.server_nonce.as_bytes();
        let policy = self.channel.policy();
        if policy != SecurityPolicy::None && server_nonce.len() < policy.nonce_length() {
            return Err(ProtocolError::SecurityChecksFailed(format!(
                "server nonce of {} bytes, policy requires {}",
                server_nonce.len(),
                policy.nonce_length()
            )));
        }
        self.channel
            .set_remote_nonce(Bytes::copy_from_slice(server_nonce));
        self.channel.install_token(response.security_token.clone())?;
        global_metrics().token_installed();
        Ok(response.security_token)
    }

    async fn on_frame(self: &Arc<Self>, assembler: &mut ChunkAssembler, frame: Frame) -> Result<()> {
        let mode = match frame.message_type {
            MessageType::OpenSecureChannel => ChunkMode::Asymmetric,
            MessageType::SecureMessage | MessageType::CloseSecureChannel => ChunkMode::Symmetric,
            MessageType::Error => {
                let message = ErrorMessage::decode(frame.body(), self.channel.limits())?;
                error!(
                    status = %message.error,
                    reason = message.reason(),
                    "Server reported an error"
                );
                return Err(ProtocolError::RemoteError {
                    status: message.error,
                    reason: message.reason().to_string(),
                });
            }
            other => {
                return Err(ProtocolError::UnexpectedMessage(format!(
                    "{other:?} on an open channel"
                )))
            }
        };

        let header = MessageHeader::peek(&frame.bytes)?;
        let expected = self.channel.channel_id();
        if expected != 0 && header.secure_channel_id != expected {
            return Err(ProtocolError::SecureChannelIdInvalid {
                expected,
                received: header.secure_channel_id,
            });
        }

        let Some(chunks) = assembler.push(mode, frame)? else {
            return Ok(());
        };
        let conn = self.clone();
        self.queue
            .decode_or_wait(move |decoder| {
                let result = match mode {
                    ChunkMode::Asymmetric => decoder.decode_asymmetric(&conn.channel, &chunks),
                    ChunkMode::Symmetric => decoder.decode_symmetric(&conn.channel, &chunks),
                };
                let last_request_id = decoder.last_request_id();
                conn.deliver(result, last_request_id);
            })
            .await?;
        Ok(())
    }

    fn deliver(&self, result: Result<DecodedMessage>, last_request_id: u32) {
        match result {
            Ok(message) if message.message_type == MessageType::CloseSecureChannel => {
                debug!("Ignoring CloseSecureChannel from server");
            }
            Ok(message) => {
                self.pending.complete(message.request_id, Ok(message.body));
            }
            Err(e @ ProtocolError::MessageAborted { request_id, .. }) => {
                global_metrics().message_aborted();
                self.pending.complete(request_id, Err(e));
            }
            Err(e) if !e.is_fatal() => {
                warn!(request_id = last_request_id, error = %e, "Rejected response");
                self.pending.complete(last_request_id, Err(e));
            }
            Err(e) => {
                error!(error = %e, "Fatal error decoding response");
                self.shutdown(Err(e));
            }
        }
    }

    /// Settles `closed`, fails pending requests and stops every task. Only
    /// the first call has an effect.
    fn shutdown(&self, reason: Result<()>) {
        if !self.closed.complete(reason.clone()) {
            return;
        }
        let channel_id = self.channel.channel_id();
        let error = match reason {
            Ok(()) => {
                info!(channel_id, endpoint = %self.endpoint, "Secure channel closed");
                ProtocolError::ConnectionClosed
            }
            Err(e) => {
                warn!(channel_id, endpoint = %self.endpoint, error = %e, "Secure channel lost");
                e
            }
        };
        self.pending.fail_all(error);
        self.queue.shutdown();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        if self.established.swap(false, Ordering::AcqRel) {
            global_metrics().connection_closed();
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.shutdown(Err(ProtocolError::ConnectionClosed));
    }
}

async fn write_loop(
    mut writer: FramedWrite<OwnedWriteHalf, ChunkCodec>,
    mut commands: mpsc::UnboundedReceiver<WriterCommand>,
    conn: Weak<Connection>,
) {
    while let Some(command) = commands.recv().await {
        match command {
            WriterCommand::Chunks(chunks) => {
                let written: Result<()> = async {
                    for chunk in chunks {
                        writer.feed(chunk).await?;
                    }
                    writer.flush().await
                }
                .await;
                if let Err(e) = written {
                    if let Some(conn) = conn.upgrade() {
                        conn.shutdown(Err(e));
                    }
                    return;
                }
            }
            WriterCommand::Close(done) => {
                let _ = writer.close().await;
                let _ = done.send(());
                return;
            }
        }
    }
}

async fn read_loop(mut reader: FramedRead<OwnedReadHalf, ChunkCodec>, conn: Weak<Connection>) {
    let mut assembler = match conn.upgrade() {
        Some(conn) => ChunkAssembler::new(&conn.parameters),
        None => return,
    };
    let reason = loop {
        let frame = match reader.next().await {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => break Err(e),
            None => break Err(ProtocolError::ConnectionClosed),
        };
        let Some(strong) = conn.upgrade() else {
            return;
        };
        if let Err(e) = strong.on_frame(&mut assembler, frame).await {
            break Err(e);
        }
    };
    if let Some(conn) = conn.upgrade() {
        if conn.closing.load(Ordering::Acquire) {
            conn.shutdown(Ok(()));
        } else {
            conn.shutdown(reason);
        }
    }
}

fn schedule_renewal(conn: &Arc<Connection>, lifetime_ms: u32) {
    if lifetime_ms == 0 {
        return;
    }
    let weak = Arc::downgrade(conn);
    let task = tokio::spawn(async move {
        let mut lifetime_ms = lifetime_ms;
        loop {
            tokio::time::sleep(Duration::from_millis(u64::from(lifetime_ms) * 3 / 4)).await;
            let Some(conn) = weak.upgrade() else {
                return;
            };
            match conn
                .open_secure_channel(SecurityTokenRequestType::Renew)
                .await
            {
                Ok(token) if token.revised_lifetime > 0 => lifetime_ms = token.revised_lifetime,
                Ok(_) => return,
                Err(e) => {
                    error!(error = %e, "Security token renewal failed");
                    conn.shutdown(Err(e));
                    return;
                }
            }
        }
    });
    conn.tasks.lock().push(task.abort_handle());
}

async fn hello(
    reader: &mut FramedRead<OwnedReadHalf, ChunkCodec>,
    writer: &mut FramedWrite<OwnedWriteHalf, ChunkCodec>,
    config: &ClientConfig,
    channel_config: &ChannelConfig,
    limits: &EncodingLimits,
) -> Result<ChannelParameters> {
    let hello = ChannelParameters::hello(channel_config, &config.endpoint_url);
    writer.send(hello.encode()?).await?;

    let frame = with_timeout_error(
        async { reader.next().await.ok_or(ProtocolError::ConnectionClosed)? },
        config.hello_timeout,
    )
    .await?;

    match frame.message_type {
        MessageType::Acknowledge => {
            let ack = Acknowledge::decode(frame.body())?;
            let parameters = ChannelParameters::negotiate(channel_config, &ack);
            debug!(?parameters, "Negotiated channel parameters");
            Ok(parameters)
        }
        MessageType::Error => {
            let message = ErrorMessage::decode(frame.body(), limits)?;
            Err(ProtocolError::RemoteError {
                status: message.error,
                reason: message.reason().to_string(),
            })
        }
        other => Err(ProtocolError::UnexpectedMessage(format!(
            "expected Acknowledge, received {other:?}"
        ))),
    }
}

/// An open secure channel to one server endpoint.
pub struct ClientChannel {
    conn: Arc<Connection>,
}

impl ClientChannel {
    /// Opens a channel using the key material named in `config`.
    pub async fn connect(config: &NetworkConfig) -> Result<Self> {
        let channel = load_secure_channel(&config.client, config.limits.clone())?;
        Self::open(config.client.clone(), config.channel, channel).await
    }

    /// Connects, negotiates and opens `channel` against the configured endpoint.
    #[instrument(skip_all, fields(endpoint = %config.endpoint_url, policy = %channel.policy()))]
    pub async fn open(
        config: ClientConfig,
        channel_config: ChannelConfig,
        channel: SecureChannel,
    ) -> Result<Self> {
        if channel.role() != ChannelRole::Client {
            return Err(ProtocolError::ConfigError(
                "a client connection needs a client channel".into(),
            ));
        }
        let endpoint = EndpointUrl::parse(&config.endpoint_url)?;
        let stream = tcp::connect(&endpoint, config.connect_timeout).await?;
        let (read_half, write_half) = stream.into_split();
        let mut reader = FramedRead::new(read_half, ChunkCodec::new(channel_config.max_chunk_size));
        let mut writer =
            FramedWrite::new(write_half, ChunkCodec::new(channel_config.max_chunk_size));

        let parameters = hello(
            &mut reader,
            &mut writer,
            &config,
            &channel_config,
            channel.limits(),
        )
        .await?;
        reader
            .decoder_mut()
            .set_max_chunk_size(parameters.local_receive_buffer_size);
        writer
            .encoder_mut()
            .set_max_chunk_size(parameters.local_send_buffer_size);

        let (outgoing, commands) = mpsc::unbounded_channel();
        let conn = Arc::new(Connection {
            queue: SerializationQueue::new(parameters, config.decode_queue_capacity),
            pending: PendingRequests::new(config.max_pending_requests),
            endpoint,
            config,
            channel: Arc::new(channel),
            parameters,
            outgoing,
            closed: Promise::new(),
            closing: AtomicBool::new(false),
            established: AtomicBool::new(false),
            request_handles: AtomicU32::new(1),
            tasks: Mutex::new(Vec::new()),
        });

        let writer_task = tokio::spawn(write_loop(writer, commands, Arc::downgrade(&conn)));
        let reader_task = tokio::spawn(read_loop(reader, Arc::downgrade(&conn)));
        conn.tasks
            .lock()
            .extend([writer_task.abort_handle(), reader_task.abort_handle()]);

        let token = match conn
            .open_secure_channel(SecurityTokenRequestType::Issue)
            .await
        {
            Ok(token) => token,
            Err(e) => {
                conn.shutdown(Err(e.clone()));
                return Err(e);
            }
        };
        conn.established.store(true, Ordering::Release);
        global_metrics().connection_established();
        schedule_renewal(&conn, token.revised_lifetime);

        info!(
            channel_id = token.channel_id,
            token_id = token.token_id,
            lifetime_ms = token.revised_lifetime,
            "Secure channel open"
        );
        Ok(ClientChannel { conn })
    }

    /// Sends a service request body and waits for the response body.
    pub async fn send_request(&self, body: Bytes) -> Result<Bytes> {
        self.send_request_with_timeout(body, self.conn.config.request_timeout)
            .await
    }

    #[instrument(skip(self, body), fields(size = body.len()), level = "debug")]
    pub async fn send_request_with_timeout(&self, body: Bytes, timeout: Duration) -> Result<Bytes> {
        let conn = &self.conn;
        if conn.closed.is_completed() {
            return Err(ProtocolError::ConnectionClosed);
        }
        let max = conn.parameters.remote_max_message_size;
        if max > 0 && body.len() > max {
            return Err(ProtocolError::RequestTooLarge {
                size: body.len(),
                max,
            });
        }

        let response = conn.pending.register(Some(timeout))?;
        let request_id = response.request_id();
        conn.send(request_id, move |encoder, channel| {
            encoder.encode_symmetric(channel, MessageType::SecureMessage, request_id, &body)
        })
        .await?;
        response.wait().await
    }

    /// Sends CloseSecureChannel, waits for the transport to shut down within
    /// the close timeout and fails every pending request.
    #[instrument(skip(self), fields(channel_id = self.channel_id()))]
    pub async fn close(&self) -> Result<()> {
        let conn = &self.conn;
        if conn.closed.is_completed() {
            return Ok(());
        }
        let request = CloseSecureChannelRequest {
            request_header: RequestHeader::new(conn.next_request_handle(), 0),
        };
        let body = encode_message(&request, conn.channel.limits())?;
        // No response follows; the id only labels the chunks.
        let request_id = conn.pending.register(None)?.request_id();
        conn.pending.cancel(request_id);
        conn.closing.store(true, Ordering::Release);

        let (done_tx, done_rx) = oneshot::channel();
        let outgoing = conn.outgoing.clone();
        let result = with_timeout_error(
            async move {
                conn.send(request_id, move |encoder, channel| {
                    encoder.encode_symmetric(
                        channel,
                        MessageType::CloseSecureChannel,
                        request_id,
                        &body,
                    )
                })
                .await?;
                outgoing
                    .send(WriterCommand::Close(done_tx))
                    .map_err(|_| ProtocolError::ConnectionClosed)?;
                done_rx.await.map_err(|_| ProtocolError::ConnectionClosed)
            },
            conn.config.close_timeout,
        )
        .await;
        conn.shutdown(Ok(()));
        result
    }

    /// Resolves once the connection is gone: `Ok` after [`close`](Self::close),
    /// the cause otherwise.
    pub async fn closed(&self) -> Result<()> {
        self.conn.closed.wait().await
    }

    pub fn is_open(&self) -> bool {
        !self.conn.closed.is_completed()
    }

    pub fn channel(&self) -> &Arc<SecureChannel> {
        &self.conn.channel
    }

    pub fn channel_id(&self) -> u32 {
        self.conn.channel.channel_id()
    }

    pub fn parameters(&self) -> &ChannelParameters {
        &self.conn.parameters
    }

    pub fn endpoint(&self) -> &EndpointUrl {
        &self.conn.endpoint
    }

    /// A fresh handle for a caller-built `RequestHeader`.
    pub fn next_request_handle(&self) -> u32 {
        self.conn.next_request_handle()
    }

    pub fn pending_requests(&self) -> usize {
        self.conn.pending.len()
    }

    /// Issues a new security token now instead of waiting for the timer.
    pub async fn renew(&self) -> Result<ChannelSecurityToken> {
        self.conn
            .open_secure_channel(SecurityTokenRequestType::Renew)
            .await
    }
}

impl std::fmt::Debug for ClientChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientChannel")
            .field("endpoint", &self.conn.endpoint)
            .field("channel_id", &self.channel_id())
            .field("open", &self.is_open())
            .finish()
    }
}
