//! Ordered execution of chunk encoding and decoding.
//!
//! A channel's [`ChunkEncoder`] and [`ChunkDecoder`] each live on their own
//! task and are handed work through FIFO channels, so the order in which
//! messages are submitted is the order in which they are serialized, and the
//! order in which chunks arrive is the order in which responses are delivered.
//! The decode side is bounded; a full queue rejects the submission.

use crate::error::{constants, ProtocolError, Result};
use crate::protocol::channel::ChannelParameters;
use crate::protocol::chunk_decoder::ChunkDecoder;
use crate::protocol::chunk_encoder::ChunkEncoder;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;
use tracing::{debug, warn};

type EncodeTask = Box<dyn FnOnce(&mut ChunkEncoder) + Send>;
type DecodeTask = Box<dyn FnOnce(&mut ChunkDecoder) + Send>;

/// Result of a queued task.
#[derive(Debug)]
pub struct Completion<T>(oneshot::Receiver<T>);

impl<T> Future for Completion<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.0)
            .poll(cx)
            .map(|r| r.map_err(|_| ProtocolError::Custom(constants::ERR_QUEUE_SHUTDOWN.into())))
    }
}

#[derive(Clone)]
pub struct SerializationQueue {
    encode_tx: mpsc::UnboundedSender<EncodeTask>,
    decode_tx: mpsc::Sender<DecodeTask>,
    workers: Arc<[AbortHandle; 2]>,
}

impl SerializationQueue {
    /// Spawns the encode and decode workers on the current runtime.
    pub fn new(parameters: ChannelParameters, decode_capacity: usize) -> Self {
        Self::with_codecs(
            ChunkEncoder::new(parameters),
            ChunkDecoder::new(parameters),
            decode_capacity,
        )
    }

    pub fn with_codecs(
        mut encoder: ChunkEncoder,
        mut decoder: ChunkDecoder,
        decode_capacity: usize,
    ) -> Self {
        let (encode_tx, mut encode_rx) = mpsc::unbounded_channel::<EncodeTask>();
        let (decode_tx, mut decode_rx) = mpsc::channel::<DecodeTask>(decode_capacity.max(1));

        let encode_worker = tokio::spawn(async move {
            while let Some(task) = encode_rx.recv().await {
                task(&mut encoder);
            }
            debug!("Encode queue drained");
        });
        let decode_worker = tokio::spawn(async move {
            while let Some(task) = decode_rx.recv().await {
                task(&mut decoder);
            }
            debug!("Decode queue drained");
        });

        SerializationQueue {
            encode_tx,
            decode_tx,
            workers: Arc::new([encode_worker.abort_handle(), decode_worker.abort_handle()]),
        }
    }

    /// Queues `task` behind every encode submitted before it.
    pub fn encode<F, T>(&self, task: F) -> Result<Completion<T>>
    where
        F: FnOnce(&mut ChunkEncoder) -> T + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.encode_tx
            .send(Box::new(move |encoder| {
                let _ = tx.send(task(encoder));
            }))
            .map_err(|_| ProtocolError::Custom(constants::ERR_QUEUE_SHUTDOWN.into()))?;
        Ok(Completion(rx))
    }

    /// Queues `task` behind every decode submitted before it, failing with
    /// [`ProtocolError::QueueFull`] when the queue is at capacity.
    pub fn decode<F, T>(&self, task: F) -> Result<Completion<T>>
    where
        F: FnOnce(&mut ChunkDecoder) -> T + Send + 'static,
        T: Send + 'static,
    {
        let (boxed, completion) = Self::boxed_decode(task);
        match self.decode_tx.try_send(boxed) {
            Ok(()) => Ok(completion),
            Err(mpsc::error::TrySendError::Full(_)) => Err(ProtocolError::QueueFull),
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Err(ProtocolError::Custom(constants::ERR_QUEUE_SHUTDOWN.into()))
            }
        }
    }

    /// Like [`decode`](Self::decode), but waits for room instead of failing.
    pub async fn decode_or_wait<F, T>(&self, task: F) -> Result<Completion<T>>
    where
        F: FnOnce(&mut ChunkDecoder) -> T + Send + 'static,
        T: Send + 'static,
    {
        let (boxed, completion) = Self::boxed_decode(task);
        let boxed = match self.decode_tx.try_send(boxed) {
            Ok(()) => return Ok(completion),
            Err(mpsc::error::TrySendError::Full(boxed)) => {
                warn!("Decode queue full, applying backpressure");
                boxed
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                return Err(ProtocolError::Custom(constants::ERR_QUEUE_SHUTDOWN.into()))
            }
        };
        self.decode_tx
            .send(boxed)
            .await
            .map_err(|_| ProtocolError::Custom(constants::ERR_QUEUE_SHUTDOWN.into()))?;
        Ok(completion)
    }

    fn boxed_decode<F, T>(task: F) -> (DecodeTask, Completion<T>)
    where
        F: FnOnce(&mut ChunkDecoder) -> T + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let boxed: DecodeTask = Box::new(move |decoder| {
            let _ = tx.send(task(decoder));
        });
        (boxed, Completion(rx))
    }

    /// Stops both workers. Queued tasks are dropped and their completions fail.
    pub fn shutdown(&self) {
        for worker in self.workers.iter() {
            worker.abort();
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.encode_tx.is_closed()
    }
}

impl std::fmt::Debug for SerializationQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerializationQueue")
            .field("decode_capacity", &self.decode_tx.max_capacity())
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}
