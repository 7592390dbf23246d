//! Dedicated writer task for outbound WebSocket frames.
//!
//! The connection has exactly one writer path. Callers never touch the
//! socket; they hand frames to a [`WriterHandle`], which queues them on an
//! mpsc channel drained by a single writer task.
//!
//! # Architecture
//!
//! ```text
//! Caller 1 ─┐
//! Caller 2 ─┼─► mpsc::Sender<OutboundFrame> ─► Writer Task ─► WebSocket sink
//! Caller N ─┘
//! ```
//!
//! Frames that are already queued when the task wakes up are fed to the sink
//! together and flushed once.

use std::fmt::Display;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{Sink, SinkExt};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

use crate::error::{Result, SessionError};

/// Default channel capacity.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Default time a send may wait for room in a full queue.
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum frames fed to the sink before a flush.
const MAX_BATCH_SIZE: usize = 64;

/// A frame ready to be written to the socket.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundFrame {
    /// A JSON-RPC text frame.
    Text(String),
    /// A close handshake with the given reason. Ends the writer task.
    Close(String),
}

impl OutboundFrame {
    fn into_message(self) -> Message {
        match self {
            OutboundFrame::Text(text) => Message::text(text),
            OutboundFrame::Close(reason) => Message::Close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: reason.into(),
            })),
        }
    }
}

/// Configuration for the writer task.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Channel capacity for the frame queue.
    pub channel_capacity: usize,
    /// How long a send waits when the queue is full.
    pub send_timeout: Duration,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            send_timeout: DEFAULT_SEND_TIMEOUT,
        }
    }
}

/// Handle for sending frames to the writer task.
///
/// Cheaply cloneable.
#[derive(Clone)]
pub struct WriterHandle {
    tx: mpsc::Sender<OutboundFrame>,
    /// Frames accepted by the queue since the task started.
    sent: Arc<AtomicU64>,
    timeout: Duration,
}

impl WriterHandle {
    fn new(tx: mpsc::Sender<OutboundFrame>, timeout: Duration) -> Self {
        Self {
            tx,
            sent: Arc::new(AtomicU64::new(0)),
            timeout,
        }
    }

    /// Queue a frame for the writer task.
    ///
    /// Waits up to the configured timeout if the queue is full.
    pub async fn send(&self, frame: OutboundFrame) -> Result<()> {
        match self.tx.send_timeout(frame, self.timeout).await {
            Ok(()) => {
                self.sent.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(SendTimeoutError::Timeout(_)) => {
                Err(SessionError::Send("write queue full".to_string()))
            }
            Err(SendTimeoutError::Closed(_)) => {
                Err(SessionError::Send("writer task has stopped".to_string()))
            }
        }
    }

    /// Frames accepted since the writer started.
    #[inline]
    pub fn sent_count(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }
}

/// Spawn the writer task and return a handle for sending frames.
///
/// The task ends when every handle is dropped, after a
/// [`OutboundFrame::Close`] has been written, or on the first sink error.
pub fn spawn_writer_task<S>(sink: S, config: WriterConfig) -> (WriterHandle, JoinHandle<Result<()>>)
where
    S: Sink<Message> + Unpin + Send + 'static,
    S::Error: Display,
{
    let (tx, rx) = mpsc::channel(config.channel_capacity);
    let handle = WriterHandle::new(tx, config.send_timeout);
    let task = tokio::spawn(writer_loop(rx, sink));

    (handle, task)
}

async fn writer_loop<S>(
    mut rx: mpsc::Receiver<OutboundFrame>,
    mut sink: S,
) -> Result<()>
where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    loop {
        let first = match rx.recv().await {
            Some(f) => f,
            None => {
                tracing::debug!("Writer channel closed");
                return Ok(());
            }
        };

        let mut batch = Vec::with_capacity(MAX_BATCH_SIZE);
        batch.push(first);
        while batch.len() < MAX_BATCH_SIZE {
            match rx.try_recv() {
                Ok(frame) => batch.push(frame),
                Err(_) => break,
            }
        }

        match write_batch(&mut sink, batch).await {
            Ok(false) => {}
            Ok(true) => {
                tracing::debug!("Close frame written, writer stopping");
                return Ok(());
            }
            Err(e) => {
                tracing::error!("WebSocket write failed: {}", e);
                return Err(e);
            }
        }
    }
}

/// Feed a batch to the sink and flush.
///
/// Returns `Ok(true)` when the batch contained a close frame; frames after it
/// are discarded.
async fn write_batch<S>(sink: &mut S, batch: Vec<OutboundFrame>) -> Result<bool>
where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    for frame in batch {
        let is_close = matches!(frame, OutboundFrame::Close(_));
        sink.feed(frame.into_message())
            .await
            .map_err(|e| SessionError::Send(e.to_string()))?;

        if is_close {
            sink.flush()
                .await
                .map_err(|e| SessionError::Send(e.to_string()))?;
            if let Err(e) = sink.close().await {
                tracing::debug!("Sink close after close frame: {}", e);
            }
            return Ok(true);
        }
    }

    sink.flush()
        .await
        .map_err(|e| SessionError::Send(e.to_string()))?;
    Ok(false)
}
