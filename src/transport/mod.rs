//! Transport module - the single duplex connection.
//!
//! A [`Connection`] owns one duplex channel and runs its I/O on background
//! tasks for the lifetime of the connection:
//! - the writer task (see [`crate::writer`]) is the only write path
//! - the reader task is the only read path; it forwards inbound text frames
//!   to a [`FrameReceiver`], which is taken once by the session's dispatch loop
//!
//! Back-ends:
//! - [`websocket`] - TLS WebSocket to one of the two known [`Endpoint`]s
//! - [`memory`] - in-process loopback, used by tests and embedders

pub mod memory;
pub mod websocket;

use std::fmt::{self, Display};
use std::pin::Pin;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use futures::{Sink, Stream, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;

use crate::error::{Result, SessionError};
use crate::writer::{spawn_writer_task, OutboundFrame, WriterConfig, WriterHandle};

/// Test environment WebSocket URL.
pub const TEST_WS_URL: &str = "wss://test.deribit.com/ws/api/v2";

/// Live environment WebSocket URL.
pub const LIVE_WS_URL: &str = "wss://www.deribit.com/ws/api/v2";

/// Default connect (TCP + TLS + WebSocket handshake) timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default time to wait for the peer to finish the close handshake.
pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Default inbound frame queue capacity.
pub const DEFAULT_INBOUND_CAPACITY: usize = 1024;

/// One of the two known server environments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Endpoint {
    /// Test environment.
    #[default]
    Test,
    /// Live environment.
    Live,
}

impl Endpoint {
    /// WebSocket URL of this environment.
    pub fn url(&self) -> &'static str {
        match self {
            Endpoint::Test => TEST_WS_URL,
            Endpoint::Live => LIVE_WS_URL,
        }
    }
}

impl Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Test => f.write_str("test"),
            Endpoint::Live => f.write_str("live"),
        }
    }
}

impl FromStr for Endpoint {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "test" | "testnet" => Ok(Endpoint::Test),
            "live" | "mainnet" | "prod" => Ok(Endpoint::Live),
            other => Err(SessionError::Config(format!(
                "unknown endpoint {other:?}, expected \"test\" or \"live\""
            ))),
        }
    }
}

/// Lifecycle of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection attempt yet.
    Disconnected,
    /// Handshake in progress.
    Connecting,
    /// Ready to exchange frames.
    Connected,
    /// Close requested; waiting for the peer.
    Closing,
    /// Fully closed. Terminal.
    Closed,
}

/// Configuration for a connection.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Handshake timeout.
    pub connect_timeout: Duration,
    /// Time to wait for the peer to close after we send a close frame.
    pub close_timeout: Duration,
    /// Inbound frame queue capacity.
    pub inbound_capacity: usize,
    /// Writer task configuration.
    pub writer: WriterConfig,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
            inbound_capacity: DEFAULT_INBOUND_CAPACITY,
            writer: WriterConfig::default(),
        }
    }
}

/// Inbound frames of a connection, as a lazy stream.
///
/// Ends when the connection closes.
pub struct FrameReceiver {
    rx: mpsc::Receiver<Bytes>,
}

impl FrameReceiver {
    /// Wait for the next inbound frame.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }
}

impl Stream for FrameReceiver {
    type Item = Bytes;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Bytes>> {
        self.rx.poll_recv(cx)
    }
}

/// A live duplex connection.
pub struct Connection {
    url: String,
    writer: WriterHandle,
    inbound: Mutex<Option<FrameReceiver>>,
    state: Arc<watch::Sender<ConnectionState>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Connection {
    /// Connect to `endpoint` over TLS WebSocket.
    ///
    /// Returns once the connection is [`ConnectionState::Connected`].
    pub async fn connect(endpoint: Endpoint, config: TransportConfig) -> Result<Self> {
        websocket::connect(endpoint.url(), config).await
    }

    /// Start the I/O tasks over an already established sink/stream pair.
    pub(crate) fn spawn<S, R, E>(url: impl Into<String>, sink: S, stream: R, config: TransportConfig) -> Self
    where
        S: Sink<Message> + Unpin + Send + 'static,
        S::Error: Display,
        R: Stream<Item = std::result::Result<Message, E>> + Unpin + Send + 'static,
        E: Display + Send + 'static,
    {
        let url = url.into();
        let (state_tx, _) = watch::channel(ConnectionState::Connected);
        let state = Arc::new(state_tx);

        let (writer, writer_task) = spawn_writer_task(sink, config.writer.clone());
        let (inbound_tx, inbound_rx) = mpsc::channel(config.inbound_capacity);

        let writer_state = state.clone();
        let writer_watch = tokio::spawn(async move {
            match writer_task.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::warn!("Writer stopped with error: {}", e);
                    writer_state.send_if_modified(|s| mark_closing(s));
                }
                Err(e) => tracing::error!("Writer task failed: {}", e),
            }
        });

        let reader = tokio::spawn(read_loop(
            stream,
            inbound_tx,
            state.clone(),
            config.close_timeout,
        ));

        tracing::info!(url = %url, "Connection established");

        Self {
            url,
            writer,
            inbound: Mutex::new(Some(FrameReceiver { rx: inbound_rx })),
            state,
            tasks: Mutex::new(vec![reader, writer_watch]),
        }
    }

    /// URL this connection was opened against.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Subscribe to lifecycle changes.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Take the inbound frame stream.
    ///
    /// Returns `None` after the first call; there is exactly one reader.
    pub fn receive(&self) -> Option<FrameReceiver> {
        self.inbound
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }

    /// Send one text frame.
    ///
    /// Fails with [`SessionError::Send`] unless the connection is
    /// [`ConnectionState::Connected`].
    pub async fn send(&self, text: String) -> Result<()> {
        let state = self.state();
        if state != ConnectionState::Connected {
            return Err(SessionError::Send(format!("connection is {state:?}")));
        }
        self.writer.send(OutboundFrame::Text(text)).await
    }

    /// Frames accepted for sending since the connection opened.
    pub fn frames_sent(&self) -> u64 {
        self.writer.sent_count()
    }

    /// Close gracefully and wait for the I/O tasks to finish.
    ///
    /// A no-op on a connection that is already closing or closed.
    pub async fn close(&self, reason: &str) {
        let initiated = self.state.send_if_modified(|s| mark_closing(s));
        if !initiated {
            tracing::debug!(url = %self.url, "Close requested on a connection that is not open");
            return;
        }

        tracing::info!(url = %self.url, reason, "Closing connection");
        if let Err(e) = self
            .writer
            .send(OutboundFrame::Close(reason.to_string()))
            .await
        {
            tracing::debug!("Close frame not queued: {}", e);
        }

        let tasks: Vec<_> = self
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for task in tasks {
            if let Err(e) = task.await {
                tracing::debug!("I/O task ended abnormally: {}", e);
            }
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        let tasks = self.tasks.get_mut().unwrap_or_else(|e| e.into_inner());
        for task in tasks.drain(..) {
            task.abort();
        }
    }
}

/// Move an open connection to `Closing`. Returns whether the state changed.
fn mark_closing(state: &mut ConnectionState) -> bool {
    match state {
        ConnectionState::Closing | ConnectionState::Closed => false,
        _ => {
            *state = ConnectionState::Closing;
            true
        }
    }
}

/// Reader task: forwards inbound data frames until the stream ends, the peer
/// closes, or the close timeout elapses after we asked to close.
async fn read_loop<R, E>(
    mut stream: R,
    inbound: mpsc::Sender<Bytes>,
    state: Arc<watch::Sender<ConnectionState>>,
    close_timeout: Duration,
) where
    R: Stream<Item = std::result::Result<Message, E>> + Unpin,
    E: Display,
{
    let mut state_rx = state.subscribe();
    let mut close_deadline: Option<Instant> = None;

    loop {
        if close_deadline.is_none() && *state_rx.borrow_and_update() == ConnectionState::Closing {
            close_deadline = Some(Instant::now() + close_timeout);
        }

        let next = tokio::select! {
            msg = stream.next() => msg,
            changed = state_rx.changed(), if close_deadline.is_none() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
            _ = tokio::time::sleep_until(close_deadline.unwrap_or_else(Instant::now)), if close_deadline.is_some() => {
                tracing::warn!("Peer did not complete the close handshake in time");
                break;
            }
        };

        let payload = match next {
            Some(Ok(Message::Text(text))) => Bytes::copy_from_slice(text.as_str().as_bytes()),
            Some(Ok(Message::Binary(data))) => data,
            Some(Ok(Message::Close(frame))) => {
                tracing::info!(?frame, "Peer closed the connection");
                break;
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                tracing::error!("WebSocket read failed: {}", e);
                break;
            }
            None => {
                tracing::debug!("Inbound stream ended");
                break;
            }
        };

        if inbound.send(payload).await.is_err() {
            tracing::debug!("Inbound receiver dropped, reader stopping");
            break;
        }
    }

    state.send_replace(ConnectionState::Closed);
}
