//! In-process loopback back-end.
//!
//! [`pair`] returns a [`Connection`] and the [`MemoryPeer`] standing in for
//! the server. The peer sees every outbound frame and can inject responses,
//! push events, raw text, or a disconnect.
//!
//! The peer side completes the close handshake automatically, the way a
//! real server does.

use std::convert::Infallible;

use futures::channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender};
use futures::{future, FutureExt, SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio_tungstenite::tungstenite::Message;

use super::{Connection, TransportConfig};
use crate::codec::JsonRpcCodec;
use crate::protocol::{Envelope, JSONRPC_VERSION};

/// URL reported by loopback connections.
pub const MEMORY_URL: &str = "memory://loopback";

type Inbound = std::result::Result<Message, Infallible>;

/// Create a connected loopback pair.
pub fn pair(config: TransportConfig) -> (Connection, MemoryPeer) {
    let (out_tx, out_rx) = unbounded::<Message>();
    let (in_tx, in_rx) = unbounded::<Inbound>();

    let echo = in_tx.clone();
    let sink = out_tx.with(move |msg: Message| {
        if msg.is_close() {
            let _ = echo.unbounded_send(Ok(Message::Close(None)));
            echo.close_channel();
        }
        future::ready(Ok::<_, futures::channel::mpsc::SendError>(msg))
    });

    let connection = Connection::spawn(MEMORY_URL, sink, in_rx, config);
    let peer = MemoryPeer {
        inbound: in_tx,
        outbound: out_rx,
    };
    (connection, peer)
}

/// Server side of a loopback pair.
pub struct MemoryPeer {
    inbound: UnboundedSender<Inbound>,
    outbound: UnboundedReceiver<Message>,
}

impl MemoryPeer {
    /// Next frame the client sent, of any kind.
    pub async fn next_message(&mut self) -> Option<Message> {
        self.outbound.next().await
    }

    /// Next call the client sent.
    ///
    /// Returns `None` once the client closes or the connection is gone.
    /// Frames that do not decode as a call are skipped.
    pub async fn next_request(&mut self) -> Option<Envelope> {
        loop {
            match self.next_message().await? {
                Message::Text(text) => {
                    if let Some(env) = JsonRpcCodec::decode_envelope(text.as_str().as_bytes()) {
                        return Some(env);
                    }
                    tracing::warn!(text = %text.as_str(), "Peer skipped an undecodable frame");
                }
                Message::Close(_) => return None,
                _ => continue,
            }
        }
    }

    /// A call the client already sent, without waiting.
    pub fn try_next_request(&mut self) -> Option<Envelope> {
        loop {
            match self.outbound.next().now_or_never()?? {
                Message::Text(text) => {
                    if let Some(env) = JsonRpcCodec::decode_envelope(text.as_str().as_bytes()) {
                        return Some(env);
                    }
                }
                Message::Close(_) => return None,
                _ => continue,
            }
        }
    }

    /// Answer call `id` with `result`.
    pub fn respond(&self, id: u64, result: Value) -> bool {
        self.send_value(json!({
            "jsonrpc": JSONRPC_VERSION,
            "id": id,
            "result": result,
        }))
    }

    /// Answer call `id` with an error object.
    pub fn respond_error(&self, id: u64, code: i64, message: &str) -> bool {
        self.send_value(json!({
            "jsonrpc": JSONRPC_VERSION,
            "id": id,
            "error": {"code": code, "message": message},
        }))
    }

    /// Deliver a push event on `channel`.
    pub fn push(&self, channel: &str, data: Value) -> bool {
        self.send_value(json!({
            "jsonrpc": JSONRPC_VERSION,
            "method": "subscription",
            "params": {"channel": channel, "data": data},
        }))
    }

    /// Deliver arbitrary text, parsed or not.
    pub fn send_raw(&self, text: impl Into<String>) -> bool {
        self.inbound
            .unbounded_send(Ok(Message::text(text.into())))
            .is_ok()
    }

    /// Drop the connection from the server side.
    pub fn disconnect(&self) {
        self.inbound.close_channel();
    }

    fn send_value(&self, value: Value) -> bool {
        self.send_raw(value.to_string())
    }
}
