//! Inbound frame taxonomy.
//!
//! Every text frame received from the server is classified as exactly one
//! [`Frame`] variant. The classification is by shape:
//!
//! | Shape | Variant |
//! |---|---|
//! | `id` + `result` | [`Frame::CallResult`] |
//! | `id` + `error` | [`Frame::CallError`] |
//! | `method` in [`PUSH_METHODS`](super::PUSH_METHODS), `params.channel` | [`Frame::PushEvent`] |
//! | anything else | [`Frame::Malformed`] |

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// JSON-RPC error object carried by a [`Frame::CallError`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    /// Error code.
    pub code: i64,
    /// Error message.
    pub message: String,
    /// Additional error data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// An unsolicited notification delivered on a subscribed channel.
#[derive(Debug, Clone, PartialEq)]
pub struct PushEvent {
    /// Channel name, e.g. `ticker.BTC-PERPETUAL.100ms`.
    pub channel: String,
    /// Channel-specific payload.
    pub data: Value,
}

/// A classified inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Successful response to the call with this identifier.
    CallResult {
        /// Identifier of the call being answered.
        id: u64,
        /// The `result` member.
        result: Value,
    },
    /// Error response to the call with this identifier.
    CallError {
        /// Identifier of the call being answered.
        id: u64,
        /// The `error` member.
        error: RpcError,
    },
    /// Push notification, not correlated to any call.
    PushEvent(PushEvent),
    /// Unparseable or unrecognized frame.
    Malformed {
        /// Raw frame text (lossy UTF-8).
        raw: String,
        /// Why classification failed.
        reason: String,
    },
}

impl Frame {
    /// Identifier of the call this frame answers, if any.
    pub fn call_id(&self) -> Option<u64> {
        match self {
            Frame::CallResult { id, .. } | Frame::CallError { id, .. } => Some(*id),
            _ => None,
        }
    }

    /// Check if this is a response to a call.
    #[inline]
    pub fn is_response(&self) -> bool {
        self.call_id().is_some()
    }

    /// Check if this is a push event.
    #[inline]
    pub fn is_push(&self) -> bool {
        matches!(self, Frame::PushEvent(_))
    }

    /// Check if this frame could not be classified.
    #[inline]
    pub fn is_malformed(&self) -> bool {
        matches!(self, Frame::Malformed { .. })
    }
}
