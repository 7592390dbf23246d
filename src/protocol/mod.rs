//! Protocol module - JSON-RPC envelope and inbound frame taxonomy.
//!
//! This module describes the shapes exchanged over the WebSocket:
//! - [`Envelope`] - an outbound call (`jsonrpc`, `id`, `method`, `params`)
//! - [`Frame`] - every inbound text frame, classified as a call result,
//!   a call error, a push event or a malformed frame
//! - Reserved method names used by the session core

mod envelope;
mod frame;

pub use envelope::{
    Envelope, JSONRPC_VERSION, METHOD_AUTH, METHOD_PRIVATE_SUBSCRIBE, METHOD_PRIVATE_UNSUBSCRIBE,
    METHOD_PUBLIC_SUBSCRIBE, METHOD_PUBLIC_UNSUBSCRIBE, PUSH_METHODS,
};
pub use frame::{Frame, PushEvent, RpcError};
