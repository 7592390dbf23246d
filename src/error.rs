//! Error types for deribit-wire.

use thiserror::Error;

use crate::protocol::RpcError;

/// Main error type for all session operations.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Handshake or transport failure. Fatal to the session.
    #[error("Connection error: {0}")]
    Connection(String),

    /// A frame could not be handed to the connection. The session stays usable.
    #[error("Send error: {0}")]
    Send(String),

    /// The server refused the credentials. The session stays unauthenticated.
    #[error("Authentication rejected: {0}")]
    AuthRejected(String),

    /// A privileged call was attempted before a successful handshake.
    #[error("Not authenticated")]
    NotAuthenticated,

    /// No response arrived before the call's deadline.
    #[error("Timed out waiting for {method} (id {id})")]
    Timeout {
        /// Method of the abandoned call.
        method: String,
        /// Identifier of the abandoned call.
        id: u64,
    },

    /// The server answered with a JSON-RPC error object.
    #[error("Remote error {code}: {message}")]
    Remote {
        /// Error code from the server.
        code: i64,
        /// Error message from the server.
        message: String,
    },

    /// The session is closed. Terminal.
    #[error("Session closed")]
    SessionClosed,

    /// The subscribe acknowledgment did not include the requested channel.
    #[error("Subscription rejected for channel {0}")]
    SubscriptionRejected(String),

    /// Invalid configuration value.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl SessionError {
    /// Whether issuing the same operation again may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SessionError::Send(_) | SessionError::Timeout { .. } | SessionError::AuthRejected(_)
        )
    }
}

impl From<RpcError> for SessionError {
    fn from(error: RpcError) -> Self {
        SessionError::Remote {
            code: error.code,
            message: error.message,
        }
    }
}

/// Result type alias using SessionError.
pub type Result<T> = std::result::Result<T, SessionError>;
