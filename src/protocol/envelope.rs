//! Outbound call envelope.
//!
//! ```text
//! { "jsonrpc": "2.0", "id": 17, "method": "public/get_time", "params": {} }
//! ```
//!
//! The identifier is assigned by the session when the call is issued and is
//! the only key used to correlate the response.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Protocol version embedded in every envelope.
pub const JSONRPC_VERSION: &str = "2.0";

/// Credential handshake method.
pub const METHOD_AUTH: &str = "public/auth";

/// Subscribe to market channels.
pub const METHOD_PUBLIC_SUBSCRIBE: &str = "public/subscribe";

/// Unsubscribe from market channels.
pub const METHOD_PUBLIC_UNSUBSCRIBE: &str = "public/unsubscribe";

/// Subscribe to account channels (`user.*`). Privileged.
pub const METHOD_PRIVATE_SUBSCRIBE: &str = "private/subscribe";

/// Unsubscribe from account channels (`user.*`). Privileged.
pub const METHOD_PRIVATE_UNSUBSCRIBE: &str = "private/unsubscribe";

/// Method markers that identify an unsolicited push notification.
///
/// Both endpoints send `subscription`; `event` is accepted as well.
pub const PUSH_METHODS: &[&str] = &["subscription", "event"];

/// A single outbound call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Protocol version, always [`JSONRPC_VERSION`].
    pub jsonrpc: String,
    /// Session-unique call identifier.
    pub id: u64,
    /// Method name, e.g. `public/get_time`.
    pub method: String,
    /// Method parameters (a JSON object).
    pub params: Value,
}

impl Envelope {
    /// Create a new envelope.
    ///
    /// `Null` parameters are normalized to an empty object.
    pub fn new(id: u64, method: impl Into<String>, params: Value) -> Self {
        let params = match params {
            Value::Null => Value::Object(Default::default()),
            other => other,
        };
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            method: method.into(),
            params,
        }
    }

    /// Render the envelope as wire text.
    pub fn to_text(&self) -> String {
        serde_json::json!({
            "jsonrpc": self.jsonrpc,
            "id": self.id,
            "method": self.method,
            "params": self.params,
        })
        .to_string()
    }
}
