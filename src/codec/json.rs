//! JSON-RPC codec.
//!
//! `decode` never fails: anything that is not a recognizable response or
//! push notification degrades to [`Frame::Malformed`] so that the dispatch
//! loop can report it and keep going.

use serde_json::{Map, Value};

use crate::protocol::{Envelope, Frame, PushEvent, RpcError, PUSH_METHODS};

/// Longest raw excerpt kept in a [`Frame::Malformed`].
const MAX_RAW_EXCERPT: usize = 512;

/// JSON-RPC 2.0 codec.
pub struct JsonRpcCodec;

impl JsonRpcCodec {
    /// Encode a call as wire text.
    ///
    /// Deterministic for a given input; the `jsonrpc` version field is always
    /// present.
    #[inline]
    pub fn encode(id: u64, method: &str, params: &Value) -> String {
        Envelope::new(id, method, params.clone()).to_text()
    }

    /// Decode wire text back into an [`Envelope`].
    ///
    /// Used for inspecting outbound traffic (tests, loopback peers).
    pub fn decode_envelope(raw: &[u8]) -> Option<Envelope> {
        serde_json::from_slice(raw).ok()
    }

    /// Classify an inbound frame.
    pub fn decode(raw: &[u8]) -> Frame {
        let value: Value = match serde_json::from_slice(raw) {
            Ok(v) => v,
            Err(e) => return malformed(raw, format!("invalid JSON: {e}")),
        };

        let Value::Object(obj) = value else {
            return malformed(raw, "not a JSON object");
        };

        match obj.get("id") {
            Some(Value::Number(n)) => match n.as_u64() {
                Some(id) => decode_response(raw, id, obj),
                None => malformed(raw, "identifier is not an unsigned integer"),
            },
            Some(Value::Null) | None => decode_notification(raw, obj),
            Some(_) => malformed(raw, "identifier is not an unsigned integer"),
        }
    }
}

fn decode_response(raw: &[u8], id: u64, mut obj: Map<String, Value>) -> Frame {
    if let Some(error) = obj.remove("error") {
        if !error.is_null() {
            return Frame::CallError {
                id,
                error: parse_rpc_error(error),
            };
        }
    }

    match obj.remove("result") {
        Some(result) => Frame::CallResult { id, result },
        None => malformed(raw, "response carries neither result nor error"),
    }
}

fn decode_notification(raw: &[u8], mut obj: Map<String, Value>) -> Frame {
    let method = match obj.get("method").and_then(Value::as_str) {
        Some(m) => m,
        None => return malformed(raw, "no identifier and no method"),
    };

    if !PUSH_METHODS.contains(&method) {
        return malformed(raw, format!("unrecognized notification method {method}"));
    }

    let Some(Value::Object(mut params)) = obj.remove("params") else {
        return malformed(raw, "notification without params object");
    };

    let channel = match params.remove("channel") {
        Some(Value::String(channel)) => channel,
        _ => return malformed(raw, "notification without channel"),
    };

    Frame::PushEvent(PushEvent {
        channel,
        data: params.remove("data").unwrap_or(Value::Null),
    })
}

/// Lenient error-object parsing: missing fields default rather than failing.
fn parse_rpc_error(error: Value) -> RpcError {
    match serde_json::from_value::<RpcError>(error.clone()) {
        Ok(e) => e,
        Err(_) => RpcError {
            code: error.get("code").and_then(Value::as_i64).unwrap_or(0),
            message: error
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| error.to_string()),
            data: error.get("data").cloned(),
        },
    }
}

fn malformed(raw: &[u8], reason: impl Into<String>) -> Frame {
    let text = String::from_utf8_lossy(raw);
    let raw = match text.char_indices().nth(MAX_RAW_EXCERPT) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.into_owned(),
    };
    Frame::Malformed {
        raw,
        reason: reason.into(),
    }
}
