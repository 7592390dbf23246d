//! Codec module - translation between calls and wire text.
//!
//! - [`JsonRpcCodec`] - JSON-RPC 2.0 encoding of outbound calls and
//!   classification of inbound frames
//!
//! # Design
//!
//! The codec is a marker struct with static methods rather than a trait
//! object. It is stateless; identifiers are allocated by the session.
//!
//! # Example
//!
//! ```
//! use deribit_wire::codec::JsonRpcCodec;
//! use deribit_wire::protocol::Frame;
//! use serde_json::json;
//!
//! let text = JsonRpcCodec::encode(1, "public/get_time", &json!({}));
//! assert!(text.contains("public/get_time"));
//!
//! let frame = JsonRpcCodec::decode(br#"{"jsonrpc":"2.0","id":1,"result":1700000000000}"#);
//! assert_eq!(frame.call_id(), Some(1));
//!
//! assert!(matches!(JsonRpcCodec::decode(b"\xff\x00"), Frame::Malformed { .. }));
//! ```

mod json;

pub use json::JsonRpcCodec;
