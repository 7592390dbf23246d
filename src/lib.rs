//! # deribit-wire
//!
//! JSON-RPC 2.0 session over a single WebSocket connection to the Deribit
//! test or live endpoint.
//!
//! ## Architecture
//!
//! - **Codec**: pure translation between calls and wire text, and
//!   classification of inbound frames
//! - **Transport**: the duplex connection, with one writer task and one
//!   reader task
//! - **Session**: identifier correlation of calls, the authentication gate,
//!   the subscription registry, and the dispatch loop
//!
//! ## Example
//!
//! ```no_run
//! use deribit_wire::api::channels;
//! use deribit_wire::{Credentials, Endpoint, Session};
//!
//! #[tokio::main]
//! async fn main() -> deribit_wire::Result<()> {
//!     let session = Session::builder()
//!         .endpoint(Endpoint::Test)
//!         .on_push_event(|event| println!("{} {}", event.channel, event.data))
//!         .connect()
//!         .await?;
//!
//!     session.authenticate_with(&Credentials::from_env()?).await?;
//!     let summary = session.get_account_summary("BTC").await?;
//!     println!("{summary}");
//!
//!     session.subscribe(&channels::ticker("BTC-PERPETUAL")).await?;
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod auth;
pub mod codec;
pub mod error;
pub mod pending;
pub mod protocol;
pub mod session;
pub mod subscription;
pub mod transport;
pub mod writer;

pub use api::{ChannelKind, OrderType, Side};
pub use auth::{AccessToken, AuthState, Credentials};
pub use error::{Result, SessionError};
pub use protocol::PushEvent;
pub use session::{CallOptions, Session, SessionBuilder, SessionConfig, SessionState};
pub use transport::{Connection, ConnectionState, Endpoint, TransportConfig};
