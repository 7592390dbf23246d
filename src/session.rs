//! Session builder and dispatch loop.
//!
//! The [`SessionBuilder`] collects configuration and push sinks, then
//! connects (or attaches to an existing [`Connection`]). The [`Session`]
//! owns everything shared between callers and the dispatch task:
//! 1. the pending call table and identifier counter
//! 2. the authentication state
//! 3. the subscription registry
//!
//! The first two live behind a single lock; the registry has its own.
//!
//! # Example
//!
//! ```no_run
//! use deribit_wire::{Endpoint, Session};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> deribit_wire::Result<()> {
//!     let session = Session::builder()
//!         .endpoint(Endpoint::Test)
//!         .on_push_event(|event| println!("{}: {}", event.channel, event.data))
//!         .connect()
//!         .await?;
//!
//!     let now = session.call("public/get_time", json!({}), false).await?;
//!     println!("server time: {now}");
//!
//!     session.subscribe("ticker.BTC-PERPETUAL.100ms").await?;
//!     session.close("done").await;
//!     Ok(())
//! }
//! ```

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use futures::StreamExt;
use serde_json::{json, Map, Value};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;

use crate::auth::{AccessToken, AuthState, Credentials};
use crate::codec::JsonRpcCodec;
use crate::error::{Result, SessionError};
use crate::pending::{CallOutcome, PendingCalls};
use crate::protocol::{
    Frame, PushEvent, METHOD_AUTH, METHOD_PRIVATE_SUBSCRIBE, METHOD_PRIVATE_UNSUBSCRIBE,
    METHOD_PUBLIC_SUBSCRIBE, METHOD_PUBLIC_UNSUBSCRIBE,
};
use crate::subscription::SubscriptionRegistry;
use crate::transport::{Connection, ConnectionState, Endpoint, FrameReceiver, TransportConfig};

/// Default deadline for a call.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Default deadline for the credential handshake.
pub const DEFAULT_AUTH_TIMEOUT: Duration = Duration::from_secs(10);

/// Prefix of account channels, which need the private subscribe methods.
const PRIVATE_CHANNEL_PREFIX: &str = "user.";

/// Handler for push events.
pub type PushSink = Arc<dyn Fn(&PushEvent) + Send + Sync>;

/// Session configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Deadline for calls without their own. `None` waits until the session closes.
    pub call_timeout: Option<Duration>,
    /// Deadline for the credential handshake.
    pub auth_timeout: Duration,
    /// Transport settings, used by [`SessionBuilder::connect`].
    pub transport: TransportConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            call_timeout: Some(DEFAULT_CALL_TIMEOUT),
            auth_timeout: DEFAULT_AUTH_TIMEOUT,
            transport: TransportConfig::default(),
        }
    }
}

/// Per-call options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallOptions {
    /// Requires a successful handshake; the access token is attached.
    pub privileged: bool,
    /// Overrides [`SessionConfig::call_timeout`].
    pub timeout: Option<Duration>,
}

impl CallOptions {
    /// Options for a public call.
    pub fn public() -> Self {
        Self::default()
    }

    /// Options for a privileged call.
    pub fn private() -> Self {
        Self {
            privileged: true,
            timeout: None,
        }
    }

    /// Set a deadline for this call. A zero deadline times out at once.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Observable state of a session.
///
/// A session exists only once its connection is up; connecting is the
/// builder's job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Connected, no handshake yet (or the last one failed).
    Connected,
    /// Handshake in flight.
    Authenticating,
    /// Privileged calls allowed.
    Authenticated,
    /// Terminal.
    Closed,
}

/// Builder for configuring and creating a [`Session`].
pub struct SessionBuilder {
    endpoint: Endpoint,
    config: SessionConfig,
    sinks: Vec<PushSink>,
}

impl SessionBuilder {
    /// Create a builder with default settings against the test endpoint.
    pub fn new() -> Self {
        Self {
            endpoint: Endpoint::default(),
            config: SessionConfig::default(),
            sinks: Vec::new(),
        }
    }

    /// Select the server environment.
    pub fn endpoint(mut self, endpoint: Endpoint) -> Self {
        self.endpoint = endpoint;
        self
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the default call deadline.
    ///
    /// Default: 30 seconds
    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.config.call_timeout = Some(timeout);
        self
    }

    /// Let calls without their own deadline wait until the session closes.
    pub fn no_call_timeout(mut self) -> Self {
        self.config.call_timeout = None;
        self
    }

    /// Set the handshake deadline.
    ///
    /// Default: 10 seconds
    pub fn auth_timeout(mut self, timeout: Duration) -> Self {
        self.config.auth_timeout = timeout;
        self
    }

    /// Set the connect deadline.
    ///
    /// Default: 10 seconds
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.transport.connect_timeout = timeout;
        self
    }

    /// Set how long to wait for the server to finish the close handshake.
    ///
    /// Default: 5 seconds
    pub fn close_timeout(mut self, timeout: Duration) -> Self {
        self.config.transport.close_timeout = timeout;
        self
    }

    /// Set the outbound queue capacity.
    ///
    /// Default: 1024
    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.config.transport.writer.channel_capacity = capacity;
        self
    }

    /// Set how long a send may wait for room in the outbound queue.
    ///
    /// Default: 5 seconds
    pub fn send_timeout(mut self, timeout: Duration) -> Self {
        self.config.transport.writer.send_timeout = timeout;
        self
    }

    /// Register a push event handler.
    ///
    /// Handlers run on the dispatch task, in registration order, and should
    /// return quickly.
    pub fn on_push_event<F>(mut self, sink: F) -> Self
    where
        F: Fn(&PushEvent) + Send + Sync + 'static,
    {
        self.sinks.push(Arc::new(sink));
        self
    }

    /// Connect to the selected endpoint and start the session.
    pub async fn connect(self) -> Result<Session> {
        let connection = Connection::connect(self.endpoint, self.config.transport.clone()).await?;
        self.attach(connection)
    }

    /// Start a session over an established connection.
    ///
    /// Transport settings of this builder are not applied; the connection
    /// keeps its own.
    pub fn attach(self, connection: Connection) -> Result<Session> {
        Session::start(connection, self.config, self.sinks)
    }
}

impl Default for SessionBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// State guarded by the session's single lock.
struct CoreState {
    pending: PendingCalls,
    auth: AuthState,
    closed: bool,
    /// Handshakes started so far.
    auth_attempts: u64,
    last_auth_failure: Option<String>,
}

struct SessionInner {
    connection: Connection,
    core: Mutex<CoreState>,
    subscriptions: SubscriptionRegistry,
    sinks: RwLock<Vec<PushSink>>,
    /// Serializes handshakes.
    auth_gate: tokio::sync::Mutex<()>,
    /// Set once the dispatch loop has drained the pending calls.
    drained: watch::Sender<bool>,
    config: SessionConfig,
}

/// A running session.
///
/// Calls may be issued concurrently from any number of tasks; wrap the
/// session in an `Arc` to share it.
pub struct Session {
    inner: Arc<SessionInner>,
    dispatch: Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    /// Create a new session builder.
    pub fn builder() -> SessionBuilder {
        SessionBuilder::new()
    }

    /// Connect to `endpoint` with default settings.
    pub async fn connect(endpoint: Endpoint) -> Result<Self> {
        SessionBuilder::new().endpoint(endpoint).connect().await
    }

    fn start(connection: Connection, config: SessionConfig, sinks: Vec<PushSink>) -> Result<Self> {
        let frames = connection
            .receive()
            .ok_or_else(|| SessionError::Config("connection already has a reader".to_string()))?;

        tracing::info!(url = %connection.url(), "Session started");

        let inner = Arc::new(SessionInner {
            connection,
            core: Mutex::new(CoreState {
                pending: PendingCalls::new(),
                auth: AuthState::Unauthenticated,
                closed: false,
                auth_attempts: 0,
                last_auth_failure: None,
            }),
            subscriptions: SubscriptionRegistry::new(),
            sinks: RwLock::new(sinks),
            auth_gate: tokio::sync::Mutex::new(()),
            drained: watch::channel(false).0,
            config,
        });

        let dispatch = tokio::spawn(dispatch_loop(inner.clone(), frames));

        Ok(Self {
            inner,
            dispatch: Mutex::new(Some(dispatch)),
        })
    }

    /// Issue a call and wait for its result.
    pub async fn call(&self, method: &str, params: Value, privileged: bool) -> Result<Value> {
        let options = CallOptions {
            privileged,
            timeout: None,
        };
        self.call_with(method, params, options).await
    }

    /// Issue a call with explicit options and wait for its result.
    ///
    /// A privileged call fails with [`SessionError::NotAuthenticated`] before
    /// anything is sent unless the handshake has succeeded.
    pub async fn call_with(&self, method: &str, params: Value, options: CallOptions) -> Result<Value> {
        let timeout = options.timeout.or(self.inner.config.call_timeout);

        let (id, rx, params) = {
            let mut core = self.inner.core();
            if core.closed {
                return Err(SessionError::SessionClosed);
            }
            let params = if options.privileged {
                let token = core.auth.token().ok_or(SessionError::NotAuthenticated)?;
                with_access_token(params, token.token())?
            } else {
                params
            };
            let (id, rx) = core.pending.register(method);
            (id, rx, params)
        };

        self.inner.send_call(id, method, &params).await?;
        self.inner.await_outcome(id, method, rx, timeout).await
    }

    /// Run the credential handshake.
    pub async fn authenticate(&self, client_id: &str, client_secret: &str) -> Result<()> {
        self.authenticate_with(&Credentials::new(client_id, client_secret))
            .await
    }

    /// Run the credential handshake.
    ///
    /// Handshakes are serialized. A caller that arrives while one is in
    /// flight waits for it and shares its outcome instead of sending another.
    pub async fn authenticate_with(&self, credentials: &Credentials) -> Result<()> {
        // Handshakes that had started when this caller arrived
        let baseline = {
            let core = self.inner.core();
            match core.auth {
                AuthState::Authenticating { .. } => core.auth_attempts.saturating_sub(1),
                _ => core.auth_attempts,
            }
        };

        let _gate = self.inner.auth_gate.lock().await;

        let (id, rx) = {
            let mut core = self.inner.core();
            if core.closed {
                return Err(SessionError::SessionClosed);
            }
            if core.auth.is_authenticated() {
                tracing::debug!("Already authenticated");
                return Ok(());
            }
            if core.auth_attempts > baseline {
                if let Some(reason) = core.last_auth_failure.clone() {
                    return Err(SessionError::AuthRejected(reason));
                }
            }
            let (id, rx) = core.pending.register(METHOD_AUTH);
            core.auth = AuthState::Authenticating { request_id: id };
            core.auth_attempts += 1;
            (id, rx)
        };

        tracing::info!(client_id = %credentials.client_id, id, "Authenticating");

        if let Err(e) = self
            .inner
            .send_call(id, METHOD_AUTH, &credentials.to_params())
            .await
        {
            self.inner.abandon_handshake(id, &e);
            return Err(e);
        }

        let outcome = self
            .inner
            .await_outcome(id, METHOD_AUTH, rx, Some(self.inner.config.auth_timeout))
            .await;

        match outcome {
            Ok(_) => {
                let core = self.inner.core();
                if core.auth.is_authenticated() {
                    Ok(())
                } else {
                    Err(SessionError::AuthRejected(
                        core.last_auth_failure
                            .clone()
                            .unwrap_or_else(|| "no access token issued".to_string()),
                    ))
                }
            }
            Err(e @ SessionError::Remote { .. }) => Err(SessionError::AuthRejected(rejection_reason(&e))),
            Err(e) => {
                self.inner.abandon_handshake(id, &e);
                Err(e)
            }
        }
    }

    /// Subscribe to a channel.
    ///
    /// `user.*` channels go through the privileged subscribe method. The
    /// channel becomes active once the acknowledgment lists it.
    pub async fn subscribe(&self, channel: &str) -> Result<()> {
        let (method, privileged) = if is_private_channel(channel) {
            (METHOD_PRIVATE_SUBSCRIBE, true)
        } else {
            (METHOD_PUBLIC_SUBSCRIBE, false)
        };

        if privileged && !self.is_authenticated() {
            return Err(SessionError::NotAuthenticated);
        }

        let subscriptions = &self.inner.subscriptions;
        if subscriptions.request(channel) {
            tracing::debug!(channel, "Requesting new subscription");
        }

        let options = CallOptions {
            privileged,
            timeout: None,
        };
        let ack = match self
            .call_with(method, json!({ "channels": [channel] }), options)
            .await
        {
            Ok(ack) => ack,
            Err(e) => {
                subscriptions.reject(channel);
                return Err(e);
            }
        };

        if ack_lists(&ack, channel) {
            subscriptions.confirm(channel);
            tracing::info!(channel, "Subscribed");
            Ok(())
        } else {
            subscriptions.reject(channel);
            tracing::warn!(channel, ack = %ack, "Subscription not acknowledged");
            Err(SessionError::SubscriptionRejected(channel.to_string()))
        }
    }

    /// Unsubscribe from a channel.
    ///
    /// The channel is marked inactive before the request is sent; it can be
    /// subscribed again later.
    pub async fn unsubscribe(&self, channel: &str) -> Result<()> {
        let (method, privileged) = if is_private_channel(channel) {
            (METHOD_PRIVATE_UNSUBSCRIBE, true)
        } else {
            (METHOD_PUBLIC_UNSUBSCRIBE, false)
        };

        if !self.inner.subscriptions.deactivate(channel) {
            tracing::debug!(channel, "Unsubscribing from a channel that is not active");
        }

        let options = CallOptions {
            privileged,
            timeout: None,
        };
        self.call_with(method, json!({ "channels": [channel] }), options)
            .await?;
        tracing::info!(channel, "Unsubscribed");
        Ok(())
    }

    /// Active channels, sorted.
    pub fn list_active_subscriptions(&self) -> Vec<String> {
        self.inner.subscriptions.list_active()
    }

    /// The subscription registry.
    pub fn subscriptions(&self) -> &SubscriptionRegistry {
        &self.inner.subscriptions
    }

    /// Register a push event handler on a running session.
    pub fn on_push_event<F>(&self, sink: F)
    where
        F: Fn(&PushEvent) + Send + Sync + 'static,
    {
        self.inner
            .sinks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(Arc::new(sink));
    }

    pub fn state(&self) -> SessionState {
        let core = self.inner.core();
        if core.closed || self.inner.connection.state() == ConnectionState::Closed {
            return SessionState::Closed;
        }
        match core.auth {
            AuthState::Unauthenticated => SessionState::Connected,
            AuthState::Authenticating { .. } => SessionState::Authenticating,
            AuthState::Authenticated(_) => SessionState::Authenticated,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.inner.core().auth.is_authenticated()
    }

    /// Token issued by the last successful handshake.
    pub fn access_token(&self) -> Option<AccessToken> {
        self.inner.core().auth.token().cloned()
    }

    /// Calls awaiting a response.
    pub fn pending_calls(&self) -> usize {
        self.inner.core().pending.len()
    }

    /// Frames handed to the connection so far.
    pub fn frames_sent(&self) -> u64 {
        self.inner.connection.frames_sent()
    }

    /// URL of the underlying connection.
    pub fn url(&self) -> &str {
        self.inner.connection.url()
    }

    /// Close the connection and wait for the dispatch loop to finish.
    ///
    /// Every pending call fails with [`SessionError::SessionClosed`] before
    /// this returns, including when another caller started the close.
    pub async fn close(&self, reason: &str) {
        self.inner.connection.close(reason).await;

        let mut drained = self.inner.drained.subscribe();
        if drained.wait_for(|done| *done).await.is_err() {
            tracing::debug!("Drain signal dropped before the session closed");
        }

        let dispatch = self
            .dispatch
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = dispatch {
            if let Err(e) = handle.await {
                tracing::error!("Dispatch task failed: {}", e);
            }
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let dispatch = self.dispatch.get_mut().unwrap_or_else(|e| e.into_inner());
        if let Some(handle) = dispatch.take() {
            handle.abort();
        }
    }
}

impl SessionInner {
    fn core(&self) -> MutexGuard<'_, CoreState> {
        self.core.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Encode and send a registered call. Unregisters it if the send fails.
    async fn send_call(&self, id: u64, method: &str, params: &Value) -> Result<()> {
        let text = JsonRpcCodec::encode(id, method, params);
        tracing::trace!(id, method, "Sending call");

        if let Err(e) = self.connection.send(text).await {
            let closed = {
                let mut core = self.core();
                core.pending.take(id);
                core.closed
            };
            tracing::warn!(id, method, error = %e, "Call not sent");
            let gone = matches!(
                self.connection.state(),
                ConnectionState::Closing | ConnectionState::Closed
            );
            return Err(if closed || gone {
                SessionError::SessionClosed
            } else {
                e
            });
        }
        Ok(())
    }

    /// Wait for a registered call to be settled, up to `timeout`.
    async fn await_outcome(
        &self,
        id: u64,
        method: &str,
        mut rx: oneshot::Receiver<CallOutcome>,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        let received = match timeout {
            None => Some((&mut rx).await),
            Some(limit) if limit.is_zero() => None,
            Some(limit) => tokio::time::timeout(limit, &mut rx).await.ok(),
        };

        match received {
            Some(Ok(outcome)) => outcome,
            Some(Err(_)) => Err(SessionError::SessionClosed),
            None => {
                let settled = {
                    let mut core = self.core();
                    let expired = core.pending.take(id).is_some();
                    // An expired handshake must not be completed by a late answer
                    if expired && core.auth.handshake_id() == Some(id) {
                        core.auth = AuthState::Unauthenticated;
                        core.last_auth_failure = Some("handshake timed out".to_string());
                    }
                    !expired
                };
                if settled && !timeout.is_some_and(|t| t.is_zero()) {
                    if let Ok(outcome) = rx.try_recv() {
                        return outcome;
                    }
                }
                tracing::warn!(id, method, ?timeout, "Call timed out");
                Err(SessionError::Timeout {
                    method: method.to_string(),
                    id,
                })
            }
        }
    }

    /// The handshake `id` will never be answered by us: reset the state.
    fn abandon_handshake(&self, id: u64, error: &SessionError) {
        let mut core = self.core();
        if core.auth.handshake_id() == Some(id) {
            core.auth = AuthState::Unauthenticated;
            core.last_auth_failure = Some(rejection_reason(error));
        }
    }

    fn dispatch(&self, raw: &[u8]) {
        match JsonRpcCodec::decode(raw) {
            Frame::CallResult { id, result } => self.settle(id, Ok(result)),
            Frame::CallError { id, error } => self.settle(id, Err(error.into())),
            Frame::PushEvent(event) => self.deliver(event),
            Frame::Malformed { raw, reason } => {
                tracing::warn!(%reason, raw = %raw, "Dropping malformed frame");
            }
        }
    }

    fn settle(&self, id: u64, outcome: CallOutcome) {
        let mut core = self.core();

        // The handshake answer moves the auth state before its waiter wakes
        if core.auth.handshake_id() == Some(id) && core.pending.contains(id) {
            match &outcome {
                Ok(result) => match AccessToken::from_result(result) {
                    Some(token) => {
                        tracing::info!(
                            scope = ?token.scope(),
                            expires_at = ?token.expires_at(),
                            "Authenticated"
                        );
                        core.auth = AuthState::Authenticated(token);
                        core.last_auth_failure = None;
                    }
                    None => {
                        tracing::warn!(id, "Handshake response carried no access token");
                        core.auth = AuthState::Unauthenticated;
                        core.last_auth_failure = Some("no access token issued".to_string());
                    }
                },
                Err(e) => {
                    tracing::warn!(id, error = %e, "Authentication rejected");
                    core.auth = AuthState::Unauthenticated;
                    core.last_auth_failure = Some(rejection_reason(e));
                }
            }
        }

        match core.pending.take(id) {
            Some(call) => {
                tracing::trace!(id, method = %call.method, elapsed = ?call.created_at.elapsed(), "Call settled");
                let method = call.method.clone();
                if !call.fulfil(outcome) {
                    tracing::debug!(id, %method, "Caller stopped waiting before the response arrived");
                }
            }
            None if core.pending.was_issued(id) => {
                tracing::warn!(id, "Dropping orphaned response: call is no longer pending");
            }
            None => {
                tracing::warn!(id, "Dropping orphaned response: identifier was never issued");
            }
        }
    }

    fn deliver(&self, event: PushEvent) {
        if self.subscriptions.confirm_on_event(&event.channel) {
            tracing::debug!(channel = %event.channel, "Subscription confirmed by first event");
        }

        let sinks: Vec<PushSink> = self
            .sinks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if sinks.is_empty() {
            tracing::trace!(channel = %event.channel, "No push sink registered");
            return;
        }

        for sink in sinks {
            if std::panic::catch_unwind(AssertUnwindSafe(|| sink(&event))).is_err() {
                tracing::error!(channel = %event.channel, "Push sink panicked");
            }
        }
    }
}

/// Read inbound frames until the connection closes, then fail what is left.
async fn dispatch_loop(inner: Arc<SessionInner>, mut frames: FrameReceiver) {
    while let Some(raw) = frames.next().await {
        inner.dispatch(&raw);
    }

    let drained = {
        let mut core = inner.core();
        core.closed = true;
        if core.auth.handshake_id().is_some() {
            core.auth = AuthState::Unauthenticated;
        }
        core.pending.drain_closed()
    };
    inner.drained.send_replace(true);
    tracing::info!(drained, "Session closed");
}

/// Attach `token` as `params.access_token`.
fn with_access_token(params: Value, token: &str) -> Result<Value> {
    let mut map = match params {
        Value::Null => Map::new(),
        Value::Object(map) => map,
        other => {
            return Err(SessionError::Config(format!(
                "parameters of a privileged call must be an object, got {other}"
            )))
        }
    };
    map.insert("access_token".to_string(), Value::String(token.to_string()));
    Ok(Value::Object(map))
}

fn is_private_channel(channel: &str) -> bool {
    channel.starts_with(PRIVATE_CHANNEL_PREFIX)
}

/// Whether a subscribe acknowledgment (an array of channel names) lists `channel`.
fn ack_lists(ack: &Value, channel: &str) -> bool {
    ack.as_array()
        .is_some_and(|channels| channels.iter().any(|c| c.as_str() == Some(channel)))
}

fn rejection_reason(error: &SessionError) -> String {
    match error {
        SessionError::Remote { code, message } => format!("{message} (code {code})"),
        other => other.to_string(),
    }
}
