//! TLS WebSocket back-end.

use futures::StreamExt;
use tokio_tungstenite::connect_async;

use super::{Connection, TransportConfig};
use crate::error::{Result, SessionError};

/// Install the process-wide rustls crypto provider.
///
/// Installing twice is harmless; the second attempt is ignored.
fn install_crypto_provider() {
    let _ = rustls::crypto::ring::default_provider().install_default();
}

/// Open a WebSocket connection to `url` and start its I/O tasks.
pub(crate) async fn connect(url: &str, config: TransportConfig) -> Result<Connection> {
    install_crypto_provider();

    tracing::debug!(url, timeout = ?config.connect_timeout, "Connecting");
    let (ws, response) = tokio::time::timeout(config.connect_timeout, connect_async(url))
        .await
        .map_err(|_| {
            SessionError::Connection(format!(
                "handshake with {url} timed out after {:?}",
                config.connect_timeout
            ))
        })?
        .map_err(|e| SessionError::Connection(format!("failed to connect to {url}: {e}")))?;

    tracing::debug!(status = %response.status(), "WebSocket handshake complete");

    let (sink, stream) = ws.split();
    Ok(Connection::spawn(url, sink, stream, config))
}
