use std::time::Duration;

use http::Uri;
use tokio::net::TcpStream;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::error::RelayError;

/// Default upstream the relay forwards to.
pub const DEFAULT_UPSTREAM: &str = "ws://localhost:1323/ws";

pub type UpstreamStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Opens client WebSocket connections to one fixed upstream address.
///
/// Each call to [`dial`](Self::dial) performs exactly one handshake attempt.
#[derive(Debug, Clone)]
pub struct Dialer {
    url: String,
    connect_timeout: Option<Duration>,
}

impl Dialer {
    /// Validate `url` and build a dialer for it.
    pub fn new(url: impl Into<String>, connect_timeout: Option<Duration>) -> Result<Self, RelayError> {
        let url = url.into();
        let uri = validate_upstream(&url)?;
        if uri.scheme_str() == Some("wss") {
            install_crypto_provider();
        }
        Ok(Self {
            url,
            connect_timeout,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Connect to the upstream. Network errors, handshake refusals and
    /// timeouts all map to [`RelayError::DialFailed`].
    pub async fn dial(&self) -> Result<UpstreamStream, RelayError> {
        let connect = tokio_tungstenite::connect_async(self.url.as_str());

        let result = match self.connect_timeout {
            Some(limit) => match tokio::time::timeout(limit, connect).await {
                Ok(result) => result,
                Err(_) => {
                    return Err(self.failed(format!("timed out after {}ms", limit.as_millis())));
                }
            },
            None => connect.await,
        };

        match result {
            Ok((ws, response)) => {
                tracing::debug!(
                    upstream = %self.url,
                    status = %response.status(),
                    "upstream handshake complete"
                );
                Ok(ws)
            }
            Err(err) => Err(self.failed(err.to_string())),
        }
    }

    fn failed(&self, reason: String) -> RelayError {
        RelayError::DialFailed {
            url: self.url.clone(),
            reason,
        }
    }
}

/// rustls needs a process-wide crypto provider before the first TLS dial.
fn install_crypto_provider() {
    // Err means a provider is already installed, which is all we need.
    let _ = rustls::crypto::ring::default_provider().install_default();
}

fn validate_upstream(url: &str) -> Result<Uri, RelayError> {
    let invalid = |reason: &str| RelayError::InvalidUpstream {
        url: url.to_string(),
        reason: reason.to_string(),
    };

    let uri: Uri = url.parse().map_err(|_| invalid("not a valid URI"))?;
    match uri.scheme_str() {
        Some("ws") | Some("wss") => {}
        Some(_) => return Err(invalid("scheme must be ws:// or wss://")),
        None => return Err(invalid("missing ws:// or wss:// scheme")),
    }
    if uri.host().map_or(true, str::is_empty) {
        return Err(invalid("missing host"));
    }
    Ok(uri)
}
