use thiserror::Error;
use tokio_tungstenite::tungstenite;

/// Failures that prevent a relay session from being established.
///
/// The normal end of an established session is not an error; it is reported
/// as a [`SessionReport`](crate::relay::SessionReport).
#[derive(Debug, Error)]
pub enum RelayError {
    /// The handshake's `Origin` header is not in the allowlist.
    #[error("origin {} is not allowed", .origin.as_deref().unwrap_or("<none>"))]
    HandshakeRejected { origin: Option<String> },

    /// The handshake targeted a path other than the relay route.
    #[error("no relay route at '{path}'")]
    RouteNotFound { path: String },

    /// The client handshake was malformed or interrupted.
    #[error("websocket upgrade failed: {0}")]
    UpgradeFailed(#[source] tungstenite::Error),

    /// The upstream could not be reached or refused the handshake.
    #[error("failed to dial upstream {url}: {reason}")]
    DialFailed { url: String, reason: String },

    /// The configured upstream address cannot be dialed at all.
    #[error("invalid upstream url '{url}': {reason}")]
    InvalidUpstream { url: String, reason: String },
}

impl RelayError {
    /// Whether the failure was a deliberate refusal by the relay rather
    /// than a transport problem.
    pub fn is_refusal(&self) -> bool {
        matches!(
            self,
            RelayError::HandshakeRejected { .. } | RelayError::RouteNotFound { .. }
        )
    }
}
