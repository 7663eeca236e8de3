use std::sync::{Arc, Mutex};

use http::StatusCode;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::handshake::server::{
    ErrorResponse, Request as HsRequest, Response as HsResponse,
};
use tokio_tungstenite::WebSocketStream;

use crate::error::RelayError;
use crate::origin::OriginAllowlist;

/// Default path of the relay route.
pub const DEFAULT_ROUTE: &str = "/ws";

/// What an inbound handshake has to satisfy before it is upgraded.
#[derive(Debug, Clone)]
pub struct HandshakePolicy {
    /// Request path the relay answers on. Anything else gets a 404.
    pub route_path: String,
    pub allowlist: Arc<OriginAllowlist>,
}

impl HandshakePolicy {
    pub fn new(route_path: impl Into<String>, allowlist: OriginAllowlist) -> Self {
        Self {
            route_path: route_path.into(),
            allowlist: Arc::new(allowlist),
        }
    }
}

/// An established client-side WebSocket connection.
pub struct ClientHandshake<S> {
    pub ws: WebSocketStream<S>,
    /// The `Origin` header sent with the upgrade request, if any.
    pub origin: Option<String>,
}

/// Outcome recorded by the handshake callback.
#[derive(Debug, Default)]
enum Gate {
    #[default]
    Pending,
    Passed,
    WrongRoute(String),
    ForbiddenOrigin,
}

/// Accept a WebSocket handshake on `stream`, enforcing the route and origin
/// policy before the upgrade completes.
///
/// On any failure the stream is dropped before returning, so no half-open
/// connection is left behind.
pub async fn upgrade<S>(
    stream: S,
    policy: &HandshakePolicy,
) -> Result<ClientHandshake<S>, RelayError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let gate: Arc<Mutex<(Gate, Option<String>)>> = Arc::new(Mutex::new(Default::default()));
    let gate_cb = Arc::clone(&gate);
    let route_path = policy.route_path.clone();
    let allowlist = Arc::clone(&policy.allowlist);

    let callback =
        move |req: &HsRequest, response: HsResponse| -> Result<HsResponse, ErrorResponse> {
            let origin = req
                .headers()
                .get(http::header::ORIGIN)
                .and_then(|v| v.to_str().ok())
                .map(|s| s.to_string());
            let path = req.uri().path().to_string();

            let verdict = if path != route_path {
                Gate::WrongRoute(path)
            } else if !allowlist.permits(origin.as_deref()) {
                Gate::ForbiddenOrigin
            } else {
                Gate::Passed
            };

            let refusal = match &verdict {
                Gate::WrongRoute(_) => Some((StatusCode::NOT_FOUND, "Not Found")),
                Gate::ForbiddenOrigin => Some((StatusCode::FORBIDDEN, "Origin not allowed")),
                Gate::Pending | Gate::Passed => None,
            };

            if let Ok(mut guard) = gate_cb.lock() {
                *guard = (verdict, origin);
            }

            match refusal {
                Some((status, body)) => {
                    let mut err_response = ErrorResponse::new(Some(body.to_string()));
                    *err_response.status_mut() = status;
                    Err(err_response)
                }
                None => Ok(response),
            }
        };

    let result = tokio_tungstenite::accept_hdr_async(stream, callback).await;

    let (verdict, origin) = match gate.lock() {
        Ok(mut guard) => std::mem::take(&mut *guard),
        Err(_) => (Gate::Pending, None),
    };

    match result {
        Ok(ws) => Ok(ClientHandshake { ws, origin }),
        Err(err) => Err(match verdict {
            Gate::WrongRoute(path) => RelayError::RouteNotFound { path },
            Gate::ForbiddenOrigin => RelayError::HandshakeRejected { origin },
            Gate::Pending | Gate::Passed => RelayError::UpgradeFailed(err),
        }),
    }
}
