use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use audit_log::{AuditEntry, AuditEventType, AuditSink, AuditSource};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::connection::{Leg, LegWriter};
use crate::dialer::Dialer;
use crate::error::RelayError;
use crate::handshake::{self, HandshakePolicy};
use crate::origin::OriginAllowlist;
use crate::relay::{RelaySession, SessionReport};

/// Pause after a failed `accept` so a persistent error (e.g. out of file
/// descriptors) does not spin the loop.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// How long live sessions get to close their legs after shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Configuration for the relay server.
pub struct RelayConfig {
    /// Address to bind the listening socket to.
    pub listen_addr: SocketAddr,
    /// WebSocket URL every session is relayed to.
    pub upstream_url: String,
    /// Request path accepted for the upgrade.
    pub route_path: String,
    /// Origins allowed to open a session. `*` allows all.
    pub origin_allowlist: Vec<String>,
    /// Upper bound on the upstream handshake.
    pub dial_timeout: Option<Duration>,
    /// End a session direction after this long without a frame.
    pub idle_timeout: Option<Duration>,
    pub audit: AuditSink,
}

/// Immutable state shared by every session of a relay.
pub struct RelayContext {
    pub handshake: HandshakePolicy,
    pub dialer: Dialer,
    pub idle_timeout: Option<Duration>,
    pub audit: AuditSink,
}

/// The WebSocket relay server.
///
/// Accepts client connections, validates their handshake, dials the
/// upstream and relays frames between the two until either side ends.
pub struct Relay {
    listen_addr: SocketAddr,
    ctx: Arc<RelayContext>,
}

impl Relay {
    /// Validate `config` and build the relay. Fails only if the upstream URL
    /// cannot be dialed in principle.
    pub fn new(config: RelayConfig) -> Result<Self, RelayError> {
        let dialer = Dialer::new(config.upstream_url, config.dial_timeout)?;
        let allowlist = OriginAllowlist::new(config.origin_allowlist);

        Ok(Self {
            listen_addr: config.listen_addr,
            ctx: Arc::new(RelayContext {
                handshake: HandshakePolicy::new(config.route_path, allowlist),
                dialer,
                idle_timeout: config.idle_timeout,
                audit: config.audit,
            }),
        })
    }

    pub fn context(&self) -> &Arc<RelayContext> {
        &self.ctx
    }

    /// Bind `listen_addr` and serve until `shutdown` resolves.
    pub async fn run_until<F>(&self, shutdown: F) -> std::io::Result<()>
    where
        F: Future<Output = ()>,
    {
        let listener = TcpListener::bind(self.listen_addr).await?;
        self.serve(listener, shutdown).await
    }

    /// Serve connections from an already bound `listener` until `shutdown`
    /// resolves, then cancel live sessions and wait briefly for them to close.
    pub async fn serve<F>(&self, listener: TcpListener, shutdown: F) -> std::io::Result<()>
    where
        F: Future<Output = ()>,
    {
        let local_addr = listener.local_addr()?;
        tracing::info!(
            addr = %local_addr,
            route = %self.ctx.handshake.route_path,
            upstream = %self.ctx.dialer.url(),
            "ws-relay listening"
        );

        let root = CancellationToken::new();
        let mut sessions = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!(active = sessions.len(), "shutdown requested; stopping accept loop");
                    break;
                }
                accepted = listener.accept() => {
                    let (stream, remote_addr) = match accepted {
                        Ok(pair) => pair,
                        Err(err) => {
                            tracing::warn!(%err, "accept failed");
                            tokio::time::sleep(ACCEPT_BACKOFF).await;
                            continue;
                        }
                    };
                    let ctx = Arc::clone(&self.ctx);
                    let cancel = root.child_token();

                    sessions.spawn(async move {
                        if let Err(err) = handle_connection(stream, remote_addr, ctx, cancel).await {
                            if err.is_refusal() {
                                tracing::info!(%remote_addr, %err, "connection refused");
                            } else {
                                tracing::warn!(%remote_addr, %err, "connection failed");
                            }
                        }
                    });
                }
                Some(res) = sessions.join_next(), if !sessions.is_empty() => {
                    if let Err(err) = res {
                        tracing::error!(%err, "session task failed");
                    }
                }
            }
        }

        root.cancel();
        let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
            while sessions.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            tracing::warn!(remaining = sessions.len(), "sessions did not close in time; aborting");
            sessions.shutdown().await;
        }

        Ok(())
    }
}

/// Handle a single TCP connection from handshake through relay and teardown.
///
/// Returns the session report when a session was established and ran to its
/// end, or the error that prevented it from starting.
pub async fn handle_connection(
    stream: TcpStream,
    remote_addr: SocketAddr,
    ctx: Arc<RelayContext>,
    cancel: CancellationToken,
) -> Result<SessionReport, RelayError> {
    let session_id = Uuid::new_v4();
    let source = || AuditSource::new("ws-relay").with_session(session_id, remote_addr);

    // ------------------------------------------------------------------
    // 1. Upgrade the client, enforcing route and origin.
    // ------------------------------------------------------------------
    let client = match handshake::upgrade(stream, &ctx.handshake).await {
        Ok(client) => client,
        Err(err) => {
            let (event, origin) = match &err {
                RelayError::HandshakeRejected { origin } => {
                    (AuditEventType::OriginRejected, origin.as_deref())
                }
                RelayError::RouteNotFound { .. } => (AuditEventType::RouteNotFound, None),
                _ => (AuditEventType::UpgradeFailed, None),
            };
            ctx.audit.log(AuditEntry::new(
                event,
                source().with_origin(origin),
                serde_json::json!({ "error": err.to_string() }),
            ));
            return Err(err);
        }
    };
    let origin = client.origin;

    tracing::info!(
        %session_id,
        %remote_addr,
        origin = origin.as_deref().unwrap_or("<none>"),
        "client connected"
    );

    // ------------------------------------------------------------------
    // 2. Dial the upstream. On failure the client leg is closed before the
    //    error is reported.
    // ------------------------------------------------------------------
    let upstream = match ctx.dialer.dial().await {
        Ok(ws) => ws,
        Err(err) => {
            let mut client_leg = LegWriter::new(Leg::Client, client.ws);
            if let Err(close_err) = client_leg.close().await {
                tracing::debug!(%session_id, %close_err, "error closing client after dial failure");
            }
            ctx.audit.log(AuditEntry::new(
                AuditEventType::UpstreamDialFailed,
                source().with_origin(origin.as_deref()),
                serde_json::json!({
                    "upstream": ctx.dialer.url(),
                    "error": err.to_string(),
                }),
            ));
            return Err(err);
        }
    };

    tracing::debug!(%session_id, upstream = %ctx.dialer.url(), "upstream connected");

    ctx.audit.log(AuditEntry::new(
        AuditEventType::ConnectionOpened,
        source().with_origin(origin.as_deref()),
        serde_json::json!({ "upstream": ctx.dialer.url() }),
    ));

    // ------------------------------------------------------------------
    // 3. Relay until either side ends, then make sure both legs are closed.
    // ------------------------------------------------------------------
    let session = RelaySession::new(session_id, client.ws, upstream)
        .with_idle_timeout(ctx.idle_timeout)
        .with_cancellation(cancel);

    let mut finished = session.run().await;
    finished.close().await;
    let report = finished.into_report();

    tracing::info!(
        %session_id,
        %remote_addr,
        ended_by = ?report.ended_by,
        reason = %report.reason,
        frames_up = report.client_to_upstream.frames,
        frames_down = report.upstream_to_client.frames,
        duration_ms = report.duration.as_millis() as u64,
        "session closed"
    );

    ctx.audit.log(AuditEntry::new(
        AuditEventType::SessionClosed,
        source().with_origin(origin.as_deref()),
        serde_json::json!({
            "ended_by": report.ended_by.source().to_string(),
            "reason": report.reason.to_string(),
            "client_to_upstream": {
                "frames": report.client_to_upstream.frames,
                "bytes": report.client_to_upstream.bytes,
            },
            "upstream_to_client": {
                "frames": report.upstream_to_client.frames,
                "bytes": report.upstream_to_client.bytes,
            },
            "duration_ms": report.duration.as_millis() as u64,
        }),
    ));

    Ok(report)
}
