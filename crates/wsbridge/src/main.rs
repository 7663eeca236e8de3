mod cli;
mod config;

use std::net::SocketAddr;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use audit_log::{AuditEntry, AuditEventType, AuditSink, AuditSource};
use ws_relay::{OriginAllowlist, Relay, RelayConfig};

use crate::cli::Cli;
use crate::config::{ConfigSource, LogFormat};

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Parse CLI args.
    let cli = Cli::parse();

    // 2. Load config, then merge CLI overrides.
    let (mut cfg, source) = config::load(&cli.config)?;
    cfg.merge_cli(&cli);

    // 3. Init tracing-subscriber.
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cfg.logging.level));

    match cfg.logging.format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_thread_ids(true)
            .init(),
        LogFormat::Pretty => tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .init(),
    }

    if source == ConfigSource::Defaults {
        warn!(
            path = %cli.config.display(),
            "configuration file not found; using defaults"
        );
    }

    info!(
        config_file = %cli.config.display(),
        listen = %cfg.network.listen_addr,
        upstream = %cfg.network.upstream_url,
        route = %cfg.network.route_path,
        "wsbridge starting"
    );

    let allowlist = OriginAllowlist::new(cfg.origins.allowed.clone());
    if allowlist.is_permissive() {
        warn!("origin allowlist contains '*'; every origin is accepted");
    } else {
        info!(origins = ?allowlist.entries(), "origin allowlist loaded");
    }

    // 4. Start the session event log, if configured.
    let (audit, audit_handle) = match &cfg.logging.audit_log_path {
        Some(path) => {
            let (sink, handle) = AuditSink::start(path)
                .await
                .with_context(|| format!("failed to open event log {}", path.display()))?;
            info!(path = %path.display(), "session event log enabled");
            (sink, Some(handle))
        }
        None => (AuditSink::disabled(), None),
    };

    audit.log(AuditEntry::new(
        AuditEventType::RelayStarted,
        AuditSource::new("wsbridge"),
        serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "listen": cfg.network.listen_addr,
            "upstream": cfg.network.upstream_url,
        }),
    ));

    // 5. Build the relay.
    let listen_addr: SocketAddr = cfg
        .network
        .listen_addr
        .parse()
        .context("invalid listen address")?;

    let relay = Relay::new(RelayConfig {
        listen_addr,
        upstream_url: cfg.network.upstream_url.clone(),
        route_path: cfg.network.route_path.clone(),
        origin_allowlist: allowlist.entries().to_vec(),
        dial_timeout: cfg.network.dial_timeout(),
        idle_timeout: cfg.network.idle_timeout(),
        audit: audit.clone(),
    })
    .context("invalid relay configuration")?;

    // 6. Serve until SIGINT or SIGTERM.
    let result = relay.run_until(shutdown_signal()).await;

    info!("wsbridge shutting down");

    audit.log(AuditEntry::new(
        AuditEventType::RelayStopped,
        AuditSource::new("wsbridge"),
        serde_json::json!({ "result": format!("{:?}", result) }),
    ));

    // The writer task flushes and exits once the last sink is dropped.
    drop(relay);
    drop(audit);
    if let Some(handle) = audit_handle {
        if let Err(err) = handle.await {
            warn!(%err, "event log writer task failed");
        }
    }

    result.context("relay listener failed")
}

/// Resolve on ctrl-c, or on SIGTERM where supported.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(%err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("received SIGINT (ctrl-c)"),
                    _ = sigterm.recv() => info!("received SIGTERM"),
                }
            }
            Err(err) => {
                warn!(%err, "failed to register SIGTERM handler");
                ctrl_c.await;
                info!("received SIGINT (ctrl-c)");
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await;
        info!("received SIGINT (ctrl-c)");
    }
}
