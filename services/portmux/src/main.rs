//! portmux
//!
//! Serves gRPC, HTTP/2, HTTP/1.x and TLS on a single port and forwards each
//! connection to the upstream configured for its protocol.

use anyhow::{Context, Result};
use portmux::{matcher, MuxError, ServeMux, Server, TcpAcceptor, UpstreamProxy};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod config;

use config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Prefer RUST_LOG, fall back to PORTMUX_LOG_LEVEL
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting portmux");
    info!(
        listen_addr = %config.listen_addr,
        sniff_timeout_ms = config.sniff_timeout.map(|t| t.as_millis() as u64),
        tls_termination = config.tls.is_some(),
        shutdown_grace_ms = config.shutdown_grace.as_millis() as u64,
        "Configuration loaded"
    );

    let server = Server::new(build_mux(&config));

    let tls_config = config
        .tls
        .as_ref()
        .map(|files| portmux::tls::server_config(&files.cert_file, &files.key_file))
        .transpose()
        .context("Failed to load TLS certificate")?;

    let listener = TcpAcceptor::bind(config.listen_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.listen_addr))?;

    let mut serve = {
        let server = server.clone();
        tokio::spawn(async move {
            match tls_config {
                Some(tls_config) => server.serve_tls(listener, Some(tls_config), "", "").await,
                None => server.serve(listener).await,
            }
        })
    };

    tokio::select! {
        res = &mut serve => {
            let res = res.context("Serve task panicked")?;
            error!(result = ?res, "Server stopped unexpectedly");
            return res.context("Server stopped");
        }
        res = tokio::signal::ctrl_c() => {
            res.context("Failed to listen for Ctrl-C")?;
            info!("Received Ctrl-C");
        }
    }

    match server.shutdown_timeout(config.shutdown_grace).await {
        Ok(()) => info!("Graceful shutdown complete"),
        Err(MuxError::ShutdownTimeout) => {
            warn!(
                remaining = server.active_connections(),
                "Grace period elapsed, closing remaining connections"
            );
            server.close()?;
        }
        Err(e) => warn!(error = %e, "Shutdown error"),
    }

    match serve.await {
        Ok(Err(MuxError::ServerClosed)) => Ok(()),
        Ok(res) => res.context("Server stopped"),
        Err(e) => Err(e).context("Serve task panicked"),
    }
}

/// Register one entry per configured upstream, most specific first.
fn build_mux(config: &Config) -> ServeMux {
    let mux = ServeMux::new();
    mux.set_read_timeout(config.sniff_timeout);

    if let Some(addr) = config.grpc_upstream {
        info!(upstream = %addr, "Routing gRPC");
        mux.handle(matcher::grpc(), UpstreamProxy::new(addr));
    }
    if let Some(addr) = config.http2_upstream {
        info!(upstream = %addr, "Routing HTTP/2");
        mux.handle(matcher::http2(), UpstreamProxy::new(addr));
    }
    if let Some(addr) = config.http_upstream {
        info!(upstream = %addr, "Routing HTTP/1");
        mux.handle(matcher::http1_fast(), UpstreamProxy::new(addr));
    }
    if let Some(addr) = config.tls_upstream {
        info!(upstream = %addr, "Routing TLS");
        mux.handle(matcher::tls(), UpstreamProxy::new(addr));
    }
    if let Some(addr) = config.fallback_upstream {
        info!(upstream = %addr, "Routing unmatched connections");
        mux.handle(matcher::any(), UpstreamProxy::new(addr));
    }

    if mux.is_empty() {
        warn!("No upstreams configured; every connection gets a 404");
    }
    mux
}
