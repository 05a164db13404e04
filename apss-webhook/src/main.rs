#![forbid(unsafe_code)]

//! APSS admission webhook entrypoint.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use apss_lib::config::{normalize_listen_addr, WebhookConfig};
use apss_webhook::server;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cfg = Arc::new(WebhookConfig::from_env());
    info!(
        version = env!("CARGO_PKG_VERSION"),
        addr = %cfg.http_addr,
        "starting APSS webhook server"
    );

    let cancel = CancellationToken::new();
    let addr = normalize_listen_addr(&cfg.http_addr);
    let mut handle = tokio::spawn(server::serve_tls(addr, Arc::clone(&cfg), cancel.clone()));

    tokio::select! {
        _ = shutdown_signal() => {
            info!("shutting down webhook server");
            cancel.cancel();
            match tokio::time::timeout(Duration::from_secs(30), &mut handle).await {
                Ok(Ok(Err(err))) => warn!(error = %err, "webhook server failed during shutdown"),
                Ok(Err(err)) => warn!(error = %err, "webhook server task failed"),
                Ok(Ok(Ok(()))) => {}
                Err(_) => warn!("shutdown drain deadline exceeded"),
            }
        }
        // The server exiting on its own means startup failed (unreadable
        // certificates, bind failure) and is fatal.
        result = &mut handle => {
            result
                .context("webhook server task failed")?
                .context("webhook server failed")?;
        }
    }

    info!("webhook shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");

    tokio::select! {
        _ = sigint.recv() => {}
        _ = sigterm.recv() => {}
    }
}
