#![forbid(unsafe_code)]

//! APSS controller entrypoint.

use std::sync::Arc;

use anyhow::Context;
use prometheus::Registry;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use apss_controller::controller::Controller;
use apss_controller::metrics::ControllerMetrics;
use apss_controller::server::{self, ServerState};
use apss_lib::config::{normalize_listen_addr, ControllerConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cfg = ControllerConfig::from_env();
    info!(
        version = env!("CARGO_PKG_VERSION"),
        addr = %cfg.http_addr,
        sweet_security = cfg.sweet_security_enabled,
        "starting APSS controller"
    );

    // The metrics registry lives here and is passed down; components never
    // register against a process-wide default.
    let registry = Registry::new();
    let metrics =
        ControllerMetrics::new(&registry).context("failed to register controller metrics")?;

    let controller = Arc::new(Controller::new(cfg.clone(), metrics));
    let cancel = CancellationToken::new();
    let mut pipeline = controller.start(cancel.clone());

    let state = ServerState {
        controller,
        registry,
    };
    let addr = normalize_listen_addr(&cfg.http_addr);
    let server = tokio::spawn(server::serve(addr, state, cancel.clone()));

    shutdown_signal().await;
    info!("shutting down controller");
    cancel.cancel();

    let drain = async {
        match server.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(error = %err, "controller server failed"),
            Err(err) => warn!(error = %err, "controller server task failed"),
        }
        while pipeline.join_next().await.is_some() {}
    };
    if tokio::time::timeout(cfg.shutdown_timeout, drain).await.is_err() {
        warn!("shutdown drain deadline exceeded");
    }

    info!("controller shutdown complete");
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
