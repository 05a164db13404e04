#![forbid(unsafe_code)]

//! APSS sidecar agent entrypoint.

use std::time::Duration;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use apss_agent::monitor::Monitor;
use apss_lib::config::AgentConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cfg = AgentConfig::from_env();
    info!(
        version = env!("CARGO_PKG_VERSION"),
        pod = %cfg.pod_name,
        namespace = %cfg.pod_namespace,
        "starting APSS sidecar agent"
    );

    let cancel = CancellationToken::new();
    let monitor = Monitor::new(&cfg).context("failed to create monitor")?;
    let handle = tokio::spawn(monitor.run(cancel.clone()));

    shutdown_signal().await;
    info!("received shutdown signal");
    cancel.cancel();

    if tokio::time::timeout(Duration::from_secs(30), handle)
        .await
        .is_err()
    {
        warn!("shutdown timeout, some monitors may not have stopped cleanly");
    }

    info!("agent shutdown complete");
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
