//! Monitor orchestrator: wires the three monitors to the collector and
//! manages their lifecycle.

use std::path::PathBuf;

use thiserror::Error;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use apss_lib::config::AgentConfig;

use crate::collector::{CollectorConfig, CollectorError, CollectorStats, EventCollector};
use crate::filemon::{FileMonitor, FileMonitorConfig, FileMonitorError};
use crate::netmon::{NetworkMonitor, NetworkMonitorConfig};
use crate::procmon::{ProcessMonitor, ProcessMonitorConfig};

/// Monitor construction errors.
#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("failed to create collector: {0}")]
    Collector(#[from] CollectorError),

    #[error("failed to create file monitor: {0}")]
    FileMonitor(#[from] FileMonitorError),
}

/// Owns the collector and the three in-pod monitors.
pub struct Monitor {
    collector: EventCollector,
    procmon: ProcessMonitor,
    netmon: NetworkMonitor,
    filemon: FileMonitor,
    stats: std::sync::Arc<CollectorStats>,
}

impl Monitor {
    /// Build the collector and monitors from the agent configuration.
    pub fn new(cfg: &AgentConfig) -> Result<Self, MonitorError> {
        let collector = EventCollector::new(CollectorConfig {
            controller_endpoint: cfg.controller_endpoint.clone(),
            agent_id: cfg.agent_id.clone(),
            pod_name: cfg.pod_name.clone(),
            pod_namespace: cfg.pod_namespace.clone(),
            buffer_size: cfg.event_buffer_size,
        })?;
        let stats = collector.stats();

        let procmon = ProcessMonitor::new(
            ProcessMonitorConfig {
                scan_interval: cfg.proc_scan_interval,
                suspicious_processes: cfg.suspicious_processes.clone(),
                proc_root: PathBuf::from("/proc"),
            },
            collector.sender("procmon"),
        );

        let netmon = NetworkMonitor::new(
            NetworkMonitorConfig {
                scan_interval: cfg.net_scan_interval,
                suspicious_ports: cfg.suspicious_ports.clone(),
                proc_root: PathBuf::from("/proc"),
            },
            collector.sender("netmon"),
        );

        let filemon = FileMonitor::new(
            FileMonitorConfig {
                watch_paths: cfg.watch_paths.iter().map(PathBuf::from).collect(),
            },
            collector.sender("filemon"),
        )?;

        Ok(Self {
            collector,
            procmon,
            netmon,
            filemon,
            stats,
        })
    }

    /// Run collector and monitors until cancellation, then wait for all of
    /// them to drain.
    pub async fn run(self, cancel: CancellationToken) {
        info!("starting security monitors");

        let mut tasks = JoinSet::new();
        tasks.spawn(self.collector.run(cancel.clone()));
        tasks.spawn(self.procmon.run(cancel.clone()));
        tasks.spawn(self.netmon.run(cancel.clone()));
        tasks.spawn(self.filemon.run(cancel.clone()));

        info!("all monitors started");

        while let Some(result) = tasks.join_next().await {
            if let Err(err) = result {
                warn!(error = %err, "monitor task failed");
            }
        }

        info!(
            sent = self.stats.sent(),
            dropped = self.stats.dropped(),
            "all monitors stopped"
        );
    }
}
