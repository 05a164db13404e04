//! Event collector: the single point of event egress from a pod.
//!
//! Monitors hand events to the collector over a bounded channel using
//! non-blocking sends. The collector stamps pod identity onto each event,
//! logs it locally at a severity-mapped level, and POSTs it to the controller.
//! Failed sends are counted and dropped; nothing is retried or spilled to
//! disk.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use reqwest::StatusCode;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use apss_lib::models::{SecurityEvent, Severity};

/// Collector construction and delivery errors.
#[derive(Debug, Error)]
pub enum CollectorError {
    #[error("controller endpoint not configured")]
    EndpointNotConfigured,

    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("unexpected status code: {0}")]
    UnexpectedStatus(u16),
}

/// Collector configuration.
#[derive(Debug, Clone)]
pub struct CollectorConfig {
    pub controller_endpoint: String,
    pub agent_id: String,
    pub pod_name: String,
    pub pod_namespace: String,
    /// Event buffer capacity; zero means the 10 000 default.
    pub buffer_size: usize,
}

/// Delivery counters shared between the collector task and its owner.
#[derive(Debug, Default)]
pub struct CollectorStats {
    sent: AtomicU64,
    dropped: AtomicU64,
}

impl CollectorStats {
    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Producer handle for one monitor.
///
/// Sends are non-blocking; a full buffer increments the per-monitor drop
/// counter. Cheap to clone.
#[derive(Clone)]
pub struct EventSender {
    tx: mpsc::Sender<SecurityEvent>,
    monitor: &'static str,
    dropped: Arc<AtomicU64>,
}

impl EventSender {
    /// Wrap a raw channel sender. Useful for exercising monitors against an
    /// in-memory channel.
    pub fn new(tx: mpsc::Sender<SecurityEvent>, monitor: &'static str) -> Self {
        Self {
            tx,
            monitor,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Send an event, dropping it with a debug log if the buffer is full.
    pub fn send(&self, event: SecurityEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(_) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                debug!(monitor = self.monitor, "event buffer full, dropping event");
                false
            }
        }
    }

    /// Send an event, dropping it silently if the buffer is full. Used for
    /// low-value events such as process exits.
    pub fn send_silent(&self, event: SecurityEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(_) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Number of events this monitor dropped on a full buffer.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Collects events from the in-pod monitors and streams them to the
/// controller.
pub struct EventCollector {
    cfg: CollectorConfig,
    http: reqwest::Client,
    tx: mpsc::Sender<SecurityEvent>,
    rx: mpsc::Receiver<SecurityEvent>,
    stats: Arc<CollectorStats>,
}

impl EventCollector {
    /// Create a new collector with a bounded event buffer.
    pub fn new(mut cfg: CollectorConfig) -> Result<Self, CollectorError> {
        if cfg.buffer_size == 0 {
            cfg.buffer_size = 10_000;
        }
        let (tx, rx) = mpsc::channel(cfg.buffer_size);
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            cfg,
            http,
            tx,
            rx,
            stats: Arc::new(CollectorStats::default()),
        })
    }

    /// Producer handle for a named monitor.
    pub fn sender(&self, monitor: &'static str) -> EventSender {
        EventSender {
            tx: self.tx.clone(),
            monitor,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Shared delivery counters.
    pub fn stats(&self) -> Arc<CollectorStats> {
        Arc::clone(&self.stats)
    }

    /// Consume events until cancellation.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!(
            endpoint = %self.cfg.controller_endpoint,
            "starting event collector"
        );
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("event collector stopping");
                    return;
                }
                received = self.rx.recv() => {
                    match received {
                        Some(event) => self.process_event(event).await,
                        None => return,
                    }
                }
            }
        }
    }

    async fn process_event(&self, event: SecurityEvent) {
        let event = enrich_event(&self.cfg, event);
        log_event(&event);

        match self.send_event(&event).await {
            Ok(()) => {
                self.stats.sent.fetch_add(1, Ordering::Relaxed);
            }
            Err(err) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                debug!(event_id = %event.id, error = %err, "failed to send event");
            }
        }
    }

    async fn send_event(&self, event: &SecurityEvent) -> Result<(), CollectorError> {
        if self.cfg.controller_endpoint.is_empty() {
            return Err(CollectorError::EndpointNotConfigured);
        }
        let url = format!("http://{}/api/v1/events", self.cfg.controller_endpoint);
        let response = self.http.post(&url).json(event).send().await?;
        if response.status() != StatusCode::ACCEPTED {
            return Err(CollectorError::UnexpectedStatus(response.status().as_u16()));
        }
        Ok(())
    }
}

/// Stamp pod identity and assign an event id when the source left it blank.
pub fn enrich_event(cfg: &CollectorConfig, mut event: SecurityEvent) -> SecurityEvent {
    event.pod_name = cfg.pod_name.clone();
    event.pod_namespace = cfg.pod_namespace.clone();
    event.agent_id = cfg.agent_id.clone();
    if event.id.is_empty() {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        event.id = format!("{}-{}", cfg.agent_id, nanos);
    }
    event
}

/// Log the event locally at a level mapped from its severity.
fn log_event(event: &SecurityEvent) {
    let summary = payload_summary(event);
    match event.severity {
        Severity::Critical => error!(
            event_id = %event.id,
            event_type = %event.event_type,
            severity = %event.severity,
            pod_name = %event.pod_name,
            pod_namespace = %event.pod_namespace,
            %summary,
            "CRITICAL: security event detected"
        ),
        Severity::High | Severity::Medium => warn!(
            event_id = %event.id,
            event_type = %event.event_type,
            severity = %event.severity,
            pod_name = %event.pod_name,
            pod_namespace = %event.pod_namespace,
            %summary,
            "security event detected"
        ),
        Severity::Low => info!(
            event_id = %event.id,
            event_type = %event.event_type,
            severity = %event.severity,
            pod_name = %event.pod_name,
            pod_namespace = %event.pod_namespace,
            %summary,
            "security event detected"
        ),
        Severity::Info => debug!(
            event_id = %event.id,
            event_type = %event.event_type,
            severity = %event.severity,
            pod_name = %event.pod_name,
            pod_namespace = %event.pod_namespace,
            %summary,
            "security event"
        ),
    }
}

fn payload_summary(event: &SecurityEvent) -> String {
    if let Some(process) = &event.process {
        let mut summary = format!("process {} pid={}", process.name, process.pid);
        if !process.suspicious_indicators.is_empty() {
            summary.push_str(&format!(
                " indicators={}",
                process.suspicious_indicators.join(",")
            ));
        }
        summary
    } else if let Some(network) = &event.network {
        format!(
            "{} {}:{} state={} external={}",
            network.protocol, network.dst_ip, network.dst_port, network.state, network.is_external
        )
    } else if let Some(file) = &event.file {
        format!("{} {}", file.operation, file.path)
    } else {
        String::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use apss_lib::models::EventType;

    fn test_config() -> CollectorConfig {
        CollectorConfig {
            controller_endpoint: String::new(),
            agent_id: "agent-1".to_string(),
            pod_name: "web-0".to_string(),
            pod_namespace: "app".to_string(),
            buffer_size: 4,
        }
    }

    #[test]
    fn enrich_stamps_identity_and_assigns_id() {
        let cfg = test_config();
        let event = SecurityEvent::new(EventType::ProcessStart, Severity::Info);
        let enriched = enrich_event(&cfg, event);
        assert_eq!(enriched.pod_name, "web-0");
        assert_eq!(enriched.pod_namespace, "app");
        assert_eq!(enriched.agent_id, "agent-1");
        assert!(enriched.id.starts_with("agent-1-"));
    }

    #[test]
    fn enrich_preserves_existing_id() {
        let cfg = test_config();
        let mut event = SecurityEvent::new(EventType::ProcessStart, Severity::Info);
        event.id = "preset".to_string();
        let enriched = enrich_event(&cfg, event);
        assert_eq!(enriched.id, "preset");
    }

    #[tokio::test]
    async fn full_buffer_drops_and_counts() {
        let collector = EventCollector::new(test_config()).unwrap();
        let sender = collector.sender("test");
        for _ in 0..4 {
            assert!(sender.send(SecurityEvent::new(EventType::ProcessStart, Severity::Info)));
        }
        // Buffer is now at capacity; further sends drop.
        assert!(!sender.send(SecurityEvent::new(EventType::ProcessStart, Severity::Info)));
        assert!(!sender.send_silent(SecurityEvent::new(EventType::ProcessExit, Severity::Info)));
        assert_eq!(sender.dropped(), 2);
    }

    #[tokio::test]
    async fn unconfigured_endpoint_counts_event_as_dropped() {
        let collector = EventCollector::new(test_config()).unwrap();
        let stats = collector.stats();
        collector
            .process_event(SecurityEvent::new(EventType::ProcessStart, Severity::Info))
            .await;
        assert_eq!(stats.sent(), 0);
        assert_eq!(stats.dropped(), 1);
    }
}
