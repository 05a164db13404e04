//! Core event processing, detection, and alert pipeline.
//!
//! The controller owns two bounded queues: events flow from the HTTP ingress
//! into the event queue, through the detection engine, and matching alerts
//! flow through the alert queue into the bounded retention ring. Exactly one
//! consumer task drains each queue. Agent tracking is updated on ingress,
//! before buffer admission, so a 503-refused event still refreshes liveness.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use apss_lib::config::ControllerConfig;
use apss_lib::detection::Engine;
use apss_lib::models::{AgentInfo, Alert, SecurityEvent, Severity};
use apss_lib::sweetsecurity::{self, SinkAlert};

use crate::metrics::ControllerMetrics;

/// Ingress admission errors.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("event buffer full")]
    BufferFull,
}

/// Orchestrates event processing, detection, and alert handling.
pub struct Controller {
    cfg: ControllerConfig,
    engine: Engine,
    metrics: ControllerMetrics,

    agents: RwLock<HashMap<String, AgentInfo>>,
    alerts: RwLock<VecDeque<Alert>>,

    event_tx: mpsc::Sender<SecurityEvent>,
    event_rx: Mutex<Option<mpsc::Receiver<SecurityEvent>>>,
    alert_tx: mpsc::Sender<Alert>,
    alert_rx: Mutex<Option<mpsc::Receiver<Alert>>>,

    sweet_security: Option<Arc<sweetsecurity::Client>>,
}

impl Controller {
    /// Create a controller with bounded queues sized from the configuration.
    pub fn new(cfg: ControllerConfig, metrics: ControllerMetrics) -> Self {
        let (event_tx, event_rx) = mpsc::channel(cfg.event_buffer_size);
        let (alert_tx, alert_rx) = mpsc::channel(cfg.alert_buffer_size);

        let sweet_security = if cfg.sweet_security_enabled {
            match sweetsecurity::Client::new(sweetsecurity::Config {
                api_endpoint: cfg.sweet_security_endpoint.clone(),
                api_key: cfg.sweet_security_api_key.clone(),
                timeout: cfg.sweet_security_timeout,
            }) {
                Ok(client) => Some(Arc::new(client)),
                Err(err) => {
                    warn!(error = %err, "failed to create Sweet Security client, relay disabled");
                    None
                }
            }
        } else {
            None
        };

        Self {
            cfg,
            engine: Engine::new(),
            metrics,
            agents: RwLock::new(HashMap::new()),
            alerts: RwLock::new(VecDeque::new()),
            event_tx,
            event_rx: Mutex::new(Some(event_rx)),
            alert_tx,
            alert_rx: Mutex::new(Some(alert_rx)),
            sweet_security,
        }
    }

    /// Accept an event from the HTTP API and queue it for processing.
    ///
    /// Agent tracking is updated unconditionally before the queue try-send;
    /// a refused event therefore still counts toward the agent's liveness.
    pub fn ingest_event(&self, event: SecurityEvent) -> Result<(), IngestError> {
        {
            let mut agents = self.agents.write();
            let now = Utc::now();
            agents
                .entry(event.agent_id.clone())
                .and_modify(|agent| {
                    agent.last_seen = now;
                    agent.event_count += 1;
                })
                .or_insert_with(|| AgentInfo {
                    id: event.agent_id.clone(),
                    pod_name: event.pod_name.clone(),
                    pod_namespace: event.pod_namespace.clone(),
                    connected_at: now,
                    last_seen: now,
                    event_count: 1,
                });
        }

        self.event_tx
            .try_send(event)
            .map_err(|_| IngestError::BufferFull)
    }

    /// Relay a HIGH/CRITICAL event to the Sweet Security API on a detached
    /// task. Failures are logged only.
    pub fn relay_high_severity_event(&self, event: SecurityEvent) {
        let Some(client) = self.sweet_security.clone() else {
            return;
        };
        tokio::spawn(async move {
            if let Err(err) = client.send_event(&event).await {
                debug!(event_id = %event.id, error = %err, "failed to send event to Sweet Security");
            }
        });
    }

    /// Snapshot of connected agents.
    pub fn get_agents(&self) -> Vec<AgentInfo> {
        self.agents.read().values().cloned().collect()
    }

    /// The most recent alerts, up to `limit`, oldest first.
    pub fn get_alerts(&self, limit: usize) -> Vec<Alert> {
        let alerts = self.alerts.read();
        let take = limit.min(alerts.len());
        alerts.iter().skip(alerts.len() - take).cloned().collect()
    }

    /// Spawn the event processor, alert processor, liveness sweeper, and the
    /// one-shot sink health check. The returned set completes after
    /// cancellation.
    pub fn start(self: &Arc<Self>, cancel: CancellationToken) -> JoinSet<()> {
        let mut tasks = JoinSet::new();

        let controller = Arc::clone(self);
        let token = cancel.clone();
        tasks.spawn(async move { controller.process_events(token).await });

        let controller = Arc::clone(self);
        let token = cancel.clone();
        tasks.spawn(async move { controller.process_alerts(token).await });

        let controller = Arc::clone(self);
        tasks.spawn(async move { controller.sweep_agents(cancel).await });

        if let Some(client) = self.sweet_security.clone() {
            tokio::spawn(async move {
                let check = tokio::time::timeout(Duration::from_secs(10), client.health_check());
                match check.await {
                    Ok(Ok(())) => info!("Sweet Security API connection verified"),
                    Ok(Err(err)) => {
                        warn!(error = %err, "Sweet Security health check failed, will retry on first alert");
                    }
                    Err(_) => {
                        warn!("Sweet Security health check timed out, will retry on first alert");
                    }
                }
            });
        }

        tasks
    }

    /// Single consumer of the event queue.
    async fn process_events(&self, cancel: CancellationToken) {
        let Some(mut rx) = self.event_rx.lock().take() else {
            error!("event processor already started");
            return;
        };
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                received = rx.recv() => {
                    match received {
                        Some(event) => self.evaluate_event(&event),
                        None => return,
                    }
                }
            }
        }
    }

    /// Count the event and dispatch any rule matches onto the alert queue.
    pub fn evaluate_event(&self, event: &SecurityEvent) {
        self.metrics.event_received(
            event.event_type.as_str(),
            event.severity.as_str(),
            &event.pod_namespace,
        );
        for alert in self.engine.evaluate(event) {
            if self.alert_tx.try_send(alert).is_err() {
                warn!("alert channel full, dropping alert");
            }
        }
    }

    /// Single consumer of the alert queue.
    async fn process_alerts(&self, cancel: CancellationToken) {
        let Some(mut rx) = self.alert_rx.lock().take() else {
            error!("alert processor already started");
            return;
        };
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                received = rx.recv() => {
                    match received {
                        Some(alert) => self.store_alert(alert),
                        None => return,
                    }
                }
            }
        }
    }

    /// Append to the retention ring, count, log, and relay one alert.
    pub fn store_alert(&self, alert: Alert) {
        {
            let mut alerts = self.alerts.write();
            alerts.push_back(alert.clone());
            while alerts.len() > self.cfg.alert_retention_count {
                alerts.pop_front();
            }
        }

        self.metrics
            .alert_generated(&alert.rule_id, alert.severity.as_str());

        warn!(
            alert_id = %alert.id,
            rule_id = %alert.rule_id,
            rule_name = %alert.rule_name,
            severity = %alert.severity,
            pod = %alert.pod_name,
            namespace = %alert.pod_namespace,
            mitre = alert.mitre_id.as_deref().unwrap_or(""),
            description = %alert.description,
            "SECURITY ALERT"
        );

        if let Some(client) = self.sweet_security.clone() {
            let sink_alert = SinkAlert::from(&alert);
            tokio::spawn(async move {
                if let Err(err) = client.send_alert(&sink_alert).await {
                    error!(
                        alert_id = %sink_alert.id,
                        rule_id = %sink_alert.rule_id,
                        error = %err,
                        "failed to send alert to Sweet Security API"
                    );
                }
            });
        }
    }

    /// Periodically drop agents that have gone quiet and refresh the gauge.
    async fn sweep_agents(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(Duration::from_secs(30));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => self.sweep_stale_agents(),
            }
        }
    }

    /// Remove agents whose `last_seen` is older than the stale threshold.
    pub fn sweep_stale_agents(&self) {
        let threshold = chrono::Duration::from_std(self.cfg.agent_stale_threshold)
            .unwrap_or_else(|_| chrono::Duration::seconds(120));
        let now = Utc::now();

        let mut agents = self.agents.write();
        agents.retain(|id, agent| {
            let alive = now - agent.last_seen <= threshold;
            if !alive {
                warn!(agent_id = %id, "agent appears offline");
            }
            alive
        });
        self.metrics.set_active_agents(agents.len());
    }

    /// Whether the Sweet Security relay is configured.
    pub fn sink_enabled(&self) -> bool {
        self.sweet_security.is_some()
    }
}

/// Events at or above this severity are relayed to the external sink.
pub fn should_relay(severity: Severity) -> bool {
    severity >= Severity::High
}

#[cfg(test)]
mod tests {
    use super::*;
    use apss_lib::models::{EventType, ProcessEventData};
    use prometheus::Registry;

    fn test_controller(event_buffer: usize) -> Arc<Controller> {
        let registry = Registry::new();
        let metrics = ControllerMetrics::new(&registry).unwrap();
        let cfg = ControllerConfig {
            event_buffer_size: event_buffer,
            alert_buffer_size: 16,
            alert_retention_count: 4,
            ..ControllerConfig::default()
        };
        Arc::new(Controller::new(cfg, metrics))
    }

    fn event_from(agent_id: &str) -> SecurityEvent {
        let mut event = SecurityEvent::new(EventType::ProcessStart, Severity::Info);
        event.id = format!("{agent_id}-1");
        event.agent_id = agent_id.to_string();
        event.pod_name = "web-0".to_string();
        event.pod_namespace = "app".to_string();
        event
    }

    fn alert(id: &str) -> Alert {
        Alert {
            id: id.to_string(),
            timestamp: Utc::now(),
            severity: Severity::High,
            rule_id: "APSS-003".to_string(),
            rule_name: "Sensitive File Modified".to_string(),
            description: "Critical system file was modified".to_string(),
            event_ids: vec!["e1".to_string()],
            pod_name: "web-0".to_string(),
            pod_namespace: "app".to_string(),
            mitre_tactic: None,
            mitre_id: None,
            recommended_actions: Vec::new(),
        }
    }

    #[tokio::test]
    async fn ingest_creates_and_refreshes_agent_info() {
        let controller = test_controller(16);

        controller.ingest_event(event_from("a1")).unwrap();
        let agents = controller.get_agents();
        assert_eq!(agents.len(), 1);
        assert_eq!(agents[0].id, "a1");
        assert_eq!(agents[0].event_count, 1);
        let first_seen = agents[0].last_seen;

        controller.ingest_event(event_from("a1")).unwrap();
        let agents = controller.get_agents();
        assert_eq!(agents[0].event_count, 2);
        assert!(agents[0].last_seen >= first_seen);
    }

    #[tokio::test]
    async fn full_event_buffer_refuses_admission_but_still_counts() {
        let controller = test_controller(1);

        assert!(controller.ingest_event(event_from("a1")).is_ok());
        // No consumer is running; the queue is now full.
        assert!(matches!(
            controller.ingest_event(event_from("a1")),
            Err(IngestError::BufferFull)
        ));

        // The refused event still refreshed the agent record.
        let agents = controller.get_agents();
        assert_eq!(agents[0].event_count, 2);
    }

    #[tokio::test]
    async fn alert_ring_evicts_oldest_beyond_retention() {
        let controller = test_controller(16);

        for i in 0..6 {
            controller.store_alert(alert(&format!("alert-{i}")));
        }

        let alerts = controller.get_alerts(100);
        assert_eq!(alerts.len(), 4);
        // Oldest two were evicted; the rest come back oldest-first.
        let ids: Vec<&str> = alerts.iter().map(|a| a.id.as_str()).collect();
        assert_eq!(ids, ["alert-2", "alert-3", "alert-4", "alert-5"]);
    }

    #[tokio::test]
    async fn get_alerts_respects_limit() {
        let controller = test_controller(16);
        for i in 0..4 {
            controller.store_alert(alert(&format!("alert-{i}")));
        }
        let alerts = controller.get_alerts(2);
        let ids: Vec<&str> = alerts.iter().map(|a| a.id.as_str()).collect();
        assert_eq!(ids, ["alert-2", "alert-3"]);
    }

    #[tokio::test]
    async fn evaluate_event_dispatches_matching_alerts() {
        let controller = test_controller(16);
        let cancel = CancellationToken::new();
        let mut tasks = controller.start(cancel.clone());

        let mut event = event_from("a1");
        event.severity = Severity::Critical;
        event.process = Some(ProcessEventData {
            pid: 1,
            ppid: 0,
            name: "xmrig".to_string(),
            exe_path: None,
            cmdline: vec!["xmrig".to_string()],
            uid: None,
            start_time: None,
            suspicious_indicators: vec!["possible_cryptominer".to_string()],
        });
        controller.ingest_event(event).unwrap();

        // The pipeline is asynchronous; poll for the stored alert.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let alerts = controller.get_alerts(100);
            if !alerts.is_empty() {
                assert_eq!(alerts[0].rule_id, "APSS-002");
                assert_eq!(alerts[0].severity, Severity::Critical);
                break;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "no alert produced before deadline"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        cancel.cancel();
        while tasks.join_next().await.is_some() {}
    }

    #[tokio::test]
    async fn stale_agents_are_swept() {
        let controller = test_controller(16);
        controller.ingest_event(event_from("a1")).unwrap();

        // Fresh agent survives the sweep.
        controller.sweep_stale_agents();
        assert_eq!(controller.get_agents().len(), 1);

        // Age the record past the threshold.
        {
            let mut agents = controller.agents.write();
            let agent = agents.get_mut("a1").unwrap();
            agent.last_seen = Utc::now() - chrono::Duration::seconds(300);
        }
        controller.sweep_stale_agents();
        assert!(controller.get_agents().is_empty());
    }

    #[test]
    fn relay_threshold_is_high_or_critical() {
        assert!(!should_relay(Severity::Info));
        assert!(!should_relay(Severity::Low));
        assert!(!should_relay(Severity::Medium));
        assert!(should_relay(Severity::High));
        assert!(should_relay(Severity::Critical));
    }
}
