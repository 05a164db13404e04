//! Prometheus metrics for the controller.
//!
//! Metrics are registered against a registry owned by the entrypoint and
//! passed down; nothing registers on a process-wide default. All metric
//! types use interior mutability and are safe to share across tasks.

use prometheus::{CounterVec, Encoder, Gauge, Opts, Registry, TextEncoder};
use thiserror::Error;

/// Metrics registration and encoding errors.
#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("failed to register metric: {0}")]
    Registration(#[from] prometheus::Error),

    #[error("failed to encode metrics: {0}")]
    Encoding(String),
}

/// Controller pipeline metrics.
#[derive(Clone)]
pub struct ControllerMetrics {
    /// Events accepted into the pipeline, by type, severity, and namespace.
    events_received: CounterVec,

    /// Alerts produced by the detection engine, by rule and severity.
    alerts_generated: CounterVec,

    /// Agents currently considered alive.
    active_agents: Gauge,
}

impl ControllerMetrics {
    /// Create the metric families and register them with `registry`.
    pub fn new(registry: &Registry) -> Result<Self, MetricsError> {
        let events_received = CounterVec::new(
            Opts::new("events_received_total", "Total security events received"),
            &["type", "severity", "namespace"],
        )?;
        let alerts_generated = CounterVec::new(
            Opts::new("alerts_generated_total", "Total security alerts generated"),
            &["rule", "severity"],
        )?;
        let active_agents = Gauge::new("active_agents", "Number of active APSS agents")?;

        registry.register(Box::new(events_received.clone()))?;
        registry.register(Box::new(alerts_generated.clone()))?;
        registry.register(Box::new(active_agents.clone()))?;

        Ok(Self {
            events_received,
            alerts_generated,
            active_agents,
        })
    }

    pub fn event_received(&self, event_type: &str, severity: &str, namespace: &str) {
        self.events_received
            .with_label_values(&[event_type, severity, namespace])
            .inc();
    }

    pub fn alert_generated(&self, rule_id: &str, severity: &str) {
        self.alerts_generated
            .with_label_values(&[rule_id, severity])
            .inc();
    }

    pub fn set_active_agents(&self, count: usize) {
        self.active_agents.set(count as f64);
    }
}

/// Render the registry in Prometheus text exposition format.
pub fn encode_text(registry: &Registry) -> Result<String, MetricsError> {
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    encoder
        .encode(&registry.gather(), &mut buffer)
        .map_err(|err| MetricsError::Encoding(err.to_string()))?;
    String::from_utf8(buffer).map_err(|err| MetricsError::Encoding(err.to_string()))
}
