//! Sweet Security API client.
//!
//! Fire-and-forget relay of alerts and high-severity events to the external
//! analytics service. Every call is a single HTTP request with a bearer token;
//! any 2xx response is success and nothing is retried. An unconfigured client
//! (empty endpoint or API key) fails synchronously with
//! [`SweetSecurityError::NotConfigured`] so callers can skip the relay cheaply.

use std::collections::HashMap;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::models::{Alert, SecurityEvent};

const USER_AGENT: &str = concat!("apss-autopilot-security-sensor/", env!("CARGO_PKG_VERSION"));

/// Sweet Security relay errors.
#[derive(Debug, Error)]
pub enum SweetSecurityError {
    #[error("sweet security client not configured")]
    NotConfigured,

    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("unexpected status code: {0}")]
    UnexpectedStatus(u16),
}

/// Client configuration.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub api_endpoint: String,
    pub api_key: String,
    /// Request timeout; zero means the 30 s default.
    pub timeout: Duration,
}

/// Alert payload accepted by the Sweet Security API.
///
/// The relay wraps our [`Alert`] and carries the recommended actions inside
/// `metadata`, which is the shape the receiving side indexes on.
#[derive(Debug, Clone, Serialize)]
pub struct SinkAlert {
    pub id: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub severity: crate::models::Severity,
    pub rule_id: String,
    pub rule_name: String,
    pub description: String,
    pub pod_name: String,
    pub pod_namespace: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mitre_tactic: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mitre_id: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub event_ids: Vec<String>,
    pub metadata: HashMap<String, Value>,
}

impl From<&Alert> for SinkAlert {
    fn from(alert: &Alert) -> Self {
        let mut metadata = HashMap::new();
        metadata.insert(
            "source".to_string(),
            Value::from("apss-autopilot-security-sensor"),
        );
        metadata.insert(
            "recommended_actions".to_string(),
            Value::from(alert.recommended_actions.clone()),
        );
        Self {
            id: alert.id.clone(),
            timestamp: alert.timestamp,
            severity: alert.severity,
            rule_id: alert.rule_id.clone(),
            rule_name: alert.rule_name.clone(),
            description: alert.description.clone(),
            pod_name: alert.pod_name.clone(),
            pod_namespace: alert.pod_namespace.clone(),
            mitre_tactic: alert.mitre_tactic.clone(),
            mitre_id: alert.mitre_id.clone(),
            event_ids: alert.event_ids.clone(),
            metadata,
        }
    }
}

/// HTTP client for the Sweet Security API.
pub struct Client {
    api_endpoint: String,
    api_key: String,
    http: reqwest::Client,
}

impl Client {
    /// Create a new client. Fails only if the underlying HTTP client cannot
    /// be constructed.
    pub fn new(cfg: Config) -> Result<Self, SweetSecurityError> {
        let timeout = if cfg.timeout.is_zero() {
            Duration::from_secs(30)
        } else {
            cfg.timeout
        };
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()?;
        Ok(Self {
            api_endpoint: cfg.api_endpoint,
            api_key: cfg.api_key,
            http,
        })
    }

    fn check_configured(&self) -> Result<(), SweetSecurityError> {
        if self.api_endpoint.is_empty() || self.api_key.is_empty() {
            return Err(SweetSecurityError::NotConfigured);
        }
        Ok(())
    }

    /// Send a security alert.
    pub async fn send_alert(&self, alert: &SinkAlert) -> Result<(), SweetSecurityError> {
        self.check_configured()?;
        let url = format!("{}/api/v1/alerts", self.api_endpoint);
        self.send_json(&url, alert).await
    }

    /// Send a single security event.
    pub async fn send_event(&self, event: &SecurityEvent) -> Result<(), SweetSecurityError> {
        self.check_configured()?;
        let url = format!("{}/api/v1/events", self.api_endpoint);
        self.send_json(&url, event).await
    }

    /// Send multiple events in one batch request.
    pub async fn send_batch_events(
        &self,
        events: &[SecurityEvent],
    ) -> Result<(), SweetSecurityError> {
        self.check_configured()?;
        let url = format!("{}/api/v1/events/batch", self.api_endpoint);
        let payload = serde_json::json!({ "events": events });
        self.send_json(&url, &payload).await
    }

    async fn send_json<T: Serialize + ?Sized>(
        &self,
        url: &str,
        payload: &T,
    ) -> Result<(), SweetSecurityError> {
        let response = self
            .http
            .post(url)
            .bearer_auth(&self.api_key)
            .json(payload)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(SweetSecurityError::UnexpectedStatus(status.as_u16()));
        }

        debug!(url, status = status.as_u16(), "sent to Sweet Security API");
        Ok(())
    }

    /// Check that the API is reachable.
    pub async fn health_check(&self) -> Result<(), SweetSecurityError> {
        self.check_configured()?;
        let url = format!("{}/health", self.api_endpoint);
        let response = self
            .http
            .get(&url)
            .bearer_auth(&self.api_key)
            .send()
            .await?;
        let status = response.status();
        if status.as_u16() != 200 {
            return Err(SweetSecurityError::UnexpectedStatus(status.as_u16()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EventType, Severity};
    use chrono::Utc;

    fn unconfigured() -> Client {
        Client::new(Config::default()).unwrap()
    }

    #[tokio::test]
    async fn unconfigured_client_fails_synchronously() {
        let client = unconfigured();
        let event = SecurityEvent::new(EventType::ProcessStart, Severity::Critical);
        assert!(matches!(
            client.send_event(&event).await,
            Err(SweetSecurityError::NotConfigured)
        ));
        assert!(matches!(
            client.send_batch_events(&[event]).await,
            Err(SweetSecurityError::NotConfigured)
        ));
        assert!(matches!(
            client.health_check().await,
            Err(SweetSecurityError::NotConfigured)
        ));
    }

    #[test]
    fn sink_alert_carries_actions_in_metadata() {
        let alert = Alert {
            id: "alert-1".to_string(),
            timestamp: Utc::now(),
            severity: Severity::Critical,
            rule_id: "APSS-001".to_string(),
            rule_name: "Potential Reverse Shell".to_string(),
            description: "desc".to_string(),
            event_ids: vec!["e1".to_string()],
            pod_name: "p".to_string(),
            pod_namespace: "ns".to_string(),
            mitre_tactic: None,
            mitre_id: None,
            recommended_actions: vec!["Investigate pod immediately".to_string()],
        };
        let sink: SinkAlert = (&alert).into();
        assert_eq!(
            sink.metadata["source"],
            Value::from("apss-autopilot-security-sensor")
        );
        assert_eq!(
            sink.metadata["recommended_actions"],
            Value::from(vec!["Investigate pod immediately"])
        );

        // Severity crosses the wire in upper case.
        let json = serde_json::to_value(&sink).unwrap();
        assert_eq!(json["severity"], "CRITICAL");
    }
}
