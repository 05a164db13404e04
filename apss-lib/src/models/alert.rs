use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::event::Severity;

/// A security alert produced by the detection engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub severity: Severity,
    pub rule_id: String,
    pub rule_name: String,
    pub description: String,
    pub event_ids: Vec<String>,
    #[serde(default)]
    pub pod_name: String,
    #[serde(default)]
    pub pod_namespace: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mitre_tactic: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mitre_id: Option<String>,
    pub recommended_actions: Vec<String>,
}

/// Liveness record for a connected agent, keyed by agent id.
///
/// `last_seen` is refreshed on every event received from the agent and is
/// never moved backwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentInfo {
    pub id: String,
    pub pod_name: String,
    pub pod_namespace: String,
    pub connected_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub event_count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alert_json_round_trip() {
        let alert = Alert {
            id: "alert-1".to_string(),
            timestamp: Utc::now(),
            severity: Severity::Critical,
            rule_id: "APSS-001".to_string(),
            rule_name: "Potential Reverse Shell".to_string(),
            description: "Detected network connection matching reverse shell pattern".to_string(),
            event_ids: vec!["e1".to_string()],
            pod_name: "web-0".to_string(),
            pod_namespace: "app".to_string(),
            mitre_tactic: Some("Command and Control".to_string()),
            mitre_id: Some("T1059.004".to_string()),
            recommended_actions: vec!["Investigate pod immediately".to_string()],
        };

        let json = serde_json::to_string(&alert).unwrap();
        let decoded: Alert = serde_json::from_str(&json).unwrap();
        assert_eq!(alert, decoded);

        let value = serde_json::to_value(&alert).unwrap();
        assert_eq!(value["pod_namespace"], "app");
        assert!(value["recommended_actions"].is_array());
    }

    #[test]
    fn agent_info_serializes_event_count() {
        let now = Utc::now();
        let agent = AgentInfo {
            id: "a1".to_string(),
            pod_name: "web-0".to_string(),
            pod_namespace: "app".to_string(),
            connected_at: now,
            last_seen: now,
            event_count: 3,
        };
        let value = serde_json::to_value(&agent).unwrap();
        assert_eq!(value["id"], "a1");
        assert_eq!(value["event_count"], 3);
    }
}
