//! Detection rules engine.
//!
//! Rules are data, not behavior: each rule is a record carrying metadata and a
//! plain predicate over a [`SecurityEvent`]. The engine is stateless and
//! synchronous; evaluating an event walks the rule list in order and emits one
//! alert per matching rule.
//!
//! Rule identifiers, severities, MITRE labels, and the recommended-action
//! strings are part of the external API contract.

use chrono::Utc;
use uuid::Uuid;

use crate::models::{Alert, SecurityEvent, Severity};

/// A single detection rule: metadata plus a match predicate.
pub struct Rule {
    pub id: &'static str,
    pub name: &'static str,
    pub description: &'static str,
    pub severity: Severity,
    pub mitre_tactic: &'static str,
    pub mitre_id: &'static str,
    pub condition: fn(&SecurityEvent) -> bool,
    pub actions: &'static [&'static str],
}

/// Evaluates events against the built-in rule set and produces alerts.
pub struct Engine {
    rules: Vec<Rule>,
}

impl Engine {
    /// Create a detection engine with the default rule set.
    pub fn new() -> Self {
        Self {
            rules: default_rules(),
        }
    }

    /// Run all rules against the event and return any matching alerts,
    /// in rule-list order.
    pub fn evaluate(&self, event: &SecurityEvent) -> Vec<Alert> {
        self.rules
            .iter()
            .filter(|rule| (rule.condition)(event))
            .map(|rule| Alert {
                id: format!("alert-{}", Uuid::new_v4()),
                timestamp: Utc::now(),
                severity: rule.severity,
                rule_id: rule.id.to_string(),
                rule_name: rule.name.to_string(),
                description: rule.description.to_string(),
                event_ids: vec![event.id.clone()],
                pod_name: event.pod_name.clone(),
                pod_namespace: event.pod_namespace.clone(),
                mitre_tactic: Some(rule.mitre_tactic.to_string()),
                mitre_id: Some(rule.mitre_id.to_string()),
                recommended_actions: rule.actions.iter().map(|s| s.to_string()).collect(),
            })
            .collect()
    }

    /// The loaded rules (read-only).
    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

const REVERSE_SHELL_PORTS: [u16; 4] = [4444, 5555, 6666, 1337];
const EXTERNAL_DB_PORTS: [u16; 5] = [3306, 5432, 27017, 6379, 9200];
const SENSITIVE_FILES: [&str; 3] = ["/etc/passwd", "/etc/shadow", "/etc/sudoers"];

fn default_rules() -> Vec<Rule> {
    vec![
        Rule {
            id: "APSS-001",
            name: "Potential Reverse Shell",
            description: "Detected network connection matching reverse shell pattern",
            severity: Severity::Critical,
            mitre_tactic: "Command and Control",
            mitre_id: "T1059.004",
            condition: |event| {
                event.network.as_ref().is_some_and(|network| {
                    network.is_external && REVERSE_SHELL_PORTS.contains(&network.dst_port)
                })
            },
            actions: &[
                "Investigate pod immediately",
                "Check for unauthorized processes",
                "Review pod logs",
            ],
        },
        Rule {
            id: "APSS-002",
            name: "Cryptominer Detected",
            description: "Process matching known cryptocurrency miner patterns",
            severity: Severity::Critical,
            mitre_tactic: "Impact",
            mitre_id: "T1496",
            condition: |event| {
                event.process.as_ref().is_some_and(|process| {
                    process
                        .suspicious_indicators
                        .iter()
                        .any(|indicator| indicator == "possible_cryptominer")
                })
            },
            actions: &[
                "Terminate pod",
                "Investigate container image",
                "Review deployment source",
            ],
        },
        Rule {
            id: "APSS-003",
            name: "Sensitive File Modified",
            description: "Critical system file was modified",
            severity: Severity::High,
            mitre_tactic: "Persistence",
            mitre_id: "T1546",
            condition: |event| {
                event.file.as_ref().is_some_and(|file| {
                    file.operation == crate::models::FileOperation::Modify
                        && SENSITIVE_FILES.contains(&file.path.as_str())
                })
            },
            actions: &[
                "Review file changes",
                "Check for privilege escalation",
                "Audit container",
            ],
        },
        Rule {
            id: "APSS-004",
            name: "Shell Spawned in Container",
            description: "Interactive shell was spawned inside container",
            severity: Severity::Medium,
            mitre_tactic: "Execution",
            mitre_id: "T1059",
            condition: |event| {
                event.process.as_ref().is_some_and(|process| {
                    process
                        .suspicious_indicators
                        .iter()
                        .any(|indicator| indicator == "shell_spawn")
                })
            },
            actions: &[
                "Verify if expected (kubectl exec)",
                "Review user activity",
                "Check for lateral movement",
            ],
        },
        Rule {
            id: "APSS-005",
            name: "External Database Connection",
            description: "Connection to external database detected",
            severity: Severity::Medium,
            mitre_tactic: "Exfiltration",
            mitre_id: "T1048",
            condition: |event| {
                event.network.as_ref().is_some_and(|network| {
                    network.is_external && EXTERNAL_DB_PORTS.contains(&network.dst_port)
                })
            },
            actions: &[
                "Verify database connection is authorized",
                "Review network policies",
                "Check for data exfiltration",
            ],
        },
    ]
}
