use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Errors raised when parsing model string forms.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("invalid severity: {value}")]
    InvalidSeverity { value: String },

    #[error("invalid event type: {value}")]
    InvalidEventType { value: String },
}

/// Event severity levels, ordered from least to most severe.
///
/// The derived `Ord` is the authoritative ordering; downstream code must
/// compare variants, never their string forms.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    #[default]
    Info,
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// The wire string form (`"INFO"` .. `"CRITICAL"`).
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "INFO",
            Severity::Low => "LOW",
            Severity::Medium => "MEDIUM",
            Severity::High => "HIGH",
            Severity::Critical => "CRITICAL",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "INFO" => Ok(Severity::Info),
            "LOW" => Ok(Severity::Low),
            "MEDIUM" => Ok(Severity::Medium),
            "HIGH" => Ok(Severity::High),
            "CRITICAL" => Ok(Severity::Critical),
            _ => Err(ParseError::InvalidSeverity {
                value: s.to_string(),
            }),
        }
    }
}

/// The kind of telemetry an event carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    ProcessStart,
    ProcessExit,
    NetworkConnect,
    NetworkListen,
    FileCreate,
    FileModify,
    FileDelete,
    FileAccess,
}

impl EventType {
    /// The wire string form (`"process_start"`, ...).
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::ProcessStart => "process_start",
            EventType::ProcessExit => "process_exit",
            EventType::NetworkConnect => "network_connect",
            EventType::NetworkListen => "network_listen",
            EventType::FileCreate => "file_create",
            EventType::FileModify => "file_modify",
            EventType::FileDelete => "file_delete",
            EventType::FileAccess => "file_access",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A security event observed by one of the in-pod monitors.
///
/// Exactly one of `process`, `network`, and `file` is set, matching
/// `event_type`. Source identity (`id`, `agent_id`, `pod_name`,
/// `pod_namespace`) is stamped by the collector before egress; monitors leave
/// those fields blank.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityEvent {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub agent_id: String,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub severity: Severity,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub pod_name: String,
    #[serde(default)]
    pub pod_namespace: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process: Option<ProcessEventData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<NetworkEventData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<FileEventData>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
}

impl SecurityEvent {
    /// Create a bare event with the current timestamp and no payload.
    pub fn new(event_type: EventType, severity: Severity) -> Self {
        Self {
            id: String::new(),
            agent_id: String::new(),
            event_type,
            severity,
            timestamp: Utc::now(),
            pod_name: String::new(),
            pod_namespace: String::new(),
            process: None,
            network: None,
            file: None,
            metadata: HashMap::new(),
        }
    }

    /// Attach a process payload.
    pub fn with_process(mut self, process: ProcessEventData) -> Self {
        self.process = Some(process);
        self
    }

    /// Attach a network payload.
    pub fn with_network(mut self, network: NetworkEventData) -> Self {
        self.network = Some(network);
        self
    }

    /// Attach a file payload.
    pub fn with_file(mut self, file: FileEventData) -> Self {
        self.file = Some(file);
        self
    }

    /// Add a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Number of payloads attached; valid events carry exactly one.
    pub fn payload_count(&self) -> usize {
        usize::from(self.process.is_some())
            + usize::from(self.network.is_some())
            + usize::from(self.file.is_some())
    }
}

/// Process payload of a `process_start` / `process_exit` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessEventData {
    pub pid: i32,
    pub ppid: i32,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exe_path: Option<String>,
    #[serde(default)]
    pub cmdline: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub suspicious_indicators: Vec<String>,
}

/// Network payload of a `network_connect` / `network_listen` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkEventData {
    pub protocol: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub src_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub src_port: Option<u16>,
    pub dst_ip: String,
    pub dst_port: u16,
    pub state: String,
    #[serde(default)]
    pub is_external: bool,
    #[serde(default)]
    pub is_suspicious_port: bool,
}

/// Operations a file event can describe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileOperation {
    Create,
    Modify,
    Delete,
    Rename,
    Chmod,
}

impl FileOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileOperation::Create => "create",
            FileOperation::Modify => "modify",
            FileOperation::Delete => "delete",
            FileOperation::Rename => "rename",
            FileOperation::Chmod => "chmod",
        }
    }
}

impl fmt::Display for FileOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// File payload of a `file_*` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileEventData {
    pub path: String,
    pub operation: FileOperation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permissions: Option<String>,
}
