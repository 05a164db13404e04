//! Configuration loading from the environment with embedded defaults.
//!
//! Every component reads its configuration once at startup via the
//! `from_env()` constructors. Unset or unparsable values fall back to the
//! defaults; configuration is never reloaded at runtime.

use std::time::Duration;

/// Read `key` from the environment, trimmed, or `default` if unset or empty.
pub fn env_or(key: &str, default: &str) -> String {
    match std::env::var(key) {
        Ok(value) if !value.trim().is_empty() => value.trim().to_string(),
        _ => default.to_string(),
    }
}

/// Read a duration (humantime syntax, e.g. `"5s"`, `"2m"`) from the
/// environment, or `default` if unset or invalid.
pub fn env_duration_or(key: &str, default: Duration) -> Duration {
    match std::env::var(key) {
        Ok(value) => humantime::parse_duration(value.trim()).unwrap_or(default),
        Err(_) => default,
    }
}

/// Configuration for the sidecar agent.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub agent_id: String,
    pub pod_name: String,
    pub pod_namespace: String,
    pub node_name: String,
    pub controller_endpoint: String,

    pub proc_scan_interval: Duration,
    pub net_scan_interval: Duration,
    /// Reserved: the file monitor is notification-driven and does not poll.
    pub file_scan_interval: Duration,

    pub watch_paths: Vec<String>,
    pub suspicious_processes: Vec<String>,
    pub suspicious_ports: Vec<u16>,

    /// Capacity of the collector's event buffer.
    pub event_buffer_size: usize,
}

impl AgentConfig {
    /// Agent configuration from the environment with defaults.
    pub fn from_env() -> Self {
        Self {
            agent_id: env_or("AGENT_ID", ""),
            pod_name: env_or("POD_NAME", ""),
            pod_namespace: env_or("POD_NAMESPACE", ""),
            node_name: env_or("NODE_NAME", ""),
            controller_endpoint: env_or(
                "CONTROLLER_ENDPOINT",
                "apss-controller.apss-system.svc.cluster.local:8080",
            ),
            proc_scan_interval: env_duration_or("PROC_SCAN_INTERVAL", Duration::from_secs(5)),
            net_scan_interval: env_duration_or("NET_SCAN_INTERVAL", Duration::from_secs(10)),
            file_scan_interval: env_duration_or("FILE_SCAN_INTERVAL", Duration::from_secs(30)),
            watch_paths: default_watch_paths(),
            suspicious_processes: default_suspicious_processes(),
            suspicious_ports: default_suspicious_ports(),
            event_buffer_size: 10_000,
        }
    }
}

fn default_watch_paths() -> Vec<String> {
    [
        "/etc/passwd",
        "/etc/shadow",
        "/etc/sudoers",
        "/root/.ssh",
        "/etc/crontab",
        "/var/spool/cron",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_suspicious_processes() -> Vec<String> {
    [
        "nc", "ncat", "netcat", "nmap", "masscan", "tcpdump", "wireshark", "python -c", "perl -e",
        "ruby -e", "bash -i", "sh -i", "xmrig", "minerd", "cpuminer", "socat", "curl.*|.*sh",
        "wget.*|.*sh",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_suspicious_ports() -> Vec<u16> {
    vec![4444, 5555, 6666, 1337, 3389, 5900, 5901, 6379, 27017]
}

/// Configuration for the controller.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub http_addr: String,
    pub shutdown_timeout: Duration,
    pub event_buffer_size: usize,
    pub alert_buffer_size: usize,
    pub agent_stale_threshold: Duration,
    pub alert_retention_count: usize,
    pub sweet_security_enabled: bool,
    pub sweet_security_endpoint: String,
    pub sweet_security_api_key: String,
    pub sweet_security_timeout: Duration,
}

impl ControllerConfig {
    /// Controller configuration from the environment with defaults.
    pub fn from_env() -> Self {
        let endpoint = env_or("SWEET_SECURITY_ENDPOINT", "");
        let api_key = env_or("SWEET_SECURITY_API_KEY", "");
        Self {
            http_addr: env_or("HTTP_ADDR", ":8080"),
            shutdown_timeout: env_duration_or("SHUTDOWN_TIMEOUT", Duration::from_secs(30)),
            event_buffer_size: 100_000,
            alert_buffer_size: 10_000,
            agent_stale_threshold: Duration::from_secs(120),
            alert_retention_count: 10_000,
            sweet_security_enabled: !endpoint.is_empty() && !api_key.is_empty(),
            sweet_security_endpoint: endpoint,
            sweet_security_api_key: api_key,
            sweet_security_timeout: env_duration_or(
                "SWEET_SECURITY_TIMEOUT",
                Duration::from_secs(30),
            ),
        }
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            http_addr: ":8080".to_string(),
            shutdown_timeout: Duration::from_secs(30),
            event_buffer_size: 100_000,
            alert_buffer_size: 10_000,
            agent_stale_threshold: Duration::from_secs(120),
            alert_retention_count: 10_000,
            sweet_security_enabled: false,
            sweet_security_endpoint: String::new(),
            sweet_security_api_key: String::new(),
            sweet_security_timeout: Duration::from_secs(30),
        }
    }
}

/// Configuration for the mutating admission webhook.
#[derive(Debug, Clone)]
pub struct WebhookConfig {
    pub sidecar_image: String,
    pub controller_endpoint: String,
    pub exclude_namespaces: Vec<String>,
    pub tls_cert_file: String,
    pub tls_key_file: String,
    pub http_addr: String,
}

impl WebhookConfig {
    /// Webhook configuration from the environment with defaults.
    pub fn from_env() -> Self {
        let exclude = env_or("EXCLUDE_NAMESPACES", "kube-system,kube-public,apss-system");
        Self {
            sidecar_image: env_or(
                "SIDECAR_IMAGE",
                "gcr.io/invisible-sre-sandbox/apss-agent:latest",
            ),
            controller_endpoint: env_or(
                "CONTROLLER_ENDPOINT",
                "apss-controller.apss-system.svc.cluster.local:8080",
            ),
            exclude_namespaces: exclude
                .split(',')
                .map(|ns| ns.trim().to_string())
                .filter(|ns| !ns.is_empty())
                .collect(),
            tls_cert_file: env_or("TLS_CERT_FILE", "/etc/webhook/certs/tls.crt"),
            tls_key_file: env_or("TLS_KEY_FILE", "/etc/webhook/certs/tls.key"),
            http_addr: env_or("HTTP_ADDR", ":8443"),
        }
    }
}

/// Normalize a Go-style listen address (`":8080"`) into one bindable by
/// `TcpListener` (`"0.0.0.0:8080"`).
pub fn normalize_listen_addr(addr: &str) -> String {
    if let Some(port) = addr.strip_prefix(':') {
        format!("0.0.0.0:{port}")
    } else {
        addr.to_string()
    }
}
