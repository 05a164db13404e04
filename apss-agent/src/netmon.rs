//! Network monitor: detects connections and listeners from the kernel's
//! per-protocol connection tables.
//!
//! Each scan parses the `net/tcp`, `net/tcp6`, and `net/udp` tables under the
//! proc root and diffs connection keys against the previous snapshot. New
//! rows are classified and emitted; rows that disappear are simply forgotten.
//! Addresses in the tables are little-endian hex: IPv4 needs a byte reversal,
//! IPv6 a per-32-bit-word endian conversion.

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use apss_lib::models::{EventType, NetworkEventData, SecurityEvent, Severity};

use crate::collector::EventSender;

/// Ports commonly used by reverse shells.
const REVERSE_SHELL_PORTS: [u16; 8] = [4444, 5555, 6666, 1337, 1234, 31337, 9001, 9999];

/// Network monitor configuration.
#[derive(Debug, Clone)]
pub struct NetworkMonitorConfig {
    pub scan_interval: Duration,
    pub suspicious_ports: Vec<u16>,
    /// Root of the proc filesystem; overridable for tests.
    pub proc_root: PathBuf,
}

impl Default for NetworkMonitorConfig {
    fn default() -> Self {
        Self {
            scan_interval: Duration::from_secs(10),
            suspicious_ports: Vec::new(),
            proc_root: PathBuf::from("/proc"),
        }
    }
}

/// One row of a kernel connection table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connection {
    pub protocol: &'static str,
    pub local_ip: IpAddr,
    pub local_port: u16,
    pub remote_ip: IpAddr,
    pub remote_port: u16,
    pub state: String,
    pub uid: u32,
    pub inode: u64,
}

impl Connection {
    /// Deduplication key for snapshot diffing.
    pub fn key(&self) -> String {
        format!(
            "{}:{}:{}->{}:{}:{}",
            self.protocol,
            self.local_ip,
            self.local_port,
            self.remote_ip,
            self.remote_port,
            self.state
        )
    }
}

/// Monitors network connections within the pod's network namespace.
pub struct NetworkMonitor {
    cfg: NetworkMonitorConfig,
    events: EventSender,
    known: RwLock<HashSet<String>>,
    suspicious_ports: HashSet<u16>,
}

impl NetworkMonitor {
    pub fn new(cfg: NetworkMonitorConfig, events: EventSender) -> Self {
        let suspicious_ports = cfg.suspicious_ports.iter().copied().collect();
        Self {
            cfg,
            events,
            known: RwLock::new(HashSet::new()),
            suspicious_ports,
        }
    }

    /// Scan loop; runs until cancellation.
    pub async fn run(self, cancel: CancellationToken) {
        info!("starting network monitor");

        let mut ticker = tokio::time::interval(self.cfg.scan_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("network monitor stopping");
                    return;
                }
                _ = ticker.tick() => self.scan(),
            }
        }
    }

    /// Parse all connection tables and emit events for rows not seen before.
    pub fn scan(&self) {
        let mut connections = Vec::new();
        for (file, protocol) in [("net/tcp", "tcp"), ("net/tcp6", "tcp6"), ("net/udp", "udp")] {
            match parse_net_file(&self.cfg.proc_root.join(file), protocol) {
                Ok(mut rows) => connections.append(&mut rows),
                Err(err) => {
                    debug!(file, error = %err, "failed to read connection table");
                }
            }
        }

        let mut current = HashSet::with_capacity(connections.len());
        for conn in &connections {
            let key = conn.key();
            current.insert(key.clone());

            let is_new = self.known.write().insert(key);
            if is_new {
                self.analyze_connection(conn);
            }
        }

        // Forget rows that disappeared; no exit event is emitted.
        self.known.write().retain(|key| current.contains(key));
    }

    /// Classify one new connection row and emit its event.
    fn analyze_connection(&self, conn: &Connection) {
        // Rows with no remote endpoint are local sockets; skip them.
        if conn.remote_port == 0 && conn.remote_ip.is_unspecified() {
            return;
        }

        let event_type = if conn.state == "LISTEN" {
            EventType::NetworkListen
        } else {
            EventType::NetworkConnect
        };

        let is_external = !is_private_ip(conn.remote_ip);
        let is_suspicious_port = self.suspicious_ports.contains(&conn.remote_port)
            || self.suspicious_ports.contains(&conn.local_port);

        let mut severity = Severity::Info;
        if conn.state == "ESTABLISHED" && is_external {
            severity = Severity::Low;
        }
        if is_suspicious_port {
            severity = Severity::High;
        }
        if conn.state == "ESTABLISHED" && is_external && is_reverse_shell_port(conn) {
            severity = Severity::Critical;
        }

        let event =
            SecurityEvent::new(event_type, severity).with_network(NetworkEventData {
                protocol: conn.protocol.to_string(),
                src_ip: Some(conn.local_ip.to_string()),
                src_port: Some(conn.local_port),
                dst_ip: conn.remote_ip.to_string(),
                dst_port: conn.remote_port,
                state: conn.state.clone(),
                is_external,
                is_suspicious_port,
            });

        self.events.send(event);
    }
}

/// Either endpoint on a port commonly used by reverse shells.
fn is_reverse_shell_port(conn: &Connection) -> bool {
    REVERSE_SHELL_PORTS.contains(&conn.remote_port) || REVERSE_SHELL_PORTS.contains(&conn.local_port)
}

/// Parse one kernel connection table, skipping the header line and any rows
/// that fail to parse.
pub fn parse_net_file(path: &Path, protocol: &'static str) -> std::io::Result<Vec<Connection>> {
    let content = std::fs::read_to_string(path)?;
    Ok(content
        .lines()
        .skip(1)
        .filter_map(|line| parse_net_line(line, protocol))
        .collect())
}

/// Parse one table row:
/// `sl local_address rem_address st tx:rx tr:tm->when retrnsmt uid timeout inode ...`
pub fn parse_net_line(line: &str, protocol: &'static str) -> Option<Connection> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < 10 {
        return None;
    }

    let (local_ip, local_port) = parse_hex_address(fields[1])?;
    let (remote_ip, remote_port) = parse_hex_address(fields[2])?;
    let state = parse_state(fields[3]);
    let uid = fields[7].parse::<u32>().unwrap_or(0);
    let inode = fields[9].parse::<u64>().unwrap_or(0);

    Some(Connection {
        protocol,
        local_ip,
        local_port,
        remote_ip,
        remote_port,
        state,
        uid,
        inode,
    })
}

/// Parse a `HEXIP:HEXPORT` address. The kernel writes addresses in
/// little-endian hex, so IPv4 bytes are reversed and IPv6 is converted one
/// 32-bit word at a time.
pub fn parse_hex_address(s: &str) -> Option<(IpAddr, u16)> {
    let (ip_hex, port_hex) = s.split_once(':')?;
    let port = u16::from_str_radix(port_hex, 16).ok()?;

    let ip = match ip_hex.len() {
        8 => {
            let value = u32::from_str_radix(ip_hex, 16).ok()?;
            IpAddr::V4(Ipv4Addr::from(value.swap_bytes()))
        }
        32 => {
            let bytes = decode_hex(ip_hex)?;
            let mut out = [0u8; 16];
            for word in 0..4 {
                let start = word * 4;
                let be = u32::from_be_bytes(bytes[start..start + 4].try_into().ok()?);
                out[start..start + 4].copy_from_slice(&be.to_le_bytes());
            }
            IpAddr::V6(Ipv6Addr::from(out))
        }
        _ => return None,
    };

    Some((ip, port))
}

fn decode_hex(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).ok())
        .collect()
}

/// Map a kernel state code to its canonical name.
pub fn parse_state(code: &str) -> String {
    let states: HashMap<&str, &str> = [
        ("01", "ESTABLISHED"),
        ("02", "SYN_SENT"),
        ("03", "SYN_RECV"),
        ("04", "FIN_WAIT1"),
        ("05", "FIN_WAIT2"),
        ("06", "TIME_WAIT"),
        ("07", "CLOSE"),
        ("08", "CLOSE_WAIT"),
        ("09", "LAST_ACK"),
        ("0A", "LISTEN"),
        ("0B", "CLOSING"),
    ]
    .into_iter()
    .collect();

    states
        .get(code.to_uppercase().as_str())
        .copied()
        .unwrap_or("UNKNOWN")
        .to_string()
}

/// Loopback, RFC 1918, link-local, and unspecified addresses are private;
/// everything else counts as external.
pub fn is_private_ip(ip: IpAddr) -> bool {
    if ip.is_unspecified() || ip.is_loopback() {
        return true;
    }
    match ip {
        IpAddr::V4(v4) => {
            let octets = v4.octets();
            octets[0] == 10
                || (octets[0] == 172 && (16..=31).contains(&octets[1]))
                || (octets[0] == 192 && octets[1] == 168)
                || (octets[0] == 169 && octets[1] == 254)
        }
        IpAddr::V6(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn test_monitor(
        suspicious_ports: Vec<u16>,
        proc_root: PathBuf,
    ) -> (NetworkMonitor, mpsc::Receiver<SecurityEvent>) {
        let (tx, rx) = mpsc::channel(64);
        let cfg = NetworkMonitorConfig {
            scan_interval: Duration::from_secs(10),
            suspicious_ports,
            proc_root,
        };
        (
            NetworkMonitor::new(cfg, EventSender::new(tx, "netmon")),
            rx,
        )
    }

    fn conn(remote_ip: &str, remote_port: u16, local_port: u16, state: &str) -> Connection {
        Connection {
            protocol: "tcp",
            local_ip: "10.0.0.5".parse().unwrap(),
            local_port,
            remote_ip: remote_ip.parse().unwrap(),
            remote_port,
            state: state.to_string(),
            uid: 0,
            inode: 1,
        }
    }

    #[test]
    fn ipv4_hex_address_decodes_with_byte_reversal() {
        let (ip, port) = parse_hex_address("0100007F:1F90").unwrap();
        assert_eq!(ip, IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)));
        assert_eq!(port, 8080);
    }

    #[test]
    fn ipv6_hex_address_decodes_per_word() {
        // ::1 in the kernel's word-swapped representation.
        let (ip, port) = parse_hex_address("00000000000000000000000001000000:0050").unwrap();
        assert_eq!(ip, IpAddr::V6(Ipv6Addr::LOCALHOST));
        assert_eq!(port, 80);
    }

    #[test]
    fn malformed_addresses_are_rejected() {
        assert!(parse_hex_address("0100007F").is_none());
        assert!(parse_hex_address("XYZ:0050").is_none());
        assert!(parse_hex_address("0100:0050").is_none());
    }

    #[test]
    fn state_codes_map_to_canonical_names() {
        assert_eq!(parse_state("01"), "ESTABLISHED");
        assert_eq!(parse_state("0A"), "LISTEN");
        assert_eq!(parse_state("0a"), "LISTEN");
        assert_eq!(parse_state("0B"), "CLOSING");
        assert_eq!(parse_state("FF"), "UNKNOWN");
    }

    #[test]
    fn private_range_boundaries() {
        assert!(is_private_ip("10.0.0.0".parse().unwrap()));
        assert!(is_private_ip("10.255.255.255".parse().unwrap()));
        assert!(!is_private_ip("9.255.255.255".parse().unwrap()));
        assert!(!is_private_ip("11.0.0.0".parse().unwrap()));
        assert!(is_private_ip("172.16.0.1".parse().unwrap()));
        assert!(is_private_ip("172.31.255.255".parse().unwrap()));
        assert!(!is_private_ip("172.32.0.1".parse().unwrap()));
        assert!(is_private_ip("192.168.1.1".parse().unwrap()));
        assert!(is_private_ip("169.254.0.1".parse().unwrap()));
        assert!(is_private_ip("127.0.0.1".parse().unwrap()));
        assert!(is_private_ip("0.0.0.0".parse().unwrap()));
        assert!(!is_private_ip("8.8.8.8".parse().unwrap()));
    }

    #[test]
    fn parse_net_line_extracts_fields() {
        let line = "   0: 0100007F:1F90 04030201:01BB 01 00000000:00000000 00:00000000 00000000  1000        0 12345 1 0000000000000000 100 0 0 10 0";
        let conn = parse_net_line(line, "tcp").unwrap();
        assert_eq!(conn.local_ip, IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)));
        assert_eq!(conn.local_port, 8080);
        assert_eq!(conn.remote_ip, IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4)));
        assert_eq!(conn.remote_port, 443);
        assert_eq!(conn.state, "ESTABLISHED");
        assert_eq!(conn.uid, 1000);
        assert_eq!(conn.inode, 12345);
    }

    #[test]
    fn unspecified_remote_with_zero_port_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let (monitor, mut rx) = test_monitor(Vec::new(), dir.path().to_path_buf());
        monitor.analyze_connection(&conn("0.0.0.0", 0, 8080, "LISTEN"));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn established_external_is_low_severity() {
        let dir = tempfile::tempdir().unwrap();
        let (monitor, mut rx) = test_monitor(Vec::new(), dir.path().to_path_buf());
        monitor.analyze_connection(&conn("8.8.8.8", 443, 50000, "ESTABLISHED"));

        let event = rx.try_recv().unwrap();
        assert_eq!(event.event_type, EventType::NetworkConnect);
        assert_eq!(event.severity, Severity::Low);
        let network = event.network.unwrap();
        assert!(network.is_external);
        assert!(!network.is_suspicious_port);
    }

    #[test]
    fn suspicious_port_is_high_severity() {
        let dir = tempfile::tempdir().unwrap();
        let (monitor, mut rx) = test_monitor(vec![6379], dir.path().to_path_buf());
        monitor.analyze_connection(&conn("10.0.0.9", 6379, 50000, "ESTABLISHED"));

        let event = rx.try_recv().unwrap();
        assert_eq!(event.severity, Severity::High);
        assert!(event.network.unwrap().is_suspicious_port);
    }

    #[test]
    fn external_reverse_shell_port_is_critical() {
        let dir = tempfile::tempdir().unwrap();
        let (monitor, mut rx) = test_monitor(vec![4444], dir.path().to_path_buf());
        monitor.analyze_connection(&conn("1.2.3.4", 4444, 50000, "ESTABLISHED"));

        let event = rx.try_recv().unwrap();
        assert_eq!(event.severity, Severity::Critical);
    }

    #[test]
    fn listen_state_emits_listen_event() {
        let dir = tempfile::tempdir().unwrap();
        let (monitor, mut rx) = test_monitor(Vec::new(), dir.path().to_path_buf());
        monitor.analyze_connection(&conn("8.8.8.8", 53, 8080, "LISTEN"));

        let event = rx.try_recv().unwrap();
        assert_eq!(event.event_type, EventType::NetworkListen);
    }

    #[test]
    fn scan_emits_only_new_rows() {
        let dir = tempfile::tempdir().unwrap();
        let net_dir = dir.path().join("net");
        std::fs::create_dir(&net_dir).unwrap();
        let header = "  sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode";
        let row = "   0: 0100007F:1F90 04030201:115C 01 00000000:00000000 00:00000000 00000000  1000        0 12345 1 0000000000000000 100 0 0 10 0";
        std::fs::write(net_dir.join("tcp"), format!("{header}\n{row}\n")).unwrap();

        let (monitor, mut rx) = test_monitor(Vec::new(), dir.path().to_path_buf());
        monitor.scan();
        let event = rx.try_recv().unwrap();
        assert_eq!(event.network.unwrap().dst_port, 4444);
        assert_eq!(event.severity, Severity::Critical);

        // Unchanged table emits nothing on the next scan.
        monitor.scan();
        assert!(rx.try_recv().is_err());
    }
}
