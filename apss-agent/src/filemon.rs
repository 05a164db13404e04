//! File integrity monitor: baseline hashes plus filesystem notifications.
//!
//! At startup every configured watch path is walked; directories are added to
//! the OS notifier and regular files up to 10 MiB are SHA-256 hashed into the
//! baseline. Notifications are then projected onto file operations and
//! emitted as events carrying the prior and current hash, so downstream
//! consumers can tell content changes from metadata churn.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use notify::event::ModifyKind;
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use apss_lib::models::{EventType, FileEventData, FileOperation, SecurityEvent, Severity};

use crate::collector::EventSender;

/// Files whose modification is always critical.
const CRITICAL_PATHS: [&str; 5] = [
    "/etc/passwd",
    "/etc/shadow",
    "/etc/sudoers",
    "/etc/ssh/sshd_config",
    "/root/.ssh/authorized_keys",
];

/// Paths (or their direct children) whose modification is high severity.
const HIGH_PATHS: [&str; 7] = [
    "/etc/crontab",
    "/var/spool/cron",
    "/etc/cron.d",
    "/etc/profile",
    "/etc/bashrc",
    "/root/.bashrc",
    "/root/.profile",
];

/// Extensions that mark newly created files as executable content.
const SCRIPT_EXTENSIONS: [&str; 6] = ["sh", "py", "pl", "rb", "elf", "so"];

/// Files larger than this are not hashed into the baseline.
const MAX_HASH_SIZE: u64 = 10 * 1024 * 1024;

/// File monitor construction errors.
#[derive(Debug, Error)]
pub enum FileMonitorError {
    #[error("failed to create filesystem watcher: {0}")]
    Watcher(#[from] notify::Error),
}

/// File monitor configuration.
#[derive(Debug, Clone, Default)]
pub struct FileMonitorConfig {
    pub watch_paths: Vec<PathBuf>,
}

/// Baseline record for one watched file.
#[derive(Debug, Clone)]
pub struct FileBaseline {
    pub hash: String,
    pub mode: u32,
    pub modified: Option<SystemTime>,
    pub size: u64,
}

/// Watches critical paths and emits events when they diverge from the
/// baseline.
pub struct FileMonitor {
    events: EventSender,
    watcher: RecommendedWatcher,
    baseline: RwLock<HashMap<PathBuf, FileBaseline>>,
    rx: mpsc::UnboundedReceiver<notify::Result<notify::Event>>,
}

impl FileMonitor {
    /// Create the watcher and build the initial baseline.
    pub fn new(cfg: FileMonitorConfig, events: EventSender) -> Result<Self, FileMonitorError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let watcher = RecommendedWatcher::new(
            move |result: notify::Result<notify::Event>| {
                let _ = tx.send(result);
            },
            notify::Config::default(),
        )?;

        let mut monitor = Self {
            events,
            watcher,
            baseline: RwLock::new(HashMap::new()),
            rx,
        };

        for path in &cfg.watch_paths {
            monitor.add_watch_recursive(path.clone());
        }

        Ok(monitor)
    }

    /// Watch a path: directories are walked with every subdirectory added to
    /// the notifier and every regular file hashed; plain files get a watch on
    /// their parent directory.
    fn add_watch_recursive(&mut self, path: PathBuf) {
        let metadata = match std::fs::metadata(&path) {
            Ok(metadata) => metadata,
            Err(err) => {
                debug!(path = %path.display(), error = %err, "cannot watch path");
                return;
            }
        };

        if metadata.is_dir() {
            self.watch_dir_tree(&path);
        } else {
            if let Some(parent) = path.parent() {
                if let Err(err) = self.watcher.watch(parent, RecursiveMode::NonRecursive) {
                    debug!(path = %parent.display(), error = %err, "failed to add watch");
                }
            }
            self.hash_file(&path);
        }
    }

    fn watch_dir_tree(&mut self, dir: &Path) {
        if let Err(err) = self.watcher.watch(dir, RecursiveMode::NonRecursive) {
            debug!(path = %dir.display(), error = %err, "failed to add watch");
        }
        let Ok(entries) = std::fs::read_dir(dir) else {
            return;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            match entry.file_type() {
                Ok(file_type) if file_type.is_dir() => self.watch_dir_tree(&path),
                Ok(file_type) if file_type.is_file() => {
                    self.hash_file(&path);
                }
                _ => {}
            }
        }
    }

    /// Hash a regular file into the baseline. Directories, special files,
    /// and files over the size cap are skipped.
    fn hash_file(&self, path: &Path) -> Option<FileBaseline> {
        use std::os::unix::fs::MetadataExt;

        let metadata = std::fs::metadata(path).ok()?;
        if !metadata.is_file() {
            return None;
        }
        if metadata.len() > MAX_HASH_SIZE {
            debug!(path = %path.display(), size = metadata.len(), "skipping large file");
            return None;
        }

        let content = std::fs::read(path).ok()?;
        let mut hasher = Sha256::new();
        hasher.update(&content);
        let digest = hasher.finalize();

        let record = FileBaseline {
            hash: hex_string(&digest),
            mode: metadata.mode(),
            modified: metadata.modified().ok(),
            size: metadata.len(),
        };
        self.baseline
            .write()
            .insert(path.to_path_buf(), record.clone());
        Some(record)
    }

    /// Notification loop; runs until cancellation.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!("starting file integrity monitor");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("file monitor stopping");
                    return;
                }
                received = self.rx.recv() => {
                    match received {
                        Some(Ok(event)) => self.handle_fs_event(&event),
                        Some(Err(err)) => error!(error = %err, "watcher error"),
                        None => return,
                    }
                }
            }
        }
    }

    fn handle_fs_event(&mut self, event: &notify::Event) {
        let Some(operation) = map_event_kind(&event.kind) else {
            return;
        };
        for path in &event.paths {
            self.handle_path(path, operation);
        }
    }

    fn handle_path(&mut self, path: &Path, operation: FileOperation) {
        let mut severity = Severity::Medium;
        if operation == FileOperation::Delete {
            severity = Severity::High;
        }
        severity = classify_severity(path, operation, severity);

        let old_hash = self
            .baseline
            .read()
            .get(path)
            .map(|record| record.hash.clone());

        let new_record = if operation == FileOperation::Delete {
            self.baseline.write().remove(path);
            None
        } else {
            self.hash_file(path)
        };

        let file = FileEventData {
            path: path.to_string_lossy().into_owned(),
            operation,
            old_hash,
            new_hash: new_record.as_ref().map(|record| record.hash.clone()),
            size_bytes: new_record.as_ref().map(|record| record.size),
            permissions: new_record
                .as_ref()
                .map(|record| unix_mode_string(record.mode)),
        };

        let event = SecurityEvent::new(event_type_for(operation), severity).with_file(file);
        self.events.send(event);

        // Newly created directories join the watch set.
        if operation == FileOperation::Create && path.is_dir() {
            if let Err(err) = self.watcher.watch(path, RecursiveMode::NonRecursive) {
                debug!(path = %path.display(), error = %err, "failed to watch new directory");
            }
        }
    }

    #[cfg(test)]
    fn baseline_snapshot(&self) -> HashMap<PathBuf, FileBaseline> {
        self.baseline.read().clone()
    }
}

/// Project a notification kind onto a file operation; kinds with no
/// counterpart are discarded.
pub fn map_event_kind(kind: &EventKind) -> Option<FileOperation> {
    match kind {
        EventKind::Create(_) => Some(FileOperation::Create),
        EventKind::Remove(_) => Some(FileOperation::Delete),
        EventKind::Modify(ModifyKind::Name(_)) => Some(FileOperation::Rename),
        EventKind::Modify(ModifyKind::Metadata(_)) => Some(FileOperation::Chmod),
        EventKind::Modify(_) => Some(FileOperation::Modify),
        _ => None,
    }
}

/// Creations and deletions keep their own event type; everything else is a
/// modification.
fn event_type_for(operation: FileOperation) -> EventType {
    match operation {
        FileOperation::Create => EventType::FileCreate,
        FileOperation::Delete => EventType::FileDelete,
        _ => EventType::FileModify,
    }
}

/// Lift severity for security-sensitive paths.
pub fn classify_severity(path: &Path, operation: FileOperation, default: Severity) -> Severity {
    let path_str = path.to_string_lossy();

    if CRITICAL_PATHS.iter().any(|p| path_str == *p) {
        return Severity::Critical;
    }

    for high in HIGH_PATHS {
        if path_str == high || path.parent() == Some(Path::new(high)) {
            return Severity::High;
        }
    }

    if operation == FileOperation::Create {
        if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
            if SCRIPT_EXTENSIONS.contains(&ext) {
                return Severity::Medium;
            }
        }
    }

    default
}

/// Render a Unix mode as the conventional `-rwxr-xr-x` string.
pub fn unix_mode_string(mode: u32) -> String {
    let type_char = match mode & 0o170000 {
        0o040000 => 'd',
        0o120000 => 'l',
        _ => '-',
    };
    let mut out = String::with_capacity(10);
    out.push(type_char);
    for shift in [6u32, 3, 0] {
        let bits = (mode >> shift) & 0o7;
        out.push(if bits & 0o4 != 0 { 'r' } else { '-' });
        out.push(if bits & 0o2 != 0 { 'w' } else { '-' });
        out.push(if bits & 0o1 != 0 { 'x' } else { '-' });
    }
    out
}

fn hex_string(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        let _ = write!(out, "{byte:02x}");
    }
    out
}
