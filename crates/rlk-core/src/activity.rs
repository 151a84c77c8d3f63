//! Operator-visible activity log.
//!
//! Both roles record what happened to the session (connections, commands,
//! failures) as short human-readable entries. Entries go to pluggable sinks
//! (bounded memory buffer, append-only file) and are mirrored to `tracing`.
//!
//! Recording never fails the caller: sink errors are logged and dropped.

use std::collections::VecDeque;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

/// Entries kept by the memory sink unless configured otherwise.
pub const DEFAULT_CAPACITY: usize = 50;

/// Errors from activity sinks.
#[derive(Debug, Error)]
pub enum ActivityError {
    #[error("io error: {0}")]
    IoError(String),
}

impl From<std::io::Error> for ActivityError {
    fn from(e: std::io::Error) -> Self {
        ActivityError::IoError(e.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActivityKind {
    Success,
    Error,
    Warning,
    Command,
    Info,
}

impl ActivityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityKind::Success => "success",
            ActivityKind::Error => "error",
            ActivityKind::Warning => "warning",
            ActivityKind::Command => "command",
            ActivityKind::Info => "info",
        }
    }

    pub fn icon(&self) -> &'static str {
        match self {
            ActivityKind::Success => "✓",
            ActivityKind::Error => "✗",
            ActivityKind::Warning => "⚠",
            ActivityKind::Command => "»",
            ActivityKind::Info => "ℹ",
        }
    }
}

impl fmt::Display for ActivityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivityEntry {
    pub timestamp: DateTime<Utc>,
    pub kind: ActivityKind,
    pub message: String,
}

impl ActivityEntry {
    pub fn new(kind: ActivityKind, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            kind,
            message: message.into(),
        }
    }

    /// Single-line form used by the file sink and terminal output.
    pub fn to_log_line(&self) -> String {
        format!(
            "[{}] {} {:<7} {}",
            self.timestamp.format("%Y-%m-%d %H:%M:%S"),
            self.kind.icon(),
            self.kind.as_str(),
            self.message
        )
    }
}

/// Destination for activity entries.
#[async_trait]
pub trait ActivitySink: Send + Sync {
    async fn record(&self, entry: &ActivityEntry) -> Result<(), ActivityError>;
}

/// Keeps the most recent entries in memory, dropping the oldest.
pub struct MemoryActivitySink {
    entries: RwLock<VecDeque<ActivityEntry>>,
    max_entries: usize,
}

impl MemoryActivitySink {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: RwLock::new(VecDeque::with_capacity(max_entries)),
            max_entries,
        }
    }

    /// Entries oldest first.
    pub async fn entries(&self) -> Vec<ActivityEntry> {
        self.entries.read().await.iter().cloned().collect()
    }

    pub async fn count(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }

    /// True if any entry of `kind` contains `needle`.
    pub async fn contains(&self, kind: ActivityKind, needle: &str) -> bool {
        self.entries
            .read()
            .await
            .iter()
            .any(|e| e.kind == kind && e.message.contains(needle))
    }
}

impl Default for MemoryActivitySink {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[async_trait]
impl ActivitySink for MemoryActivitySink {
    async fn record(&self, entry: &ActivityEntry) -> Result<(), ActivityError> {
        let mut entries = self.entries.write().await;
        while entries.len() >= self.max_entries.max(1) {
            entries.pop_front();
        }
        entries.push_back(entry.clone());
        Ok(())
    }
}

/// Appends one line per entry to a file.
#[derive(Debug)]
pub struct FileActivitySink {
    path: PathBuf,
}

impl FileActivitySink {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ActivitySink for FileActivitySink {
    async fn record(&self, entry: &ActivityEntry) -> Result<(), ActivityError> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;

        file.write_all(entry.to_log_line().as_bytes()).await?;
        file.write_all(b"\n").await?;
        file.flush().await?;

        Ok(())
    }
}

/// Prints one line per entry to stderr, for the terminal front ends.
#[derive(Debug, Default)]
pub struct ConsoleActivitySink;

#[async_trait]
impl ActivitySink for ConsoleActivitySink {
    async fn record(&self, entry: &ActivityEntry) -> Result<(), ActivityError> {
        use std::io::Write;

        writeln!(std::io::stderr().lock(), "{}", entry.to_log_line())?;
        Ok(())
    }
}

/// Fans entries out to every sink and to `tracing`.
#[derive(Default)]
pub struct ActivityLog {
    sinks: Vec<Arc<dyn ActivitySink>>,
}

impl ActivityLog {
    /// Create a log with no sinks; entries only reach `tracing`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Log backed by a bounded memory sink, returning both.
    pub fn with_memory(capacity: usize) -> (Self, Arc<MemoryActivitySink>) {
        let sink = Arc::new(MemoryActivitySink::new(capacity));
        let mut log = Self::new();
        log.add_sink(sink.clone());
        (log, sink)
    }

    pub fn add_sink(&mut self, sink: Arc<dyn ActivitySink>) {
        self.sinks.push(sink);
    }

    pub async fn record(&self, kind: ActivityKind, message: impl Into<String>) {
        let entry = ActivityEntry::new(kind, message);

        match kind {
            ActivityKind::Error => error!(target: "rlk::activity", "{}", entry.message),
            ActivityKind::Warning => warn!(target: "rlk::activity", "{}", entry.message),
            ActivityKind::Success | ActivityKind::Command | ActivityKind::Info => {
                info!(target: "rlk::activity", kind = kind.as_str(), "{}", entry.message)
            }
        }

        for sink in &self.sinks {
            if let Err(e) = sink.record(&entry).await {
                debug!(error = %e, "activity sink failed");
            }
        }
    }

    pub async fn success(&self, message: impl Into<String>) {
        self.record(ActivityKind::Success, message).await
    }

    pub async fn error(&self, message: impl Into<String>) {
        self.record(ActivityKind::Error, message).await
    }

    pub async fn warning(&self, message: impl Into<String>) {
        self.record(ActivityKind::Warning, message).await
    }

    pub async fn command(&self, message: impl Into<String>) {
        self.record(ActivityKind::Command, message).await
    }

    pub async fn info(&self, message: impl Into<String>) {
        self.record(ActivityKind::Info, message).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_memory_sink_keeps_latest() {
        let (log, sink) = ActivityLog::with_memory(3);
        for i in 0..5 {
            log.info(format!("entry {i}")).await;
        }
        let entries = sink.entries().await;
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].message, "entry 2");
        assert_eq!(entries[2].message, "entry 4");
    }

    #[tokio::test]
    async fn test_default_capacity() {
        let (log, sink) = ActivityLog::with_memory(DEFAULT_CAPACITY);
        for i in 0..60 {
            log.command(format!("cmd {i}")).await;
        }
        assert_eq!(sink.count().await, DEFAULT_CAPACITY);
    }

    #[tokio::test]
    async fn test_contains_matches_kind() {
        let (log, sink) = ActivityLog::with_memory(10);
        log.error("No client connected").await;
        assert!(sink.contains(ActivityKind::Error, "No client").await);
        assert!(!sink.contains(ActivityKind::Info, "No client").await);
    }

    #[tokio::test]
    async fn test_file_sink_appends_lines() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("activity.log");

        let mut log = ActivityLog::new();
        log.add_sink(Arc::new(FileActivitySink::new(&path)));
        log.success("Session created").await;
        log.warning("Phone locked").await;

        let content = tokio::fs::read_to_string(&path).await.unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("success") && lines[0].contains("Session created"));
        assert!(lines[1].contains("⚠"));
    }

    #[tokio::test]
    async fn test_console_sink_accepts_entries() {
        let entry = ActivityEntry::new(ActivityKind::Info, "Connected to session: s1");
        ConsoleActivitySink.record(&entry).await.unwrap();
    }

    #[tokio::test]
    async fn test_failing_sink_does_not_propagate() {
        let dir = TempDir::new().unwrap();
        // A directory cannot be opened for append.
        let mut log = ActivityLog::new();
        log.add_sink(Arc::new(FileActivitySink::new(dir.path())));
        log.info("still fine").await;
    }
}
