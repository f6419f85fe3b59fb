//! Log aggregation across all attached sub-sessions.
//!
//! Every classified console/runtime event from every sub-session funnels
//! into one [`LogAggregator`] through a single mpsc channel, consumed by
//! one task. Insertion order approximates chronology across sessions but
//! does not guarantee it; callers needing strict ordering sort by
//! [`LogEntry::timestamp_ms`] themselves.
//!
//! Retention is bounded: once the buffer is full the oldest entries are
//! evicted. Entries are otherwise cleared only on explicit request.

// ============================================================================
// Imports
// ============================================================================

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

// ============================================================================
// Constants
// ============================================================================

/// Maximum retained entries before the oldest are evicted.
const MAX_RETAINED_ENTRIES: usize = 10_000;

// ============================================================================
// SourceLabel
// ============================================================================

/// Provenance classification of a log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceLabel {
    /// Main world of a normal page.
    Page,
    /// Extension-injected isolated world inside a page.
    ContentScript,
    /// Extension-hosted page (popup, options, background page).
    Extension,
    /// Extension background service worker.
    ServiceWorker,
}

impl fmt::Display for SourceLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Page => "page",
            Self::ContentScript => "content_script",
            Self::Extension => "extension",
            Self::ServiceWorker => "service_worker",
        };
        f.write_str(s)
    }
}

// ============================================================================
// LogLevel
// ============================================================================

/// Severity of a captured entry.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    /// `console.debug` / verbose output.
    Debug,
    /// `console.log` / `console.info`.
    Info,
    /// `console.warn`.
    Warn,
    /// `console.error` / uncaught exceptions.
    Error,
}

impl LogLevel {
    /// Maps a protocol severity string to a level.
    #[must_use]
    pub fn from_protocol(s: &str) -> Self {
        match s {
            "debug" | "verbose" | "trace" => Self::Debug,
            "warning" | "warn" => Self::Warn,
            "error" | "assert" => Self::Error,
            _ => Self::Info,
        }
    }
}

// ============================================================================
// LogEntry
// ============================================================================

/// One captured console/runtime event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    /// Capture time, milliseconds since the Unix epoch.
    pub timestamp_ms: u64,

    /// Severity.
    pub level: LogLevel,

    /// Rendered message text.
    pub message: String,

    /// Provenance of the event.
    pub source: SourceLabel,

    /// Owning extension ID, when the source is extension-related.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extension_id: Option<String>,

    /// URL associated with the event, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl LogEntry {
    /// Creates an entry stamped with the current wall-clock time.
    #[must_use]
    pub fn new(level: LogLevel, message: impl Into<String>, source: SourceLabel) -> Self {
        Self {
            timestamp_ms: now_ms(),
            level,
            message: message.into(),
            source,
            extension_id: None,
            url: None,
        }
    }

    /// Attaches an extension ID.
    #[inline]
    #[must_use]
    pub fn with_extension_id(mut self, id: impl Into<String>) -> Self {
        self.extension_id = Some(id.into());
        self
    }

    /// Attaches a URL.
    #[inline]
    #[must_use]
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }
}

/// Current wall-clock time in milliseconds since the Unix epoch.
#[inline]
#[must_use]
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

// ============================================================================
// LogFilter
// ============================================================================

/// Query filter for [`LogAggregator::query`]. Empty filter matches all.
#[derive(Debug, Clone, Default)]
pub struct LogFilter {
    /// Restrict to these source labels.
    pub sources: Option<Vec<SourceLabel>>,

    /// Restrict to one extension's entries.
    pub extension_id: Option<String>,

    /// Only entries at or after this timestamp (ms since epoch).
    pub since_ms: Option<u64>,

    /// Only entries at or above this severity.
    pub min_level: Option<LogLevel>,
}

impl LogFilter {
    /// Returns `true` if the entry passes the filter.
    #[must_use]
    fn matches(&self, entry: &LogEntry) -> bool {
        if let Some(ref sources) = self.sources
            && !sources.contains(&entry.source)
        {
            return false;
        }

        if let Some(ref ext) = self.extension_id
            && entry.extension_id.as_deref() != Some(ext.as_str())
        {
            return false;
        }

        if let Some(since) = self.since_ms
            && entry.timestamp_ms < since
        {
            return false;
        }

        if let Some(min) = self.min_level
            && entry.level < min
        {
            return false;
        }

        true
    }
}

// ============================================================================
// LogAggregator
// ============================================================================

/// Append-only, insertion-ordered buffer of classified log entries.
///
/// Appends arrive from the single dispatcher task; reads may happen
/// concurrently from command handlers, hence the RwLock.
#[derive(Clone)]
pub struct LogAggregator {
    buffer: Arc<RwLock<VecDeque<LogEntry>>>,
    capacity: usize,
}

impl Default for LogAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl LogAggregator {
    /// Creates an aggregator with the default retention bound.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(MAX_RETAINED_ENTRIES)
    }

    /// Creates an aggregator retaining at most `capacity` entries.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: Arc::new(RwLock::new(VecDeque::new())),
            capacity: capacity.max(1),
        }
    }

    /// Appends one entry, evicting the oldest if at capacity.
    pub fn append(&self, entry: LogEntry) {
        let mut buffer = self.buffer.write();
        if buffer.len() >= self.capacity {
            buffer.pop_front();
        }
        buffer.push_back(entry);
    }

    /// Returns entries matching the filter, in insertion order.
    #[must_use]
    pub fn query(&self, filter: &LogFilter) -> Vec<LogEntry> {
        self.buffer
            .read()
            .iter()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect()
    }

    /// Returns the number of retained entries.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.buffer.read().len()
    }

    /// Returns `true` if no entries are retained.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buffer.read().is_empty()
    }

    /// Discards all retained entries.
    pub fn clear(&self) {
        let mut buffer = self.buffer.write();
        let count = buffer.len();
        buffer.clear();
        debug!(count, "Log buffer cleared");
    }

    /// Consumes a channel of classified entries until the senders close.
    ///
    /// Exactly one of these runs per aggregator; event listeners send
    /// entries instead of mutating the buffer directly.
    pub async fn run(self, mut rx: mpsc::UnboundedReceiver<LogEntry>) {
        while let Some(entry) = rx.recv().await {
            self.append(entry);
        }
        debug!("Log channel closed, aggregator task exiting");
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(level: LogLevel, source: SourceLabel, message: &str) -> LogEntry {
        LogEntry::new(level, message, source)
    }

    #[test]
    fn test_insertion_order_preserved() {
        let logs = LogAggregator::new();
        logs.append(entry(LogLevel::Info, SourceLabel::Page, "first"));
        logs.append(entry(LogLevel::Info, SourceLabel::ServiceWorker, "second"));

        let all = logs.query(&LogFilter::default());
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].message, "first");
        assert_eq!(all[1].message, "second");
    }

    #[test]
    fn test_bounded_retention_evicts_oldest() {
        let logs = LogAggregator::with_capacity(3);
        for i in 0..5 {
            logs.append(entry(LogLevel::Info, SourceLabel::Page, &format!("m{i}")));
        }

        let all = logs.query(&LogFilter::default());
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].message, "m2");
        assert_eq!(all[2].message, "m4");
    }

    #[test]
    fn test_filter_by_source() {
        let logs = LogAggregator::new();
        logs.append(entry(LogLevel::Info, SourceLabel::Page, "page"));
        logs.append(entry(LogLevel::Info, SourceLabel::ContentScript, "cs"));

        let filter = LogFilter {
            sources: Some(vec![SourceLabel::ContentScript]),
            ..LogFilter::default()
        };
        let matched = logs.query(&filter);
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].message, "cs");
    }

    #[test]
    fn test_filter_by_extension_id() {
        let logs = LogAggregator::new();
        logs.append(
            entry(LogLevel::Info, SourceLabel::Extension, "mine").with_extension_id("abc"),
        );
        logs.append(
            entry(LogLevel::Info, SourceLabel::Extension, "other").with_extension_id("xyz"),
        );

        let filter = LogFilter {
            extension_id: Some("abc".into()),
            ..LogFilter::default()
        };
        let matched = logs.query(&filter);
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].message, "mine");
    }

    #[test]
    fn test_filter_by_since_and_level() {
        let logs = LogAggregator::new();
        let mut old = entry(LogLevel::Error, SourceLabel::Page, "old");
        old.timestamp_ms = 1_000;
        logs.append(old);
        let mut recent = entry(LogLevel::Debug, SourceLabel::Page, "recent-debug");
        recent.timestamp_ms = 2_000;
        logs.append(recent);

        let filter = LogFilter {
            since_ms: Some(1_500),
            ..LogFilter::default()
        };
        assert_eq!(logs.query(&filter).len(), 1);

        let filter = LogFilter {
            min_level: Some(LogLevel::Warn),
            ..LogFilter::default()
        };
        let matched = logs.query(&filter);
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].message, "old");
    }

    #[test]
    fn test_clear() {
        let logs = LogAggregator::new();
        logs.append(entry(LogLevel::Info, SourceLabel::Page, "x"));
        assert!(!logs.is_empty());
        logs.clear();
        assert!(logs.is_empty());
    }

    #[test]
    fn test_level_from_protocol() {
        assert_eq!(LogLevel::from_protocol("warning"), LogLevel::Warn);
        assert_eq!(LogLevel::from_protocol("error"), LogLevel::Error);
        assert_eq!(LogLevel::from_protocol("log"), LogLevel::Info);
        assert_eq!(LogLevel::from_protocol("verbose"), LogLevel::Debug);
    }

    #[tokio::test]
    async fn test_channel_consumer_appends() {
        let logs = LogAggregator::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(logs.clone().run(rx));

        tx.send(entry(LogLevel::Info, SourceLabel::Page, "via channel"))
            .expect("send");
        drop(tx);
        task.await.expect("consumer task");

        assert_eq!(logs.len(), 1);
    }
}
