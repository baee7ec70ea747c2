//! Console channels that session output is written to.
//!
//! A session logs status lines ("Connecting...", "Upload finished.") and
//! streams device output through a [`LogSink`]. The CLI renders a sink as a
//! timestamped console; [`MemorySink`] keeps everything for inspection.

use std::sync::{Mutex, PoisonError};

/// Destination for one session's console output.
pub trait LogSink: Send + Sync {
    /// Drop everything shown so far.
    fn clear(&self);

    /// Append a complete status line.
    fn append_line(&self, line: &str);

    /// Append raw text that may end mid-line.
    fn append_fragment(&self, text: &str);
}

/// One entry recorded by [`MemorySink`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogEntry {
    /// Status line.
    Line(String),
    /// Raw device text.
    Fragment(String),
}

/// Sink that records entries in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    channel: String,
    entries: Mutex<Vec<LogEntry>>,
}

impl MemorySink {
    /// Create an empty sink for a named channel.
    pub fn new(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            entries: Mutex::default(),
        }
    }

    /// Channel name.
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// All recorded entries in order.
    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Recorded status lines only.
    pub fn lines(&self) -> Vec<String> {
        self.entries()
            .into_iter()
            .filter_map(|e| match e {
                LogEntry::Line(line) => Some(line),
                LogEntry::Fragment(_) => None,
            })
            .collect()
    }

    /// Concatenated device text.
    pub fn device_text(&self) -> String {
        self.entries()
            .into_iter()
            .filter_map(|e| match e {
                LogEntry::Fragment(text) => Some(text),
                LogEntry::Line(_) => None,
            })
            .collect()
    }

    /// Whether any status line contains `needle`.
    pub fn has_line_containing(&self, needle: &str) -> bool {
        self.lines().iter().any(|l| l.contains(needle))
    }

    fn push(&self, entry: LogEntry) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(entry);
    }
}

impl LogSink for MemorySink {
    fn clear(&self) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    fn append_line(&self, line: &str) {
        self.push(LogEntry::Line(line.to_string()));
    }

    fn append_fragment(&self, text: &str) {
        self.push(LogEntry::Fragment(text.to_string()));
    }
}
