use std::collections::VecDeque;
use std::fmt::Write;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// How many raw entries are retained before the oldest are dropped.
pub const MAX_ENTRIES: usize = 500;
/// Hard cap on how many entries a single query may return.
pub const MAX_QUERY_LIMIT: usize = 200;
const DEFAULT_QUERY_LIMIT: usize = 100;

pub fn hex_string(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        _ = write!(out, "{byte:02x}");
    }
    out
}

#[derive(Debug, Clone, Serialize)]
pub struct RawLogEntry {
    pub at: DateTime<Utc>,
    /// Listener port the traffic arrived on.
    pub port: u16,
    pub remote: Option<String>,
    /// Hex dump for binary traffic, request summary for HTTP.
    pub raw: String,
}

/// Bounded in-memory ring of raw inbound traffic, for protocol debugging.
#[derive(Default)]
pub struct RawLog {
    entries: Mutex<VecDeque<RawLogEntry>>,
}

impl RawLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, port: u16, remote: Option<String>, raw: String) {
        let mut entries = self.entries.lock().expect("poisoned RawLog lock");
        entries.push_front(RawLogEntry {
            at: Utc::now(),
            port,
            remote,
            raw,
        });
        entries.truncate(MAX_ENTRIES);
    }

    /// The most recent entries, newest first, optionally filtered by port.
    pub fn list(&self, port: Option<u16>, limit: Option<usize>) -> Vec<RawLogEntry> {
        let limit = limit.unwrap_or(DEFAULT_QUERY_LIMIT).min(MAX_QUERY_LIMIT);
        let entries = self.entries.lock().expect("poisoned RawLog lock");
        entries
            .iter()
            .filter(|entry| port.map_or(true, |port| entry.port == port))
            .take(limit)
            .cloned()
            .collect()
    }
}
