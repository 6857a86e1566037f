//! Append-only, human-readable record of connection activity.
//!
//! Every component appends here; the presentation side renders it or
//! subscribes for live updates. Entries are mirrored to the `log` facade.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

const SUBSCRIBER_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogKind {
    Info,
    Permission,
    Lifecycle,
    Received,
    Sent,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub kind: LogKind,
    pub message: String,
}

#[derive(Default)]
struct LogInner {
    entries: Vec<LogEntry>,
    next_seq: u64,
}

#[derive(Clone)]
pub struct ConnectionLog {
    inner: Arc<Mutex<LogInner>>,
    events_tx: broadcast::Sender<LogEntry>,
}

impl ConnectionLog {
    pub fn new() -> Self {
        let (events_tx, _events_rx) = broadcast::channel(SUBSCRIBER_CAPACITY);
        Self {
            inner: Arc::new(Mutex::new(LogInner::default())),
            events_tx,
        }
    }

    pub fn append(&self, kind: LogKind, message: impl Into<String>) {
        let message = message.into();
        match kind {
            LogKind::Error => log::error!("{}", message.trim_end()),
            LogKind::Received => log::debug!("Received: {:?}", message),
            LogKind::Sent => log::debug!("Sent: {:?}", message),
            _ => log::info!("{}", message.trim_end()),
        }

        let entry = {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            let entry = LogEntry {
                seq: inner.next_seq,
                timestamp: Utc::now(),
                kind,
                message,
            };
            inner.next_seq += 1;
            inner.entries.push(entry.clone());
            entry
        };
        // No subscribers is fine
        let _ = self.events_tx.send(entry);
    }

    pub fn info(&self, message: impl Into<String>) {
        self.append(LogKind::Info, message);
    }

    pub fn error(&self, message: impl Into<String>) {
        self.append(LogKind::Error, message);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LogEntry> {
        self.events_tx.subscribe()
    }

    pub fn entries(&self) -> Vec<LogEntry> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).entries.clone()
    }

    pub fn entries_of(&self, kind: LogKind) -> Vec<LogEntry> {
        self.entries().into_iter().filter(|e| e.kind == kind).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All received text concatenated in arrival order.
    pub fn received_text(&self) -> String {
        self.entries_of(LogKind::Received)
            .into_iter()
            .map(|e| e.message)
            .collect()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.entries().iter().any(|e| e.message.contains(needle))
    }

    /// Text form shown by the terminal screen.
    pub fn render(&self) -> String {
        let mut out = String::from("Logs:\n");
        for entry in self.entries() {
            out.push_str(&format_entry(&entry));
        }
        out
    }
}

impl Default for ConnectionLog {
    fn default() -> Self {
        Self::new()
    }
}

pub fn format_entry(entry: &LogEntry) -> String {
    let mut line = match entry.kind {
        LogKind::Received => entry.message.clone(),
        LogKind::Sent => format!("Sending: {}", entry.message),
        LogKind::Error => format!("Error: {}", entry.message),
        _ => entry.message.clone(),
    };
    if entry.kind != LogKind::Received && !line.ends_with('\n') {
        line.push('\n');
    }
    line
}
