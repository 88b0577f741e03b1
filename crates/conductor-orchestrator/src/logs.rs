use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Severity of an execution log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub agent: String,
    pub message: String,
    pub details: serde_json::Value,
}

/// Bounded per-agent execution log backing `get-logs`.
///
/// Oldest entries are evicted once an agent reaches `capacity`.
#[derive(Debug)]
pub struct LogStore {
    capacity: usize,
    entries: DashMap<String, VecDeque<LogEntry>>,
}

impl LogStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: DashMap::new(),
        }
    }

    pub fn record(
        &self,
        agent: &str,
        level: LogLevel,
        message: impl Into<String>,
        details: serde_json::Value,
    ) {
        let entry = LogEntry {
            timestamp: Utc::now(),
            level,
            agent: agent.to_string(),
            message: message.into(),
            details,
        };
        let mut log = self.entries.entry(agent.to_string()).or_default();
        if log.len() == self.capacity {
            log.pop_front();
        }
        log.push_back(entry);
    }

    /// Up to `limit` entries at or above `min_level`, newest first.
    pub fn recent(&self, agent: &str, limit: usize, min_level: Option<LogLevel>) -> Vec<LogEntry> {
        let Some(log) = self.entries.get(agent) else {
            return Vec::new();
        };
        let recent = log
            .iter()
            .rev()
            .filter(|e| min_level.map_or(true, |min| e.level >= min))
            .take(limit)
            .cloned()
            .collect();
        recent
    }

    pub(crate) fn remove(&self, agent: &str) {
        self.entries.remove(agent);
    }
}
