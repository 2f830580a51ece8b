//! The human-facing activity log.
//!
//! Every notable step lands here with an emoji marker, capped at a fixed
//! capacity so a long-running agent does not grow without bound. The CLI
//! renders the tail with `console` styling.

use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use console::style;
use serde::{Deserialize, Serialize};

const DEFAULT_CAPACITY: usize = 500;

/// One activity line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityEntry {
    pub timestamp: DateTime<Utc>,
    pub icon: String,
    pub message: String,
}

impl ActivityEntry {
    /// Styled one-line rendering for the terminal.
    pub fn render(&self) -> String {
        format!(
            "{} {} {}",
            style(self.timestamp.format("%H:%M:%S").to_string()).dim(),
            self.icon,
            self.message
        )
    }
}

/// Bounded in-memory activity feed.
pub struct ActivityLog {
    entries: Mutex<VecDeque<ActivityEntry>>,
    capacity: usize,
}

impl ActivityLog {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            capacity,
        }
    }

    /// Record one line; drops the oldest entry when at capacity.
    pub fn record(&self, icon: &str, message: impl Into<String>) {
        let entry = ActivityEntry {
            timestamp: Utc::now(),
            icon: icon.to_string(),
            message: message.into(),
        };
        if let Ok(mut entries) = self.entries.lock() {
            if entries.len() == self.capacity {
                entries.pop_front();
            }
            entries.push_back(entry);
        }
    }

    /// The newest `n` entries, oldest first.
    pub fn recent(&self, n: usize) -> Vec<ActivityEntry> {
        match self.entries.lock() {
            Ok(entries) => entries.iter().rev().take(n).rev().cloned().collect(),
            Err(_) => Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ActivityLog {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_recent() {
        let log = ActivityLog::new();
        log.record("🔍", "Evaluating issue #42");
        log.record("🌿", "Created branch argus/issue-42");
        let recent = log.recent(10);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].icon, "🔍");
        assert_eq!(recent[1].message, "Created branch argus/issue-42");
    }

    #[test]
    fn test_recent_returns_tail_oldest_first() {
        let log = ActivityLog::new();
        for i in 0..5 {
            log.record("•", format!("event {}", i));
        }
        let recent = log.recent(2);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].message, "event 3");
        assert_eq!(recent[1].message, "event 4");
    }

    #[test]
    fn test_capacity_drops_oldest() {
        let log = ActivityLog::with_capacity(3);
        for i in 0..5 {
            log.record("•", format!("event {}", i));
        }
        assert_eq!(log.len(), 3);
        let recent = log.recent(3);
        assert_eq!(recent[0].message, "event 2");
    }

    #[test]
    fn test_render_contains_icon_and_message() {
        let entry = ActivityEntry {
            timestamp: Utc::now(),
            icon: "✅".to_string(),
            message: "CI passing".to_string(),
        };
        let rendered = entry.render();
        assert!(rendered.contains("✅"));
        assert!(rendered.contains("CI passing"));
    }
}
