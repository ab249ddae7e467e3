use std::collections::VecDeque;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct ActivityEntry {
    pub timestamp: i64,
    pub level: String,
    pub message: String,
    pub file: Option<String>,
}

/// Bounded in-memory ring of recent backup activity, shared between the
/// change handler and the REST layer.
#[derive(Clone)]
pub struct ActivityLog {
    buffer: Arc<Mutex<VecDeque<ActivityEntry>>>,
    max_entries: usize,
}

impl ActivityLog {
    pub fn new(max_entries: usize) -> Self {
        Self {
            buffer: Arc::new(Mutex::new(VecDeque::with_capacity(max_entries))),
            max_entries,
        }
    }

    pub fn record(&self, level: &str, message: String, file: Option<String>) {
        let entry = ActivityEntry {
            timestamp: Utc::now().timestamp(),
            level: level.to_string(),
            message,
            file,
        };

        let mut buffer = self.buffer.lock();
        if buffer.len() >= self.max_entries {
            buffer.pop_front();
        }
        buffer.push_back(entry);
    }

    pub fn recent(&self, limit: Option<usize>) -> Vec<ActivityEntry> {
        let buffer = self.buffer.lock();
        let logs: Vec<ActivityEntry> = buffer.iter().cloned().collect();
        match limit {
            Some(n) => logs.into_iter().rev().take(n).rev().collect(),
            None => logs,
        }
    }
}
