//! In-memory metric history.

use super::MetricLogger;
use std::collections::BTreeMap;
use std::sync::Mutex;

/// Number of most recent values averaged by [`RecordingLogger::recent_stats`]
const RECENT_WINDOW: usize = 5;

/// Logger that keeps every `(step, value)` pair per statistic.
#[derive(Default)]
pub struct RecordingLogger {
    history: Mutex<BTreeMap<String, Vec<(u64, f64)>>>,
}

impl RecordingLogger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Full history of one statistic
    pub fn history(&self, name: &str) -> Vec<(u64, f64)> {
        self.history
            .lock()
            .map(|h| h.get(name).cloned().unwrap_or_default())
            .unwrap_or_default()
    }

    /// Most recent `(step, value)` of one statistic
    pub fn last(&self, name: &str) -> Option<(u64, f64)> {
        self.history
            .lock()
            .ok()
            .and_then(|h| h.get(name).and_then(|v| v.last().copied()))
    }

    /// Names of every statistic seen so far, sorted
    pub fn names(&self) -> Vec<String> {
        self.history
            .lock()
            .map(|h| h.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Mean of the last few values of every statistic, sorted by name
    pub fn recent_stats(&self) -> Vec<(String, f64)> {
        let Ok(history) = self.history.lock() else {
            return Vec::new();
        };
        history
            .iter()
            .filter(|(_, values)| !values.is_empty())
            .map(|(name, values)| {
                let window = &values[values.len().saturating_sub(RECENT_WINDOW)..];
                let mean = window.iter().map(|(_, v)| v).sum::<f64>() / window.len() as f64;
                (name.clone(), mean)
            })
            .collect()
    }

    /// Render [`recent_stats`](Self::recent_stats) as one line
    pub fn summary(&self, step: u64) -> String {
        let body = self
            .recent_stats()
            .iter()
            .map(|(name, value)| format!("{}: {:.4}", name, value))
            .collect::<Vec<_>>()
            .join("\t");
        format!("Recent stats | t_env: {}\n{}", step, body)
    }
}

impl MetricLogger for RecordingLogger {
    fn log_stat(&self, name: &str, value: f64, step: u64) {
        if let Ok(mut history) = self.history.lock() {
            history.entry(name.to_string()).or_default().push((step, value));
        }
    }
}
