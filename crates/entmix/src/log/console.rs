//! Console logging backend.

use super::MetricLogger;
use std::collections::HashMap;

/// Logger that emits every statistic as a structured `tracing` event.
///
/// Events go to the `entmix::stats` target so they can be filtered apart
/// from diagnostics, e.g. `RUST_LOG=entmix::stats=off`.
#[derive(Default)]
pub struct ConsoleLogger {
    prefix: String,
}

impl ConsoleLogger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Prepend `prefix` to every statistic name (e.g. `test_` for evaluation runs)
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    fn name<'a>(&self, name: &'a str) -> std::borrow::Cow<'a, str> {
        if self.prefix.is_empty() {
            name.into()
        } else {
            format!("{}{}", self.prefix, name).into()
        }
    }
}

impl MetricLogger for ConsoleLogger {
    fn log_stat(&self, name: &str, value: f64, step: u64) {
        tracing::info!(target: "entmix::stats", t_env = step, "{}: {:.4}", self.name(name), value);
    }

    fn log_metrics(&self, metrics: &HashMap<String, f64>, step: u64) {
        let mut sorted: Vec<_> = metrics.iter().collect();
        sorted.sort_by(|a, b| a.0.cmp(b.0));

        let body = sorted
            .iter()
            .map(|(key, value)| format!("{}: {:.4}", self.name(key), value))
            .collect::<Vec<_>>()
            .join("\t");
        tracing::info!(target: "entmix::stats", t_env = step, "{}", body);
    }
}
