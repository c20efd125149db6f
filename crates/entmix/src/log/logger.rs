//! Metric logger trait and composites.

use std::collections::HashMap;
use std::sync::Arc;

/// Trait for logging learner statistics to various backends.
pub trait MetricLogger: Send + Sync {
    /// Record one scalar statistic at environment step `step`.
    fn log_stat(&self, name: &str, value: f64, step: u64);

    /// Record several statistics at once.
    fn log_metrics(&self, metrics: &HashMap<String, f64>, step: u64) {
        for (name, value) in metrics {
            self.log_stat(name, *value, step);
        }
    }

    /// Flush pending writes.
    fn close(&self) {}
}

impl<L: MetricLogger + ?Sized> MetricLogger for Arc<L> {
    fn log_stat(&self, name: &str, value: f64, step: u64) {
        (**self).log_stat(name, value, step);
    }

    fn log_metrics(&self, metrics: &HashMap<String, f64>, step: u64) {
        (**self).log_metrics(metrics, step);
    }

    fn close(&self) {
        (**self).close();
    }
}

/// A logger that does nothing.
pub struct NoOpLogger;

impl MetricLogger for NoOpLogger {
    fn log_stat(&self, _name: &str, _value: f64, _step: u64) {}
    fn log_metrics(&self, _metrics: &HashMap<String, f64>, _step: u64) {}
}

/// Dispatches to multiple backends.
#[derive(Default)]
pub struct CompositeLogger {
    loggers: Vec<Box<dyn MetricLogger>>,
}

impl CompositeLogger {
    pub fn new(loggers: Vec<Box<dyn MetricLogger>>) -> Self {
        Self { loggers }
    }

    pub fn add(&mut self, logger: Box<dyn MetricLogger>) {
        self.loggers.push(logger);
    }

    pub fn len(&self) -> usize {
        self.loggers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.loggers.is_empty()
    }
}

impl MetricLogger for CompositeLogger {
    fn log_stat(&self, name: &str, value: f64, step: u64) {
        for logger in &self.loggers {
            logger.log_stat(name, value, step);
        }
    }

    fn log_metrics(&self, metrics: &HashMap<String, f64>, step: u64) {
        for logger in &self.loggers {
            logger.log_metrics(metrics, step);
        }
    }

    fn close(&self) {
        for logger in &self.loggers {
            logger.close();
        }
    }
}
