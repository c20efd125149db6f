//! TensorBoard logging backend.

use super::MetricLogger;
use crate::Result;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tensorboard_rs::summary_writer::SummaryWriter;

/// Logger that writes learner statistics to TensorBoard event files.
///
/// Scalars are buffered by the writer; [`close`](MetricLogger::close) and
/// every [`log_metrics`](MetricLogger::log_metrics) call flush.
pub struct TensorBoardLogger {
    writer: Mutex<SummaryWriter>,
    log_dir: PathBuf,
}

impl TensorBoardLogger {
    /// Create the directory if needed and open a writer in it
    pub fn new(log_dir: impl AsRef<Path>) -> Result<Self> {
        let log_dir = log_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&log_dir)?;
        Ok(Self {
            writer: Mutex::new(SummaryWriter::new(&log_dir)),
            log_dir,
        })
    }

    /// Writer under `<local_results_path>/tb_logs/<token>`
    pub fn for_run(local_results_path: impl AsRef<Path>, token: &str) -> Result<Self> {
        Self::new(local_results_path.as_ref().join("tb_logs").join(token))
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }
}

impl MetricLogger for TensorBoardLogger {
    fn log_stat(&self, name: &str, value: f64, step: u64) {
        if let Ok(mut writer) = self.writer.lock() {
            writer.add_scalar(name, value as f32, step as usize);
        }
    }

    fn log_metrics(&self, metrics: &HashMap<String, f64>, step: u64) {
        if let Ok(mut writer) = self.writer.lock() {
            for (name, value) in metrics {
                writer.add_scalar(name, *value as f32, step as usize);
            }
            let _ = writer.flush();
        }
    }

    fn close(&self) {
        if let Ok(mut writer) = self.writer.lock() {
            let _ = writer.flush();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_writes_event_file() {
        let dir = tempfile::tempdir().unwrap();
        let logger = TensorBoardLogger::for_run(dir.path(), "run").unwrap();
        assert!(logger.log_dir().ends_with("tb_logs/run"));

        logger.log_stat("loss", 0.5, 10);
        logger.close();
        let files = std::fs::read_dir(logger.log_dir()).unwrap().count();
        assert!(files > 0);
    }
}
