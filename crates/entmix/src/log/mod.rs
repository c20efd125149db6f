//! Metric logging.
//!
//! Provides:
//! - `MetricLogger` trait implemented by every backend
//! - `ConsoleLogger` for tracing output
//! - `RecordingLogger` keeping an in-memory history with a recent-stats summary
//! - `TensorBoardLogger` for visualization (optional)
//! - `CompositeLogger` for multi-backend logging

mod console;
mod logger;
mod recording;
#[cfg(feature = "tensorboard")]
mod tensorboard;

pub use console::ConsoleLogger;
pub use logger::{CompositeLogger, MetricLogger, NoOpLogger};
pub use recording::RecordingLogger;
#[cfg(feature = "tensorboard")]
pub use tensorboard::TensorBoardLogger;
