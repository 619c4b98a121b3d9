//! Frameflow common library
//!
//! This crate contains configuration, errors and metrics shared by Frameflow components.

pub mod config;
pub mod error;
pub mod metrics;

// Re-export commonly used types
pub use config::WorkerConfig;
pub use error::{FrameflowError, Result};
pub use metrics::{MetricsRegistry, TaskMetrics};
