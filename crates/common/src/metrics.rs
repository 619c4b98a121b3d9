//! Metrics collection for Frameflow
//!
//! This module provides Prometheus metrics for observability. Metric families are
//! labeled by task id; each pipeline task receives its own [`TaskMetrics`] handles so
//! nothing in the hot path touches the registry.

use crate::error::Result;
use prometheus::{
    Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec,
    Opts, Registry,
};
use std::sync::Arc;

const TASK_LABEL: &str = "task";

/// Metrics registry for Frameflow
#[derive(Debug, Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub inference: InferenceMetrics,
    pub stream: StreamMetrics,
}

/// Inference-related metric families
#[derive(Debug, Clone)]
pub struct InferenceMetrics {
    /// Inference + publish duration per frame
    pub duration: HistogramVec,

    /// Frames processed and acknowledged
    pub frames_processed: IntCounterVec,

    /// Frames left pending after a processing failure
    pub frames_failed: IntCounterVec,

    /// Malformed frames acknowledged without output
    pub frames_rejected: IntCounterVec,

    /// Batches currently being processed
    pub batches_in_flight: IntGaugeVec,
}

/// Stream consumption metric families
#[derive(Debug, Clone)]
pub struct StreamMetrics {
    /// Entries taken over from idle consumers
    pub entries_claimed: IntCounterVec,

    /// New entries delivered by group reads
    pub entries_read: IntCounterVec,

    /// Connection failures seen by the consumption loop
    pub connection_errors: IntCounterVec,
}

/// Per-task metric handles
#[derive(Debug, Clone)]
pub struct TaskMetrics {
    pub duration: Histogram,
    pub frames_processed: IntCounter,
    pub frames_failed: IntCounter,
    pub frames_rejected: IntCounter,
    pub batches_in_flight: IntGauge,
    pub entries_claimed: IntCounter,
    pub entries_read: IntCounter,
    pub connection_errors: IntCounter,
}

impl MetricsRegistry {
    /// Create a new metrics registry
    pub fn new() -> Result<Self> {
        let registry = Arc::new(Registry::new());

        // Inference metrics
        let duration = HistogramVec::new(
            HistogramOpts::new(
                "frameflow_inference_duration_seconds",
                "Inference and publish duration per frame in seconds",
            )
            .buckets(vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
            &[TASK_LABEL],
        )?;

        let frames_processed = IntCounterVec::new(
            Opts::new(
                "frameflow_frames_processed_total",
                "Total number of frames processed and acknowledged",
            ),
            &[TASK_LABEL],
        )?;

        let frames_failed = IntCounterVec::new(
            Opts::new(
                "frameflow_frames_failed_total",
                "Total number of frames left pending after a processing failure",
            ),
            &[TASK_LABEL],
        )?;

        let frames_rejected = IntCounterVec::new(
            Opts::new(
                "frameflow_frames_rejected_total",
                "Total number of malformed frames acknowledged without output",
            ),
            &[TASK_LABEL],
        )?;

        let batches_in_flight = IntGaugeVec::new(
            Opts::new(
                "frameflow_batches_in_flight",
                "Current number of batches being processed",
            ),
            &[TASK_LABEL],
        )?;

        // Stream metrics
        let entries_claimed = IntCounterVec::new(
            Opts::new(
                "frameflow_entries_claimed_total",
                "Total number of pending entries claimed from idle consumers",
            ),
            &[TASK_LABEL],
        )?;

        let entries_read = IntCounterVec::new(
            Opts::new(
                "frameflow_entries_read_total",
                "Total number of new entries read from the input stream",
            ),
            &[TASK_LABEL],
        )?;

        let connection_errors = IntCounterVec::new(
            Opts::new(
                "frameflow_stream_connection_errors_total",
                "Total number of stream store connection failures",
            ),
            &[TASK_LABEL],
        )?;

        // Register all metrics
        registry.register(Box::new(duration.clone()))?;
        registry.register(Box::new(frames_processed.clone()))?;
        registry.register(Box::new(frames_failed.clone()))?;
        registry.register(Box::new(frames_rejected.clone()))?;
        registry.register(Box::new(batches_in_flight.clone()))?;

        registry.register(Box::new(entries_claimed.clone()))?;
        registry.register(Box::new(entries_read.clone()))?;
        registry.register(Box::new(connection_errors.clone()))?;

        Ok(MetricsRegistry {
            registry,
            inference: InferenceMetrics {
                duration,
                frames_processed,
                frames_failed,
                frames_rejected,
                batches_in_flight,
            },
            stream: StreamMetrics {
                entries_claimed,
                entries_read,
                connection_errors,
            },
        })
    }

    /// Handles for one task, labeled with its id
    pub fn for_task(&self, task_id: &str) -> TaskMetrics {
        let labels = [task_id];
        TaskMetrics {
            duration: self.inference.duration.with_label_values(&labels),
            frames_processed: self.inference.frames_processed.with_label_values(&labels),
            frames_failed: self.inference.frames_failed.with_label_values(&labels),
            frames_rejected: self.inference.frames_rejected.with_label_values(&labels),
            batches_in_flight: self.inference.batches_in_flight.with_label_values(&labels),
            entries_claimed: self.stream.entries_claimed.with_label_values(&labels),
            entries_read: self.stream.entries_read.with_label_values(&labels),
            connection_errors: self.stream.connection_errors.with_label_values(&labels),
        }
    }

    /// Gather all metrics as text
    pub fn gather(&self) -> Result<String> {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        String::from_utf8(buffer)
            .map_err(|e| crate::FrameflowError::internal(format!("metrics are not UTF-8: {}", e)))
    }
}

impl TaskMetrics {
    /// Standalone handles backed by a private registry
    pub fn detached(task_id: &str) -> Result<Self> {
        Ok(MetricsRegistry::new()?.for_task(task_id))
    }
}
