//! Per-batch message processing
//!
//! Each claimed or read batch is processed strictly in delivery order: detect, publish
//! the prediction entry, acknowledge the source entry, record metrics, yield.
//!
//! Failure policy: if detection, publish or acknowledge fails for an entry, the batch
//! stops there. That entry and every later one stay unacknowledged in the pending list
//! and are picked up again by a reclaim sweep once idle. Entries that lack a required
//! field can never succeed, so they are acknowledged without output and counted as
//! rejected.

use crate::detector::Detector;
use crate::store::StreamStore;
use frameflow_common::config::StreamsConfig;
use frameflow_common::{Result, TaskMetrics};
use frameflow_proto::{ImageFrame, ResultEntry, StreamEntry};
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Outcome of a fully processed batch
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BatchReport {
    /// Entries published and acknowledged
    pub processed: usize,

    /// Malformed entries acknowledged without output
    pub rejected: usize,
}

/// Turns stream entries into prediction entries
pub struct MessageProcessor {
    store: Arc<dyn StreamStore>,
    detector: Arc<dyn Detector>,
    streams: StreamsConfig,
    metrics: TaskMetrics,
}

impl MessageProcessor {
    pub fn new(
        store: Arc<dyn StreamStore>,
        detector: Arc<dyn Detector>,
        streams: StreamsConfig,
        metrics: TaskMetrics,
    ) -> Self {
        Self {
            store,
            detector,
            streams,
            metrics,
        }
    }

    pub fn metrics(&self) -> &TaskMetrics {
        &self.metrics
    }

    /// Process a batch in order, stopping at the first failing entry
    pub async fn process(&self, batch: Vec<StreamEntry>) -> Result<BatchReport> {
        let mut report = BatchReport::default();
        let total = batch.len();

        for (position, entry) in batch.iter().enumerate() {
            match self.process_entry(entry).await {
                Ok(true) => report.processed += 1,
                Ok(false) => report.rejected += 1,
                Err(e) => {
                    self.metrics.frames_failed.inc();
                    error!(
                        entry_id = %entry.id,
                        error = %e,
                        left_pending = total - position,
                        "Processing failed, entries stay pending for reclaim"
                    );
                    return Err(e);
                }
            }
            tokio::task::yield_now().await;
        }

        debug!(
            processed = report.processed,
            rejected = report.rejected,
            "Batch complete"
        );
        Ok(report)
    }

    /// `Ok(true)` when published and acknowledged, `Ok(false)` when rejected as malformed
    async fn process_entry(&self, entry: &StreamEntry) -> Result<bool> {
        let frame = match ImageFrame::try_from(entry) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(entry_id = %entry.id, error = %e, "Rejecting malformed entry");
                self.acknowledge(entry).await?;
                self.metrics.frames_rejected.inc();
                return Ok(false);
            }
        };

        let timer = self.metrics.duration.start_timer();

        let detections = self.detector.detect(frame.image).await?;
        let result = ResultEntry::new(&frame, detections);
        self.store
            .append(
                &self.streams.output_stream,
                &result.into_fields(),
                self.streams.output_max_len,
            )
            .await?;
        self.acknowledge(entry).await?;

        timer.observe_duration();
        self.metrics.frames_processed.inc();
        Ok(true)
    }

    async fn acknowledge(&self, entry: &StreamEntry) -> Result<()> {
        let removed = self
            .store
            .ack(&self.streams.input_stream, &self.streams.consumer_group, &entry.id)
            .await?;
        if !removed {
            // Another consumer reclaimed it and acknowledged first
            debug!(entry_id = %entry.id, "Entry was no longer pending");
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::store::MemoryStreamStore;
    use async_trait::async_trait;
    use frameflow_common::FrameflowError;
    use frameflow_proto::Detection;
    use parking_lot::Mutex;
    use std::time::Duration;

    /// Detector returning scripted results keyed by image bytes
    #[derive(Default)]
    pub(crate) struct ScriptedDetector {
        pub seen: Mutex<Vec<Vec<u8>>>,
    }

    #[async_trait]
    impl Detector for ScriptedDetector {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn detect(&self, image: &[u8]) -> Result<Vec<Detection>> {
            self.seen.lock().push(image.to_vec());
            match image {
                b"cat" => Ok(vec![Detection::new("cat", 0.91, [10, 20, 30, 40])]),
                b"boom" => Err(FrameflowError::inference("model crashed")),
                _ => Ok(Vec::new()),
            }
        }
    }

    pub(crate) fn frame(participant: &str, timestamp: &str, img: &[u8]) -> Vec<(String, Vec<u8>)> {
        vec![
            ("participantId".to_string(), participant.as_bytes().to_vec()),
            ("timestamp".to_string(), timestamp.as_bytes().to_vec()),
            ("img".to_string(), img.to_vec()),
        ]
    }

    struct Fixture {
        store: Arc<MemoryStreamStore>,
        detector: Arc<ScriptedDetector>,
        processor: MessageProcessor,
        streams: StreamsConfig,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(MemoryStreamStore::new());
        let detector = Arc::new(ScriptedDetector::default());
        let streams = StreamsConfig::default();
        store
            .ensure_group(&streams.input_stream, &streams.consumer_group)
            .await
            .unwrap();
        let processor = MessageProcessor::new(
            store.clone(),
            detector.clone(),
            streams.clone(),
            TaskMetrics::detached("inf_detection").unwrap(),
        );
        Fixture {
            store,
            detector,
            processor,
            streams,
        }
    }

    impl Fixture {
        async fn deliver(&self, frames: &[Vec<(String, Vec<u8>)>]) -> Vec<StreamEntry> {
            for fields in frames {
                self.store
                    .append(&self.streams.input_stream, fields, 1000)
                    .await
                    .unwrap();
            }
            self.store
                .read_group(
                    &self.streams.input_stream,
                    &self.streams.consumer_group,
                    "svc:inf:test",
                    frames.len(),
                    Duration::ZERO,
                )
                .await
                .unwrap()
        }

        fn pending(&self) -> usize {
            self.store
                .pending(&self.streams.input_stream, &self.streams.consumer_group)
                .len()
        }

        fn outputs(&self) -> Vec<StreamEntry> {
            self.store.entries(&self.streams.output_stream)
        }
    }

    #[tokio::test]
    async fn test_single_detection_published_and_acked() {
        let fx = fixture().await;
        let batch = fx.deliver(&[frame("p1", "1000", b"cat")]).await;

        let report = fx.processor.process(batch).await.unwrap();
        assert_eq!(report, BatchReport { processed: 1, rejected: 0 });

        let outputs = fx.outputs();
        assert_eq!(outputs.len(), 1);
        let out = &outputs[0];
        assert_eq!(out.field("participantId"), Some(&b"p1"[..]));
        assert_eq!(out.field("timestamp"), Some(&b"1000"[..]));
        assert_eq!(out.field("predictionCount"), Some(&b"1"[..]));
        assert_eq!(out.field("p0"), Some(&b"cat|0.91|10;20;30;40"[..]));
        assert_eq!(out.fields.len(), 4);
        assert_eq!(fx.pending(), 0);
    }

    #[tokio::test]
    async fn test_empty_detections_still_acked() {
        let fx = fixture().await;
        let batch = fx.deliver(&[frame("p1", "1000", b"empty-room")]).await;

        fx.processor.process(batch).await.unwrap();

        let outputs = fx.outputs();
        assert_eq!(outputs[0].field("predictionCount"), Some(&b"0"[..]));
        assert!(outputs[0].field("p0").is_none());
        assert_eq!(fx.pending(), 0);
    }

    #[tokio::test]
    async fn test_batch_processed_in_delivery_order() {
        let fx = fixture().await;
        let batch = fx
            .deliver(&[
                frame("p1", "1", b"a"),
                frame("p1", "2", b"b"),
                frame("p1", "3", b"c"),
            ])
            .await;

        fx.processor.process(batch).await.unwrap();

        let timestamps: Vec<Vec<u8>> = fx
            .outputs()
            .iter()
            .map(|e| e.field("timestamp").unwrap().to_vec())
            .collect();
        assert_eq!(timestamps, vec![b"1".to_vec(), b"2".to_vec(), b"3".to_vec()]);
        assert_eq!(
            *fx.detector.seen.lock(),
            vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]
        );
    }

    #[tokio::test]
    async fn test_failure_leaves_rest_of_batch_pending() {
        let fx = fixture().await;
        let batch = fx
            .deliver(&[
                frame("p1", "1", b"a"),
                frame("p1", "2", b"boom"),
                frame("p1", "3", b"c"),
            ])
            .await;
        let failed_id = batch[1].id.clone();
        let last_id = batch[2].id.clone();

        let err = fx.processor.process(batch).await.unwrap_err();
        assert!(matches!(err, FrameflowError::Inference(_)));

        assert_eq!(fx.outputs().len(), 1);
        let pending: Vec<String> = fx
            .store
            .pending(&fx.streams.input_stream, &fx.streams.consumer_group)
            .into_iter()
            .map(|p| p.id)
            .collect();
        assert_eq!(pending, vec![failed_id, last_id]);

        let metrics = fx.processor.metrics();
        assert_eq!(metrics.frames_processed.get(), 1);
        assert_eq!(metrics.frames_failed.get(), 1);
    }

    #[tokio::test]
    async fn test_malformed_entry_is_rejected_and_acked() {
        let fx = fixture().await;
        let batch = fx
            .deliver(&[
                vec![("participantId".to_string(), b"p1".to_vec())],
                frame("p1", "2", b"cat"),
            ])
            .await;

        let report = fx.processor.process(batch).await.unwrap();
        assert_eq!(report, BatchReport { processed: 1, rejected: 1 });
        assert_eq!(fx.outputs().len(), 1);
        assert_eq!(fx.pending(), 0);
        assert_eq!(fx.processor.metrics().frames_rejected.get(), 1);
    }

    #[tokio::test]
    async fn test_processed_counter_counts_each_entry() {
        let fx = fixture().await;
        let counter = fx.processor.metrics().frames_processed.clone();

        let mut last = counter.get();
        for i in 0..3 {
            let batch = fx.deliver(&[frame("p1", &i.to_string(), b"cat")]).await;
            fx.processor.process(batch).await.unwrap();
            let now = counter.get();
            assert_eq!(now, last + 1);
            last = now;
        }
        assert_eq!(fx.processor.metrics().duration.get_sample_count(), 3);
    }

    #[tokio::test]
    async fn test_output_stream_is_capped() {
        let fx = fixture().await;
        let mut processor_streams = fx.streams.clone();
        processor_streams.output_max_len = 2;
        let processor = MessageProcessor::new(
            fx.store.clone(),
            fx.detector.clone(),
            processor_streams,
            TaskMetrics::detached("inf_detection").unwrap(),
        );

        for i in 0..4 {
            let batch = fx.deliver(&[frame("p1", &i.to_string(), b"x")]).await;
            processor.process(batch).await.unwrap();
        }
        assert_eq!(fx.outputs().len(), 2);
    }
}
