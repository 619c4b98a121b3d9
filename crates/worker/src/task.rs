//! Pipeline tasks
//!
//! A worker runs one or more pipeline tasks, picked by id from a static registry. Each
//! task gets its own metric labels and consumer; they share the store, detector and
//! identity held in the [`TaskContext`].

use crate::consumer::StreamConsumer;
use crate::detector::Detector;
use crate::dispatch::Dispatcher;
use crate::identity::WorkerIdentity;
use crate::processor::MessageProcessor;
use crate::store::StreamStore;
use async_trait::async_trait;
use frameflow_common::{FrameflowError, MetricsRegistry, Result, WorkerConfig};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::watch;

/// Long-running unit of work started by the worker
#[async_trait]
pub trait PipelineTask: Send + Sync {
    /// Stable id, used in configuration and as the metrics label
    fn id(&self) -> &'static str;

    /// Human-readable name for logs
    fn name(&self) -> &'static str;

    /// Run until `shutdown` flips to `true` or an unrecoverable error occurs
    async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<()>;
}

/// Shared resources handed to task factories
#[derive(Clone)]
pub struct TaskContext {
    pub config: WorkerConfig,
    pub identity: WorkerIdentity,
    pub store: Arc<dyn StreamStore>,
    pub detector: Arc<dyn Detector>,
    pub metrics: MetricsRegistry,
}

type TaskFactory = fn(&TaskContext) -> Result<Box<dyn PipelineTask>>;

/// Every task this worker knows how to run
const REGISTRY: &[(&str, TaskFactory)] =
    &[(DetectionTask::ID, DetectionTask::build as TaskFactory)];

/// Ids of all registered tasks
pub fn available_tasks() -> Vec<&'static str> {
    REGISTRY.iter().map(|(id, _)| *id).collect()
}

/// Instantiate the tasks named in `ids`, or every registered task when `ids` is empty
pub fn build_tasks(ctx: &TaskContext, ids: &[String]) -> Result<Vec<Box<dyn PipelineTask>>> {
    if ids.is_empty() {
        return REGISTRY.iter().map(|(_, factory)| factory(ctx)).collect();
    }

    let mut seen = HashSet::new();
    let mut tasks = Vec::with_capacity(ids.len());
    for id in ids {
        if !seen.insert(id.as_str()) {
            return Err(FrameflowError::config(format!("Task listed twice: {}", id)));
        }
        let factory = REGISTRY
            .iter()
            .find(|(known, _)| *known == id.as_str())
            .map(|(_, factory)| factory)
            .ok_or_else(|| {
                FrameflowError::config(format!(
                    "Unknown task '{}', available: {}",
                    id,
                    available_tasks().join(", ")
                ))
            })?;
        tasks.push(factory(ctx)?);
    }
    Ok(tasks)
}

/// Object detection over the image stream
pub struct DetectionTask {
    consumer: StreamConsumer,
}

impl DetectionTask {
    pub const ID: &'static str = "inf_detection";
    pub const NAME: &'static str = "Object Detection Inference Task";

    fn build(ctx: &TaskContext) -> Result<Box<dyn PipelineTask>> {
        let metrics = ctx.metrics.for_task(Self::ID);
        let processor = Arc::new(MessageProcessor::new(
            ctx.store.clone(),
            ctx.detector.clone(),
            ctx.config.streams.clone(),
            metrics.clone(),
        ));
        let dispatcher = Dispatcher::new(processor, ctx.config.consumer.max_in_flight_batches);
        let consumer = StreamConsumer::new(
            ctx.store.clone(),
            dispatcher,
            ctx.config.streams.clone(),
            ctx.config.consumer.clone(),
            ctx.identity.consumer_name(),
            metrics,
        );
        Ok(Box::new(Self { consumer }))
    }
}

#[async_trait]
impl PipelineTask for DetectionTask {
    fn id(&self) -> &'static str {
        Self::ID
    }

    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<()> {
        self.consumer.run(shutdown).await
    }
}
