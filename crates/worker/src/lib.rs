//! Frameflow Worker
//!
//! Inference worker for the frameflow pipeline. Workers share a Redis Streams consumer
//! group on the image stream, recover entries abandoned by crashed peers, run object
//! detection on each frame and publish predictions to a bounded output stream.

pub mod consumer;
pub mod detector;
pub mod dispatch;
pub mod identity;
pub mod metrics_server;
pub mod processor;
pub mod registration;
pub mod store;
pub mod supervisor;
pub mod task;

pub use consumer::StreamConsumer;
pub use detector::{CommandDetector, Detector, NoopDetector};
pub use dispatch::Dispatcher;
pub use identity::WorkerIdentity;
pub use processor::{BatchReport, MessageProcessor};
pub use registration::{try_register, RedisRegistrar, Registrar};
pub use store::{MemoryStreamStore, RedisStreamStore, StreamStore};
pub use supervisor::{Supervisor, TaskClass};
pub use task::{build_tasks, DetectionTask, PipelineTask, TaskContext};
