//! Worker identity
//!
//! Built once at startup and shared by the consumer (as its consumer name) and the
//! registration client (as the announced descriptor).

use frameflow_common::config::ServiceConfig;
use frameflow_common::{FrameflowError, Result};
use frameflow_proto::ServiceDescriptor;

/// Who this worker is and whom it reports to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerIdentity {
    pub self_descriptor: ServiceDescriptor,
    pub orchestrator: ServiceDescriptor,
}

impl WorkerIdentity {
    pub fn new(self_descriptor: ServiceDescriptor, orchestrator: ServiceDescriptor) -> Self {
        Self {
            self_descriptor,
            orchestrator,
        }
    }

    /// Build from validated service configuration
    pub fn from_config(config: &ServiceConfig) -> Result<Self> {
        let service_id = config
            .service_id
            .as_deref()
            .filter(|id| !id.is_empty())
            .ok_or_else(|| FrameflowError::config("service_id is not set"))?;

        let orchestrator: ServiceDescriptor = config.orchestrator.parse().map_err(|_| {
            FrameflowError::config(format!(
                "Invalid orchestrator descriptor: {}",
                config.orchestrator
            ))
        })?;

        Ok(Self::new(
            ServiceDescriptor::new(&config.service_type, service_id),
            orchestrator,
        ))
    }

    /// Name used for claims and group reads
    pub fn consumer_name(&self) -> String {
        self.self_descriptor.encode()
    }
}
