//! Orchestrator registration
//!
//! A worker announces itself once at startup. Redis carries the exchange:
//! `RPUSH <orchestrator>:registrations {"service", "reply_to"}` followed by
//! `BLPOP <reply_to>`, where the orchestrator answers `succeeded` on acceptance.

use async_trait::async_trait;
use frameflow_common::config::RegistrationConfig;
use frameflow_common::{FrameflowError, Result};
use frameflow_proto::ServiceDescriptor;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::identity::WorkerIdentity;

/// Reply sent by the orchestrator when it accepts a registration
pub const REGISTRATION_SUCCEEDED: &str = "succeeded";

/// One registration attempt against an orchestrator
#[async_trait]
pub trait Registrar: Send + Sync {
    async fn register(
        &self,
        orchestrator: &ServiceDescriptor,
        service: &ServiceDescriptor,
    ) -> Result<()>;
}

/// Registration request pushed onto the orchestrator's queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationRequest {
    pub service: String,
    pub reply_to: String,
}

impl RegistrationRequest {
    pub fn new(service: &ServiceDescriptor) -> Self {
        Self {
            service: service.encode(),
            reply_to: format!("{}:reply:{}", service.encode(), Uuid::new_v4()),
        }
    }
}

/// Key of the queue an orchestrator reads registrations from
pub fn registration_queue(orchestrator: &ServiceDescriptor) -> String {
    format!("{}:registrations", orchestrator.encode())
}

/// Registrar speaking the Redis list protocol
pub struct RedisRegistrar {
    client: redis::Client,
    reply_timeout: Duration,
}

impl RedisRegistrar {
    pub fn new(client: redis::Client, reply_timeout: Duration) -> Self {
        Self {
            client,
            reply_timeout,
        }
    }
}

#[async_trait]
impl Registrar for RedisRegistrar {
    async fn register(
        &self,
        orchestrator: &ServiceDescriptor,
        service: &ServiceDescriptor,
    ) -> Result<()> {
        // BLPOP blocks its connection, so each attempt gets its own
        let mut conn = self.client.get_multiplexed_async_connection().await?;

        let request = RegistrationRequest::new(service);
        let payload = serde_json::to_string(&request)?;
        let queue = registration_queue(orchestrator);
        let _: i64 = conn.rpush(&queue, payload).await?;
        debug!(queue = %queue, reply_to = %request.reply_to, "Registration request sent");

        let reply: Option<(String, String)> = redis::cmd("BLPOP")
            .arg(&request.reply_to)
            .arg(self.reply_timeout.as_secs_f64())
            .query_async(&mut conn)
            .await?;

        match reply {
            Some((_, status)) if status == REGISTRATION_SUCCEEDED => Ok(()),
            Some((_, status)) => Err(FrameflowError::registration(format!(
                "orchestrator rejected registration: {}",
                status
            ))),
            None => Err(FrameflowError::timeout(format!(
                "no registration reply within {:?}",
                self.reply_timeout
            ))),
        }
    }
}

/// Register with bounded retries.
///
/// Exhausting every attempt is a fatal error for the process.
pub async fn try_register(
    registrar: &dyn Registrar,
    identity: &WorkerIdentity,
    config: &RegistrationConfig,
) -> Result<()> {
    let attempts = config.max_attempts.max(1);
    let mut last_error = None;

    for attempt in 1..=attempts {
        match registrar
            .register(&identity.orchestrator, &identity.self_descriptor)
            .await
        {
            Ok(()) => {
                info!("Registered to orchestrator as {}", identity.self_descriptor);
                return Ok(());
            }
            Err(e) => {
                warn!(
                    attempt,
                    max_attempts = attempts,
                    orchestrator = %identity.orchestrator,
                    error = %e,
                    "Registration attempt failed"
                );
                last_error = Some(e);
            }
        }

        if attempt < attempts {
            tokio::time::sleep(config.retry_interval()).await;
        }
    }

    let reason = last_error
        .map(|e| e.to_string())
        .unwrap_or_else(|| "no attempt made".to_string());
    error!(
        orchestrator = %identity.orchestrator,
        attempts,
        "Could not register to orchestrator"
    );
    Err(FrameflowError::registration(format!(
        "could not register to {} after {} attempts: {}",
        identity.orchestrator, attempts, reason
    )))
}
