//! Configuration structures for Frameflow
//!
//! The worker reads an optional YAML file and then applies environment overrides for
//! the values a deployment usually injects (store address, credentials, host name).
//! Every field has a default, so an empty file or no file at all is a valid config.

use crate::error::{FrameflowError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable naming the config file
pub const CONFIG_PATH_ENV: &str = "FRAMEFLOW_CONFIG";

/// Config file used when `FRAMEFLOW_CONFIG` is unset
pub const DEFAULT_CONFIG_PATH: &str = "configs/worker-config.yaml";

/// Top-level configuration for a Frameflow worker
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// How this worker and its orchestrator are named
    pub service: ServiceConfig,

    /// Stream store connection
    pub redis: RedisConfig,

    /// Stream and group names
    pub streams: StreamsConfig,

    /// Consumption engine tuning
    pub consumer: ConsumerConfig,

    /// Orchestrator registration
    pub registration: RegistrationConfig,

    /// Inference function selection
    pub detector: DetectorConfig,

    /// Observability configuration
    pub observability: ObservabilityConfig,

    /// Ids of the pipeline tasks to start
    pub tasks: Vec<String>,
}

/// Service identity configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Service type of this worker (`inf`)
    pub service_type: String,

    /// Instance id; taken from `HOSTNAME` when unset
    pub service_id: Option<String>,

    /// Encoded descriptor of the orchestrator to register with
    pub orchestrator: String,
}

/// Redis connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
}

/// Stream names used by the inference pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamsConfig {
    /// Stream of incoming image entries
    pub input_stream: String,

    /// Consumer group shared by all inference workers
    pub consumer_group: String,

    /// Stream receiving prediction entries
    pub output_stream: String,

    /// Approximate cap on the output stream length
    pub output_max_len: usize,
}

/// Consumption engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    /// Pending entries idle at least this long may be claimed
    pub claim_min_idle_ms: u64,

    /// Maximum entries per claim call
    pub claim_batch_size: usize,

    /// Maximum entries per group read
    pub read_batch_size: usize,

    /// Blocking read timeout
    pub read_block_ms: u64,

    /// Pause between loop iterations
    pub idle_yield_ms: u64,

    /// Pause after a connection error
    pub connection_backoff_ms: u64,

    /// Interval of steady-state reclaim sweeps (0 disables)
    pub reclaim_interval_ms: u64,

    /// Upper bound on concurrently processed batches
    pub max_in_flight_batches: usize,
}

/// Registration configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrationConfig {
    /// Attempts before registration is declared failed
    pub max_attempts: u32,

    /// Pause between attempts
    pub retry_interval_ms: u64,

    /// How long one attempt waits for the orchestrator's reply
    pub reply_timeout_ms: u64,
}

/// Inference function configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// `command` or `none`
    pub kind: String,

    /// Program run once per image for the `command` detector
    pub command: Option<PathBuf>,

    /// Extra arguments for the program
    pub args: Vec<String>,

    /// Per-image time limit
    pub timeout_ms: u64,
}

/// Observability configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log filter directive (trace, debug, info, warn, error)
    pub log_level: String,

    /// Enable Prometheus metrics endpoint
    pub enable_metrics: bool,

    /// Metrics bind address
    pub metrics_bind_address: String,

    /// Metrics port
    pub metrics_port: u16,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            service_type: "inf".to_string(),
            service_id: None,
            orchestrator: "svc:sgn:".to_string(),
        }
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 6379,
            password: None,
        }
    }
}

impl Default for StreamsConfig {
    fn default() -> Self {
        Self {
            input_stream: "images".to_string(),
            consumer_group: "cg:images".to_string(),
            output_stream: "predictions".to_string(),
            output_max_len: 100,
        }
    }
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            claim_min_idle_ms: 5000,
            claim_batch_size: 10,
            read_batch_size: 1,
            read_block_ms: 10_000,
            idle_yield_ms: 10,
            connection_backoff_ms: 100,
            reclaim_interval_ms: 30_000,
            max_in_flight_batches: 4,
        }
    }
}

impl Default for RegistrationConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            retry_interval_ms: 3000,
            reply_timeout_ms: 3000,
        }
    }
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            kind: "none".to_string(),
            command: None,
            args: Vec::new(),
            timeout_ms: 30_000,
        }
    }
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            enable_metrics: true,
            metrics_bind_address: "0.0.0.0".to_string(),
            metrics_port: 9091,
        }
    }
}

impl RedisConfig {
    /// Connection URL in the `redis://` scheme
    pub fn url(&self) -> String {
        match &self.password {
            Some(password) if !password.is_empty() => {
                format!("redis://:{}@{}:{}/", password, self.host, self.port)
            }
            _ => format!("redis://{}:{}/", self.host, self.port),
        }
    }
}

impl ConsumerConfig {
    pub fn claim_min_idle(&self) -> Duration {
        Duration::from_millis(self.claim_min_idle_ms)
    }

    pub fn read_block(&self) -> Duration {
        Duration::from_millis(self.read_block_ms)
    }

    pub fn idle_yield(&self) -> Duration {
        Duration::from_millis(self.idle_yield_ms)
    }

    pub fn connection_backoff(&self) -> Duration {
        Duration::from_millis(self.connection_backoff_ms)
    }

    /// `None` when periodic reclaim is disabled
    pub fn reclaim_interval(&self) -> Option<Duration> {
        (self.reclaim_interval_ms > 0).then(|| Duration::from_millis(self.reclaim_interval_ms))
    }
}

impl RegistrationConfig {
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.reply_timeout_ms)
    }
}

impl WorkerConfig {
    /// Load configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            FrameflowError::Config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;

        Self::from_yaml(&content).map_err(|e| {
            FrameflowError::Config(format!("Failed to parse config file {}: {}", path.display(), e))
        })
    }

    /// Parse configuration from YAML text
    pub fn from_yaml(content: &str) -> Result<Self> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(content)?)
    }

    /// Load the file named by `FRAMEFLOW_CONFIG` (or the default path when present),
    /// apply environment overrides and validate
    pub fn load() -> Result<Self> {
        let mut config = match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) => Self::from_file(path)?,
            Err(_) if Path::new(DEFAULT_CONFIG_PATH).exists() => {
                Self::from_file(DEFAULT_CONFIG_PATH)?
            }
            Err(_) => Self::default(),
        };

        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from a variable lookup (the process environment in production)
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("REDIS_HOST") {
            self.redis.host = host;
        }
        if let Some(port) = lookup("REDIS_PORT") {
            self.redis.port = port
                .parse()
                .map_err(|_| FrameflowError::config(format!("Invalid REDIS_PORT: {}", port)))?;
        }
        if let Some(password) = lookup("REDIS_PASSWORD") {
            self.redis.password = Some(password);
        }
        if self.service.service_id.is_none() {
            self.service.service_id = lookup("HOSTNAME");
        }
        if let Some(port) = lookup("FRAMEFLOW_METRICS_PORT") {
            self.observability.metrics_port = port.parse().map_err(|_| {
                FrameflowError::config(format!("Invalid FRAMEFLOW_METRICS_PORT: {}", port))
            })?;
        }
        if let Some(level) = lookup("FRAMEFLOW_LOG") {
            self.observability.log_level = level;
        }
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        match self.service.service_id.as_deref() {
            None | Some("") => {
                return Err(FrameflowError::config(
                    "service_id is not set and HOSTNAME is unavailable",
                ));
            }
            Some(id) if id.contains(':') => {
                return Err(FrameflowError::config(format!(
                    "service_id must not contain ':': {}",
                    id
                )));
            }
            Some(_) => {}
        }

        let streams = &self.streams;
        if streams.input_stream.is_empty()
            || streams.output_stream.is_empty()
            || streams.consumer_group.is_empty()
        {
            return Err(FrameflowError::config("Stream and group names must be non-empty"));
        }
        if streams.input_stream == streams.output_stream {
            return Err(FrameflowError::config(
                "Input and output streams must differ",
            ));
        }
        if streams.output_max_len == 0 {
            return Err(FrameflowError::config("output_max_len must be positive"));
        }

        let consumer = &self.consumer;
        if consumer.claim_batch_size == 0 || consumer.read_batch_size == 0 {
            return Err(FrameflowError::config("Batch sizes must be positive"));
        }
        if consumer.max_in_flight_batches == 0 {
            return Err(FrameflowError::config(
                "max_in_flight_batches must be positive",
            ));
        }
        // BLOCK 0 means wait forever
        if consumer.read_block_ms == 0 {
            return Err(FrameflowError::config("read_block_ms must be positive"));
        }
        // Zero would claim entries live peers are still processing
        if consumer.claim_min_idle_ms == 0 {
            return Err(FrameflowError::config("claim_min_idle_ms must be positive"));
        }

        if self.registration.max_attempts == 0 {
            return Err(FrameflowError::config(
                "registration.max_attempts must be positive",
            ));
        }

        match self.detector.kind.as_str() {
            "none" => {}
            "command" => {
                if self.detector.command.is_none() {
                    return Err(FrameflowError::config(
                        "command detector requires detector.command",
                    ));
                }
            }
            other => {
                return Err(FrameflowError::config(format!(
                    "Unknown detector kind: {}",
                    other
                )));
            }
        }

        Ok(())
    }
}
