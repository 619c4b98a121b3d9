//! Frameflow Worker - Main Entry Point
//!
//! Loads configuration, connects to Redis, registers with the orchestrator and runs the
//! configured pipeline tasks until Ctrl-C or a critical failure.

use anyhow::Context;
use frameflow_common::{MetricsRegistry, WorkerConfig};
use frameflow_worker::store::StreamStore;
use frameflow_worker::{
    build_tasks, detector, metrics_server, try_register, RedisRegistrar, RedisStreamStore,
    Supervisor, TaskClass, TaskContext, WorkerIdentity,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// How long tasks get to finish in-flight work after Ctrl-C
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let config = WorkerConfig::load().context("Failed to load worker configuration")?;

    // Initialize logging
    let level = &config.observability.log_level;
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("frameflow_worker={},frameflow_common={}", level, level).into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Frameflow Worker");

    let identity = WorkerIdentity::from_config(&config.service)?;
    info!(
        "Worker identity: {} (orchestrator {})",
        identity.self_descriptor, identity.orchestrator
    );

    let metrics = MetricsRegistry::new().context("Failed to create metrics registry")?;

    let store = RedisStreamStore::connect(&config.redis)
        .await
        .with_context(|| {
            format!(
                "Failed to connect to Redis at {}:{}",
                config.redis.host, config.redis.port
            )
        })?;
    let registrar = RedisRegistrar::new(store.client().clone(), config.registration.reply_timeout());
    let store: Arc<dyn StreamStore> = Arc::new(store);

    let detector = detector::from_config(&config.detector).context("Failed to create detector")?;
    info!(detector = detector.name(), "Detector ready");

    let mut supervisor = Supervisor::new(SHUTDOWN_GRACE);

    // Registration runs alongside consumption; failing it stops the worker
    let registration_identity = identity.clone();
    let registration_config = config.registration.clone();
    supervisor.spawn("registration", TaskClass::Critical, async move {
        try_register(&registrar, &registration_identity, &registration_config).await
    });

    if config.observability.enable_metrics {
        let listener = metrics_server::bind(
            &config.observability.metrics_bind_address,
            config.observability.metrics_port,
        )
        .await
        .context("Failed to bind metrics endpoint")?;
        let shutdown = supervisor.shutdown_signal();
        supervisor.spawn(
            "metrics",
            TaskClass::Ordinary,
            metrics_server::serve(listener, metrics.clone(), shutdown),
        );
    }

    let ctx = TaskContext {
        config: config.clone(),
        identity,
        store,
        detector,
        metrics,
    };
    for task in build_tasks(&ctx, &config.tasks).context("Failed to build pipeline tasks")? {
        info!("Starting pipeline task: {} ({})", task.name(), task.id());
        let shutdown = supervisor.shutdown_signal();
        supervisor.spawn(task.id(), TaskClass::Ordinary, async move {
            task.run(shutdown).await
        });
    }

    let stop = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Cannot listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    match supervisor.run(stop).await {
        Ok(()) => {
            info!("Frameflow Worker shutdown complete");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Frameflow Worker halted");
            Err(e).context("Critical task failed")
        }
    }
}
