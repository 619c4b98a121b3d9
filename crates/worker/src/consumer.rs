//! Consumer-group engine
//!
//! Drives one worker's share of the input stream:
//! 1. ensure the consumer group exists
//! 2. sweep the pending list for entries abandoned by dead peers (claim recovery)
//! 3. block on new entries forever, dispatching each batch to the bounded processor pool
//!
//! While consuming, the recovery sweep is repeated on a fixed interval so entries whose
//! processing failed on a live worker are picked up again once they go idle.

use crate::dispatch::Dispatcher;
use crate::store::{StreamStore, CLAIM_START};
use frameflow_common::config::{ConsumerConfig, StreamsConfig};
use frameflow_common::{FrameflowError, Result, TaskMetrics};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// How long shutdown waits for in-flight batches
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Consumes the input stream under one consumer name
pub struct StreamConsumer {
    store: Arc<dyn StreamStore>,
    dispatcher: Dispatcher,
    streams: StreamsConfig,
    settings: ConsumerConfig,
    consumer_name: String,
    metrics: TaskMetrics,
}

impl StreamConsumer {
    pub fn new(
        store: Arc<dyn StreamStore>,
        dispatcher: Dispatcher,
        streams: StreamsConfig,
        settings: ConsumerConfig,
        consumer_name: impl Into<String>,
        metrics: TaskMetrics,
    ) -> Self {
        Self {
            store,
            dispatcher,
            streams,
            settings,
            consumer_name: consumer_name.into(),
            metrics,
        }
    }

    pub fn consumer_name(&self) -> &str {
        &self.consumer_name
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Create the consumer group if needed; an existing group is fine
    pub async fn ensure_group(&self) -> Result<()> {
        let created = self
            .store
            .ensure_group(&self.streams.input_stream, &self.streams.consumer_group)
            .await?;
        if created {
            info!(
                stream = %self.streams.input_stream,
                group = %self.streams.consumer_group,
                "Created consumer group"
            );
        } else {
            debug!(group = %self.streams.consumer_group, "Consumer group already exists");
        }
        Ok(())
    }

    /// Claim every pending entry idle past the threshold, dispatching each batch.
    ///
    /// Returns the number of entries claimed. Connection errors are retried after a
    /// backoff; any other store error ends the sweep.
    pub async fn recover_pending(&self) -> Result<usize> {
        let mut cursor = CLAIM_START.to_string();
        let mut claimed = 0;

        loop {
            let batch = match self
                .store
                .claim_idle(
                    &self.streams.input_stream,
                    &self.streams.consumer_group,
                    &self.consumer_name,
                    self.settings.claim_min_idle(),
                    &cursor,
                    self.settings.claim_batch_size,
                )
                .await
            {
                Ok(batch) => batch,
                Err(e) if e.is_transient() => {
                    self.connection_error("claim", &e).await;
                    continue;
                }
                Err(e) => return Err(e),
            };

            if batch.entries.is_empty() {
                break;
            }

            cursor = batch.next_cursor;

            // Our own batches may still hold entries that sat idle behind a slow frame
            let total = batch.entries.len();
            let entries = self.dispatcher.not_running(batch.entries);
            if entries.len() < total {
                debug!(
                    skipped = total - entries.len(),
                    "Claimed entries already being processed here"
                );
            }
            if entries.is_empty() {
                continue;
            }

            let count = entries.len();
            claimed += count;
            self.metrics.entries_claimed.inc_by(count as u64);
            info!(
                count,
                consumer = %self.consumer_name,
                "Claimed idle pending entries"
            );

            self.dispatcher.dispatch(entries).await?;
        }

        Ok(claimed)
    }

    /// Block for new entries and dispatch them until `shutdown` flips to `true`.
    ///
    /// Only a non-connection store error ends the loop early.
    pub async fn consume(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut reclaim = self.settings.reclaim_interval().map(|period| {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });

        info!(
            stream = %self.streams.input_stream,
            consumer = %self.consumer_name,
            "Consuming new entries"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            if let Some(interval) = reclaim.as_mut() {
                if tick_due(interval).await {
                    let recovered = self.recover_pending().await?;
                    if recovered > 0 {
                        info!(recovered, "Reclaim sweep recovered stalled entries");
                    }
                }
            }

            let read = tokio::select! {
                read = self.store.read_group(
                    &self.streams.input_stream,
                    &self.streams.consumer_group,
                    &self.consumer_name,
                    self.settings.read_batch_size,
                    self.settings.read_block(),
                ) => read,
                changed = shutdown.changed() => {
                    // A dropped sender can never signal again; treat it as a stop
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
            };

            match read {
                Ok(batch) if batch.is_empty() => {}
                Ok(batch) => {
                    self.metrics.entries_read.inc_by(batch.len() as u64);
                    self.dispatcher.dispatch(batch).await?;
                }
                Err(e) if e.is_transient() => {
                    self.connection_error("read", &e).await;
                    continue;
                }
                Err(e) => {
                    error!(error = %e, "Stream read failed");
                    return Err(e);
                }
            }

            tokio::time::sleep(self.settings.idle_yield()).await;
        }

        info!("Consumption stopped, draining in-flight batches");
        self.dispatcher.drain(DRAIN_TIMEOUT).await;
        Ok(())
    }

    /// Full lifecycle: group, recovery sweep, then consumption
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<()> {
        loop {
            match self.ensure_group().await {
                Ok(()) => break,
                Err(e) if e.is_transient() => self.connection_error("group create", &e).await,
                Err(e) => return Err(e),
            }
        }

        let recovered = self.recover_pending().await?;
        info!(recovered, "Claim recovery finished");

        self.consume(shutdown).await
    }

    async fn connection_error(&self, operation: &str, e: &FrameflowError) {
        self.metrics.connection_errors.inc();
        warn!(operation, error = %e, "Stream store connection error, backing off");
        tokio::time::sleep(self.settings.connection_backoff()).await;
    }
}

/// Whether the interval has a tick due, without waiting for one
async fn tick_due(interval: &mut tokio::time::Interval) -> bool {
    tokio::select! {
        biased;
        _ = interval.tick() => true,
        _ = std::future::ready(()) => false,
    }
}
