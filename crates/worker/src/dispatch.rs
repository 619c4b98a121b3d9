//! Bounded batch dispatch
//!
//! Batches handed over by the claim sweep or the read loop are processed on their own
//! tokio tasks so the loop can go straight back to the store. A semaphore caps how many
//! of those tasks exist at once; when every permit is taken, [`Dispatcher::dispatch`]
//! waits, which stops the loop from reading further entries (backpressure).
//!
//! The dispatcher also remembers which entry ids belong to a running batch, so a reclaim
//! sweep never hands this worker's own unfinished entries to a second processor.

use crate::processor::MessageProcessor;
use frameflow_common::{FrameflowError, Result};
use frameflow_proto::StreamEntry;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, trace, warn};

/// Spawns processor runs under a concurrency limit
#[derive(Clone)]
pub struct Dispatcher {
    processor: Arc<MessageProcessor>,
    permits: Arc<Semaphore>,
    max_in_flight: usize,
    entry_ids: Arc<Mutex<HashSet<String>>>,
}

/// Bookkeeping for one running batch, released when its task ends (even by panic)
struct RunningBatch {
    ids: Vec<String>,
    entry_ids: Arc<Mutex<HashSet<String>>>,
    processor: Arc<MessageProcessor>,
    _permit: OwnedSemaphorePermit,
}

impl Drop for RunningBatch {
    fn drop(&mut self) {
        let mut tracked = self.entry_ids.lock();
        for id in &self.ids {
            tracked.remove(id);
        }
        self.processor.metrics().batches_in_flight.dec();
    }
}

impl Dispatcher {
    pub fn new(processor: Arc<MessageProcessor>, max_in_flight: usize) -> Self {
        let max_in_flight = max_in_flight.max(1);
        Self {
            processor,
            permits: Arc::new(Semaphore::new(max_in_flight)),
            max_in_flight,
            entry_ids: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Batches currently being processed
    pub fn in_flight(&self) -> usize {
        self.max_in_flight - self.permits.available_permits()
    }

    /// Whether `id` belongs to a batch that has not finished yet
    pub fn is_running(&self, id: &str) -> bool {
        self.entry_ids.lock().contains(id)
    }

    /// Drop entries that a running batch of this dispatcher already owns
    pub fn not_running(&self, entries: Vec<StreamEntry>) -> Vec<StreamEntry> {
        let tracked = self.entry_ids.lock();
        entries
            .into_iter()
            .filter(|entry| !tracked.contains(&entry.id))
            .collect()
    }

    /// Hand a batch to a new processing task, waiting for a free slot first.
    ///
    /// Returns once the task is spawned, not when it finishes.
    pub async fn dispatch(&self, batch: Vec<StreamEntry>) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }

        let permit = match self.permits.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                trace!(
                    max_in_flight = self.max_in_flight,
                    "All processing slots busy, waiting"
                );
                self.permits
                    .clone()
                    .acquire_owned()
                    .await
                    .map_err(|_| FrameflowError::internal("dispatcher closed"))?
            }
        };

        let ids: Vec<String> = batch.iter().map(|entry| entry.id.clone()).collect();
        self.entry_ids.lock().extend(ids.iter().cloned());
        let processor = self.processor.clone();
        processor.metrics().batches_in_flight.inc();
        let running = RunningBatch {
            ids,
            entry_ids: self.entry_ids.clone(),
            processor: processor.clone(),
            _permit: permit,
        };
        let size = batch.len();

        tokio::spawn(async move {
            let _running = running;
            // Failures are logged and counted by the processor; the entries stay pending
            if let Ok(report) = processor.process(batch).await {
                debug!(
                    size,
                    processed = report.processed,
                    rejected = report.rejected,
                    "Dispatched batch finished"
                );
            }
        });

        Ok(())
    }

    /// Wait until no batch is in flight, or `timeout` elapses.
    ///
    /// Returns `true` when everything finished.
    pub async fn drain(&self, timeout: Duration) -> bool {
        let all = self.max_in_flight as u32;
        match tokio::time::timeout(timeout, self.permits.acquire_many(all)).await {
            Ok(Ok(_permits)) => true,
            Ok(Err(_)) => false,
            Err(_) => {
                warn!(
                    in_flight = self.in_flight(),
                    "Batches still in flight after drain timeout"
                );
                false
            }
        }
    }
}
