//! Stream store boundary
//!
//! The consumption engine talks to the durable log only through [`StreamStore`]. The
//! consumer group's pending-entries list is the one piece of shared mutable state in
//! the pipeline, and it is changed exclusively by the store's atomic claim, read and
//! acknowledge operations, so callers never lock around it.

pub mod memory;
pub mod redis_streams;

use async_trait::async_trait;
use frameflow_common::Result;
use frameflow_proto::StreamEntry;
use std::time::Duration;

pub use self::memory::MemoryStreamStore;
pub use self::redis_streams::RedisStreamStore;

/// Cursor that starts a claim sweep at the lowest pending id
pub const CLAIM_START: &str = "0-0";

/// Result of one claim call
#[derive(Debug, Clone, Default)]
pub struct ClaimBatch {
    /// Where a continued sweep would resume (`0-0` once the list is exhausted)
    pub next_cursor: String,

    /// Entries now owned by the claiming consumer
    pub entries: Vec<StreamEntry>,
}

/// Consumer-group operations against a durable stream store
#[async_trait]
pub trait StreamStore: Send + Sync {
    /// Create `group` on `stream` at the latest cursor, creating the stream if absent.
    ///
    /// Returns `false` when the group already existed; that case is not an error.
    async fn ensure_group(&self, stream: &str, group: &str) -> Result<bool>;

    /// Transfer up to `count` pending entries idle for at least `min_idle` to `consumer`,
    /// scanning from `start`
    async fn claim_idle(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        start: &str,
        count: usize,
    ) -> Result<ClaimBatch>;

    /// Read up to `count` never-delivered entries as `consumer`, waiting at most `block`.
    ///
    /// An empty vector means the wait elapsed with nothing new.
    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>>;

    /// Append an entry, trimming the stream to roughly `max_len` entries
    async fn append(
        &self,
        stream: &str,
        fields: &[(String, Vec<u8>)],
        max_len: usize,
    ) -> Result<String>;

    /// Remove `id` from the group's pending list; `false` if it was not pending
    async fn ack(&self, stream: &str, group: &str, id: &str) -> Result<bool>;
}
