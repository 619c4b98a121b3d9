//! In-process stream store
//!
//! Implements the consumer-group model of Redis Streams (last-delivered cursor, pending
//! entries list with owner and idle time, claim by idle threshold, approximate trim)
//! over ordinary collections. Used by the test suite and for running the pipeline
//! in-process without a Redis server. Idle time follows tokio's clock, so paused-time tests can age
//! pending entries deterministically.

use super::{ClaimBatch, StreamStore};
use async_trait::async_trait;
use frameflow_common::{FrameflowError, Result};
use frameflow_proto::{EntryId, StreamEntry};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::Notify;
use tokio::time::Instant;

/// Snapshot of one pending-list record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingInfo {
    pub id: String,
    pub consumer: String,
    pub deliveries: u32,
}

#[derive(Debug)]
struct PendingEntry {
    consumer: String,
    delivered_at: Instant,
    deliveries: u32,
}

#[derive(Debug, Default)]
struct Group {
    last_delivered: EntryId,
    pending: BTreeMap<EntryId, PendingEntry>,
}

#[derive(Debug, Default)]
struct StreamLog {
    entries: BTreeMap<EntryId, HashMap<String, Vec<u8>>>,
    last_id: EntryId,
    groups: HashMap<String, Group>,
}

impl StreamLog {
    fn next_id(&self) -> EntryId {
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        if now_ms > self.last_id.millis {
            EntryId::new(now_ms, 0)
        } else {
            self.last_id.next()
        }
    }

    fn entry(&self, id: &EntryId) -> Option<StreamEntry> {
        self.entries
            .get(id)
            .map(|fields| StreamEntry::new(id.to_string(), fields.clone()))
    }
}

/// Stream store kept entirely in memory
#[derive(Debug, Default)]
pub struct MemoryStreamStore {
    streams: Mutex<HashMap<String, StreamLog>>,
    appended: Notify,
    offline: AtomicBool,
}

fn no_group(stream: &str, group: &str) -> FrameflowError {
    FrameflowError::store(format!(
        "NOGROUP No such key '{}' or consumer group '{}'",
        stream, group
    ))
}

impl MemoryStreamStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every operation fail with a connection error until switched back
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
        self.appended.notify_waiters();
    }

    fn check_online(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(FrameflowError::connection("stream store unreachable"));
        }
        Ok(())
    }

    /// Entries currently in `stream`, oldest first
    pub fn entries(&self, stream: &str) -> Vec<StreamEntry> {
        let streams = self.streams.lock();
        streams
            .get(stream)
            .map(|log| {
                log.entries
                    .keys()
                    .filter_map(|id| log.entry(id))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Pending list of `group`, lowest id first
    pub fn pending(&self, stream: &str, group: &str) -> Vec<PendingInfo> {
        let streams = self.streams.lock();
        streams
            .get(stream)
            .and_then(|log| log.groups.get(group))
            .map(|g| {
                g.pending
                    .iter()
                    .map(|(id, p)| PendingInfo {
                        id: id.to_string(),
                        consumer: p.consumer.clone(),
                        deliveries: p.deliveries,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Number of groups defined on `stream`
    pub fn group_count(&self, stream: &str) -> usize {
        self.streams
            .lock()
            .get(stream)
            .map(|log| log.groups.len())
            .unwrap_or(0)
    }

    /// Take up to `count` undelivered entries for `consumer`, recording them as pending
    fn deliver_new(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<StreamEntry>> {
        let mut streams = self.streams.lock();
        let log = streams
            .get_mut(stream)
            .ok_or_else(|| no_group(stream, group))?;
        let StreamLog { entries, groups, .. } = log;
        let state = groups.get_mut(group).ok_or_else(|| no_group(stream, group))?;

        let now = Instant::now();
        let mut delivered = Vec::new();
        for (id, fields) in entries.range(state.last_delivered.next()..).take(count) {
            state.pending.insert(
                *id,
                PendingEntry {
                    consumer: consumer.to_string(),
                    delivered_at: now,
                    deliveries: 1,
                },
            );
            state.last_delivered = *id;
            delivered.push(StreamEntry::new(id.to_string(), fields.clone()));
        }
        Ok(delivered)
    }
}

#[async_trait]
impl StreamStore for MemoryStreamStore {
    async fn ensure_group(&self, stream: &str, group: &str) -> Result<bool> {
        self.check_online()?;
        let mut streams = self.streams.lock();
        let log = streams.entry(stream.to_string()).or_default();
        if log.groups.contains_key(group) {
            return Ok(false);
        }
        let last_delivered = log.last_id;
        log.groups.insert(
            group.to_string(),
            Group {
                last_delivered,
                pending: BTreeMap::new(),
            },
        );
        Ok(true)
    }

    async fn claim_idle(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        start: &str,
        count: usize,
    ) -> Result<ClaimBatch> {
        self.check_online()?;
        let start: EntryId = start.parse()?;
        let mut streams = self.streams.lock();
        let log = streams
            .get_mut(stream)
            .ok_or_else(|| no_group(stream, group))?;
        let StreamLog { entries, groups, .. } = log;
        let state = groups.get_mut(group).ok_or_else(|| no_group(stream, group))?;

        let now = Instant::now();
        let candidates: Vec<EntryId> = state.pending.range(start..).map(|(id, _)| *id).collect();
        let mut claimed = Vec::new();
        let mut next_cursor = EntryId::MIN;

        for (position, id) in candidates.iter().enumerate() {
            if claimed.len() == count {
                next_cursor = *id;
                break;
            }
            // Trimmed entries can never be delivered again
            let Some(fields) = entries.get(id) else {
                state.pending.remove(id);
                continue;
            };
            let Some(pending) = state.pending.get_mut(id) else {
                continue;
            };
            if now.duration_since(pending.delivered_at) < min_idle {
                continue;
            }
            pending.consumer = consumer.to_string();
            pending.delivered_at = now;
            pending.deliveries += 1;
            claimed.push(StreamEntry::new(id.to_string(), fields.clone()));

            if claimed.len() == count {
                if let Some(following) = candidates.get(position + 1) {
                    next_cursor = *following;
                }
                break;
            }
        }

        Ok(ClaimBatch {
            next_cursor: next_cursor.to_string(),
            entries: claimed,
        })
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>> {
        let deadline = Instant::now() + block;
        loop {
            let notified = self.appended.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            self.check_online()?;
            let delivered = self.deliver_new(stream, group, consumer, count)?;
            if !delivered.is_empty() {
                return Ok(delivered);
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn append(
        &self,
        stream: &str,
        fields: &[(String, Vec<u8>)],
        max_len: usize,
    ) -> Result<String> {
        self.check_online()?;
        let id = {
            let mut streams = self.streams.lock();
            let log = streams.entry(stream.to_string()).or_default();
            let id = log.next_id();
            log.entries.insert(id, fields.iter().cloned().collect());
            log.last_id = id;
            while log.entries.len() > max_len {
                log.entries.pop_first();
            }
            id
        };
        self.appended.notify_waiters();
        Ok(id.to_string())
    }

    async fn ack(&self, stream: &str, group: &str, id: &str) -> Result<bool> {
        self.check_online()?;
        let id: EntryId = id.parse()?;
        let mut streams = self.streams.lock();
        Ok(streams
            .get_mut(stream)
            .and_then(|log| log.groups.get_mut(group))
            .map(|g| g.pending.remove(&id).is_some())
            .unwrap_or(false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STREAM: &str = "images";
    const GROUP: &str = "cg:images";

    fn fields(n: u32) -> Vec<(String, Vec<u8>)> {
        vec![("n".to_string(), n.to_string().into_bytes())]
    }

    async fn seeded(n: u32) -> MemoryStreamStore {
        let store = MemoryStreamStore::new();
        store.ensure_group(STREAM, GROUP).await.unwrap();
        for i in 0..n {
            store.append(STREAM, &fields(i), 1000).await.unwrap();
        }
        store
    }

    #[tokio::test]
    async fn test_group_creation_is_idempotent() {
        let store = MemoryStreamStore::new();
        assert!(store.ensure_group(STREAM, GROUP).await.unwrap());
        assert!(!store.ensure_group(STREAM, GROUP).await.unwrap());
        assert_eq!(store.group_count(STREAM), 1);
    }

    #[tokio::test]
    async fn test_group_starts_at_latest_entry() {
        let store = MemoryStreamStore::new();
        store.append(STREAM, &fields(0), 10).await.unwrap();
        store.ensure_group(STREAM, GROUP).await.unwrap();
        store.append(STREAM, &fields(1), 10).await.unwrap();

        let read = store
            .read_group(STREAM, GROUP, "a", 10, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(read.len(), 1);
        assert_eq!(read[0].field("n"), Some(&b"1"[..]));
    }

    #[tokio::test]
    async fn test_read_delivers_each_entry_once() {
        let store = seeded(3).await;

        let first = store
            .read_group(STREAM, GROUP, "a", 2, Duration::ZERO)
            .await
            .unwrap();
        let second = store
            .read_group(STREAM, GROUP, "b", 2, Duration::ZERO)
            .await
            .unwrap();
        let third = store
            .read_group(STREAM, GROUP, "a", 2, Duration::ZERO)
            .await
            .unwrap();

        assert_eq!(first.len(), 2);
        assert_eq!(second.len(), 1);
        assert!(third.is_empty());

        let pending = store.pending(STREAM, GROUP);
        assert_eq!(pending.len(), 3);
        assert_eq!(pending[2].consumer, "b");
    }

    #[tokio::test]
    async fn test_ack_removes_from_pending() {
        let store = seeded(1).await;
        let read = store
            .read_group(STREAM, GROUP, "a", 1, Duration::ZERO)
            .await
            .unwrap();

        assert!(store.ack(STREAM, GROUP, &read[0].id).await.unwrap());
        assert!(!store.ack(STREAM, GROUP, &read[0].id).await.unwrap());
        assert!(store.pending(STREAM, GROUP).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_claim_respects_idle_threshold() {
        let store = seeded(1).await;
        store
            .read_group(STREAM, GROUP, "a", 1, Duration::ZERO)
            .await
            .unwrap();

        let early = store
            .claim_idle(STREAM, GROUP, "b", Duration::from_secs(5), "0-0", 10)
            .await
            .unwrap();
        assert!(early.entries.is_empty());

        tokio::time::advance(Duration::from_secs(5)).await;
        let late = store
            .claim_idle(STREAM, GROUP, "b", Duration::from_secs(5), "0-0", 10)
            .await
            .unwrap();
        assert_eq!(late.entries.len(), 1);
        assert_eq!(late.next_cursor, "0-0");

        let pending = store.pending(STREAM, GROUP);
        assert_eq!(pending[0].consumer, "b");
        assert_eq!(pending[0].deliveries, 2);

        // Claiming resets idle time
        let again = store
            .claim_idle(STREAM, GROUP, "c", Duration::from_secs(5), "0-0", 10)
            .await
            .unwrap();
        assert!(again.entries.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_claim_pages_with_cursor() {
        let store = seeded(5).await;
        store
            .read_group(STREAM, GROUP, "a", 5, Duration::ZERO)
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(10)).await;

        let page = store
            .claim_idle(STREAM, GROUP, "b", Duration::from_secs(5), "0-0", 2)
            .await
            .unwrap();
        assert_eq!(page.entries.len(), 2);
        let pending = store.pending(STREAM, GROUP);
        assert_eq!(page.next_cursor, pending[2].id);

        let rest = store
            .claim_idle(STREAM, GROUP, "b", Duration::from_secs(5), &page.next_cursor, 10)
            .await
            .unwrap();
        assert_eq!(rest.entries.len(), 3);
        assert_eq!(rest.next_cursor, "0-0");
    }

    #[tokio::test(start_paused = true)]
    async fn test_trimmed_pending_entries_are_dropped_on_claim() {
        let store = MemoryStreamStore::new();
        store.ensure_group(STREAM, GROUP).await.unwrap();
        store.append(STREAM, &fields(0), 1).await.unwrap();
        store
            .read_group(STREAM, GROUP, "a", 1, Duration::ZERO)
            .await
            .unwrap();
        store.append(STREAM, &fields(1), 1).await.unwrap();
        tokio::time::advance(Duration::from_secs(10)).await;

        let claimed = store
            .claim_idle(STREAM, GROUP, "b", Duration::from_secs(5), "0-0", 10)
            .await
            .unwrap();
        assert!(claimed.entries.is_empty());
        assert!(store.pending(STREAM, GROUP).is_empty());
    }

    #[tokio::test]
    async fn test_append_trims_to_max_len() {
        let store = MemoryStreamStore::new();
        for i in 0..5 {
            store.append("predictions", &fields(i), 3).await.unwrap();
        }
        let entries = store.entries("predictions");
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].field("n"), Some(&b"2"[..]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocking_read_times_out_empty() {
        let store = seeded(0).await;
        let read = store
            .read_group(STREAM, GROUP, "a", 1, Duration::from_secs(10))
            .await
            .unwrap();
        assert!(read.is_empty());
    }

    #[tokio::test]
    async fn test_blocking_read_wakes_on_append() {
        let store = std::sync::Arc::new(seeded(0).await);
        let reader = {
            let store = store.clone();
            tokio::spawn(async move {
                store
                    .read_group(STREAM, GROUP, "a", 1, Duration::from_secs(30))
                    .await
            })
        };
        tokio::task::yield_now().await;
        store.append(STREAM, &fields(7), 10).await.unwrap();

        let read = reader.await.unwrap().unwrap();
        assert_eq!(read.len(), 1);
    }

    #[tokio::test]
    async fn test_missing_group_is_an_error() {
        let store = MemoryStreamStore::new();
        let err = store
            .read_group(STREAM, GROUP, "a", 1, Duration::ZERO)
            .await
            .unwrap_err();
        assert!(matches!(err, FrameflowError::Store(_)));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_offline_store_reports_connection_errors() {
        let store = seeded(1).await;
        store.set_offline(true);
        let err = store
            .read_group(STREAM, GROUP, "a", 1, Duration::ZERO)
            .await
            .unwrap_err();
        assert!(err.is_transient());

        store.set_offline(false);
        assert_eq!(
            store
                .read_group(STREAM, GROUP, "a", 1, Duration::ZERO)
                .await
                .unwrap()
                .len(),
            1
        );
    }
}
