// ============================================================================
// Redis Streams Store
// ============================================================================
//
// StreamStore backed by Redis consumer groups:
// - XGROUP CREATE ... $ MKSTREAM  (BUSYGROUP swallowed)
// - XAUTOCLAIM                    (reclaim idle pending entries)
// - XREADGROUP ... BLOCK          (new entries, dedicated connection)
// - XADD MAXLEN ~                 (bounded output stream)
// - XACK
//
// Blocking reads run on their own connection: a multiplexed connection serves
// commands in order, so a 10s XREADGROUP would otherwise hold every XADD/XACK
// issued by in-flight processors behind it.
//
// ============================================================================

use super::{ClaimBatch, StreamStore};
use async_trait::async_trait;
use frameflow_common::config::RedisConfig;
use frameflow_common::{FrameflowError, Result};
use frameflow_proto::StreamEntry;
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::streams::{StreamId, StreamMaxlen, StreamRangeReply, StreamReadOptions, StreamReadReply};
use redis::{AsyncCommands, Value};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Stream store talking to a Redis server
pub struct RedisStreamStore {
    client: redis::Client,
    commands: ConnectionManager,
    reader: Mutex<Option<MultiplexedConnection>>,
}

impl RedisStreamStore {
    /// Connect using the worker's Redis settings
    pub async fn connect(config: &RedisConfig) -> Result<Self> {
        let client = redis::Client::open(config.url())?;
        let commands = ConnectionManager::new(client.clone()).await?;
        info!(host = %config.host, port = config.port, "Connected to Redis");

        Ok(Self {
            client,
            commands,
            reader: Mutex::new(None),
        })
    }

    /// Client for opening further connections (registration uses one)
    pub fn client(&self) -> &redis::Client {
        &self.client
    }

    async fn reader_connection(
        &self,
        slot: &mut Option<MultiplexedConnection>,
    ) -> Result<MultiplexedConnection> {
        if let Some(conn) = slot.as_ref() {
            return Ok(conn.clone());
        }
        let conn = self.client.get_multiplexed_async_connection().await?;
        debug!("Opened dedicated connection for blocking reads");
        *slot = Some(conn.clone());
        Ok(conn)
    }
}

/// Convert a redis stream id record into a pipeline entry, keeping values as bytes
fn to_entry(stream_id: StreamId) -> StreamEntry {
    let mut fields = HashMap::with_capacity(stream_id.map.len());
    for (key, value) in stream_id.map {
        let bytes = match value {
            Value::BulkString(bytes) => bytes,
            Value::SimpleString(s) => s.into_bytes(),
            Value::Int(i) => i.to_string().into_bytes(),
            _ => continue,
        };
        fields.insert(key, bytes);
    }
    StreamEntry::new(stream_id.id, fields)
}

/// Parse an XAUTOCLAIM reply: `[next-cursor, [[id, [k, v, ...]], ...], [deleted-ids]?]`
fn parse_autoclaim(reply: Value) -> Result<ClaimBatch> {
    let items = match reply {
        Value::Array(items) if items.len() >= 2 => items,
        other => {
            return Err(FrameflowError::store(format!(
                "unexpected XAUTOCLAIM reply: {:?}",
                other
            )))
        }
    };

    let next_cursor: String = redis::from_redis_value(&items[0])?;
    let range: StreamRangeReply = redis::from_redis_value(&items[1])?;

    Ok(ClaimBatch {
        next_cursor,
        entries: range.ids.into_iter().map(to_entry).collect(),
    })
}

#[async_trait]
impl StreamStore for RedisStreamStore {
    async fn ensure_group(&self, stream: &str, group: &str) -> Result<bool> {
        let mut conn = self.commands.clone();
        let created: redis::RedisResult<()> = conn.xgroup_create_mkstream(stream, group, "$").await;
        match created {
            Ok(()) => Ok(true),
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(false),
            Err(e) => Err(e.into()),
        }
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
        let mut conn = self.commands.clone();
        // XAUTOCLAIM key group consumer min-idle-time start COUNT count
        let reply: Value = redis::cmd("XAUTOCLAIM")
            .arg(stream)
            .arg(group)
            .arg(consumer)
            .arg(min_idle.as_millis() as u64)
            .arg(start)
            .arg("COUNT")
            .arg(count)
            .query_async(&mut conn)
            .await?;

        parse_autoclaim(reply)
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>> {
        let mut slot = self.reader.lock().await;
        let mut conn = self.reader_connection(&mut slot).await?;

        let options = StreamReadOptions::default()
            .group(group, consumer)
            .count(count)
            .block(block.as_millis() as usize);

        let reply: redis::RedisResult<Option<StreamReadReply>> =
            conn.xread_options(&[stream], &[">"], &options).await;

        let reply = match reply {
            Ok(reply) => reply,
            Err(e) => {
                let err = FrameflowError::from(e);
                if err.is_transient() {
                    warn!(error = %err, "Dropping blocking-read connection");
                    *slot = None;
                }
                return Err(err);
            }
        };

        Ok(reply
            .map(|reply| {
                reply
                    .keys
                    .into_iter()
                    .flat_map(|key| key.ids)
                    .map(to_entry)
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn append(
        &self,
        stream: &str,
        fields: &[(String, Vec<u8>)],
        max_len: usize,
    ) -> Result<String> {
        let mut conn = self.commands.clone();
        let id: String = conn
            .xadd_maxlen(stream, StreamMaxlen::Approx(max_len), "*", fields)
            .await?;
        Ok(id)
    }

    async fn ack(&self, stream: &str, group: &str, id: &str) -> Result<bool> {
        let mut conn = self.commands.clone();
        let removed: i64 = conn.xack(stream, group, &[id]).await?;
        Ok(removed > 0)
    }
}
