//! Redis Streams consumer for the CRM relay.
//!
//! Handles XREADGROUP against the CRM event stream, XAUTOCLAIM sweeps that
//! recover messages left pending by this or any earlier consumer, and the
//! XACK / XADD calls that acknowledge or dead-letter each message.
//!
//! All Redis traffic goes through [`StreamOps`]; [`RedisStreams`] is the
//! implementation backed by a multiplexed connection.

use crate::config::RelayConfig;
use crate::error::RelayResult;
use async_trait::async_trait;
use batch_delivery_engine::{Acknowledger, DeliveryError, DeliveryResult};
use parking_lot::Mutex;
use redis::aio::MultiplexedConnection;
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::{AsyncCommands, Client, ErrorKind, RedisError, RedisResult, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Field holding the JSON-encoded CRM event.
pub const PAYLOAD_FIELD: &str = "payload";

/// Reason recorded when the engine gives up on a message.
pub const RETRIES_EXHAUSTED: &str = "delivery retries exhausted";

/// XAUTOCLAIM cursor that starts a sweep, and the one returned when a sweep
/// has covered the whole pending list.
pub const SWEEP_START: &str = "0-0";

/// A message read from the Redis stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamMessage {
    /// The Redis message ID (e.g., "1234567890-0").
    pub message_id: String,
    /// Raw payload field, if the message carried one.
    pub payload: Option<String>,
}

impl StreamMessage {
    /// Flatten an XREADGROUP reply into messages, in stream order.
    pub fn from_reply(reply: StreamReadReply) -> Vec<Self> {
        reply
            .keys
            .into_iter()
            .flat_map(|key| key.ids)
            .map(|entry| StreamMessage {
                payload: entry.get::<String>(PAYLOAD_FIELD),
                message_id: entry.id,
            })
            .collect()
    }
}

/// One page of an XAUTOCLAIM sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimedMessages {
    /// Cursor for the next page; [`SWEEP_START`] once the sweep is complete.
    pub next_start: String,
    /// Messages now owned by the claiming consumer, in stream order.
    pub messages: Vec<StreamMessage>,
}

/// Parse an XAUTOCLAIM reply: `[next_start, [[id, [field, value, ...]], ...], ...]`.
///
/// Entries deleted from the stream while pending come back as nil and are
/// skipped.
pub fn parse_autoclaim_reply(reply: &Value) -> RedisResult<ClaimedMessages> {
    let (cursor, entries) = match reply {
        Value::Array(parts) if parts.len() >= 2 => (&parts[0], &parts[1]),
        _ => return Err(unexpected_reply("XAUTOCLAIM reply is not [cursor, entries, ...]")),
    };
    let next_start: String = redis::from_redis_value(cursor)?;
    let entries = match entries {
        Value::Array(entries) => entries,
        _ => return Err(unexpected_reply("XAUTOCLAIM entries are not an array")),
    };

    let mut messages = Vec::with_capacity(entries.len());
    for entry in entries {
        match entry {
            Value::Array(pair) if pair.len() == 2 => {
                let message_id: String = redis::from_redis_value(&pair[0])?;
                let fields: HashMap<String, Value> = match &pair[1] {
                    Value::Nil => HashMap::new(),
                    fields => redis::from_redis_value(fields)?,
                };
                let payload = fields
                    .get(PAYLOAD_FIELD)
                    .and_then(|value| redis::from_redis_value::<String>(value).ok());
                messages.push(StreamMessage {
                    message_id,
                    payload,
                });
            }
            Value::Nil => {}
            _ => return Err(unexpected_reply("XAUTOCLAIM entry is not [id, fields]")),
        }
    }

    Ok(ClaimedMessages {
        next_start,
        messages,
    })
}

fn unexpected_reply(detail: &'static str) -> RedisError {
    RedisError::from((ErrorKind::TypeError, detail))
}

/// Consumer identity and page size for group reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupReader {
    pub stream: String,
    pub group: String,
    pub consumer: String,
    pub count: usize,
}

impl GroupReader {
    pub fn from_config(config: &RelayConfig) -> Self {
        Self {
            stream: config.stream.clone(),
            group: config.consumer_group.clone(),
            consumer: config.consumer_name.clone(),
            count: config.read_count,
        }
    }
}

/// The Redis Streams commands the relay uses.
#[async_trait]
pub trait StreamOps: Send + Sync {
    /// XGROUP CREATE `stream` `group` 0 MKSTREAM.
    async fn create_group(&self, stream: &str, group: &str) -> RedisResult<()>;

    /// XREADGROUP starting after `id` (`>` for never-delivered messages).
    async fn read_group(
        &self,
        reader: &GroupReader,
        id: &str,
        block: Option<Duration>,
    ) -> RedisResult<Vec<StreamMessage>>;

    /// XAUTOCLAIM pending messages idle for at least `min_idle`, from `start`.
    async fn claim_idle(
        &self,
        reader: &GroupReader,
        min_idle: Duration,
        start: &str,
    ) -> RedisResult<ClaimedMessages>;

    /// XACK one message. Returns the number of messages acknowledged.
    async fn ack(&self, stream: &str, group: &str, message_id: &str) -> RedisResult<i64>;

    /// XADD with an auto-generated ID. Returns the new entry's ID.
    async fn append(&self, stream: &str, fields: &[(&str, &str)]) -> RedisResult<String>;

    /// Replace the underlying connection.
    async fn reconnect(&self) -> RedisResult<()>;
}

/// [`StreamOps`] over a multiplexed Redis connection.
pub struct RedisStreams {
    client: Client,
    conn: Mutex<MultiplexedConnection>,
}

impl RedisStreams {
    /// Connect to Redis.
    pub async fn connect(redis_url: &str) -> RedisResult<Self> {
        let client = Client::open(redis_url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        Ok(Self {
            client,
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MultiplexedConnection {
        self.conn.lock().clone()
    }
}

#[async_trait]
impl StreamOps for RedisStreams {
    async fn create_group(&self, stream: &str, group: &str) -> RedisResult<()> {
        redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(stream)
            .arg(group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut self.conn())
            .await
    }

    async fn read_group(
        &self,
        reader: &GroupReader,
        id: &str,
        block: Option<Duration>,
    ) -> RedisResult<Vec<StreamMessage>> {
        let mut options = StreamReadOptions::default()
            .group(&reader.group, &reader.consumer)
            .count(reader.count);
        if let Some(block) = block {
            options = options.block(usize::try_from(block.as_millis()).unwrap_or(usize::MAX));
        }

        let mut conn = self.conn();
        let reply: Option<StreamReadReply> = conn
            .xread_options(&[&reader.stream], &[id], &options)
            .await?;
        Ok(reply.map(StreamMessage::from_reply).unwrap_or_default())
    }

    async fn claim_idle(
        &self,
        reader: &GroupReader,
        min_idle: Duration,
        start: &str,
    ) -> RedisResult<ClaimedMessages> {
        let reply: Value = redis::cmd("XAUTOCLAIM")
            .arg(&reader.stream)
            .arg(&reader.group)
            .arg(&reader.consumer)
            .arg(u64::try_from(min_idle.as_millis()).unwrap_or(u64::MAX))
            .arg(start)
            .arg("COUNT")
            .arg(reader.count)
            .query_async(&mut self.conn())
            .await?;
        parse_autoclaim_reply(&reply)
    }

    async fn ack(&self, stream: &str, group: &str, message_id: &str) -> RedisResult<i64> {
        let mut conn = self.conn();
        conn.xack(stream, group, &[message_id]).await
    }

    async fn append(&self, stream: &str, fields: &[(&str, &str)]) -> RedisResult<String> {
        let mut conn = self.conn();
        conn.xadd(stream, "*", fields).await
    }

    async fn reconnect(&self) -> RedisResult<()> {
        let conn = self.client.get_multiplexed_async_connection().await?;
        *self.conn.lock() = conn;
        Ok(())
    }
}

/// Redis Streams consumer.
///
/// Reads come from three places, in this order of priority:
/// 1. this consumer name's own pending entries, once at startup;
/// 2. an XAUTOCLAIM sweep of messages idle for `claim_min_idle`, at startup
///    and every `claim_interval`;
/// 3. new messages (`>`).
pub struct RedisConsumer {
    ops: Arc<dyn StreamOps>,
    config: RelayConfig,
    reader: GroupReader,
    /// Position in this consumer's pending entries while they are re-read
    /// at startup; `None` once the backlog is exhausted.
    backlog_cursor: Option<String>,
    claim_cursor: String,
    next_claim_at: Instant,
}

impl RedisConsumer {
    /// Connect to Redis and make sure the consumer group exists.
    pub async fn connect(config: RelayConfig) -> RelayResult<Self> {
        let ops = RedisStreams::connect(&config.redis_url).await?;
        Self::with_ops(config, Arc::new(ops)).await
    }

    /// Build a consumer over any [`StreamOps`] implementation.
    pub async fn with_ops(config: RelayConfig, ops: Arc<dyn StreamOps>) -> RelayResult<Self> {
        let consumer = Self {
            reader: GroupReader::from_config(&config),
            ops,
            config,
            backlog_cursor: Some("0".to_string()),
            claim_cursor: SWEEP_START.to_string(),
            next_claim_at: Instant::now(),
        };
        consumer.ensure_consumer_group().await?;

        Ok(consumer)
    }

    /// Ensure the consumer group exists, creating it (and the stream) if
    /// necessary.
    async fn ensure_consumer_group(&self) -> RelayResult<()> {
        let result = self
            .ops
            .create_group(&self.config.stream, &self.config.consumer_group)
            .await;

        match result {
            Ok(()) => {
                info!(
                    stream = %self.config.stream,
                    group = %self.config.consumer_group,
                    "Created consumer group"
                );
            }
            Err(e) if e.to_string().contains("BUSYGROUP") => {
                debug!(
                    stream = %self.config.stream,
                    group = %self.config.consumer_group,
                    "Consumer group already exists"
                );
            }
            Err(e) => return Err(e.into()),
        }

        Ok(())
    }

    /// Read the next messages.
    ///
    /// Returns this consumer's own backlog first, then any page of idle
    /// pending messages claimed by a due sweep. Otherwise blocks for at
    /// most `block_ms` waiting for new entries and returns an empty vector
    /// when the block timeout expires.
    pub async fn read_batch(&mut self) -> RelayResult<Vec<StreamMessage>> {
        if let Some(cursor) = self.backlog_cursor.take() {
            let backlog = match self.read_from(&cursor, None).await {
                Ok(backlog) => backlog,
                Err(e) => {
                    self.backlog_cursor = Some(cursor);
                    return Err(e);
                }
            };
            if let Some(last) = backlog.last() {
                info!(
                    stream = %self.config.stream,
                    count = backlog.len(),
                    "Re-reading pending messages"
                );
                self.backlog_cursor = Some(last.message_id.clone());
                return Ok(backlog);
            }
        }

        if Instant::now() >= self.next_claim_at {
            let claimed = self.claim_idle().await?;
            if !claimed.is_empty() {
                return Ok(claimed);
            }
        }

        self.read_from(">", Some(Duration::from_millis(self.config.block_ms)))
            .await
    }

    /// Run one page of the current XAUTOCLAIM sweep. The cursor only moves
    /// on success, so a failed page is retried on the next read.
    async fn claim_idle(&mut self) -> RelayResult<Vec<StreamMessage>> {
        let claimed = self
            .ops
            .claim_idle(&self.reader, self.config.claim_min_idle, &self.claim_cursor)
            .await?;

        if claimed.next_start == SWEEP_START {
            self.next_claim_at = Instant::now() + self.config.claim_interval;
        }
        self.claim_cursor = claimed.next_start;

        if !claimed.messages.is_empty() {
            info!(
                stream = %self.config.stream,
                count = claimed.messages.len(),
                min_idle_ms = u64::try_from(self.config.claim_min_idle.as_millis()).unwrap_or(u64::MAX),
                "Claimed idle pending messages"
            );
        }
        Ok(claimed.messages)
    }

    async fn read_from(
        &self,
        id: &str,
        block: Option<Duration>,
    ) -> RelayResult<Vec<StreamMessage>> {
        let messages = self.ops.read_group(&self.reader, id, block).await?;
        if !messages.is_empty() {
            debug!(
                stream = %self.config.stream,
                count = messages.len(),
                "Read messages from stream"
            );
        }
        Ok(messages)
    }

    /// Acknowledger for one message read by this consumer.
    pub fn acknowledger_for(&self, message: &StreamMessage) -> StreamAcknowledger {
        StreamAcknowledger {
            ops: self.ops.clone(),
            stream: self.config.stream.clone(),
            dead_letter_stream: self.config.dead_letter_stream.clone(),
            group: self.config.consumer_group.clone(),
            message_id: message.message_id.clone(),
            payload: message.payload.clone(),
            reason: RETRIES_EXHAUSTED.to_string(),
        }
    }

    /// Reconnect to Redis.
    pub async fn reconnect(&mut self) -> RelayResult<()> {
        info!("Reconnecting to Redis...");
        self.ops.reconnect().await?;
        self.ensure_consumer_group().await?;
        Ok(())
    }
}

/// Acknowledges one stream message on its consumer group.
///
/// Confirm is a plain XACK. Reject first copies the message to the
/// dead-letter stream, then XACKs it, so a crash in between leaves the
/// message pending rather than lost.
#[derive(Clone)]
pub struct StreamAcknowledger {
    ops: Arc<dyn StreamOps>,
    stream: String,
    dead_letter_stream: String,
    group: String,
    message_id: String,
    payload: Option<String>,
    reason: String,
}

impl StreamAcknowledger {
    /// Replace the reason recorded on the dead-letter entry.
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = reason.into();
        self
    }

    async fn xack(&self) -> RedisResult<()> {
        let acked = self
            .ops
            .ack(&self.stream, &self.group, &self.message_id)
            .await?;

        if acked == 1 {
            debug!(message_id = %self.message_id, stream = %self.stream, "Acknowledged message");
        } else {
            warn!(
                message_id = %self.message_id,
                stream = %self.stream,
                "XACK returned {}, message may not exist",
                acked
            );
        }
        Ok(())
    }

    async fn dead_letter(&self) -> RedisResult<()> {
        let rejected_at = chrono::Utc::now().to_rfc3339();
        let fields = [
            (PAYLOAD_FIELD, self.payload.as_deref().unwrap_or_default()),
            ("origin_id", self.message_id.as_str()),
            ("origin_stream", self.stream.as_str()),
            ("reason", self.reason.as_str()),
            ("rejected_at", rejected_at.as_str()),
        ];
        let dead_letter_id = self.ops.append(&self.dead_letter_stream, &fields).await?;

        info!(
            message_id = %self.message_id,
            dead_letter_stream = %self.dead_letter_stream,
            dead_letter_id = %dead_letter_id,
            reason = %self.reason,
            "Message moved to dead-letter stream"
        );
        Ok(())
    }
}

#[async_trait]
impl Acknowledger for StreamAcknowledger {
    async fn confirm(&self) -> DeliveryResult<()> {
        self.xack()
            .await
            .map_err(|e| DeliveryError::Ack(e.to_string()))
    }

    async fn reject(&self) -> DeliveryResult<()> {
        self.dead_letter()
            .await
            .map_err(|e| DeliveryError::Ack(e.to_string()))?;
        self.xack()
            .await
            .map_err(|e| DeliveryError::Ack(e.to_string()))
    }
}
