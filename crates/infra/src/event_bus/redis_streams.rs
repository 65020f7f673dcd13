//! Redis Streams transport (durable, at-least-once delivery).
//!
//! ## Layout
//!
//! - **Streams**: one per topic, `<prefix>:<topic>` (e.g. `stockflow:order-created`)
//! - **Entry fields**: `event_id`, `partition_key`, `payload` (the JSON envelope)
//! - **Consumer group**: shared by every reconciler instance; each instance
//!   reads as its own named consumer
//! - **Dead letters**: `<prefix>:dead-letter`, one entry per parked delivery
//!
//! ## Delivery lifecycle
//!
//! | Operation     | Redis                                                   |
//! |---------------|---------------------------------------------------------|
//! | consume (new) | `XREADGROUP GROUP g c COUNT n BLOCK ms STREAMS ... >`   |
//! | redelivery    | `XPENDING key g IDLE ms - + n` then `XCLAIM`            |
//! | ack           | `XACK key g id`                                         |
//! | nack          | nothing; the entry stays pending and is reclaimed once idle |
//! | dead_letter   | `XADD <prefix>:dead-letter *` then `XACK`               |
//!
//! The attempt number of a reclaimed entry is its pending delivery count
//! plus one.

use std::collections::HashMap;
use std::sync::{Arc, mpsc};
use std::thread;
use std::time::Duration;

use serde_json::Value as JsonValue;
use tracing::{debug, error, info, instrument, warn};

use stockflow_events::{ConsumerQueue, Delivery, DeliveryTag, EventBus, EventEnvelope, Subscription, topics};

type Envelope = EventEnvelope<JsonValue>;

#[derive(Debug, thiserror::Error)]
pub enum RedisStreamsError {
    #[error("Redis connection error: {0}")]
    Connection(String),

    #[error("Redis command error: {0}")]
    Command(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),
}

#[derive(Debug, Clone)]
pub struct RedisStreamsSettings {
    /// Stream key prefix
    pub stream_prefix: String,
    pub consumer_group: String,
    /// Unique per process
    pub consumer_name: String,
    /// Topics consumed through `ConsumerQueue`
    pub inbound_topics: Vec<String>,
    /// Topics followed by `EventBus::subscribe`
    pub outbound_topics: Vec<String>,
    /// Pending entries idle longer than this are reclaimed for redelivery
    pub pending_idle: Duration,
    /// `XREADGROUP` / `XREAD` block time
    pub block: Duration,
    pub batch_size: usize,
    /// Connect and write timeout; reads allow `block` on top
    pub io_timeout: Duration,
}

impl Default for RedisStreamsSettings {
    fn default() -> Self {
        Self {
            stream_prefix: "stockflow".to_string(),
            consumer_group: "inventory.reconciler".to_string(),
            consumer_name: format!("reconciler-{}", uuid::Uuid::now_v7()),
            inbound_topics: topics::INBOUND.iter().map(|t| t.to_string()).collect(),
            outbound_topics: topics::OUTBOUND.iter().map(|t| t.to_string()).collect(),
            pending_idle: Duration::from_secs(30),
            block: Duration::from_millis(500),
            batch_size: 32,
            io_timeout: Duration::from_secs(2),
        }
    }
}

/// Redis Streams-backed inbound queue and outbound bus.
#[derive(Debug, Clone)]
pub struct RedisStreamsTransport {
    client: Arc<redis::Client>,
    settings: Arc<RedisStreamsSettings>,
}

impl RedisStreamsTransport {
    /// Create a transport. No connection is made until first use.
    pub fn new(redis_url: impl AsRef<str>, settings: RedisStreamsSettings) -> Result<Self, RedisStreamsError> {
        let client =
            redis::Client::open(redis_url.as_ref()).map_err(|e| RedisStreamsError::Connection(e.to_string()))?;

        Ok(Self {
            client: Arc::new(client),
            settings: Arc::new(settings),
        })
    }

    pub fn settings(&self) -> &RedisStreamsSettings {
        &self.settings
    }

    pub fn stream_key(&self, topic: &str) -> String {
        format!("{}:{}", self.settings.stream_prefix, topic)
    }

    pub fn dead_letter_key(&self) -> String {
        format!("{}:dead-letter", self.settings.stream_prefix)
    }

    fn topic_of<'a>(&self, stream_key: &'a str) -> &'a str {
        stream_key
            .strip_prefix(self.settings.stream_prefix.as_str())
            .and_then(|rest| rest.strip_prefix(':'))
            .unwrap_or(stream_key)
    }

    fn connection(&self) -> Result<redis::Connection, RedisStreamsError> {
        let io = self.settings.io_timeout;
        let conn = self
            .client
            .get_connection_with_timeout(io)
            .map_err(|e| RedisStreamsError::Connection(e.to_string()))?;
        conn.set_read_timeout(Some(io + self.settings.block))
            .map_err(|e| RedisStreamsError::Connection(e.to_string()))?;
        conn.set_write_timeout(Some(io))
            .map_err(|e| RedisStreamsError::Connection(e.to_string()))?;
        Ok(conn)
    }

    /// Create the consumer group on every inbound stream (idempotent).
    ///
    /// `MKSTREAM` creates missing streams; an existing group (`BUSYGROUP`) is
    /// not an error.
    pub fn ensure_consumer_groups(&self) -> Result<(), RedisStreamsError> {
        let mut conn = self.connection()?;

        for topic in &self.settings.inbound_topics {
            let key = self.stream_key(topic);
            let created: redis::RedisResult<String> = redis::cmd("XGROUP")
                .arg("CREATE")
                .arg(&key)
                .arg(&self.settings.consumer_group)
                .arg("0")
                .arg("MKSTREAM")
                .query(&mut conn);

            match created {
                Ok(_) => info!(stream = %key, group = %self.settings.consumer_group, "consumer group created"),
                Err(e) if e.code() == Some("BUSYGROUP") => {}
                Err(e) => return Err(RedisStreamsError::Command(format!("XGROUP CREATE {key} failed: {e}"))),
            }
        }

        Ok(())
    }

    #[instrument(
        skip(self, message),
        fields(topic = %message.topic(), event_id = %message.event_id()),
        err
    )]
    fn publish_sync(&self, message: &Envelope) -> Result<(), RedisStreamsError> {
        let payload = serde_json::to_string(message).map_err(|e| RedisStreamsError::Serialization(e.to_string()))?;
        let mut conn = self.connection()?;

        let _: String = redis::cmd("XADD")
            .arg(self.stream_key(message.topic()))
            .arg("*")
            .arg("event_id")
            .arg(message.event_id().to_string())
            .arg("partition_key")
            .arg(message.partition_key())
            .arg("payload")
            .arg(&payload)
            .query(&mut conn)
            .map_err(|e| RedisStreamsError::Command(format!("XADD failed: {e}")))?;

        Ok(())
    }

    fn ack_sync(&self, tag: &DeliveryTag) -> Result<(), RedisStreamsError> {
        let mut conn = self.connection()?;
        let _: u64 = redis::cmd("XACK")
            .arg(self.stream_key(tag.source()))
            .arg(&self.settings.consumer_group)
            .arg(tag.id())
            .query(&mut conn)
            .map_err(|e| RedisStreamsError::Command(format!("XACK failed: {e}")))?;
        Ok(())
    }

    /// Park an entry in the dead-letter stream and ack it.
    fn dead_letter_sync(
        &self,
        tag: &DeliveryTag,
        payload: &str,
        reason: &str,
    ) -> Result<(), RedisStreamsError> {
        let mut conn = self.connection()?;

        let _: String = redis::cmd("XADD")
            .arg(self.dead_letter_key())
            .arg("*")
            .arg("source_topic")
            .arg(tag.source())
            .arg("original_message_id")
            .arg(tag.id())
            .arg("attempt")
            .arg(tag.attempt())
            .arg("reason")
            .arg(reason)
            .arg("failed_at")
            .arg(chrono::Utc::now().to_rfc3339())
            .arg("payload")
            .arg(payload)
            .query(&mut conn)
            .map_err(|e| RedisStreamsError::Command(format!("dead-letter XADD failed: {e}")))?;

        warn!(
            topic = tag.source(),
            message_id = tag.id(),
            attempt = tag.attempt(),
            reason,
            "message dead-lettered"
        );

        self.ack_sync(tag)
    }

    /// Reclaim entries that other deliveries left pending for too long.
    fn claim_idle(&self, conn: &mut redis::Connection) -> Result<Vec<Delivery<Envelope>>, RedisStreamsError> {
        let min_idle_ms = self.settings.pending_idle.as_millis() as u64;
        let mut out = Vec::new();

        for topic in &self.settings.inbound_topics {
            let key = self.stream_key(topic);

            // (id, consumer, idle ms, delivery count)
            let pending: Vec<(String, String, u64, u64)> = redis::cmd("XPENDING")
                .arg(&key)
                .arg(&self.settings.consumer_group)
                .arg("IDLE")
                .arg(min_idle_ms)
                .arg("-")
                .arg("+")
                .arg(self.settings.batch_size)
                .query(conn)
                .map_err(|e| RedisStreamsError::Command(format!("XPENDING failed: {e}")))?;

            if pending.is_empty() {
                continue;
            }

            let deliveries: HashMap<String, u64> = pending.iter().map(|(id, _, _, n)| (id.clone(), *n)).collect();
            let ids: Vec<&String> = pending.iter().map(|(id, _, _, _)| id).collect();

            let claimed: redis::Value = redis::cmd("XCLAIM")
                .arg(&key)
                .arg(&self.settings.consumer_group)
                .arg(&self.settings.consumer_name)
                .arg(min_idle_ms)
                .arg(&ids[..])
                .query(conn)
                .map_err(|e| RedisStreamsError::Command(format!("XCLAIM failed: {e}")))?;

            for entry in bulk(claimed) {
                let Some(raw) = RawEntry::parse(entry) else {
                    continue;
                };
                let previous = deliveries.get(&raw.id).copied().unwrap_or(0);
                let attempt = u32::try_from(previous.saturating_add(1)).unwrap_or(u32::MAX);
                debug!(topic = %topic, message_id = %raw.id, attempt, "reclaimed idle entry");
                self.accept(topic, raw, attempt, &mut out);
            }
        }

        Ok(out)
    }

    /// Read never-delivered entries for this consumer.
    fn read_new(&self, conn: &mut redis::Connection) -> Result<Vec<Delivery<Envelope>>, RedisStreamsError> {
        let keys: Vec<String> = self.settings.inbound_topics.iter().map(|t| self.stream_key(t)).collect();
        let ids = vec![">"; keys.len()];

        let reply: redis::Value = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(&self.settings.consumer_group)
            .arg(&self.settings.consumer_name)
            .arg("COUNT")
            .arg(self.settings.batch_size)
            .arg("BLOCK")
            .arg(self.settings.block.as_millis() as u64)
            .arg("STREAMS")
            .arg(&keys)
            .arg(&ids)
            .query(conn)
            .map_err(|e| RedisStreamsError::Command(format!("XREADGROUP failed: {e}")))?;

        let mut out = Vec::new();
        for (key, entries) in streams(reply) {
            let topic = self.topic_of(&key).to_string();
            for entry in entries {
                if let Some(raw) = RawEntry::parse(entry) {
                    self.accept(&topic, raw, 1, &mut out);
                }
            }
        }
        Ok(out)
    }

    /// Decode a raw entry into a delivery; undecodable entries are parked
    /// straight away since no redelivery can fix them.
    fn accept(&self, topic: &str, raw: RawEntry, attempt: u32, out: &mut Vec<Delivery<Envelope>>) {
        let tag = DeliveryTag::new(topic, raw.id.clone(), attempt);

        match raw.envelope() {
            Ok(envelope) => out.push(Delivery::new(tag, envelope)),
            Err(err) => {
                let payload = raw.fields.get("payload").cloned().unwrap_or_default();
                if let Err(e) = self.dead_letter_sync(&tag, &payload, &err.to_string()) {
                    error!(topic, message_id = %raw.id, error = %e, "failed to park undecodable entry");
                }
            }
        }
    }

    fn poll_once(&self, conn: &mut redis::Connection) -> Result<Vec<Delivery<Envelope>>, RedisStreamsError> {
        let reclaimed = self.claim_idle(conn)?;
        if !reclaimed.is_empty() {
            return Ok(reclaimed);
        }
        self.read_new(conn)
    }

    fn consume_loop(&self, tx: mpsc::Sender<Delivery<Envelope>>) {
        let mut conn: Option<redis::Connection> = None;

        loop {
            if conn.is_none() {
                match self.connection() {
                    Ok(c) => conn = Some(c),
                    Err(e) => {
                        error!(error = %e, "redis unavailable; retrying");
                        thread::sleep(self.settings.io_timeout);
                        continue;
                    }
                }
            }
            let Some(c) = conn.as_mut() else {
                continue;
            };

            match self.poll_once(c) {
                Ok(batch) => {
                    for delivery in batch {
                        if tx.send(delivery).is_err() {
                            debug!("consumer dropped; stopping stream reader");
                            return;
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, "stream read failed; reconnecting");
                    conn = None;
                    thread::sleep(self.settings.io_timeout);
                }
            }
        }
    }

    /// Follow outbound streams from their current end (`XREAD`, no group).
    fn follow_loop(&self, tx: mpsc::Sender<Envelope>) {
        let keys: Vec<String> = self.settings.outbound_topics.iter().map(|t| self.stream_key(t)).collect();
        let mut last_ids: Vec<String> = vec!["$".to_string(); keys.len()];
        let mut conn: Option<redis::Connection> = None;

        loop {
            if conn.is_none() {
                match self.connection() {
                    Ok(c) => conn = Some(c),
                    Err(e) => {
                        error!(error = %e, "redis unavailable; retrying");
                        thread::sleep(self.settings.io_timeout);
                        continue;
                    }
                }
            }
            let Some(c) = conn.as_mut() else {
                continue;
            };

            let reply: redis::RedisResult<redis::Value> = redis::cmd("XREAD")
                .arg("COUNT")
                .arg(self.settings.batch_size)
                .arg("BLOCK")
                .arg(self.settings.block.as_millis() as u64)
                .arg("STREAMS")
                .arg(&keys)
                .arg(&last_ids)
                .query(c);

            let reply = match reply {
                Ok(v) => v,
                Err(e) => {
                    warn!(error = %e, "XREAD failed; reconnecting");
                    conn = None;
                    thread::sleep(self.settings.io_timeout);
                    continue;
                }
            };

            for (key, entries) in streams(reply) {
                let Some(idx) = keys.iter().position(|k| *k == key) else {
                    continue;
                };
                for raw in entries.into_iter().filter_map(RawEntry::parse) {
                    last_ids[idx] = raw.id.clone();
                    match raw.envelope() {
                        Ok(envelope) => {
                            if tx.send(envelope).is_err() {
                                return;
                            }
                        }
                        Err(e) => warn!(stream = %key, message_id = %raw.id, error = %e, "skipping undecodable entry"),
                    }
                }
            }
        }
    }
}

/// A stream entry before envelope decoding.
#[derive(Debug)]
struct RawEntry {
    id: String,
    fields: HashMap<String, String>,
}

impl RawEntry {
    /// `[id, [field, value, ...]]`; entries deleted from the stream come back
    /// with a nil field list and are skipped.
    fn parse(value: redis::Value) -> Option<Self> {
        let mut parts = bulk(value).into_iter();
        let id = text(parts.next()?)?;
        let flat = match parts.next()? {
            redis::Value::Bulk(v) => v,
            _ => return None,
        };

        let mut fields = HashMap::new();
        let mut it = flat.into_iter();
        while let (Some(k), Some(v)) = (it.next(), it.next()) {
            if let (Some(k), Some(v)) = (text(k), text(v)) {
                fields.insert(k, v);
            }
        }

        Some(Self { id, fields })
    }

    fn envelope(&self) -> Result<Envelope, RedisStreamsError> {
        let payload = self
            .fields
            .get("payload")
            .ok_or_else(|| RedisStreamsError::Deserialization("missing payload field".to_string()))?;
        serde_json::from_str(payload)
            .map_err(|e| RedisStreamsError::Deserialization(format!("invalid envelope: {e}")))
    }
}

fn text(value: redis::Value) -> Option<String> {
    match value {
        redis::Value::Data(bytes) => String::from_utf8(bytes).ok(),
        redis::Value::Status(s) => Some(s),
        _ => None,
    }
}

fn bulk(value: redis::Value) -> Vec<redis::Value> {
    match value {
        redis::Value::Bulk(items) => items,
        _ => Vec::new(),
    }
}

/// `XREAD`/`XREADGROUP` reply: `[[key, [entry, ...]], ...]`, or nil on timeout.
fn streams(reply: redis::Value) -> Vec<(String, Vec<redis::Value>)> {
    bulk(reply)
        .into_iter()
        .filter_map(|stream| {
            let mut parts = bulk(stream).into_iter();
            let key = text(parts.next()?)?;
            Some((key, bulk(parts.next()?)))
        })
        .collect()
}

impl ConsumerQueue<Envelope> for RedisStreamsTransport {
    type Error = RedisStreamsError;

    fn consume(&self) -> Subscription<Delivery<Envelope>> {
        let (tx, rx) = mpsc::channel();
        let transport = self.clone();

        if let Err(e) = thread::Builder::new()
            .name(format!("redis-consume-{}", self.settings.consumer_name))
            .spawn(move || transport.consume_loop(tx))
        {
            // The sender was moved into the failed closure and dropped, so
            // the subscription reports Disconnected to its reader.
            error!(error = %e, "failed to spawn stream reader");
        }

        Subscription::new(rx)
    }

    fn ack(&self, tag: &DeliveryTag) -> Result<(), Self::Error> {
        self.ack_sync(tag)
    }

    fn nack(&self, tag: &DeliveryTag) -> Result<(), Self::Error> {
        debug!(
            topic = tag.source(),
            message_id = tag.id(),
            attempt = tag.attempt(),
            "left pending for redelivery"
        );
        Ok(())
    }

    fn dead_letter(&self, delivery: Delivery<Envelope>, reason: &str) -> Result<(), Self::Error> {
        let (tag, envelope) = delivery.into_parts();
        let payload = serde_json::to_string(&envelope).map_err(|e| RedisStreamsError::Serialization(e.to_string()))?;
        self.dead_letter_sync(&tag, &payload, reason)
    }
}

impl EventBus<Envelope> for RedisStreamsTransport {
    type Error = RedisStreamsError;

    fn publish(&self, message: Envelope) -> Result<(), Self::Error> {
        self.publish_sync(&message)
    }

    fn subscribe(&self) -> Subscription<Envelope> {
        let (tx, rx) = mpsc::channel();
        let transport = self.clone();

        if let Err(e) = thread::Builder::new()
            .name("redis-follow".to_string())
            .spawn(move || transport.follow_loop(tx))
        {
            error!(error = %e, "failed to spawn stream follower");
        }

        Subscription::new(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use redis::Value;

    fn data(s: &str) -> Value {
        Value::Data(s.as_bytes().to_vec())
    }

    fn transport() -> RedisStreamsTransport {
        RedisStreamsTransport::new("redis://127.0.0.1:6379", RedisStreamsSettings::default()).unwrap()
    }

    #[test]
    fn stream_keys_use_prefix() {
        let t = transport();
        assert_eq!(t.stream_key("order-created"), "stockflow:order-created");
        assert_eq!(t.dead_letter_key(), "stockflow:dead-letter");
        assert_eq!(t.topic_of("stockflow:order-created"), "order-created");
    }

    #[test]
    fn parses_xreadgroup_reply() {
        let envelope = EventEnvelope::new(
            uuid::Uuid::now_v7(),
            "product-created",
            "p-1",
            chrono::Utc::now(),
            serde_json::json!({"productId": uuid::Uuid::now_v7().to_string()}),
        );
        let payload = serde_json::to_string(&envelope).unwrap();

        let reply = Value::Bulk(vec![Value::Bulk(vec![
            data("stockflow:product-created"),
            Value::Bulk(vec![Value::Bulk(vec![
                data("1700000000000-0"),
                Value::Bulk(vec![data("partition_key"), data("p-1"), data("payload"), data(&payload)]),
            ])]),
        ])]);

        let parsed = streams(reply);
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].0, "stockflow:product-created");

        let raw = RawEntry::parse(parsed[0].1[0].clone()).unwrap();
        assert_eq!(raw.id, "1700000000000-0");
        assert_eq!(raw.envelope().unwrap(), envelope);
    }

    #[test]
    fn timeout_reply_is_empty() {
        assert!(streams(Value::Nil).is_empty());
    }

    #[test]
    fn deleted_entry_is_skipped() {
        let entry = Value::Bulk(vec![data("1-0"), Value::Nil]);
        assert!(RawEntry::parse(entry).is_none());
    }

    #[test]
    fn missing_payload_is_a_decode_error() {
        let raw = RawEntry::parse(Value::Bulk(vec![
            data("1-0"),
            Value::Bulk(vec![data("partition_key"), data("k")]),
        ]))
        .unwrap();
        assert!(matches!(raw.envelope(), Err(RedisStreamsError::Deserialization(_))));
    }
}
