//! Redis Streams-backed work queue and launcher (durable, at-least-once).
//!
//! ## Layout
//!
//! - **Stream**: `lakepurge:queries` holds pending work; one field `body`
//! - **Consumer group**: `lakepurge.dispatcher`; each dispatcher is a named consumer
//! - **Dead letters**: `lakepurge:queries:dlq`
//! - **Executions**: `lakepurge:executions`, consumed by execution units
//!
//! A receipt handle is `<entry id>/<delivery count>`. Acknowledging checks the
//! count against `XPENDING`, so a unit holding an expired delivery cannot
//! acknowledge the redelivered copy. Acknowledging is `XACK` plus `XDEL`, so
//! `XLEN` only counts messages that are waiting or in flight. Entries left
//! pending longer than the visibility timeout are reclaimed with `XCLAIM`
//! before new entries are read. Entries without a `body` field are moved to
//! the dead-letter stream as soon as they are delivered.

use std::sync::Arc;
use std::time::Duration;

use redis::streams::{StreamClaimReply, StreamId, StreamRangeReply, StreamReadReply};
use tracing::{debug, instrument, warn};

use lakepurge_core::QueueVisibility;

use super::{ReceiptHandle, WorkQueue, WorkQueueError, WorkQueueMessage};
use crate::dispatcher::{ExecutionLauncher, LaunchError, TaskPayload};

const DEFAULT_STREAM_KEY: &str = "lakepurge:queries";
const DEFAULT_GROUP: &str = "lakepurge.dispatcher";
const DEFAULT_EXECUTIONS_KEY: &str = "lakepurge:executions";
const BODY_FIELD: &str = "body";
const HANDLE_SEPARATOR: char = '/';

/// Default visibility timeout before a pending entry is reclaimed.
const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
pub struct RedisStreamsWorkQueue {
    client: Arc<redis::Client>,
    stream_key: String,
    dlq_key: String,
    group: String,
    consumer: String,
    visibility_timeout: Duration,
}

fn connection_error(e: redis::RedisError) -> WorkQueueError {
    WorkQueueError::Connection(e.to_string())
}

fn command_error(command: &str) -> impl Fn(redis::RedisError) -> WorkQueueError + '_ {
    move |e| WorkQueueError::Command(format!("{command} failed: {e}"))
}

impl RedisStreamsWorkQueue {
    /// Open a queue on `stream_key` (default `lakepurge:queries`) as `consumer`.
    pub fn new(
        redis_url: impl AsRef<str>,
        stream_key: Option<String>,
        consumer: impl Into<String>,
    ) -> Result<Self, WorkQueueError> {
        let client = redis::Client::open(redis_url.as_ref()).map_err(connection_error)?;
        let stream_key = stream_key.unwrap_or_else(|| DEFAULT_STREAM_KEY.to_string());
        let queue = Self {
            client: Arc::new(client),
            dlq_key: format!("{stream_key}:dlq"),
            stream_key,
            group: DEFAULT_GROUP.to_string(),
            consumer: consumer.into(),
            visibility_timeout: DEFAULT_VISIBILITY_TIMEOUT,
        };
        queue.ensure_consumer_group()?;
        Ok(queue)
    }

    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }

    fn connection(&self) -> Result<redis::Connection, WorkQueueError> {
        self.client.get_connection().map_err(connection_error)
    }

    /// Create the consumer group (and stream) if missing.
    fn ensure_consumer_group(&self) -> Result<(), WorkQueueError> {
        let mut conn = self.connection()?;
        let created: redis::RedisResult<String> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg("0")
            .arg("MKSTREAM")
            .query(&mut conn);

        match created {
            Ok(_) => Ok(()),
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(command_error("XGROUP CREATE")(e)),
        }
    }

    /// Turn delivered entries into messages, dead-lettering entries without a body.
    fn collect_messages(
        &self,
        conn: &mut redis::Connection,
        entries: Vec<(StreamId, u64)>,
    ) -> Result<Vec<WorkQueueMessage>, WorkQueueError> {
        let mut messages = Vec::with_capacity(entries.len());
        for (entry, delivery) in entries {
            match entry.get::<String>(BODY_FIELD) {
                Some(body) => messages.push(WorkQueueMessage {
                    body,
                    receipt_handle: receipt_handle(&entry.id, delivery),
                }),
                None => {
                    warn!(entry_id = %entry.id, "stream entry without a body field");
                    self.move_to_dlq(conn, &entry.id, None, "stream entry has no body field")?;
                }
            }
        }
        Ok(messages)
    }

    /// Resolve `handle` to its entry id if it names the latest delivery of a pending entry.
    fn current_entry<'h>(
        &self,
        conn: &mut redis::Connection,
        handle: &'h ReceiptHandle,
    ) -> Result<&'h str, WorkQueueError> {
        let unknown = || WorkQueueError::UnknownReceipt(handle.clone());
        let (entry_id, delivery) = parse_receipt_handle(handle).ok_or_else(unknown)?;

        let pending: Vec<(String, String, u64, u64)> = redis::cmd("XPENDING")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg(entry_id)
            .arg(entry_id)
            .arg(1)
            .query(conn)
            .map_err(command_error("XPENDING"))?;

        match pending.first() {
            Some((_, _, _, deliveries)) if *deliveries == delivery => Ok(entry_id),
            _ => Err(unknown()),
        }
    }

    /// Claim entries another consumer left pending past the visibility timeout.
    fn reclaim_expired(
        &self,
        conn: &mut redis::Connection,
        max: usize,
    ) -> Result<Vec<WorkQueueMessage>, WorkQueueError> {
        let min_idle_ms = self.visibility_timeout.as_millis().to_string();
        let pending: Vec<(String, String, u64, u64)> = redis::cmd("XPENDING")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg("IDLE")
            .arg(&min_idle_ms)
            .arg("-")
            .arg("+")
            .arg(max)
            .query(conn)
            .map_err(command_error("XPENDING"))?;

        if pending.is_empty() {
            return Ok(Vec::new());
        }
        let ids: Vec<&str> = pending.iter().map(|(id, _, _, _)| id.as_str()).collect();

        let claimed: StreamClaimReply = redis::cmd("XCLAIM")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg(&self.consumer)
            .arg(&min_idle_ms)
            .arg(&ids[..])
            .query(conn)
            .map_err(command_error("XCLAIM"))?;

        debug!(count = claimed.ids.len(), "reclaimed expired deliveries");
        // XCLAIM counts as one more delivery.
        let entries = claimed
            .ids
            .into_iter()
            .map(|entry| {
                let delivered = pending
                    .iter()
                    .find(|(id, _, _, _)| *id == entry.id)
                    .map_or(0, |(_, _, _, count)| *count);
                (entry, delivered + 1)
            })
            .collect();
        self.collect_messages(conn, entries)
    }

    fn read_new(
        &self,
        conn: &mut redis::Connection,
        max: usize,
        wait: Duration,
    ) -> Result<Vec<WorkQueueMessage>, WorkQueueError> {
        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP")
            .arg(&self.group)
            .arg(&self.consumer)
            .arg("COUNT")
            .arg(max);
        // BLOCK 0 would wait forever.
        if !wait.is_zero() {
            cmd.arg("BLOCK").arg(wait.as_millis().to_string());
        }
        cmd.arg("STREAMS").arg(&self.stream_key).arg(">");

        // Nil reply when the block times out.
        let reply: Option<StreamReadReply> = cmd.query(conn).map_err(command_error("XREADGROUP"))?;

        // `>` only yields entries never delivered before.
        let entries = reply
            .into_iter()
            .flat_map(|r| r.keys)
            .filter(|k| k.key == self.stream_key)
            .flat_map(|k| k.ids)
            .map(|entry| (entry, 1))
            .collect();
        self.collect_messages(conn, entries)
    }

    fn ack_and_delete(&self, conn: &mut redis::Connection, entry_id: &str) -> Result<(), WorkQueueError> {
        let acked: u64 = redis::cmd("XACK")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg(entry_id)
            .query(conn)
            .map_err(command_error("XACK"))?;
        if acked == 0 {
            return Err(WorkQueueError::UnknownReceipt(ReceiptHandle::new(entry_id)));
        }
        let _: u64 = redis::cmd("XDEL")
            .arg(&self.stream_key)
            .arg(entry_id)
            .query(conn)
            .map_err(command_error("XDEL"))?;
        Ok(())
    }

    /// Copy an entry to the dead-letter stream, then acknowledge and delete it.
    fn move_to_dlq(
        &self,
        conn: &mut redis::Connection,
        entry_id: &str,
        body: Option<&str>,
        reason: &str,
    ) -> Result<(), WorkQueueError> {
        let mut cmd = redis::cmd("XADD");
        cmd.arg(&self.dlq_key)
            .arg("*")
            .arg("original_entry_id")
            .arg(entry_id)
            .arg("reason")
            .arg(reason)
            .arg("failed_at")
            .arg(chrono::Utc::now().to_rfc3339());
        if let Some(body) = body {
            cmd.arg(BODY_FIELD).arg(body);
        }
        let _: String = cmd.query(conn).map_err(command_error("DLQ XADD"))?;

        self.ack_and_delete(conn, entry_id)
    }
}

fn receipt_handle(entry_id: &str, delivery: u64) -> ReceiptHandle {
    ReceiptHandle::new(format!("{entry_id}{HANDLE_SEPARATOR}{delivery}"))
}

fn parse_receipt_handle(handle: &ReceiptHandle) -> Option<(&str, u64)> {
    let (entry_id, delivery) = handle.as_str().rsplit_once(HANDLE_SEPARATOR)?;
    if entry_id.is_empty() {
        return None;
    }
    Some((entry_id, delivery.parse().ok()?))
}

impl WorkQueue for RedisStreamsWorkQueue {
    #[instrument(skip(self, body), fields(stream_key = %self.stream_key), err)]
    fn send(&self, body: &str) -> Result<(), WorkQueueError> {
        let mut conn = self.connection()?;
        let _: String = redis::cmd("XADD")
            .arg(&self.stream_key)
            .arg("*")
            .arg(BODY_FIELD)
            .arg(body)
            .query(&mut conn)
            .map_err(command_error("XADD"))?;
        Ok(())
    }

    fn receive(&self, max: usize, wait: Duration) -> Result<Vec<WorkQueueMessage>, WorkQueueError> {
        if max == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.connection()?;

        let mut messages = self.reclaim_expired(&mut conn, max)?;
        if messages.len() < max {
            // Do not block when reclaimed entries are already in hand.
            let wait = if messages.is_empty() { wait } else { Duration::ZERO };
            messages.extend(self.read_new(&mut conn, max - messages.len(), wait)?);
        }
        Ok(messages)
    }

    fn acknowledge(&self, handle: &ReceiptHandle) -> Result<(), WorkQueueError> {
        let mut conn = self.connection()?;
        let entry_id = self.current_entry(&mut conn, handle)?;
        self.ack_and_delete(&mut conn, entry_id)
    }

    fn dead_letter(&self, handle: &ReceiptHandle, reason: &str) -> Result<(), WorkQueueError> {
        let mut conn = self.connection()?;
        let entry_id = self.current_entry(&mut conn, handle)?;

        let entries: StreamRangeReply = redis::cmd("XRANGE")
            .arg(&self.stream_key)
            .arg(entry_id)
            .arg(entry_id)
            .query(&mut conn)
            .map_err(command_error("XRANGE"))?;
        let body: Option<String> = entries.ids.first().and_then(|entry| entry.get(BODY_FIELD));

        self.move_to_dlq(&mut conn, entry_id, body.as_deref(), reason)?;
        warn!(receipt_handle = %handle, reason, "message sent to dead-letter stream");
        Ok(())
    }

    fn visibility(&self) -> Result<QueueVisibility, WorkQueueError> {
        let mut conn = self.connection()?;
        let total: u64 = redis::cmd("XLEN")
            .arg(&self.stream_key)
            .query(&mut conn)
            .map_err(command_error("XLEN"))?;
        // Summary form: [count, smallest id, largest id, per-consumer counts].
        let (pending, _, _, _): (u64, Option<String>, Option<String>, redis::Value) = redis::cmd("XPENDING")
            .arg(&self.stream_key)
            .arg(&self.group)
            .query(&mut conn)
            .map_err(command_error("XPENDING"))?;

        let visible = total.saturating_sub(pending);
        Ok(QueueVisibility::new(
            u32::try_from(visible).unwrap_or(u32::MAX),
            u32::try_from(pending).unwrap_or(u32::MAX),
        ))
    }
}

/// Hands enriched payloads to execution units through a Redis stream.
#[derive(Debug, Clone)]
pub struct RedisStreamsLauncher {
    client: Arc<redis::Client>,
    stream_key: String,
}

impl RedisStreamsLauncher {
    pub fn new(redis_url: impl AsRef<str>, stream_key: Option<String>) -> Result<Self, LaunchError> {
        let client =
            redis::Client::open(redis_url.as_ref()).map_err(|e| LaunchError::Unavailable(e.to_string()))?;
        Ok(Self {
            client: Arc::new(client),
            stream_key: stream_key.unwrap_or_else(|| DEFAULT_EXECUTIONS_KEY.to_string()),
        })
    }
}

impl ExecutionLauncher for RedisStreamsLauncher {
    #[instrument(skip(self, payload), fields(stream_key = %self.stream_key, fingerprint = ?payload.fingerprint()), err)]
    fn launch(&self, payload: &TaskPayload) -> Result<(), LaunchError> {
        let mut conn = self
            .client
            .get_connection()
            .map_err(|e| LaunchError::Unavailable(e.to_string()))?;

        let _: String = redis::cmd("XADD")
            .arg(&self.stream_key)
            .arg("*")
            .arg("payload")
            .arg(payload.to_json_string())
            .query(&mut conn)
            .map_err(|e| LaunchError::Rejected(format!("XADD failed: {e}")))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A queue on a fresh stream, or `None` when `LAKEPURGE_TEST_REDIS_URL` is unset.
    fn redis_or_skip() -> Option<(RedisStreamsWorkQueue, redis::Connection)> {
        let Ok(url) = std::env::var("LAKEPURGE_TEST_REDIS_URL") else {
            eprintln!("Skipping Redis test (LAKEPURGE_TEST_REDIS_URL not set)");
            return None;
        };
        let stream = format!("lakepurge:test:{}", uuid::Uuid::new_v4().simple());
        let queue = RedisStreamsWorkQueue::new(&url, Some(stream), "test-consumer")
            .expect("open redis queue")
            .with_visibility_timeout(Duration::from_millis(50));
        let conn = queue.connection().expect("redis connection");
        Some((queue, conn))
    }

    #[test]
    fn receipt_handles_carry_the_delivery_count() {
        let handle = receipt_handle("1700000000000-0", 3);
        assert_eq!(handle.as_str(), "1700000000000-0/3");
        assert_eq!(parse_receipt_handle(&handle), Some(("1700000000000-0", 3)));

        assert_eq!(parse_receipt_handle(&ReceiptHandle::new("1700000000000-0")), None);
        assert_eq!(parse_receipt_handle(&ReceiptHandle::new("/2")), None);
        assert_eq!(parse_receipt_handle(&ReceiptHandle::new("1-0/x")), None);
    }

    #[test]
    fn entry_without_body_is_dead_lettered_and_frees_capacity() {
        let Some((queue, mut conn)) = redis_or_skip() else {
            return;
        };
        let _: String = redis::cmd("XADD")
            .arg(&queue.stream_key)
            .arg("*")
            .arg("other")
            .arg("x")
            .query(&mut conn)
            .unwrap();
        queue.send(r#"{"QueryId":"q1"}"#).unwrap();

        let messages = queue.receive(10, Duration::ZERO).unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(queue.visibility().unwrap(), QueueVisibility::new(0, 1));

        let dead: u64 = redis::cmd("XLEN").arg(&queue.dlq_key).query(&mut conn).unwrap();
        assert_eq!(dead, 1);
    }

    #[test]
    fn expired_delivery_cannot_acknowledge_the_redelivery() {
        let Some((queue, _conn)) = redis_or_skip() else {
            return;
        };
        queue.send(r#"{"QueryId":"q1"}"#).unwrap();

        let first = queue.receive(1, Duration::ZERO).unwrap().remove(0);
        std::thread::sleep(Duration::from_millis(100));
        let second = queue.receive(1, Duration::ZERO).unwrap().remove(0);
        assert_eq!(first.body, second.body);
        assert_ne!(first.receipt_handle, second.receipt_handle);

        let err = queue.acknowledge(&first.receipt_handle).unwrap_err();
        assert!(matches!(err, WorkQueueError::UnknownReceipt(_)));
        queue.acknowledge(&second.receipt_handle).unwrap();
        assert_eq!(queue.visibility().unwrap(), QueueVisibility::new(0, 0));
    }
}
