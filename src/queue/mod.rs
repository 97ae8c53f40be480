//! Durable queue contract.
//!
//! Messages are opaque JSON. `read` claims messages under a lease: until the
//! lease expires a claimed message is invisible to every other reader. An
//! unacknowledged message becomes claimable again once its lease runs out,
//! so delivery is at-least-once and claiming is mutually exclusive.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;

use crate::error::{Error, Result};

/// Longest queue name the pgmq backend accepts.
pub const MAX_QUEUE_NAME_LEN: usize = 47;

/// Suffix of a queue's dead-letter twin.
pub const DEAD_LETTER_SUFFIX: &str = "_dlq";

/// A message read from a queue.
#[derive(Debug, Clone)]
pub struct QueueMessage {
    pub msg_id: i64,
    /// Times this message has been claimed, including this read.
    pub read_ct: i32,
    pub enqueued_at: DateTime<Utc>,
    /// Visibility time: the lease expiry of the current claim.
    pub vt: DateTime<Utc>,
    pub message: serde_json::Value,
}

/// Point-in-time queue depth. `total = in_flight + available + delayed`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub total: u64,
    /// Claimed with an unexpired lease.
    pub in_flight: u64,
    /// Visible and claimable now.
    pub available: u64,
    /// Never claimed and sent with a delay that has not yet passed.
    pub delayed: u64,
}

#[async_trait]
pub trait Queue: Send + Sync {
    /// Create a queue. Succeeds whether or not it already exists.
    async fn create_queue(&self, queue: &str) -> Result<()>;

    /// Append a message, visible after `delay`. Returns the message id.
    async fn send(&self, queue: &str, payload: &serde_json::Value, delay: Duration) -> Result<i64>;

    /// Claim up to `limit` visible messages for `lease`.
    async fn read(&self, queue: &str, lease: Duration, limit: usize) -> Result<Vec<QueueMessage>>;

    /// Like [`Queue::read`], but never lets more than `max_in_flight`
    /// messages of the queue be leased at once.
    async fn read_capped(
        &self,
        queue: &str,
        lease: Duration,
        limit: usize,
        max_in_flight: usize,
    ) -> Result<Vec<QueueMessage>>;

    /// Move a claimed message's lease expiry to `lease` from now. `None` if
    /// the message no longer exists.
    async fn set_lease(&self, queue: &str, msg_id: i64, lease: Duration) -> Result<Option<QueueMessage>>;

    /// Acknowledge a message permanently. Returns `false` if it was not found.
    async fn delete(&self, queue: &str, msg_id: i64) -> Result<bool>;

    /// Move a message to the queue's archive (kept for audit).
    async fn archive(&self, queue: &str, msg_id: i64) -> Result<bool>;

    /// Delete every message. Returns how many were removed.
    async fn purge(&self, queue: &str) -> Result<u64>;

    async fn stats(&self, queue: &str) -> Result<QueueStats>;

    /// Copy a message into `<queue>_dlq` annotated with `reason`, then
    /// delete it from `queue`.
    ///
    /// Copy happens first: a crash in between leaves a duplicate in the
    /// dead-letter queue, never a lost message.
    async fn move_to_dead_letter(
        &self,
        queue: &str,
        message: &QueueMessage,
        reason: &str,
    ) -> Result<i64> {
        let entry = dead_letter_entry(queue, message.msg_id, &message.message, reason);
        let dlq_id = self
            .send(&dead_letter_queue(queue), &entry, Duration::ZERO)
            .await?;
        self.delete(queue, message.msg_id).await?;
        Ok(dlq_id)
    }
}

/// Serialize and send a typed message.
///
/// # Errors
/// [`Error::Encoding`] if `message` cannot be represented as JSON.
pub async fn send_message<Q, M>(q: &Q, queue: &str, message: &M) -> Result<i64>
where
    Q: Queue + ?Sized,
    M: Serialize + ?Sized,
{
    let payload = serde_json::to_value(message)?;
    q.send(queue, &payload, Duration::ZERO).await
}

/// Queue carrying the tasks of one workflow step.
pub fn queue_name(workflow: &str, step: &str) -> String {
    let sanitize = |s: &str| -> String {
        s.chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_lowercase()
                } else {
                    '_'
                }
            })
            .collect()
    };
    format!("wf_{}_{}", sanitize(workflow), sanitize(step))
}

/// Dead-letter twin of a queue.
pub fn dead_letter_queue(queue: &str) -> String {
    format!("{queue}{DEAD_LETTER_SUFFIX}")
}

/// Body of a dead-letter message: the original payload plus where it came
/// from and why it was given up on.
pub fn dead_letter_entry(
    queue: &str,
    msg_id: i64,
    payload: &serde_json::Value,
    reason: &str,
) -> serde_json::Value {
    serde_json::json!({
        "dlq_reason": reason,
        "original_queue": queue,
        "original_id": msg_id,
        "payload": payload,
    })
}

/// Check that a queue name is usable, including its dead-letter twin.
///
/// Names are interpolated into table names by the pgmq backend, so only
/// lowercase alphanumerics and underscores are allowed.
pub fn validate_queue_name(queue: &str) -> Result<()> {
    if queue.is_empty() {
        return Err(Error::Validation("queue name is empty".to_string()));
    }
    if !queue
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
    {
        return Err(Error::Validation(format!(
            "queue name '{queue}' may only contain lowercase letters, digits and '_'"
        )));
    }
    let longest = if queue.ends_with(DEAD_LETTER_SUFFIX) {
        queue.len()
    } else {
        queue.len() + DEAD_LETTER_SUFFIX.len()
    };
    if longest > MAX_QUEUE_NAME_LEN {
        return Err(Error::Validation(format!(
            "queue name '{queue}' is too long (dead-letter twin must fit in {MAX_QUEUE_NAME_LEN} chars)"
        )));
    }
    Ok(())
}

/// Lease rounded up to whole seconds, as pgmq counts visibility.
pub(crate) fn whole_seconds(d: Duration) -> i32 {
    let secs = d.as_secs() + u64::from(d.subsec_nanos() > 0);
    secs.min(i32::MAX as u64) as i32
}
