//! Queue operations for the in-process backend.

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use std::time::Duration;

use super::{Entry, LocalBackend, LocalQueue, State};
use crate::error::{Error, Result};
use crate::queue::{Queue, QueueMessage, QueueStats, validate_queue_name};

fn delta(d: Duration) -> TimeDelta {
    TimeDelta::from_std(d).unwrap_or(TimeDelta::days(365 * 100))
}

fn to_message(msg_id: i64, entry: &Entry) -> QueueMessage {
    QueueMessage {
        msg_id,
        read_ct: entry.read_ct,
        enqueued_at: entry.enqueued_at,
        vt: entry.vt,
        message: entry.message.clone(),
    }
}

impl State {
    fn queue_mut(&mut self, queue: &str) -> Result<&mut LocalQueue> {
        self.queues
            .get_mut(queue)
            .ok_or_else(|| Error::NotFound(format!("queue {queue}")))
    }

    /// Append a message under an already-held lock.
    pub(super) fn send(
        &mut self,
        queue: &str,
        payload: &serde_json::Value,
        now: DateTime<Utc>,
        delay: Duration,
    ) -> Result<i64> {
        let q = self.queue_mut(queue)?;
        q.next_id += 1;
        let msg_id = q.next_id;
        q.messages.insert(
            msg_id,
            Entry {
                read_ct: 0,
                enqueued_at: now,
                vt: now + delta(delay),
                message: payload.clone(),
            },
        );
        Ok(msg_id)
    }

    pub(super) fn delete(&mut self, queue: &str, msg_id: i64) -> bool {
        self.queues
            .get_mut(queue)
            .is_some_and(|q| q.messages.remove(&msg_id).is_some())
    }

    fn read(
        &mut self,
        queue: &str,
        lease: Duration,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<QueueMessage>> {
        let q = self.queue_mut(queue)?;
        let vt = now + delta(lease);
        let mut claimed = Vec::new();
        for (msg_id, entry) in q.messages.iter_mut() {
            if claimed.len() >= limit {
                break;
            }
            if entry.vt <= now {
                entry.read_ct += 1;
                entry.vt = vt;
                claimed.push(to_message(*msg_id, entry));
            }
        }
        Ok(claimed)
    }

    fn in_flight(&self, queue: &str, now: DateTime<Utc>) -> usize {
        self.queues.get(queue).map_or(0, |q| {
            q.messages
                .values()
                .filter(|e| e.read_ct > 0 && e.vt > now)
                .count()
        })
    }
}

#[async_trait]
impl Queue for LocalBackend {
    async fn create_queue(&self, queue: &str) -> Result<()> {
        validate_queue_name(queue)?;
        let mut state = self.state.lock().await;
        state.queues.entry(queue.to_string()).or_default();
        Ok(())
    }

    async fn send(&self, queue: &str, payload: &serde_json::Value, delay: Duration) -> Result<i64> {
        let now = self.clock.now();
        self.state.lock().await.send(queue, payload, now, delay)
    }

    async fn read(&self, queue: &str, lease: Duration, limit: usize) -> Result<Vec<QueueMessage>> {
        let now = self.clock.now();
        self.state.lock().await.read(queue, lease, limit, now)
    }

    async fn read_capped(
        &self,
        queue: &str,
        lease: Duration,
        limit: usize,
        max_in_flight: usize,
    ) -> Result<Vec<QueueMessage>> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let room = max_in_flight.saturating_sub(state.in_flight(queue, now));
        if room == 0 {
            return Ok(Vec::new());
        }
        state.read(queue, lease, limit.min(room), now)
    }

    async fn set_lease(&self, queue: &str, msg_id: i64, lease: Duration) -> Result<Option<QueueMessage>> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let q = state.queue_mut(queue)?;
        Ok(q.messages.get_mut(&msg_id).map(|entry| {
            entry.vt = now + delta(lease);
            to_message(msg_id, entry)
        }))
    }

    async fn delete(&self, queue: &str, msg_id: i64) -> Result<bool> {
        Ok(self.state.lock().await.delete(queue, msg_id))
    }

    async fn archive(&self, queue: &str, msg_id: i64) -> Result<bool> {
        let mut state = self.state.lock().await;
        let q = state.queue_mut(queue)?;
        match q.messages.remove(&msg_id) {
            Some(entry) => {
                q.archived.push((msg_id, entry));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn purge(&self, queue: &str) -> Result<u64> {
        let mut state = self.state.lock().await;
        let q = state.queue_mut(queue)?;
        let removed = q.messages.len() as u64;
        q.messages.clear();
        Ok(removed)
    }

    async fn stats(&self, queue: &str) -> Result<QueueStats> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let q = state.queue_mut(queue)?;
        let mut stats = QueueStats {
            total: q.messages.len() as u64,
            ..QueueStats::default()
        };
        for entry in q.messages.values() {
            if entry.vt <= now {
                stats.available += 1;
            } else if entry.read_ct > 0 {
                stats.in_flight += 1;
            } else {
                stats.delayed += 1;
            }
        }
        Ok(stats)
    }
}

impl LocalBackend {
    /// Messages of `queue` without claiming them, oldest first.
    pub async fn peek_queue(&self, queue: &str) -> Result<Vec<QueueMessage>> {
        let mut state = self.state.lock().await;
        let q = state.queue_mut(queue)?;
        Ok(q
            .messages
            .iter()
            .map(|(msg_id, entry)| to_message(*msg_id, entry))
            .collect())
    }

    /// Messages moved to the archive of `queue`.
    pub async fn archived(&self, queue: &str) -> Result<Vec<QueueMessage>> {
        let mut state = self.state.lock().await;
        let q = state.queue_mut(queue)?;
        Ok(q
            .archived
            .iter()
            .map(|(msg_id, entry)| to_message(*msg_id, entry))
            .collect())
    }
}
