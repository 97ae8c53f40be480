//! pgmq queue operations via direct SQLx.
//!
//! Calls pgmq's SQL functions: pgmq.create, pgmq.send, pgmq.read,
//! pgmq.set_vt, pgmq.archive, pgmq.delete, pgmq.purge_queue. Claiming is
//! pgmq.read, a single `FOR UPDATE SKIP LOCKED` statement, so concurrent
//! readers never receive the same message while its visibility timeout
//! holds.

use async_trait::async_trait;
use opentelemetry::KeyValue;
use sqlx::PgConnection;
use std::time::Duration;

use crate::error::Result;
use crate::queue::{Queue, QueueMessage, QueueStats, validate_queue_name, whole_seconds};
use crate::telemetry::metrics;

type MessageRow = (
    i64,
    i32,
    chrono::DateTime<chrono::Utc>,
    chrono::DateTime<chrono::Utc>,
    serde_json::Value,
);

fn into_message((msg_id, read_ct, enqueued_at, vt, message): MessageRow) -> QueueMessage {
    QueueMessage {
        msg_id,
        read_ct,
        enqueued_at,
        vt,
        message,
    }
}

fn record(queue: &str, operation: &'static str) {
    metrics::queue_operations().add(
        1,
        &[
            KeyValue::new("queue", queue.to_string()),
            KeyValue::new("operation", operation),
        ],
    );
}

/// Send on an open connection or transaction.
pub(crate) async fn send_on(
    conn: &mut PgConnection,
    queue: &str,
    payload: &serde_json::Value,
    delay: Duration,
) -> Result<i64> {
    let row: (i64,) = sqlx::query_as("SELECT pgmq.send($1, $2, $3)")
        .bind(queue)
        .bind(payload)
        .bind(whole_seconds(delay))
        .fetch_one(conn)
        .await?;
    record(queue, "send");
    Ok(row.0)
}

/// Delete on an open connection or transaction.
pub(crate) async fn delete_on(conn: &mut PgConnection, queue: &str, msg_id: i64) -> Result<bool> {
    let row: (bool,) = sqlx::query_as("SELECT pgmq.delete($1, $2)")
        .bind(queue)
        .bind(msg_id)
        .fetch_one(conn)
        .await?;
    record(queue, "delete");
    Ok(row.0)
}

async fn read_on(
    conn: &mut PgConnection,
    queue: &str,
    lease: Duration,
    limit: usize,
) -> Result<Vec<QueueMessage>> {
    let rows: Vec<MessageRow> = sqlx::query_as(
        "SELECT msg_id, read_ct, enqueued_at, vt, message FROM pgmq.read($1, $2, $3)",
    )
    .bind(queue)
    .bind(whole_seconds(lease))
    .bind(limit.min(i32::MAX as usize) as i32)
    .fetch_all(conn)
    .await?;

    record(queue, if rows.is_empty() { "read_empty" } else { "read" });
    Ok(rows.into_iter().map(into_message).collect())
}

#[async_trait]
impl Queue for super::Db {
    /// Create a pgmq queue (idempotent).
    async fn create_queue(&self, queue: &str) -> Result<()> {
        validate_queue_name(queue)?;
        sqlx::query("SELECT pgmq.create($1)")
            .bind(queue)
            .execute(self.pool())
            .await?;
        record(queue, "create");
        Ok(())
    }

    async fn send(&self, queue: &str, payload: &serde_json::Value, delay: Duration) -> Result<i64> {
        let mut conn = self.pool().acquire().await?;
        send_on(&mut conn, queue, payload, delay).await
    }

    async fn read(&self, queue: &str, lease: Duration, limit: usize) -> Result<Vec<QueueMessage>> {
        let mut conn = self.pool().acquire().await?;
        read_on(&mut conn, queue, lease, limit).await
    }

    /// Serializes capped claims on one queue with a transaction-scoped
    /// advisory lock, then counts live leases before claiming.
    async fn read_capped(
        &self,
        queue: &str,
        lease: Duration,
        limit: usize,
        max_in_flight: usize,
    ) -> Result<Vec<QueueMessage>> {
        validate_queue_name(queue)?;
        let mut tx = self.pool().begin().await?;
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(queue)
            .execute(&mut *tx)
            .await?;

        // Name validated above; pgmq stores queue `x` in table pgmq.q_x
        let (leased,): (i64,) = sqlx::query_as(&format!(
            "SELECT count(*) FROM pgmq.q_{queue} WHERE vt > now() AND read_ct > 0"
        ))
        .fetch_one(&mut *tx)
        .await?;

        let room = max_in_flight.saturating_sub(leased.max(0) as usize);
        let take = limit.min(room);
        let messages = if take == 0 {
            record(queue, "read_capped");
            Vec::new()
        } else {
            read_on(&mut *tx, queue, lease, take).await?
        };
        tx.commit().await?;
        Ok(messages)
    }

    async fn set_lease(&self, queue: &str, msg_id: i64, lease: Duration) -> Result<Option<QueueMessage>> {
        let row: Option<MessageRow> = sqlx::query_as(
            "SELECT msg_id, read_ct, enqueued_at, vt, message FROM pgmq.set_vt($1, $2, $3)",
        )
        .bind(queue)
        .bind(msg_id)
        .bind(whole_seconds(lease))
        .fetch_optional(self.pool())
        .await?;
        record(queue, "set_vt");
        Ok(row.map(into_message))
    }

    /// Delete a message permanently.
    async fn delete(&self, queue: &str, msg_id: i64) -> Result<bool> {
        let mut conn = self.pool().acquire().await?;
        delete_on(&mut conn, queue, msg_id).await
    }

    /// Archive a message (moves to archive table, preserves for audit).
    async fn archive(&self, queue: &str, msg_id: i64) -> Result<bool> {
        let row: (bool,) = sqlx::query_as("SELECT pgmq.archive($1, $2)")
            .bind(queue)
            .bind(msg_id)
            .fetch_one(self.pool())
            .await?;
        record(queue, "archive");
        Ok(row.0)
    }

    async fn purge(&self, queue: &str) -> Result<u64> {
        let row: (i64,) = sqlx::query_as("SELECT pgmq.purge_queue($1)")
            .bind(queue)
            .fetch_one(self.pool())
            .await?;
        record(queue, "purge");
        Ok(row.0.max(0) as u64)
    }

    async fn stats(&self, queue: &str) -> Result<QueueStats> {
        validate_queue_name(queue)?;
        let (total, in_flight, available, delayed): (i64, i64, i64, i64) =
            sqlx::query_as(&format!(
                "SELECT count(*),
                        count(*) FILTER (WHERE vt > now() AND read_ct > 0),
                        count(*) FILTER (WHERE vt <= now()),
                        count(*) FILTER (WHERE vt > now() AND read_ct = 0)
                 FROM pgmq.q_{queue}"
            ))
            .fetch_one(self.pool())
            .await?;
        Ok(QueueStats {
            total: total.max(0) as u64,
            in_flight: in_flight.max(0) as u64,
            available: available.max(0) as u64,
            delayed: delayed.max(0) as u64,
        })
    }
}

impl super::Db {
    /// List messages without claiming them, oldest first. For operator
    /// inspection of dead-letter queues.
    pub async fn peek_queue(&self, queue: &str, limit: i64) -> Result<Vec<QueueMessage>> {
        validate_queue_name(queue)?;
        let rows: Vec<MessageRow> = sqlx::query_as(&format!(
            "SELECT msg_id, read_ct, enqueued_at, vt, message FROM pgmq.q_{queue}
             ORDER BY msg_id LIMIT $1"
        ))
        .bind(limit)
        .fetch_all(self.pool())
        .await?;
        Ok(rows.into_iter().map(into_message).collect())
    }
}
