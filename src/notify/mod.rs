//! Notification bus: fire-and-forget wake-up signals.
//!
//! Signals are not persisted; a notification nobody is listening for is
//! lost. The bus gives latency, the queue gives correctness: workers block
//! on a subscription and still poll the queue on a bounded interval.

use async_trait::async_trait;
use std::time::Duration;

use crate::error::Result;
use crate::queue::Queue;

/// Prefix of every queue-derived channel name.
pub const CHANNEL_PREFIX: &str = "dagq";

/// A delivered signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub channel: String,
    pub payload: String,
}

#[async_trait]
pub trait NotificationBus: Send + Sync {
    /// Publish a signal. Succeeds even if nobody listens.
    async fn notify(&self, channel: &str, payload: &str) -> Result<()>;

    /// Open a subscription with no channels yet.
    async fn subscribe(&self) -> Result<Box<dyn Subscription>>;

    /// Open a subscription listening on `channel`.
    async fn listen(&self, channel: &str) -> Result<Box<dyn Subscription>> {
        let mut sub = self.subscribe().await?;
        sub.listen(channel).await?;
        Ok(sub)
    }
}

/// A live set of channel registrations. Dropping it unlistens everything.
#[async_trait]
pub trait Subscription: Send {
    async fn listen(&mut self, channel: &str) -> Result<()>;

    async fn unlisten(&mut self, channel: &str) -> Result<()>;

    /// Wait for the next signal on any listened channel.
    async fn recv(&mut self) -> Result<Notification>;
}

/// Channel that announces new messages on `queue`.
pub fn channel_for(queue: &str) -> String {
    format!("{CHANNEL_PREFIX}_{queue}")
}

/// Send a message, then wake listeners of the queue's channel.
///
/// A failed notify is logged and ignored: the message is durable and the
/// poll fallback will pick it up.
pub async fn send_with_notify<B>(backend: &B, queue: &str, payload: &serde_json::Value) -> Result<i64>
where
    B: Queue + NotificationBus + ?Sized,
{
    let msg_id = backend.send(queue, payload, Duration::ZERO).await?;
    if let Err(e) = backend.notify(&channel_for(queue), queue).await {
        tracing::warn!(queue, msg_id, "notify failed: {e}");
    }
    Ok(msg_id)
}
