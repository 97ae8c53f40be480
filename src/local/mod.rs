//! In-process backend for tests and embedded use.
//!
//! Implements the same queue, notification and run-store contracts as the
//! Postgres backend, with all state behind one async mutex. Nothing is
//! durable across process restarts.
//!
//! Time comes from the tokio clock, so tests running with a paused runtime
//! can advance leases and retry delays deterministically.

mod queue;
mod store;

use chrono::{DateTime, TimeDelta, Utc};
use std::collections::{HashMap, HashSet};
use tokio::sync::{Mutex, broadcast};
use tokio::time::Instant;

use crate::error::{Error, Result};
use crate::model::{RegisteredDefinition, Run, RunId, StepTask, TaskId};
use crate::notify::{Notification, NotificationBus, Subscription};

const BUS_CAPACITY: usize = 1024;

/// Wall-clock time that advances with the tokio clock.
#[derive(Debug, Clone, Copy)]
struct Clock {
    base_utc: DateTime<Utc>,
    base: Instant,
}

impl Clock {
    fn new() -> Self {
        Self {
            base_utc: Utc::now(),
            base: Instant::now(),
        }
    }

    fn now(&self) -> DateTime<Utc> {
        let elapsed = TimeDelta::from_std(self.base.elapsed()).unwrap_or_default();
        self.base_utc + elapsed
    }
}

/// A stored message.
#[derive(Debug, Clone)]
struct Entry {
    read_ct: i32,
    enqueued_at: DateTime<Utc>,
    vt: DateTime<Utc>,
    message: serde_json::Value,
}

#[derive(Debug, Default)]
struct LocalQueue {
    next_id: i64,
    messages: std::collections::BTreeMap<i64, Entry>,
    archived: Vec<(i64, Entry)>,
}

#[derive(Debug, Default)]
struct State {
    queues: HashMap<String, LocalQueue>,
    definitions: Vec<RegisteredDefinition>,
    runs: HashMap<RunId, Run>,
    tasks: HashMap<TaskId, StepTask>,
    /// Task ids of each run in creation order.
    run_tasks: HashMap<RunId, Vec<TaskId>>,
}

/// In-memory implementation of [`crate::store::Backend`].
pub struct LocalBackend {
    state: Mutex<State>,
    bus: broadcast::Sender<Notification>,
    clock: Clock,
}

impl LocalBackend {
    pub fn new() -> Self {
        let (bus, _) = broadcast::channel(BUS_CAPACITY);
        Self {
            state: Mutex::new(State::default()),
            bus,
            clock: Clock::new(),
        }
    }

    fn publish(&self, channel: &str, payload: &str) {
        // No receivers is not an error: signals are fire-and-forget
        let _ = self.bus.send(Notification {
            channel: channel.to_string(),
            payload: payload.to_string(),
        });
    }
}

impl Default for LocalBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl NotificationBus for LocalBackend {
    async fn notify(&self, channel: &str, payload: &str) -> Result<()> {
        self.publish(channel, payload);
        Ok(())
    }

    async fn subscribe(&self) -> Result<Box<dyn Subscription>> {
        Ok(Box::new(LocalSubscription {
            rx: self.bus.subscribe(),
            channels: HashSet::new(),
        }))
    }
}

struct LocalSubscription {
    rx: broadcast::Receiver<Notification>,
    channels: HashSet<String>,
}

#[async_trait::async_trait]
impl Subscription for LocalSubscription {
    async fn listen(&mut self, channel: &str) -> Result<()> {
        self.channels.insert(channel.to_string());
        Ok(())
    }

    async fn unlisten(&mut self, channel: &str) -> Result<()> {
        self.channels.remove(channel);
        Ok(())
    }

    async fn recv(&mut self) -> Result<Notification> {
        loop {
            match self.rx.recv().await {
                Ok(n) if self.channels.contains(&n.channel) => return Ok(n),
                Ok(_) => continue,
                // Dropped signals are tolerated; pollers catch up
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "notification subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(Error::Other("notification bus closed".to_string()));
                }
            }
        }
    }
}
