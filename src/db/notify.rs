//! LISTEN/NOTIFY notification bus.
//!
//! `pg_notify` is transactional: a notify issued inside a transaction is
//! delivered only on commit, so listeners never wake for a message that was
//! rolled back.

use async_trait::async_trait;
use sqlx::PgConnection;
use sqlx::postgres::PgListener;

use crate::error::Result;
use crate::notify::{Notification, NotificationBus, Subscription};

/// Notify on an open connection or transaction.
pub(crate) async fn notify_on(conn: &mut PgConnection, channel: &str, payload: &str) -> Result<()> {
    sqlx::query("SELECT pg_notify($1, $2)")
        .bind(channel)
        .bind(payload)
        .execute(conn)
        .await?;
    Ok(())
}

#[async_trait]
impl NotificationBus for super::Db {
    async fn notify(&self, channel: &str, payload: &str) -> Result<()> {
        let mut conn = self.pool().acquire().await?;
        notify_on(&mut conn, channel, payload).await
    }

    async fn subscribe(&self) -> Result<Box<dyn Subscription>> {
        let listener = PgListener::connect_with(self.pool()).await?;
        Ok(Box::new(PgSubscription { listener }))
    }
}

/// A dedicated listening connection.
struct PgSubscription {
    listener: PgListener,
}

#[async_trait]
impl Subscription for PgSubscription {
    async fn listen(&mut self, channel: &str) -> Result<()> {
        self.listener.listen(channel).await?;
        Ok(())
    }

    async fn unlisten(&mut self, channel: &str) -> Result<()> {
        self.listener.unlisten(channel).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<Notification> {
        let n = self.listener.recv().await?;
        Ok(Notification {
            channel: n.channel().to_string(),
            payload: n.payload().to_string(),
        })
    }
}
