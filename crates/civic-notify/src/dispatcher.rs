//! Persist-then-push delivery.

use civic_db::DbPool;
use civic_hub::PubSubHub;
use civic_types::Topic;
use rusqlite::Connection;

use crate::error::NotifyError;
use crate::model::{NewNotification, Notification};
use crate::store;

/// Event name used for live notification pushes.
pub const NOTIFICATION_EVENT: &str = "notification:new";

/// Writes notifications to the inbox and pushes them to the recipient's
/// live connections.
///
/// The write can fail the caller; the push never does.
#[derive(Clone)]
pub struct NotificationDispatcher {
    hub: PubSubHub,
}

impl NotificationDispatcher {
    pub fn new(hub: PubSubHub) -> Self {
        Self { hub }
    }

    /// Stores a notification on `conn`.
    ///
    /// Pass a transaction to make the notification part of a larger unit of
    /// work; it is then only visible if that work commits. Call
    /// [`NotificationDispatcher::deliver`] after the commit.
    ///
    /// # Errors
    ///
    /// Returns `NotifyError::Database` on SQL failure.
    pub fn persist(
        &self,
        conn: &Connection,
        new: &NewNotification,
    ) -> Result<Notification, NotifyError> {
        store::create(conn, new)
    }

    /// Pushes a stored notification to `user:<recipient>`.
    ///
    /// Hub failures are logged and swallowed. Returns how many live
    /// connections accepted the push.
    pub async fn deliver(&self, notification: &Notification) -> usize {
        let topic = Topic::user(&notification.recipient_id);
        match self
            .hub
            .publish(&topic, NOTIFICATION_EVENT, notification)
            .await
        {
            Ok(delivered) => delivered,
            Err(e) => {
                tracing::warn!(
                    notification_id = %notification.id,
                    recipient_id = %notification.recipient_id,
                    "live notification push failed: {}",
                    e
                );
                0
            }
        }
    }

    /// Delivers a batch in order. See [`NotificationDispatcher::deliver`].
    pub async fn deliver_all(&self, notifications: &[Notification]) {
        for notification in notifications {
            self.deliver(notification).await;
        }
    }

    /// Persists a notification on its own pooled connection, then pushes it.
    ///
    /// # Errors
    ///
    /// Returns an error only if the notification could not be stored.
    pub async fn notify(
        &self,
        pool: &DbPool,
        new: NewNotification,
    ) -> Result<Notification, NotifyError> {
        let pool = pool.clone();
        let notification = tokio::task::spawn_blocking(move || {
            let conn = pool.get()?;
            store::create(&conn, &new)
        })
        .await
        .map_err(|e| NotifyError::Task(e.to_string()))??;

        self.deliver(&notification).await;
        Ok(notification)
    }
}
