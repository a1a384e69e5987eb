//! Notification inbox queries. Every call is scoped to the actor's own
//! notifications.

use civic_notify::Notification;

use super::TicketService;
use crate::authz::Actor;
use crate::error::ServiceError;

impl TicketService {
    /// The actor's notifications, newest first, optionally only read or
    /// only unread ones.
    ///
    /// # Errors
    ///
    /// Returns `Storage` on database failure.
    pub async fn get_notifications(
        &self,
        actor: &Actor,
        is_read: Option<bool>,
    ) -> Result<Vec<Notification>, ServiceError> {
        let recipient = actor.id.clone();
        self.read(move |conn| Ok(civic_notify::list(conn, &recipient, is_read)?))
            .await
    }

    /// # Errors
    ///
    /// Returns `NotFound` if the actor has no such notification.
    pub async fn mark_read(&self, actor: &Actor, notification_id: &str) -> Result<(), ServiceError> {
        let recipient = actor.id.clone();
        let id = notification_id.to_string();
        self.read(move |conn| Ok(civic_notify::mark_read(conn, &recipient, &id)?))
            .await
    }

    /// Returns how many notifications changed.
    ///
    /// # Errors
    ///
    /// Returns `Storage` on database failure.
    pub async fn mark_all_read(&self, actor: &Actor) -> Result<usize, ServiceError> {
        let recipient = actor.id.clone();
        let count = self
            .read(move |conn| Ok(civic_notify::mark_all_read(conn, &recipient)?))
            .await?;
        tracing::debug!(actor_id = %actor.id, count, "notifications marked read");
        Ok(count)
    }

    /// # Errors
    ///
    /// Returns `NotFound` if the actor has no such notification.
    pub async fn delete_notification(
        &self,
        actor: &Actor,
        notification_id: &str,
    ) -> Result<(), ServiceError> {
        let recipient = actor.id.clone();
        let id = notification_id.to_string();
        self.read(move |conn| Ok(civic_notify::delete(conn, &recipient, &id)?))
            .await
    }
}
