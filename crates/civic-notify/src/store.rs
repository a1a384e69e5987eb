//! Inbox persistence.
//!
//! Functions take a plain [`Connection`] so they can run either on their own
//! pooled connection or inside a caller's transaction (a `Transaction`
//! dereferences to `Connection`). Read, mark and delete are always scoped to
//! the recipient: another user's notification id behaves as if it did not
//! exist.

use civic_types::{now_timestamp, NotificationKind};
use rusqlite::{params, Connection, OptionalExtension, Row};
use uuid::Uuid;

use crate::error::NotifyError;
use crate::model::{NewNotification, Notification, RelatedEntity};

const NOTIFICATION_COLUMNS: &str =
    "id, recipient_id, title, message, kind, is_read, related_id, related_type, created_at";

/// Persists a notification as unread.
///
/// # Errors
///
/// Returns `NotifyError::Database` on SQL failure.
pub fn create(conn: &Connection, new: &NewNotification) -> Result<Notification, NotifyError> {
    let notification = Notification {
        id: Uuid::new_v4().to_string(),
        recipient_id: new.recipient_id.clone(),
        title: new.title.clone(),
        message: new.message.clone(),
        kind: new.kind,
        is_read: false,
        related_entity: new.related_entity.clone(),
        created_at: now_timestamp(),
    };

    conn.execute(
        "INSERT INTO notifications (
            id, recipient_id, title, message, kind, is_read, related_id, related_type, created_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6, ?7, ?8)",
        params![
            notification.id,
            notification.recipient_id,
            notification.title,
            notification.message,
            notification.kind.as_str(),
            notification.related_entity.as_ref().map(|r| r.id.as_str()),
            notification
                .related_entity
                .as_ref()
                .map(|r| r.entity_type.as_str()),
            notification.created_at,
        ],
    )?;

    tracing::debug!(
        notification_id = %notification.id,
        recipient_id = %notification.recipient_id,
        kind = notification.kind.as_str(),
        "notification stored"
    );
    Ok(notification)
}

/// Loads one of the recipient's notifications.
///
/// # Errors
///
/// Returns `NotifyError::NotFound` if the recipient has no such notification.
pub fn get(conn: &Connection, recipient_id: &str, id: &str) -> Result<Notification, NotifyError> {
    conn.query_row(
        &format!(
            "SELECT {NOTIFICATION_COLUMNS} FROM notifications
             WHERE id = ?1 AND recipient_id = ?2"
        ),
        params![id, recipient_id],
        map_row_to_notification,
    )
    .optional()?
    .ok_or_else(|| NotifyError::NotFound(id.to_string()))
}

/// Lists the recipient's notifications, newest first.
///
/// `is_read` narrows the list to read or unread entries.
///
/// # Errors
///
/// Returns `NotifyError::Database` on SQL failure.
pub fn list(
    conn: &Connection,
    recipient_id: &str,
    is_read: Option<bool>,
) -> Result<Vec<Notification>, NotifyError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {NOTIFICATION_COLUMNS} FROM notifications
         WHERE recipient_id = ?1 AND (?2 IS NULL OR is_read = ?2)
         ORDER BY created_at DESC, id ASC"
    ))?;
    let rows = stmt.query_map(params![recipient_id, is_read], map_row_to_notification)?;

    let mut notifications = Vec::new();
    for row in rows {
        notifications.push(row?);
    }
    Ok(notifications)
}

/// Marks one notification read. Marking an already-read entry is a no-op.
///
/// # Errors
///
/// Returns `NotifyError::NotFound` if the recipient has no such notification.
pub fn mark_read(conn: &Connection, recipient_id: &str, id: &str) -> Result<(), NotifyError> {
    let count = conn.execute(
        "UPDATE notifications SET is_read = 1 WHERE id = ?1 AND recipient_id = ?2",
        params![id, recipient_id],
    )?;
    if count == 0 {
        return Err(NotifyError::NotFound(id.to_string()));
    }
    Ok(())
}

/// Marks every unread notification of the recipient read.
///
/// Returns how many entries changed.
///
/// # Errors
///
/// Returns `NotifyError::Database` on SQL failure.
pub fn mark_all_read(conn: &Connection, recipient_id: &str) -> Result<usize, NotifyError> {
    let count = conn.execute(
        "UPDATE notifications SET is_read = 1 WHERE recipient_id = ?1 AND is_read = 0",
        [recipient_id],
    )?;
    Ok(count)
}

/// Deletes one of the recipient's notifications.
///
/// # Errors
///
/// Returns `NotifyError::NotFound` if the recipient has no such notification.
pub fn delete(conn: &Connection, recipient_id: &str, id: &str) -> Result<(), NotifyError> {
    let count = conn.execute(
        "DELETE FROM notifications WHERE id = ?1 AND recipient_id = ?2",
        params![id, recipient_id],
    )?;
    if count == 0 {
        return Err(NotifyError::NotFound(id.to_string()));
    }
    Ok(())
}

fn map_row_to_notification(row: &Row) -> rusqlite::Result<Notification> {
    let kind: String = row.get(4)?;
    let kind = kind.parse::<NotificationKind>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let related_id: Option<String> = row.get(6)?;
    let related_type: Option<String> = row.get(7)?;

    Ok(Notification {
        id: row.get(0)?,
        recipient_id: row.get(1)?,
        title: row.get(2)?,
        message: row.get(3)?,
        kind,
        is_read: row.get(5)?,
        related_entity: related_id.map(|id| RelatedEntity {
            id,
            entity_type: related_type.unwrap_or_else(|| "ticket".to_string()),
        }),
        created_at: row.get(8)?,
    })
}
