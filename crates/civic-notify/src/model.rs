use civic_types::NotificationKind;
use serde::{Deserialize, Serialize};

/// The entity a notification points at, usually a ticket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelatedEntity {
    pub id: String,
    pub entity_type: String,
}

impl RelatedEntity {
    pub fn ticket(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            entity_type: "ticket".to_string(),
        }
    }
}

/// A stored inbox entry for one recipient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub id: String,
    pub recipient_id: String,
    pub title: String,
    pub message: String,
    pub kind: NotificationKind,
    pub is_read: bool,
    pub related_entity: Option<RelatedEntity>,
    pub created_at: String,
}

/// A notification waiting to be persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewNotification {
    pub recipient_id: String,
    pub title: String,
    pub message: String,
    pub kind: NotificationKind,
    pub related_entity: Option<RelatedEntity>,
}

impl NewNotification {
    pub fn new(
        recipient_id: impl Into<String>,
        title: impl Into<String>,
        message: impl Into<String>,
        kind: NotificationKind,
    ) -> Self {
        Self {
            recipient_id: recipient_id.into(),
            title: title.into(),
            message: message.into(),
            kind,
            related_entity: None,
        }
    }

    /// Points the notification at a ticket.
    pub fn about_ticket(mut self, ticket_id: impl Into<String>) -> Self {
        self.related_entity = Some(RelatedEntity::ticket(ticket_id));
        self
    }
}
