//! Append-only audit trail.
//!
//! Every state-affecting operation on a ticket writes exactly one row to
//! `ticket_history` in the same transaction as the mutation it records. Rows
//! are never updated (a trigger rejects it) and only disappear when the
//! owning ticket is hard-deleted.
//!
//! There is no cross-ticket query surface here; a ticket's history is read
//! back as part of the aggregate.

use civic_types::{now_timestamp, ParseLabelError, TicketStatus};
use rusqlite::{params, Connection, Row, Transaction};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// What happened to the ticket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Created,
    StatusChanged,
    Assigned,
    CommentAdded,
    InternalCommentAdded,
    Rated,
    Escalated,
}

impl AuditAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::StatusChanged => "status_changed",
            Self::Assigned => "assigned",
            Self::CommentAdded => "comment_added",
            Self::InternalCommentAdded => "internal_comment_added",
            Self::Rated => "rated",
            Self::Escalated => "escalated",
        }
    }
}

impl std::fmt::Display for AuditAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AuditAction {
    type Err = ParseLabelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(Self::Created),
            "status_changed" => Ok(Self::StatusChanged),
            "assigned" => Ok(Self::Assigned),
            "comment_added" => Ok(Self::CommentAdded),
            "internal_comment_added" => Ok(Self::InternalCommentAdded),
            "rated" => Ok(Self::Rated),
            "escalated" => Ok(Self::Escalated),
            _ => Err(ParseLabelError {
                kind: "audit action",
                value: s.to_string(),
            }),
        }
    }
}

/// One immutable record of who did what, and when.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub action: AuditAction,
    pub performed_by: String,
    pub previous_status: Option<TicketStatus>,
    pub new_status: Option<TicketStatus>,
    pub notes: Option<String>,
    pub created_at: String,
}

/// An entry waiting to be appended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewAuditEntry {
    pub action: AuditAction,
    pub performed_by: String,
    pub previous_status: Option<TicketStatus>,
    pub new_status: Option<TicketStatus>,
    pub notes: Option<String>,
}

impl NewAuditEntry {
    pub fn new(action: AuditAction, performed_by: impl Into<String>) -> Self {
        Self {
            action,
            performed_by: performed_by.into(),
            previous_status: None,
            new_status: None,
            notes: None,
        }
    }

    pub fn with_notes(mut self, notes: Option<String>) -> Self {
        self.notes = notes;
        self
    }

    pub fn with_statuses(
        mut self,
        previous: Option<TicketStatus>,
        new: Option<TicketStatus>,
    ) -> Self {
        self.previous_status = previous;
        self.new_status = new;
        self
    }
}

/// Appends `entry` to the ticket's history.
///
/// Takes a [`Transaction`] so the entry can only be written together with
/// the mutation it describes.
///
/// # Errors
///
/// Returns `StoreError::Database` on SQL failure, including a missing ticket
/// (foreign key violation).
pub fn append(
    tx: &Transaction<'_>,
    ticket_id: &str,
    entry: NewAuditEntry,
) -> Result<AuditEntry, StoreError> {
    let created_at = now_timestamp();
    tx.execute(
        "INSERT INTO ticket_history (
            ticket_id, action, performed_by, previous_status, new_status, notes, created_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            ticket_id,
            entry.action.as_str(),
            entry.performed_by,
            entry.previous_status.map(TicketStatus::as_str),
            entry.new_status.map(TicketStatus::as_str),
            entry.notes,
            created_at,
        ],
    )?;

    tracing::debug!(
        ticket_id = %ticket_id,
        action = entry.action.as_str(),
        performed_by = %entry.performed_by,
        "audit entry appended"
    );

    Ok(AuditEntry {
        action: entry.action,
        performed_by: entry.performed_by,
        previous_status: entry.previous_status,
        new_status: entry.new_status,
        notes: entry.notes,
        created_at,
    })
}

/// Loads a ticket's history in append order.
pub(crate) fn load_history(
    conn: &Connection,
    ticket_id: &str,
) -> Result<Vec<AuditEntry>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT action, performed_by, previous_status, new_status, notes, created_at
         FROM ticket_history WHERE ticket_id = ?1 ORDER BY seq ASC",
    )?;
    let rows = stmt.query_map([ticket_id], map_row_to_entry)?;
    let mut entries = Vec::new();
    for row in rows {
        entries.push(row?);
    }
    Ok(entries)
}

fn map_row_to_entry(row: &Row) -> rusqlite::Result<AuditEntry> {
    let action: String = row.get(0)?;
    let previous: Option<String> = row.get(2)?;
    let new: Option<String> = row.get(3)?;
    Ok(AuditEntry {
        action: parse_column(0, &action)?,
        performed_by: row.get(1)?,
        previous_status: previous.as_deref().map(|s| parse_column(2, s)).transpose()?,
        new_status: new.as_deref().map(|s| parse_column(3, s)).transpose()?,
        notes: row.get(4)?,
        created_at: row.get(5)?,
    })
}

/// Parses a text column into a label enum, reporting the column on failure.
pub(crate) fn parse_column<T>(idx: usize, value: &str) -> rusqlite::Result<T>
where
    T: std::str::FromStr<Err = ParseLabelError>,
{
    value.parse().map_err(|e: ParseLabelError| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}
