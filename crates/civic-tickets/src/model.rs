//! Ticket aggregate and the value types written alongside it.

use civic_types::{Priority, TicketStatus};
use serde::{Deserialize, Serialize};

use crate::audit::{AuditAction, AuditEntry};

/// Maximum page size for [`crate::query`].
pub const MAX_PAGE_SIZE: u32 = 100;

/// Default page size when the caller does not specify one.
pub const DEFAULT_PAGE_SIZE: u32 = 20;

/// The complaint aggregate tracked through the state machine.
///
/// `comments` and `history` are owned by the ticket and only ever grow. They
/// are loaded in insertion order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ticket {
    pub id: String,
    /// The reporting user.
    pub owner_id: String,
    pub title: String,
    pub description: String,
    pub category: String,
    pub priority: Priority,
    pub status: TicketStatus,
    pub assignee_id: Option<String>,
    /// Resolution response shown to the resident.
    pub response: Option<String>,
    pub resolved_by: Option<String>,
    pub resolved_at: Option<String>,
    /// 1 to 5, set once by the owner while resolved.
    pub rating: Option<u8>,
    pub feedback: Option<String>,
    pub escalation_level: u32,
    pub comments: Vec<Comment>,
    pub history: Vec<AuditEntry>,
    pub created_at: String,
    pub updated_at: String,
}

impl Ticket {
    /// Whether `user_id` filed this ticket.
    pub fn is_owned_by(&self, user_id: &str) -> bool {
        self.owner_id == user_id
    }

    /// The view a resident gets: internal comments and the history entries
    /// that record them are removed.
    pub fn without_internal(mut self) -> Self {
        self.comments.retain(|c| !c.is_internal);
        self.history
            .retain(|e| e.action != AuditAction::InternalCommentAdded);
        self
    }
}

/// A message attached to a ticket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Comment {
    pub author_id: String,
    pub message: String,
    /// Internal comments are staff-only.
    pub is_internal: bool,
    pub created_at: String,
}

/// Fields supplied when filing a ticket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewTicket {
    pub owner_id: String,
    pub title: String,
    pub description: String,
    pub category: String,
    #[serde(default)]
    pub priority: Priority,
    pub assignee_id: Option<String>,
}

/// Field changes applied by [`crate::update`].
///
/// `None` leaves a column untouched. `escalate` bumps the escalation level by
/// one and forces the priority to high in the same statement.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TicketMutation {
    pub status: Option<TicketStatus>,
    pub priority: Option<Priority>,
    pub assignee_id: Option<String>,
    pub response: Option<String>,
    pub resolved_by: Option<String>,
    pub resolved_at: Option<String>,
    pub rating: Option<u8>,
    pub feedback: Option<String>,
    pub escalate: bool,
}

impl TicketMutation {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Filters for [`crate::query`]. Every set field must match.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TicketFilter {
    pub owner_id: Option<String>,
    pub assignee_id: Option<String>,
    pub status: Option<TicketStatus>,
    pub category: Option<String>,
    pub priority: Option<Priority>,
}

/// 1-based page selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    pub page: u32,
    pub limit: u32,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            page: 1,
            limit: DEFAULT_PAGE_SIZE,
        }
    }
}

impl Pagination {
    pub fn new(page: u32, limit: u32) -> Self {
        Self { page, limit }
    }

    /// Limit clamped to `1..=MAX_PAGE_SIZE`.
    pub fn effective_limit(self) -> u32 {
        self.limit.clamp(1, MAX_PAGE_SIZE)
    }

    pub fn offset(self) -> u64 {
        u64::from(self.page.max(1) - 1) * u64::from(self.effective_limit())
    }
}
