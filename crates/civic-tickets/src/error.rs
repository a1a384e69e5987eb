//! Error types for ticket persistence.

use civic_types::TicketStatus;

/// Errors that can occur during ticket store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A database operation failed.
    #[error("ticket database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// No ticket with this id exists.
    #[error("ticket not found: {0}")]
    NotFound(String),

    /// The caller's expected status no longer matches the stored one.
    ///
    /// Another writer got there first; re-read and retry.
    #[error("ticket {ticket_id} is {actual}, expected {expected}")]
    StaleStatus {
        ticket_id: String,
        expected: TicketStatus,
        actual: TicketStatus,
    },

    /// The requested status is not reachable from the current one.
    #[error("cannot move ticket from {from} to {to}")]
    IllegalTransition { from: TicketStatus, to: TicketStatus },

    /// The mutation would break a write-time invariant of the aggregate.
    #[error("ticket invariant violated: {0}")]
    Invariant(String),
}
