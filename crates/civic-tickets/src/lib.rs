//! Ticket store and audit trail for the civic ticketing core.
//!
//! The ticket is the aggregate: it owns its ordered comments and its
//! append-only history. This crate is the only place that writes the
//! `tickets`, `ticket_comments` and `ticket_history` tables.
//!
//! # Atomicity
//!
//! Every write function takes a [`rusqlite::Transaction`] and the audit entry
//! that describes the write. The entry is appended inside the same
//! transaction, so a committed ticket always has a history that accounts for
//! its current fields, and a failed audit append rolls the mutation back.
//!
//! # Concurrency
//!
//! [`update`] accepts an optional expected status. A mismatch is reported as
//! [`StoreError::StaleStatus`], distinct from
//! [`StoreError::IllegalTransition`], so callers can retry conflicts without
//! mistaking them for invalid requests.

mod audit;
mod error;
mod model;
mod store;

pub use audit::{append as append_audit, AuditAction, AuditEntry, NewAuditEntry};
pub use error::StoreError;
pub use model::{
    Comment, NewTicket, Pagination, Ticket, TicketFilter, TicketMutation, DEFAULT_PAGE_SIZE,
    MAX_PAGE_SIZE,
};
pub use store::{
    add_comment, count, create, current_status, delete, get, query, update, NewComment,
};
