//! Persistence operations for the ticket aggregate.
//!
//! Every write takes a [`Transaction`] and the [`NewAuditEntry`] describing
//! it, and appends that entry before returning. A caller therefore cannot
//! persist a field change without its history row, and the two commit or
//! roll back together.

use civic_types::{now_timestamp, Priority, TicketStatus};
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};
use uuid::Uuid;

use crate::audit::{self, parse_column, NewAuditEntry};
use crate::error::StoreError;
use crate::model::{Comment, NewTicket, Pagination, Ticket, TicketFilter, TicketMutation};

const TICKET_COLUMNS: &str = "id, owner_id, title, description, category, priority, status,
    assignee_id, response, resolved_by, resolved_at, rating, feedback, escalation_level,
    created_at, updated_at";

/// Inserts a new ticket in `pending` and records its creation.
///
/// The audit entry's `new_status` is filled in as `pending` when the caller
/// leaves it empty.
///
/// # Errors
///
/// Returns `StoreError::Database` on SQL failure.
pub fn create(
    tx: &Transaction<'_>,
    ticket: &NewTicket,
    mut entry: NewAuditEntry,
) -> Result<Ticket, StoreError> {
    let id = Uuid::new_v4().to_string();
    let now = now_timestamp();

    tx.execute(
        "INSERT INTO tickets (
            id, owner_id, title, description, category, priority, status,
            assignee_id, escalation_level, created_at, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0, ?9, ?9)",
        params![
            id,
            ticket.owner_id,
            ticket.title,
            ticket.description,
            ticket.category,
            ticket.priority.as_str(),
            TicketStatus::Pending.as_str(),
            ticket.assignee_id,
            now,
        ],
    )?;

    if entry.new_status.is_none() {
        entry.new_status = Some(TicketStatus::Pending);
    }
    audit::append(tx, &id, entry)?;

    get(tx, &id)
}

/// Loads a ticket with its comments and history.
///
/// # Errors
///
/// Returns `StoreError::NotFound` if no ticket has this id.
pub fn get(conn: &Connection, id: &str) -> Result<Ticket, StoreError> {
    let ticket = conn
        .query_row(
            &format!("SELECT {TICKET_COLUMNS} FROM tickets WHERE id = ?1"),
            [id],
            map_row_to_ticket,
        )
        .optional()?
        .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
    hydrate(conn, ticket)
}

/// Returns the stored status without loading the aggregate.
///
/// # Errors
///
/// Returns `StoreError::NotFound` if no ticket has this id.
pub fn current_status(conn: &Connection, id: &str) -> Result<TicketStatus, StoreError> {
    let label: String = conn
        .query_row("SELECT status FROM tickets WHERE id = ?1", [id], |row| {
            row.get(0)
        })
        .optional()?
        .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
    Ok(parse_column(0, &label)?)
}

/// Applies `mutation` to a ticket and appends `entry` in the same transaction.
///
/// When `expected_status` is given and differs from the stored status the
/// write is refused with `StoreError::StaleStatus`, which callers can treat
/// as a retryable conflict. The aggregate's invariants are checked against
/// the stored row before anything is written:
///
/// - a status change must follow the transition graph;
/// - a rating must be 1 to 5, may only be set once, and only while resolved;
/// - escalation always leaves the priority at high.
///
/// # Errors
///
/// Returns `StoreError::NotFound`, `StaleStatus`, `IllegalTransition`,
/// `Invariant`, or `Database`.
pub fn update(
    tx: &Transaction<'_>,
    id: &str,
    mutation: &TicketMutation,
    expected_status: Option<TicketStatus>,
    mut entry: NewAuditEntry,
) -> Result<Ticket, StoreError> {
    let current = get(tx, id)?;

    if let Some(expected) = expected_status {
        if expected != current.status {
            return Err(StoreError::StaleStatus {
                ticket_id: id.to_string(),
                expected,
                actual: current.status,
            });
        }
    }

    check_invariants(&current, mutation)?;

    let mut set_parts: Vec<String> = Vec::new();
    let mut values: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

    let mut push = |column: &str, value: Box<dyn rusqlite::types::ToSql>| {
        values.push(value);
        set_parts.push(format!("{column} = ?{}", values.len()));
    };

    if let Some(status) = mutation.status {
        push("status", Box::new(status.as_str()));
    }
    if mutation.escalate {
        push("priority", Box::new(Priority::High.as_str()));
    } else if let Some(priority) = mutation.priority {
        push("priority", Box::new(priority.as_str()));
    }
    if let Some(assignee) = &mutation.assignee_id {
        push("assignee_id", Box::new(assignee.clone()));
    }
    if let Some(response) = &mutation.response {
        push("response", Box::new(response.clone()));
    }
    if let Some(resolved_by) = &mutation.resolved_by {
        push("resolved_by", Box::new(resolved_by.clone()));
    }
    if let Some(resolved_at) = &mutation.resolved_at {
        push("resolved_at", Box::new(resolved_at.clone()));
    }
    if let Some(rating) = mutation.rating {
        push("rating", Box::new(rating));
    }
    if let Some(feedback) = &mutation.feedback {
        push("feedback", Box::new(feedback.clone()));
    }
    push("updated_at", Box::new(now_timestamp()));

    if mutation.escalate {
        set_parts.push("escalation_level = escalation_level + 1".to_string());
    }

    // Guard on the status we validated against, so a write that slipped in
    // between the read and this statement is reported instead of clobbered.
    values.push(Box::new(id.to_string()));
    let id_idx = values.len();
    values.push(Box::new(current.status.as_str()));
    let status_idx = values.len();

    let sql = format!(
        "UPDATE tickets SET {} WHERE id = ?{id_idx} AND status = ?{status_idx}",
        set_parts.join(", ")
    );
    let params: Vec<&dyn rusqlite::types::ToSql> = values.iter().map(|v| v.as_ref()).collect();
    let count = tx.execute(&sql, params.as_slice())?;
    if count == 0 {
        let actual = current_status(tx, id)?;
        return Err(StoreError::StaleStatus {
            ticket_id: id.to_string(),
            expected: current.status,
            actual,
        });
    }

    if let Some(status) = mutation.status {
        entry.previous_status.get_or_insert(current.status);
        entry.new_status.get_or_insert(status);
    }
    audit::append(tx, id, entry)?;

    get(tx, id)
}

fn check_invariants(current: &Ticket, mutation: &TicketMutation) -> Result<(), StoreError> {
    if mutation.is_empty() {
        return Err(StoreError::Invariant("mutation changes nothing".to_string()));
    }

    if let Some(to) = mutation.status {
        if !current.status.can_transition_to(to) {
            return Err(StoreError::IllegalTransition {
                from: current.status,
                to,
            });
        }
    }

    if let Some(rating) = mutation.rating {
        if !(1..=5).contains(&rating) {
            return Err(StoreError::Invariant(format!(
                "rating {rating} is outside 1..=5"
            )));
        }
        if current.rating.is_some() {
            return Err(StoreError::Invariant("ticket is already rated".to_string()));
        }
        let status_after = mutation.status.unwrap_or(current.status);
        if status_after != TicketStatus::Resolved {
            return Err(StoreError::Invariant(format!(
                "rating requires a resolved ticket, found {status_after}"
            )));
        }
    }

    if mutation.escalate && matches!(mutation.priority, Some(p) if p != Priority::High) {
        return Err(StoreError::Invariant(
            "escalation forces high priority".to_string(),
        ));
    }

    Ok(())
}

/// A comment waiting to be appended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewComment {
    pub author_id: String,
    pub message: String,
    pub is_internal: bool,
}

/// Appends a comment and its audit entry.
///
/// # Errors
///
/// Returns `StoreError::NotFound` if the ticket does not exist.
pub fn add_comment(
    tx: &Transaction<'_>,
    ticket_id: &str,
    comment: NewComment,
    entry: NewAuditEntry,
) -> Result<Comment, StoreError> {
    let now = now_timestamp();
    let touched = tx.execute(
        "UPDATE tickets SET updated_at = ?1 WHERE id = ?2",
        params![now, ticket_id],
    )?;
    if touched == 0 {
        return Err(StoreError::NotFound(ticket_id.to_string()));
    }

    tx.execute(
        "INSERT INTO ticket_comments (ticket_id, author_id, message, is_internal, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            ticket_id,
            comment.author_id,
            comment.message,
            comment.is_internal,
            now
        ],
    )?;
    audit::append(tx, ticket_id, entry)?;

    Ok(Comment {
        author_id: comment.author_id,
        message: comment.message,
        is_internal: comment.is_internal,
        created_at: now,
    })
}

/// Hard-deletes a ticket. Comments and history cascade.
///
/// # Errors
///
/// Returns `StoreError::NotFound` if the ticket does not exist.
pub fn delete(conn: &Connection, id: &str) -> Result<(), StoreError> {
    let count = conn.execute("DELETE FROM tickets WHERE id = ?1", [id])?;
    if count == 0 {
        return Err(StoreError::NotFound(id.to_string()));
    }
    Ok(())
}

/// Lists tickets matching `filter`, newest first.
///
/// # Errors
///
/// Returns `StoreError::Database` on SQL failure.
pub fn query(
    conn: &Connection,
    filter: &TicketFilter,
    page: Pagination,
) -> Result<Vec<Ticket>, StoreError> {
    let (where_clause, mut values) = filter_clause(filter);
    values.push(Box::new(i64::from(page.effective_limit())));
    let limit_idx = values.len();
    values.push(Box::new(i64::try_from(page.offset()).unwrap_or(i64::MAX)));
    let offset_idx = values.len();

    let sql = format!(
        "SELECT {TICKET_COLUMNS} FROM tickets {where_clause}
         ORDER BY created_at DESC, id ASC
         LIMIT ?{limit_idx} OFFSET ?{offset_idx}"
    );
    let params: Vec<&dyn rusqlite::types::ToSql> = values.iter().map(|v| v.as_ref()).collect();

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params.as_slice(), map_row_to_ticket)?;
    let mut tickets = Vec::new();
    for row in rows {
        tickets.push(row?);
    }
    drop(stmt);

    tickets
        .into_iter()
        .map(|ticket| hydrate(conn, ticket))
        .collect()
}

/// Counts tickets matching `filter`.
///
/// # Errors
///
/// Returns `StoreError::Database` on SQL failure.
pub fn count(conn: &Connection, filter: &TicketFilter) -> Result<u64, StoreError> {
    let (where_clause, values) = filter_clause(filter);
    let params: Vec<&dyn rusqlite::types::ToSql> = values.iter().map(|v| v.as_ref()).collect();
    let n: i64 = conn.query_row(
        &format!("SELECT COUNT(*) FROM tickets {where_clause}"),
        params.as_slice(),
        |row| row.get(0),
    )?;
    Ok(u64::try_from(n).unwrap_or(0))
}

fn filter_clause(filter: &TicketFilter) -> (String, Vec<Box<dyn rusqlite::types::ToSql>>) {
    let mut clauses: Vec<String> = Vec::new();
    let mut values: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

    let mut push = |column: &str, value: Box<dyn rusqlite::types::ToSql>| {
        values.push(value);
        clauses.push(format!("{column} = ?{}", values.len()));
    };

    if let Some(owner) = &filter.owner_id {
        push("owner_id", Box::new(owner.clone()));
    }
    if let Some(assignee) = &filter.assignee_id {
        push("assignee_id", Box::new(assignee.clone()));
    }
    if let Some(status) = filter.status {
        push("status", Box::new(status.as_str()));
    }
    if let Some(category) = &filter.category {
        push("category", Box::new(category.clone()));
    }
    if let Some(priority) = filter.priority {
        push("priority", Box::new(priority.as_str()));
    }

    let where_clause = if clauses.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", clauses.join(" AND "))
    };
    (where_clause, values)
}

fn hydrate(conn: &Connection, mut ticket: Ticket) -> Result<Ticket, StoreError> {
    ticket.comments = load_comments(conn, &ticket.id)?;
    ticket.history = audit::load_history(conn, &ticket.id)?;
    Ok(ticket)
}

fn load_comments(conn: &Connection, ticket_id: &str) -> Result<Vec<Comment>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT author_id, message, is_internal, created_at
         FROM ticket_comments WHERE ticket_id = ?1 ORDER BY seq ASC",
    )?;
    let rows = stmt.query_map([ticket_id], |row| {
        Ok(Comment {
            author_id: row.get(0)?,
            message: row.get(1)?,
            is_internal: row.get(2)?,
            created_at: row.get(3)?,
        })
    })?;
    let mut comments = Vec::new();
    for row in rows {
        comments.push(row?);
    }
    Ok(comments)
}

fn map_row_to_ticket(row: &Row) -> rusqlite::Result<Ticket> {
    let priority: String = row.get(5)?;
    let status: String = row.get(6)?;
    Ok(Ticket {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        title: row.get(2)?,
        description: row.get(3)?,
        category: row.get(4)?,
        priority: parse_column(5, &priority)?,
        status: parse_column(6, &status)?,
        assignee_id: row.get(7)?,
        response: row.get(8)?,
        resolved_by: row.get(9)?,
        resolved_at: row.get(10)?,
        rating: row.get(11)?,
        feedback: row.get(12)?,
        escalation_level: row.get(13)?,
        comments: Vec::new(),
        history: Vec::new(),
        created_at: row.get(14)?,
        updated_at: row.get(15)?,
    })
}
