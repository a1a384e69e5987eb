//! Live events published after a command commits.
//!
//! | Event | Topics |
//! |-------|--------|
//! | `ticket:new` | `role:staff-or-admin` |
//! | `status:changed` | `ticket:<id>`, `user:<owner>` |
//! | `ticket:assigned` | `user:<assignee>`, `ticket:<id>`, `user:<owner>` |
//! | `comment:added` | public: `ticket:<id>`, `user:<owner>`; internal: `role:staff-or-admin` |
//! | `ticket:rated` | `ticket:<id>`, `role:staff-or-admin` |
//! | `ticket:escalated` | `role:staff-or-admin`, `ticket:<id>` |
//! | `ticket:deleted` | `ticket:<id>`, `user:<owner>`, `role:staff-or-admin` |
//!
//! Stored notifications are pushed separately as `notification:new`.

use civic_tickets::{Comment, Ticket};
use civic_types::{TicketStatus, Topic};
use serde_json::{json, Value};

pub const TICKET_NEW: &str = "ticket:new";
pub const STATUS_CHANGED: &str = "status:changed";
pub const TICKET_ASSIGNED: &str = "ticket:assigned";
pub const COMMENT_ADDED: &str = "comment:added";
pub const TICKET_RATED: &str = "ticket:rated";
pub const TICKET_ESCALATED: &str = "ticket:escalated";
pub const TICKET_DELETED: &str = "ticket:deleted";

/// One publish to do once the transaction has committed.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Event {
    pub topic: Topic,
    pub name: &'static str,
    pub payload: Value,
}

impl Event {
    fn new(topic: Topic, name: &'static str, payload: Value) -> Self {
        Self {
            topic,
            name,
            payload,
        }
    }

    /// The same event on several topics.
    fn fan_out(topics: Vec<Topic>, name: &'static str, payload: Value) -> Vec<Self> {
        topics
            .into_iter()
            .map(|topic| Self::new(topic, name, payload.clone()))
            .collect()
    }
}

pub(crate) fn ticket_new(ticket: &Ticket) -> Vec<Event> {
    let mut events = vec![Event::new(
        Topic::StaffOrAdmin,
        TICKET_NEW,
        json!({ "ticket": ticket }),
    )];
    if let Some(assignee) = &ticket.assignee_id {
        events.push(Event::new(
            Topic::user(assignee),
            TICKET_ASSIGNED,
            assigned_payload(ticket, assignee, None),
        ));
    }
    events
}

pub(crate) fn status_changed(
    ticket: &Ticket,
    previous: TicketStatus,
    changed_by: &str,
    notes: Option<&str>,
) -> Vec<Event> {
    Event::fan_out(
        vec![Topic::ticket(&ticket.id), Topic::user(&ticket.owner_id)],
        STATUS_CHANGED,
        json!({
            "ticketId": ticket.id,
            "previousStatus": previous,
            "status": ticket.status,
            "changedBy": changed_by,
            "notes": notes,
            "updatedAt": ticket.updated_at,
        }),
    )
}

pub(crate) fn ticket_assigned(ticket: &Ticket, assignee: &str, assigned_by: &str) -> Vec<Event> {
    let mut topics = vec![Topic::user(assignee), Topic::ticket(&ticket.id)];
    if ticket.owner_id != assignee {
        topics.push(Topic::user(&ticket.owner_id));
    }
    Event::fan_out(
        topics,
        TICKET_ASSIGNED,
        assigned_payload(ticket, assignee, Some(assigned_by)),
    )
}

fn assigned_payload(ticket: &Ticket, assignee: &str, assigned_by: Option<&str>) -> Value {
    json!({
        "ticketId": ticket.id,
        "title": ticket.title,
        "assigneeId": assignee,
        "assignedBy": assigned_by,
    })
}

pub(crate) fn comment_added(ticket: &Ticket, comment: &Comment) -> Vec<Event> {
    let payload = json!({ "ticketId": ticket.id, "comment": comment });
    if comment.is_internal {
        vec![Event::new(Topic::StaffOrAdmin, COMMENT_ADDED, payload)]
    } else {
        Event::fan_out(
            vec![Topic::ticket(&ticket.id), Topic::user(&ticket.owner_id)],
            COMMENT_ADDED,
            payload,
        )
    }
}

pub(crate) fn ticket_rated(ticket: &Ticket) -> Vec<Event> {
    Event::fan_out(
        vec![Topic::ticket(&ticket.id), Topic::StaffOrAdmin],
        TICKET_RATED,
        json!({
            "ticketId": ticket.id,
            "rating": ticket.rating,
            "feedback": ticket.feedback,
        }),
    )
}

pub(crate) fn ticket_escalated(
    ticket: &Ticket,
    escalated_by: &str,
    reason: Option<&str>,
) -> Vec<Event> {
    Event::fan_out(
        vec![Topic::StaffOrAdmin, Topic::ticket(&ticket.id)],
        TICKET_ESCALATED,
        json!({
            "ticketId": ticket.id,
            "escalationLevel": ticket.escalation_level,
            "priority": ticket.priority,
            "escalatedBy": escalated_by,
            "reason": reason,
        }),
    )
}

pub(crate) fn ticket_deleted(ticket: &Ticket, deleted_by: &str) -> Vec<Event> {
    Event::fan_out(
        vec![
            Topic::ticket(&ticket.id),
            Topic::user(&ticket.owner_id),
            Topic::StaffOrAdmin,
        ],
        TICKET_DELETED,
        json!({ "ticketId": ticket.id, "deletedBy": deleted_by }),
    )
}
