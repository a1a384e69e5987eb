//! Capability checks for ticket commands.
//!
//! Every command asks exactly one question: may this actor exercise this
//! capability, given whether they own the ticket involved?

use civic_types::Role;
use serde::Serialize;

use crate::error::ServiceError;

/// An authenticated caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Actor {
    pub id: String,
    pub role: Role,
}

impl Actor {
    pub fn new(id: impl Into<String>, role: Role) -> Self {
        Self {
            id: id.into(),
            role,
        }
    }

    pub fn is_staff_or_admin(&self) -> bool {
        self.role.is_staff_or_admin()
    }
}

/// Things an actor may try to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    CreateTicket,
    ViewTicket,
    /// List every ticket rather than only one's own.
    ListAllTickets,
    TransitionStatus,
    AssignTicket,
    Comment,
    CommentInternal,
    Rate,
    Escalate,
    /// Delete a ticket that is still open.
    DeleteOpenTicket,
    /// Delete a ticket in any status.
    DeleteAnyTicket,
    BulkUpdate,
    BulkDelete,
}

impl Capability {
    fn describe(self) -> &'static str {
        match self {
            Self::CreateTicket => "create tickets",
            Self::ViewTicket => "view this ticket",
            Self::ListAllTickets => "list all tickets",
            Self::TransitionStatus => "change ticket status",
            Self::AssignTicket => "assign tickets",
            Self::Comment => "comment on this ticket",
            Self::CommentInternal => "post internal comments",
            Self::Rate => "rate this ticket",
            Self::Escalate => "escalate this ticket",
            Self::DeleteOpenTicket | Self::DeleteAnyTicket => "delete this ticket",
            Self::BulkUpdate => "run bulk updates",
            Self::BulkDelete => "run bulk deletes",
        }
    }
}

/// Decides whether `actor` holds `capability`.
///
/// `owns` is whether the actor reported the ticket in question; it is
/// ignored for capabilities that are not about one ticket.
pub fn allows(capability: Capability, actor: &Actor, owns: bool) -> bool {
    let staff = actor.is_staff_or_admin();
    match capability {
        Capability::CreateTicket => true,
        Capability::ViewTicket | Capability::Comment | Capability::Escalate => owns || staff,
        Capability::ListAllTickets
        | Capability::TransitionStatus
        | Capability::AssignTicket
        | Capability::CommentInternal
        | Capability::DeleteAnyTicket
        | Capability::BulkUpdate => staff,
        Capability::Rate => owns,
        Capability::DeleteOpenTicket => owns || staff,
        Capability::BulkDelete => actor.role == Role::Admin,
    }
}

/// Like [`allows`], but as a `Forbidden` error.
///
/// # Errors
///
/// Returns `ServiceError::Forbidden` when the capability is not held.
pub fn authorize(capability: Capability, actor: &Actor, owns: bool) -> Result<(), ServiceError> {
    if allows(capability, actor, owns) {
        Ok(())
    } else {
        tracing::debug!(
            actor_id = %actor.id,
            role = %actor.role,
            ?capability,
            "capability denied"
        );
        Err(ServiceError::Forbidden(format!(
            "{} may not {}",
            actor.role,
            capability.describe()
        )))
    }
}
