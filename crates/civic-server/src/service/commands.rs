//! Ticket commands: create, transition, assign, comment, rate, escalate,
//! delete.

use civic_identity::Identity;
use civic_notify::NewNotification;
use civic_tickets::{
    AuditAction, Comment, NewAuditEntry, NewComment, NewTicket, Ticket, TicketMutation,
};
use civic_types::{now_timestamp, NotificationKind, Role, TicketStatus};
use rusqlite::Transaction;

use super::{
    optional_text, require_text, NewTicketRequest, Outcome, ServiceInner, TicketService,
    TransitionCommand, MAX_CATEGORY_LEN, MAX_DESCRIPTION_LEN, MAX_MESSAGE_LEN, MAX_NOTES_LEN,
    MAX_TITLE_LEN,
};
use crate::authz::{authorize, Actor, Capability};
use crate::error::{ServiceError, TransitionConflict};
use crate::events;

impl TicketService {
    /// Files a new ticket in `pending`.
    ///
    /// The assignment policy picks an assignee from the current staff. The
    /// owner gets a confirmation, the assignee a notification, and the staff
    /// topic a `ticket:new` event.
    ///
    /// # Errors
    ///
    /// Returns `Validation` for empty or oversized fields.
    pub async fn create_ticket(
        &self,
        actor: &Actor,
        request: NewTicketRequest,
    ) -> Result<Ticket, ServiceError> {
        authorize(Capability::CreateTicket, actor, true)?;
        let mut new_ticket = NewTicket {
            owner_id: actor.id.clone(),
            title: require_text("title", &request.title, MAX_TITLE_LEN)?,
            description: require_text("description", &request.description, MAX_DESCRIPTION_LEN)?,
            category: require_text("category", &request.category, MAX_CATEGORY_LEN)?,
            priority: request.priority.unwrap_or_default(),
            assignee_id: None,
        };

        let candidates = self.lookup(|store| store.find_by_role(Role::Staff)).await?;
        new_ticket.assignee_id = self
            .inner
            .policy
            .select_assignee(&new_ticket.category, &candidates);

        let outcome = self
            .write(move |tx, inner| {
                let entry = NewAuditEntry::new(AuditAction::Created, &new_ticket.owner_id)
                    .with_notes(
                        new_ticket
                            .assignee_id
                            .as_ref()
                            .map(|id| format!("auto-assigned to {id}")),
                    );
                let ticket = civic_tickets::create(tx, &new_ticket, entry)?;

                let mut stored = inner.notify_each(tx, [ticket.owner_id.clone()], "", |to| {
                    NewNotification::new(
                        to,
                        "Ticket submitted",
                        format!("Your ticket \"{}\" has been received.", ticket.title),
                        NotificationKind::Success,
                    )
                    .about_ticket(&ticket.id)
                })?;
                stored.extend(inner.notify_each(
                    tx,
                    ticket.assignee_id.clone(),
                    &ticket.owner_id,
                    |to| {
                        NewNotification::new(
                            to,
                            "New ticket assigned",
                            format!("You have been assigned \"{}\".", ticket.title),
                            NotificationKind::Info,
                        )
                        .about_ticket(&ticket.id)
                    },
                )?);

                let events = events::ticket_new(&ticket);
                Ok(Outcome::new(ticket)
                    .with_notifications(stored)
                    .with_events(events))
            })
            .await?;

        tracing::info!(
            ticket_id = %outcome.value.id,
            owner_id = %outcome.value.owner_id,
            category = %outcome.value.category,
            assignee_id = outcome.value.assignee_id.as_deref().unwrap_or("<none>"),
            "ticket created"
        );
        Ok(self.finish(outcome).await)
    }

    /// Moves a ticket along the status graph.
    ///
    /// Entering `resolved` or `closed` records who resolved it and when, and
    /// the notes become the resolution response.
    ///
    /// # Errors
    ///
    /// Returns `Forbidden` for residents, `NotFound`, and
    /// `InvalidTransition` for unreachable targets or a stale
    /// `expected_status`.
    pub async fn transition(
        &self,
        actor: &Actor,
        command: TransitionCommand,
    ) -> Result<Ticket, ServiceError> {
        authorize(Capability::TransitionStatus, actor, false)?;
        self.apply_transition(actor, command).await
    }

    /// Transition without the capability check. Callers have authorized.
    pub(super) async fn apply_transition(
        &self,
        actor: &Actor,
        command: TransitionCommand,
    ) -> Result<Ticket, ServiceError> {
        let notes = optional_text("notes", command.notes, MAX_NOTES_LEN)?;
        let actor_id = actor.id.clone();
        let ticket_id = command.ticket_id;
        let target = command.target;
        let expected = command.expected_status;

        let outcome = self
            .write(move |tx, inner| {
                let current = civic_tickets::get(tx, &ticket_id)?;

                let mut mutation = TicketMutation {
                    status: Some(target),
                    ..Default::default()
                };
                if target.records_resolution() {
                    mutation.resolved_by = Some(actor_id.clone());
                    mutation.resolved_at = Some(now_timestamp());
                    mutation.response = notes.clone();
                }

                let entry = NewAuditEntry::new(AuditAction::StatusChanged, &actor_id)
                    .with_notes(notes.clone());
                let ticket = civic_tickets::update(tx, &ticket_id, &mutation, expected, entry)?;

                let kind = match target {
                    TicketStatus::Resolved => NotificationKind::Success,
                    _ => NotificationKind::Info,
                };
                let stored = inner.notify_each(tx, [ticket.owner_id.clone()], &actor_id, |to| {
                    NewNotification::new(
                        to,
                        "Ticket status updated",
                        format!("Your ticket \"{}\" is now {}.", ticket.title, ticket.status),
                        kind,
                    )
                    .about_ticket(&ticket.id)
                })?;

                let events =
                    events::status_changed(&ticket, current.status, &actor_id, notes.as_deref());
                Ok(Outcome::new((current.status, ticket))
                    .with_notifications(stored)
                    .with_events(events))
            })
            .await?;

        let (previous, ticket) = &outcome.value;
        tracing::info!(
            ticket_id = %ticket.id,
            actor_id = %actor.id,
            from = %previous,
            to = %ticket.status,
            "ticket status changed"
        );
        Ok(self.finish(outcome).await.1)
    }

    /// Hands a ticket to a specific staff member, bypassing the policy.
    ///
    /// # Errors
    ///
    /// Returns `Forbidden` for residents, `NotFound`, `InvalidAssignee` when
    /// `staff_id` is not a verified staff account, and `InvalidTransition`
    /// for closed tickets.
    pub async fn assign(
        &self,
        actor: &Actor,
        ticket_id: &str,
        staff_id: &str,
    ) -> Result<Ticket, ServiceError> {
        authorize(Capability::AssignTicket, actor, false)?;
        self.apply_assign(actor, ticket_id, staff_id).await
    }

    pub(super) async fn apply_assign(
        &self,
        actor: &Actor,
        ticket_id: &str,
        staff_id: &str,
    ) -> Result<Ticket, ServiceError> {
        let actor_id = actor.id.clone();
        let ticket_id = ticket_id.to_string();
        let staff_id = staff_id.trim().to_string();
        let lookup_id = staff_id.clone();
        let identity = self
            .lookup(move |store| store.find_by_id(&lookup_id))
            .await?;
        // Reported only after the ticket checks, so a missing or closed
        // ticket still wins over a bad assignee.
        let assignee_check = check_assignee(&staff_id, identity);

        let outcome = self
            .write(move |tx, inner| {
                let current = civic_tickets::get(tx, &ticket_id)?;
                if current.status.is_terminal() {
                    return Err(ServiceError::InvalidTransition(
                        TransitionConflict::RequiresStatus {
                            required: "an unclosed ticket",
                            actual: current.status,
                        },
                    ));
                }
                assignee_check?;

                let notes = match &current.assignee_id {
                    Some(previous) => format!("reassigned from {previous} to {staff_id}"),
                    None => format!("assigned to {staff_id}"),
                };
                let mutation = TicketMutation {
                    assignee_id: Some(staff_id.clone()),
                    ..Default::default()
                };
                let entry =
                    NewAuditEntry::new(AuditAction::Assigned, &actor_id).with_notes(Some(notes));
                let ticket = civic_tickets::update(tx, &ticket_id, &mutation, None, entry)?;

                let mut stored = inner.notify_each(tx, [staff_id.clone()], &actor_id, |to| {
                    NewNotification::new(
                        to,
                        "Ticket assigned to you",
                        format!("You have been assigned \"{}\".", ticket.title),
                        NotificationKind::Info,
                    )
                    .about_ticket(&ticket.id)
                })?;
                stored.extend(inner.notify_each(
                    tx,
                    [ticket.owner_id.clone()],
                    &actor_id,
                    |to| {
                        NewNotification::new(
                            to,
                            "Ticket assigned",
                            format!("A staff member is now handling \"{}\".", ticket.title),
                            NotificationKind::Info,
                        )
                        .about_ticket(&ticket.id)
                    },
                )?);

                let events = events::ticket_assigned(&ticket, &staff_id, &actor_id);
                Ok(Outcome::new(ticket)
                    .with_notifications(stored)
                    .with_events(events))
            })
            .await?;

        tracing::info!(
            ticket_id = %outcome.value.id,
            actor_id = %actor.id,
            assignee_id = outcome.value.assignee_id.as_deref().unwrap_or("<none>"),
            "ticket assigned"
        );
        Ok(self.finish(outcome).await)
    }

    /// Appends a comment.
    ///
    /// Public comments notify the owner and the assignee, except whichever of
    /// them wrote it. Internal comments are staff-only: they notify only the
    /// assignee and are published only on the staff topic.
    ///
    /// # Errors
    ///
    /// Returns `Validation` for an empty message, `NotFound`, and
    /// `Forbidden` when a resident comments on someone else's ticket or
    /// posts an internal comment.
    pub async fn add_comment(
        &self,
        actor: &Actor,
        ticket_id: &str,
        message: &str,
        is_internal: bool,
    ) -> Result<Comment, ServiceError> {
        let message = require_text("message", message, MAX_MESSAGE_LEN)?;
        let actor = actor.clone();
        let ticket_id = ticket_id.to_string();

        let outcome = self
            .write(move |tx, inner| {
                let current = civic_tickets::get(tx, &ticket_id)?;
                let capability = if is_internal {
                    Capability::CommentInternal
                } else {
                    Capability::Comment
                };
                authorize(capability, &actor, current.is_owned_by(&actor.id))?;

                let action = if is_internal {
                    AuditAction::InternalCommentAdded
                } else {
                    AuditAction::CommentAdded
                };
                let comment = civic_tickets::add_comment(
                    tx,
                    &ticket_id,
                    NewComment {
                        author_id: actor.id.clone(),
                        message,
                        is_internal,
                    },
                    NewAuditEntry::new(action, &actor.id),
                )?;

                let recipients: Vec<String> = if is_internal {
                    current.assignee_id.clone().into_iter().collect()
                } else {
                    std::iter::once(current.owner_id.clone())
                        .chain(current.assignee_id.clone())
                        .collect()
                };
                let title = if is_internal {
                    "New internal note"
                } else {
                    "New comment"
                };
                let stored = inner.notify_each(tx, recipients, &actor.id, |to| {
                    NewNotification::new(
                        to,
                        title,
                        format!("{} commented on \"{}\".", actor.id, current.title),
                        NotificationKind::Info,
                    )
                    .about_ticket(&current.id)
                })?;

                let events = events::comment_added(&current, &comment);
                Ok(Outcome::new(comment)
                    .with_notifications(stored)
                    .with_events(events))
            })
            .await?;

        tracing::info!(
            author_id = %outcome.value.author_id,
            internal = outcome.value.is_internal,
            "comment added"
        );
        Ok(self.finish(outcome).await)
    }

    /// Records the owner's satisfaction rating on a resolved ticket.
    ///
    /// # Errors
    ///
    /// Returns `Validation` for a rating outside 1 to 5 or a second rating,
    /// `Forbidden` for anyone but the owner, and `InvalidTransition` unless
    /// the ticket is resolved.
    pub async fn rate(
        &self,
        actor: &Actor,
        ticket_id: &str,
        rating: u8,
        feedback: Option<String>,
    ) -> Result<Ticket, ServiceError> {
        if !(1..=5).contains(&rating) {
            return Err(ServiceError::Validation(format!(
                "rating must be between 1 and 5, got {rating}"
            )));
        }
        let feedback = optional_text("feedback", feedback, MAX_NOTES_LEN)?;
        let caller = actor.clone();
        let ticket_id = ticket_id.to_string();

        let outcome = self
            .write(move |tx, inner| {
                let current = civic_tickets::get(tx, &ticket_id)?;
                authorize(Capability::Rate, &caller, current.is_owned_by(&caller.id))?;
                if current.status != TicketStatus::Resolved {
                    return Err(ServiceError::InvalidTransition(
                        TransitionConflict::RequiresStatus {
                            required: "resolved",
                            actual: current.status,
                        },
                    ));
                }
                if current.rating.is_some() {
                    return Err(ServiceError::Validation(
                        "ticket has already been rated".to_string(),
                    ));
                }

                let mutation = TicketMutation {
                    rating: Some(rating),
                    feedback,
                    ..Default::default()
                };
                let entry = NewAuditEntry::new(AuditAction::Rated, &caller.id)
                    .with_notes(Some(format!("rated {rating}/5")));
                let ticket = civic_tickets::update(
                    tx,
                    &ticket_id,
                    &mutation,
                    Some(TicketStatus::Resolved),
                    entry,
                )?;

                let stored = inner.notify_each(tx, ticket.assignee_id.clone(), &caller.id, |to| {
                    NewNotification::new(
                        to,
                        "Ticket rated",
                        format!("\"{}\" was rated {rating}/5.", ticket.title),
                        NotificationKind::Info,
                    )
                    .about_ticket(&ticket.id)
                })?;

                let events = events::ticket_rated(&ticket);
                Ok(Outcome::new(ticket)
                    .with_notifications(stored)
                    .with_events(events))
            })
            .await?;

        tracing::info!(ticket_id = %outcome.value.id, rating, "ticket rated");
        let ticket = self.finish(outcome).await;
        Ok(super::visible_to(actor, ticket))
    }

    /// Raises a ticket's escalation level by one and forces high priority.
    ///
    /// Every admin account gets its own notification, including an admin
    /// who escalates. The status does not change.
    ///
    /// # Errors
    ///
    /// Returns `NotFound`, `Forbidden` when a resident escalates someone
    /// else's ticket, and `InvalidTransition` for resolved or closed tickets.
    pub async fn escalate(
        &self,
        actor: &Actor,
        ticket_id: &str,
        reason: Option<String>,
    ) -> Result<Ticket, ServiceError> {
        let reason = optional_text("reason", reason, MAX_NOTES_LEN)?;
        let caller = actor.clone();
        let ticket_id = ticket_id.to_string();
        let admins: Vec<String> = self
            .lookup(|store| store.find_by_role(Role::Admin))
            .await?
            .into_iter()
            .map(|admin| admin.id)
            .collect();

        let outcome = self
            .write(move |tx, inner| {
                let current = civic_tickets::get(tx, &ticket_id)?;
                authorize(Capability::Escalate, &caller, current.is_owned_by(&caller.id))?;
                if !current.status.is_open() {
                    return Err(ServiceError::InvalidTransition(
                        TransitionConflict::RequiresStatus {
                            required: "pending or in-progress",
                            actual: current.status,
                        },
                    ));
                }

                let mutation = TicketMutation {
                    escalate: true,
                    ..Default::default()
                };
                let entry = NewAuditEntry::new(AuditAction::Escalated, &caller.id)
                    .with_notes(reason.clone());
                let ticket =
                    civic_tickets::update(tx, &ticket_id, &mutation, Some(current.status), entry)?;

                // No exclusion: an escalating admin gets an entry as well.
                let stored = inner.notify_each(tx, admins, "", |to| {
                    NewNotification::new(
                        to,
                        "Ticket escalated",
                        format!(
                            "\"{}\" was escalated to level {}.",
                            ticket.title, ticket.escalation_level
                        ),
                        NotificationKind::Warning,
                    )
                    .about_ticket(&ticket.id)
                })?;

                let events = events::ticket_escalated(&ticket, &caller.id, reason.as_deref());
                Ok(Outcome::new(ticket)
                    .with_notifications(stored)
                    .with_events(events))
            })
            .await?;

        tracing::info!(
            ticket_id = %outcome.value.id,
            actor_id = %actor.id,
            level = outcome.value.escalation_level,
            "ticket escalated"
        );
        let ticket = self.finish(outcome).await;
        Ok(super::visible_to(actor, ticket))
    }

    /// Hard-deletes a ticket with its comments and history.
    ///
    /// Owners may delete while the ticket is pending or in progress; staff
    /// and admins may delete at any status.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` or `Forbidden`.
    pub async fn delete_ticket(&self, actor: &Actor, ticket_id: &str) -> Result<(), ServiceError> {
        let actor = actor.clone();
        let ticket_id = ticket_id.to_string();

        let outcome = self
            .write(move |tx, inner| {
                let current = civic_tickets::get(tx, &ticket_id)?;
                let capability = if current.status.is_open() {
                    Capability::DeleteOpenTicket
                } else {
                    Capability::DeleteAnyTicket
                };
                authorize(capability, &actor, current.is_owned_by(&actor.id))?;
                remove_ticket(tx, inner, &current, &actor.id)
            })
            .await?;

        tracing::info!(ticket_id = %outcome.value, "ticket deleted");
        self.finish(outcome).await;
        Ok(())
    }
}

/// Confirms the account found for `staff_id` is verified staff.
fn check_assignee(staff_id: &str, identity: Option<Identity>) -> Result<(), ServiceError> {
    match identity {
        Some(identity) if identity.is_assignable_staff() => Ok(()),
        Some(identity) if identity.role != Role::Staff => Err(ServiceError::InvalidAssignee(
            format!("{staff_id} is not a staff account (role {})", identity.role),
        )),
        Some(_) => Err(ServiceError::InvalidAssignee(format!(
            "{staff_id} is not verified"
        ))),
        None => Err(ServiceError::InvalidAssignee(format!(
            "{staff_id} does not exist"
        ))),
    }
}

/// Deletes `ticket` and tells its owner, unless the owner did it.
pub(super) fn remove_ticket(
    tx: &Transaction<'_>,
    inner: &ServiceInner,
    ticket: &Ticket,
    actor_id: &str,
) -> Result<Outcome<String>, ServiceError> {
    civic_tickets::delete(tx, &ticket.id)?;
    let stored = inner.notify_each(tx, [ticket.owner_id.clone()], actor_id, |to| {
        NewNotification::new(
            to,
            "Ticket removed",
            format!("Your ticket \"{}\" was removed.", ticket.title),
            NotificationKind::Warning,
        )
        .about_ticket(&ticket.id)
    })?;
    Ok(Outcome::new(ticket.id.clone())
        .with_notifications(stored)
        .with_events(events::ticket_deleted(ticket, actor_id)))
}
