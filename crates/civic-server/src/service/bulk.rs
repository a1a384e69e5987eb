//! Batch commands.
//!
//! Each ticket in a batch is its own unit of work with its own transaction,
//! audit entry and notifications. One ticket failing never rolls back
//! another; the summary says what happened to each.

use civic_types::TicketStatus;
use serde::Serialize;

use super::commands::remove_ticket;
use super::{TicketService, TransitionCommand};
use crate::authz::{authorize, Actor, Capability};
use crate::error::{ServiceError, TransitionConflict};

/// Per-batch result.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkSummary {
    /// Distinct ids that named an existing ticket.
    pub matched: usize,
    /// Tickets the operation actually changed.
    pub modified: usize,
    pub failures: Vec<BulkFailure>,
}

/// Why one ticket in a batch was skipped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkFailure {
    pub ticket_id: String,
    pub reason: String,
    pub retryable: bool,
}

impl BulkSummary {
    fn record<T>(&mut self, ticket_id: &str, result: Result<T, ServiceError>) {
        match result {
            Ok(_) => {
                self.matched += 1;
                self.modified += 1;
            }
            Err(e) => {
                if !matches!(e, ServiceError::NotFound { .. }) {
                    self.matched += 1;
                }
                tracing::debug!(ticket_id, "bulk item skipped: {}", e);
                self.failures.push(BulkFailure {
                    ticket_id: ticket_id.to_string(),
                    reason: e.to_string(),
                    retryable: e.is_retryable(),
                });
            }
        }
    }
}

/// Drops repeated ids, keeping first-seen order.
fn distinct(ticket_ids: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    ticket_ids
        .into_iter()
        .filter(|id| seen.insert(id.clone()))
        .collect()
}

impl TicketService {
    /// Moves every listed ticket to `target`.
    ///
    /// # Errors
    ///
    /// Returns `Forbidden` for residents. Per-ticket failures are reported in
    /// the summary.
    pub async fn bulk_transition(
        &self,
        actor: &Actor,
        ticket_ids: Vec<String>,
        target: TicketStatus,
        notes: Option<String>,
    ) -> Result<BulkSummary, ServiceError> {
        authorize(Capability::BulkUpdate, actor, false)?;

        let mut summary = BulkSummary::default();
        for ticket_id in distinct(ticket_ids) {
            let result = self
                .apply_transition(
                    actor,
                    TransitionCommand {
                        ticket_id: ticket_id.clone(),
                        target,
                        notes: notes.clone(),
                        expected_status: None,
                    },
                )
                .await;
            summary.record(&ticket_id, result);
        }

        tracing::info!(
            actor_id = %actor.id,
            target_status = %target,
            matched = summary.matched,
            modified = summary.modified,
            "bulk transition finished"
        );
        Ok(summary)
    }

    /// Assigns every listed ticket to `staff_id`.
    ///
    /// # Errors
    ///
    /// Returns `Forbidden` for residents. Per-ticket failures, including an
    /// invalid assignee, are reported in the summary.
    pub async fn bulk_assign(
        &self,
        actor: &Actor,
        ticket_ids: Vec<String>,
        staff_id: &str,
    ) -> Result<BulkSummary, ServiceError> {
        authorize(Capability::BulkUpdate, actor, false)?;

        let mut summary = BulkSummary::default();
        for ticket_id in distinct(ticket_ids) {
            let result = self.apply_assign(actor, &ticket_id, staff_id).await;
            summary.record(&ticket_id, result);
        }

        tracing::info!(
            actor_id = %actor.id,
            staff_id,
            matched = summary.matched,
            modified = summary.modified,
            "bulk assign finished"
        );
        Ok(summary)
    }

    /// Deletes every listed ticket that is `pending` or `closed`.
    ///
    /// Tickets with active casework (in progress, or resolved and awaiting
    /// a rating) are skipped.
    ///
    /// # Errors
    ///
    /// Returns `Forbidden` for anyone but an admin.
    pub async fn bulk_delete(
        &self,
        actor: &Actor,
        ticket_ids: Vec<String>,
    ) -> Result<BulkSummary, ServiceError> {
        authorize(Capability::BulkDelete, actor, false)?;

        let mut summary = BulkSummary::default();
        for ticket_id in distinct(ticket_ids) {
            let actor_id = actor.id.clone();
            let id = ticket_id.clone();
            let result = self
                .write(move |tx, inner| {
                    let current = civic_tickets::get(tx, &id)?;
                    if !matches!(current.status, TicketStatus::Pending | TicketStatus::Closed) {
                        return Err(ServiceError::InvalidTransition(
                            TransitionConflict::RequiresStatus {
                                required: "pending or closed",
                                actual: current.status,
                            },
                        ));
                    }
                    remove_ticket(tx, inner, &current, &actor_id)
                })
                .await;

            let result = match result {
                Ok(outcome) => Ok(self.finish(outcome).await),
                Err(e) => Err(e),
            };
            summary.record(&ticket_id, result);
        }

        tracing::info!(
            actor_id = %actor.id,
            matched = summary.matched,
            modified = summary.modified,
            "bulk delete finished"
        );
        Ok(summary)
    }
}
