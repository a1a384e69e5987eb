//! The ticket state machine driver.
//!
//! [`TicketService`] turns authenticated commands into store writes. Each
//! command runs as one unit of work on its own pooled connection:
//!
//! 1. authorize the actor with a single capability check and resolve the
//!    identities the command needs;
//! 2. inside one `BEGIN IMMEDIATE` transaction, validate against the stored
//!    ticket, write the mutation with its audit entry, and persist every
//!    notification the command produces;
//! 3. after commit, publish live events and push the stored notifications.
//!
//! Step 2 either commits entirely or not at all, so a failed audit append or
//! notification insert fails the command. Step 3 is best-effort and never
//! changes the command's result.
//!
//! Identity lookups never run inside step 2. The SQLite identity store
//! draws from the same pool, and a transaction holding the write lock must
//! not wait on a second connection.

mod bulk;
mod commands;
mod inbox;

use std::sync::Arc;

use civic_db::DbPool;
use civic_hub::{ConnectionId, PubSubHub};
use civic_identity::{IdentityError, IdentityStore};
use civic_notify::{Notification, NotificationDispatcher};
use civic_tickets::{Pagination, Ticket, TicketFilter};
use civic_types::{Priority, TicketStatus, Topic};
use rusqlite::{Connection, Transaction, TransactionBehavior};
use serde::{Deserialize, Serialize};

use crate::assignment::AssignmentPolicy;
use crate::authz::{allows, authorize, Actor, Capability};
use crate::error::ServiceError;
use crate::events::Event;

pub use bulk::{BulkFailure, BulkSummary};

const MAX_TITLE_LEN: usize = 200;
const MAX_DESCRIPTION_LEN: usize = 5_000;
const MAX_CATEGORY_LEN: usize = 100;
const MAX_MESSAGE_LEN: usize = 5_000;
const MAX_NOTES_LEN: usize = 2_000;

/// Fields a caller supplies when filing a ticket.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewTicketRequest {
    pub title: String,
    pub description: String,
    pub category: String,
    #[serde(default)]
    pub priority: Option<Priority>,
}

/// A status change request.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransitionCommand {
    pub ticket_id: String,
    pub target: TicketStatus,
    #[serde(default)]
    pub notes: Option<String>,
    /// When set, the change only applies if the ticket is still in this
    /// status. A mismatch is a retryable conflict.
    #[serde(default)]
    pub expected_status: Option<TicketStatus>,
}

/// One page of a ticket listing.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TicketPage {
    pub tickets: Vec<Ticket>,
    pub total: u64,
    pub page: u32,
    pub limit: u32,
}

/// The committed result of a command plus the side effects to run after it.
pub(crate) struct Outcome<T> {
    value: T,
    notifications: Vec<Notification>,
    events: Vec<Event>,
}

impl<T> Outcome<T> {
    fn new(value: T) -> Self {
        Self {
            value,
            notifications: Vec::new(),
            events: Vec::new(),
        }
    }

    fn with_events(mut self, events: Vec<Event>) -> Self {
        self.events.extend(events);
        self
    }

    fn with_notifications(mut self, notifications: Vec<Notification>) -> Self {
        self.notifications.extend(notifications);
        self
    }
}

pub(crate) struct ServiceInner {
    pool: DbPool,
    identities: Arc<dyn IdentityStore>,
    policy: Arc<dyn AssignmentPolicy>,
    hub: PubSubHub,
    dispatcher: NotificationDispatcher,
}

/// Entry point for every ticket and inbox command.
///
/// Cheap to clone; clones share the pool, the hub and the collaborators.
#[derive(Clone)]
pub struct TicketService {
    inner: Arc<ServiceInner>,
}

impl TicketService {
    pub fn new(
        pool: DbPool,
        identities: Arc<dyn IdentityStore>,
        policy: Arc<dyn AssignmentPolicy>,
        hub: PubSubHub,
    ) -> Self {
        let dispatcher = NotificationDispatcher::new(hub.clone());
        Self {
            inner: Arc::new(ServiceInner {
                pool,
                identities,
                policy,
                hub,
                dispatcher,
            }),
        }
    }

    pub fn hub(&self) -> &PubSubHub {
        &self.inner.hub
    }

    pub fn identities(&self) -> Arc<dyn IdentityStore> {
        self.inner.identities.clone()
    }

    /// Resolves a caller once through the identity store.
    ///
    /// # Errors
    ///
    /// Returns `ServiceError::Unauthorized` for unknown or unverified ids.
    pub async fn authenticate(&self, user_id: &str) -> Result<Actor, ServiceError> {
        let id = user_id.to_string();
        let identity = self.lookup(move |store| store.find_by_id(&id)).await?;

        match identity {
            Some(identity) if identity.is_verified => Ok(Actor::new(identity.id, identity.role)),
            Some(_) => {
                tracing::debug!(user_id, "rejecting unverified identity");
                Err(ServiceError::Unauthorized)
            }
            None => Err(ServiceError::Unauthorized),
        }
    }

    /// Loads a ticket the actor may see.
    ///
    /// Residents get the view without internal comments.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` or `Forbidden`.
    pub async fn get_ticket(&self, actor: &Actor, ticket_id: &str) -> Result<Ticket, ServiceError> {
        let id = ticket_id.to_string();
        let ticket = self
            .read(move |conn| Ok(civic_tickets::get(conn, &id)?))
            .await?;
        authorize(
            Capability::ViewTicket,
            actor,
            ticket.is_owned_by(&actor.id),
        )?;
        Ok(visible_to(actor, ticket))
    }

    /// Lists tickets, newest first.
    ///
    /// Callers without the list-all capability only ever see their own
    /// tickets, whatever owner filter they pass.
    ///
    /// # Errors
    ///
    /// Returns `Storage` on database failure.
    pub async fn list_tickets(
        &self,
        actor: &Actor,
        mut filter: TicketFilter,
        page: Pagination,
    ) -> Result<TicketPage, ServiceError> {
        if !allows(Capability::ListAllTickets, actor, false) {
            filter.owner_id = Some(actor.id.clone());
        }

        let (tickets, total) = self
            .read(move |conn| {
                let tickets = civic_tickets::query(conn, &filter, page)?;
                let total = civic_tickets::count(conn, &filter)?;
                Ok((tickets, total))
            })
            .await?;

        Ok(TicketPage {
            tickets: tickets
                .into_iter()
                .map(|ticket| visible_to(actor, ticket))
                .collect(),
            total,
            page: page.page.max(1),
            limit: page.effective_limit(),
        })
    }

    /// Joins a live connection to `ticket:<id>` after a visibility check.
    ///
    /// # Errors
    ///
    /// Returns `NotFound`, `Forbidden`, or `Storage` if the hub refuses.
    pub async fn subscribe_ticket(
        &self,
        actor: &Actor,
        connection: ConnectionId,
        ticket_id: &str,
    ) -> Result<(), ServiceError> {
        self.get_ticket(actor, ticket_id).await?;
        self.inner
            .hub
            .join(connection, Topic::ticket(ticket_id))
            .await
            .map_err(|e| ServiceError::Storage(e.to_string()))
    }

    /// Leaves `ticket:<id>`. Leaving a topic never joined is not an error.
    ///
    /// # Errors
    ///
    /// Returns `Storage` if the connection is no longer live.
    pub async fn unsubscribe_ticket(
        &self,
        connection: ConnectionId,
        ticket_id: &str,
    ) -> Result<(), ServiceError> {
        self.inner
            .hub
            .leave(connection, &Topic::ticket(ticket_id))
            .await
            .map(|_| ())
            .map_err(|e| ServiceError::Storage(e.to_string()))
    }

    /// Runs `f` on a pooled connection off the async runtime.
    async fn read<T, F>(&self, f: F) -> Result<T, ServiceError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, ServiceError> + Send + 'static,
    {
        let pool = self.inner.pool.clone();
        tokio::task::spawn_blocking(move || {
            let conn = pool.get()?;
            f(&conn)
        })
        .await?
    }

    /// Runs an identity query off the async runtime, outside any transaction.
    async fn lookup<T, F>(&self, f: F) -> Result<T, ServiceError>
    where
        T: Send + 'static,
        F: FnOnce(&dyn IdentityStore) -> Result<T, IdentityError> + Send + 'static,
    {
        let identities = self.inner.identities.clone();
        Ok(tokio::task::spawn_blocking(move || f(identities.as_ref())).await??)
    }

    /// Runs `f` inside one immediate transaction and commits on success.
    ///
    /// Immediate mode takes the write lock up front, so two writers on the
    /// same ticket are ordered by SQLite rather than failing at commit.
    async fn write<T, F>(&self, f: F) -> Result<Outcome<T>, ServiceError>
    where
        T: Send + 'static,
        F: FnOnce(&Transaction<'_>, &ServiceInner) -> Result<Outcome<T>, ServiceError>
            + Send
            + 'static,
    {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = inner.pool.get()?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let outcome = f(&tx, inner.as_ref())?;
            tx.commit()?;
            Ok(outcome)
        })
        .await?
    }

    /// Publishes the outcome's events and pushes its notifications.
    ///
    /// Only called after commit. Failures are logged, never returned.
    async fn finish<T>(&self, outcome: Outcome<T>) -> T {
        for event in &outcome.events {
            if let Err(e) = self
                .inner
                .hub
                .publish(&event.topic, event.name, &event.payload)
                .await
            {
                tracing::warn!(
                    topic = %event.topic,
                    event = event.name,
                    "live publish failed: {}",
                    e
                );
            }
        }
        self.inner
            .dispatcher
            .deliver_all(&outcome.notifications)
            .await;
        outcome.value
    }
}

impl ServiceInner {
    /// Stores one notification per recipient, skipping `except` (usually the
    /// actor, who does not need to hear about their own action).
    fn notify_each(
        &self,
        tx: &Transaction<'_>,
        recipients: impl IntoIterator<Item = String>,
        except: &str,
        build: impl Fn(String) -> civic_notify::NewNotification,
    ) -> Result<Vec<Notification>, ServiceError> {
        let mut seen = std::collections::HashSet::new();
        let mut stored = Vec::new();
        for recipient in recipients {
            if recipient == except || !seen.insert(recipient.clone()) {
                continue;
            }
            stored.push(self.dispatcher.persist(tx, &build(recipient))?);
        }
        Ok(stored)
    }
}

fn visible_to(actor: &Actor, ticket: Ticket) -> Ticket {
    if actor.is_staff_or_admin() {
        ticket
    } else {
        ticket.without_internal()
    }
}

fn require_text(field: &str, value: &str, max: usize) -> Result<String, ServiceError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(ServiceError::Validation(format!("{field} must not be empty")));
    }
    if trimmed.chars().count() > max {
        return Err(ServiceError::Validation(format!(
            "{field} exceeds {max} characters"
        )));
    }
    Ok(trimmed.to_string())
}

fn optional_text(
    field: &str,
    value: Option<String>,
    max: usize,
) -> Result<Option<String>, ServiceError> {
    match value.as_deref().map(str::trim) {
        None | Some("") => Ok(None),
        Some(text) => require_text(field, text, max).map(Some),
    }
}
