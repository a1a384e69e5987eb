//! Closed error taxonomy for ticket service commands.

use civic_notify::NotifyError;
use civic_tickets::StoreError;
use civic_types::TicketStatus;
use thiserror::Error;

/// Why a status change was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TransitionConflict {
    /// The target is not reachable from the current status.
    #[error("cannot move from {from} to {to}")]
    Unreachable {
        from: TicketStatus,
        to: TicketStatus,
    },

    /// The caller's expected status is out of date. Re-read and retry.
    #[error("expected {expected} but ticket is {actual}")]
    Stale {
        expected: TicketStatus,
        actual: TicketStatus,
    },

    /// The operation needs a status the ticket is not in.
    #[error("operation requires {required}, ticket is {actual}")]
    RequiresStatus {
        required: &'static str,
        actual: TicketStatus,
    },
}

/// Errors returned by [`crate::service::TicketService`] commands.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// The caller's identity could not be resolved or is not verified.
    #[error("unauthorized")]
    Unauthorized,

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("invalid transition: {0}")]
    InvalidTransition(TransitionConflict),

    #[error("invalid assignee: {0}")]
    InvalidAssignee(String),

    #[error("validation failed: {0}")]
    Validation(String),

    /// The store or a collaborator failed. Nothing was committed.
    #[error("storage failure: {0}")]
    Storage(String),
}

impl ServiceError {
    pub(crate) fn ticket_not_found(id: impl Into<String>) -> Self {
        Self::NotFound {
            entity: "ticket",
            id: id.into(),
        }
    }

    /// True when repeating the command after re-reading may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::InvalidTransition(TransitionConflict::Stale { .. })
        )
    }
}

impl From<StoreError> for ServiceError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) => Self::ticket_not_found(id),
            StoreError::StaleStatus {
                expected, actual, ..
            } => Self::InvalidTransition(TransitionConflict::Stale { expected, actual }),
            StoreError::IllegalTransition { from, to } => {
                Self::InvalidTransition(TransitionConflict::Unreachable { from, to })
            }
            StoreError::Invariant(msg) => Self::Validation(msg),
            // SQLITE_BUSY under write contention surfaces here.
            StoreError::Database(e) => Self::Storage(e.to_string()),
        }
    }
}

impl From<NotifyError> for ServiceError {
    fn from(e: NotifyError) -> Self {
        match e {
            NotifyError::NotFound(id) => Self::NotFound {
                entity: "notification",
                id,
            },
            other => Self::Storage(other.to_string()),
        }
    }
}

impl From<civic_identity::IdentityError> for ServiceError {
    fn from(e: civic_identity::IdentityError) -> Self {
        Self::Storage(e.to_string())
    }
}

impl From<rusqlite::Error> for ServiceError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Storage(e.to_string())
    }
}

impl From<r2d2::Error> for ServiceError {
    fn from(e: r2d2::Error) -> Self {
        Self::Storage(format!("db connection failed: {e}"))
    }
}

impl From<tokio::task::JoinError> for ServiceError {
    fn from(e: tokio::task::JoinError) -> Self {
        Self::Storage(format!("blocking task failed: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_stale_conflicts_are_retryable() {
        let stale = ServiceError::from(StoreError::StaleStatus {
            ticket_id: "t".into(),
            expected: TicketStatus::Pending,
            actual: TicketStatus::InProgress,
        });
        assert!(stale.is_retryable());

        let illegal = ServiceError::from(StoreError::IllegalTransition {
            from: TicketStatus::Closed,
            to: TicketStatus::Pending,
        });
        assert!(!illegal.is_retryable());
        assert!(matches!(
            illegal,
            ServiceError::InvalidTransition(TransitionConflict::Unreachable { .. })
        ));

        assert!(!ServiceError::Unauthorized.is_retryable());
    }

    #[test]
    fn store_not_found_names_the_ticket() {
        let err = ServiceError::from(StoreError::NotFound("t-1".into()));
        assert_eq!(err.to_string(), "ticket not found: t-1");
    }
}
