//! Ticket status and the fixed transition graph.

use serde::{Deserialize, Serialize};

use crate::ParseLabelError;

/// Lifecycle status of a ticket.
///
/// The graph is fixed:
///
/// | From | To |
/// |------|----|
/// | `pending` | `in-progress`, `closed` |
/// | `in-progress` | `resolved`, `closed` |
/// | `resolved` | `closed` |
/// | `closed` | (terminal) |
///
/// There is no reopen edge. A rating may be attached while `resolved`
/// without changing status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TicketStatus {
    #[default]
    Pending,
    InProgress,
    Resolved,
    Closed,
}

impl TicketStatus {
    /// All statuses, in lifecycle order.
    pub const ALL: [TicketStatus; 4] = [
        Self::Pending,
        Self::InProgress,
        Self::Resolved,
        Self::Closed,
    ];

    /// Returns the canonical label for this status.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in-progress",
            Self::Resolved => "resolved",
            Self::Closed => "closed",
        }
    }

    /// Returns whether `target` is directly reachable from `self`.
    pub fn can_transition_to(self, target: TicketStatus) -> bool {
        matches!(
            (self, target),
            (Self::Pending, Self::InProgress)
                | (Self::Pending, Self::Closed)
                | (Self::InProgress, Self::Resolved)
                | (Self::InProgress, Self::Closed)
                | (Self::Resolved, Self::Closed)
        )
    }

    /// `closed` has no outgoing edges.
    pub fn is_terminal(self) -> bool {
        self == Self::Closed
    }

    /// Tickets still being worked: escalation and reassignment apply.
    pub fn is_open(self) -> bool {
        matches!(self, Self::Pending | Self::InProgress)
    }

    /// Entering these statuses records who finished the ticket and when.
    pub fn records_resolution(self) -> bool {
        matches!(self, Self::Resolved | Self::Closed)
    }
}

impl std::fmt::Display for TicketStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TicketStatus {
    type Err = ParseLabelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in-progress" => Ok(Self::InProgress),
            "resolved" => Ok(Self::Resolved),
            "closed" => Ok(Self::Closed),
            _ => Err(ParseLabelError::new("status", s)),
        }
    }
}
