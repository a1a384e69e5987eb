//! Real-time topic names.
//!
//! Topics are naming conventions only; the hub attaches no meaning to them.

use crate::ParseLabelError;

const STAFF_TOPIC: &str = "role:staff-or-admin";

/// A named broadcast channel that live connections join.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Topic {
    /// `user:<id>`, joined automatically on connect.
    User(String),
    /// `role:staff-or-admin`, joined automatically by staff and admins.
    StaffOrAdmin,
    /// `ticket:<id>`, joined explicitly by a subscribe command.
    Ticket(String),
}

impl Topic {
    pub fn user(id: impl Into<String>) -> Self {
        Self::User(id.into())
    }

    pub fn ticket(id: impl Into<String>) -> Self {
        Self::Ticket(id.into())
    }
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::User(id) => write!(f, "user:{id}"),
            Self::StaffOrAdmin => f.write_str(STAFF_TOPIC),
            Self::Ticket(id) => write!(f, "ticket:{id}"),
        }
    }
}

impl std::str::FromStr for Topic {
    type Err = ParseLabelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == STAFF_TOPIC {
            return Ok(Self::StaffOrAdmin);
        }
        match s.split_once(':') {
            Some(("user", id)) if !id.is_empty() => Ok(Self::User(id.to_string())),
            Some(("ticket", id)) if !id.is_empty() => Ok(Self::Ticket(id.to_string())),
            _ => Err(ParseLabelError::new("topic", s)),
        }
    }
}

impl serde::Serialize for Topic {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}
