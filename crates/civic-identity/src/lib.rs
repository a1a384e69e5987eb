//! Identity lookups consumed by the ticketing core.
//!
//! Account storage and credential verification live outside this workspace.
//! The core only needs two questions answered: "who is this id?" and "who
//! holds this role?". [`IdentityStore`] is that seam.
//!
//! Two adapters are provided:
//!
//! - [`MemoryIdentityStore`] for tests and embedding.
//! - [`SqliteIdentityStore`], a read-only view over the `accounts` table that
//!   an external account service keeps up to date.

use std::collections::HashMap;
use std::sync::RwLock;

use civic_db::DbPool;
use civic_types::Role;
use rusqlite::{OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised by identity lookups.
#[derive(Debug, Error)]
pub enum IdentityError {
    /// The backing store could not be reached.
    #[error("identity store unavailable: {0}")]
    Unavailable(String),

    /// The backing store returned a row that could not be decoded.
    #[error("identity store returned malformed data: {0}")]
    Malformed(String),
}

impl From<rusqlite::Error> for IdentityError {
    fn from(e: rusqlite::Error) -> Self {
        match e {
            rusqlite::Error::FromSqlConversionFailure(..) => Self::Malformed(e.to_string()),
            other => Self::Unavailable(other.to_string()),
        }
    }
}

/// An account as seen by the ticketing core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub id: String,
    pub role: Role,
    pub is_verified: bool,
}

impl Identity {
    pub fn new(id: impl Into<String>, role: Role, is_verified: bool) -> Self {
        Self {
            id: id.into(),
            role,
            is_verified,
        }
    }

    /// A verified staff account: the only valid ticket assignee.
    pub fn is_assignable_staff(&self) -> bool {
        self.role == Role::Staff && self.is_verified
    }
}

/// Read access to the external account store.
///
/// Implementations are called from blocking contexts and must be cheap to
/// share across threads.
pub trait IdentityStore: Send + Sync {
    /// Looks up an account by id. `Ok(None)` means the id is unknown.
    fn find_by_id(&self, id: &str) -> Result<Option<Identity>, IdentityError>;

    /// Lists every account holding `role`.
    fn find_by_role(&self, role: Role) -> Result<Vec<Identity>, IdentityError>;
}

/// In-process identity store.
#[derive(Debug, Default)]
pub struct MemoryIdentityStore {
    accounts: RwLock<HashMap<String, Identity>>,
}

impl MemoryIdentityStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a store pre-populated with `identities`.
    pub fn with_identities(identities: impl IntoIterator<Item = Identity>) -> Self {
        let store = Self::new();
        for identity in identities {
            store.insert(identity);
        }
        store
    }

    /// Inserts or replaces an account.
    pub fn insert(&self, identity: Identity) {
        let mut accounts = self
            .accounts
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        accounts.insert(identity.id.clone(), identity);
    }
}

impl IdentityStore for MemoryIdentityStore {
    fn find_by_id(&self, id: &str) -> Result<Option<Identity>, IdentityError> {
        let accounts = self
            .accounts
            .read()
            .map_err(|_| IdentityError::Unavailable("account map lock poisoned".to_string()))?;
        Ok(accounts.get(id).cloned())
    }

    fn find_by_role(&self, role: Role) -> Result<Vec<Identity>, IdentityError> {
        let accounts = self
            .accounts
            .read()
            .map_err(|_| IdentityError::Unavailable("account map lock poisoned".to_string()))?;
        let mut matches: Vec<Identity> = accounts
            .values()
            .filter(|identity| identity.role == role)
            .cloned()
            .collect();
        matches.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(matches)
    }
}

/// Read-only adapter over the `accounts` table.
#[derive(Clone)]
pub struct SqliteIdentityStore {
    pool: DbPool,
}

impl SqliteIdentityStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

impl IdentityStore for SqliteIdentityStore {
    fn find_by_id(&self, id: &str) -> Result<Option<Identity>, IdentityError> {
        let conn = self
            .pool
            .get()
            .map_err(|e| IdentityError::Unavailable(e.to_string()))?;
        let identity = conn
            .query_row(
                "SELECT id, role, is_verified FROM accounts WHERE id = ?1",
                [id],
                map_row_to_identity,
            )
            .optional()?;
        Ok(identity)
    }

    fn find_by_role(&self, role: Role) -> Result<Vec<Identity>, IdentityError> {
        let conn = self
            .pool
            .get()
            .map_err(|e| IdentityError::Unavailable(e.to_string()))?;
        let mut stmt =
            conn.prepare("SELECT id, role, is_verified FROM accounts WHERE role = ?1 ORDER BY id")?;
        let rows = stmt.query_map([role.as_str()], map_row_to_identity)?;
        let mut identities = Vec::new();
        for row in rows {
            identities.push(row?);
        }
        tracing::debug!(role = %role, count = identities.len(), "resolved accounts by role");
        Ok(identities)
    }
}

fn map_row_to_identity(row: &Row) -> rusqlite::Result<Identity> {
    let role_label: String = row.get(1)?;
    let role: Role = role_label.parse().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(Identity {
        id: row.get(0)?,
        role,
        is_verified: row.get(2)?,
    })
}
