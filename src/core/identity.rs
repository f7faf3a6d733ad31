//! Layer 1: Identity atoms
//!
//! ClientId: one client instance sharing the database
//! PersistenceKey / ProjectId / DatabaseId: the shared database's identity

use std::fmt;

use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum IdentityError {
    #[error("invalid client id {raw:?}: {reason}")]
    Client { raw: String, reason: String },

    #[error("invalid persistence key {raw:?}: {reason}")]
    PersistenceKey { raw: String, reason: String },

    #[error("invalid project id {raw:?}: {reason}")]
    Project { raw: String, reason: String },

    #[error("invalid database id {raw:?}: {reason}")]
    Database { raw: String, reason: String },
}

/// Client instance identifier, stable for the lifetime of one process.
///
/// Opaque beyond being non-empty; fresh ids come from `random()`.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(String);

impl ClientId {
    pub fn new(s: impl Into<String>) -> Result<Self, IdentityError> {
        let s = s.into();
        if s.is_empty() {
            Err(IdentityError::Client {
                raw: s,
                reason: "empty".into(),
            })
        } else {
            Ok(Self(s))
        }
    }

    /// Generate a fresh id for this process lifetime.
    pub fn random() -> Self {
        let mut rng = rand::rng();
        let mut bytes = [0u8; 16];
        rng.fill_bytes(&mut bytes);
        Self(Uuid::from_bytes(bytes).simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ClientId({:?})", self.0)
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Embedder-chosen key isolating one logical app from another sharing the
/// same storage namespace.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PersistenceKey(String);

impl PersistenceKey {
    pub fn new(s: impl Into<String>) -> Result<Self, IdentityError> {
        let s = s.into();
        if s.is_empty() {
            return Err(IdentityError::PersistenceKey {
                raw: s,
                reason: "empty".into(),
            });
        }
        if s.contains('/') {
            return Err(IdentityError::PersistenceKey {
                raw: s,
                reason: "must not contain '/'".into(),
            });
        }
        Ok(Self(s))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for PersistenceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PersistenceKey({:?})", self.0)
    }
}

impl fmt::Display for PersistenceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Project identifier - a DNS label.
///
/// The label alphabet contains no '.', which keeps the
/// `<project>.<database>` storage-prefix segment unambiguous.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProjectId(String);

impl ProjectId {
    pub fn new(s: impl Into<String>) -> Result<Self, IdentityError> {
        let s = s.into();
        if s.is_empty() {
            return Err(IdentityError::Project {
                raw: s,
                reason: "empty".into(),
            });
        }
        if !s
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
        {
            return Err(IdentityError::Project {
                raw: s,
                reason: "must be a lowercase DNS label".into(),
            });
        }
        Ok(Self(s))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ProjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ProjectId({:?})", self.0)
    }
}

impl fmt::Display for ProjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Named database within a project. Absent for the project default.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DatabaseId(String);

impl DatabaseId {
    pub fn new(s: impl Into<String>) -> Result<Self, IdentityError> {
        let s = s.into();
        if s.is_empty() {
            return Err(IdentityError::Database {
                raw: s,
                reason: "empty".into(),
            });
        }
        if s.contains('/') {
            return Err(IdentityError::Database {
                raw: s,
                reason: "must not contain '/'".into(),
            });
        }
        Ok(Self(s))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for DatabaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DatabaseId({:?})", self.0)
    }
}

impl fmt::Display for DatabaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of the shared on-disk database a group of clients coordinates
/// over. Two clients with equal `DatabaseInfo` contend for the same lease.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct DatabaseInfo {
    pub persistence_key: PersistenceKey,
    pub project_id: ProjectId,
    pub database_id: Option<DatabaseId>,
}

impl DatabaseInfo {
    pub fn new(
        persistence_key: PersistenceKey,
        project_id: ProjectId,
        database_id: Option<DatabaseId>,
    ) -> Self {
        Self {
            persistence_key,
            project_id,
            database_id,
        }
    }

    /// Prefix under which every persistent artifact of this database lives.
    pub fn storage_prefix(&self) -> String {
        crate::paths::storage_prefix(self)
    }

    /// Side-channel key a terminating `client_id` writes. Part of the
    /// stable external contract so platform shims can wire their own
    /// unload hooks.
    pub fn zombie_marker_key(&self, client_id: &ClientId) -> String {
        crate::paths::zombie_key(&self.storage_prefix(), client_id)
    }
}
