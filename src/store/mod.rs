//! Transactional store adapter and side channel.
//!
//! Provides:
//! - `Platform` - process-group environment: database registry, side
//!   channel, time source
//! - `LocalStore` - one client's connection to a shared database
//! - `Transaction` - atomic read/write scope over named object stores
//! - `SideChannel` - synchronous best-effort key/value map for zombie
//!   markers
//! - Collaborator handles over their object stores (change log, mutation
//!   queue, query cache, remote document cache)

pub mod collaborators;
pub mod local;
pub mod side_channel;

use thiserror::Error;

use crate::error::Transience;

pub use collaborators::{
    ALL_STORES, CLIENT_METADATA_STORE, DOCUMENT_CHANGE_LOG_STORE, DocumentChangeLog,
    MUTATION_QUEUE_STORE, MutationQueue, PRIMARY_CLIENT_STORE, QUERY_CACHE_STORE, QueryCache,
    REMOTE_DOCUMENT_CACHE_STORE, RemoteDocumentCache, SCHEMA_VERSION, define_schema,
};
pub use local::{LocalStore, Platform, RowKey, SchemaUpgrade, Transaction, TransactionMode};
pub use side_channel::{MemorySideChannel, SideChannel, UnavailableSideChannel};

#[derive(Error, Debug)]
pub enum StoreError {
    /// The database cannot be opened or used by this client.
    #[error("database {name:?} unavailable: {reason}")]
    Unavailable { name: String, reason: String },

    /// This connection was closed by shutdown.
    #[error("database connection is closed")]
    Closed,

    /// A store lock was poisoned by a panicking writer.
    #[error("store lock poisoned")]
    LockPoisoned,

    /// The transaction body touched a store outside its declared scope.
    #[error("object store {store:?} is not in this transaction's scope")]
    OutOfScope { store: String },

    #[error("unknown object store {store:?}")]
    UnknownStore { store: String },

    #[error("write to {store:?} in a read-only transaction")]
    ReadOnly { store: String },

    #[error("corrupt row in {store:?}")]
    Corrupt {
        store: String,
        #[source]
        source: serde_json::Error,
    },
}

impl StoreError {
    pub fn transience(&self) -> Transience {
        match self {
            StoreError::Unavailable { .. } => Transience::Permanent,
            StoreError::Closed => Transience::Permanent,
            StoreError::LockPoisoned => Transience::Retryable,
            StoreError::OutOfScope { .. } => Transience::Permanent,
            StoreError::UnknownStore { .. } => Transience::Permanent,
            StoreError::ReadOnly { .. } => Transience::Permanent,
            StoreError::Corrupt { .. } => Transience::Permanent,
        }
    }
}
