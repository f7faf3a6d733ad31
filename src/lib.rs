#![forbid(unsafe_code)]

pub mod config;
pub mod coordinator;
pub mod core;
pub mod error;
mod paths;
pub mod store;
pub mod telemetry;
pub mod test_harness;

pub use error::{Error, Transience};
pub type Result<T> = std::result::Result<T, Error>;

// Re-export the working surface at the crate root for convenience
pub use crate::config::CoordinatorConfig;
pub use crate::coordinator::{ActivityEvent, ActivityHub, Coordinator, CoordinatorError};
pub use crate::core::{
    CLIENT_METADATA_MAX_AGE_MS, CLIENT_METADATA_REFRESH_INTERVAL_MS,
    CLIENT_STATE_GARBAGE_COLLECTION_THRESHOLD_MS, ClientId, ClientMetadataRecord, DatabaseId,
    DatabaseInfo, IdentityError, PersistenceKey, PrimaryLeaseRecord, ProjectId, SystemTimeSource,
    TimeSource,
};
pub use crate::store::{
    ALL_STORES, DocumentChangeLog, LocalStore, MemorySideChannel, MutationQueue, Platform,
    QueryCache, RemoteDocumentCache, SideChannel, StoreError, Transaction, TransactionMode,
    UnavailableSideChannel,
};
