//! Core domain types for bellwether
//!
//! Module hierarchy follows type dependency order:
//! - time: wall-clock source and age windows (Layer 0)
//! - identity: ClientId, PersistenceKey, ProjectId, DatabaseId (Layer 1)
//! - records: persisted heartbeat and lease rows (Layer 2)

pub mod identity;
pub mod records;
pub mod time;

pub use identity::{
    ClientId, DatabaseId, DatabaseInfo, IdentityError, PersistenceKey, ProjectId,
};
pub use records::{
    CLIENT_METADATA_MAX_AGE_MS, CLIENT_METADATA_REFRESH_INTERVAL_MS,
    CLIENT_STATE_GARBAGE_COLLECTION_THRESHOLD_MS, ClientMetadataRecord, PrimaryLeaseRecord,
};
pub use time::{SystemTimeSource, TimeSource, is_within_age};
