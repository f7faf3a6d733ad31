//! Layer 2: Persisted coordination records
//!
//! ClientMetadataRecord: per-client heartbeat row
//! PrimaryLeaseRecord: singleton lease row
//!
//! Both are rows in the shared transactional store; the side-channel zombie
//! marker is not a record (its presence is the whole signal).

use serde::{Deserialize, Serialize};

use super::identity::ClientId;

/// How stale a client's heartbeat may be before peers consider it dead.
pub const CLIENT_METADATA_MAX_AGE_MS: u64 = 5_000;

/// Period of the metadata refresher tick.
pub const CLIENT_METADATA_REFRESH_INTERVAL_MS: u64 = 4_000;

/// Minimum spacing between garbage-collection passes over peer metadata.
pub const CLIENT_STATE_GARBAGE_COLLECTION_THRESHOLD_MS: u64 = 1_800_000;

/// Per-client heartbeat row, keyed by client id.
///
/// Only the owning client writes its own row; the primary's GC pass may
/// delete rows it has confirmed inactive.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientMetadataRecord {
    pub client_id: ClientId,
    /// Wall-clock ms of the last heartbeat.
    pub update_time_ms: u64,
    pub network_enabled: bool,
    pub in_foreground: bool,
    /// Monotonically non-decreasing cursor into the shared change log.
    pub last_processed_document_change_id: u64,
}

impl ClientMetadataRecord {
    pub fn new(
        client_id: ClientId,
        update_time_ms: u64,
        network_enabled: bool,
        in_foreground: bool,
        last_processed_document_change_id: u64,
    ) -> Self {
        Self {
            client_id,
            update_time_ms,
            network_enabled,
            in_foreground,
            last_processed_document_change_id,
        }
    }
}

/// The singleton lease row.
///
/// Written only by a client that has just evaluated its own eligibility in
/// the same transaction; deleted only by its holder's graceful release (or
/// overwritten by the next holder).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrimaryLeaseRecord {
    pub owner_id: ClientId,
    /// Wall-clock ms when the lease was last written.
    pub lease_timestamp_ms: u64,
    /// Whether the holder opted into shared access. A `false` here makes
    /// every other client's startup fail rather than wait the lease out.
    pub allow_tab_synchronization: bool,
}

impl PrimaryLeaseRecord {
    pub fn new(owner_id: ClientId, lease_timestamp_ms: u64, allow_tab_synchronization: bool) -> Self {
        Self {
            owner_id,
            lease_timestamp_ms,
            allow_tab_synchronization,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_round_trip_through_json() {
        let metadata = ClientMetadataRecord::new(ClientId::random(), 42, true, false, 7);
        let value = serde_json::to_value(&metadata).unwrap();
        let back: ClientMetadataRecord = serde_json::from_value(value).unwrap();
        assert_eq!(back, metadata);

        let lease = PrimaryLeaseRecord::new(ClientId::random(), 99, true);
        let value = serde_json::to_value(&lease).unwrap();
        let back: PrimaryLeaseRecord = serde_json::from_value(value).unwrap();
        assert_eq!(back, lease);
    }

    #[test]
    fn gc_threshold_is_thirty_minutes() {
        assert_eq!(CLIENT_STATE_GARBAGE_COLLECTION_THRESHOLD_MS, 30 * 60 * 1000);
    }
}
