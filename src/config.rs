//! Coordinator configuration.

use serde::{Deserialize, Serialize};

use crate::core::records::{
    CLIENT_METADATA_MAX_AGE_MS, CLIENT_METADATA_REFRESH_INTERVAL_MS,
    CLIENT_STATE_GARBAGE_COLLECTION_THRESHOLD_MS,
};

/// Per-client coordinator settings.
///
/// The timing fields default to the protocol constants; overriding them is
/// for tests that compress wall-clock time, not for production tuning. Two
/// clients with different windows on the same database will disagree about
/// liveness.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Whether this client, when primary, lets peers keep using the
    /// database. `false` claims exclusive access: peers fail at startup
    /// instead of running as secondaries.
    pub allow_tab_synchronization: bool,

    /// Initial network state reported in the first heartbeat.
    pub network_enabled: bool,

    /// Initial visibility state reported in the first heartbeat.
    pub in_foreground: bool,

    /// Period of the metadata refresher tick.
    pub metadata_refresh_interval_ms: u64,

    /// Heartbeat age beyond which peers consider a client dead.
    pub metadata_max_age_ms: u64,

    /// Minimum spacing between GC passes while primary.
    pub state_gc_threshold_ms: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            allow_tab_synchronization: true,
            network_enabled: true,
            in_foreground: true,
            metadata_refresh_interval_ms: CLIENT_METADATA_REFRESH_INTERVAL_MS,
            metadata_max_age_ms: CLIENT_METADATA_MAX_AGE_MS,
            state_gc_threshold_ms: CLIENT_STATE_GARBAGE_COLLECTION_THRESHOLD_MS,
        }
    }
}

impl CoordinatorConfig {
    /// Exclusive-access configuration: this client refuses to share the
    /// database with live peers.
    pub fn exclusive() -> Self {
        Self {
            allow_tab_synchronization: false,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_protocol_constants() {
        let config = CoordinatorConfig::default();
        assert_eq!(config.metadata_max_age_ms, 5_000);
        assert_eq!(config.metadata_refresh_interval_ms, 4_000);
        assert_eq!(config.state_gc_threshold_ms, 1_800_000);
        assert!(config.allow_tab_synchronization);
    }

    #[test]
    fn missing_fields_deserialize_to_defaults() {
        let config: CoordinatorConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(
            config.metadata_refresh_interval_ms,
            CoordinatorConfig::default().metadata_refresh_interval_ms
        );
    }
}
