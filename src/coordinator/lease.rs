//! Primary-lease evaluation and transfer.
//!
//! All lease decisions happen inside a store transaction, so two clients
//! can never both observe "lease absent" and both claim it: the store's
//! serializable isolation turns the evaluate-then-write sequence into an
//! atomic step. Zombie markers come from the synchronous side channel and
//! are consulted at evaluation time only.

use std::sync::Arc;

use super::CoordinatorError;
use crate::core::identity::ClientId;
use crate::core::records::{ClientMetadataRecord, PrimaryLeaseRecord};
use crate::core::time::{TimeSource, is_within_age};
use crate::paths;
use crate::store::side_channel::SideChannel;
use crate::store::local::Transaction;

/// Local, per-instance view of the coordinator's role.
#[derive(Debug)]
pub(crate) struct LeaseState {
    pub is_primary: bool,
    pub network_enabled: bool,
    pub in_foreground: bool,
    pub started: bool,
    /// Latched startup failure; every later entry point rejects with this.
    pub persistence_error: Option<String>,
}

impl LeaseState {
    pub fn new(network_enabled: bool, in_foreground: bool) -> Self {
        Self {
            is_primary: false,
            network_enabled,
            in_foreground,
            started: false,
            persistence_error: None,
        }
    }
}

/// Inputs to one eligibility evaluation, snapshotted outside the
/// transaction.
#[derive(Clone, Copy, Debug)]
pub(crate) struct EligibilityInputs {
    pub network_enabled: bool,
    pub in_foreground: bool,
}

impl From<&LeaseState> for EligibilityInputs {
    fn from(state: &LeaseState) -> Self {
        Self {
            network_enabled: state.network_enabled,
            in_foreground: state.in_foreground,
        }
    }
}

pub(crate) struct LeaseManager {
    client_id: ClientId,
    storage_prefix: String,
    allow_tab_synchronization: bool,
    max_age_ms: u64,
    side_channel: Arc<dyn SideChannel>,
    time: Arc<dyn TimeSource>,
}

impl LeaseManager {
    pub fn new(
        client_id: ClientId,
        storage_prefix: String,
        allow_tab_synchronization: bool,
        max_age_ms: u64,
        side_channel: Arc<dyn SideChannel>,
        time: Arc<dyn TimeSource>,
    ) -> Self {
        Self {
            client_id,
            storage_prefix,
            allow_tab_synchronization,
            max_age_ms,
            side_channel,
            time,
        }
    }

    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    /// Whether this client may hold the primary lease right now.
    ///
    /// Evaluation order:
    /// 1. A valid lease held by a peer blocks us - or fails the whole
    ///    transaction if the peer refused tab synchronization.
    /// 2. Holding the lease ourselves grants nothing: eligibility is
    ///    re-earned every evaluation, so a holder that slips behind a
    ///    better-placed peer hands the lease off within one refresh.
    /// 3. With the lease up for grabs, a networked foreground client
    ///    takes it.
    /// 4. Otherwise we defer exactly to active peers that are strictly
    ///    better placed (network beats no-network; at equal network,
    ///    foreground beats background). Ties go to us.
    pub fn can_act_as_primary(
        &self,
        txn: &Transaction,
        inputs: EligibilityInputs,
    ) -> crate::Result<bool> {
        let now = self.time.now_ms();
        if let Some(lease) = txn.primary_lease()? {
            if self.lease_is_valid(now, &lease) && lease.owner_id != self.client_id {
                if !lease.allow_tab_synchronization {
                    return Err(CoordinatorError::PrimaryLeaseExclusive.into());
                }
                return Ok(false);
            }
        }

        if inputs.network_enabled && inputs.in_foreground {
            return Ok(true);
        }

        let preferred_peer_exists = txn.all_client_metadata()?.iter().any(|peer| {
            if peer.client_id == self.client_id || !self.client_is_active(now, peer) {
                return false;
            }
            let better_network = peer.network_enabled && !inputs.network_enabled;
            let better_visibility = peer.in_foreground
                && !inputs.in_foreground
                && peer.network_enabled == inputs.network_enabled;
            better_network || better_visibility
        });
        Ok(!preferred_peer_exists)
    }

    /// Write a fresh lease for this client. The caller must have just
    /// verified eligibility in this same transaction.
    pub fn acquire_or_extend_lease(&self, txn: &mut Transaction) -> crate::Result<()> {
        let lease = PrimaryLeaseRecord::new(
            self.client_id.clone(),
            self.time.now_ms(),
            self.allow_tab_synchronization,
        );
        txn.put_primary_lease(&lease)
    }

    /// Delete the lease row if this client owns it. Returns whether a row
    /// was deleted.
    pub fn release_lease_if_held(&self, txn: &mut Transaction) -> crate::Result<bool> {
        match txn.primary_lease()? {
            Some(lease) if lease.owner_id == self.client_id => {
                txn.delete_primary_lease()?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Fail if a live peer holds the lease without tab synchronization.
    pub fn verify_allow_tab_synchronization(&self, txn: &Transaction) -> crate::Result<()> {
        if let Some(lease) = txn.primary_lease()? {
            let now = self.time.now_ms();
            if self.lease_is_valid(now, &lease)
                && lease.owner_id != self.client_id
                && !lease.allow_tab_synchronization
            {
                return Err(CoordinatorError::PrimaryLeaseExclusive.into());
            }
        }
        Ok(())
    }

    /// Active = heartbeat within `max_age_ms` and no zombie marker.
    pub fn client_is_active(&self, now_ms: u64, metadata: &ClientMetadataRecord) -> bool {
        is_within_age(now_ms, metadata.update_time_ms, self.max_age_ms)
            && !self.is_client_zombied(&metadata.client_id)
    }

    /// Whether `client_id` announced termination through the side channel.
    ///
    /// An unavailable channel reads as "not zombied": a liveness-preserving
    /// default, logged every time because it can keep a crashed primary's
    /// lease alive until the age window expires.
    pub fn is_client_zombied(&self, client_id: &ClientId) -> bool {
        if !self.side_channel.available() {
            tracing::warn!(
                client = %client_id,
                "side channel unavailable; treating client as not zombied"
            );
            return false;
        }
        self.side_channel
            .get(&paths::zombie_key(&self.storage_prefix, client_id))
            .is_some()
    }

    /// Synchronously mark this client as terminating.
    pub fn write_own_zombie_marker(&self) {
        let key = paths::zombie_key(&self.storage_prefix, &self.client_id);
        self.side_channel.set(&key, &self.time.now_ms().to_string());
    }

    /// Clear this client's marker. Only valid after its metadata row is
    /// gone from the store; removing the marker first could revive a
    /// zombied client.
    pub fn remove_own_zombie_marker(&self) {
        let key = paths::zombie_key(&self.storage_prefix, &self.client_id);
        self.side_channel.remove(&key);
    }

    pub fn remove_zombie_marker_for(&self, client_id: &ClientId) {
        let key = paths::zombie_key(&self.storage_prefix, client_id);
        self.side_channel.remove(&key);
    }

    fn lease_is_valid(&self, now_ms: u64, lease: &PrimaryLeaseRecord) -> bool {
        is_within_age(now_ms, lease.lease_timestamp_ms, self.max_age_ms)
            && !self.is_client_zombied(&lease.owner_id)
    }
}
