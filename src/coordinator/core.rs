//! Coordinator core - one client's view of the shared database.
//!
//! Owns the task queue, the lease manager, and the per-instance state.
//! The serialization point for all coordinator-initiated work - heartbeat
//! ticks, eligibility reactions, shutdown - is the queue's single worker
//! thread. Caller transactions run through the queue too, so local state
//! transitions observed by callers and by the refresher agree.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use thiserror::Error;

use super::lease::{EligibilityInputs, LeaseManager, LeaseState};
use super::observer::{ActivityEvent, ActivityHub, ActivitySubscription};
use super::queue::{DelayedTask, TaskQueue};
use crate::config::CoordinatorConfig;
use crate::core::identity::{ClientId, DatabaseInfo};
use crate::core::records::ClientMetadataRecord;
use crate::core::time::{TimeSource, is_within_age};
use crate::error::Transience;
use crate::paths;
use crate::store::collaborators::{
    ALL_STORES, CLIENT_METADATA_STORE, DocumentChangeLog, MutationQueue, PRIMARY_CLIENT_STORE,
    QueryCache, RemoteDocumentCache, SCHEMA_VERSION, define_schema,
};
use crate::store::local::{LocalStore, Platform, Transaction};

#[derive(Error, Debug)]
pub enum CoordinatorError {
    /// Persistence failed at startup; latched for the instance lifetime.
    #[error("persistence is unavailable: {reason}")]
    Unavailable { reason: String },

    /// A `require_primary` transaction found the lease gone or taken.
    #[error("the primary lease was lost or cannot be obtained")]
    PrimaryLeaseLost,

    /// A live peer holds the lease with tab synchronization disabled.
    #[error("another client holds the primary lease in exclusive mode")]
    PrimaryLeaseExclusive,

    #[error("coordinator is not started")]
    NotStarted,

    #[error("coordinator has shut down")]
    ShutDown,
}

impl CoordinatorError {
    pub fn transience(&self) -> Transience {
        match self {
            CoordinatorError::Unavailable { .. } => Transience::Permanent,
            CoordinatorError::PrimaryLeaseLost => Transience::Retryable,
            CoordinatorError::PrimaryLeaseExclusive => Transience::Permanent,
            CoordinatorError::NotStarted => Transience::Unknown,
            CoordinatorError::ShutDown => Transience::Permanent,
        }
    }
}

type PrimaryStateListener = Arc<dyn Fn(bool) -> crate::Result<()> + Send + Sync>;

struct CoordinatorState {
    lease: LeaseState,
    store: Option<Arc<LocalStore>>,
    listener: Option<PrimaryStateListener>,
    refresher: Option<DelayedTask>,
    activity: Option<ActivitySubscription>,
    last_gc_ms: u64,
    last_processed_change_id: u64,
    shut_down: bool,
}

/// One client instance of the shared-database coordinator.
///
/// Per-instance, not per-process: tests run several coordinators against
/// one `Platform` to simulate a client group.
pub struct Coordinator {
    client_id: ClientId,
    database_info: DatabaseInfo,
    database_name: String,
    config: CoordinatorConfig,
    platform: Arc<Platform>,
    time: Arc<dyn TimeSource>,
    lease_manager: Arc<LeaseManager>,
    queue: TaskQueue,
    state: Mutex<CoordinatorState>,
}

impl Coordinator {
    pub fn new(
        platform: Arc<Platform>,
        database_info: DatabaseInfo,
        config: CoordinatorConfig,
    ) -> Arc<Self> {
        let client_id = ClientId::random();
        let storage_prefix = paths::storage_prefix(&database_info);
        let database_name = paths::database_name(&database_info);
        let time = platform.time();
        let lease_manager = Arc::new(LeaseManager::new(
            client_id.clone(),
            storage_prefix,
            config.allow_tab_synchronization,
            config.metadata_max_age_ms,
            platform.side_channel(),
            time.clone(),
        ));
        Arc::new(Self {
            client_id,
            database_info,
            database_name,
            state: Mutex::new(CoordinatorState {
                lease: LeaseState::new(config.network_enabled, config.in_foreground),
                store: None,
                listener: None,
                refresher: None,
                activity: None,
                last_gc_ms: 0,
                last_processed_change_id: 0,
                shut_down: false,
            }),
            config,
            platform,
            time,
            lease_manager,
            queue: TaskQueue::new("bellwether-coordinator"),
        })
    }

    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    pub fn database_info(&self) -> &DatabaseInfo {
        &self.database_info
    }

    /// Snapshot of the local primary bit. Authoritative state lives in the
    /// store; this is what the last evaluation concluded.
    pub fn is_primary(&self) -> bool {
        self.state().lease.is_primary
    }

    pub fn started(&self) -> bool {
        self.state().lease.started
    }

    // Lifecycle --------------------------------------------------------------

    /// Open the store, attach observers, run the first heartbeat, and
    /// start the refresher. Fails with `PrimaryLeaseExclusive` when a live
    /// peer holds the lease exclusively; any startup failure is latched
    /// and releases every resource acquired along the way.
    pub fn start(
        self: &Arc<Self>,
        activity: Option<&ActivityHub>,
    ) -> crate::Result<()> {
        {
            let state = self.state();
            if state.shut_down {
                return Err(CoordinatorError::ShutDown.into());
            }
            if let Some(reason) = &state.lease.persistence_error {
                return Err(CoordinatorError::Unavailable {
                    reason: reason.clone(),
                }
                .into());
            }
            if state.lease.started {
                return Ok(());
            }
        }

        let store = self
            .platform
            .open_or_create(&self.database_name, SCHEMA_VERSION, define_schema)
            .map_err(|err| {
                let err = crate::Error::from(err);
                self.state().lease.persistence_error = Some(err.to_string());
                err
            })?;

        {
            let mut state = self.state();
            state.store = Some(Arc::new(store));
            state.lease.started = true;
            state.last_gc_ms = self.time.now_ms();
        }

        if let Some(hub) = activity {
            let weak = Arc::downgrade(self);
            let subscription = ActivitySubscription::attach(hub, move |event| {
                if let Some(coordinator) = weak.upgrade() {
                    coordinator.handle_activity_event(event);
                }
            });
            self.state().activity = Some(subscription);
        }

        let first_heartbeat = {
            let this = self.clone();
            self.queue
                .enqueue(move || this.update_metadata_and_try_become_primary())
                .join()
        };
        match first_heartbeat {
            None => {
                self.fail_startup("task queue stopped during startup");
                Err(CoordinatorError::ShutDown.into())
            }
            Some(Err(err)) => {
                self.fail_startup(&err.to_string());
                Err(err)
            }
            Some(Ok(())) => {
                self.schedule_refresh();
                Ok(())
            }
        }
    }

    fn fail_startup(&self, reason: &str) {
        let (activity, store) = {
            let mut state = self.state();
            state.lease.started = false;
            state.lease.persistence_error = Some(reason.to_string());
            (state.activity.take(), state.store.take())
        };
        if let Some(mut activity) = activity {
            activity.detach();
        }
        if let Some(store) = store {
            store.close();
        }
    }

    /// Graceful shutdown. Idempotent; safe to call from the embedder or
    /// from the unload path.
    pub fn shutdown(self: &Arc<Self>, delete_data: bool) -> crate::Result<()> {
        if self.queue.on_queue_thread() {
            return self.shutdown_on_queue(delete_data);
        }
        let this = self.clone();
        let result = self
            .queue
            .enqueue(move || this.shutdown_on_queue(delete_data))
            .join()
            // A stopped queue means a previous shutdown already ran.
            .unwrap_or(Ok(()));
        self.queue.shutdown();
        result
    }

    fn shutdown_on_queue(self: &Arc<Self>, delete_data: bool) -> crate::Result<()> {
        {
            let mut state = self.state();
            if state.shut_down {
                return Ok(());
            }
            state.shut_down = true;
            state.lease.started = false;
        }

        self.lease_manager.write_own_zombie_marker();

        let (refresher, activity, store) = {
            let mut state = self.state();
            (
                state.refresher.take(),
                state.activity.take(),
                state.store.take(),
            )
        };
        if let Some(refresher) = refresher {
            refresher.cancel();
        }
        if let Some(mut activity) = activity {
            activity.detach();
        }

        // With no store there is no metadata row the marker could revive.
        let mut released_client_state = store.is_none();
        if let Some(store) = store {
            let released = store.run_read_write(
                &[PRIMARY_CLIENT_STORE, CLIENT_METADATA_STORE],
                |txn| {
                    self.lease_manager.release_lease_if_held(txn)?;
                    txn.delete_client_metadata(&self.client_id)?;
                    Ok(())
                },
            );
            match released {
                Ok(()) => released_client_state = true,
                Err(err) => {
                    tracing::warn!(
                        client = %self.client_id,
                        error = %err,
                        "failed to release client state during shutdown"
                    );
                }
            }
            store.close();
        }

        self.state().lease.is_primary = false;

        // The marker outlives any failed metadata delete: clearing it
        // early could revive this client in a peer's eyes.
        if released_client_state {
            self.lease_manager.remove_own_zombie_marker();
        }

        if delete_data {
            self.platform.delete_database(&self.database_name)?;
        }
        Ok(())
    }

    /// Best-effort reaction to imminent process termination: mark this
    /// client as a zombie synchronously, then try for a graceful shutdown
    /// on the queue. The marker write is the part that must not wait.
    pub fn unload(self: &Arc<Self>) {
        if !self.state().lease.started {
            return;
        }
        self.lease_manager.write_own_zombie_marker();
        let weak = Arc::downgrade(self);
        self.queue.enqueue_and_forget(move || {
            if let Some(coordinator) = weak.upgrade() {
                if let Err(err) = coordinator.shutdown_on_queue(false) {
                    tracing::warn!(error = %err, "unload shutdown failed");
                }
            }
        });
    }

    // Eligibility inputs -----------------------------------------------------

    pub fn set_network_enabled(self: &Arc<Self>, enabled: bool) {
        let changed = {
            let mut state = self.state();
            if state.lease.network_enabled == enabled {
                false
            } else {
                state.lease.network_enabled = enabled;
                true
            }
        };
        if changed {
            self.enqueue_evaluation();
        }
    }

    pub fn set_in_foreground(self: &Arc<Self>, in_foreground: bool) {
        self.state().lease.in_foreground = in_foreground;
        self.enqueue_evaluation();
    }

    /// Record that this client consumed the shared change log through
    /// `change_id`. The cursor is monotone; stale values are ignored.
    pub fn note_processed_change(&self, change_id: u64) {
        let mut state = self.state();
        if change_id > state.last_processed_change_id {
            state.last_processed_change_id = change_id;
        }
    }

    fn handle_activity_event(self: &Arc<Self>, event: ActivityEvent) {
        match event {
            ActivityEvent::Visibility { in_foreground } => self.set_in_foreground(in_foreground),
            ActivityEvent::NetworkEnabled { enabled } => self.set_network_enabled(enabled),
            ActivityEvent::Unload => self.unload(),
        }
    }

    fn enqueue_evaluation(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.queue.enqueue_and_forget(move || {
            let Some(coordinator) = weak.upgrade() else {
                return;
            };
            if let Err(err) = coordinator.update_metadata_and_try_become_primary() {
                log_refresh_error(&err);
            }
        });
    }

    // Listener ---------------------------------------------------------------

    /// Register the primary-state callback. It is invoked on the queue,
    /// first with the current value, then on every transition. Its errors
    /// are logged and never propagate back here.
    pub fn set_primary_state_listener(
        self: &Arc<Self>,
        listener: impl Fn(bool) -> crate::Result<()> + Send + Sync + 'static,
    ) {
        let listener: PrimaryStateListener = Arc::new(listener);
        {
            let mut state = self.state();
            state.listener = Some(listener.clone());
        }
        let weak = Arc::downgrade(self);
        self.queue.enqueue_and_forget(move || {
            let Some(coordinator) = weak.upgrade() else {
                return;
            };
            let is_primary = coordinator.state().lease.is_primary;
            if let Err(err) = listener(is_primary) {
                tracing::warn!(error = %err, "primary-state listener failed");
            }
        });
    }

    fn notify_primary_state(self: &Arc<Self>, is_primary: bool) {
        let weak = Arc::downgrade(self);
        self.queue.enqueue_and_forget(move || {
            let Some(coordinator) = weak.upgrade() else {
                return;
            };
            let listener = {
                let state = coordinator.state();
                if !state.lease.started {
                    return;
                }
                state.listener.clone()
            };
            if let Some(listener) = listener {
                if let Err(err) = listener(is_primary) {
                    tracing::warn!(error = %err, "primary-state listener failed");
                }
            }
        });
    }

    // Heartbeat & refresher --------------------------------------------------

    /// One heartbeat: upsert own metadata, re-evaluate the lease, and
    /// acquire/extend or release accordingly. Runs on the queue.
    fn update_metadata_and_try_become_primary(self: &Arc<Self>) -> crate::Result<()> {
        let (store, inputs, was_primary, cursor) = {
            let state = self.state();
            if !state.lease.started {
                return Ok(());
            }
            let Some(store) = state.store.clone() else {
                return Ok(());
            };
            (
                store,
                EligibilityInputs::from(&state.lease),
                state.lease.is_primary,
                state.last_processed_change_id,
            )
        };

        let now = self.time.now_ms();
        let can_act = store.run_read_write(ALL_STORES, |txn| {
            let metadata = ClientMetadataRecord::new(
                self.client_id.clone(),
                now,
                inputs.network_enabled,
                inputs.in_foreground,
                cursor,
            );
            txn.put_client_metadata(&metadata)?;

            let can_act = self.lease_manager.can_act_as_primary(txn, inputs)?;
            if can_act {
                self.lease_manager.acquire_or_extend_lease(txn)?;
            } else if was_primary {
                self.lease_manager.release_lease_if_held(txn)?;
            }
            Ok(can_act)
        })?;

        if can_act != was_primary {
            tracing::debug!(
                client = %self.client_id,
                is_primary = can_act,
                "primary state changed"
            );
            self.state().lease.is_primary = can_act;
            self.notify_primary_state(can_act);
        }
        Ok(())
    }

    fn schedule_refresh(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let handle = self.queue.enqueue_after(
            Duration::from_millis(self.config.metadata_refresh_interval_ms),
            move || {
                if let Some(coordinator) = weak.upgrade() {
                    coordinator.run_refresh_tick();
                }
            },
        );
        self.state().refresher = Some(handle);
    }

    fn run_refresh_tick(self: &Arc<Self>) {
        {
            let state = self.state();
            if !state.lease.started || state.shut_down {
                return;
            }
        }
        if let Err(err) = self.update_metadata_and_try_become_primary() {
            log_refresh_error(&err);
        }
        if let Err(err) = self.maybe_garbage_collect() {
            tracing::warn!(error = %err, "client state garbage collection failed");
        }
        self.schedule_refresh();
    }

    /// GC pass: while primary and at most once per threshold, delete
    /// long-inactive peer metadata and truncate the change log below the
    /// slowest active peer's cursor. Store deletes commit before the
    /// side-channel markers go away.
    fn maybe_garbage_collect(self: &Arc<Self>) -> crate::Result<()> {
        let (store, is_primary, last_gc_ms) = {
            let state = self.state();
            let Some(store) = state.store.clone() else {
                return Ok(());
            };
            (store, state.lease.is_primary, state.last_gc_ms)
        };
        if !is_primary {
            return Ok(());
        }
        let now = self.time.now_ms();
        if now.saturating_sub(last_gc_ms) < self.config.state_gc_threshold_ms {
            return Ok(());
        }

        let inactive = store.run_read_write(ALL_STORES, |txn| {
            let mut inactive = Vec::new();
            let mut oldest_peer_cursor: Option<u64> = None;
            for metadata in txn.all_client_metadata()? {
                let active = is_within_age(
                    now,
                    metadata.update_time_ms,
                    self.config.state_gc_threshold_ms,
                ) && !self.lease_manager.is_client_zombied(&metadata.client_id);
                if active {
                    if metadata.client_id != self.client_id {
                        let cursor = metadata.last_processed_document_change_id;
                        oldest_peer_cursor = Some(match oldest_peer_cursor {
                            Some(current) => current.min(cursor),
                            None => cursor,
                        });
                    }
                } else {
                    inactive.push(metadata.client_id);
                }
            }
            for client_id in &inactive {
                txn.delete_client_metadata(client_id)?;
            }
            if let Some(oldest) = oldest_peer_cursor {
                DocumentChangeLog.truncate_through(txn, oldest)?;
            }
            Ok(inactive)
        })?;

        if !inactive.is_empty() {
            tracing::debug!(count = inactive.len(), "collected inactive client metadata");
        }
        for client_id in &inactive {
            self.lease_manager.remove_zombie_marker_for(client_id);
        }
        self.state().last_gc_ms = now;
        Ok(())
    }

    // Transaction gate -------------------------------------------------------

    /// Run a caller transaction over the full store set.
    ///
    /// With `require_primary`, eligibility is evaluated inside the
    /// transaction and the lease is extended after the body, so the stored
    /// timestamp reflects actual completion and long bodies keep the lease.
    pub fn run_transaction<T: Send + 'static>(
        self: &Arc<Self>,
        action: &str,
        require_primary: bool,
        body: impl FnOnce(&mut Transaction) -> crate::Result<T> + Send + 'static,
    ) -> crate::Result<T> {
        self.check_usable()?;
        tracing::debug!(action, require_primary, "running transaction");
        if self.queue.on_queue_thread() {
            return self.run_transaction_on_queue(require_primary, body);
        }
        let this = self.clone();
        self.queue
            .enqueue(move || this.run_transaction_on_queue(require_primary, body))
            .join()
            .unwrap_or_else(|| Err(CoordinatorError::ShutDown.into()))
    }

    fn run_transaction_on_queue<T>(
        self: &Arc<Self>,
        require_primary: bool,
        body: impl FnOnce(&mut Transaction) -> crate::Result<T>,
    ) -> crate::Result<T> {
        let (store, inputs) = {
            let state = self.state();
            if !state.lease.started {
                return Err(CoordinatorError::NotStarted.into());
            }
            let Some(store) = state.store.clone() else {
                return Err(CoordinatorError::NotStarted.into());
            };
            (store, EligibilityInputs::from(&state.lease))
        };

        let result = store.run_read_write(ALL_STORES, |txn| {
            if require_primary {
                if !self.lease_manager.can_act_as_primary(txn, inputs)? {
                    return Err(CoordinatorError::PrimaryLeaseLost.into());
                }
                let value = body(txn)?;
                self.lease_manager.acquire_or_extend_lease(txn)?;
                Ok(value)
            } else {
                self.lease_manager.verify_allow_tab_synchronization(txn)?;
                body(txn)
            }
        });

        if let Err(err) = &result {
            if err.is_primary_lease_lost() {
                self.state().lease.is_primary = false;
                self.notify_primary_state(false);
            }
        }
        result
    }

    // Read-only surface ------------------------------------------------------

    /// Ids of clients whose heartbeat is fresh and which are not zombied.
    pub fn get_active_clients(&self) -> crate::Result<Vec<ClientId>> {
        self.check_usable()?;
        let store = {
            let state = self.state();
            state
                .store
                .clone()
                .ok_or(CoordinatorError::NotStarted)?
        };
        let now = self.time.now_ms();
        store.run_read_only(&[CLIENT_METADATA_STORE], |txn| {
            Ok(txn
                .all_client_metadata()?
                .into_iter()
                .filter(|metadata| self.lease_manager.client_is_active(now, metadata))
                .map(|metadata| metadata.client_id)
                .collect())
        })
    }

    // Collaborator accessors -------------------------------------------------

    pub fn mutation_queue(&self) -> crate::Result<MutationQueue> {
        self.check_usable()?;
        Ok(MutationQueue)
    }

    pub fn query_cache(&self) -> crate::Result<QueryCache> {
        self.check_usable()?;
        Ok(QueryCache)
    }

    pub fn remote_document_cache(&self) -> crate::Result<RemoteDocumentCache> {
        self.check_usable()?;
        Ok(RemoteDocumentCache)
    }

    // Internals --------------------------------------------------------------

    fn check_usable(&self) -> crate::Result<()> {
        let state = self.state();
        if let Some(reason) = &state.lease.persistence_error {
            return Err(CoordinatorError::Unavailable {
                reason: reason.clone(),
            }
            .into());
        }
        if state.shut_down {
            return Err(CoordinatorError::ShutDown.into());
        }
        if !state.lease.started {
            return Err(CoordinatorError::NotStarted.into());
        }
        Ok(())
    }

    fn state(&self) -> MutexGuard<'_, CoordinatorState> {
        self.state.lock().expect("coordinator state lock poisoned")
    }
}

fn log_refresh_error(err: &crate::Error) {
    if err.is_primary_lease_exclusive() {
        tracing::debug!("exclusive primary holds the lease; staying secondary");
    } else {
        tracing::warn!(error = %err, "metadata refresh failed");
    }
}
