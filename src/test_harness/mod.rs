//! Shared helpers for exercising multi-client histories in tests.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::config::CoordinatorConfig;
use crate::coordinator::{ActivityHub, Coordinator};
use crate::core::identity::{DatabaseInfo, PersistenceKey, ProjectId};
use crate::core::time::TimeSource;
use crate::store::collaborators::{SCHEMA_VERSION, define_schema};
use crate::store::local::{LocalStore, Platform};
use crate::store::side_channel::SideChannel;

/// Hand-driven clock for deterministic lease evaluation tests.
#[derive(Clone)]
pub struct TestClock {
    now: Arc<AtomicU64>,
}

impl TestClock {
    pub fn new(start_ms: u64) -> Self {
        Self {
            now: Arc::new(AtomicU64::new(start_ms)),
        }
    }

    pub fn now_ms(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }

    pub fn advance_ms(&self, delta_ms: u64) {
        self.now.fetch_add(delta_ms, Ordering::SeqCst);
    }

    pub fn set_ms(&self, now_ms: u64) {
        self.now.store(now_ms, Ordering::SeqCst);
    }
}

impl TimeSource for TestClock {
    fn now_ms(&self) -> u64 {
        self.now_ms()
    }
}

/// Timing profile that compresses the protocol windows so integration
/// tests settle in tens of milliseconds of real time.
pub fn fast_config() -> CoordinatorConfig {
    CoordinatorConfig {
        metadata_refresh_interval_ms: 25,
        metadata_max_age_ms: 120,
        ..CoordinatorConfig::default()
    }
}

/// One coordinator plus the activity hub standing in for its hosting
/// surface. Hubs are per-client: each simulated tab gets its own window.
pub struct TestClient {
    pub coordinator: Arc<Coordinator>,
    pub hub: Arc<ActivityHub>,
}

/// One simulated client group: a shared platform plus the database
/// identity every spawned coordinator contends over.
pub struct ClientGroup {
    platform: Arc<Platform>,
    database_info: DatabaseInfo,
}

impl ClientGroup {
    pub fn new() -> Self {
        Self {
            platform: Platform::new(),
            database_info: DatabaseInfo::new(
                PersistenceKey::new("harness").expect("valid key"),
                ProjectId::new("test-project").expect("valid project"),
                None,
            ),
        }
    }

    pub fn platform(&self) -> &Arc<Platform> {
        &self.platform
    }

    pub fn database_info(&self) -> &DatabaseInfo {
        &self.database_info
    }

    pub fn side_channel(&self) -> Arc<dyn SideChannel> {
        self.platform.side_channel()
    }

    /// Spawn a coordinator without starting it.
    pub fn client(&self, config: CoordinatorConfig) -> Arc<Coordinator> {
        Coordinator::new(self.platform.clone(), self.database_info.clone(), config)
    }

    /// Spawn and start a coordinator attached to a fresh hub.
    pub fn started_client(&self, config: CoordinatorConfig) -> crate::Result<TestClient> {
        let coordinator = self.client(config);
        let hub = ActivityHub::new();
        coordinator.start(Some(&hub))?;
        Ok(TestClient { coordinator, hub })
    }

    /// Raw connection to the shared database, bypassing any coordinator.
    /// Invariant checks read lease and metadata rows through this.
    pub fn open_store(&self) -> crate::Result<LocalStore> {
        Ok(self
            .platform
            .open_or_create(
                &crate::paths::database_name(&self.database_info),
                SCHEMA_VERSION,
                define_schema,
            )?)
    }
}

impl Default for ClientGroup {
    fn default() -> Self {
        Self::new()
    }
}

/// Listener capturing every primary-state callback in order.
#[derive(Clone, Default)]
pub struct RecordingListener {
    states: Arc<Mutex<Vec<bool>>>,
}

impl RecordingListener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn install(&self, coordinator: &Arc<Coordinator>) {
        let states = self.states.clone();
        coordinator.set_primary_state_listener(move |is_primary| {
            states.lock().expect("listener states lock").push(is_primary);
            Ok(())
        });
    }

    pub fn states(&self) -> Vec<bool> {
        self.states.lock().expect("listener states lock").clone()
    }

    pub fn last(&self) -> Option<bool> {
        self.states().last().copied()
    }
}

/// Poll `probe` until it holds or `timeout` elapses.
pub fn wait_until(timeout: Duration, probe: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if probe() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_advances_by_hand_only() {
        let clock = TestClock::new(100);
        assert_eq!(clock.now_ms(), 100);
        clock.advance_ms(50);
        assert_eq!(clock.now_ms(), 150);
        clock.set_ms(42);
        assert_eq!(TimeSource::now_ms(&clock), 42);
    }

    #[test]
    fn wait_until_times_out() {
        assert!(!wait_until(Duration::from_millis(20), || false));
        assert!(wait_until(Duration::from_millis(20), || true));
    }
}
