//! Seeded randomized multi-client histories.
//!
//! Each seed drives an arbitrary interleaving of lifecycle and
//! eligibility events - starts, visibility and network flips, graceful
//! shutdowns, unloads, crashes - against one shared platform, then lets
//! the group quiesce and checks the invariants that must survive any
//! history: a single self-believed primary that matches the stored lease
//! owner, election of a primary while any client runs, and zombie
//! markers never removed while the client's metadata row survives.

use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use bellwether::test_harness::{ClientGroup, TestClient, fast_config, wait_until};
use bellwether::{
    ALL_STORES, ActivityEvent, ClientId, CoordinatorConfig, LocalStore, SideChannel,
};

const SEEDS: [u64; 4] = [7, 42, 1337, 0x9E37_79B9];
const STEPS_PER_HISTORY: usize = 32;
const MAX_CLIENTS: usize = 4;

struct History {
    group: ClientGroup,
    store: LocalStore,
    rng: StdRng,
    running: Vec<TestClient>,
    unloading: Vec<TestClient>,
}

impl History {
    fn new(seed: u64) -> Self {
        let group = ClientGroup::new();
        let store = group.open_store().expect("open raw store");
        Self {
            group,
            store,
            rng: StdRng::seed_from_u64(seed),
            running: Vec::new(),
            unloading: Vec::new(),
        }
    }

    fn spawn(&mut self) {
        let config = CoordinatorConfig {
            in_foreground: self.rng.random_bool(0.6),
            network_enabled: self.rng.random_bool(0.8),
            ..fast_config()
        };
        let client = self.group.started_client(config).expect("start client");
        self.running.push(client);
    }

    fn pick(&mut self) -> Option<usize> {
        if self.running.is_empty() {
            None
        } else {
            Some(self.rng.random_range(0..self.running.len()))
        }
    }

    fn step(&mut self) {
        match self.rng.random_range(0..8u32) {
            0 | 1 => {
                if self.running.len() < MAX_CLIENTS {
                    self.spawn();
                }
            }
            2 => {
                let in_foreground = self.rng.random_bool(0.6);
                if let Some(idx) = self.pick() {
                    self.running[idx]
                        .hub
                        .publish(ActivityEvent::Visibility { in_foreground });
                }
            }
            3 => {
                let enabled = self.rng.random_bool(0.8);
                if let Some(idx) = self.pick() {
                    self.running[idx]
                        .hub
                        .publish(ActivityEvent::NetworkEnabled { enabled });
                }
            }
            4 => {
                if let Some(idx) = self.pick() {
                    let client = self.running.swap_remove(idx);
                    client.coordinator.shutdown(false).expect("shutdown");
                    self.assert_zombie_ordering(client.coordinator.client_id(), "shutdown");
                }
            }
            5 => {
                if let Some(idx) = self.pick() {
                    let client = self.running.swap_remove(idx);
                    client.hub.publish(ActivityEvent::Unload);
                    self.unloading.push(client);
                }
            }
            6 => {
                // Crash: the client vanishes without any shutdown path.
                if let Some(idx) = self.pick() {
                    drop(self.running.swap_remove(idx));
                }
            }
            _ => {
                let pause = self.rng.random_range(2..20);
                std::thread::sleep(Duration::from_millis(pause));
            }
        }
    }

    fn settle_unloads(&mut self) {
        let unloading: Vec<TestClient> = self.unloading.drain(..).collect();
        for client in unloading {
            assert!(
                wait_until(Duration::from_secs(2), || !client.coordinator.started()),
                "unloaded client never shut down"
            );
            self.assert_zombie_ordering(client.coordinator.client_id(), "unload");
        }
    }

    /// Exactly one running client believes it is primary, and the stored
    /// lease row names that client.
    fn primary_is_unique_and_recorded(&self) -> bool {
        let primaries: Vec<&TestClient> = self
            .running
            .iter()
            .filter(|client| client.coordinator.is_primary())
            .collect();
        if primaries.len() != 1 {
            return false;
        }
        let owner = self
            .store
            .run_read_only(ALL_STORES, |txn| txn.primary_lease())
            .expect("read lease")
            .map(|lease| lease.owner_id);
        owner.as_ref() == Some(primaries[0].coordinator.client_id())
    }

    /// The marker may outlive the metadata row, never the reverse.
    fn assert_zombie_ordering(&self, client_id: &ClientId, context: &str) {
        let marker_key = self.group.database_info().zombie_marker_key(client_id);
        let marker = self.group.side_channel().get(&marker_key);
        let id = client_id.clone();
        let metadata = self
            .store
            .run_read_only(ALL_STORES, |txn| txn.client_metadata(&id))
            .expect("read metadata");
        assert!(
            !(metadata.is_some() && marker.is_none()),
            "{context}: zombie marker removed while client metadata survives"
        );
    }
}

#[test]
fn invariants_hold_across_seeded_histories() {
    for seed in SEEDS {
        let mut history = History::new(seed);
        history.spawn();
        for _ in 0..STEPS_PER_HISTORY {
            history.step();
        }
        history.settle_unloads();
        if history.running.is_empty() {
            history.spawn();
        }

        // Liveness and uniqueness at quiescence, whatever the history was.
        assert!(
            wait_until(Duration::from_secs(4), || {
                history.primary_is_unique_and_recorded()
            }),
            "seed {seed}: group failed to elect a single recorded primary"
        );

        let finished: Vec<TestClient> = history.running.drain(..).collect();
        for client in finished {
            client.coordinator.shutdown(false).expect("final shutdown");
            history.assert_zombie_ordering(client.coordinator.client_id(), "final shutdown");
        }
    }
}

#[test]
fn liveness_survives_repeated_primary_crashes() {
    for seed in [3u64, 11] {
        let mut rng = StdRng::seed_from_u64(seed);
        let group = ClientGroup::new();
        let mut running: Vec<TestClient> = (0..3)
            .map(|_| {
                group
                    .started_client(CoordinatorConfig {
                        in_foreground: rng.random_bool(0.5),
                        ..fast_config()
                    })
                    .expect("start client")
            })
            .collect();

        for round in 0..3 {
            assert!(
                wait_until(Duration::from_secs(4), || {
                    running
                        .iter()
                        .filter(|client| client.coordinator.is_primary())
                        .count()
                        == 1
                }),
                "seed {seed}, round {round}: no unique primary emerged"
            );
            let primary = running
                .iter()
                .position(|client| client.coordinator.is_primary())
                .expect("primary present");
            drop(running.swap_remove(primary));

            running.push(
                group
                    .started_client(CoordinatorConfig {
                        in_foreground: rng.random_bool(0.5),
                        ..fast_config()
                    })
                    .expect("start replacement"),
            );
        }

        for client in running {
            client.coordinator.shutdown(false).expect("final shutdown");
        }
    }
}
