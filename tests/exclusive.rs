//! Exclusive-access enforcement: a holder that refused tab
//! synchronization locks every peer out at startup.

use bellwether::test_harness::{ClientGroup, fast_config};
use bellwether::{CoordinatorConfig, CoordinatorError};

fn exclusive_config() -> CoordinatorConfig {
    CoordinatorConfig {
        allow_tab_synchronization: false,
        ..fast_config()
    }
}

#[test]
fn peer_startup_fails_and_leaves_the_lease_untouched() {
    let group = ClientGroup::new();
    let a = group.started_client(exclusive_config()).unwrap();
    assert!(a.coordinator.is_primary());

    let b = group.client(fast_config());
    let err = b.start(None).unwrap_err();
    assert!(err.is_primary_lease_exclusive());

    let lease = a
        .coordinator
        .run_transaction("inspectLease", false, |txn| txn.primary_lease())
        .unwrap()
        .expect("lease must survive the rejected startup");
    assert_eq!(&lease.owner_id, a.coordinator.client_id());
    assert!(!lease.allow_tab_synchronization);

    // The rejected client's first heartbeat aborted wholesale: no
    // metadata row leaked into the store.
    assert_eq!(
        a.coordinator.get_active_clients().unwrap(),
        vec![a.coordinator.client_id().clone()]
    );

    a.coordinator.shutdown(false).unwrap();
}

#[test]
fn rejected_startup_latches_the_failure() {
    let group = ClientGroup::new();
    let a = group.started_client(exclusive_config()).unwrap();

    let b = group.client(fast_config());
    assert!(b.start(None).is_err());

    assert!(matches!(
        b.get_active_clients(),
        Err(bellwether::Error::Coordinator(
            CoordinatorError::Unavailable { .. }
        ))
    ));
    assert!(matches!(
        b.start(None),
        Err(bellwether::Error::Coordinator(
            CoordinatorError::Unavailable { .. }
        ))
    ));

    a.coordinator.shutdown(false).unwrap();
}

#[test]
fn lease_released_by_exclusive_holder_frees_the_database() {
    let group = ClientGroup::new();
    let a = group.started_client(exclusive_config()).unwrap();
    a.coordinator.shutdown(false).unwrap();

    let b = group.started_client(fast_config()).unwrap();
    assert!(b.coordinator.is_primary());
    b.coordinator.shutdown(false).unwrap();
}
