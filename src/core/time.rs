//! Layer 0: Time primitives
//!
//! Wall-clock source and the age-window check used for lease validity and
//! heartbeat freshness. Wall time is a measurement here, never a causal
//! ordering primitive: peers compare timestamps only against bounded age
//! windows, so loose cross-client clock sync (drift well under the window)
//! is sufficient.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Source of wall-clock milliseconds since the Unix epoch.
///
/// The coordinator takes this as a trait object so simulations can drive
/// time by hand.
pub trait TimeSource: Send + Sync {
    fn now_ms(&self) -> u64;
}

/// Production time source backed by `SystemTime`.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemTimeSource;

impl TimeSource for SystemTimeSource {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }
}

impl<T: TimeSource + ?Sized> TimeSource for Arc<T> {
    fn now_ms(&self) -> u64 {
        (**self).now_ms()
    }
}

/// Whether `update_ms` is within `max_age_ms` of `now_ms`.
///
/// A timestamp ahead of the local clock is treated as expired. Otherwise a
/// peer with a fast clock could publish a lease that never ages out here.
/// The skew is logged and nothing else; the next honest write repairs it.
pub fn is_within_age(now_ms: u64, update_ms: u64, max_age_ms: u64) -> bool {
    if update_ms > now_ms {
        tracing::warn!(
            update_ms,
            now_ms,
            "timestamp ahead of local clock; treating as expired"
        );
        return false;
    }
    now_ms - update_ms <= max_age_ms
}
