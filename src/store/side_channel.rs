//! Synchronous best-effort side channel.
//!
//! Zombie markers cannot go through the transactional store: a client
//! announcing its own termination may have no time left for asynchronous
//! I/O, so the write must complete synchronously or not at all. The
//! channel is best-effort by contract; every reader degrades to "marker
//! absent" when it is unavailable.

use std::collections::HashMap;
use std::sync::Mutex;

/// Synchronous string-keyed map.
///
/// All three operations are infallible at the signature level;
/// implementations swallow their own failures (`get` returns `None`,
/// `set`/`remove` become no-ops) and report health through `available`.
pub trait SideChannel: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str);
    fn remove(&self, key: &str);

    /// Whether the channel is believed to be working. Callers log degraded
    /// reads when this is false.
    fn available(&self) -> bool {
        true
    }
}

/// In-process side channel shared by every client of a `Platform`.
#[derive(Default)]
pub struct MemorySideChannel {
    entries: Mutex<HashMap<String, String>>,
}

impl MemorySideChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SideChannel for MemorySideChannel {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.lock().ok()?.get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(key.to_string(), value.to_string());
        }
    }

    fn remove(&self, key: &str) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.remove(key);
        }
    }
}

/// Side channel for hosts without synchronous shared storage. Zombie
/// detection degrades to timeout-only; liveness is slower but correctness
/// holds.
#[derive(Clone, Copy, Debug, Default)]
pub struct UnavailableSideChannel;

impl SideChannel for UnavailableSideChannel {
    fn get(&self, key: &str) -> Option<String> {
        tracing::debug!(key, "side channel unavailable; read degrades to absent");
        None
    }

    fn set(&self, key: &str, _value: &str) {
        tracing::debug!(key, "side channel unavailable; dropping write");
    }

    fn remove(&self, key: &str) {
        tracing::debug!(key, "side channel unavailable; dropping removal");
    }

    fn available(&self) -> bool {
        false
    }
}
