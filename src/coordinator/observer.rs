//! Visibility, network, and unload signals from the hosting surface.
//!
//! The embedder publishes events into an `ActivityHub`; each coordinator
//! holds a subscription whose worker thread forwards events into the
//! coordinator. Subscriptions are scoped resources: attach registers a
//! receiver, detach stops the worker and drops it, and every shutdown path
//! detaches (startup failure included).

use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use crossbeam::channel::{Receiver, Sender, unbounded};

/// A transition reported by the hosting surface.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ActivityEvent {
    /// The surface became user-visible or stopped being so.
    Visibility { in_foreground: bool },
    /// Network I/O was enabled or disabled for this client.
    NetworkEnabled { enabled: bool },
    /// The process is about to terminate. Handlers get no chance to await
    /// asynchronous work after this.
    Unload,
}

/// Fan-out point for activity events.
///
/// One hub per hosting surface; any number of subscribed coordinators.
pub struct ActivityHub {
    subscribers: Mutex<Vec<Sender<ActivityEvent>>>,
}

impl ActivityHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            subscribers: Mutex::new(Vec::new()),
        })
    }

    /// Deliver `event` to every live subscription.
    pub fn publish(&self, event: ActivityEvent) {
        let Ok(mut subscribers) = self.subscribers.lock() else {
            return;
        };
        subscribers.retain(|tx| tx.send(event).is_ok());
    }

    pub(crate) fn subscribe(&self) -> Receiver<ActivityEvent> {
        let (tx, rx) = unbounded();
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.push(tx);
        }
        rx
    }
}

enum WorkerMsg {
    Event(ActivityEvent),
    Stop,
}

/// One coordinator's attachment to a hub.
pub(crate) struct ActivitySubscription {
    stop_tx: Sender<()>,
    worker: Option<JoinHandle<()>>,
}

impl ActivitySubscription {
    /// Spawn a worker forwarding hub events into `handler` until detached.
    /// The handler runs on the subscription thread; `Unload` handling in
    /// particular relies on that thread being allowed to do synchronous
    /// side-channel writes.
    pub(crate) fn attach(
        hub: &ActivityHub,
        handler: impl Fn(ActivityEvent) + Send + 'static,
    ) -> Self {
        let events = hub.subscribe();
        let (stop_tx, stop_rx) = unbounded::<()>();
        let worker = thread::Builder::new()
            .name("bellwether-activity".to_string())
            .spawn(move || {
                loop {
                    let msg = crossbeam::select! {
                        recv(events) -> event => match event {
                            Ok(event) => WorkerMsg::Event(event),
                            Err(_) => WorkerMsg::Stop,
                        },
                        recv(stop_rx) -> _ => WorkerMsg::Stop,
                    };
                    match msg {
                        WorkerMsg::Event(event) => handler(event),
                        WorkerMsg::Stop => return,
                    }
                }
            })
            .expect("spawn activity subscription worker");
        Self {
            stop_tx,
            worker: Some(worker),
        }
    }

    /// Stop the worker and wait for it. Safe to call once per subscription;
    /// dropping without detaching also stops the worker.
    pub(crate) fn detach(&mut self) {
        let _ = self.stop_tx.send(());
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for ActivitySubscription {
    fn drop(&mut self) {
        self.detach();
    }
}
