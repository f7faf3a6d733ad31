//! Single-threaded cooperative task queue.
//!
//! All coordinator-initiated work (heartbeat ticks, eligibility reactions,
//! shutdown) runs FIFO on one worker thread, so coordinator state never
//! sees parallel mutation; the only races left are between clients through
//! the shared store. Delayed tasks share the worker: the loop sleeps until
//! the earliest pending deadline and otherwise drains the task channel.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use crossbeam::channel::{Receiver, Sender, bounded, unbounded};

type Task = Box<dyn FnOnce() + Send>;

enum QueueMsg {
    Run(Task),
    /// Wake the worker to recompute its delayed-task deadline.
    Poke,
    Shutdown,
}

struct DelayedEntry {
    fire_at: Instant,
    seq: u64,
    cancelled: Arc<AtomicBool>,
    task: Task,
}

impl PartialEq for DelayedEntry {
    fn eq(&self, other: &Self) -> bool {
        self.fire_at == other.fire_at && self.seq == other.seq
    }
}

impl Eq for DelayedEntry {}

impl PartialOrd for DelayedEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DelayedEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.fire_at
            .cmp(&other.fire_at)
            .then_with(|| self.seq.cmp(&other.seq))
    }
}

/// Cancelation handle for a delayed task.
///
/// Best-effort: a task that has already started is not aborted.
pub struct DelayedTask {
    cancelled: Arc<AtomicBool>,
}

impl DelayedTask {
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Completion handle for an enqueued task with a result.
pub struct TaskHandle<T> {
    rx: Receiver<T>,
}

impl<T> TaskHandle<T> {
    /// Block until the task ran. `None` means the queue shut down first.
    pub fn join(self) -> Option<T> {
        self.rx.recv().ok()
    }
}

pub struct TaskQueue {
    tx: Sender<QueueMsg>,
    delayed: Arc<Mutex<BinaryHeap<Reverse<DelayedEntry>>>>,
    seq: AtomicU64,
    worker_thread: ThreadId,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl TaskQueue {
    pub fn new(name: &str) -> Self {
        let (tx, rx) = unbounded::<QueueMsg>();
        let delayed: Arc<Mutex<BinaryHeap<Reverse<DelayedEntry>>>> =
            Arc::new(Mutex::new(BinaryHeap::new()));
        let worker_delayed = delayed.clone();
        let worker = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || run_worker(rx, worker_delayed))
            .expect("spawn task queue worker");
        let worker_thread = worker.thread().id();
        Self {
            tx,
            delayed,
            seq: AtomicU64::new(0),
            worker_thread,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Whether the caller is already on the queue's worker thread.
    pub fn on_queue_thread(&self) -> bool {
        thread::current().id() == self.worker_thread
    }

    /// Schedule a task and discard its outcome.
    pub fn enqueue_and_forget(&self, task: impl FnOnce() + Send + 'static) {
        let _ = self.tx.send(QueueMsg::Run(Box::new(task)));
    }

    /// Schedule a task and return a handle for its result.
    pub fn enqueue<T: Send + 'static>(
        &self,
        task: impl FnOnce() -> T + Send + 'static,
    ) -> TaskHandle<T> {
        let (result_tx, result_rx) = bounded(1);
        self.enqueue_and_forget(move || {
            let _ = result_tx.send(task());
        });
        TaskHandle { rx: result_rx }
    }

    /// Schedule a task to run once after `delay`, unless cancelled first.
    pub fn enqueue_after(
        &self,
        delay: Duration,
        task: impl FnOnce() + Send + 'static,
    ) -> DelayedTask {
        let cancelled = Arc::new(AtomicBool::new(false));
        let entry = DelayedEntry {
            fire_at: Instant::now() + delay,
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
            cancelled: cancelled.clone(),
            task: Box::new(task),
        };
        if let Ok(mut heap) = self.delayed.lock() {
            heap.push(Reverse(entry));
        }
        let _ = self.tx.send(QueueMsg::Poke);
        DelayedTask { cancelled }
    }

    /// Stop the worker after draining already-queued tasks. Pending delayed
    /// tasks are dropped. Idempotent; must not be called from the worker
    /// itself.
    pub fn shutdown(&self) {
        let handle = match self.worker.lock() {
            Ok(mut worker) => worker.take(),
            Err(_) => None,
        };
        if let Some(handle) = handle {
            let _ = self.tx.send(QueueMsg::Shutdown);
            let _ = handle.join();
        }
    }
}

impl Drop for TaskQueue {
    fn drop(&mut self) {
        if !self.on_queue_thread() {
            self.shutdown();
        }
    }
}

fn run_worker(rx: Receiver<QueueMsg>, delayed: Arc<Mutex<BinaryHeap<Reverse<DelayedEntry>>>>) {
    loop {
        let next_deadline = delayed
            .lock()
            .ok()
            .and_then(|heap| heap.peek().map(|Reverse(entry)| entry.fire_at));
        let tick = match next_deadline {
            Some(deadline) => {
                crossbeam::channel::after(deadline.saturating_duration_since(Instant::now()))
            }
            None => crossbeam::channel::never(),
        };

        crossbeam::select! {
            recv(rx) -> msg => match msg {
                Ok(QueueMsg::Run(task)) => task(),
                Ok(QueueMsg::Poke) => {}
                Ok(QueueMsg::Shutdown) | Err(_) => return,
            },
            recv(tick) -> _ => {
                for task in take_due(&delayed) {
                    task();
                }
            }
        }
    }
}

fn take_due(delayed: &Mutex<BinaryHeap<Reverse<DelayedEntry>>>) -> Vec<Task> {
    let mut due = Vec::new();
    let Ok(mut heap) = delayed.lock() else {
        return due;
    };
    let now = Instant::now();
    while let Some(Reverse(entry)) = heap.peek() {
        if entry.fire_at > now {
            break;
        }
        let Some(Reverse(entry)) = heap.pop() else {
            break;
        };
        if !entry.cancelled.load(Ordering::SeqCst) {
            due.push(entry.task);
        }
    }
    due
}
