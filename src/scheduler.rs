//! Task and timer scheduler backing delayed callbacks and request timeouts.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::trace;

type Callback = Box<dyn FnOnce() + Send + 'static>;

/// Handle to a scheduled task.
///
/// Exactly one of `cancel()` and the worker thread claims the task; the claim
/// is a single compare-exchange, so a callback whose cancellation succeeded is
/// guaranteed to never run, and `cancel()` returning `false` means the
/// callback ran or is running.
#[derive(Debug, Clone)]
pub struct TimerHandle {
    claimed: Arc<AtomicBool>,
}

impl TimerHandle {
    fn new() -> Self {
        TimerHandle {
            claimed: Arc::new(AtomicBool::new(false)),
        }
    }

    fn claim(&self) -> bool {
        self.claimed
            .compare_exchange(
                false,
                true,
                AtomicOrdering::AcqRel,
                AtomicOrdering::Acquire,
            )
            .is_ok()
    }

    /// Returns `true` iff cancellation won the race before the callback fired.
    pub fn cancel(&self) -> bool {
        self.claim()
    }
}

struct Task {
    due: Instant,
    seq: u64,
    handle: TimerHandle,
    callback: Callback,
}

// BinaryHeap is a max-heap; reverse so the earliest due time pops first,
// with the insertion sequence breaking ties.
impl Ord for Task {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Task {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Task {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for Task {}

struct Shared {
    queue: Mutex<Queue>,
    available: Condvar,
}

impl std::fmt::Debug for Shared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shared").finish_non_exhaustive()
    }
}

struct Queue {
    tasks: BinaryHeap<Task>,
    next_seq: u64,
    running: bool,
}

/// A worker thread executing scheduled callbacks in due-time order.
#[derive(Debug)]
pub struct Scheduler {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new() -> Self {
        let shared = Arc::new(Shared {
            queue: Mutex::new(Queue {
                tasks: BinaryHeap::new(),
                next_seq: 0,
                running: true,
            }),
            available: Condvar::new(),
        });

        let worker = {
            let shared = shared.clone();
            thread::Builder::new()
                .name("kadmos-scheduler".into())
                .spawn(move || run_worker(shared))
                .ok()
        };

        Scheduler {
            shared,
            worker: Mutex::new(worker),
        }
    }

    /// Schedule a callback to run as soon as possible.
    pub fn schedule<F: FnOnce() + Send + 'static>(&self, callback: F) -> TimerHandle {
        self.schedule_after(Duration::ZERO, callback)
    }

    /// Schedule a callback to run after `delay`, unless cancelled first.
    pub fn schedule_after<F: FnOnce() + Send + 'static>(
        &self,
        delay: Duration,
        callback: F,
    ) -> TimerHandle {
        let handle = TimerHandle::new();

        let mut queue = self.shared.queue.lock().expect("scheduler lock poisoned");

        if !queue.running {
            // Shutting down; hand back an already-claimed handle so the
            // callback is observably dead.
            handle.claim();
            return handle;
        }

        let seq = queue.next_seq;
        queue.next_seq += 1;

        queue.tasks.push(Task {
            due: Instant::now() + delay,
            seq,
            handle: handle.clone(),
            callback: Box::new(callback),
        });

        drop(queue);
        self.shared.available.notify_one();

        handle
    }

    /// Stop the worker and drop unfired tasks.
    pub fn shutdown(&self) {
        {
            let mut queue = self.shared.queue.lock().expect("scheduler lock poisoned");
            queue.running = false;
            queue.tasks.clear();
        }
        self.shared.available.notify_all();

        let worker = self.worker.lock().expect("scheduler lock poisoned").take();
        if let Some(worker) = worker {
            let _ = worker.join();
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_worker(shared: Arc<Shared>) {
    let mut queue = shared.queue.lock().expect("scheduler lock poisoned");

    loop {
        if !queue.running {
            break;
        }

        let now = Instant::now();

        match queue.tasks.peek() {
            Some(task) if task.due <= now => {
                let task = queue.tasks.pop().expect("peeked task exists");

                // Run outside the lock; callbacks may schedule more tasks.
                drop(queue);

                if task.handle.claim() {
                    trace!(context = "scheduler", seq = task.seq, "Running task");
                    (task.callback)();
                }

                queue = shared.queue.lock().expect("scheduler lock poisoned");
            }
            Some(task) => {
                let wait = task.due - now;
                let (guard, _) = shared
                    .available
                    .wait_timeout(queue, wait)
                    .expect("scheduler lock poisoned");
                queue = guard;
            }
            None => {
                queue = shared
                    .available
                    .wait(queue)
                    .expect("scheduler lock poisoned");
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn runs_scheduled_callbacks() {
        let scheduler = Scheduler::new();
        let (tx, rx) = flume::bounded(1);

        scheduler.schedule(move || {
            let _ = tx.send(42);
        });

        assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), 42);
    }

    #[test]
    fn respects_delays_and_ordering() {
        let scheduler = Scheduler::new();
        let (tx, rx) = flume::unbounded();

        let tx2 = tx.clone();
        scheduler.schedule_after(Duration::from_millis(60), move || {
            let _ = tx2.send("late");
        });
        scheduler.schedule_after(Duration::from_millis(10), move || {
            let _ = tx.send("early");
        });

        assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), "early");
        assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), "late");
    }

    #[test]
    fn cancelled_tasks_never_run() {
        let scheduler = Scheduler::new();
        let fired = Arc::new(AtomicUsize::new(0));

        let fired2 = fired.clone();
        let handle = scheduler.schedule_after(Duration::from_millis(50), move || {
            fired2.fetch_add(1, AtomicOrdering::SeqCst);
        });

        assert!(handle.cancel());
        // Second cancel loses the (already decided) race.
        assert!(!handle.cancel());

        thread::sleep(Duration::from_millis(120));
        assert_eq!(fired.load(AtomicOrdering::SeqCst), 0);
    }

    #[test]
    fn cancel_after_fire_returns_false() {
        let scheduler = Scheduler::new();
        let (tx, rx) = flume::bounded(1);

        let handle = scheduler.schedule(move || {
            let _ = tx.send(());
        });

        rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert!(!handle.cancel());
    }

    #[test]
    fn shutdown_drops_pending_tasks() {
        let scheduler = Scheduler::new();
        let fired = Arc::new(AtomicUsize::new(0));

        let fired2 = fired.clone();
        scheduler.schedule_after(Duration::from_millis(50), move || {
            fired2.fetch_add(1, AtomicOrdering::SeqCst);
        });

        scheduler.shutdown();

        thread::sleep(Duration::from_millis(80));
        assert_eq!(fired.load(AtomicOrdering::SeqCst), 0);
    }
}
