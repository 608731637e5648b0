//! Shared timer service for request timeouts and heartbeats.
//!
//! One worker thread sleeps until the earliest deadline, fires due callbacks,
//! and goes back to sleep. Scheduling and cancellation are O(log n) against a
//! min-heap; cancelled entries are dropped lazily when they surface.
//!
//! Cancel-versus-fire is settled under the wheel lock: exactly one of the two
//! observes the entry, so a callback never runs after a successful cancel.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

type TimerCallback = Box<dyn FnOnce() + Send>;

/// Token for one scheduled timer; pass it back to `cancel`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerHandle {
    id: u64,
}

struct WheelState {
    /// Live callbacks by id; a missing id means cancelled or fired.
    entries: HashMap<u64, TimerCallback>,
    /// Min-heap of (deadline, id). May hold ghosts for cancelled entries.
    queue: BinaryHeap<Reverse<(Instant, u64)>>,
    next_id: u64,
    shutdown: bool,
}

struct Shared {
    state: Mutex<WheelState>,
    wake: Condvar,
}

/// Handle to the timer worker thread.
///
/// Dropping the wheel shuts the worker down; outstanding callbacks that have
/// not fired yet are discarded.
pub struct TimerWheel {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for TimerWheel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerWheel").finish_non_exhaustive()
    }
}

impl Default for TimerWheel {
    fn default() -> Self {
        Self::new()
    }
}

impl TimerWheel {
    /// Start the worker thread.
    pub fn new() -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(WheelState {
                entries: HashMap::new(),
                queue: BinaryHeap::new(),
                next_id: 0,
                shutdown: false,
            }),
            wake: Condvar::new(),
        });

        let worker_shared = Arc::clone(&shared);
        let worker = std::thread::Builder::new()
            .name("wireline-timer".to_string())
            .spawn(move || run_worker(&worker_shared))
            .expect("failed to spawn timer thread");

        Self {
            shared,
            worker: Some(worker),
        }
    }

    /// Schedule `callback` to run once after `delay` on the worker thread.
    ///
    /// Callbacks run with no wheel lock held, so they may schedule or cancel
    /// other timers freely.
    pub fn schedule(&self, delay: Duration, callback: impl FnOnce() + Send + 'static) -> TimerHandle {
        let deadline = Instant::now() + delay;
        let mut state = self.shared.state.lock().unwrap_or_else(|e| e.into_inner());
        let id = state.next_id;
        state.next_id += 1;
        state.entries.insert(id, Box::new(callback));
        state.queue.push(Reverse((deadline, id)));
        drop(state);
        self.shared.wake.notify_one();
        TimerHandle { id }
    }

    /// Cancel a scheduled timer. Returns `true` if the callback had not fired
    /// and now never will.
    pub fn cancel(&self, handle: TimerHandle) -> bool {
        let mut state = self.shared.state.lock().unwrap_or_else(|e| e.into_inner());
        state.entries.remove(&handle.id).is_some()
    }

    /// Timers currently scheduled and not yet fired or cancelled.
    pub fn scheduled(&self) -> usize {
        self.shared
            .state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entries
            .len()
    }
}

impl Drop for TimerWheel {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock().unwrap_or_else(|e| e.into_inner());
            state.shutdown = true;
        }
        self.shared.wake.notify_one();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn run_worker(shared: &Shared) {
    let mut state = shared.state.lock().unwrap_or_else(|e| e.into_inner());
    loop {
        if state.shutdown {
            return;
        }

        // Drop ghosts and find the next live deadline.
        let next_deadline = loop {
            match state.queue.peek() {
                Some(&Reverse((deadline, id))) => {
                    if !state.entries.contains_key(&id) {
                        state.queue.pop();
                        continue;
                    }
                    break Some((deadline, id));
                }
                None => break None,
            }
        };

        match next_deadline {
            Some((deadline, id)) => {
                let now = Instant::now();
                if deadline <= now {
                    state.queue.pop();
                    if let Some(callback) = state.entries.remove(&id) {
                        drop(state);
                        callback();
                        state = shared.state.lock().unwrap_or_else(|e| e.into_inner());
                    }
                } else {
                    let (next, _) = shared
                        .wake
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(|e| e.into_inner());
                    state = next;
                }
            }
            None => {
                state = shared.wake.wait(state).unwrap_or_else(|e| e.into_inner());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;

    #[test]
    fn test_fires_in_deadline_order() {
        let wheel = TimerWheel::new();
        let (tx, rx) = mpsc::channel();

        let tx1 = tx.clone();
        wheel.schedule(Duration::from_millis(30), move || tx1.send(2).unwrap());
        let tx2 = tx.clone();
        wheel.schedule(Duration::from_millis(10), move || tx2.send(1).unwrap());

        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), 1);
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), 2);
        assert_eq!(wheel.scheduled(), 0);
    }

    #[test]
    fn test_cancel_prevents_fire() {
        let wheel = TimerWheel::new();
        let fired = Arc::new(AtomicUsize::new(0));

        let fired2 = Arc::clone(&fired);
        let handle = wheel.schedule(Duration::from_millis(20), move || {
            fired2.fetch_add(1, Ordering::SeqCst);
        });
        assert!(wheel.cancel(handle));
        // Second cancel loses.
        assert!(!wheel.cancel(handle));

        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_cancel_after_fire_reports_false() {
        let wheel = TimerWheel::new();
        let (tx, rx) = mpsc::channel();
        let handle = wheel.schedule(Duration::from_millis(5), move || tx.send(()).unwrap());
        rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(!wheel.cancel(handle));
    }

    #[test]
    fn test_callback_can_schedule_another() {
        let wheel = Arc::new(TimerWheel::new());
        let (tx, rx) = mpsc::channel();

        let wheel2 = Arc::clone(&wheel);
        wheel.schedule(Duration::from_millis(5), move || {
            wheel2.schedule(Duration::from_millis(5), move || tx.send(()).unwrap());
        });

        rx.recv_timeout(Duration::from_secs(2)).unwrap();
    }

    #[test]
    fn test_earlier_timer_scheduled_while_sleeping() {
        let wheel = TimerWheel::new();
        let (tx, rx) = mpsc::channel();

        let tx_late = tx.clone();
        wheel.schedule(Duration::from_millis(200), move || tx_late.send(2).unwrap());
        // Worker is now asleep until the 200ms deadline; this must wake it.
        let tx_early = tx.clone();
        wheel.schedule(Duration::from_millis(10), move || tx_early.send(1).unwrap());

        assert_eq!(rx.recv_timeout(Duration::from_millis(150)).unwrap(), 1);
    }
}
