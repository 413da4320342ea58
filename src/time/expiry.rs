//! Deadline expiration: one heap, one worker.
//!
//! Channels register `(deadline, sink)` pairs; the manager fires
//! [`DeadlineSink::on_deadline`] at the earliest registered deadline. A
//! callback rescans its channel's queues, resolves expired entries with
//! `Timeout`, and re-registers the channel's next earliest deadline.
//!
//! Registrations are coalesced per channel: while a channel already has an
//! earlier pending registration, later ones are absorbed — the earlier fire's
//! rescan picks the next deadline up anyway. This keeps one heap entry per
//! channel in the common case and avoids redundant scans.
//!
//! The process-wide manager ([`ExpiryManager::global`]) runs a single
//! background worker that sleeps until the earliest deadline. Deterministic
//! tests build a private manager over a [`VirtualClock`] and call
//! [`ExpiryManager::process`] directly.

use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use super::clock::{Time, TimeSource, VirtualClock, WallClock};

/// Receiver of deadline callbacks.
///
/// Implementations scan their own pending queues for expired entries. The
/// callback runs on the expiry worker (or whichever caller invoked
/// [`ExpiryManager::process`]) with no expiry lock held, so it may take its
/// channel lock freely. Returning `Some(next)` re-registers the channel at
/// its next earliest deadline.
pub trait DeadlineSink: Send + Sync {
    /// Called when a registered deadline has passed.
    fn on_deadline(&self, now: Time) -> Option<Time>;
}

/// Hands out ids used to coalesce registrations per channel.
pub(crate) fn next_channel_id() -> u64 {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

struct ExpiryEntry {
    deadline: Time,
    channel_id: u64,
    seq: u64,
    sink: Weak<dyn DeadlineSink>,
}

impl Eq for ExpiryEntry {}

impl PartialEq for ExpiryEntry {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Ord for ExpiryEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Reverse for min-heap (earliest deadline first)
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for ExpiryEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

struct ExpiryState {
    heap: BinaryHeap<ExpiryEntry>,
    /// Earliest pending registration per channel, for coalescing.
    earliest: HashMap<u64, Time>,
    next_seq: u64,
    shutdown: bool,
}

/// Process-wide deadline heap with an optional background worker.
pub struct ExpiryManager {
    clock: Arc<dyn TimeSource>,
    state: Mutex<ExpiryState>,
    cv: Condvar,
    worker: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl std::fmt::Debug for ExpiryManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ExpiryManager")
            .field("pending", &state.heap.len())
            .field("channels", &state.earliest.len())
            .field("shutdown", &state.shutdown)
            .finish_non_exhaustive()
    }
}

impl ExpiryManager {
    /// Creates a manager over the given clock, without a worker.
    ///
    /// Callers are responsible for invoking [`process`](Self::process); this
    /// is the deterministic-test configuration.
    #[must_use]
    pub fn with_clock(clock: Arc<dyn TimeSource>) -> Arc<Self> {
        Arc::new(Self {
            clock,
            state: Mutex::new(ExpiryState {
                heap: BinaryHeap::new(),
                earliest: HashMap::new(),
                next_seq: 0,
                shutdown: false,
            }),
            cv: Condvar::new(),
            worker: Mutex::new(None),
        })
    }

    /// Creates a manager over a fresh [`VirtualClock`], returning both.
    ///
    /// Convenience for tests that need to advance time by hand.
    #[must_use]
    pub fn virtual_pair() -> (Arc<Self>, Arc<VirtualClock>) {
        let clock = Arc::new(VirtualClock::new());
        let manager = Self::with_clock(Arc::<VirtualClock>::clone(&clock) as Arc<dyn TimeSource>);
        (manager, clock)
    }

    /// Creates a manager over the given clock and spawns its worker thread.
    #[must_use]
    pub fn start(clock: Arc<dyn TimeSource>) -> Arc<Self> {
        let manager = Self::with_clock(clock);
        let for_worker = Arc::clone(&manager);
        let handle = std::thread::Builder::new()
            .name("altsync-expiry".into())
            .spawn(move || for_worker.worker_loop())
            .expect("failed to spawn expiry worker");
        *manager.worker.lock() = Some(handle);
        manager
    }

    /// Returns the process-wide manager, spawning its worker on first use.
    #[must_use]
    pub fn global() -> Arc<Self> {
        static GLOBAL: OnceLock<Arc<ExpiryManager>> = OnceLock::new();
        Arc::clone(GLOBAL.get_or_init(|| Self::start(Arc::new(WallClock::new()))))
    }

    /// Returns the current time from the underlying clock.
    #[must_use]
    pub fn now(&self) -> Time {
        self.clock.now()
    }

    /// Registers a deadline for the channel identified by `channel_id`.
    ///
    /// `Time::MAX` registrations are ignored ("never" expires). A
    /// registration later than the channel's earliest pending one is
    /// coalesced away.
    pub fn register(&self, channel_id: u64, deadline: Time, sink: Weak<dyn DeadlineSink>) {
        if deadline == Time::MAX {
            return;
        }
        {
            let mut state = self.state.lock();
            if state.shutdown {
                return;
            }
            if let Some(&pending) = state.earliest.get(&channel_id) {
                if pending <= deadline {
                    return;
                }
            }
            state.earliest.insert(channel_id, deadline);
            let seq = state.next_seq;
            state.next_seq += 1;
            state.heap.push(ExpiryEntry {
                deadline,
                channel_id,
                seq,
                sink,
            });
        }
        self.cv.notify_one();
    }

    /// Fires every registration due at `now`. Returns the number fired.
    ///
    /// Callbacks run with no expiry lock held; a callback returning
    /// `Some(next)` re-registers its channel.
    pub fn process(&self, now: Time) -> usize {
        let due = {
            let mut state = self.state.lock();
            Self::collect_due(&mut state, now)
        };
        let fired = due.len();
        self.fire(due, now);
        fired
    }

    fn fire(&self, due: Vec<(u64, Weak<dyn DeadlineSink>)>, now: Time) {
        for (channel_id, weak) in due {
            if let Some(sink) = weak.upgrade() {
                if let Some(next) = sink.on_deadline(now) {
                    self.register(channel_id, next, weak);
                }
            }
        }
    }

    fn collect_due(state: &mut ExpiryState, now: Time) -> Vec<(u64, Weak<dyn DeadlineSink>)> {
        let mut due = Vec::new();
        while let Some(entry) = state.heap.peek() {
            if entry.deadline > now {
                break;
            }
            let entry = state.heap.pop().expect("peeked entry vanished");
            if state.earliest.get(&entry.channel_id) == Some(&entry.deadline) {
                state.earliest.remove(&entry.channel_id);
            }
            due.push((entry.channel_id, entry.sink));
        }
        due
    }

    /// Returns the earliest pending deadline, if any.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Time> {
        self.state.lock().heap.peek().map(|e| e.deadline)
    }

    /// Returns the number of pending registrations.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.state.lock().heap.len()
    }

    /// Stops the worker (if any) and rejects further registrations.
    ///
    /// Used by tests that need the singleton torn down deterministically.
    pub fn shutdown(&self) {
        {
            let mut state = self.state.lock();
            state.shutdown = true;
            state.heap.clear();
            state.earliest.clear();
        }
        self.cv.notify_all();
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
    }

    fn worker_loop(self: Arc<Self>) {
        let mut state = self.state.lock();
        loop {
            if state.shutdown {
                break;
            }
            match state.heap.peek().map(|e| e.deadline) {
                None => self.cv.wait(&mut state),
                Some(next) => {
                    let now = self.clock.now();
                    if now >= next {
                        let due = Self::collect_due(&mut state, now);
                        drop(state);
                        tracing::trace!(fired = due.len(), "expiry worker firing");
                        self.fire(due, now);
                        state = self.state.lock();
                    } else {
                        let wait = Duration::from_nanos(next.duration_since(now));
                        self.cv.wait_for(&mut state, wait);
                    }
                }
            }
        }
    }
}
