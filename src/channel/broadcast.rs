//! Broadcast channels: one write delivered to N readers atomically.
//!
//! A write blocks until the reader count reaches the active threshold
//! (`initial_barrier` before the first delivery, `minimum` afterwards), then
//! offers to every registered reader all-or-nothing. Any reader veto vetoes
//! the delivery; the vetoing reader is dequeued and the threshold re-checked.
//! On commit every reader's promise resolves to a clone of the same value.
//! Broadcasts are not buffered.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, Weak};
use std::task::{Context, Poll};

use crate::error::{Error, Result};
use crate::offer::{self, OfferRef};
use crate::time::{next_channel_id, Deadline, DeadlineSink, ExpiryManager, Time};

use super::promise::Promise;

struct ReaderEntry<T> {
    seq: u64,
    offer: OfferRef,
    promise: Promise<T>,
    deadline: Time,
}

struct WriterEntry<T> {
    seq: u64,
    offer: OfferRef,
    promise: Promise<()>,
    deadline: Time,
    value: Option<T>,
}

struct Inner<T> {
    readers: VecDeque<ReaderEntry<T>>,
    writers: VecDeque<WriterEntry<T>>,
    first_delivery_done: bool,
    retired: bool,
    last_read_tick: Time,
    last_write_tick: Time,
    next_seq: u64,
}

impl<T> Inner<T> {
    fn alloc_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    fn finalize(&mut self) {
        self.retired = true;
        for reader in self.readers.drain(..) {
            reader.promise.resolve(Err(Error::retired()));
        }
        for writer in self.writers.drain(..) {
            writer.promise.resolve(Err(Error::retired()));
        }
    }

    fn next_deadline(&self) -> Option<Time> {
        let readers = self.readers.iter().map(|r| r.deadline);
        let writers = self.writers.iter().map(|w| w.deadline);
        readers.chain(writers).filter(|&d| d < Time::MAX).min()
    }
}

pub(crate) struct BroadcastShared<T> {
    name: Option<String>,
    initial_barrier: usize,
    minimum: usize,
    timer: Arc<ExpiryManager>,
    id: u64,
    inner: Mutex<Inner<T>>,
}

impl<T: Clone> BroadcastShared<T> {
    fn lock(&self) -> std::sync::MutexGuard<'_, Inner<T>> {
        self.inner.lock().expect("broadcast lock poisoned")
    }

    fn required(&self, inner: &Inner<T>) -> usize {
        if inner.first_delivery_done {
            self.minimum
        } else {
            self.initial_barrier
        }
    }

    /// Delivers as many head writers as the registered readers allow.
    ///
    /// Runs under the channel lock. Each round offers to every reader
    /// all-or-nothing, then to the writer; a reader veto dequeues that
    /// reader and retries, a writer veto dequeues that writer and retries.
    fn try_deliver(&self, inner: &mut Inner<T>, now: Time) {
        loop {
            if inner.writers.is_empty() || inner.readers.len() < self.required(inner) {
                return;
            }

            let mut accepted = 0_usize;
            let mut vetoed = None;
            for (i, reader) in inner.readers.iter().enumerate() {
                if offer::accepts(&reader.offer) {
                    accepted = i + 1;
                } else {
                    vetoed = Some(i);
                    break;
                }
            }
            if let Some(pos) = vetoed {
                for reader in inner.readers.iter().take(accepted) {
                    offer::withdraw(&reader.offer);
                }
                let reader = inner.readers.remove(pos).expect("position out of range");
                reader.promise.resolve(Err(Error::cancelled()));
                continue;
            }

            let writer_accepts =
                offer::accepts(&inner.writers.front().expect("writer head vanished").offer);
            if !writer_accepts {
                for reader in &inner.readers {
                    offer::withdraw(&reader.offer);
                }
                let writer = inner.writers.pop_front().expect("writer head vanished");
                writer.promise.resolve(Err(Error::cancelled()));
                continue;
            }

            let mut writer = inner.writers.pop_front().expect("writer head vanished");
            offer::commit(&writer.offer);
            let value = writer.value.take().expect("queued writer without value");
            let fanout = inner.readers.len();
            for reader in inner.readers.drain(..) {
                offer::commit(&reader.offer);
                reader.promise.resolve(Ok(value.clone()));
            }
            writer.promise.resolve(Ok(()));
            inner.first_delivery_done = true;
            inner.last_write_tick = now;
            inner.last_read_tick = now;
            tracing::trace!(channel = self.id, fanout, "broadcast delivered");
        }
    }
}

impl<T: Clone + Send + 'static> DeadlineSink for BroadcastShared<T> {
    fn on_deadline(&self, now: Time) -> Option<Time> {
        let mut inner = self.lock();
        if inner.retired {
            return None;
        }
        inner.readers.retain(|reader| {
            if reader.deadline <= now {
                reader.promise.resolve(Err(Error::timeout()));
                false
            } else {
                true
            }
        });
        inner.writers.retain(|writer| {
            if writer.deadline <= now {
                writer.promise.resolve(Err(Error::timeout()));
                false
            } else {
                true
            }
        });
        inner.next_deadline()
    }
}

/// Options for constructing a [`Broadcast`].
#[derive(Debug, Clone)]
pub struct BroadcastBuilder {
    name: Option<String>,
    initial_barrier: usize,
    minimum: usize,
    timer: Option<Arc<ExpiryManager>>,
}

impl Default for BroadcastBuilder {
    fn default() -> Self {
        Self {
            name: None,
            initial_barrier: 1,
            minimum: 1,
            timer: None,
        }
    }
}

impl BroadcastBuilder {
    /// Creates a builder with default options (both thresholds 1).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the channel's name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Minimum readers required before the first write may proceed.
    #[must_use]
    pub fn with_initial_barrier(mut self, readers: usize) -> Self {
        self.initial_barrier = readers;
        self
    }

    /// Minimum readers required for any later write.
    #[must_use]
    pub fn with_minimum(mut self, readers: usize) -> Self {
        self.minimum = readers;
        self
    }

    /// Wires the channel to a non-global expiry manager (deterministic
    /// tests).
    #[must_use]
    pub fn with_timer(mut self, timer: Arc<ExpiryManager>) -> Self {
        self.timer = Some(timer);
        self
    }

    /// Builds the broadcast channel.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for an empty name.
    pub fn build<T: Clone + Send + 'static>(&self) -> Result<Broadcast<T>> {
        if let Some(name) = &self.name {
            if name.is_empty() {
                return Err(Error::invalid_argument().with_context("channel name is empty"));
            }
        }
        let timer = self.timer.clone().unwrap_or_else(ExpiryManager::global);
        let now = timer.now();
        Ok(Broadcast {
            shared: Arc::new(BroadcastShared {
                name: self.name.clone(),
                initial_barrier: self.initial_barrier,
                minimum: self.minimum,
                timer,
                id: next_channel_id(),
                inner: Mutex::new(Inner {
                    readers: VecDeque::new(),
                    writers: VecDeque::new(),
                    first_delivery_done: false,
                    retired: false,
                    last_read_tick: now,
                    last_write_tick: now,
                    next_seq: 0,
                }),
            }),
        })
    }
}

/// A broadcast channel delivering each write to all registered readers.
///
/// # Example
///
/// ```
/// use altsync::channel::BroadcastBuilder;
/// use altsync::time::Deadline;
///
/// let b = BroadcastBuilder::new().build::<u32>().expect("valid options");
/// let r1 = b.read(Deadline::Never);
/// let r2 = b.read(Deadline::Never);
/// // Two readers registered; the default threshold of one is met.
/// # drop((r1, r2));
/// ```
pub struct Broadcast<T: Clone> {
    shared: Arc<BroadcastShared<T>>,
}

impl<T: Clone> Clone for Broadcast<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Clone> std::fmt::Debug for Broadcast<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broadcast")
            .field("id", &self.shared.id)
            .field("name", &self.shared.name)
            .finish_non_exhaustive()
    }
}

impl<T: Clone + Send + 'static> Broadcast<T> {
    /// Registers a reader and waits for the next delivery.
    #[must_use]
    pub fn read(&self, deadline: Deadline) -> BroadcastRead<T> {
        self.read_with(None, deadline)
    }

    /// Registers a reader with an offer handle attached.
    #[must_use]
    pub fn read_with(&self, handle: OfferRef, deadline: Deadline) -> BroadcastRead<T> {
        let shared = &self.shared;
        let mut inner = shared.lock();
        if inner.retired {
            return BroadcastRead {
                promise: Promise::resolved(Err(Error::retired())),
                origin: None,
            };
        }
        let now = shared.timer.now();
        let abs = deadline.resolve(now);

        let promise = Promise::new();
        let seq = inner.alloc_seq();
        inner.readers.push_back(ReaderEntry {
            seq,
            offer: handle,
            promise: promise.clone(),
            deadline: abs,
        });
        shared.try_deliver(&mut inner, now);

        if promise.is_resolved() {
            return BroadcastRead {
                promise,
                origin: None,
            };
        }
        if abs <= now {
            // Immediate probe: leave nothing behind.
            if let Some(pos) = inner.readers.iter().position(|r| r.seq == seq) {
                inner.readers.remove(pos);
            }
            return BroadcastRead {
                promise: Promise::resolved(Err(Error::timeout())),
                origin: None,
            };
        }
        drop(inner);
        self.register_deadline(abs);
        BroadcastRead {
            promise,
            origin: Some(BroadcastOrigin {
                shared: Arc::downgrade(&self.shared),
                seq,
            }),
        }
    }

    /// Writes a value to all registered readers once the threshold is met.
    #[must_use]
    pub fn write(&self, value: T, deadline: Deadline) -> BroadcastWrite<T> {
        self.write_with(value, None, deadline)
    }

    /// Writes with an offer handle attached.
    #[must_use]
    pub fn write_with(&self, value: T, handle: OfferRef, deadline: Deadline) -> BroadcastWrite<T> {
        let shared = &self.shared;
        let mut inner = shared.lock();
        if inner.retired {
            return BroadcastWrite {
                promise: Promise::resolved(Err(Error::retired())),
                origin: None,
            };
        }
        let now = shared.timer.now();
        let abs = deadline.resolve(now);

        let promise = Promise::new();
        let seq = inner.alloc_seq();
        inner.writers.push_back(WriterEntry {
            seq,
            offer: handle,
            promise: promise.clone(),
            deadline: abs,
            value: Some(value),
        });
        shared.try_deliver(&mut inner, now);

        if promise.is_resolved() {
            return BroadcastWrite {
                promise,
                origin: None,
            };
        }
        if abs <= now {
            if let Some(pos) = inner.writers.iter().position(|w| w.seq == seq) {
                inner.writers.remove(pos);
            }
            return BroadcastWrite {
                promise: Promise::resolved(Err(Error::timeout())),
                origin: None,
            };
        }
        drop(inner);
        self.register_deadline(abs);
        BroadcastWrite {
            promise,
            origin: Some(BroadcastOrigin {
                shared: Arc::downgrade(&self.shared),
                seq,
            }),
        }
    }

    fn register_deadline(&self, deadline: Time) {
        let weak: Weak<dyn DeadlineSink> =
            Arc::downgrade(&self.shared) as Weak<dyn DeadlineSink>;
        self.shared.timer.register(self.shared.id, deadline, weak);
    }

    /// Drains both queues with `Retired` and seals the channel.
    ///
    /// Broadcasts hold no buffered values, so there is no graceful drain.
    pub fn retire(&self) {
        let mut inner = self.shared.lock();
        if inner.retired {
            return;
        }
        inner.finalize();
        tracing::debug!(channel = self.shared.id, "broadcast retired");
    }

    /// Returns true once retired.
    #[must_use]
    pub fn is_retired(&self) -> bool {
        self.shared.lock().retired
    }

    /// Number of currently registered readers.
    #[must_use]
    pub fn reader_count(&self) -> usize {
        self.shared.lock().readers.len()
    }

    /// Number of writers waiting for the threshold.
    #[must_use]
    pub fn pending_writers(&self) -> usize {
        self.shared.lock().writers.len()
    }

    /// The channel's registered name, if any.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.shared.name.as_deref()
    }

    /// Tick of the most recent delivery, observed from the read side.
    #[must_use]
    pub fn last_read_tick(&self) -> Time {
        self.shared.lock().last_read_tick
    }

    /// Tick of the most recent delivery, observed from the write side.
    #[must_use]
    pub fn last_write_tick(&self) -> Time {
        self.shared.lock().last_write_tick
    }
}

struct BroadcastOrigin<T: Clone> {
    shared: Weak<BroadcastShared<T>>,
    seq: u64,
}

/// Future returned by [`Broadcast::read`].
#[must_use = "futures do nothing unless polled"]
pub struct BroadcastRead<T: Clone> {
    promise: Promise<T>,
    origin: Option<BroadcastOrigin<T>>,
}

impl<T: Clone + Send + 'static> Future for BroadcastRead<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, ctx: &mut Context<'_>) -> Poll<Self::Output> {
        self.promise.poll_take(ctx)
    }
}

impl<T: Clone> Drop for BroadcastRead<T> {
    fn drop(&mut self) {
        if self.promise.is_resolved() {
            return;
        }
        let Some(origin) = self.origin.take() else {
            return;
        };
        if let Some(shared) = origin.shared.upgrade() {
            let mut inner = shared.inner.lock().expect("broadcast lock poisoned");
            if let Some(pos) = inner.readers.iter().position(|r| r.seq == origin.seq) {
                let reader = inner.readers.remove(pos).expect("position out of range");
                reader.promise.resolve(Err(Error::cancelled()));
            }
        }
    }
}

/// Future returned by [`Broadcast::write`].
#[must_use = "futures do nothing unless polled"]
pub struct BroadcastWrite<T: Clone> {
    promise: Promise<()>,
    origin: Option<BroadcastOrigin<T>>,
}

impl<T: Clone + Send + 'static> Future for BroadcastWrite<T> {
    type Output = Result<()>;

    fn poll(self: Pin<&mut Self>, ctx: &mut Context<'_>) -> Poll<Self::Output> {
        self.promise.poll_take(ctx)
    }
}

impl<T: Clone> Drop for BroadcastWrite<T> {
    fn drop(&mut self) {
        if self.promise.is_resolved() {
            return;
        }
        let Some(origin) = self.origin.take() else {
            return;
        };
        if let Some(shared) = origin.shared.upgrade() {
            let mut inner = shared.inner.lock().expect("broadcast lock poisoned");
            if let Some(pos) = inner.writers.iter().position(|w| w.seq == origin.seq) {
                let writer = inner.writers.remove(pos).expect("position out of range");
                writer.promise.resolve(Err(Error::cancelled()));
            }
        }
    }
}
