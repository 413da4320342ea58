//! The channel kernel: pending queues, matching, buffering, retirement.
//!
//! A [`Channel`] pairs readers and writers under the offer protocol. Under
//! the channel lock a write walks the reader queue head-to-tail, offering
//! each candidate; both sides accepting commits the match and resolves both
//! promises. An unmatched write lands in the buffer (eagerly resolved, its
//! value queued as a sentinel) while a slot is free, otherwise it parks on
//! the writer queue. Reads mirror this, consuming buffer sentinels first and
//! refilling freed slots from the blocked tail.
//!
//! Head-of-queue is always offered first. A rejected offer never promotes
//! its originator: the entry is dequeued when it vetoed itself, and keeps
//! its position when the other side vetoed. FIFO holds among peers that
//! never veto, and progress holds in the presence of vetoes.
//!
//! Retirement drains gracefully: values whose writes already returned
//! success stay observable until the drain budget is spent, then every
//! pending promise resolves with `Retired`.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, Weak};
use std::task::{Context, Poll};

use crate::error::{Error, Result};
use crate::offer::{self, OfferRef};
use crate::time::{next_channel_id, Deadline, DeadlineSink, ExpiryManager, Time};
use crate::util::SplitMix;

use super::promise::Promise;
use super::{ChannelBuilder, OverflowPolicy};

/// Retirement progress of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Active,
    /// Draining: `remaining` write-to-reader deliveries are still allowed.
    Retiring { remaining: usize },
    Retired,
}

struct ReadWaiter<T> {
    seq: u64,
    offer: OfferRef,
    promise: Promise<T>,
    deadline: Time,
}

struct WriteWaiter<T> {
    seq: u64,
    offer: OfferRef,
    promise: Promise<()>,
    deadline: Time,
    value: Option<T>,
    /// Buffer sentinel: the write already returned success; the value waits
    /// here for a reader.
    buffered: bool,
}

struct Inner<T> {
    readers: VecDeque<ReadWaiter<T>>,
    writers: VecDeque<WriteWaiter<T>>,
    /// Count of buffer sentinels in `writers`.
    buffered: usize,
    lifecycle: Lifecycle,
    last_read_tick: Time,
    last_write_tick: Time,
    next_seq: u64,
    rng: SplitMix,
}

enum Victim {
    Oldest,
    Random,
}

impl<T> Inner<T> {
    fn alloc_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    fn blocked_writers(&self) -> usize {
        self.writers.len() - self.buffered
    }

    /// Records one successful write-to-reader delivery.
    fn note_delivery(&mut self) {
        if let Lifecycle::Retiring { remaining } = self.lifecycle {
            self.lifecycle = Lifecycle::Retiring {
                remaining: remaining.saturating_sub(1),
            };
            self.maybe_finalize();
        }
    }

    /// Finalizes retirement once the drain budget is spent or nothing is
    /// left to drain.
    fn maybe_finalize(&mut self) {
        if let Lifecycle::Retiring { remaining } = self.lifecycle {
            if remaining == 0 || self.writers.is_empty() {
                self.finalize();
            }
        }
    }

    /// Drains both queues with `Retired` and seals the channel.
    fn finalize(&mut self) {
        self.lifecycle = Lifecycle::Retired;
        for reader in self.readers.drain(..) {
            reader.promise.resolve(Err(Error::retired()));
        }
        for writer in self.writers.drain(..) {
            if !writer.buffered {
                writer.promise.resolve(Err(Error::retired()));
            }
        }
        self.buffered = 0;
    }

    /// Promotes blocked writers into free buffer slots, up to `cap`.
    ///
    /// A promoted write resolves successfully; a promotion veto dequeues the
    /// writer (it elected to complete elsewhere) and the next one is tried.
    fn refill(&mut self, cap: usize, now: Time) {
        while self.buffered < cap {
            let Some(pos) = self.writers.iter().position(|w| !w.buffered) else {
                break;
            };
            if offer::accepts(&self.writers[pos].offer) {
                let writer = &mut self.writers[pos];
                offer::commit(&writer.offer);
                writer.offer = None;
                writer.buffered = true;
                writer.deadline = Time::MAX;
                writer.promise.resolve(Ok(()));
                self.buffered += 1;
                self.last_write_tick = now;
            } else {
                let writer = self.writers.remove(pos).expect("position out of range");
                writer.promise.resolve(Err(Error::cancelled()));
            }
        }
    }

    /// Removes one blocked writer per the drop policy. Returns false when no
    /// victim exists.
    fn drop_blocked_writer(&mut self, victim: &Victim) -> bool {
        let blocked: Vec<usize> = (0..self.writers.len())
            .filter(|&i| !self.writers[i].buffered)
            .collect();
        let Some(&pos) = (match victim {
            Victim::Oldest => blocked.first(),
            Victim::Random => {
                if blocked.is_empty() {
                    None
                } else {
                    Some(&blocked[self.rng.next_index(blocked.len())])
                }
            }
        }) else {
            return false;
        };
        let writer = self.writers.remove(pos).expect("position out of range");
        writer.promise.resolve(Err(Error::cancelled()));
        true
    }

    /// Removes one pending reader per the drop policy. Returns false when
    /// the queue is empty.
    fn drop_reader(&mut self, victim: &Victim) -> bool {
        let pos = match victim {
            Victim::Oldest => 0,
            Victim::Random => {
                if self.readers.is_empty() {
                    return false;
                }
                self.rng.next_index(self.readers.len())
            }
        };
        let Some(reader) = self.readers.remove(pos) else {
            return false;
        };
        reader.promise.resolve(Err(Error::cancelled()));
        true
    }

    /// Earliest live deadline across both queues, for re-registration.
    fn next_deadline(&self) -> Option<Time> {
        let readers = self.readers.iter().map(|r| r.deadline);
        let writers = self
            .writers
            .iter()
            .filter(|w| !w.buffered)
            .map(|w| w.deadline);
        readers.chain(writers).filter(|&d| d < Time::MAX).min()
    }
}

pub(crate) struct ChannelShared<T> {
    name: Option<String>,
    buffer: usize,
    max_readers: Option<usize>,
    max_writers: Option<usize>,
    reader_overflow: OverflowPolicy,
    writer_overflow: OverflowPolicy,
    timer: Arc<ExpiryManager>,
    id: u64,
    inner: Mutex<Inner<T>>,
}

impl<T> ChannelShared<T> {
    fn lock(&self) -> std::sync::MutexGuard<'_, Inner<T>> {
        self.inner.lock().expect("channel lock poisoned")
    }

    /// Refill cap for the current lifecycle: while retiring, promotion is
    /// capped at the drain budget so no write succeeds that retirement would
    /// then make unobservable.
    fn refill_cap(&self, lifecycle: Lifecycle) -> usize {
        match lifecycle {
            Lifecycle::Retiring { remaining } => remaining.min(self.buffer),
            _ => self.buffer,
        }
    }
}

impl<T: Send + 'static> DeadlineSink for ChannelShared<T> {
    fn on_deadline(&self, now: Time) -> Option<Time> {
        let mut inner = self.lock();
        if matches!(inner.lifecycle, Lifecycle::Retired) {
            return None;
        }
        let mut expired = 0_usize;
        inner.readers.retain(|reader| {
            if reader.deadline <= now {
                reader.promise.resolve(Err(Error::timeout()));
                expired += 1;
                false
            } else {
                true
            }
        });
        inner.writers.retain(|writer| {
            if !writer.buffered && writer.deadline <= now {
                writer.promise.resolve(Err(Error::timeout()));
                expired += 1;
                false
            } else {
                true
            }
        });
        if expired > 0 {
            tracing::trace!(channel = self.id, expired, "expired pending entries");
        }
        inner.maybe_finalize();
        inner.next_deadline()
    }
}

/// A CSP-style channel: rendezvous (`buffer == 0`) or bounded-buffered.
///
/// Handles are cheap to clone and may be shared freely across tasks. All
/// operations run under the channel's own lock; suspension happens only by
/// awaiting the returned future.
///
/// # Example
///
/// ```
/// use altsync::channel::Channel;
///
/// let ch = Channel::<u32>::buffered(1);
/// ch.try_write(7).expect("buffer slot free");
/// assert_eq!(ch.try_read().expect("value buffered"), 7);
/// ```
pub struct Channel<T> {
    shared: Arc<ChannelShared<T>>,
}

impl<T> Clone for Channel<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> std::fmt::Debug for Channel<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.shared.id)
            .field("name", &self.shared.name)
            .field("buffer", &self.shared.buffer)
            .finish_non_exhaustive()
    }
}

enum HeadDecision {
    Commit,
    CallerVeto { withdraw_head: bool },
    HeadVeto,
    Empty,
}

impl<T: Send + 'static> Channel<T> {
    /// Creates an unbuffered rendezvous channel.
    #[must_use]
    pub fn rendezvous() -> Self {
        ChannelBuilder::new()
            .build()
            .expect("default options are valid")
    }

    /// Creates a channel with the given buffer capacity.
    #[must_use]
    pub fn buffered(capacity: usize) -> Self {
        ChannelBuilder::new()
            .with_buffer(capacity)
            .build()
            .expect("default options are valid")
    }

    pub(crate) fn from_builder(builder: &ChannelBuilder) -> Result<Self> {
        if let Some(name) = &builder.name {
            if name.is_empty() {
                return Err(Error::invalid_argument().with_context("channel name is empty"));
            }
        }
        let timer = builder
            .timer
            .clone()
            .unwrap_or_else(ExpiryManager::global);
        let id = next_channel_id();
        let now = timer.now();
        let seed = builder.rng_seed.unwrap_or(0x5EED_0000 ^ id);
        Ok(Self {
            shared: Arc::new(ChannelShared {
                name: builder.name.clone(),
                buffer: builder.buffer,
                max_readers: builder.max_readers,
                max_writers: builder.max_writers,
                reader_overflow: builder.reader_overflow,
                writer_overflow: builder.writer_overflow,
                timer,
                id,
                inner: Mutex::new(Inner {
                    readers: VecDeque::new(),
                    writers: VecDeque::new(),
                    buffered: 0,
                    lifecycle: Lifecycle::Active,
                    last_read_tick: now,
                    last_write_tick: now,
                    next_seq: 0,
                    rng: SplitMix::new(seed),
                }),
            }),
        })
    }

    /// Reads the next value, waiting up to `deadline`.
    #[must_use]
    pub fn read(&self, deadline: Deadline) -> Read<T> {
        self.read_with(None, deadline)
    }

    /// Reads with an offer handle attached (selection, cancel tokens).
    #[must_use]
    pub fn read_with(&self, handle: OfferRef, deadline: Deadline) -> Read<T> {
        let (promise, enrolled) = self.start_read(handle, deadline);
        Read {
            promise,
            origin: enrolled.map(|seq| Origin {
                shared: Arc::downgrade(&self.shared),
                seq,
            }),
        }
    }

    /// Writes a value, waiting up to `deadline` for buffer space or a reader.
    #[must_use]
    pub fn write(&self, value: T, deadline: Deadline) -> Write<T> {
        self.write_with(value, None, deadline)
    }

    /// Writes with an offer handle attached (selection, cancel tokens).
    #[must_use]
    pub fn write_with(&self, value: T, handle: OfferRef, deadline: Deadline) -> Write<T> {
        let (promise, enrolled) = self.start_write(value, handle, deadline);
        Write {
            promise,
            origin: enrolled.map(|seq| Origin {
                shared: Arc::downgrade(&self.shared),
                seq,
            }),
        }
    }

    /// Immediate-deadline probe: a value or an error, never a wait.
    pub fn try_read(&self) -> Result<T> {
        let (promise, _) = self.start_read(None, Deadline::Immediate);
        promise
            .take_now()
            .expect("immediate read resolves synchronously")
    }

    /// Immediate-deadline probe: success or an error, never a wait.
    pub fn try_write(&self, value: T) -> Result<()> {
        let (promise, _) = self.start_write(value, None, Deadline::Immediate);
        promise
            .take_now()
            .expect("immediate write resolves synchronously")
    }

    fn start_read(&self, handle: OfferRef, deadline: Deadline) -> (Promise<T>, Option<u64>) {
        let shared = &self.shared;
        let mut inner = shared.lock();
        if matches!(inner.lifecycle, Lifecycle::Retired) {
            return (Promise::resolved(Err(Error::retired())), None);
        }
        let now = shared.timer.now();

        loop {
            let decision = match inner.writers.front() {
                None => HeadDecision::Empty,
                Some(writer) if writer.buffered => {
                    // Sentinel: the writer side committed at write time.
                    if offer::accepts(&handle) {
                        HeadDecision::Commit
                    } else {
                        HeadDecision::CallerVeto {
                            withdraw_head: false,
                        }
                    }
                }
                Some(writer) => {
                    if offer::accepts(&writer.offer) {
                        if offer::accepts(&handle) {
                            HeadDecision::Commit
                        } else {
                            HeadDecision::CallerVeto {
                                withdraw_head: true,
                            }
                        }
                    } else {
                        HeadDecision::HeadVeto
                    }
                }
            };
            match decision {
                HeadDecision::Commit => {
                    offer::commit(&handle);
                    let mut writer = inner.writers.pop_front().expect("writer head vanished");
                    let value = writer.value.take().expect("queued writer without value");
                    if writer.buffered {
                        inner.buffered -= 1;
                    } else {
                        // Rendezvous with a blocked writer.
                        offer::commit(&writer.offer);
                        writer.promise.resolve(Ok(()));
                        inner.last_write_tick = now;
                    }
                    inner.last_read_tick = now;
                    inner.note_delivery();
                    let cap = shared.refill_cap(inner.lifecycle);
                    inner.refill(cap, now);
                    tracing::trace!(channel = shared.id, "read matched");
                    return (Promise::resolved(Ok(value)), None);
                }
                HeadDecision::CallerVeto { withdraw_head } => {
                    if withdraw_head {
                        let writer = inner.writers.front().expect("writer head vanished");
                        offer::withdraw(&writer.offer);
                    }
                    return (Promise::resolved(Err(Error::cancelled())), None);
                }
                HeadDecision::HeadVeto => {
                    // The writer elected to complete elsewhere.
                    let writer = inner.writers.pop_front().expect("writer head vanished");
                    writer.promise.resolve(Err(Error::cancelled()));
                }
                HeadDecision::Empty => break,
            }
        }

        if matches!(inner.lifecycle, Lifecycle::Retiring { .. }) {
            // The walk drained the writer queue; nothing left to observe.
            inner.maybe_finalize();
            return (Promise::resolved(Err(Error::retired())), None);
        }

        let abs = deadline.resolve(now);
        if abs <= now {
            return (Promise::resolved(Err(Error::timeout())), None);
        }

        if let Some(bound) = shared.max_readers {
            if inner.readers.len() >= bound {
                match shared.reader_overflow {
                    OverflowPolicy::Reject | OverflowPolicy::Block => {
                        return (Promise::resolved(Err(Error::overflow())), None);
                    }
                    OverflowPolicy::DropNewest => {
                        return (Promise::resolved(Err(Error::cancelled())), None);
                    }
                    OverflowPolicy::DropOldest => {
                        if !inner.drop_reader(&Victim::Oldest) {
                            return (Promise::resolved(Err(Error::overflow())), None);
                        }
                    }
                    OverflowPolicy::DropRandom => {
                        if !inner.drop_reader(&Victim::Random) {
                            return (Promise::resolved(Err(Error::overflow())), None);
                        }
                    }
                }
            }
        }

        let promise = Promise::new();
        let seq = inner.alloc_seq();
        inner.readers.push_back(ReadWaiter {
            seq,
            offer: handle,
            promise: promise.clone(),
            deadline: abs,
        });
        drop(inner);
        self.register_deadline(abs);
        (promise, Some(seq))
    }

    fn start_write(&self, value: T, handle: OfferRef, deadline: Deadline) -> (Promise<()>, Option<u64>) {
        let shared = &self.shared;
        let mut inner = shared.lock();
        if !matches!(inner.lifecycle, Lifecycle::Active) {
            // A retiring channel no longer accepts input.
            return (Promise::resolved(Err(Error::retired())), None);
        }
        let now = shared.timer.now();

        loop {
            let decision = match inner.readers.front() {
                None => HeadDecision::Empty,
                Some(reader) => {
                    if offer::accepts(&reader.offer) {
                        if offer::accepts(&handle) {
                            HeadDecision::Commit
                        } else {
                            HeadDecision::CallerVeto {
                                withdraw_head: true,
                            }
                        }
                    } else {
                        HeadDecision::HeadVeto
                    }
                }
            };
            match decision {
                HeadDecision::Commit => {
                    let reader = inner.readers.pop_front().expect("reader head vanished");
                    offer::commit(&reader.offer);
                    offer::commit(&handle);
                    reader.promise.resolve(Ok(value));
                    inner.last_write_tick = now;
                    inner.last_read_tick = now;
                    inner.note_delivery();
                    tracing::trace!(channel = shared.id, "write matched pending reader");
                    return (Promise::resolved(Ok(())), None);
                }
                HeadDecision::CallerVeto { withdraw_head } => {
                    if withdraw_head {
                        let reader = inner.readers.front().expect("reader head vanished");
                        offer::withdraw(&reader.offer);
                    }
                    return (Promise::resolved(Err(Error::cancelled())), None);
                }
                HeadDecision::HeadVeto => {
                    // The reader elected to complete elsewhere.
                    let reader = inner.readers.pop_front().expect("reader head vanished");
                    reader.promise.resolve(Err(Error::cancelled()));
                }
                HeadDecision::Empty => break,
            }
        }

        if inner.buffered < shared.buffer {
            return if offer::accepts(&handle) {
                offer::commit(&handle);
                let promise = Promise::resolved(Ok(()));
                let seq = inner.alloc_seq();
                inner.writers.push_back(WriteWaiter {
                    seq,
                    offer: None,
                    promise: promise.clone(),
                    deadline: Time::MAX,
                    value: Some(value),
                    buffered: true,
                });
                inner.buffered += 1;
                inner.last_write_tick = now;
                tracing::trace!(channel = shared.id, occupancy = inner.buffered, "write buffered");
                (promise, None)
            } else {
                (Promise::resolved(Err(Error::cancelled())), None)
            };
        }

        let abs = deadline.resolve(now);
        if abs <= now {
            return (Promise::resolved(Err(Error::timeout())), None);
        }

        if let Some(bound) = shared.max_writers {
            if inner.blocked_writers() >= bound {
                match shared.writer_overflow {
                    OverflowPolicy::Reject | OverflowPolicy::Block => {
                        return (Promise::resolved(Err(Error::overflow())), None);
                    }
                    OverflowPolicy::DropNewest => {
                        return (Promise::resolved(Err(Error::cancelled())), None);
                    }
                    OverflowPolicy::DropOldest => {
                        if !inner.drop_blocked_writer(&Victim::Oldest) {
                            return (Promise::resolved(Err(Error::overflow())), None);
                        }
                    }
                    OverflowPolicy::DropRandom => {
                        if !inner.drop_blocked_writer(&Victim::Random) {
                            return (Promise::resolved(Err(Error::overflow())), None);
                        }
                    }
                }
            }
        }

        let promise = Promise::new();
        let seq = inner.alloc_seq();
        inner.writers.push_back(WriteWaiter {
            seq,
            offer: handle,
            promise: promise.clone(),
            deadline: abs,
            value: Some(value),
            buffered: false,
        });
        drop(inner);
        self.register_deadline(abs);
        (promise, Some(seq))
    }

    fn register_deadline(&self, deadline: Time) {
        let weak: Weak<dyn DeadlineSink> =
            Arc::downgrade(&self.shared) as Weak<dyn DeadlineSink>;
        self.shared.timer.register(self.shared.id, deadline, weak);
    }

    /// Begins (or completes) retirement.
    ///
    /// With `immediate` false the channel drains first: values whose writes
    /// already returned success, plus one compensated tail slot, stay
    /// observable; then every pending promise resolves with `Retired`. With
    /// `immediate` true both queues are drained at once.
    pub fn retire(&self, immediate: bool) {
        let mut inner = self.shared.lock();
        match inner.lifecycle {
            Lifecycle::Retired => return,
            Lifecycle::Retiring { .. } if !immediate => return,
            _ => {}
        }
        if immediate {
            inner.finalize();
        } else {
            let remaining = inner.writers.len().min(self.shared.buffer) + 1;
            inner.lifecycle = Lifecycle::Retiring { remaining };
            inner.maybe_finalize();
        }
        tracing::debug!(channel = self.shared.id, immediate, "channel retiring");
    }

    /// Returns true once retirement has completed.
    #[must_use]
    pub fn is_retired(&self) -> bool {
        matches!(self.shared.lock().lifecycle, Lifecycle::Retired)
    }

    /// Tick of the most recent successful read.
    #[must_use]
    pub fn last_read_tick(&self) -> Time {
        self.shared.lock().last_read_tick
    }

    /// Tick of the most recent successful write.
    #[must_use]
    pub fn last_write_tick(&self) -> Time {
        self.shared.lock().last_write_tick
    }

    /// The channel's registered name, if any.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.shared.name.as_deref()
    }

    /// Number of buffered values awaiting readers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.shared.lock().buffered
    }

    /// Returns true when no values are buffered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of parked readers.
    #[must_use]
    pub fn pending_readers(&self) -> usize {
        self.shared.lock().readers.len()
    }

    /// Number of parked (non-buffered) writers.
    #[must_use]
    pub fn pending_writers(&self) -> usize {
        self.shared.lock().blocked_writers()
    }
}

struct Origin<T> {
    shared: Weak<ChannelShared<T>>,
    seq: u64,
}

/// Future returned by [`Channel::read`].
///
/// The matching attempt ran when the future was created; polling only waits
/// for the parked promise. Dropping an unresolved `Read` dequeues its entry
/// with a `Cancelled` result.
#[must_use = "futures do nothing unless polled"]
pub struct Read<T> {
    promise: Promise<T>,
    origin: Option<Origin<T>>,
}

impl<T> std::fmt::Debug for Read<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Read")
            .field("resolved", &self.promise.is_resolved())
            .finish_non_exhaustive()
    }
}

impl<T: Send + 'static> Read<T> {
    /// Returns true once the read has an outcome (value or error).
    #[must_use]
    pub fn is_resolved(&self) -> bool {
        self.promise.is_resolved()
    }

    pub(crate) fn peek(&self) -> Option<core::result::Result<(), crate::error::ErrorKind>> {
        self.promise.peek()
    }
}

impl<T: Send + 'static> Future for Read<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, ctx: &mut Context<'_>) -> Poll<Self::Output> {
        self.promise.poll_take(ctx)
    }
}

impl<T> Drop for Read<T> {
    fn drop(&mut self) {
        if self.promise.is_resolved() {
            return;
        }
        let Some(origin) = self.origin.take() else {
            return;
        };
        if let Some(shared) = origin.shared.upgrade() {
            let mut inner = shared.lock();
            if let Some(pos) = inner.readers.iter().position(|r| r.seq == origin.seq) {
                let reader = inner.readers.remove(pos).expect("position out of range");
                reader.promise.resolve(Err(Error::cancelled()));
            }
        }
    }
}

/// Future returned by [`Channel::write`].
///
/// Resolves with success once the value is delivered or buffered. Dropping
/// an unresolved `Write` dequeues its entry with a `Cancelled` result.
#[must_use = "futures do nothing unless polled"]
pub struct Write<T> {
    promise: Promise<()>,
    origin: Option<Origin<T>>,
}

impl<T> std::fmt::Debug for Write<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Write")
            .field("resolved", &self.promise.is_resolved())
            .finish_non_exhaustive()
    }
}

impl<T: Send + 'static> Write<T> {
    /// Returns true once the write has an outcome (success or error).
    #[must_use]
    pub fn is_resolved(&self) -> bool {
        self.promise.is_resolved()
    }

    pub(crate) fn peek(&self) -> Option<core::result::Result<(), crate::error::ErrorKind>> {
        self.promise.peek()
    }
}

impl<T: Send + 'static> Future for Write<T> {
    type Output = Result<()>;

    fn poll(self: Pin<&mut Self>, ctx: &mut Context<'_>) -> Poll<Self::Output> {
        self.promise.poll_take(ctx)
    }
}

impl<T> Drop for Write<T> {
    fn drop(&mut self) {
        if self.promise.is_resolved() {
            return;
        }
        let Some(origin) = self.origin.take() else {
            return;
        };
        if let Some(shared) = origin.shared.upgrade() {
            let mut inner = shared.lock();
            if let Some(pos) = inner
                .writers
                .iter()
                .position(|w| !w.buffered && w.seq == origin.seq)
            {
                let writer = inner.writers.remove(pos).expect("position out of range");
                writer.promise.resolve(Err(Error::cancelled()));
                inner.maybe_finalize();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::block_on;
    use crate::time::TimeSource;
    use crate::time::VirtualClock;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn init_test(name: &str) {
        crate::test_utils::init_test_logging();
        crate::test_phase!(name);
    }

    fn virtual_channel<T: Send + 'static>(
        buffer: usize,
    ) -> (Channel<T>, Arc<ExpiryManager>, Arc<VirtualClock>) {
        let (manager, clock) = ExpiryManager::virtual_pair();
        let ch = ChannelBuilder::new()
            .with_buffer(buffer)
            .with_timer(Arc::clone(&manager))
            .build()
            .expect("builder options are valid");
        (ch, manager, clock)
    }

    #[test]
    fn buffered_write_then_read() {
        init_test("buffered_write_then_read");
        let ch = Channel::<u32>::buffered(2);

        block_on(ch.write(1, Deadline::Never)).expect("write 1");
        block_on(ch.write(2, Deadline::Never)).expect("write 2");
        assert_eq!(ch.len(), 2);

        let first = block_on(ch.read(Deadline::Never)).expect("read 1");
        let second = block_on(ch.read(Deadline::Never)).expect("read 2");
        crate::assert_with_log!(first == 1 && second == 2, "fifo order", (1, 2), (first, second));
        crate::test_complete!("buffered_write_then_read");
    }

    #[test]
    fn rendezvous_pairs_across_threads() {
        init_test("rendezvous_pairs_across_threads");
        let ch = Channel::<&'static str>::rendezvous();

        let writer = ch.clone();
        let done = Arc::new(AtomicBool::new(false));
        let done_clone = Arc::clone(&done);
        let handle = std::thread::spawn(move || {
            block_on(writer.write("hello", Deadline::Never)).expect("write");
            done_clone.store(true, Ordering::SeqCst);
        });

        let value = block_on(ch.read(Deadline::Never)).expect("read");
        crate::assert_with_log!(value == "hello", "rendezvous value", "hello", value);
        handle.join().expect("writer thread panicked");
        assert!(done.load(Ordering::SeqCst));
        crate::test_complete!("rendezvous_pairs_across_threads");
    }

    #[test]
    fn rendezvous_writer_blocks_until_reader() {
        init_test("rendezvous_writer_blocks_until_reader");
        let ch = Channel::<u32>::rendezvous();

        let pending = ch.write(9, Deadline::Never);
        crate::assert_with_log!(
            !pending.is_resolved(),
            "writer parked",
            false,
            pending.is_resolved()
        );
        assert_eq!(ch.pending_writers(), 1);

        let value = block_on(ch.read(Deadline::Never)).expect("read");
        assert_eq!(value, 9);
        block_on(pending).expect("write resolved by rendezvous");
        crate::test_complete!("rendezvous_writer_blocks_until_reader");
    }

    #[test]
    fn immediate_read_on_empty_times_out() {
        init_test("immediate_read_on_empty_times_out");
        let ch = Channel::<u32>::rendezvous();
        let err = ch.try_read().expect_err("empty channel");
        crate::assert_with_log!(err.is_timeout(), "timeout kind", true, err.is_timeout());
        assert_eq!(ch.pending_readers(), 0);
        crate::test_complete!("immediate_read_on_empty_times_out");
    }

    #[test]
    fn immediate_write_on_full_times_out() {
        init_test("immediate_write_on_full_times_out");
        let ch = Channel::<u32>::buffered(1);
        ch.try_write(1).expect("buffer slot free");
        let err = ch.try_write(2).expect_err("buffer full");
        assert!(err.is_timeout());
        assert_eq!(ch.pending_writers(), 0);
        crate::test_complete!("immediate_write_on_full_times_out");
    }

    #[test]
    fn ticks_advance_on_success() {
        init_test("ticks_advance_on_success");
        let (ch, _manager, clock) = virtual_channel::<u32>(1);
        let created = ch.last_write_tick();

        clock.advance(1_000);
        ch.try_write(5).expect("write");
        let wrote = ch.last_write_tick();
        crate::assert_with_log!(wrote > created, "write tick advanced", true, wrote > created);

        clock.advance(1_000);
        ch.try_read().expect("read");
        let read = ch.last_read_tick();
        crate::assert_with_log!(read >= wrote, "read tick follows write", true, read >= wrote);
        crate::test_complete!("ticks_advance_on_success");
    }

    #[test]
    fn deadline_expiry_resolves_timeout() {
        init_test("deadline_expiry_resolves_timeout");
        let (ch, manager, clock) = virtual_channel::<u32>(0);

        let read = ch.read(Deadline::After(std::time::Duration::from_millis(50)));
        assert!(!read.is_resolved());
        assert_eq!(ch.pending_readers(), 1);

        clock.advance_to(Time::from_millis(49));
        manager.process(clock.now());
        assert!(!read.is_resolved());

        clock.advance_to(Time::from_millis(50));
        manager.process(clock.now());
        let err = block_on(read).expect_err("deadline hit");
        crate::assert_with_log!(err.is_timeout(), "timeout kind", true, err.is_timeout());
        assert_eq!(ch.pending_readers(), 0);
        crate::test_complete!("deadline_expiry_resolves_timeout");
    }

    #[test]
    fn dropping_unresolved_future_dequeues_entry() {
        init_test("dropping_unresolved_future_dequeues_entry");
        let ch = Channel::<u32>::rendezvous();

        let read = ch.read(Deadline::Never);
        assert_eq!(ch.pending_readers(), 1);
        drop(read);
        assert_eq!(ch.pending_readers(), 0);

        let write = ch.write(1, Deadline::Never);
        assert_eq!(ch.pending_writers(), 1);
        drop(write);
        assert_eq!(ch.pending_writers(), 0);
        crate::test_complete!("dropping_unresolved_future_dequeues_entry");
    }

    #[test]
    fn cancel_token_dequeues_on_next_visit() {
        init_test("cancel_token_dequeues_on_next_visit");
        use crate::offer::{CancelToken, Offer};
        let ch = Channel::<u32>::rendezvous();

        let token = Arc::new(CancelToken::new());
        let read = ch.read_with(Some(Arc::clone(&token) as Arc<dyn Offer>), Deadline::Never);
        token.cancel();

        // The cancelled reader vetoes the offer; the writer moves on and,
        // with no other reader, parks.
        let write = ch.write(3, Deadline::Never);
        let err = block_on(read).expect_err("cancelled read");
        crate::assert_with_log!(err.is_cancelled(), "cancelled kind", true, err.is_cancelled());
        assert_eq!(ch.pending_readers(), 0);
        assert_eq!(ch.pending_writers(), 1);
        drop(write);
        crate::test_complete!("cancel_token_dequeues_on_next_visit");
    }

    #[test]
    fn writer_overflow_reject() {
        init_test("writer_overflow_reject");
        let ch: Channel<u32> = ChannelBuilder::new()
            .with_buffer(1)
            .with_max_pending_writers(Some(0))
            .build()
            .expect("builder options are valid");

        ch.try_write(1).expect("first write lands in the buffer");
        let err = block_on(ch.write(2, Deadline::Never)).expect_err("second writer would block");
        crate::assert_with_log!(
            err.kind() == crate::ErrorKind::Overflow,
            "overflow kind",
            crate::ErrorKind::Overflow,
            err.kind()
        );
        crate::test_complete!("writer_overflow_reject");
    }

    #[test]
    fn reader_overflow_drop_oldest() {
        init_test("reader_overflow_drop_oldest");
        let ch: Channel<u32> = ChannelBuilder::new()
            .with_max_pending_readers(Some(1))
            .with_reader_overflow(OverflowPolicy::DropOldest)
            .build()
            .expect("builder options are valid");

        let first = ch.read(Deadline::Never);
        let second = ch.read(Deadline::Never);
        let err = block_on(first).expect_err("oldest reader evicted");
        assert!(err.is_cancelled());
        assert_eq!(ch.pending_readers(), 1);

        ch.try_write(7).expect("reader waiting");
        assert_eq!(block_on(second).expect("second reader survives"), 7);
        crate::test_complete!("reader_overflow_drop_oldest");
    }

    #[test]
    fn reader_overflow_drop_newest() {
        init_test("reader_overflow_drop_newest");
        let ch: Channel<u32> = ChannelBuilder::new()
            .with_max_pending_readers(Some(1))
            .with_reader_overflow(OverflowPolicy::DropNewest)
            .build()
            .expect("builder options are valid");

        let first = ch.read(Deadline::Never);
        let second = ch.read(Deadline::Never);
        let err = block_on(second).expect_err("newest reader rejected");
        assert!(err.is_cancelled());

        ch.try_write(7).expect("reader waiting");
        assert_eq!(block_on(first).expect("first reader survives"), 7);
        crate::test_complete!("reader_overflow_drop_newest");
    }

    #[test]
    fn retire_immediate_drains_queues() {
        init_test("retire_immediate_drains_queues");
        let ch = Channel::<u32>::buffered(2);
        ch.try_write(1).expect("buffered");
        let parked = ch.read(Deadline::Never);
        let first = block_on(parked).expect("buffered value");
        assert_eq!(first, 1);
        let parked = ch.read(Deadline::Never);

        ch.retire(true);
        assert!(ch.is_retired());
        let err = block_on(parked).expect_err("parked reader retired");
        crate::assert_with_log!(err.is_retired(), "retired kind", true, err.is_retired());

        let err = ch.try_read().expect_err("retired channel");
        assert!(err.is_retired());
        let err = ch.try_write(9).expect_err("retired channel");
        assert!(err.is_retired());
        crate::test_complete!("retire_immediate_drains_queues");
    }

    #[test]
    fn retire_empty_channel_is_immediate() {
        init_test("retire_empty_channel_is_immediate");
        let ch = Channel::<u32>::rendezvous();
        ch.retire(false);
        assert!(ch.is_retired());
        let err = ch.try_read().expect_err("retired");
        assert!(err.is_retired());
        crate::test_complete!("retire_empty_channel_is_immediate");
    }

    #[test]
    fn retire_drains_buffered_values_in_order() {
        init_test("retire_drains_buffered_values_in_order");
        let ch = Channel::<u32>::buffered(2);
        ch.try_write(1).expect("buffered");
        ch.try_write(2).expect("buffered");
        let third = ch.write(3, Deadline::Never);
        assert!(!third.is_resolved());

        ch.retire(false);
        assert!(!ch.is_retired());

        let a = block_on(ch.read(Deadline::Never)).expect("first buffered value");
        let b = block_on(ch.read(Deadline::Never)).expect("second buffered value");
        let c = block_on(ch.read(Deadline::Never)).expect("promoted tail value");
        crate::assert_with_log!((a, b, c) == (1, 2, 3), "drain order", (1, 2, 3), (a, b, c));
        block_on(third).expect("tail write succeeded during drain");

        assert!(ch.is_retired());
        let err = ch.try_read().expect_err("drained and retired");
        assert!(err.is_retired());
        crate::test_complete!("retire_drains_buffered_values_in_order");
    }

    #[test]
    fn retire_does_not_leak_unpromoted_tail() {
        init_test("retire_does_not_leak_unpromoted_tail");
        let ch = Channel::<u32>::buffered(1);
        ch.try_write(1).expect("buffered");
        let second = ch.write(2, Deadline::Never);
        let third = ch.write(3, Deadline::Never);

        // remaining = min(3, 1) + 1 = 2: values 1 and 2 drain, 3 retires.
        ch.retire(false);
        let a = block_on(ch.read(Deadline::Never)).expect("buffered value");
        let b = block_on(ch.read(Deadline::Never)).expect("promoted value");
        assert_eq!((a, b), (1, 2));
        block_on(second).expect("promoted write succeeded");
        let err = block_on(third).expect_err("tail beyond the drain budget");
        assert!(err.is_retired());
        assert!(ch.is_retired());
        crate::test_complete!("retire_does_not_leak_unpromoted_tail");
    }

    #[test]
    fn write_during_retiring_is_rejected() {
        init_test("write_during_retiring_is_rejected");
        let ch = Channel::<u32>::buffered(1);
        ch.try_write(1).expect("buffered");
        ch.retire(false);
        assert!(!ch.is_retired());

        let err = ch.try_write(2).expect_err("retiring channel rejects input");
        assert!(err.is_retired());

        assert_eq!(block_on(ch.read(Deadline::Never)).expect("drain"), 1);
        assert!(ch.is_retired());
        crate::test_complete!("write_during_retiring_is_rejected");
    }

    #[test]
    fn consuming_buffer_promotes_blocked_writer() {
        init_test("consuming_buffer_promotes_blocked_writer");
        let ch = Channel::<u32>::buffered(1);
        ch.try_write(1).expect("buffered");
        let blocked = ch.write(2, Deadline::Never);
        assert!(!blocked.is_resolved());

        assert_eq!(ch.try_read().expect("buffered value"), 1);
        block_on(blocked).expect("freed slot promoted the blocked writer");
        assert_eq!(ch.len(), 1);
        assert_eq!(ch.try_read().expect("promoted value"), 2);
        crate::test_complete!("consuming_buffer_promotes_blocked_writer");
    }
}
