//! CSP-style channel primitives built on the offer protocol.
//!
//! A [`Channel`] pairs one writer with one reader per value, through a
//! rendezvous or a bounded buffer; a [`Broadcast`] delivers one write to all
//! registered readers atomically. Every match runs the two-phase offer
//! protocol, which is what lets a pending operation participate in a
//! multi-channel selection (see [`crate::select`]).
//!
//! # Example
//!
//! ```
//! use altsync::channel::{Channel, ChannelBuilder, OverflowPolicy};
//!
//! // A named channel with a two-slot buffer and a bounded writer queue.
//! let ch: Channel<u64> = ChannelBuilder::new()
//!     .with_name("ingest")
//!     .with_buffer(2)
//!     .with_max_pending_writers(Some(8))
//!     .with_writer_overflow(OverflowPolicy::Reject)
//!     .build()
//!     .expect("valid options");
//! assert_eq!(ch.name(), Some("ingest"));
//! ```

mod broadcast;
mod kernel;
mod promise;

pub use broadcast::{Broadcast, BroadcastBuilder, BroadcastRead, BroadcastWrite};
pub use kernel::{Channel, Read, Write};

use std::sync::Arc;

use crate::error::Result;
use crate::time::ExpiryManager;

/// What happens when enqueueing a pending entry would exceed a queue bound.
///
/// Bounds apply to blocked entries only; buffer sentinels (writes that
/// already returned success) never count against them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverflowPolicy {
    /// Fail the new entry with `Overflow`.
    #[default]
    Reject,
    /// Evict the queue head with `Cancelled`, then enqueue the new entry.
    DropOldest,
    /// Resolve the new entry with `Cancelled` without enqueueing it.
    DropNewest,
    /// Evict a uniformly chosen victim with `Cancelled`, then enqueue.
    DropRandom,
    /// Accepted for symmetry with blocking queue APIs; treated as
    /// [`Reject`](Self::Reject).
    Block,
}

/// Options for constructing a [`Channel`].
///
/// The default is an unnamed rendezvous channel with unbounded pending
/// queues, wired to the process-wide expiry manager.
#[derive(Debug, Clone, Default)]
pub struct ChannelBuilder {
    pub(crate) name: Option<String>,
    pub(crate) buffer: usize,
    pub(crate) max_readers: Option<usize>,
    pub(crate) max_writers: Option<usize>,
    pub(crate) reader_overflow: OverflowPolicy,
    pub(crate) writer_overflow: OverflowPolicy,
    pub(crate) timer: Option<Arc<ExpiryManager>>,
    pub(crate) rng_seed: Option<u64>,
}

impl ChannelBuilder {
    /// Creates a builder with default options.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the channel's name (unique within the scope that registers it).
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Sets the buffer capacity. Zero means rendezvous.
    #[must_use]
    pub fn with_buffer(mut self, capacity: usize) -> Self {
        self.buffer = capacity;
        self
    }

    /// Bounds the pending-reader queue. `None` is unbounded.
    #[must_use]
    pub fn with_max_pending_readers(mut self, bound: Option<usize>) -> Self {
        self.max_readers = bound;
        self
    }

    /// Bounds the pending-writer queue (blocked writers only). `None` is
    /// unbounded.
    #[must_use]
    pub fn with_max_pending_writers(mut self, bound: Option<usize>) -> Self {
        self.max_writers = bound;
        self
    }

    /// Overflow policy for the reader queue.
    #[must_use]
    pub fn with_reader_overflow(mut self, policy: OverflowPolicy) -> Self {
        self.reader_overflow = policy;
        self
    }

    /// Overflow policy for the writer queue.
    #[must_use]
    pub fn with_writer_overflow(mut self, policy: OverflowPolicy) -> Self {
        self.writer_overflow = policy;
        self
    }

    /// Wires the channel to a non-global expiry manager (deterministic
    /// tests).
    #[must_use]
    pub fn with_timer(mut self, timer: Arc<ExpiryManager>) -> Self {
        self.timer = Some(timer);
        self
    }

    /// Seeds the channel's deterministic PRNG (`DropRandom` victims).
    #[must_use]
    pub fn with_rng_seed(mut self, seed: u64) -> Self {
        self.rng_seed = Some(seed);
        self
    }

    /// Builds the channel.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for contradictory options (e.g. an empty
    /// name).
    pub fn build<T: Send + 'static>(&self) -> Result<Channel<T>> {
        Channel::from_builder(self)
    }
}
