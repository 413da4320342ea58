//! Altsync: CSP-style channels with atomic multi-channel selection.
//!
//! # Overview
//!
//! Altsync provides typed rendezvous and bounded-buffered channels with
//! per-operation deadlines, cancellation, graceful retirement, and a
//! two-phase commit protocol (the "offer protocol") that lets a single
//! channel operation be atomically chosen among many alternatives — the
//! select/alt construct from CSP.
//!
//! # Core Guarantees
//!
//! - **Two-phase matching**: no match completes without an offer/commit
//!   round on both sides; a veto withdraws cleanly, leaving no visible state
//! - **Atomic selection**: across all channels a selection spans, at most
//!   one commit is ever issued
//! - **FIFO per queue**: successful matches follow insertion order among
//!   peers that never veto, and vetoes cannot starve the queue
//! - **Graceful retirement**: values whose writes already returned success
//!   stay observable while a retiring channel drains
//! - **Exactly-once promises**: every pending operation resolves exactly
//!   once — with a value, `Timeout`, `Cancelled`, `Overflow`, or `Retired`
//!
//! # Module Structure
//!
//! - [`error`]: Error kinds and the crate-wide `Result`
//! - [`time`]: Instants, clocks, deadlines, and the expiration manager
//! - [`offer`]: The two-phase commit capability and cancel tokens
//! - [`channel`]: The channel kernel and the broadcast variant
//! - [`select`]: Atomic choice across channels
//! - [`scope`]: Nested, task-local name registry handing out channels
//! - [`test_utils`]: Logging setup and a polling `block_on` for tests
//!   (behind the `test-util` feature)
//!
//! # Example
//!
//! ```
//! use altsync::channel::Channel;
//! use altsync::time::Deadline;
//! use altsync::test_utils::block_on;
//!
//! let ch = Channel::<&'static str>::rendezvous();
//! let reader = ch.clone();
//! let t = std::thread::spawn(move || {
//!     block_on(reader.read(Deadline::Never)).expect("paired with the writer")
//! });
//! block_on(ch.write("ping", Deadline::Never)).expect("paired with the reader");
//! assert_eq!(t.join().expect("reader thread"), "ping");
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]

pub mod channel;
pub mod error;
pub mod offer;
pub mod scope;
pub mod select;
#[cfg(feature = "test-util")]
pub mod test_utils;
pub mod time;

mod util;

// Re-exports for convenient access to core types
pub use channel::{Broadcast, BroadcastBuilder, Channel, ChannelBuilder, OverflowPolicy};
pub use error::{Error, ErrorKind, Result, ResultExt};
pub use offer::{CancelToken, Offer};
pub use select::{read_from_any, write_to_any, Arbiter, Priority};
pub use time::{Deadline, ExpiryManager, Time};
