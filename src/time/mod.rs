//! Time primitives: instants, clocks, deadlines, and expiration.
//!
//! Channels stamp `last_read_tick`/`last_write_tick` with [`Time`] values and
//! resolve per-operation [`Deadline`]s against a [`TimeSource`]. The
//! process-wide [`ExpiryManager`] fires a callback at the earliest registered
//! deadline; deterministic tests drive a private manager over a
//! [`VirtualClock`] instead.

mod clock;
mod expiry;

pub use clock::{Deadline, Time, TimeSource, VirtualClock, WallClock};
pub use expiry::{DeadlineSink, ExpiryManager};

pub(crate) use expiry::next_channel_id;
