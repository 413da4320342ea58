//! Monotonic instants and time sources.

use core::fmt;
use std::ops::Add;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// A monotonic timestamp, in nanoseconds from the clock's epoch.
///
/// With a [`WallClock`] the epoch is the clock's creation instant; with a
/// [`VirtualClock`] time only advances when a test tells it to.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Time(u64);

impl Time {
    /// The zero instant (epoch).
    pub const ZERO: Self = Self(0);

    /// The maximum representable instant, used as the "never" deadline.
    pub const MAX: Self = Self(u64::MAX);

    /// Creates a new time from nanoseconds since epoch.
    #[must_use]
    pub const fn from_nanos(nanos: u64) -> Self {
        Self(nanos)
    }

    /// Creates a new time from milliseconds since epoch.
    #[must_use]
    pub const fn from_millis(millis: u64) -> Self {
        Self(millis.saturating_mul(1_000_000))
    }

    /// Creates a new time from seconds since epoch.
    #[must_use]
    pub const fn from_secs(secs: u64) -> Self {
        Self(secs.saturating_mul(1_000_000_000))
    }

    /// Returns the time as nanoseconds since epoch.
    #[must_use]
    pub const fn as_nanos(self) -> u64 {
        self.0
    }

    /// Returns the time as milliseconds since epoch (truncated).
    #[must_use]
    pub const fn as_millis(self) -> u64 {
        self.0 / 1_000_000
    }

    /// Adds a duration in nanoseconds, saturating on overflow.
    #[must_use]
    pub const fn saturating_add_nanos(self, nanos: u64) -> Self {
        Self(self.0.saturating_add(nanos))
    }

    /// Returns the duration between two times in nanoseconds.
    ///
    /// Returns 0 if `self` is before `earlier`.
    #[must_use]
    pub const fn duration_since(self, earlier: Self) -> u64 {
        self.0.saturating_sub(earlier.0)
    }
}

impl Add<Duration> for Time {
    type Output = Self;

    fn add(self, rhs: Duration) -> Self::Output {
        self.saturating_add_nanos(rhs.as_nanos().min(u128::from(u64::MAX)) as u64)
    }
}

impl fmt::Debug for Time {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Time({}ns)", self.0)
    }
}

impl fmt::Display for Time {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 >= 1_000_000_000 {
            write!(
                f,
                "{}.{:03}s",
                self.0 / 1_000_000_000,
                (self.0 / 1_000_000) % 1000
            )
        } else if self.0 >= 1_000_000 {
            write!(f, "{}ms", self.0 / 1_000_000)
        } else if self.0 >= 1_000 {
            write!(f, "{}us", self.0 / 1_000)
        } else {
            write!(f, "{}ns", self.0)
        }
    }
}

/// A per-operation deadline.
///
/// `Immediate` is the 0-duration probe: an operation that cannot complete
/// synchronously fails with `Timeout` instead of enqueueing. `Never` waits
/// without bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deadline {
    /// Probe only; never enqueue.
    Immediate,
    /// Wait without bound.
    Never,
    /// Wait at most this long from the moment the operation starts.
    After(Duration),
    /// Wait until this absolute instant.
    At(Time),
}

impl Deadline {
    /// Resolves the deadline to an absolute instant relative to `now`.
    #[must_use]
    pub(crate) fn resolve(self, now: Time) -> Time {
        match self {
            Self::Immediate => now,
            Self::Never => Time::MAX,
            Self::After(d) => now + d,
            Self::At(t) => t,
        }
    }
}

/// Time source abstraction for reading the current time.
///
/// Allows the expiry machinery to work with both wall-clock time
/// (production) and virtual time (deterministic tests).
pub trait TimeSource: Send + Sync {
    /// Returns the current time.
    fn now(&self) -> Time;
}

/// Wall clock time source for production use.
///
/// Uses `std::time::Instant` internally; the epoch is the instant this
/// source was created.
#[derive(Debug)]
pub struct WallClock {
    epoch: std::time::Instant,
}

impl WallClock {
    /// Creates a new wall clock time source.
    #[must_use]
    pub fn new() -> Self {
        Self {
            epoch: std::time::Instant::now(),
        }
    }
}

impl Default for WallClock {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeSource for WallClock {
    fn now(&self) -> Time {
        let elapsed = self.epoch.elapsed();
        Time::from_nanos(elapsed.as_nanos().min(u128::from(u64::MAX)) as u64)
    }
}

/// Virtual time source for deterministic tests.
///
/// Time only advances when explicitly told to do so.
///
/// # Example
///
/// ```
/// use altsync::time::{TimeSource, VirtualClock};
/// use altsync::time::Time;
///
/// let clock = VirtualClock::new();
/// assert_eq!(clock.now(), Time::ZERO);
///
/// clock.advance(1_000_000_000); // 1 second
/// assert_eq!(clock.now(), Time::from_secs(1));
/// ```
#[derive(Debug, Default)]
pub struct VirtualClock {
    now: AtomicU64,
}

impl VirtualClock {
    /// Creates a new virtual clock starting at time zero.
    #[must_use]
    pub fn new() -> Self {
        Self {
            now: AtomicU64::new(0),
        }
    }

    /// Advances time by the given number of nanoseconds.
    pub fn advance(&self, nanos: u64) {
        self.now.fetch_add(nanos, Ordering::Release);
    }

    /// Advances time to the given absolute time.
    ///
    /// If the target time is in the past, this is a no-op.
    pub fn advance_to(&self, time: Time) {
        let target = time.as_nanos();
        loop {
            let current = self.now.load(Ordering::Acquire);
            if current >= target {
                break;
            }
            if self
                .now
                .compare_exchange_weak(current, target, Ordering::Release, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
        }
    }
}

impl TimeSource for VirtualClock {
    fn now(&self) -> Time {
        Time::from_nanos(self.now.load(Ordering::Acquire))
    }
}
