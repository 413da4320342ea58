//! Atomic choice across channels: the CSP alt.
//!
//! [`read_from_any`] and [`write_to_any`] perform exactly one of a set of
//! candidate operations. Every branch enrolls with one shared [`Arbiter`]
//! whose `offer` CAS-acquires a flag: only the CAS winner's channel can
//! commit, every other channel sees a veto and dequeues the losing entry.
//! The arbiter touches nothing but its own atomic, so a channel may invoke
//! it inside its lock without risking another channel's lock — this is the
//! whole deadlock-avoidance story.
//!
//! Enrollment short-circuits: a branch that completes synchronously stops
//! further channels from being enrolled. Losing branches are dequeued by
//! their futures' drop handlers once the selection resolves.
//!
//! # Example
//!
//! ```
//! use altsync::channel::Channel;
//! use altsync::select::{read_from_any, Priority};
//! use altsync::time::Deadline;
//! use altsync::test_utils::block_on;
//!
//! let a = Channel::<u32>::rendezvous();
//! let b = Channel::<u32>::buffered(1);
//! b.try_write(42).expect("buffer slot free");
//!
//! let (index, value) =
//!     block_on(read_from_any(&[a, b], Priority::First, Deadline::Never)).expect("one branch wins");
//! assert_eq!((index, value), (1, 42));
//! ```

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use smallvec::SmallVec;

use crate::channel::{Channel, Read, Write};
use crate::error::{Error, Result};
use crate::offer::Offer;
use crate::time::Deadline;
use crate::util::SplitMix;

/// Which branch to favor when several could proceed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Priority {
    /// Try channels in array order; the first that can proceed wins.
    #[default]
    First,
    /// Pre-shuffle the order.
    Random,
    /// Rotate the starting index round-robin across calls.
    Fair,
    /// No preference; behaves like [`First`](Self::First).
    Any,
}

/// The shared offer handle behind a selection.
///
/// `offer` CAS-acquires the decision flag (only the winner sees `true`),
/// `withdraw` releases it, `commit` is a no-op so the flag stays set
/// permanently — every later offer against this arbiter vetoes.
#[derive(Debug, Default)]
pub struct Arbiter {
    decided: AtomicBool,
}

impl Arbiter {
    /// Creates an undecided arbiter.
    #[must_use]
    pub fn new() -> Self {
        Self {
            decided: AtomicBool::new(false),
        }
    }

    /// Returns true once some channel has committed (or holds a tentative
    /// reservation).
    #[must_use]
    pub fn is_decided(&self) -> bool {
        self.decided.load(Ordering::Acquire)
    }
}

impl Offer for Arbiter {
    fn offer(&self) -> bool {
        self.decided
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn withdraw(&self) {
        self.decided.store(false, Ordering::Release);
    }

    fn commit(&self) {}
}

static FAIR_CURSOR: AtomicUsize = AtomicUsize::new(0);

fn select_seed() -> u64 {
    static SEED: AtomicU64 = AtomicU64::new(0x51E7_C0DE);
    SEED.fetch_add(0x9E37_79B9_7F4A_7C15, Ordering::Relaxed)
}

fn enrollment_order(n: usize, priority: Priority) -> SmallVec<[usize; 8]> {
    let mut order: SmallVec<[usize; 8]> = (0..n).collect();
    match priority {
        Priority::First | Priority::Any => {}
        Priority::Random => {
            let mut rng = SplitMix::new(select_seed());
            rng.shuffle(&mut order);
        }
        Priority::Fair => {
            if n > 0 {
                let start = FAIR_CURSOR.fetch_add(1, Ordering::Relaxed) % n;
                order.rotate_left(start);
            }
        }
    }
    order
}

/// A branch that completed synchronously decides the selection when it won
/// outright, or when it observed the arbiter already taken (`Cancelled`:
/// some earlier branch is winning concurrently). Synchronous failures like
/// `Retired` or an immediate-probe `Timeout` leave later channels in play.
fn decided_synchronously(peeked: Option<core::result::Result<(), crate::ErrorKind>>) -> bool {
    matches!(peeked, Some(Ok(())) | Some(Err(crate::ErrorKind::Cancelled)))
}

/// Picks the selector's terminal error once every branch has failed:
/// `Retired` only when all branches were retired, otherwise the first
/// non-retired failure in enrollment order.
fn aggregate_error(failures: &[Option<Error>]) -> Error {
    failures
        .iter()
        .flatten()
        .find(|e| !e.is_retired())
        .cloned()
        .unwrap_or_else(Error::retired)
}

enum ReadBranch<T> {
    Pending(Read<T>),
    Failed(Error),
}

/// Future returned by [`read_from_any`]. Resolves to the winning channel's
/// index and the value read from it.
#[must_use = "futures do nothing unless polled"]
pub struct ReadAny<T> {
    branches: SmallVec<[(usize, ReadBranch<T>); 8]>,
}

/// Atomically reads from exactly one of `channels`.
///
/// Exactly one branch completes; every other branch observes no side
/// effect. The error of a fully failed selection is `Retired` only if every
/// branch was retired.
pub fn read_from_any<T: Send + 'static>(
    channels: &[Channel<T>],
    priority: Priority,
    deadline: Deadline,
) -> ReadAny<T> {
    let arbiter = Arc::new(Arbiter::new());
    let mut branches = SmallVec::new();
    for &index in &enrollment_order(channels.len(), priority) {
        let fut = channels[index].read_with(
            Some(Arc::clone(&arbiter) as Arc<dyn Offer>),
            deadline,
        );
        let peeked = fut.peek();
        branches.push((index, ReadBranch::Pending(fut)));
        if decided_synchronously(peeked) {
            // Fast path: later channels are never enrolled.
            break;
        }
    }
    ReadAny { branches }
}

impl<T: Send + 'static> Future for ReadAny<T> {
    type Output = Result<(usize, T)>;

    fn poll(self: Pin<&mut Self>, ctx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if this.branches.is_empty() {
            return Poll::Ready(Err(
                Error::invalid_argument().with_context("empty selection")
            ));
        }
        let mut still_pending = false;
        for (index, branch) in &mut this.branches {
            if let ReadBranch::Pending(fut) = branch {
                match Pin::new(fut).poll(ctx) {
                    Poll::Ready(Ok(value)) => return Poll::Ready(Ok((*index, value))),
                    Poll::Ready(Err(e)) => *branch = ReadBranch::Failed(e),
                    Poll::Pending => still_pending = true,
                }
            }
        }
        if still_pending {
            return Poll::Pending;
        }
        let failures: Vec<Option<Error>> = this
            .branches
            .iter()
            .map(|(_, b)| match b {
                ReadBranch::Failed(e) => Some(e.clone()),
                ReadBranch::Pending(_) => None,
            })
            .collect();
        Poll::Ready(Err(aggregate_error(&failures)))
    }
}

enum WriteBranch<T> {
    Pending(Write<T>),
    Failed(Error),
}

/// Future returned by [`write_to_any`]. Resolves to the winning channel's
/// index.
#[must_use = "futures do nothing unless polled"]
pub struct WriteAny<T> {
    branches: SmallVec<[(usize, WriteBranch<T>); 8]>,
}

/// Atomically writes `value` to exactly one of `channels`.
///
/// Each enrolled branch parks its own clone of the value; exactly one clone
/// is consumed, the rest are dropped with their losing branches.
pub fn write_to_any<T: Clone + Send + 'static>(
    channels: &[Channel<T>],
    value: &T,
    priority: Priority,
    deadline: Deadline,
) -> WriteAny<T> {
    let arbiter = Arc::new(Arbiter::new());
    let mut branches = SmallVec::new();
    for &index in &enrollment_order(channels.len(), priority) {
        let fut = channels[index].write_with(
            value.clone(),
            Some(Arc::clone(&arbiter) as Arc<dyn Offer>),
            deadline,
        );
        let peeked = fut.peek();
        branches.push((index, WriteBranch::Pending(fut)));
        if decided_synchronously(peeked) {
            break;
        }
    }
    WriteAny { branches }
}

impl<T: Send + 'static> Future for WriteAny<T> {
    type Output = Result<usize>;

    fn poll(self: Pin<&mut Self>, ctx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if this.branches.is_empty() {
            return Poll::Ready(Err(
                Error::invalid_argument().with_context("empty selection")
            ));
        }
        let mut still_pending = false;
        for (index, branch) in &mut this.branches {
            if let WriteBranch::Pending(fut) = branch {
                match Pin::new(fut).poll(ctx) {
                    Poll::Ready(Ok(())) => return Poll::Ready(Ok(*index)),
                    Poll::Ready(Err(e)) => *branch = WriteBranch::Failed(e),
                    Poll::Pending => still_pending = true,
                }
            }
        }
        if still_pending {
            return Poll::Pending;
        }
        let failures: Vec<Option<Error>> = this
            .branches
            .iter()
            .map(|(_, b)| match b {
                WriteBranch::Failed(e) => Some(e.clone()),
                WriteBranch::Pending(_) => None,
            })
            .collect();
        Poll::Ready(Err(aggregate_error(&failures)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelBuilder;
    use crate::test_utils::block_on;
    use crate::time::TimeSource;
    use crate::time::ExpiryManager;

    fn init_test(name: &str) {
        crate::test_utils::init_test_logging();
        crate::test_phase!(name);
    }

    #[test]
    fn first_priority_takes_array_order() {
        init_test("first_priority_takes_array_order");
        let a = Channel::<u32>::buffered(1);
        let b = Channel::<u32>::buffered(1);
        a.try_write(1).expect("preload a");
        b.try_write(2).expect("preload b");

        let (index, value) = block_on(read_from_any(
            &[a.clone(), b.clone()],
            Priority::First,
            Deadline::Never,
        ))
        .expect("one branch wins");
        crate::assert_with_log!((index, value) == (0, 1), "array order", (0, 1), (index, value));

        // b's value is untouched.
        assert_eq!(b.try_read().expect("b still loaded"), 2);
        crate::test_complete!("first_priority_takes_array_order");
    }

    #[test]
    fn loser_enrollments_are_cleaned_up() {
        init_test("loser_enrollments_are_cleaned_up");
        let a = Channel::<u32>::rendezvous();
        let b = Channel::<u32>::buffered(1);
        b.try_write(42).expect("preload b");

        let (index, value) = block_on(read_from_any(
            &[a.clone(), b.clone()],
            Priority::First,
            Deadline::Never,
        ))
        .expect("buffered branch wins");
        assert_eq!((index, value), (1, 42));
        crate::assert_with_log!(
            a.pending_readers() == 0,
            "losing reader dequeued",
            0,
            a.pending_readers()
        );
        crate::test_complete!("loser_enrollments_are_cleaned_up");
    }

    #[test]
    fn pending_selection_wakes_on_write() {
        init_test("pending_selection_wakes_on_write");
        let a = Channel::<u32>::rendezvous();
        let b = Channel::<u32>::rendezvous();

        let select = read_from_any(&[a.clone(), b.clone()], Priority::First, Deadline::Never);
        assert_eq!(a.pending_readers(), 1);
        assert_eq!(b.pending_readers(), 1);

        let writer = b.clone();
        let handle = std::thread::spawn(move || {
            block_on(writer.write(7, Deadline::Never)).expect("write to enrolled reader");
        });

        let (index, value) = block_on(select).expect("written branch wins");
        assert_eq!((index, value), (1, 7));
        handle.join().expect("writer thread panicked");
        assert_eq!(a.pending_readers(), 0);
        crate::test_complete!("pending_selection_wakes_on_write");
    }

    #[test]
    fn exactly_one_value_consumed_per_selection() {
        init_test("exactly_one_value_consumed_per_selection");
        let a = Channel::<u32>::buffered(1);
        let b = Channel::<u32>::buffered(1);
        a.try_write(10).expect("preload a");
        b.try_write(20).expect("preload b");

        let mut seen = Vec::new();
        for _ in 0..2 {
            let (_, value) = block_on(read_from_any(
                &[a.clone(), b.clone()],
                Priority::First,
                Deadline::Never,
            ))
            .expect("a value remains");
            seen.push(value);
        }
        seen.sort_unstable();
        crate::assert_with_log!(seen == vec![10, 20], "no double consumption", [10, 20], seen);

        let err = block_on(read_from_any(
            &[a, b],
            Priority::First,
            Deadline::Immediate,
        ))
        .expect_err("both drained");
        assert!(err.is_timeout());
        crate::test_complete!("exactly_one_value_consumed_per_selection");
    }

    #[test]
    fn random_priority_reaches_both_channels() {
        init_test("random_priority_reaches_both_channels");
        let mut hits = [0_usize; 2];
        for _ in 0..64 {
            let a = Channel::<u32>::buffered(1);
            let b = Channel::<u32>::buffered(1);
            a.try_write(0).expect("preload a");
            b.try_write(1).expect("preload b");
            let (_, value) = block_on(read_from_any(
                &[a, b],
                Priority::Random,
                Deadline::Never,
            ))
            .expect("one branch wins");
            hits[value as usize] += 1;
        }
        crate::assert_with_log!(
            hits[0] > 8 && hits[1] > 8,
            "both channels selected",
            "both > 8",
            hits
        );
        crate::test_complete!("random_priority_reaches_both_channels");
    }

    #[test]
    fn fair_priority_rotates_start_index() {
        init_test("fair_priority_rotates_start_index");
        let mut winners = Vec::new();
        for _ in 0..4 {
            let a = Channel::<u32>::buffered(1);
            let b = Channel::<u32>::buffered(1);
            a.try_write(0).expect("preload a");
            b.try_write(1).expect("preload b");
            let (_, value) = block_on(read_from_any(
                &[a, b],
                Priority::Fair,
                Deadline::Never,
            ))
            .expect("one branch wins");
            winners.push(value);
        }
        // The rotating cursor alternates the favored channel.
        crate::assert_with_log!(
            winners.windows(2).any(|w| w[0] != w[1]),
            "rotation visible",
            "alternating winners",
            winners
        );
        crate::test_complete!("fair_priority_rotates_start_index");
    }

    #[test]
    fn write_to_any_prefers_ready_reader() {
        init_test("write_to_any_prefers_ready_reader");
        let a = Channel::<u32>::rendezvous();
        let b = Channel::<u32>::buffered(1);

        let index = block_on(write_to_any(
            &[a.clone(), b.clone()],
            &5,
            Priority::First,
            Deadline::Never,
        ))
        .expect("buffered branch accepts");
        assert_eq!(index, 1);
        assert_eq!(b.try_read().expect("delivered"), 5);
        assert_eq!(a.pending_writers(), 0);
        crate::test_complete!("write_to_any_prefers_ready_reader");
    }

    #[test]
    fn all_retired_selection_reports_retired() {
        init_test("all_retired_selection_reports_retired");
        let a = Channel::<u32>::rendezvous();
        let b = Channel::<u32>::rendezvous();
        a.retire(true);
        b.retire(true);

        let err = block_on(read_from_any(&[a, b], Priority::First, Deadline::Never))
            .expect_err("all branches retired");
        crate::assert_with_log!(err.is_retired(), "retired kind", true, err.is_retired());
        crate::test_complete!("all_retired_selection_reports_retired");
    }

    #[test]
    fn one_live_branch_outweighs_retired_ones() {
        init_test("one_live_branch_outweighs_retired_ones");
        let a = Channel::<u32>::rendezvous();
        let b = Channel::<u32>::buffered(1);
        a.retire(true);
        b.try_write(3).expect("preload b");

        let (index, value) = block_on(read_from_any(
            &[a, b],
            Priority::First,
            Deadline::Never,
        ))
        .expect("live branch wins");
        assert_eq!((index, value), (1, 3));
        crate::test_complete!("one_live_branch_outweighs_retired_ones");
    }

    #[test]
    fn shared_deadline_expires_the_whole_selection() {
        init_test("shared_deadline_expires_the_whole_selection");
        let (manager, clock) = ExpiryManager::virtual_pair();
        let a: Channel<u32> = ChannelBuilder::new()
            .with_timer(Arc::clone(&manager))
            .build()
            .expect("valid options");
        let b: Channel<u32> = ChannelBuilder::new()
            .with_timer(Arc::clone(&manager))
            .build()
            .expect("valid options");

        let select = read_from_any(
            &[a.clone(), b.clone()],
            Priority::First,
            Deadline::After(std::time::Duration::from_millis(20)),
        );
        clock.advance(20_000_000);
        manager.process(clock.now());

        let err = block_on(select).expect_err("deadline hit both branches");
        crate::assert_with_log!(err.is_timeout(), "timeout kind", true, err.is_timeout());
        assert_eq!(a.pending_readers(), 0);
        assert_eq!(b.pending_readers(), 0);
        crate::test_complete!("shared_deadline_expires_the_whole_selection");
    }

    #[test]
    fn empty_selection_is_invalid() {
        init_test("empty_selection_is_invalid");
        let err = block_on(read_from_any::<u32>(&[], Priority::First, Deadline::Never))
            .expect_err("nothing to select");
        assert_eq!(err.kind(), crate::ErrorKind::InvalidArgument);
        crate::test_complete!("empty_selection_is_invalid");
    }
}
