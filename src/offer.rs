//! The two-phase commit contract behind every match.
//!
//! The kernel never completes a match by popping a queue head. It first
//! invokes [`Offer::offer`] on both sides' handles; only if both accept does
//! it [`Offer::commit`]. A side that accepted while the other vetoed gets
//! [`Offer::withdraw`]n, leaving no visible state. This is the primitive that
//! makes multi-channel selection atomic: the selector's shared handle
//! CAS-acquires a flag on `offer`, so at most one channel can ever commit it.
//!
//! # Contract
//!
//! - `offer` tentatively reserves; returning `false` vetoes the match.
//! - `withdraw` releases a prior tentative reservation; a rejected offer must
//!   leave no visible state.
//! - `commit` finalizes and is infallible.
//! - All three run inside a channel's lock. Implementations must not take any
//!   channel lock and may touch only their own lock-free state.
//!
//! The absence of a handle (`None`) means "unconditionally accept"; its
//! commit and withdraw are no-ops.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A two-phase commit capability attached to a pending operation.
pub trait Offer: Send + Sync {
    /// Tentatively reserve this side of a match. `false` vetoes.
    fn offer(&self) -> bool;

    /// Release a reservation made by a prior accepted `offer`.
    fn withdraw(&self);

    /// Finalize a reservation. Must not fail.
    fn commit(&self);
}

/// The optional handle carried by every pending entry. `None` accepts
/// unconditionally.
pub type OfferRef = Option<Arc<dyn Offer>>;

/// Probes a handle; a missing handle always accepts.
pub(crate) fn accepts(offer: &OfferRef) -> bool {
    offer.as_ref().map_or(true, |o| o.offer())
}

/// Withdraws a prior acceptance; no-op for a missing handle.
pub(crate) fn withdraw(offer: &OfferRef) {
    if let Some(o) = offer {
        o.withdraw();
    }
}

/// Commits an acceptance; no-op for a missing handle.
pub(crate) fn commit(offer: &OfferRef) {
    if let Some(o) = offer {
        o.commit();
    }
}

/// Caller-initiated cancellation capability.
///
/// Attach a token to a `read`/`write` via the `_with` variants; after
/// [`cancel`](CancelToken::cancel) the token vetoes every subsequent offer,
/// so the next visit to the entry dequeues it with a `Cancelled` result.
///
/// # Example
///
/// ```
/// use altsync::offer::CancelToken;
/// use std::sync::Arc;
///
/// let token = Arc::new(CancelToken::new());
/// assert!(!token.is_cancelled());
/// token.cancel();
/// assert!(token.is_cancelled());
/// ```
#[derive(Debug, Default)]
pub struct CancelToken {
    cancelled: AtomicBool,
}

impl CancelToken {
    /// Creates a token in the non-cancelled state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            cancelled: AtomicBool::new(false),
        }
    }

    /// Makes every subsequent offer veto.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// Returns true once [`cancel`](Self::cancel) has been called.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

impl Offer for CancelToken {
    fn offer(&self) -> bool {
        !self.is_cancelled()
    }

    fn withdraw(&self) {}

    fn commit(&self) {}
}
