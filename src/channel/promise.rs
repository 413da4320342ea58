//! One-shot completion slots shared between a waiter and its channel.

use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};

use crate::error::Result;

/// A one-shot completion slot.
///
/// The channel half resolves it exactly once (under the channel lock); the
/// future half polls it, parking its waker until the outcome lands. Cloning
/// shares the slot.
pub(crate) struct Promise<T> {
    slot: Arc<Mutex<Slot<T>>>,
}

struct Slot<T> {
    outcome: Option<Result<T>>,
    waker: Option<Waker>,
    taken: bool,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            slot: Arc::clone(&self.slot),
        }
    }
}

impl<T> std::fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let slot = self.slot.lock().expect("promise lock poisoned");
        f.debug_struct("Promise")
            .field("resolved", &(slot.taken || slot.outcome.is_some()))
            .finish_non_exhaustive()
    }
}

impl<T> Promise<T> {
    /// Creates an unresolved promise.
    pub(crate) fn new() -> Self {
        Self {
            slot: Arc::new(Mutex::new(Slot {
                outcome: None,
                waker: None,
                taken: false,
            })),
        }
    }

    /// Creates a promise already carrying its outcome (synchronous paths).
    pub(crate) fn resolved(outcome: Result<T>) -> Self {
        Self {
            slot: Arc::new(Mutex::new(Slot {
                outcome: Some(outcome),
                waker: None,
                taken: false,
            })),
        }
    }

    /// Resolves the promise. Each promise is resolved at most once; queues
    /// remove an entry in the same critical section that resolves it, so a
    /// second resolution indicates a kernel bug.
    pub(crate) fn resolve(&self, outcome: Result<T>) {
        let waker = {
            let mut slot = self.slot.lock().expect("promise lock poisoned");
            debug_assert!(
                slot.outcome.is_none() && !slot.taken,
                "promise resolved twice"
            );
            if slot.outcome.is_some() || slot.taken {
                return;
            }
            slot.outcome = Some(outcome);
            slot.waker.take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    /// Polls for the outcome, parking the task's waker while unresolved.
    pub(crate) fn poll_take(&self, ctx: &mut Context<'_>) -> Poll<Result<T>> {
        let mut slot = self.slot.lock().expect("promise lock poisoned");
        if let Some(outcome) = slot.outcome.take() {
            slot.taken = true;
            return Poll::Ready(outcome);
        }
        slot.waker = Some(ctx.waker().clone());
        Poll::Pending
    }

    /// Takes the outcome if already resolved, without parking anything.
    pub(crate) fn take_now(&self) -> Option<Result<T>> {
        let mut slot = self.slot.lock().expect("promise lock poisoned");
        let outcome = slot.outcome.take();
        if outcome.is_some() {
            slot.taken = true;
        }
        outcome
    }

    /// Returns true once resolved (whether or not the outcome was taken).
    pub(crate) fn is_resolved(&self) -> bool {
        let slot = self.slot.lock().expect("promise lock poisoned");
        slot.taken || slot.outcome.is_some()
    }

    /// Peeks at a resolved outcome without taking it: `None` while
    /// unresolved, `Some(Ok(()))` on success, `Some(Err(kind))` on failure.
    pub(crate) fn peek(&self) -> Option<core::result::Result<(), crate::error::ErrorKind>> {
        let slot = self.slot.lock().expect("promise lock poisoned");
        match &slot.outcome {
            Some(Ok(_)) => Some(Ok(())),
            Some(Err(e)) => Some(Err(e.kind())),
            None if slot.taken => Some(Ok(())),
            None => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::task::Wake;

    struct CountingWaker(std::sync::atomic::AtomicUsize);

    impl Wake for CountingWaker {
        fn wake(self: Arc<Self>) {
            self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }
    }

    #[test]
    fn resolve_then_poll() {
        let promise: Promise<u32> = Promise::new();
        promise.resolve(Ok(7));
        assert!(promise.is_resolved());
        assert_eq!(promise.take_now().map(|r| r.ok()), Some(Some(7)));
        // Taken stays taken.
        assert!(promise.is_resolved());
        assert!(promise.take_now().is_none());
    }

    #[test]
    fn poll_parks_and_wakes() {
        let promise: Promise<u32> = Promise::new();
        let counter = Arc::new(CountingWaker(std::sync::atomic::AtomicUsize::new(0)));
        let waker = Waker::from(Arc::clone(&counter));
        let mut ctx = Context::from_waker(&waker);

        assert!(promise.poll_take(&mut ctx).is_pending());
        promise.resolve(Err(Error::timeout()));
        assert_eq!(counter.0.load(std::sync::atomic::Ordering::SeqCst), 1);

        match promise.poll_take(&mut ctx) {
            Poll::Ready(Err(e)) => assert!(e.is_timeout()),
            other => panic!("expected ready timeout, got {other:?}"),
        }
    }

    #[test]
    fn pre_resolved_promise() {
        let promise: Promise<&str> = Promise::resolved(Ok("done"));
        assert!(promise.is_resolved());
        assert_eq!(promise.take_now().map(|r| r.ok()), Some(Some("done")));
    }
}
