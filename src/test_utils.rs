//! Test utilities for Altsync.
//!
//! Shared helpers for unit and integration tests:
//! - Consistent tracing-based logging initialization
//! - Phase/section macros for readable test output
//! - A polling `block_on` for driving the crate's runtime-agnostic futures
//!
//! Only built with the `test-util` feature, which the crate's own dev
//! dependency enables for its test suite; downstream crates opt in the same
//! way and never link `tracing-subscriber` otherwise.
//!
//! # Example
//! ```
//! use altsync::test_utils::{block_on, init_test_logging};
//! use altsync::channel::Channel;
//! use altsync::time::Deadline;
//!
//! init_test_logging();
//! let ch = Channel::<u32>::buffered(1);
//! block_on(ch.write(1, Deadline::Never)).expect("buffer slot free");
//! assert_eq!(block_on(ch.read(Deadline::Never)).expect("value buffered"), 1);
//! ```

use std::future::Future;
use std::sync::Once;
use std::task::{Context, Poll, Waker};

use tracing_subscriber::fmt::format::FmtSpan;

static INIT_LOGGING: Once = Once::new();

/// Initialize test logging with trace-level output.
///
/// Safe to call multiple times; only initializes once.
pub fn init_test_logging() {
    init_test_logging_with_level(tracing::Level::TRACE);
}

/// Initialize test logging with a custom level.
///
/// The first call wins; later calls are no-ops.
pub fn init_test_logging_with_level(level: tracing::Level) {
    INIT_LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(level)
            .with_test_writer()
            .with_file(true)
            .with_line_number(true)
            .with_target(true)
            .with_thread_ids(true)
            .with_span_events(FmtSpan::CLOSE)
            .with_ansi(false)
            .try_init();
    });
}

/// Drives a future to completion by polling in a yield loop.
///
/// The crate's futures are resolved by peer operations (possibly on other
/// threads) or by the expiry manager, so a busy-poll with `yield_now` is
/// enough to observe completion without an executor.
pub fn block_on<F: Future>(f: F) -> F::Output {
    struct NoopWaker;
    impl std::task::Wake for NoopWaker {
        fn wake(self: std::sync::Arc<Self>) {}
    }
    let waker = Waker::from(std::sync::Arc::new(NoopWaker));
    let mut cx = Context::from_waker(&waker);
    let mut pinned = Box::pin(f);
    loop {
        match pinned.as_mut().poll(&mut cx) {
            Poll::Ready(v) => return v,
            Poll::Pending => std::thread::yield_now(),
        }
    }
}

/// Log a test phase transition with a visual separator.
#[macro_export]
macro_rules! test_phase {
    ($name:expr) => {
        tracing::info!(phase = %$name, "========================================");
        tracing::info!(phase = %$name, "TEST PHASE: {}", $name);
        tracing::info!(phase = %$name, "========================================");
    };
}

/// Log a section within a test phase.
#[macro_export]
macro_rules! test_section {
    ($name:expr) => {
        tracing::debug!(section = %$name, "--- {} ---", $name);
    };
}

/// Log test completion with summary.
#[macro_export]
macro_rules! test_complete {
    ($name:expr) => {
        tracing::info!(test = %$name, "test completed successfully: {}", $name);
    };
    ($name:expr, $($key:ident = $value:expr),* $(,)?) => {
        tracing::info!(
            test = %$name,
            $($key = %$value,)*
            "test completed successfully: {}",
            $name
        );
    };
}

/// Log before assertions for context.
#[macro_export]
macro_rules! assert_with_log {
    ($cond:expr, $msg:expr, $expected:expr, $actual:expr) => {
        tracing::debug!(
            expected = ?$expected,
            actual = ?$actual,
            "Asserting: {}",
            $msg
        );
        assert!($cond, "{}: expected {:?}, got {:?}", $msg, $expected, $actual);
    };
}
