//! Error types and error handling strategy for Altsync.
//!
//! This module defines the core error types used throughout the crate.
//! Error handling follows these principles:
//!
//! - Errors are explicit and typed (no stringly-typed errors)
//! - Every failed channel operation resolves its promise with exactly one error
//! - Errors are local to the failing operation; retiring one channel never
//!   poisons another

use core::fmt;
use std::sync::Arc;

/// The kind of error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Operation on a retired channel, or pending when the channel retired.
    Retired,
    /// Deadline elapsed before a match.
    Timeout,
    /// Withdrawn by the caller's own offer handle: the losing branch of a
    /// selection, a cancel token, or an overflow victim under a drop policy.
    Cancelled,
    /// Pending-queue bound exceeded under the `Reject` overflow policy.
    Overflow,
    /// Contradictory options or an unknown name injection.
    InvalidArgument,
}

/// The main error type for Altsync operations.
#[derive(Debug, Clone)]
pub struct Error {
    kind: ErrorKind,
    context: Option<String>,
    source: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

impl Error {
    /// Creates a new error with the given kind.
    #[must_use]
    pub const fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            context: None,
            source: None,
        }
    }

    /// Shorthand for a `Retired` error.
    #[must_use]
    pub const fn retired() -> Self {
        Self::new(ErrorKind::Retired)
    }

    /// Shorthand for a `Timeout` error.
    #[must_use]
    pub const fn timeout() -> Self {
        Self::new(ErrorKind::Timeout)
    }

    /// Shorthand for a `Cancelled` error.
    #[must_use]
    pub const fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled)
    }

    /// Shorthand for an `Overflow` error.
    #[must_use]
    pub const fn overflow() -> Self {
        Self::new(ErrorKind::Overflow)
    }

    /// Shorthand for an `InvalidArgument` error.
    #[must_use]
    pub const fn invalid_argument() -> Self {
        Self::new(ErrorKind::InvalidArgument)
    }

    /// Returns the error kind.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns true if this error means the channel was retired.
    #[must_use]
    pub const fn is_retired(&self) -> bool {
        matches!(self.kind, ErrorKind::Retired)
    }

    /// Returns true if this error is a deadline expiration.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self.kind, ErrorKind::Timeout)
    }

    /// Returns true if this error represents cancellation.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self.kind, ErrorKind::Cancelled)
    }

    /// Adds deterministic context text to the error.
    #[must_use]
    pub fn with_context(mut self, ctx: impl Into<String>) -> Self {
        self.context = Some(ctx.into());
        self
    }

    /// Adds a source error to the chain.
    #[must_use]
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Arc::new(source));
        self
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.kind)?;
        if let Some(ctx) = &self.context {
            write!(f, ": {ctx}")?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_ref().map(|e| e.as_ref() as _)
    }
}

/// Extension trait for adding context to Results.
pub trait ResultExt<T> {
    /// Attach a context string on error.
    fn context(self, ctx: impl Into<String>) -> Result<T>;
    /// Attach context computed lazily on error.
    fn with_context<F: FnOnce() -> String>(self, f: F) -> Result<T>;
}

impl<T, E: Into<Error>> ResultExt<T> for core::result::Result<T, E> {
    fn context(self, ctx: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.into().with_context(ctx))
    }

    fn with_context<F: FnOnce() -> String>(self, f: F) -> Result<T> {
        self.map_err(|e| e.into().with_context(f()))
    }
}

/// A specialized Result type for Altsync operations.
pub type Result<T> = core::result::Result<T, Error>;
