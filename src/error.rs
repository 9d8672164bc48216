//! Error types and error handling strategy for Weft.
//!
//! Error handling follows these principles:
//!
//! - Errors are explicit and typed (no stringly-typed errors)
//! - Fatal resource exhaustion (call-stack region, remotable arenas, queue
//!   capacity, home mappings) aborts with a diagnostic rather than limping on
//! - Programming errors (collective calls outside SPMD/root, mismatched
//!   checkins) are detected with debug assertions or fatal panics
//! - Transient conditions (a held steal lock, a full mailbox slot) are not
//!   errors; callers retry after making progress

use core::fmt;
use std::sync::Arc;

/// The kind of error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    // === Configuration ===
    /// An option value is invalid or an environment override failed to parse.
    Config,
    /// The requested worker count is invalid.
    InvalidRankCount,

    // === Resource exhaustion ===
    /// The call-stack region has no free frame slots.
    StackExhausted,
    /// A remotable arena has reached its configured capacity.
    ArenaExhausted,
    /// A work-stealing queue exceeded its per-depth capacity.
    QueueOverflow,
    /// The home manager ran out of mapping entries.
    MappingExhausted,

    // === Programming errors ===
    /// A collective operation was invoked outside an SPMD region or the root
    /// task.
    NotCollective,
    /// A checkout/checkin pair did not match.
    MismatchedCheckin,
    /// A global pointer does not fall inside any live segment.
    OutOfSegment,

    // === Internal / state machine ===
    /// Internal runtime error (bug).
    Internal,
}

/// The main error type for Weft operations.
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

    /// Returns the error kind.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns true if this error indicates resource exhaustion.
    #[must_use]
    pub const fn is_exhaustion(&self) -> bool {
        matches!(
            self.kind,
            ErrorKind::StackExhausted
                | ErrorKind::ArenaExhausted
                | ErrorKind::QueueOverflow
                | ErrorKind::MappingExhausted
        )
    }

    /// Adds context text to the error.
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

    /// Creates a configuration error with a message.
    #[must_use]
    pub fn config(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Config).with_context(msg)
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

/// A specialized Result type for Weft operations.
pub type Result<T> = core::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[derive(Debug)]
    struct Underlying;

    impl fmt::Display for Underlying {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "underlying")
        }
    }

    impl std::error::Error for Underlying {}

    #[test]
    fn display_without_context() {
        let err = Error::new(ErrorKind::Internal);
        assert_eq!(err.to_string(), "Internal");
    }

    #[test]
    fn display_with_context() {
        let err = Error::new(ErrorKind::StackExhausted).with_context("64 frames in use");
        assert_eq!(err.to_string(), "StackExhausted: 64 frames in use");
    }

    #[test]
    fn source_chain_is_exposed() {
        let err = Error::config("outer").with_source(Underlying);
        let source = err.source().expect("source missing");
        assert_eq!(source.to_string(), "underlying");
    }

    #[test]
    fn exhaustion_predicate() {
        assert!(Error::new(ErrorKind::ArenaExhausted).is_exhaustion());
        assert!(Error::new(ErrorKind::QueueOverflow).is_exhaustion());
        assert!(!Error::new(ErrorKind::Config).is_exhaustion());
    }

    #[test]
    fn result_ext_adds_context() {
        let res: core::result::Result<(), Error> = Err(Error::new(ErrorKind::OutOfSegment));
        let err = res.context("bad pointer").expect_err("expected err");
        assert_eq!(err.kind(), ErrorKind::OutOfSegment);
        assert_eq!(err.to_string(), "OutOfSegment: bad pointer");
    }
}
