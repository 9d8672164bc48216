//! Tracing compatibility layer for structured logging.
//!
//! This module provides a unified interface for tracing that works whether or
//! not the `tracing-integration` feature is enabled:
//!
//! - **With feature enabled**: re-exports from the `tracing` crate.
//! - **Without feature**: no-op macros that compile to nothing.
//!
//! The scheduler logs its state transitions (fork paths, migrations, steals,
//! resumes) at `trace!` level; rarer events (dominant flag changes, collective
//! task broadcast) use `debug!`.

#[cfg(feature = "tracing-integration")]
pub use tracing::{debug, error, info, trace, warn};

#[cfg(not(feature = "tracing-integration"))]
mod noop {
    //! No-op implementations when tracing is disabled.

    macro_rules! trace {
        ($($arg:tt)*) => {};
    }

    macro_rules! debug {
        ($($arg:tt)*) => {};
    }

    macro_rules! info {
        ($($arg:tt)*) => {};
    }

    macro_rules! warn_ {
        ($($arg:tt)*) => {};
    }

    macro_rules! error {
        ($($arg:tt)*) => {};
    }

    pub(crate) use {debug, error, info, trace, warn_ as warn};
}

#[cfg(not(feature = "tracing-integration"))]
#[allow(unused_imports)]
pub(crate) use noop::{debug, error, info, trace, warn};
