//! Weft: a distributed task-parallel runtime with almost-deterministic work
//! stealing (ADWS) and a checkout/checkin global address space.
//!
//! # Overview
//!
//! Weft runs nested fork/join programs across a cluster of worker ranks. Each
//! task carries a *distribution range* describing which subset of workers it
//! logically owns; task placement and the shared-address layer cooperate so
//! that workers recurrently touch the same address regions, yielding locality
//! without explicit partitioning.
//!
//! The runtime hosts its cluster in-process: one OS thread per rank enters an
//! SPMD region, and all cross-rank communication goes through the transport
//! layer's one-sided primitives, so the scheduler is written exactly as it
//! would be over a networked transport.
//!
//! # Core Pieces
//!
//! - **Scheduler**: work-first fork/join with dual per-depth work-stealing
//!   queues, a replicated distribution tree for directed stealing, one-slot
//!   cross-worker mailboxes, and a continuation evacuation protocol
//! - **Memory**: block-partitioned global segments with scoped
//!   checkout/checkin access and a per-rank home-mapping manager
//! - **Patterns**: parallel for-each/reduce with range-proportional fork
//!   weights, driving the scheduler's distribution machinery
//! - **Container**: a global vector (collective or rank-local) built on the
//!   above
//!
//! # Module Structure
//!
//! - [`runtime`]: runtime handle, SPMD launch, lifecycle
//! - [`sched`]: the ADWS scheduler and its building blocks
//! - [`mem`]: global pointers, segments, checkout/checkin, home manager
//! - [`pattern`]: execution policies and parallel loop templates
//! - [`container`]: the global vector
//! - [`transport`]: one-sided communication primitives (in-process)
//! - [`config`]: runtime options and environment overrides
//! - [`error`]: error types
//! - [`util`]: internal utilities (deterministic RNG, generation slot arena)
//!
//! # Example
//!
//! ```ignore
//! use weft::{Ctx, Runtime};
//!
//! let rt = Runtime::new(4).unwrap();
//! rt.spmd(|ctx| {
//!     if let Some(sum) = ctx.root_exec(|ctx| {
//!         let a = ctx.fork(|_| 40u64);
//!         let b = 2u64;
//!         ctx.join(a) + b
//!     }) {
//!         assert_eq!(sum, 42);
//!     }
//! });
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_possible_wrap)]

pub mod config;
pub mod container;
pub mod ctx;
pub mod error;
pub mod mem;
pub mod pattern;
pub mod runtime;
pub mod sched;
pub mod tracing_compat;
pub mod transport;
pub mod util;

pub use config::RuntimeOptions;
pub use container::{GlobalVector, GlobalVectorOpts};
pub use ctx::Ctx;
pub use error::{Error, ErrorKind, Result, ResultExt};
pub use mem::{ByteRepr, CheckoutMode, CheckoutSpan, GlobalPtr, GlobalSpan};
pub use pattern::{ParallelPolicy, SequencedPolicy};
pub use runtime::{Runtime, SpmdCtx};
pub use sched::{CollCtx, DistRange, ForkOpts, TaskCtx, TaskGroupData, ThreadHandle};
