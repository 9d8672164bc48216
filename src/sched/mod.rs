//! The almost-deterministic work-stealing scheduler and its building blocks.
//!
//! - [`drange`]: distribution-range algebra and task-group version flippers
//! - [`dtree`]: the replicated distribution tree driving directed steals
//! - [`wsqueue`]: per-worker, per-depth dual work-stealing deques
//! - [`mailbox`]: one-slot cross-worker mailboxes
//! - [`callstack`]: the uni-address frame region
//! - [`remotable`]: globally addressable arenas for thread states and
//!   evacuated payloads
//! - [`context`]: the execution-context engine (pooled strands, rendezvous
//!   cells, worker tokens)
//! - [`dag_prof`]: deterministic DAG counters
//! - [`scheduler`]: fork/join, task groups, poll, collective execution, the
//!   scheduler loop, and stealing

pub mod callstack;
pub mod context;
pub mod dag_prof;
pub mod drange;
pub mod dtree;
pub mod mailbox;
pub mod remotable;
pub mod scheduler;
pub mod wsqueue;

pub use dag_prof::DagProfiler;
pub use drange::{DistRange, Flipper};
pub use scheduler::{CollCtx, ForkOpts, TaskCtx, TaskGroupData, ThreadHandle};
