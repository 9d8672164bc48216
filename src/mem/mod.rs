//! Global address space: segments, typed pointers, checkout/checkin.
//!
//! Collective segments distribute their bytes block-wise across all ranks;
//! rank-local segments stay with their allocator but are globally
//! addressable. Tasks never touch global bytes directly: access is scoped by
//! [`CheckoutSpan`] guards obtained through [`crate::Ctx::checkout`], and the
//! per-rank [`home::HomeManager`] bounds and refcounts the live mappings.

pub mod byte_repr;
pub mod checkout;
pub mod global_ptr;
pub mod home;
pub mod segment;

pub use byte_repr::ByteRepr;
pub use checkout::{CheckoutMode, CheckoutSpan};
pub use global_ptr::{GlobalPtr, GlobalSpan, SegmentId};
pub use home::{BlockKey, HomeManager};
pub use segment::{GlobalMemory, Segment, SegmentKind};
