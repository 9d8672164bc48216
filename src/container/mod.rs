//! Containers over global memory.

pub mod global_vector;

pub use global_vector::{GlobalVector, GlobalVectorOpts};
