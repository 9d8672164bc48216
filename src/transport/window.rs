//! One-sided memory windows.
//!
//! A window exposes a fixed-size buffer on every rank. The owner accesses its
//! local buffer directly; any rank may get/put slices of any other rank's
//! buffer. [`AtomicWindow`] additionally offers remote atomic operations,
//! which the distribution tree uses for its dominant flags and the scheduler
//! for thread-state races.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::RwLock;

use super::Rank;

/// A typed one-sided window: one `Vec<T>` per rank.
#[derive(Debug)]
pub struct Window<T: Copy + Default> {
    bufs: Vec<RwLock<Vec<T>>>,
}

impl<T: Copy + Default> Window<T> {
    /// Creates a window with `len` slots on each of `n_ranks` ranks.
    #[must_use]
    pub fn new(n_ranks: usize, len: usize) -> Self {
        Self {
            bufs: (0..n_ranks)
                .map(|_| RwLock::new(vec![T::default(); len]))
                .collect(),
        }
    }

    /// Number of slots per rank.
    #[must_use]
    pub fn len(&self) -> usize {
        self.bufs[0].read().expect("window lock poisoned").len()
    }

    /// Returns true if the window has no slots.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reads one slot from `rank`.
    #[must_use]
    pub fn get(&self, rank: Rank, idx: usize) -> T {
        self.bufs[rank].read().expect("window lock poisoned")[idx]
    }

    /// Reads `n` slots starting at `idx` from `rank`.
    #[must_use]
    pub fn get_slice(&self, rank: Rank, idx: usize, n: usize) -> Vec<T> {
        let buf = self.bufs[rank].read().expect("window lock poisoned");
        buf[idx..idx + n].to_vec()
    }

    /// Writes one slot on `rank`.
    pub fn put(&self, rank: Rank, idx: usize, value: T) {
        self.bufs[rank].write().expect("window lock poisoned")[idx] = value;
    }

    /// Writes a slice starting at `idx` on `rank`.
    pub fn put_slice(&self, rank: Rank, idx: usize, values: &[T]) {
        let mut buf = self.bufs[rank].write().expect("window lock poisoned");
        buf[idx..idx + values.len()].copy_from_slice(values);
    }
}

/// A window of `i64` slots supporting remote atomic operations.
#[derive(Debug)]
pub struct AtomicWindow {
    bufs: Vec<Vec<AtomicI64>>,
}

impl AtomicWindow {
    /// Creates an atomic window with `len` slots per rank, all zero.
    #[must_use]
    pub fn new(n_ranks: usize, len: usize) -> Self {
        Self {
            bufs: (0..n_ranks)
                .map(|_| (0..len).map(|_| AtomicI64::new(0)).collect())
                .collect(),
        }
    }

    /// Atomically loads the slot at `(rank, idx)`.
    #[must_use]
    pub fn load(&self, rank: Rank, idx: usize) -> i64 {
        self.bufs[rank][idx].load(Ordering::SeqCst)
    }

    /// Atomically stores `value` into the slot at `(rank, idx)`.
    pub fn store(&self, rank: Rank, idx: usize, value: i64) {
        self.bufs[rank][idx].store(value, Ordering::SeqCst);
    }

    /// Atomic compare-and-swap; returns the previous value.
    pub fn cas(&self, rank: Rank, idx: usize, expected: i64, desired: i64) -> i64 {
        match self.bufs[rank][idx].compare_exchange(
            expected,
            desired,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(prev) | Err(prev) => prev,
        }
    }

    /// Atomic fetch-add; returns the previous value.
    pub fn fetch_add(&self, rank: Rank, idx: usize, delta: i64) -> i64 {
        self.bufs[rank][idx].fetch_add(delta, Ordering::SeqCst)
    }
}
