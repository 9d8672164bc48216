//! Per-rank call-stack region.
//!
//! Every rank reserves a region of identical size holding fixed-width frame
//! records, so a frame address (a byte offset into the region) denotes the
//! same logical slot on every worker, the uni-address invariant that makes
//! queued frame references portable. The region is backed by a transport
//! window, so a thief can copy a frame record straight out of a peer's live
//! region with [`CallStack::direct_copy_from`].
//!
//! Top is the low address, bottom the high address, and frames are handed out
//! from the bottom up, mirroring a stack that grows down. A frame slot is
//! owned by the strand that suspended on it and is released when that strand
//! wakes; evacuation copies the record elsewhere but leaves the slot with its
//! owner.

use std::sync::Mutex;

use crate::sched::context::CellId;
use crate::transport::{Rank, Window};

/// Byte width of one frame record in the region.
pub const FRAME_BYTES: u64 = 32;

/// A frame address: byte offset into the uni-address region.
pub type FrameAddr = u64;

/// Reserved address meaning "no frame".
pub const NULL_FRAME: FrameAddr = u64::MAX;

/// The saved state of a suspension point.
///
/// `parent` is the frame that was on top when this one was pushed; a record
/// resumed as the root of a fresh stack has its parent cleared first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameRecord {
    /// Rendezvous cell to post the worker token to.
    pub cell: CellId,
    /// Previous top-of-stack frame.
    pub parent: FrameAddr,
}

/// The per-rank call-stack regions of the whole cluster.
#[derive(Debug)]
pub struct CallStack {
    win: Window<FrameRecord>,
    free: Vec<Mutex<Vec<u32>>>,
    slots: usize,
}

impl CallStack {
    /// Reserves a region of `size` bytes on each of `n_ranks` ranks.
    #[must_use]
    pub fn new(n_ranks: usize, size: usize) -> Self {
        let slots = size / FRAME_BYTES as usize;
        assert!(slots > 0, "call-stack region smaller than one frame");
        // Free list popped from the back: lowest slot indices come off last,
        // so allocation proceeds from the bottom (high addresses) down.
        let free: Vec<Mutex<Vec<u32>>> = (0..n_ranks)
            .map(|_| Mutex::new((0..slots as u32).collect()))
            .collect();
        Self {
            win: Window::new(n_ranks, slots),
            free,
            slots,
        }
    }

    /// Low end of the region.
    #[must_use]
    pub const fn top(&self) -> FrameAddr {
        0
    }

    /// High end of the region.
    #[must_use]
    pub fn bottom(&self) -> FrameAddr {
        self.slots as u64 * FRAME_BYTES
    }

    /// Region size in bytes.
    #[must_use]
    pub fn size(&self) -> usize {
        self.slots * FRAME_BYTES as usize
    }

    /// True if `[addr, addr + size)` lies inside every rank's reservation.
    #[must_use]
    pub fn contains(&self, addr: FrameAddr, size: u32) -> bool {
        addr % FRAME_BYTES == 0 && addr + u64::from(size) <= self.bottom()
    }

    /// Allocates a frame slot on `rank`.
    ///
    /// # Panics
    ///
    /// Panics when the region is exhausted; this is a fatal configuration
    /// error (`stack_size` too small for the fork depth).
    pub fn allocate(&self, rank: Rank) -> FrameAddr {
        let slot = self.free[rank]
            .lock()
            .expect("callstack lock poisoned")
            .pop()
            .unwrap_or_else(|| {
                panic!(
                    "call-stack region exhausted on rank {rank} ({} frames in use)",
                    self.slots
                )
            });
        u64::from(slot) * FRAME_BYTES
    }

    /// Returns a frame slot on `rank` to the free list.
    pub fn deallocate(&self, rank: Rank, addr: FrameAddr) {
        debug_assert!(self.contains(addr, FRAME_BYTES as u32));
        self.free[rank]
            .lock()
            .expect("callstack lock poisoned")
            .push((addr / FRAME_BYTES) as u32);
    }

    /// Writes a frame record on the local rank.
    pub fn store(&self, rank: Rank, addr: FrameAddr, record: FrameRecord) {
        self.win.put(rank, (addr / FRAME_BYTES) as usize, record);
    }

    /// Reads a frame record from the local rank.
    #[must_use]
    pub fn load(&self, rank: Rank, addr: FrameAddr) -> FrameRecord {
        self.win.get(rank, (addr / FRAME_BYTES) as usize)
    }

    /// Copies a frame record out of a peer's live region.
    ///
    /// Valid because of the uni-address reservation: `addr` denotes the same
    /// slot on every rank.
    #[must_use]
    pub fn direct_copy_from(&self, addr: FrameAddr, size: u32, remote: Rank) -> FrameRecord {
        debug_assert!(self.contains(addr, size));
        debug_assert_eq!(u64::from(size), FRAME_BYTES);
        self.win.get(remote, (addr / FRAME_BYTES) as usize)
    }

    /// Number of allocated frames on `rank` (quiescence checks).
    #[must_use]
    pub fn frames_in_use(&self, rank: Rank) -> usize {
        self.slots
            - self.free[rank]
                .lock()
                .expect("callstack lock poisoned")
                .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_grow_down_from_bottom() {
        let cs = CallStack::new(2, 4096);
        let a = cs.allocate(0);
        let b = cs.allocate(0);
        assert!(a > b, "later frames sit at lower addresses");
        assert_eq!(a + FRAME_BYTES, cs.bottom());
        cs.deallocate(0, a);
        cs.deallocate(0, b);
        assert_eq!(cs.frames_in_use(0), 0);
    }

    #[test]
    fn uni_address_bounds() {
        let cs = CallStack::new(3, 4096);
        let a = cs.allocate(1);
        assert!(cs.contains(a, FRAME_BYTES as u32));
        assert!(!cs.contains(cs.bottom(), 1));
        cs.deallocate(1, a);
    }

    #[test]
    fn direct_copy_reads_peer_region() {
        let cs = CallStack::new(2, 4096);
        let addr = cs.allocate(1);
        let rec = FrameRecord {
            cell: CellId::NULL,
            parent: NULL_FRAME,
        };
        cs.store(1, addr, rec);
        let copied = cs.direct_copy_from(addr, FRAME_BYTES as u32, 1);
        assert_eq!(copied, rec);
        cs.deallocate(1, addr);
    }

    #[test]
    fn ranks_have_independent_free_lists() {
        let cs = CallStack::new(2, 1024);
        let slots = 1024 / FRAME_BYTES as usize;
        let mut held = Vec::new();
        for _ in 0..slots {
            held.push(cs.allocate(0));
        }
        assert_eq!(cs.frames_in_use(0), slots);
        // Rank 1 is unaffected by rank 0 exhaustion.
        let b = cs.allocate(1);
        cs.deallocate(1, b);
        for a in held {
            cs.deallocate(0, a);
        }
    }

    #[test]
    #[should_panic(expected = "call-stack region exhausted")]
    fn exhaustion_is_fatal() {
        let cs = CallStack::new(1, FRAME_BYTES as usize);
        let _a = cs.allocate(0);
        let _b = cs.allocate(0);
    }
}
