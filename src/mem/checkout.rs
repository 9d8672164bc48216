//! Scoped checkout/checkin access to global memory.
//!
//! A checkout makes a global range locally dereferenceable for the duration
//! of the guard. Read modes fetch the bytes from the owning shards; write
//! modes publish the guard's contents back on checkin, touching exactly the
//! checked-out byte range so neighboring elements in the same block are never
//! clobbered. Checkin happens explicitly or on drop.
//!
//! The no-access mode performs no fetch and no mapping work; it exists so
//! loop drivers can order references to elements they will check out manually.

use core::ops::{Deref, DerefMut};
use smallvec::SmallVec;
use std::sync::Arc;

use crate::mem::byte_repr::{decode_slice, encode_slice, ByteRepr};
use crate::mem::global_ptr::GlobalPtr;
use crate::mem::home::BlockKey;
use crate::runtime::Cluster;

/// Access mode of a checkout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckoutMode {
    /// Fetch; local writes are discarded.
    Read,
    /// No fetch; contents are published on checkin.
    Write,
    /// Fetch and publish.
    ReadWrite,
    /// Sentinel checkout: no fetch, no mapping, no dereference.
    NoAccess,
}

impl CheckoutMode {
    const fn fetches(self) -> bool {
        matches!(self, Self::Read | Self::ReadWrite)
    }

    const fn publishes(self) -> bool {
        matches!(self, Self::Write | Self::ReadWrite)
    }
}

/// A checked-out global range, dereferenceable as a typed slice.
pub struct CheckoutSpan<T: ByteRepr> {
    cluster: Arc<Cluster>,
    rank: usize,
    ptr: GlobalPtr<T>,
    data: Vec<T>,
    mode: CheckoutMode,
    local_blocks: SmallVec<[BlockKey; 4]>,
    checked_in: bool,
}

pub(crate) fn checkout_impl<T: ByteRepr>(
    cluster: &Arc<Cluster>,
    rank: usize,
    ptr: GlobalPtr<T>,
    count: usize,
    mode: CheckoutMode,
) -> CheckoutSpan<T> {
    assert!(!ptr.is_null(), "checkout through a null global pointer");
    let bytes = count as u64 * T::SIZE as u64;

    let data = if mode.fetches() {
        let mut buf = vec![0u8; bytes as usize];
        cluster.memory.read(ptr.segment(), ptr.offset(), &mut buf);
        decode_slice(&buf, count)
    } else if mode == CheckoutMode::Write {
        vec![T::default(); count]
    } else {
        Vec::new()
    };

    let mut local_blocks = SmallVec::new();
    if mode != CheckoutMode::NoAccess && bytes > 0 {
        let seg = cluster.memory.segment(ptr.segment());
        let bs = cluster.memory.block_size();
        let first = ptr.offset() / bs;
        let last = (ptr.offset() + bytes - 1) / bs;
        for block in first..=last {
            if seg.home_of((block * bs).min(seg.len.saturating_sub(1))) == rank {
                let key = BlockKey {
                    seg: ptr.segment(),
                    block,
                };
                cluster.memory.home(rank).checkout_block(key);
                local_blocks.push(key);
            }
        }
    }

    CheckoutSpan {
        cluster: Arc::clone(cluster),
        rank,
        ptr,
        data,
        mode,
        local_blocks,
        checked_in: false,
    }
}

impl<T: ByteRepr> CheckoutSpan<T> {
    /// Number of checked-out elements.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// True if no elements are checked out.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The global pointer this span was checked out from.
    #[must_use]
    pub fn global_ptr(&self) -> GlobalPtr<T> {
        self.ptr
    }

    /// Publishes writes (in write modes) and releases the mapping references.
    pub fn checkin(mut self) {
        self.perform_checkin();
    }

    fn perform_checkin(&mut self) {
        if self.checked_in {
            return;
        }
        self.checked_in = true;

        if self.mode.publishes() {
            let bytes = encode_slice(&self.data);
            self.cluster
                .memory
                .write(self.ptr.segment(), self.ptr.offset(), &bytes);
        }
        for key in &self.local_blocks {
            self.cluster.memory.home(self.rank).checkin_block(*key);
        }
    }
}

impl<T: ByteRepr> Deref for CheckoutSpan<T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        assert!(
            self.mode != CheckoutMode::NoAccess,
            "dereferenced a no-access checkout"
        );
        &self.data
    }
}

impl<T: ByteRepr> DerefMut for CheckoutSpan<T> {
    fn deref_mut(&mut self) -> &mut [T] {
        assert!(
            self.mode.publishes(),
            "mutated a checkout without write access"
        );
        &mut self.data
    }
}

impl<T: ByteRepr> Drop for CheckoutSpan<T> {
    fn drop(&mut self) {
        self.perform_checkin();
    }
}
