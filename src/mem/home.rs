//! Per-rank home-mapping manager.
//!
//! Tracks which home-local blocks are currently mapped for checkout access.
//! Each block has at most one mapping entry per rank; an entry carries a
//! refcount and may only be evicted at refcount zero. Mapping registration is
//! deferred: `checkout` queues the work and `checkout_complete` flushes it,
//! mirroring batched `mmap` maintenance.
//!
//! Exhausting the entry limit while every entry is pinned is a fatal error:
//! too much memory is checked out at once.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::mem::global_ptr::SegmentId;

/// Identifies one block of a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockKey {
    /// Segment id.
    pub seg: SegmentId,
    /// Block index within the segment.
    pub block: u64,
}

#[derive(Debug, Default)]
struct MapEntry {
    ref_count: u64,
    mapped: bool,
}

#[derive(Debug, Default)]
struct HomeState {
    entries: HashMap<BlockKey, MapEntry>,
    pending: Vec<BlockKey>,
}

/// Home-mapping bookkeeping for one rank.
#[derive(Debug)]
pub struct HomeManager {
    state: Mutex<HomeState>,
    limit: usize,
}

impl HomeManager {
    /// Creates a manager bounded to `limit` simultaneous entries.
    #[must_use]
    pub fn new(limit: usize) -> Self {
        Self {
            state: Mutex::new(HomeState::default()),
            limit,
        }
    }

    /// Acquires a reference on `key`, creating (and queueing) its mapping on
    /// first touch.
    ///
    /// # Panics
    ///
    /// Panics when the entry limit is reached and no entry is evictable.
    pub fn checkout_block(&self, key: BlockKey) {
        let mut st = self.state.lock().expect("home manager lock poisoned");
        if !st.entries.contains_key(&key) {
            if st.entries.len() >= self.limit {
                let victim = st
                    .entries
                    .iter()
                    .find(|(_, e)| e.ref_count == 0)
                    .map(|(k, _)| *k)
                    .unwrap_or_else(|| {
                        panic!(
                            "home segments are exhausted (too much checked-out memory, \
                             limit {})",
                            self.limit
                        )
                    });
                st.entries.remove(&victim);
                st.pending.retain(|k| *k != victim);
            }
            st.entries.insert(key, MapEntry::default());
            st.pending.push(key);
        }
        st.entries
            .get_mut(&key)
            .expect("entry just ensured")
            .ref_count += 1;
    }

    /// Releases a reference on `key`.
    ///
    /// # Panics
    ///
    /// Panics on a checkin with no matching checkout.
    pub fn checkin_block(&self, key: BlockKey) {
        let mut st = self.state.lock().expect("home manager lock poisoned");
        let entry = st
            .entries
            .get_mut(&key)
            .unwrap_or_else(|| panic!("mismatched checkin for block {key:?}"));
        assert!(entry.ref_count > 0, "mismatched checkin for block {key:?}");
        entry.ref_count -= 1;
    }

    /// Flushes deferred mapping work queued by checkouts.
    pub fn checkout_complete(&self) {
        let mut st = self.state.lock().expect("home manager lock poisoned");
        let pending = std::mem::take(&mut st.pending);
        for key in pending {
            if let Some(entry) = st.entries.get_mut(&key) {
                entry.mapped = true;
            }
        }
    }

    /// Drops all entries of a freed segment.
    ///
    /// # Panics
    ///
    /// Panics if the segment still has checked-out blocks.
    pub fn purge_segment(&self, seg: SegmentId) {
        let mut st = self.state.lock().expect("home manager lock poisoned");
        for (key, entry) in &st.entries {
            assert!(
                key.seg != seg || entry.ref_count == 0,
                "freeing global memory with live checkouts (block {key:?})"
            );
        }
        st.entries.retain(|key, _| key.seg != seg);
        st.pending.retain(|key| key.seg != seg);
    }

    /// Number of blocks with a positive refcount.
    #[must_use]
    pub fn live_refs(&self) -> usize {
        self.state
            .lock()
            .expect("home manager lock poisoned")
            .entries
            .values()
            .filter(|e| e.ref_count > 0)
            .count()
    }

    /// Number of entries, pinned or cached.
    #[must_use]
    pub fn entry_count(&self) -> usize {
        self.state
            .lock()
            .expect("home manager lock poisoned")
            .entries
            .len()
    }

    /// True once `key`'s deferred mapping has been flushed.
    #[must_use]
    pub fn is_mapped(&self, key: BlockKey) -> bool {
        self.state
            .lock()
            .expect("home manager lock poisoned")
            .entries
            .get(&key)
            .is_some_and(|e| e.mapped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(seg: SegmentId, block: u64) -> BlockKey {
        BlockKey { seg, block }
    }

    #[test]
    fn refcounts_nest() {
        let hm = HomeManager::new(4);
        hm.checkout_block(key(1, 0));
        hm.checkout_block(key(1, 0));
        assert_eq!(hm.live_refs(), 1);
        hm.checkin_block(key(1, 0));
        assert_eq!(hm.live_refs(), 1, "still one live ref");
        hm.checkin_block(key(1, 0));
        assert_eq!(hm.live_refs(), 0);
        assert_eq!(hm.entry_count(), 1, "entry stays cached at refcount zero");
    }

    #[test]
    fn deferred_mapping_flushes_on_complete() {
        let hm = HomeManager::new(4);
        hm.checkout_block(key(1, 3));
        assert!(!hm.is_mapped(key(1, 3)));
        hm.checkout_complete();
        assert!(hm.is_mapped(key(1, 3)));
    }

    #[test]
    fn eviction_prefers_unpinned_entries() {
        let hm = HomeManager::new(2);
        hm.checkout_block(key(1, 0));
        hm.checkout_block(key(1, 1));
        hm.checkin_block(key(1, 1));
        // Block 1 has refcount 0 and can be evicted to admit block 2.
        hm.checkout_block(key(1, 2));
        assert_eq!(hm.entry_count(), 2);
        hm.checkin_block(key(1, 0));
        hm.checkin_block(key(1, 2));
    }

    #[test]
    #[should_panic(expected = "home segments are exhausted")]
    fn pinned_exhaustion_is_fatal() {
        let hm = HomeManager::new(2);
        hm.checkout_block(key(1, 0));
        hm.checkout_block(key(1, 1));
        hm.checkout_block(key(1, 2));
    }

    #[test]
    #[should_panic(expected = "mismatched checkin")]
    fn mismatched_checkin_is_fatal() {
        let hm = HomeManager::new(2);
        hm.checkin_block(key(1, 0));
    }

    #[test]
    #[should_panic(expected = "live checkouts")]
    fn purge_with_live_refs_is_fatal() {
        let hm = HomeManager::new(2);
        hm.checkout_block(key(9, 0));
        hm.purge_segment(9);
    }

    #[test]
    fn purge_drops_cached_entries() {
        let hm = HomeManager::new(4);
        hm.checkout_block(key(9, 0));
        hm.checkin_block(key(9, 0));
        hm.purge_segment(9);
        assert_eq!(hm.entry_count(), 0);
    }
}
