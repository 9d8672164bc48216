//! Per-worker, per-depth work-stealing deques.
//!
//! Two instances exist: the *primary* queue holds continuations of forked
//! tasks, the *migration* queue also accepts new tasks passed in from other
//! ranks. Owners push and pop LIFO; thieves lock a depth and steal FIFO,
//! aborting when an entry fails the task-group version predicate. A per-rank
//! bitmap of non-empty depths lets thieves skip empty rows without touching
//! locks.
//!
//! Depths range over `[-1, max_depth)`: depth −1 holds work forked outside
//! any cross-worker task group (it is never a steal target, because steal
//! scans start at a distribution-tree node depth, which is at least 0).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use crate::transport::Rank;

/// A depth index in `[-1, max_depth)`.
pub type Depth = i32;

/// Dual-ended queue set for the whole cluster.
#[derive(Debug)]
pub struct WsQueue<E: Copy> {
    rows: Vec<Vec<Mutex<VecDeque<E>>>>,
    nonempty: Vec<AtomicU64>,
    capacity: usize,
    levels: usize,
}

const fn level(depth: Depth) -> usize {
    (depth + 1) as usize
}

impl<E: Copy> WsQueue<E> {
    /// Creates queues for `n_ranks` ranks with `max_depth` stealable depths.
    ///
    /// # Panics
    ///
    /// Panics if `max_depth + 1 > 64` (the non-emptiness bitmap is one word).
    #[must_use]
    pub fn new(n_ranks: usize, max_depth: usize, capacity: usize) -> Self {
        let levels = max_depth + 1;
        assert!(levels <= 64, "queue depth limit exceeds bitmap width");
        Self {
            rows: (0..n_ranks)
                .map(|_| (0..levels).map(|_| Mutex::new(VecDeque::new())).collect())
                .collect(),
            nonempty: (0..n_ranks).map(|_| AtomicU64::new(0)).collect(),
            capacity,
            levels,
        }
    }

    /// Number of depth rows (including depth −1).
    #[must_use]
    pub const fn n_levels(&self) -> usize {
        self.levels
    }

    /// Largest valid depth, exclusive.
    #[must_use]
    pub const fn max_depth(&self) -> Depth {
        self.levels as Depth - 1
    }

    /// Owner-side LIFO push.
    ///
    /// # Panics
    ///
    /// Panics when the per-depth capacity is exceeded (fatal configuration
    /// error).
    pub fn push(&self, rank: Rank, depth: Depth, entry: E) {
        let lv = level(depth);
        let mut q = self.rows[rank][lv].lock().expect("wsqueue lock poisoned");
        assert!(
            q.len() < self.capacity,
            "work-stealing queue overflow on rank {rank} at depth {depth} ({} entries)",
            self.capacity
        );
        q.push_back(entry);
        self.nonempty[rank].fetch_or(1 << lv, Ordering::Release);
    }

    /// Remote append used when an owner hands a new task to the rank that
    /// owns its range.
    pub fn pass(&self, entry: E, target: Rank, depth: Depth) {
        self.push(target, depth, entry);
    }

    /// Owner-side LIFO pop.
    pub fn pop(&self, rank: Rank, depth: Depth) -> Option<E> {
        let lv = level(depth);
        let mut q = self.rows[rank][lv].lock().expect("wsqueue lock poisoned");
        let entry = q.pop_back();
        if q.is_empty() {
            self.nonempty[rank].fetch_and(!(1 << lv), Ordering::Release);
        }
        entry
    }

    /// Tries to take the thief lock for `(rank, depth)`.
    pub fn try_steal_lock(&self, rank: Rank, depth: Depth) -> Option<StealGuard<'_, E>> {
        let lv = level(depth);
        let queue = self.rows[rank][lv].try_lock().ok()?;
        Some(StealGuard {
            queue,
            nonempty: &self.nonempty[rank],
            lv,
        })
    }

    /// Invokes `f` for each non-empty depth of `rank` in `[min_depth,
    /// max_depth)`, ascending or descending. Stops early when `f` returns
    /// true.
    pub fn for_each_nonempty<F>(
        &self,
        rank: Rank,
        min_depth: Depth,
        max_depth: Depth,
        ascending: bool,
        mut f: F,
    ) where
        F: FnMut(Depth) -> bool,
    {
        let bits = self.nonempty[rank].load(Ordering::Acquire);
        let lo = level(min_depth);
        let hi = level(max_depth);
        let scan = |lv: usize, f: &mut F| -> bool { bits & (1 << lv) != 0 && f(lv as Depth - 1) };
        if ascending {
            for lv in lo..hi {
                if scan(lv, &mut f) {
                    return;
                }
            }
        } else {
            for lv in (lo..hi).rev() {
                if scan(lv, &mut f) {
                    return;
                }
            }
        }
    }

    /// Owner-side in-place patching of every entry at `depth` (continuation
    /// evacuation rewrites on-stack references).
    pub fn for_each_entry_mut<F>(&self, rank: Rank, depth: Depth, mut f: F)
    where
        F: FnMut(&mut E),
    {
        let lv = level(depth);
        let mut q = self.rows[rank][lv].lock().expect("wsqueue lock poisoned");
        for entry in q.iter_mut() {
            f(entry);
        }
    }

    /// Total queued entries on `rank` (quiescence checks).
    #[must_use]
    pub fn queued(&self, rank: Rank) -> usize {
        (0..self.levels)
            .map(|lv| {
                self.rows[rank][lv]
                    .lock()
                    .expect("wsqueue lock poisoned")
                    .len()
            })
            .sum()
    }
}

/// Thief-side lock over one `(rank, depth)` queue.
#[derive(Debug)]
pub struct StealGuard<'a, E: Copy> {
    queue: MutexGuard<'a, VecDeque<E>>,
    nonempty: &'a AtomicU64,
    lv: usize,
}

impl<E: Copy> StealGuard<'_, E> {
    /// FIFO steal of the oldest entry.
    pub fn steal(&mut self) -> Option<E> {
        let entry = self.queue.pop_front();
        if self.queue.is_empty() {
            self.nonempty.fetch_and(!(1 << self.lv), Ordering::Release);
        }
        entry
    }

    /// Returns an entry that failed the steal predicate.
    pub fn abort(&mut self, entry: E) {
        self.queue.push_front(entry);
        self.nonempty.fetch_or(1 << self.lv, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn owner_pop_is_lifo() {
        let q: WsQueue<u32> = WsQueue::new(1, 4, 16);
        q.push(0, 0, 1);
        q.push(0, 0, 2);
        q.push(0, 0, 3);
        assert_eq!(q.pop(0, 0), Some(3));
        assert_eq!(q.pop(0, 0), Some(2));
        assert_eq!(q.pop(0, 0), Some(1));
        assert_eq!(q.pop(0, 0), None);
    }

    #[test]
    fn thief_steal_is_fifo() {
        let q: WsQueue<u32> = WsQueue::new(1, 4, 16);
        q.push(0, 2, 1);
        q.push(0, 2, 2);
        let mut guard = q.try_steal_lock(0, 2).expect("lock free");
        assert_eq!(guard.steal(), Some(1));
        assert_eq!(guard.steal(), Some(2));
        assert_eq!(guard.steal(), None);
    }

    #[test]
    fn abort_returns_entry_to_the_front() {
        let q: WsQueue<u32> = WsQueue::new(1, 4, 16);
        q.push(0, 1, 10);
        q.push(0, 1, 11);
        {
            let mut guard = q.try_steal_lock(0, 1).expect("lock free");
            let e = guard.steal().unwrap();
            assert_eq!(e, 10);
            guard.abort(e);
        }
        let mut guard = q.try_steal_lock(0, 1).expect("lock free");
        assert_eq!(guard.steal(), Some(10), "aborted entry keeps its position");
    }

    #[test]
    fn depth_minus_one_is_supported() {
        let q: WsQueue<u32> = WsQueue::new(1, 4, 16);
        q.push(0, -1, 5);
        let mut seen = Vec::new();
        q.for_each_nonempty(0, -1, q.max_depth(), true, |d| {
            seen.push(d);
            false
        });
        assert_eq!(seen, vec![-1]);
        assert_eq!(q.pop(0, -1), Some(5));
    }

    #[test]
    fn nonempty_bitmap_tracks_rows() {
        let q: WsQueue<u32> = WsQueue::new(2, 6, 16);
        q.push(1, 0, 1);
        q.push(1, 3, 2);
        q.pass(3, 1, 5);

        let mut seen = Vec::new();
        q.for_each_nonempty(1, 0, q.max_depth(), true, |d| {
            seen.push(d);
            false
        });
        assert_eq!(seen, vec![0, 3, 5]);

        let mut seen_desc = Vec::new();
        q.for_each_nonempty(1, 0, q.max_depth(), false, |d| {
            seen_desc.push(d);
            false
        });
        assert_eq!(seen_desc, vec![5, 3, 0]);

        // Scan floor excludes shallower rows.
        let mut seen_floor = Vec::new();
        q.for_each_nonempty(1, 2, q.max_depth(), true, |d| {
            seen_floor.push(d);
            false
        });
        assert_eq!(seen_floor, vec![3, 5]);

        assert_eq!(q.pop(1, 3), Some(2));
        let mut after = Vec::new();
        q.for_each_nonempty(1, 0, q.max_depth(), true, |d| {
            after.push(d);
            false
        });
        assert_eq!(after, vec![0, 5]);
    }

    #[test]
    fn patching_rewrites_entries_in_place() {
        let q: WsQueue<u32> = WsQueue::new(1, 4, 16);
        q.push(0, 0, 1);
        q.push(0, 0, 2);
        q.for_each_entry_mut(0, 0, |e| *e += 100);
        assert_eq!(q.pop(0, 0), Some(102));
        assert_eq!(q.pop(0, 0), Some(101));
    }

    #[test]
    #[should_panic(expected = "work-stealing queue overflow")]
    fn overflow_is_fatal() {
        let q: WsQueue<u32> = WsQueue::new(1, 2, 2);
        q.push(0, 0, 1);
        q.push(0, 0, 2);
        q.push(0, 0, 3);
    }

    #[test]
    fn queued_counts_all_levels() {
        let q: WsQueue<u32> = WsQueue::new(1, 4, 16);
        q.push(0, -1, 1);
        q.push(0, 2, 2);
        assert_eq!(q.queued(0), 2);
        q.pop(0, 2);
        assert_eq!(q.queued(0), 1);
    }
}
