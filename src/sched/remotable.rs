//! Remotable allocators.
//!
//! Two per-rank arenas whose allocations are addressable from every rank:
//!
//! - the **thread-state arena** holds join/race state for spawned tasks
//! - the **evacuation arena** holds continuations copied off the call-stack
//!   region, off-stacked task closures, and collective-task payloads
//!
//! Pointers carry the owning rank plus a generation-checked slot handle, so
//! [`EvacArena::is_remotely_freed`] is a stale-handle test: once any rank
//! deallocates a pointer, every copy of it stops resolving. The scheduler
//! uses this to join on the dummy tasks it broadcasts at the end of an
//! undistributed cross-worker task.

use std::any::Any;
use std::sync::atomic::AtomicU32;
use std::sync::{Arc, Mutex};

use crate::runtime::WorkerToken;
use crate::sched::callstack::{FrameAddr, FrameRecord};
use crate::sched::CollCtx;
use crate::util::{SlotArena, SlotHandle};

/// A continuation or task payload parked off-stack.
pub enum Evacuated {
    /// An evacuated frame record.
    Frame(FrameRecord),
    /// A migrated task closure, executed once on the receiving rank.
    Task(TaskFn),
    /// A collective task, executed once per rank.
    Coll(Arc<CollFn>),
}

impl std::fmt::Debug for Evacuated {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Frame(rec) => f.debug_tuple("Frame").field(rec).finish(),
            Self::Task(_) => f.write_str("Task(..)"),
            Self::Coll(_) => f.write_str("Coll(..)"),
        }
    }
}

/// A migrated task body. Returns the token when it falls through to its
/// suspension frame, `None` when it transferred control elsewhere.
pub type TaskFn = Box<dyn FnOnce(WorkerToken) -> Option<WorkerToken> + Send>;

/// A collective task body, runnable on every rank.
pub type CollFn = dyn Fn(&CollCtx) + Send + Sync;

/// Globally addressable pointer into the evacuation arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvacPtr {
    /// Owning rank.
    pub rank: u32,
    /// Generation-checked slot.
    pub slot: SlotHandle,
}

/// Globally addressable pointer into the thread-state arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadStatePtr {
    /// Owning rank.
    pub rank: u32,
    /// Generation-checked slot.
    pub slot: SlotHandle,
}

/// The saved identity of a suspended continuation.
#[derive(Debug, Clone, Copy)]
pub struct SuspendedState {
    /// Off-stack copy of the frame, when evacuated.
    pub evacuation_ptr: Option<EvacPtr>,
    /// Uni-address frame location.
    pub frame_base: FrameAddr,
    /// Frame extent in bytes.
    pub frame_size: u32,
}

/// Join/race state shared between a task and its joiner.
#[derive(Default)]
pub struct ThreadState {
    /// Incremented exactly twice: by the dying task and by the joiner. The
    /// second writer is responsible for resumption.
    pub resume_flag: AtomicU32,
    /// The task's boxed return payload.
    pub retval: Mutex<Option<Box<dyn Any + Send>>>,
    /// Where the joiner parked, for the task to resume if it dies second.
    pub suspended: Mutex<Option<SuspendedState>>,
}

impl std::fmt::Debug for ThreadState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadState")
            .field(
                "resume_flag",
                &self.resume_flag.load(std::sync::atomic::Ordering::Relaxed),
            )
            .finish()
    }
}

/// Per-rank arena of [`ThreadState`] blocks.
#[derive(Debug)]
pub struct ThreadStateArena {
    slabs: Vec<Mutex<SlotArena<Arc<ThreadState>>>>,
    capacity: usize,
}

impl ThreadStateArena {
    /// Creates the arena with `capacity` entries per rank.
    #[must_use]
    pub fn new(n_ranks: usize, capacity: usize) -> Self {
        Self {
            slabs: (0..n_ranks)
                .map(|_| Mutex::new(SlotArena::bounded(capacity)))
                .collect(),
            capacity,
        }
    }

    /// Allocates a fresh thread state on `rank`.
    pub fn insert(&self, rank: usize) -> ThreadStatePtr {
        let slot = self.slabs[rank]
            .lock()
            .expect("thread-state lock poisoned")
            .try_acquire(Arc::new(ThreadState::default()))
            .unwrap_or_else(|| {
                panic!(
                    "thread-state arena exhausted on rank {rank} ({} entries)",
                    self.capacity
                )
            });
        ThreadStatePtr {
            rank: rank as u32,
            slot,
        }
    }

    /// Resolves a pointer to its live state block.
    #[must_use]
    pub fn get(&self, ptr: ThreadStatePtr) -> Arc<ThreadState> {
        self.slabs[ptr.rank as usize]
            .lock()
            .expect("thread-state lock poisoned")
            .resolve(ptr.slot)
            .cloned()
            .expect("thread state used after free")
    }

    /// Frees a thread state; the last race visitor calls this.
    pub fn remove(&self, ptr: ThreadStatePtr) {
        let removed = self.slabs[ptr.rank as usize]
            .lock()
            .expect("thread-state lock poisoned")
            .release(ptr.slot);
        debug_assert!(removed.is_some(), "double free of thread state");
    }

    /// Live entries on `rank` (quiescence checks).
    #[must_use]
    pub fn live(&self, rank: usize) -> usize {
        self.slabs[rank]
            .lock()
            .expect("thread-state lock poisoned")
            .len()
    }
}

/// Per-rank arena of [`Evacuated`] payloads.
#[derive(Debug)]
pub struct EvacArena {
    slabs: Vec<Mutex<SlotArena<Evacuated>>>,
    capacity: usize,
}

impl EvacArena {
    /// Creates the arena with `capacity` entries per rank.
    #[must_use]
    pub fn new(n_ranks: usize, capacity: usize) -> Self {
        Self {
            slabs: (0..n_ranks)
                .map(|_| Mutex::new(SlotArena::bounded(capacity)))
                .collect(),
            capacity,
        }
    }

    /// Parks a payload on `rank`.
    pub fn insert(&self, rank: usize, payload: Evacuated) -> EvacPtr {
        let slot = self.slabs[rank]
            .lock()
            .expect("evacuation lock poisoned")
            .try_acquire(payload)
            .unwrap_or_else(|| {
                panic!(
                    "evacuation arena exhausted on rank {rank} ({} entries)",
                    self.capacity
                )
            });
        EvacPtr {
            rank: rank as u32,
            slot,
        }
    }

    /// Takes an evacuated frame record, freeing its slot.
    #[must_use]
    pub fn take_frame(&self, ptr: EvacPtr) -> FrameRecord {
        match self.take(ptr) {
            Evacuated::Frame(rec) => rec,
            other => panic!("expected evacuated frame, found {other:?}"),
        }
    }

    /// Takes a migrated task closure, freeing its slot.
    #[must_use]
    pub fn take_task(&self, ptr: EvacPtr) -> TaskFn {
        match self.take(ptr) {
            Evacuated::Task(task) => task,
            other => panic!("expected migrated task, found {other:?}"),
        }
    }

    /// Reads a collective payload without freeing it; the broadcast tree
    /// copies it into a local slot on every hop.
    #[must_use]
    pub fn get_coll(&self, ptr: EvacPtr) -> Arc<CollFn> {
        let slab = self.slabs[ptr.rank as usize]
            .lock()
            .expect("evacuation lock poisoned");
        match slab.resolve(ptr.slot) {
            Some(Evacuated::Coll(f)) => Arc::clone(f),
            other => panic!("expected collective task, found {other:?}"),
        }
    }

    /// Frees a slot without inspecting it.
    pub fn deallocate(&self, ptr: EvacPtr) {
        let removed = self.slabs[ptr.rank as usize]
            .lock()
            .expect("evacuation lock poisoned")
            .release(ptr.slot);
        debug_assert!(removed.is_some(), "double free of evacuated payload");
    }

    /// True once any rank has freed `ptr`.
    #[must_use]
    pub fn is_remotely_freed(&self, ptr: EvacPtr) -> bool {
        self.slabs[ptr.rank as usize]
            .lock()
            .expect("evacuation lock poisoned")
            .is_stale(ptr.slot)
    }

    /// Live entries on `rank` (quiescence checks).
    #[must_use]
    pub fn live(&self, rank: usize) -> usize {
        self.slabs[rank]
            .lock()
            .expect("evacuation lock poisoned")
            .len()
    }

    fn take(&self, ptr: EvacPtr) -> Evacuated {
        self.slabs[ptr.rank as usize]
            .lock()
            .expect("evacuation lock poisoned")
            .release(ptr.slot)
            .expect("evacuated payload used after free")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::callstack::NULL_FRAME;
    use crate::sched::context::CellId;
    use std::sync::atomic::Ordering;

    #[test]
    fn thread_state_race_counter() {
        let arena = ThreadStateArena::new(2, 16);
        let ptr = arena.insert(1);
        let ts = arena.get(ptr);
        assert_eq!(ts.resume_flag.fetch_add(1, Ordering::SeqCst), 0);
        assert_eq!(ts.resume_flag.fetch_add(1, Ordering::SeqCst), 1);
        arena.remove(ptr);
        assert_eq!(arena.live(1), 0);
    }

    #[test]
    fn evac_frame_roundtrip() {
        let arena = EvacArena::new(1, 8);
        let rec = FrameRecord {
            cell: CellId::NULL,
            parent: NULL_FRAME,
        };
        let ptr = arena.insert(0, Evacuated::Frame(rec));
        assert!(!arena.is_remotely_freed(ptr));
        assert_eq!(arena.take_frame(ptr), rec);
        assert!(arena.is_remotely_freed(ptr));
    }

    #[test]
    fn remote_free_is_visible_through_stale_pointers() {
        let arena = EvacArena::new(1, 8);
        let ptr = arena.insert(
            0,
            Evacuated::Frame(FrameRecord {
                cell: CellId::NULL,
                parent: NULL_FRAME,
            }),
        );
        let stale = ptr;
        arena.deallocate(ptr);
        assert!(arena.is_remotely_freed(stale));

        // A slot reuse must not resurrect the stale pointer.
        let fresh = arena.insert(
            0,
            Evacuated::Frame(FrameRecord {
                cell: CellId::NULL,
                parent: NULL_FRAME,
            }),
        );
        assert!(arena.is_remotely_freed(stale));
        assert!(!arena.is_remotely_freed(fresh));
        arena.deallocate(fresh);
    }

    #[test]
    #[should_panic(expected = "evacuation arena exhausted")]
    fn evac_capacity_is_fatal() {
        let arena = EvacArena::new(1, 1);
        let _a = arena.insert(
            0,
            Evacuated::Frame(FrameRecord {
                cell: CellId::NULL,
                parent: NULL_FRAME,
            }),
        );
        let _b = arena.insert(
            0,
            Evacuated::Frame(FrameRecord {
                cell: CellId::NULL,
                parent: NULL_FRAME,
            }),
        );
    }
}
