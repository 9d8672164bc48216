//! Execution-context engine: pooled strands and rendezvous cells.
//!
//! The scheduler suspends and resumes tasks at well-defined points. Instead
//! of saving stack bytes, each suspension registers a one-shot *rendezvous
//! cell*; the suspended strand parks on the cell and whichever rank resumes
//! the continuation posts its [`WorkerToken`] there. The token is the
//! capability to run a rank's code: it cannot be cloned, so exactly one
//! strand executes per rank at any time, and a task that migrates simply
//! wakes up holding a different rank's token.
//!
//! Strands are plain OS threads recycled through a free list. A strand is
//! only consumed while a task is actually suspended beneath it, so the live
//! strand count is bounded by the fork depth, not the fork count.

use crossbeam_queue::SegQueue;
use std::sync::mpsc::{channel, Sender};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use crate::util::{SlotArena, SlotHandle};

/// Identifier of a rendezvous cell, valid on every rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CellId {
    index: u32,
    generation: u32,
}

impl CellId {
    /// A reserved id that refers to no cell.
    pub const NULL: Self = Self {
        index: u32::MAX,
        generation: 0,
    };

    /// Returns true if this is the null id.
    #[must_use]
    pub const fn is_null(&self) -> bool {
        self.index == u32::MAX
    }

    const fn handle(self) -> SlotHandle {
        SlotHandle::from_parts(self.index, self.generation)
    }
}

impl Default for CellId {
    fn default() -> Self {
        Self::NULL
    }
}

/// A one-shot rendezvous slot carrying a worker token.
#[derive(Debug, Default)]
pub struct ContextCell<T> {
    slot: Mutex<Option<T>>,
    cond: Condvar,
}

impl<T> ContextCell<T> {
    /// Deposits a value and wakes the waiter, if any.
    pub fn post(&self, value: T) {
        let mut slot = self.slot.lock().expect("context cell lock poisoned");
        debug_assert!(slot.is_none(), "context cell posted twice");
        *slot = Some(value);
        self.cond.notify_one();
    }

    /// Blocks until a value is deposited, then takes it.
    pub fn wait(&self) -> T {
        let mut slot = self.slot.lock().expect("context cell lock poisoned");
        loop {
            if let Some(value) = slot.take() {
                return value;
            }
            slot = self.cond.wait(slot).expect("context cell wait poisoned");
        }
    }
}

/// Process-wide registry of live rendezvous cells.
#[derive(Debug, Default)]
pub struct CellTable<T> {
    cells: Mutex<SlotArena<Arc<ContextCell<T>>>>,
}

impl<T> CellTable<T> {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self {
            cells: Mutex::new(SlotArena::new()),
        }
    }

    /// Registers a fresh cell.
    pub fn register(&self) -> (CellId, Arc<ContextCell<T>>) {
        let cell = Arc::new(ContextCell {
            slot: Mutex::new(None),
            cond: Condvar::new(),
        });
        let handle = self
            .cells
            .lock()
            .expect("cell table lock poisoned")
            .acquire(Arc::clone(&cell));
        (
            CellId {
                index: handle.index(),
                generation: handle.generation(),
            },
            cell,
        )
    }

    /// Looks up a live cell.
    #[must_use]
    pub fn get(&self, id: CellId) -> Arc<ContextCell<T>> {
        self.cells
            .lock()
            .expect("cell table lock poisoned")
            .resolve(id.handle())
            .cloned()
            .expect("resumed a context whose cell was already released")
    }

    /// Releases a cell after its rendezvous completed.
    pub fn free(&self, id: CellId) {
        let removed = self
            .cells
            .lock()
            .expect("cell table lock poisoned")
            .release(id.handle());
        debug_assert!(removed.is_some(), "double free of context cell");
    }

    /// Number of live cells (quiescence checks).
    #[must_use]
    pub fn live(&self) -> usize {
        self.cells.lock().expect("cell table lock poisoned").len()
    }
}

type StrandJob = Box<dyn FnOnce() + Send + 'static>;

enum StrandMsg {
    Run(StrandJob),
    Stop,
}

struct StrandHandle {
    tx: Sender<StrandMsg>,
}

/// A pool of reusable OS threads executing one job at a time.
pub struct StrandPool {
    free: SegQueue<StrandHandle>,
    joins: Mutex<Vec<JoinHandle<()>>>,
    name_prefix: &'static str,
}

impl std::fmt::Debug for StrandPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StrandPool")
            .field("spawned", &self.joins.lock().expect("pool lock poisoned").len())
            .finish()
    }
}

impl Default for StrandPool {
    fn default() -> Self {
        Self::new()
    }
}

impl StrandPool {
    /// Creates an empty pool; strands are spawned on demand.
    #[must_use]
    pub fn new() -> Self {
        Self {
            free: SegQueue::new(),
            joins: Mutex::new(Vec::new()),
            name_prefix: "weft-strand",
        }
    }

    /// Runs `job` on an idle strand, spawning one if none is free.
    pub fn dispatch(self: &Arc<Self>, job: StrandJob) {
        if let Some(handle) = self.free.pop() {
            handle
                .tx
                .send(StrandMsg::Run(job))
                .expect("strand receiver dropped");
            return;
        }

        let (tx, rx) = channel::<StrandMsg>();
        let pool = Arc::clone(self);
        let my_tx = tx.clone();
        let id = self.joins.lock().expect("pool lock poisoned").len();
        let join = std::thread::Builder::new()
            .name(format!("{}-{id}", self.name_prefix))
            .spawn(move || {
                while let Ok(msg) = rx.recv() {
                    match msg {
                        StrandMsg::Run(job) => {
                            job();
                            pool.free.push(StrandHandle { tx: my_tx.clone() });
                        }
                        StrandMsg::Stop => break,
                    }
                }
            })
            .expect("failed to spawn strand");
        self.joins.lock().expect("pool lock poisoned").push(join);
        tx.send(StrandMsg::Run(job)).expect("strand receiver dropped");
    }

    /// Stops all strands. Callable only when every strand is idle.
    pub fn shutdown(&self) {
        let joins = {
            let mut guard = self.joins.lock().expect("pool lock poisoned");
            std::mem::take(&mut *guard)
        };
        let mut stopped = 0;
        while stopped < joins.len() {
            if let Some(handle) = self.free.pop() {
                let _ = handle.tx.send(StrandMsg::Stop);
                stopped += 1;
            } else {
                std::thread::yield_now();
            }
        }
        for join in joins {
            let _ = join.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn cell_rendezvous_delivers_value() {
        let table: CellTable<u32> = CellTable::new();
        let (id, cell) = table.register();
        table.get(id).post(17);
        assert_eq!(cell.wait(), 17);
        table.free(id);
        assert_eq!(table.live(), 0);
    }

    #[test]
    fn cell_post_before_wait_buffers() {
        let cell: ContextCell<&str> = ContextCell::default();
        cell.post("hello");
        assert_eq!(cell.wait(), "hello");
    }

    #[test]
    fn cell_ids_are_generation_safe() {
        let table: CellTable<u8> = CellTable::new();
        let (id1, _c1) = table.register();
        table.free(id1);
        let (id2, _c2) = table.register();
        assert_ne!(id1, id2, "reused slot must carry a new generation");
        table.free(id2);
    }

    #[test]
    fn pool_reuses_strands() {
        let pool = Arc::new(StrandPool::new());
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..16 {
            let c = Arc::clone(&counter);
            let done: Arc<ContextCell<()>> = Arc::new(ContextCell::default());
            let d = Arc::clone(&done);
            pool.dispatch(Box::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
                d.post(());
            }));
            done.wait();
            // Wait for the strand to return itself to the free list so the
            // next dispatch reuses it instead of spawning.
            while pool.free.is_empty() {
                std::thread::yield_now();
            }
        }
        assert_eq!(counter.load(Ordering::SeqCst), 16);
        assert_eq!(pool.joins.lock().unwrap().len(), 1);
        pool.shutdown();
    }

    #[test]
    fn pool_shutdown_joins_all() {
        let pool = Arc::new(StrandPool::new());
        let done: Arc<ContextCell<()>> = Arc::new(ContextCell::default());
        let d = Arc::clone(&done);
        pool.dispatch(Box::new(move || d.post(())));
        done.wait();
        pool.shutdown();
    }
}
