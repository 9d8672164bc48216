//! Runtime lifecycle and the SPMD region.
//!
//! A [`Runtime`] hosts a fixed-size cluster of worker ranks in-process. Entry
//! is collective: [`Runtime::spmd`] runs a closure on every rank, each
//! holding its own [`SpmdCtx`]; from there `root_exec` hands control to the
//! scheduler. The runtime carries no global state; every operation flows
//! through an explicit context handle.

use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering::SeqCst};
use std::sync::{Arc, Mutex};

use crate::config::RuntimeOptions;
use crate::ctx::Ctx;
use crate::error::{Error, ErrorKind, Result};
use crate::mem::GlobalMemory;
use crate::sched::callstack::{CallStack, NULL_FRAME};
use crate::sched::context::{CellTable, StrandPool};
use crate::sched::dtree::{DistTree, NodeRef};
use crate::sched::mailbox::OneslotMailbox;
use crate::sched::remotable::{EvacArena, ThreadStateArena};
use crate::sched::scheduler::{
    self, CollTask, CrossWorkerTask, MigrationEntry, PrimaryEntry, TaskCtx,
};
use crate::sched::wsqueue::WsQueue;
use crate::transport::{Comm, NbBarrierHandle};
use crate::util::DetRng;

/// Exclusive right to execute rank `rank`'s code.
///
/// Exactly one token exists per rank; it moves with the flow of control, so a
/// task resumed by another worker simply wakes up holding that worker's
/// token. Not cloneable by construction.
#[doc(hidden)]
pub struct WorkerToken {
    cluster: Arc<Cluster>,
    rank: usize,
}

impl std::fmt::Debug for WorkerToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerToken").field("rank", &self.rank).finish()
    }
}

impl WorkerToken {
    /// The rank this token grants.
    #[must_use]
    pub fn rank(&self) -> usize {
        self.rank
    }

    pub(crate) fn cluster(&self) -> &Arc<Cluster> {
        &self.cluster
    }
}

/// Per-rank scheduler-local state.
#[derive(Debug)]
pub(crate) struct WorkerLocal {
    /// Frame of the task currently at the top of the call stack.
    pub(crate) cf_top: AtomicU64,
    /// Frame of this rank's parked scheduler context.
    pub(crate) sched_cf: AtomicU64,
    /// False while a task popped from the migration queues is executing.
    pub(crate) use_primary_wsq: AtomicBool,
    /// Deepest distribution-tree node this rank knows of.
    pub(crate) dtree_bottom: Mutex<NodeRef>,
    /// Deterministic RNG for steal-target and probe selection.
    pub(crate) rng: Mutex<DetRng>,
    /// Exit-barrier handle, armed once the loop-exit predicate holds.
    pub(crate) exit_barrier: Mutex<Option<NbBarrierHandle>>,
    /// Token-exclusivity flag.
    pub(crate) active: AtomicBool,
}

impl WorkerLocal {
    fn new(seed: u64, rank: usize) -> Self {
        Self {
            cf_top: AtomicU64::new(NULL_FRAME),
            sched_cf: AtomicU64::new(NULL_FRAME),
            use_primary_wsq: AtomicBool::new(true),
            dtree_bottom: Mutex::new(NodeRef::NULL),
            rng: Mutex::new(DetRng::new(
                seed ^ (rank as u64 + 1).wrapping_mul(0x9E37_79B9_7F4A_7C15),
            )),
            exit_barrier: Mutex::new(None),
            active: AtomicBool::new(false),
        }
    }
}

/// Shared spine of the in-process cluster.
#[doc(hidden)]
#[derive(Debug)]
pub struct Cluster {
    pub(crate) options: RuntimeOptions,
    pub(crate) n_ranks: usize,
    pub(crate) comm: Comm,
    pub(crate) cells: CellTable<WorkerToken>,
    pub(crate) pool: Arc<StrandPool>,
    pub(crate) primary_wsq: WsQueue<PrimaryEntry>,
    pub(crate) migration_wsq: WsQueue<MigrationEntry>,
    pub(crate) cross_mailbox: OneslotMailbox<CrossWorkerTask>,
    pub(crate) coll_mailbox: OneslotMailbox<CollTask>,
    pub(crate) thread_states: ThreadStateArena,
    pub(crate) evac: EvacArena,
    pub(crate) callstack: CallStack,
    pub(crate) dtree: DistTree,
    pub(crate) memory: GlobalMemory,
    pub(crate) workers: Vec<WorkerLocal>,
}

impl Cluster {
    fn new(n_ranks: usize, mut options: RuntimeOptions) -> Arc<Self> {
        options.normalize();
        let max_depth = options.adws_max_depth;
        Arc::new(Self {
            comm: Comm::new(n_ranks),
            cells: CellTable::new(),
            pool: Arc::new(StrandPool::new()),
            primary_wsq: WsQueue::new(n_ranks, max_depth, options.adws_wsqueue_capacity),
            migration_wsq: WsQueue::new(n_ranks, max_depth, options.adws_wsqueue_capacity),
            cross_mailbox: OneslotMailbox::new(n_ranks),
            coll_mailbox: OneslotMailbox::new(n_ranks),
            thread_states: ThreadStateArena::new(n_ranks, options.thread_state_capacity),
            evac: EvacArena::new(n_ranks, options.suspended_capacity),
            callstack: CallStack::new(n_ranks, options.stack_size),
            dtree: DistTree::new(n_ranks, max_depth),
            memory: GlobalMemory::new(
                n_ranks,
                options.block_size,
                options.home_mmap_entry_limit,
            ),
            workers: (0..n_ranks)
                .map(|r| WorkerLocal::new(options.seed, r))
                .collect(),
            n_ranks,
            options,
        })
    }

    pub(crate) fn acquire_token(self: &Arc<Self>, rank: usize) -> WorkerToken {
        let was_active = self.workers[rank].active.swap(true, SeqCst);
        assert!(!was_active, "rank {rank} is already active");
        WorkerToken {
            cluster: Arc::clone(self),
            rank,
        }
    }

    pub(crate) fn release_token(&self, token: WorkerToken) {
        self.workers[token.rank].active.store(false, SeqCst);
        drop(token);
    }
}

/// Handle to an in-process cluster of worker ranks.
#[derive(Debug)]
pub struct Runtime {
    cluster: Arc<Cluster>,
}

impl Runtime {
    /// Creates a runtime with `n_ranks` workers and default options.
    pub fn new(n_ranks: usize) -> Result<Self> {
        Self::with_options(n_ranks, RuntimeOptions::default())
    }

    /// Creates a runtime with explicit options.
    pub fn with_options(n_ranks: usize, options: RuntimeOptions) -> Result<Self> {
        if n_ranks == 0 {
            return Err(Error::new(ErrorKind::InvalidRankCount)
                .with_context("a cluster needs at least one rank"));
        }
        Ok(Self {
            cluster: Cluster::new(n_ranks, options),
        })
    }

    /// Number of worker ranks.
    #[must_use]
    pub fn n_ranks(&self) -> usize {
        self.cluster.n_ranks
    }

    /// Runs `f` on every rank concurrently and collects the per-rank results.
    ///
    /// This is the SPMD region: inside it, collective operations
    /// (`root_exec`, collective allocation, barriers) must be reached by
    /// every rank.
    pub fn spmd<F, R>(&self, f: F) -> Vec<R>
    where
        F: Fn(&SpmdCtx) -> R + Sync,
        R: Send,
    {
        let cluster = &self.cluster;
        std::thread::scope(|s| {
            let handles: Vec<_> = (0..cluster.n_ranks)
                .map(|rank| {
                    let f = &f;
                    s.spawn(move || {
                        let token = cluster.acquire_token(rank);
                        let ctx = SpmdCtx {
                            cluster: Arc::clone(cluster),
                            rank,
                            token: RefCell::new(Some(token)),
                        };
                        let out = f(&ctx);
                        let token = ctx
                            .token
                            .borrow_mut()
                            .take()
                            .expect("worker token lost in the SPMD region");
                        cluster.release_token(token);
                        out
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().unwrap_or_else(|p| std::panic::resume_unwind(p)))
                .collect()
        })
    }

    /// Total transport barrier arrivals so far (test observability).
    #[must_use]
    pub fn barrier_arrivals(&self) -> usize {
        self.cluster.comm.barrier_arrival_count()
    }

    /// Asserts that no scheduler resource outlived the last SPMD region:
    /// arenas, queues, mailboxes, frames, rendezvous cells, and checkout
    /// refcounts must all be empty.
    pub fn assert_quiescent(&self) {
        let c = &self.cluster;
        assert_eq!(c.cells.live(), 0, "rendezvous cells leaked");
        for rank in 0..c.n_ranks {
            assert_eq!(
                c.thread_states.live(rank),
                0,
                "thread states leaked on rank {rank}"
            );
            assert_eq!(c.evac.live(rank), 0, "evacuated payloads leaked on rank {rank}");
            assert_eq!(
                c.primary_wsq.queued(rank),
                0,
                "primary queue entries leaked on rank {rank}"
            );
            assert_eq!(
                c.migration_wsq.queued(rank),
                0,
                "migration queue entries leaked on rank {rank}"
            );
            assert!(
                c.cross_mailbox.pop(rank).is_none(),
                "cross-worker mailbox not drained on rank {rank}"
            );
            assert!(
                c.coll_mailbox.pop(rank).is_none(),
                "collective mailbox not drained on rank {rank}"
            );
            assert_eq!(
                c.callstack.frames_in_use(rank),
                0,
                "call-stack frames leaked on rank {rank}"
            );
            assert_eq!(
                c.memory.home(rank).live_refs(),
                0,
                "checkout references leaked on rank {rank}"
            );
        }
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.cluster.pool.shutdown();
    }
}

/// Capability context of one rank inside the SPMD region.
pub struct SpmdCtx {
    cluster: Arc<Cluster>,
    rank: usize,
    token: RefCell<Option<WorkerToken>>,
}

impl std::fmt::Debug for SpmdCtx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpmdCtx").field("rank", &self.rank).finish()
    }
}

impl SpmdCtx {
    /// Hands control to the scheduler: rank 0 runs `f` as the root task over
    /// the whole-cluster distribution range while every rank schedules.
    ///
    /// Collective: every rank must call it. Returns `Some` on rank 0.
    pub fn root_exec<T, F>(&self, f: F) -> Option<T>
    where
        T: Send + 'static,
        F: FnOnce(&TaskCtx) -> T + Send + 'static,
    {
        let token = self
            .token
            .borrow_mut()
            .take()
            .expect("rank is already executing");
        let (token, out) = scheduler::root_exec(token, f);
        *self.token.borrow_mut() = Some(token);
        out
    }

    /// [`SpmdCtx::root_exec`] with a callback run on every idle iteration of
    /// this rank's scheduler loop.
    pub fn root_exec_with<T, F>(&self, callback: &mut dyn FnMut(), f: F) -> Option<T>
    where
        T: Send + 'static,
        F: FnOnce(&TaskCtx) -> T + Send + 'static,
    {
        let token = self
            .token
            .borrow_mut()
            .take()
            .expect("rank is already executing");
        let (token, out) = scheduler::root_exec_with(token, f, callback);
        *self.token.borrow_mut() = Some(token);
        out
    }
}

impl Ctx for SpmdCtx {
    fn rank(&self) -> usize {
        self.rank
    }

    fn is_spmd(&self) -> bool {
        true
    }

    fn is_collective_site(&self) -> bool {
        true
    }

    fn cluster(&self) -> &Arc<Cluster> {
        &self.cluster
    }

    fn run_on_scheduler<F>(&self, f: F)
    where
        F: FnOnce(&TaskCtx) + Send + 'static,
    {
        let _ = self.root_exec(move |t| f(t));
    }
}
