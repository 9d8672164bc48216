//! The ADWS scheduler.
//!
//! Combines the distribution-range algebra, the distribution tree, the dual
//! work-stealing queues, the cross-worker mailboxes, and the continuation
//! evacuation protocol into the fork/join surface tasks program against.
//!
//! Scheduling follows the work-first policy: `fork` pushes the parent's
//! continuation and runs the child inline; if nobody stole the continuation
//! by the time the child dies, the pair is serialized with no context switch.
//! Cross-worker children are off-stacked into the remotable arena and handed
//! to the rank that owns their distribution range, through the one-slot
//! mailbox when the range spans several workers and through the migration
//! queue otherwise.

use std::cell::RefCell;
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering::SeqCst};
use std::sync::{Arc, Mutex};

use crate::ctx::Ctx;
use crate::mem::{ByteRepr, GlobalPtr};
use crate::runtime::{Cluster, WorkerToken};
use crate::sched::callstack::{FrameAddr, FrameRecord, FRAME_BYTES, NULL_FRAME};
use crate::sched::dag_prof::DagProfiler;
use crate::sched::drange::{DistRange, Flipper};
use crate::sched::dtree::NodeRef;
use crate::sched::remotable::{
    CollFn, EvacPtr, Evacuated, SuspendedState, TaskFn, ThreadState, ThreadStatePtr,
};
use crate::sched::wsqueue::Depth;
use crate::tracing_compat::{debug, trace};
use crate::util::next_pow2;

/// A continuation reference held by a queue entry.
#[derive(Debug, Clone, Copy)]
pub(crate) enum ContSlot {
    /// The continuation still lives on the owner's call-stack region.
    OnStack {
        /// Uni-address frame location.
        frame_base: FrameAddr,
        /// Frame extent in bytes.
        frame_size: u32,
    },
    /// The continuation was copied into the remotable arena.
    Evacuated {
        /// Off-stack copy.
        ptr: EvacPtr,
        /// Original frame location.
        frame_base: FrameAddr,
        /// Frame extent in bytes.
        frame_size: u32,
    },
}

/// Primary-queue entry: a forked task's continuation.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PrimaryEntry {
    pub cont: ContSlot,
    pub tg_version: Flipper,
}

/// Migration-queue payload.
#[derive(Debug, Clone, Copy)]
pub(crate) enum MigrationPayload {
    /// A new task closure passed in by an owner.
    NewTask(EvacPtr),
    /// A continuation.
    Cont(ContSlot),
}

/// Migration-queue entry.
#[derive(Debug, Clone, Copy)]
pub(crate) struct MigrationEntry {
    pub payload: MigrationPayload,
    pub tg_version: Flipper,
}

/// Cross-worker mailbox entry.
#[derive(Debug, Clone, Copy)]
pub(crate) enum CrossWorkerTask {
    /// A new cross-worker task closure.
    NewTask(EvacPtr),
    /// A migrated continuation.
    Continuation(SuspendedState),
}

/// Collective-task mailbox entry.
#[derive(Debug, Clone, Copy)]
pub(crate) struct CollTask {
    pub task: EvacPtr,
    pub begin_rank: usize,
}

/// Thread-local state of the currently running task.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Tls {
    pub drange: DistRange,
    pub dtree_node_ref: NodeRef,
    pub tg_version: Flipper,
    pub undistributed: bool,
    pub is_root: bool,
    pub dag_prof: DagProfiler,
}

/// Record saved by [`TaskCtx::task_group_begin`] and consumed by
/// [`TaskCtx::task_group_end`].
#[derive(Debug)]
pub struct TaskGroupData {
    drange: DistRange,
    owns_dtree_node: bool,
    node_ref: NodeRef,
    node_parent: NodeRef,
    node_version: i64,
    dag_prof: DagProfiler,
}

/// Options for [`TaskCtx::fork_opts`].
#[derive(Clone)]
pub struct ForkOpts {
    /// Relative work share of the new task. Zero with a positive `w_rest`
    /// degenerates to an inline call.
    pub w_new: f64,
    /// Relative work share of the continuation.
    pub w_rest: f64,
    /// Invoked on the child's rank when it starts away from the forking rank,
    /// and on the parent when its continuation resumes on a different rank.
    pub on_drift_fork: Option<Arc<dyn Fn() + Send + Sync>>,
    /// Invoked when a task dies away from its serialization fast path.
    pub on_drift_die: Option<Arc<dyn Fn() + Send + Sync>>,
}

impl std::fmt::Debug for ForkOpts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForkOpts")
            .field("w_new", &self.w_new)
            .field("w_rest", &self.w_rest)
            .finish()
    }
}

impl Default for ForkOpts {
    fn default() -> Self {
        Self::even()
    }
}

impl ForkOpts {
    /// Even split with no drift callbacks.
    #[must_use]
    pub fn even() -> Self {
        Self::weighted(1.0, 1.0)
    }

    /// Explicit work shares.
    #[must_use]
    pub fn weighted(w_new: f64, w_rest: f64) -> Self {
        Self {
            w_new,
            w_rest,
            on_drift_fork: None,
            on_drift_die: None,
        }
    }
}

type Panic = Box<dyn std::any::Any + Send + 'static>;
type TaskResult<T> = Result<(T, DagProfiler), Panic>;

pub(crate) struct SerializedCell<T> {
    serialized: AtomicBool,
    retval: Mutex<Option<TaskResult<T>>>,
}

impl<T> Default for SerializedCell<T> {
    fn default() -> Self {
        Self {
            serialized: AtomicBool::new(false),
            retval: Mutex::new(None),
        }
    }
}

/// Handle to a forked task, consumed by [`TaskCtx::join`].
#[must_use = "every forked task must be joined"]
pub struct ThreadHandle<T> {
    state: Option<ThreadStatePtr>,
    shared: Arc<SerializedCell<T>>,
}

impl<T> ThreadHandle<T> {
    /// True once the child ran inline and its result is already here.
    #[must_use]
    pub fn is_serialized(&self) -> bool {
        self.shared.serialized.load(SeqCst)
    }
}

impl<T> std::fmt::Debug for ThreadHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadHandle")
            .field("serialized", &self.is_serialized())
            .finish()
    }
}

/// Capability context of a running task.
///
/// A task receives `&TaskCtx` from the runtime and threads it through its
/// computation; the context tracks the task's distribution range and carries
/// the worker token across suspensions, so after a `fork` or `join` the same
/// context may be executing on a different rank.
pub struct TaskCtx {
    pub(crate) cluster: Arc<Cluster>,
    token: RefCell<Option<WorkerToken>>,
    pub(crate) tls: RefCell<Tls>,
}

impl std::fmt::Debug for TaskCtx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskCtx").finish()
    }
}

/// Capability context inside a collective task: every rank runs the body
/// between two barriers.
pub struct CollCtx {
    pub(crate) cluster: Arc<Cluster>,
    rank: usize,
}

impl std::fmt::Debug for CollCtx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollCtx").field("rank", &self.rank).finish()
    }
}

impl CollCtx {
    pub(crate) fn new(cluster: Arc<Cluster>, rank: usize) -> Self {
        Self { cluster, rank }
    }
}

// ---------------------------------------------------------------------------
// Suspension primitives
// ---------------------------------------------------------------------------

/// Saves the current point as a frame, runs `f` inline, and parks until the
/// frame is resumed unless `f` kept the token (fall-through).
pub(crate) fn suspend_inline<F>(token: WorkerToken, f: F) -> WorkerToken
where
    F: FnOnce(WorkerToken, FrameAddr) -> Option<WorkerToken>,
{
    let cluster = Arc::clone(token.cluster());
    let rank = token.rank();
    let (cell_id, cell) = cluster.cells.register();
    let cf = cluster.callstack.allocate(rank);
    let prev_top = cluster.workers[rank].cf_top.swap(cf, SeqCst);
    cluster.callstack.store(
        rank,
        cf,
        FrameRecord {
            cell: cell_id,
            parent: prev_top,
        },
    );

    let token = match f(token, cf) {
        Some(token) => token,
        None => cell.wait(),
    };

    cluster.cells.free(cell_id);
    cluster.callstack.deallocate(rank, cf);
    cluster.workers[token.rank()].cf_top.store(prev_top, SeqCst);
    token
}

/// Saves the current point as a frame and runs `job` on a fresh strand; the
/// calling thread parks on the frame. A job that still holds the token when
/// it returns falls through into the suspended frame (the serialization fast
/// path).
pub(crate) fn suspend_spawn<J>(token: WorkerToken, bind_sched: bool, job: J) -> WorkerToken
where
    J: FnOnce(WorkerToken, FrameAddr) -> Option<WorkerToken> + Send + 'static,
{
    let cluster = Arc::clone(token.cluster());
    let rank = token.rank();
    let (cell_id, cell) = cluster.cells.register();
    let cf = cluster.callstack.allocate(rank);
    let prev_top = cluster.workers[rank].cf_top.swap(cf, SeqCst);
    cluster.callstack.store(
        rank,
        cf,
        FrameRecord {
            cell: cell_id,
            parent: prev_top,
        },
    );
    if bind_sched {
        cluster.workers[rank].sched_cf.store(cf, SeqCst);
    }

    let fall_through = Arc::clone(&cell);
    cluster.pool.dispatch(Box::new(move || {
        if let Some(token) = job(token, cf) {
            fall_through.post(token);
        }
    }));

    let token = cell.wait();
    cluster.cells.free(cell_id);
    cluster.callstack.deallocate(rank, cf);
    cluster.workers[token.rank()].cf_top.store(prev_top, SeqCst);
    token
}

pub(crate) fn resume_frame(cluster: &Cluster, record: FrameRecord, token: WorkerToken) {
    cluster.cells.get(record.cell).post(token);
}

pub(crate) fn resume_suspended(cluster: &Cluster, ss: SuspendedState, token: WorkerToken) {
    let ptr = ss
        .evacuation_ptr
        .expect("on-stack continuation resumed without evacuation");
    trace!("resume evacuated context frame");
    let record = cluster.evac.take_frame(ptr);
    resume_frame(cluster, record, token);
}

pub(crate) fn resume_sched(token: WorkerToken) {
    let cluster = Arc::clone(token.cluster());
    let rank = token.rank();
    let cf = cluster.workers[rank].sched_cf.load(SeqCst);
    debug_assert_ne!(cf, NULL_FRAME, "scheduler context not bound");
    trace!("resume scheduler context");
    let record = cluster.callstack.load(rank, cf);
    cluster.cells.get(record.cell).post(token);
}

/// Copies a live frame into the remotable arena so the region slot's bytes
/// can be superseded.
pub(crate) fn evacuate(cluster: &Cluster, rank: usize, cf: FrameAddr) -> SuspendedState {
    let record = cluster.callstack.load(rank, cf);
    let ptr = cluster.evac.insert(rank, Evacuated::Frame(record));
    trace!("evacuate suspended thread context");
    SuspendedState {
        evacuation_ptr: Some(ptr),
        frame_base: cf,
        frame_size: FRAME_BYTES as u32,
    }
}

/// Evacuates every on-stack continuation still referenced by the local
/// queues at depths not deeper than `depth`, patching the entries in place.
pub(crate) fn evacuate_all(cluster: &Cluster, rank: usize, depth: Depth) {
    if cluster.workers[rank].use_primary_wsq.load(SeqCst) {
        let mut d = depth;
        while d >= -1 {
            cluster.primary_wsq.for_each_entry_mut(rank, d, |e| {
                if let ContSlot::OnStack {
                    frame_base,
                    frame_size,
                } = e.cont
                {
                    let ss = evacuate(cluster, rank, frame_base);
                    e.cont = ContSlot::Evacuated {
                        ptr: ss.evacuation_ptr.expect("fresh evacuation"),
                        frame_base,
                        frame_size,
                    };
                }
            });
            d -= 1;
        }
    } else {
        cluster.migration_wsq.for_each_entry_mut(rank, depth, |e| {
            if let MigrationPayload::Cont(ContSlot::OnStack {
                frame_base,
                frame_size,
            }) = e.payload
            {
                let ss = evacuate(cluster, rank, frame_base);
                e.payload = MigrationPayload::Cont(ContSlot::Evacuated {
                    ptr: ss.evacuation_ptr.expect("fresh evacuation"),
                    frame_base,
                    frame_size,
                });
            }
        });
    }
}

pub(crate) fn mailbox_put_cross(cluster: &Cluster, entry: CrossWorkerTask, target: usize) {
    while cluster.cross_mailbox.put(entry, target).is_err() {
        std::thread::yield_now();
    }
}

fn mailbox_put_coll(cluster: &Cluster, entry: CollTask, target: usize) {
    while cluster.coll_mailbox.put(entry, target).is_err() {
        std::thread::yield_now();
    }
}

fn take_retval<T: Send + 'static>(state: &ThreadState) -> TaskResult<T> {
    let boxed = state
        .retval
        .lock()
        .expect("thread state lock poisoned")
        .take()
        .expect("joined thread published no return value");
    *boxed
        .downcast::<TaskResult<T>>()
        .expect("return type mismatch at join")
}

// ---------------------------------------------------------------------------
// Death paths
// ---------------------------------------------------------------------------

/// Runs when any task body finishes (and at every join, which is also the end
/// of the last task of a task group).
pub(crate) fn on_task_die(ctx: &TaskCtx) {
    let cluster = Arc::clone(&ctx.cluster);
    let rank = ctx.current_rank();
    let mut tls = ctx.tls.borrow_mut();

    if tls.drange.is_cross_worker() {
        if !tls.dtree_node_ref.is_null() {
            debug!("distribution tree node becomes dominant");
            cluster.dtree.set_dominant(rank, tls.dtree_node_ref, true);

            if tls.undistributed && tls.drange.begin_rank() + 1 < tls.drange.end_rank() {
                // This task finished without distributing child cross-worker
                // tasks to every rank in its range; hand the dist-tree chain
                // to the intermediate ranks so they can steal.
                let nref = tls.dtree_node_ref;
                let mut outstanding = Vec::new();
                for target in (tls.drange.begin_rank() + 1)..tls.drange.end_rank() {
                    let dummy: TaskFn = Box::new(move |token: WorkerToken| {
                        let cluster = Arc::clone(token.cluster());
                        let rank = token.rank();
                        cluster.dtree.copy_parents(rank, nref);
                        *cluster.workers[rank]
                            .dtree_bottom
                            .lock()
                            .expect("dtree bottom lock poisoned") = nref;
                        resume_sched(token);
                        None
                    });
                    let ptr = cluster.evac.insert(rank, Evacuated::Task(dummy));
                    outstanding.push((ptr, target as usize));
                }
                for (ptr, target) in &outstanding {
                    mailbox_put_cross(&cluster, CrossWorkerTask::NewTask(*ptr), *target);
                }
                for (ptr, _) in &outstanding {
                    while !cluster.evac.is_remotely_freed(*ptr) {
                        std::thread::yield_now();
                    }
                }
            }
        }

        // A task group with several children triggers several joins; collapse
        // the range so this scope runs once. The group's own range is
        // restored at task_group_end.
        tls.drange.make_non_cross_worker();
    }
}

/// Work-first death: pop-and-check serialization, falling back to the drift
/// path when the popped entry is not provably our own continuation.
fn on_die_workfirst<T: Send + 'static>(
    token: WorkerToken,
    tls: Tls,
    ts: ThreadStatePtr,
    retval: TaskResult<T>,
    shared: &SerializedCell<T>,
    on_drift_die: Option<&(dyn Fn() + Send + Sync)>,
) -> Option<WorkerToken> {
    let cluster = Arc::clone(token.cluster());
    let rank = token.rank();
    let depth = tls.dtree_node_ref.depth;

    if cluster.workers[rank].use_primary_wsq.load(SeqCst) {
        if let Some(qe) = cluster.primary_wsq.pop(rank, depth) {
            if let ContSlot::OnStack { frame_base, .. } = qe.cont {
                if frame_base == cluster.workers[rank].cf_top.load(SeqCst) {
                    trace!("thread serialized (fast path)");
                    *shared.retval.lock().expect("retval lock poisoned") = Some(retval);
                    shared.serialized.store(true, SeqCst);
                    cluster.thread_states.remove(ts);
                    return Some(token);
                }
            }
            // The popped task can be our evacuated parent, but the uni-address
            // scheme makes the check one-sided; return it to the queue.
            cluster.primary_wsq.push(rank, depth, qe);
        }
    } else if let Some(qe) = cluster.migration_wsq.pop(rank, depth) {
        if let MigrationPayload::Cont(ContSlot::OnStack { frame_base, .. }) = qe.payload {
            if frame_base == cluster.workers[rank].cf_top.load(SeqCst) {
                trace!("thread serialized (fast path)");
                *shared.retval.lock().expect("retval lock poisoned") = Some(retval);
                shared.serialized.store(true, SeqCst);
                cluster.thread_states.remove(ts);
                return Some(token);
            }
        }
        cluster.migration_wsq.push(rank, depth, qe);
    }

    on_die_drifted(token, tls, ts, retval, on_drift_die)
}

/// Death away from the fast path: publish the return value and race the
/// joiner on the resume flag.
fn on_die_drifted<T: Send + 'static>(
    token: WorkerToken,
    tls: Tls,
    ts: ThreadStatePtr,
    retval: TaskResult<T>,
    on_drift_die: Option<&(dyn Fn() + Send + Sync)>,
) -> Option<WorkerToken> {
    if let Some(cb) = on_drift_die {
        cb();
    }
    let cluster = Arc::clone(token.cluster());
    let state = cluster.thread_states.get(ts);
    *state.retval.lock().expect("retval lock poisoned") = Some(Box::new(retval));

    if state.resume_flag.fetch_add(1, SeqCst) == 0 {
        trace!("win the join race (joined thread)");
        // Ancestors may still sit on the stack because the scheduler no
        // longer follows pure work-first order after this point; evacuate
        // them before switching away.
        evacuate_all(&cluster, token.rank(), tls.dtree_node_ref.depth);
        resume_sched(token);
    } else {
        trace!("lose the join race (joined thread)");
        let ss = state
            .suspended
            .lock()
            .expect("suspended lock poisoned")
            .take()
            .expect("joiner lost the race without parking");
        resume_suspended(&cluster, ss, token);
    }
    None
}

fn on_root_die<T: Send + 'static>(
    token: WorkerToken,
    ts: ThreadStatePtr,
    retval: TaskResult<T>,
) -> Option<WorkerToken> {
    let cluster = Arc::clone(token.cluster());
    trace!("root thread completed");
    let state = cluster.thread_states.get(ts);
    *state.retval.lock().expect("retval lock poisoned") = Some(Box::new(retval));
    state.resume_flag.store(1, SeqCst);
    resume_sched(token);
    None
}

// ---------------------------------------------------------------------------
// TaskCtx: fork / join / task groups / poll / coll_exec
// ---------------------------------------------------------------------------

impl TaskCtx {
    pub(crate) fn from_token(token: WorkerToken, tls: Tls) -> Self {
        let cluster = Arc::clone(token.cluster());
        Self {
            cluster,
            token: RefCell::new(Some(token)),
            tls: RefCell::new(tls),
        }
    }

    pub(crate) fn take_token(&self) -> WorkerToken {
        self.token
            .borrow_mut()
            .take()
            .expect("worker token absent (context used across a suspension?)")
    }

    pub(crate) fn put_token(&self, token: WorkerToken) {
        let prev = self.token.borrow_mut().replace(token);
        debug_assert!(prev.is_none());
    }

    pub(crate) fn current_rank(&self) -> usize {
        self.token
            .borrow()
            .as_ref()
            .expect("worker token absent")
            .rank()
    }

    /// Spawns a child task with even work shares.
    pub fn fork<T, F>(&self, f: F) -> ThreadHandle<T>
    where
        T: Send + 'static,
        F: FnOnce(&TaskCtx) -> T + Send + 'static,
    {
        self.fork_opts(ForkOpts::even(), f)
    }

    /// Spawns a child task.
    ///
    /// The current distribution range is divided `w_rest : w_new`; the child
    /// receives the upper part. A child owned by the current rank runs inline
    /// under the work-first policy; otherwise its closure is off-stacked and
    /// sent to the owner of its range.
    pub fn fork_opts<T, F>(&self, opts: ForkOpts, f: F) -> ThreadHandle<T>
    where
        T: Send + 'static,
        F: FnOnce(&TaskCtx) -> T + Send + 'static,
    {
        let cluster = Arc::clone(&self.cluster);
        let origin_rank = self.current_rank();
        let ts = cluster.thread_states.insert(origin_rank);
        let shared: Arc<SerializedCell<T>> = Arc::new(SerializedCell::default());

        let new_drange;
        let target_rank;
        let depth;
        let tg_version;
        let dtree_node_ref;
        {
            let mut tls = self.tls.borrow_mut();
            if tls.drange.is_cross_worker() {
                // Avoid too fine-grained task migration.
                if tls
                    .drange
                    .is_sufficiently_small(cluster.options.adws_min_drange_size)
                {
                    tls.drange.move_to_end_boundary();
                }
                let (rest, fresh) = tls.drange.divide(opts.w_rest, opts.w_new);
                trace!("distribution range divided");
                tls.drange = rest;
                new_drange = fresh;
                target_rank = fresh.owner() as usize;
            } else {
                // Quick path for tasks confined to one worker. This task may
                // have been stolen by a worker outside its task group, so the
                // target is wherever it runs now.
                new_drange = tls.drange;
                target_rank = origin_rank;
            }
            depth = tls.dtree_node_ref.depth;
            tg_version = tls.tg_version;
            dtree_node_ref = tls.dtree_node_ref;
        }

        if target_rank == origin_rank {
            // Work-first: queue the continuation, run the child inline.
            let child_tls = Tls {
                drange: new_drange,
                dtree_node_ref,
                tg_version,
                undistributed: true,
                is_root: false,
                dag_prof: DagProfiler::default(),
            };
            let shared2 = Arc::clone(&shared);
            let drift_die = opts.on_drift_die.clone();
            let token = self.take_token();
            let token = suspend_spawn(token, false, move |token, cf| {
                let cluster = Arc::clone(token.cluster());
                let rank = token.rank();
                trace!("push context frame into task queue");
                // Uni-address invariant: the queued interval is inside every
                // rank's reservation.
                debug_assert!(cluster.callstack.contains(cf, FRAME_BYTES as u32));
                let cont = ContSlot::OnStack {
                    frame_base: cf,
                    frame_size: FRAME_BYTES as u32,
                };
                if cluster.workers[rank].use_primary_wsq.load(SeqCst) {
                    cluster
                        .primary_wsq
                        .push(rank, depth, PrimaryEntry { cont, tg_version });
                } else {
                    cluster.migration_wsq.push(
                        rank,
                        depth,
                        MigrationEntry {
                            payload: MigrationPayload::Cont(cont),
                            tg_version,
                        },
                    );
                }

                let ctx = TaskCtx::from_token(token, child_tls);
                {
                    let mut tls = ctx.tls.borrow_mut();
                    tls.dag_prof.increment_thread_count();
                    tls.dag_prof.increment_strand_count();
                }
                let result = catch_unwind(AssertUnwindSafe(|| f(&ctx)));
                on_task_die(&ctx);
                let tls_after = *ctx.tls.borrow();
                let token = ctx.take_token();
                let retval: TaskResult<T> = result.map(|v| (v, tls_after.dag_prof));
                on_die_workfirst(token, tls_after, ts, retval, &shared2, drift_die.as_deref())
            });
            let drifted = token.rank() != origin_rank;
            self.put_token(token);
            if drifted {
                if let Some(cb) = &opts.on_drift_fork {
                    cb();
                }
            }
        } else {
            // Pass the new task to another worker; the parent continues.
            let drift_fork = opts.on_drift_fork.clone();
            let drift_die = opts.on_drift_die.clone();
            let env: TaskFn = Box::new(move |token: WorkerToken| {
                let cluster = Arc::clone(token.cluster());
                let rank = token.rank();
                trace!("starting a migrated thread");
                if new_drange.is_cross_worker() {
                    cluster.dtree.copy_parents(rank, dtree_node_ref);
                    *cluster.workers[rank]
                        .dtree_bottom
                        .lock()
                        .expect("dtree bottom lock poisoned") = dtree_node_ref;
                }
                if rank != origin_rank {
                    if let Some(cb) = &drift_fork {
                        cb();
                    }
                }
                let child_tls = Tls {
                    drange: new_drange,
                    dtree_node_ref,
                    tg_version,
                    undistributed: true,
                    is_root: false,
                    dag_prof: DagProfiler::default(),
                };
                let ctx = TaskCtx::from_token(token, child_tls);
                {
                    let mut tls = ctx.tls.borrow_mut();
                    tls.dag_prof.increment_thread_count();
                    tls.dag_prof.increment_strand_count();
                }
                let result = catch_unwind(AssertUnwindSafe(|| f(&ctx)));
                on_task_die(&ctx);
                let tls_after = *ctx.tls.borrow();
                let token = ctx.take_token();
                let retval: TaskResult<T> = result.map(|v| (v, tls_after.dag_prof));
                on_die_drifted(token, tls_after, ts, retval, drift_die.as_deref())
            });
            let ptr = cluster.evac.insert(origin_rank, Evacuated::Task(env));
            if new_drange.is_cross_worker() {
                debug!("migrate cross-worker task to owner");
                mailbox_put_cross(&cluster, CrossWorkerTask::NewTask(ptr), target_rank);
            } else {
                trace!("pass task to owner through the migration queue");
                cluster.migration_wsq.pass(
                    MigrationEntry {
                        payload: MigrationPayload::NewTask(ptr),
                        tg_version,
                    },
                    target_rank,
                    depth,
                );
            }
        }

        // Restart profiling: only the last strand of the group counts here.
        {
            let mut tls = self.tls.borrow_mut();
            tls.dag_prof.clear();
            tls.dag_prof.increment_strand_count();
        }

        ThreadHandle {
            state: Some(ts),
            shared,
        }
    }

    /// Joins a forked task, returning its result.
    ///
    /// Re-raises the child's panic if it panicked.
    pub fn join<T: Send + 'static>(&self, mut handle: ThreadHandle<T>) -> T {
        // This point is also the end of the last task of a task group.
        on_task_die(self);

        let cluster = Arc::clone(&self.cluster);
        let result: TaskResult<T>;

        if handle.shared.serialized.load(SeqCst) {
            trace!("skip join for serialized thread (fast path)");
            handle.state = None;
            result = handle
                .shared
                .retval
                .lock()
                .expect("retval lock poisoned")
                .take()
                .expect("serialized thread left no return value");
        } else {
            let ts = handle.state.take().expect("thread handle already joined");
            let state = cluster.thread_states.get(ts);

            if state.resume_flag.load(SeqCst) >= 1 {
                trace!("thread already joined");
                result = take_retval(&state);
            } else {
                let depth = self.tls.borrow().dtree_node_ref.depth;
                let state2 = Arc::clone(&state);
                let cluster2 = Arc::clone(&cluster);
                let token = self.take_token();
                let token = suspend_inline(token, move |token, cf| {
                    let rank = token.rank();
                    let ss = evacuate(&cluster2, rank, cf);
                    *state2.suspended.lock().expect("suspended lock poisoned") = Some(ss);
                    if state2.resume_flag.fetch_add(1, SeqCst) == 0 {
                        trace!("win the join race (joining thread)");
                        evacuate_all(&cluster2, rank, depth);
                        resume_sched(token);
                        None
                    } else {
                        trace!("lose the join race (joining thread)");
                        let reclaimed = state2
                            .suspended
                            .lock()
                            .expect("suspended lock poisoned")
                            .take();
                        debug_assert!(reclaimed.is_some());
                        cluster2
                            .evac
                            .deallocate(ss.evacuation_ptr.expect("fresh evacuation"));
                        Some(token)
                    }
                });
                self.put_token(token);
                result = take_retval(&state);
            }
            cluster.thread_states.remove(ts);
        }

        match result {
            Ok((value, prof)) => {
                self.tls.borrow_mut().dag_prof.merge_parallel(prof);
                value
            }
            Err(payload) => resume_unwind(payload),
        }
    }

    /// Opens a task group: the unit of cross-worker distribution.
    pub fn task_group_begin(&self) -> TaskGroupData {
        let cluster = Arc::clone(&self.cluster);
        let rank = self.current_rank();
        let mut tls = self.tls.borrow_mut();

        let mut tgdata = TaskGroupData {
            drange: tls.drange,
            owns_dtree_node: false,
            node_ref: NodeRef::NULL,
            node_parent: NodeRef::NULL,
            node_version: 0,
            dag_prof: tls.dag_prof,
        };

        if tls.drange.is_cross_worker() {
            if ((tls.dtree_node_ref.depth + 1) as usize) < cluster.dtree.max_depth() {
                let parent = tls.dtree_node_ref;
                tls.dtree_node_ref =
                    cluster
                        .dtree
                        .append(rank, parent, tls.drange, tls.tg_version);
                *cluster.workers[rank]
                    .dtree_bottom
                    .lock()
                    .expect("dtree bottom lock poisoned") = tls.dtree_node_ref;
                tgdata.owns_dtree_node = true;
                tgdata.node_ref = tls.dtree_node_ref;
                tgdata.node_parent = parent;
                tgdata.node_version = cluster
                    .dtree
                    .local_node(rank, tls.dtree_node_ref.depth)
                    .version;
            }
            tls.undistributed = true;
            debug!("begin cross-worker task group");
        }

        tls.dag_prof.clear();
        tls.dag_prof.increment_strand_count();

        tgdata
    }

    /// Closes a task group, migrating the continuation back to the range
    /// owner when the group was cross-worker.
    pub fn task_group_end(&self, tgdata: TaskGroupData) {
        // Covers groups that never spawned a task.
        on_task_die(self);

        let cluster = Arc::clone(&self.cluster);
        self.tls.borrow_mut().drange = tgdata.drange;
        let cross = tgdata.drange.is_cross_worker();

        if cross {
            let target = tgdata.drange.owner() as usize;
            if target != self.current_rank() {
                debug!("migrate continuation of cross-worker task to owner");
                let depth = self.tls.borrow().dtree_node_ref.depth;
                let cluster2 = Arc::clone(&cluster);
                let token = self.take_token();
                let token = suspend_inline(token, move |token, cf| {
                    let rank = token.rank();
                    let ss = evacuate(&cluster2, rank, cf);
                    mailbox_put_cross(&cluster2, CrossWorkerTask::Continuation(ss), target);
                    evacuate_all(&cluster2, rank, depth);
                    resume_sched(token);
                    None
                });
                self.put_token(token);
            }

            let rank = self.current_rank();
            let mut tls = self.tls.borrow_mut();
            if tgdata.owns_dtree_node {
                // Retire the completed group so it drops out of steal
                // consideration, then step back to the parent node.
                // `node_parent` is whatever `dtree_node_ref` held at begin:
                // the live enclosing node, or NULL for a depth-0 group. Both
                // are valid scan bottoms (a NULL bottom yields no dominant
                // node), so no dangling reference can reach `dtree_bottom`.
                debug_assert_eq!(tgdata.node_parent.depth, tgdata.node_ref.depth - 1);
                cluster
                    .dtree
                    .store_flag(rank, tgdata.node_ref, -tgdata.node_version);
                let node_depth = tgdata.node_ref.depth;
                tls.dtree_node_ref = tgdata.node_parent;
                *cluster.workers[rank]
                    .dtree_bottom
                    .lock()
                    .expect("dtree bottom lock poisoned") = tgdata.node_parent;
                tls.tg_version.flip(node_depth);
            }
            tls.undistributed = false;
        }

        let mut tls = self.tls.borrow_mut();
        tls.dag_prof.merge_serial(tgdata.dag_prof);
        tls.dag_prof.increment_strand_count();
    }

    /// Checks for an arrived cross-worker task; if one is pending, parks this
    /// task on its own queue and yields to the scheduler. Returns true if a
    /// yield happened.
    pub fn poll(&self) -> bool {
        let cluster = Arc::clone(&self.cluster);
        let rank = self.current_rank();
        if !cluster.cross_mailbox.arrived(rank) {
            return false;
        }
        trace!("cross-worker task arrived; yielding to the scheduler");

        let (depth, tg_version) = {
            let tls = self.tls.borrow();
            (tls.dtree_node_ref.depth, tls.tg_version)
        };
        evacuate_all(&cluster, rank, depth);

        let cluster2 = Arc::clone(&cluster);
        let token = self.take_token();
        let token = suspend_inline(token, move |token, cf| {
            let rank = token.rank();
            let ss = evacuate(&cluster2, rank, cf);
            let cont = ContSlot::Evacuated {
                ptr: ss.evacuation_ptr.expect("fresh evacuation"),
                frame_base: ss.frame_base,
                frame_size: ss.frame_size,
            };
            if cluster2.workers[rank].use_primary_wsq.load(SeqCst) {
                cluster2
                    .primary_wsq
                    .push(rank, depth, PrimaryEntry { cont, tg_version });
            } else {
                cluster2.migration_wsq.push(
                    rank,
                    depth,
                    MigrationEntry {
                        payload: MigrationPayload::Cont(cont),
                        tg_version,
                    },
                );
            }
            resume_sched(token);
            None
        });
        self.put_token(token);
        true
    }

    /// Runs `f` on every rank, broadcast in a butterfly tree rooted at the
    /// current rank, with barriers before and after execution. Only the root
    /// task may initiate collective execution.
    pub fn coll_exec<R, F>(&self, f: F) -> R
    where
        R: Send + 'static,
        F: Fn(&CollCtx) -> R + Send + Sync + 'static,
    {
        assert!(
            self.tls.borrow().is_root,
            "collective execution requires the root task"
        );
        let cluster = Arc::clone(&self.cluster);
        let rank = self.current_rank();
        let begin_rank = rank;

        let slot: Arc<Mutex<Option<R>>> = Arc::new(Mutex::new(None));
        let slot2 = Arc::clone(&slot);
        let coll_fn: Arc<CollFn> = Arc::new(move |cc: &CollCtx| {
            let r = f(cc);
            if cc.rank() == begin_rank {
                *slot2.lock().expect("coll result lock poisoned") = Some(r);
            }
        });

        let ptr = cluster.evac.insert(rank, Evacuated::Coll(Arc::clone(&coll_fn)));
        execute_coll_task(&cluster, rank, &coll_fn, CollTask { task: ptr, begin_rank });
        cluster.evac.deallocate(ptr);

        let out = slot
            .lock()
            .expect("coll result lock poisoned")
            .take()
            .expect("collective task produced no result");
        out
    }
}

impl CollCtx {
    /// The executing rank.
    #[must_use]
    pub fn rank(&self) -> usize {
        self.rank
    }
}

// ---------------------------------------------------------------------------
// Scheduler loop
// ---------------------------------------------------------------------------

/// Root-of-SPMD entry: rank 0 runs `f` as the root task with the
/// whole-cluster distribution range; every rank schedules until the
/// collective exit barrier resolves. Returns the result on rank 0.
pub(crate) fn root_exec<T, F>(token: WorkerToken, f: F) -> (WorkerToken, Option<T>)
where
    T: Send + 'static,
    F: FnOnce(&TaskCtx) -> T + Send + 'static,
{
    root_exec_with(token, f, &mut || {})
}

/// [`root_exec`] with a scheduler-loop callback invoked once per idle
/// iteration.
pub(crate) fn root_exec_with<T, F>(
    token: WorkerToken,
    f: F,
    callback: &mut dyn FnMut(),
) -> (WorkerToken, Option<T>)
where
    T: Send + 'static,
    F: FnOnce(&TaskCtx) -> T + Send + 'static,
{
    let cluster = Arc::clone(token.cluster());
    let rank = token.rank();

    if rank == 0 {
        let n = cluster.n_ranks;
        let ts = cluster.thread_states.insert(0);
        let state = cluster.thread_states.get(ts);
        trace!("starting root thread");

        let token = suspend_spawn(token, true, move |token, _cf| {
            let tls = Tls {
                drange: DistRange::whole(n),
                dtree_node_ref: NodeRef::NULL,
                tg_version: Flipper::default(),
                undistributed: true,
                is_root: true,
                dag_prof: DagProfiler::default(),
            };
            let ctx = TaskCtx::from_token(token, tls);
            {
                let mut t = ctx.tls.borrow_mut();
                t.dag_prof.increment_thread_count();
                t.dag_prof.increment_strand_count();
            }
            let result = catch_unwind(AssertUnwindSafe(|| f(&ctx)));
            let tls_after = *ctx.tls.borrow();
            let token = ctx.take_token();
            let retval: TaskResult<T> = result.map(|v| (v, tls_after.dag_prof));
            on_root_die(token, ts, retval)
        });

        let state2 = Arc::clone(&state);
        let token = sched_loop(token, move || state2.resume_flag.load(SeqCst) >= 1, callback);

        let result = take_retval::<T>(&state);
        cluster.thread_states.remove(ts);
        match result {
            Ok((value, _prof)) => (token, Some(value)),
            Err(payload) => {
                drop(token);
                resume_unwind(payload)
            }
        }
    } else {
        // Non-root ranks arm the exit barrier immediately; it resolves when
        // rank 0 joins after the root thread completes.
        let token = sched_loop(token, || true, callback);
        (token, None)
    }
}

/// The scheduler loop: drain collective tasks, claim mailbox deliveries,
/// resume queued continuations, run migrated tasks, and steal.
pub(crate) fn sched_loop<C>(
    mut token: WorkerToken,
    cond: C,
    callback: &mut dyn FnMut(),
) -> WorkerToken
where
    C: Fn() -> bool,
{
    trace!("enter scheduling loop");
    let home_rank = token.rank();

    loop {
        if should_exit_sched_loop(&token, &cond) {
            break;
        }
        let cluster = Arc::clone(token.cluster());
        let rank = token.rank();
        debug_assert_eq!(rank, home_rank);

        if let Some(cwt) = cluster.cross_mailbox.pop(rank) {
            token = execute_cross_worker_task(token, cwt);
            continue;
        }

        if let Some(pwe) = pop_from_primary_queues(&cluster, rank) {
            // No on-stack thread can exist while the scheduler is running.
            let ss = match pwe.cont {
                ContSlot::Evacuated {
                    ptr,
                    frame_base,
                    frame_size,
                } => SuspendedState {
                    evacuation_ptr: Some(ptr),
                    frame_base,
                    frame_size,
                },
                ContSlot::OnStack { .. } => {
                    panic!("on-stack threads cannot remain after switching to the scheduler")
                }
            };
            let cluster2 = Arc::clone(&cluster);
            token = suspend_inline(token, move |token, cf| {
                cluster2.workers[token.rank()].sched_cf.store(cf, SeqCst);
                resume_suspended(&cluster2, ss, token);
                None
            });
            continue;
        }

        if let Some(mwe) = pop_from_migration_queues(&cluster, rank) {
            cluster.workers[rank].use_primary_wsq.store(false, SeqCst);
            token = execute_migrated_task(token, mwe);
            cluster.workers[rank].use_primary_wsq.store(true, SeqCst);
            continue;
        }

        if cluster.options.adws_enable_steal {
            token = steal(token);
        }

        callback();
    }

    let cluster = Arc::clone(token.cluster());
    let rank = token.rank();
    *cluster.workers[rank]
        .dtree_bottom
        .lock()
        .expect("dtree bottom lock poisoned") = NodeRef::NULL;
    *cluster.workers[rank]
        .exit_barrier
        .lock()
        .expect("exit barrier lock poisoned") = None;
    trace!("exit scheduling loop");
    token
}

fn should_exit_sched_loop<C: Fn() -> bool>(token: &WorkerToken, cond: &C) -> bool {
    let cluster = token.cluster();
    let rank = token.rank();

    // The in-process transport needs no progress pump; the option is a hook
    // for transports that do.
    let _ = cluster.options.sched_loop_make_progress;

    execute_coll_task_if_arrived(cluster, rank);

    let mut armed = cluster.workers[rank]
        .exit_barrier
        .lock()
        .expect("exit barrier lock poisoned");
    if armed.is_none() && cond() {
        *armed = Some(cluster.comm.nb_barrier_arrive());
    }
    match armed.as_ref() {
        Some(handle) => cluster.comm.nb_barrier_test(handle),
        None => false,
    }
}

fn pop_from_primary_queues(cluster: &Cluster, rank: usize) -> Option<PrimaryEntry> {
    let mut d = cluster.primary_wsq.max_depth() - 1;
    while d >= -1 {
        if let Some(e) = cluster.primary_wsq.pop(rank, d) {
            return Some(e);
        }
        d -= 1;
    }
    None
}

fn pop_from_migration_queues(cluster: &Cluster, rank: usize) -> Option<MigrationEntry> {
    let mut d = -1;
    while d < cluster.migration_wsq.max_depth() {
        if let Some(e) = cluster.migration_wsq.pop(rank, d) {
            return Some(e);
        }
        d += 1;
    }
    None
}

fn start_new_task(token: WorkerToken, ptr: EvacPtr) -> Option<WorkerToken> {
    let cluster = Arc::clone(token.cluster());
    // Fetch-and-free before execution: remote ranks waiting on
    // `is_remotely_freed` unblock as soon as the task is claimed.
    let task = cluster.evac.take_task(ptr);
    task(token)
}

fn execute_cross_worker_task(token: WorkerToken, cwt: CrossWorkerTask) -> WorkerToken {
    let cluster = Arc::clone(token.cluster());
    match cwt {
        CrossWorkerTask::NewTask(ptr) => {
            trace!("received a new cross-worker task");
            suspend_spawn(token, true, move |token, _cf| start_new_task(token, ptr))
        }
        CrossWorkerTask::Continuation(ss) => {
            trace!("received a continuation of a cross-worker task");
            suspend_inline(token, move |token, cf| {
                cluster.workers[token.rank()].sched_cf.store(cf, SeqCst);
                resume_suspended(&cluster, ss, token);
                None
            })
        }
    }
}

fn execute_migrated_task(token: WorkerToken, mwe: MigrationEntry) -> WorkerToken {
    let cluster = Arc::clone(token.cluster());
    match mwe.payload {
        MigrationPayload::NewTask(ptr) => {
            trace!("popped a new task from the local migration queues");
            suspend_spawn(token, true, move |token, _cf| start_new_task(token, ptr))
        }
        MigrationPayload::Cont(ContSlot::Evacuated {
            ptr,
            frame_base,
            frame_size,
        }) => {
            trace!("popped an evacuated continuation from the local migration queues");
            let ss = SuspendedState {
                evacuation_ptr: Some(ptr),
                frame_base,
                frame_size,
            };
            suspend_inline(token, move |token, cf| {
                cluster.workers[token.rank()].sched_cf.store(cf, SeqCst);
                resume_suspended(&cluster, ss, token);
                None
            })
        }
        MigrationPayload::Cont(ContSlot::OnStack { .. }) => {
            panic!("on-stack threads cannot remain after switching to the scheduler")
        }
    }
}

// ---------------------------------------------------------------------------
// Stealing
// ---------------------------------------------------------------------------

fn steal(token: WorkerToken) -> WorkerToken {
    let cluster = Arc::clone(token.cluster());
    let rank = token.rank();

    let bottom = *cluster.workers[rank]
        .dtree_bottom
        .lock()
        .expect("dtree bottom lock poisoned");
    let node = {
        let mut rng = cluster.workers[rank].rng.lock().expect("rng lock poisoned");
        cluster.dtree.get_topmost_dominant(rank, bottom, &mut rng)
    };
    let Some(node) = node else {
        return token;
    };

    let steal_range = node.drange;
    let tg_version = node.tg_version;
    let depth = node.depth();
    trace!("dominant dist-tree node found");

    let begin_rank = steal_range.begin_rank();
    let mut end_rank = steal_range.end_rank();
    if steal_range.is_at_end_boundary() {
        end_rank -= 1;
    }
    if begin_rank == end_rank {
        return token;
    }

    // Reuse one tree scan across several steal attempts.
    let max_reuse = cluster.options.adws_max_dtree_reuse.max(1);
    let mut token = token;
    for _ in 0..max_reuse {
        let target = {
            let mut rng = cluster.workers[rank].rng.lock().expect("rng lock poisoned");
            rng.next_range(begin_rank, end_rank)
        } as usize;

        if target as i64 != begin_rank {
            let (t, success) = steal_from_migration_queues(token, target, depth, tg_version);
            token = t;
            if success {
                return token;
            }
        }

        if target as i64 != end_rank || steal_range.is_at_end_boundary() {
            let (t, success) = steal_from_primary_queues(token, target, depth, tg_version);
            token = t;
            if success {
                return token;
            }
        }

        // Periodic check for cross-worker task arrival.
        if let Some(cwt) = cluster.cross_mailbox.pop(rank) {
            return execute_cross_worker_task(token, cwt);
        }
    }
    token
}

fn steal_from_primary_queues(
    token: WorkerToken,
    target: usize,
    min_depth: Depth,
    tg_version: Flipper,
) -> (WorkerToken, bool) {
    let cluster = Arc::clone(token.cluster());
    let mut depths = Vec::new();
    cluster.primary_wsq.for_each_nonempty(
        target,
        min_depth,
        cluster.primary_wsq.max_depth(),
        false,
        |d| {
            depths.push(d);
            false
        },
    );

    let mut token = token;
    for d in depths {
        let Some(mut guard) = cluster.primary_wsq.try_steal_lock(target, d) else {
            continue;
        };
        let Some(entry) = guard.steal() else {
            continue;
        };
        if !entry.tg_version.matches(tg_version, min_depth) {
            guard.abort(entry);
            continue;
        }

        match entry.cont {
            ContSlot::Evacuated {
                ptr,
                frame_base,
                frame_size,
            } => {
                drop(guard);
                trace!("steal an evacuated context frame from a primary queue");
                let ss = SuspendedState {
                    evacuation_ptr: Some(ptr),
                    frame_base,
                    frame_size,
                };
                let cluster2 = Arc::clone(&cluster);
                token = suspend_inline(token, move |token, cf| {
                    cluster2.workers[token.rank()].sched_cf.store(cf, SeqCst);
                    resume_suspended(&cluster2, ss, token);
                    None
                });
                return (token, true);
            }
            ContSlot::OnStack {
                frame_base,
                frame_size,
            } => {
                trace!("steal an on-stack context frame from a primary queue");
                let mut record = cluster
                    .callstack
                    .direct_copy_from(frame_base, frame_size, target);
                drop(guard);
                // The stolen frame roots a fresh stack here.
                record.parent = NULL_FRAME;
                let cluster2 = Arc::clone(&cluster);
                token = suspend_inline(token, move |token, cf| {
                    cluster2.workers[token.rank()].sched_cf.store(cf, SeqCst);
                    resume_frame(&cluster2, record, token);
                    None
                });
                return (token, true);
            }
        }
    }
    (token, false)
}

fn steal_from_migration_queues(
    token: WorkerToken,
    target: usize,
    min_depth: Depth,
    tg_version: Flipper,
) -> (WorkerToken, bool) {
    let cluster = Arc::clone(token.cluster());
    let mut depths = Vec::new();
    cluster.migration_wsq.for_each_nonempty(
        target,
        min_depth,
        cluster.migration_wsq.max_depth(),
        true,
        |d| {
            depths.push(d);
            false
        },
    );

    let mut token = token;
    for d in depths {
        let Some(mut guard) = cluster.migration_wsq.try_steal_lock(target, d) else {
            continue;
        };
        let Some(entry) = guard.steal() else {
            continue;
        };
        if !entry.tg_version.matches(tg_version, min_depth) {
            guard.abort(entry);
            continue;
        }

        match entry.payload {
            MigrationPayload::NewTask(ptr) => {
                drop(guard);
                trace!("steal a new task from a migration queue");
                token = suspend_spawn(token, true, move |token, _cf| start_new_task(token, ptr));
                return (token, true);
            }
            MigrationPayload::Cont(ContSlot::Evacuated {
                ptr,
                frame_base,
                frame_size,
            }) => {
                drop(guard);
                trace!("steal an evacuated context frame from a migration queue");
                let ss = SuspendedState {
                    evacuation_ptr: Some(ptr),
                    frame_base,
                    frame_size,
                };
                let cluster2 = Arc::clone(&cluster);
                token = suspend_inline(token, move |token, cf| {
                    cluster2.workers[token.rank()].sched_cf.store(cf, SeqCst);
                    resume_suspended(&cluster2, ss, token);
                    None
                });
                return (token, true);
            }
            MigrationPayload::Cont(ContSlot::OnStack {
                frame_base,
                frame_size,
            }) => {
                trace!("steal an on-stack context frame from a migration queue");
                let mut record = cluster
                    .callstack
                    .direct_copy_from(frame_base, frame_size, target);
                drop(guard);
                record.parent = NULL_FRAME;
                let cluster2 = Arc::clone(&cluster);
                token = suspend_inline(token, move |token, cf| {
                    cluster2.workers[token.rank()].sched_cf.store(cf, SeqCst);
                    resume_frame(&cluster2, record, token);
                    None
                });
                return (token, true);
            }
        }
    }
    (token, false)
}

// ---------------------------------------------------------------------------
// Collective tasks
// ---------------------------------------------------------------------------

/// Forwards the collective task down the butterfly tree, then runs it between
/// two barriers so payload slots are safe to free afterwards.
fn execute_coll_task(cluster: &Arc<Cluster>, rank: usize, task: &Arc<CollFn>, ct: CollTask) {
    let n = cluster.n_ranks;
    let shifted = (rank + n - ct.begin_rank) % n;
    let mut i = next_pow2(n);
    while i > 1 {
        if shifted % i == 0 {
            let target_shifted = shifted + i / 2;
            if target_shifted < n {
                let target = (target_shifted + ct.begin_rank) % n;
                mailbox_put_coll(cluster, ct, target);
            }
        }
        i /= 2;
    }

    cluster.comm.barrier();
    task(&CollCtx::new(Arc::clone(cluster), rank));
    cluster.comm.barrier();
}

pub(crate) fn execute_coll_task_if_arrived(cluster: &Arc<Cluster>, rank: usize) {
    if let Some(ct) = cluster.coll_mailbox.pop(rank) {
        debug!("received a collective task");
        let task = cluster.evac.get_coll(ct.task);
        // Forward a locally-owned copy; the sender's slot may be freed as
        // soon as the post-execution barrier completes.
        let local = cluster.evac.insert(rank, Evacuated::Coll(Arc::clone(&task)));
        execute_coll_task(
            cluster,
            rank,
            &task,
            CollTask {
                task: local,
                begin_rank: ct.begin_rank,
            },
        );
        cluster.evac.deallocate(local);
    }
}

// ---------------------------------------------------------------------------
// Ctx impls
// ---------------------------------------------------------------------------

impl Ctx for TaskCtx {
    fn rank(&self) -> usize {
        self.current_rank()
    }

    fn is_spmd(&self) -> bool {
        false
    }

    fn is_root_task(&self) -> bool {
        self.tls.borrow().is_root
    }

    fn cluster(&self) -> &Arc<Cluster> {
        &self.cluster
    }

    fn as_task_ctx(&self) -> Option<&TaskCtx> {
        Some(self)
    }

    fn run_on_scheduler<F>(&self, f: F)
    where
        F: FnOnce(&TaskCtx) + Send + 'static,
    {
        f(self);
    }

    fn coll_alloc_routed<T: ByteRepr>(&self, count: usize) -> GlobalPtr<T> {
        assert!(
            self.is_root_task(),
            "collective allocation from a task requires the root task"
        );
        self.coll_exec(move |cc| cc.global_alloc_coll::<T>(count))
    }

    fn coll_free_routed<T: ByteRepr>(&self, ptr: GlobalPtr<T>) {
        assert!(
            self.is_root_task(),
            "collective deallocation from a task requires the root task"
        );
        self.coll_exec(move |cc| cc.global_free_coll::<T>(ptr));
    }
}

impl Ctx for CollCtx {
    fn rank(&self) -> usize {
        self.rank
    }

    fn is_spmd(&self) -> bool {
        false
    }

    fn is_collective_site(&self) -> bool {
        true
    }

    fn cluster(&self) -> &Arc<Cluster> {
        &self.cluster
    }

    fn run_on_scheduler<F>(&self, _f: F)
    where
        F: FnOnce(&TaskCtx) + Send + 'static,
    {
        panic!("cannot schedule parallel work inside a collective task");
    }
}
