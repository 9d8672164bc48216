//! The capability context trait.
//!
//! Every phase of a program holds a context: [`crate::SpmdCtx`] inside the
//! SPMD region, [`crate::TaskCtx`] inside a scheduled task, and
//! [`crate::CollCtx`] inside a collective task. All three grant access to the
//! global address space; which collective and scheduling operations they
//! allow differs, and most of those differences are enforced by the type
//! rather than at run time.

use std::sync::Arc;

use crate::mem::checkout::checkout_impl;
use crate::mem::{ByteRepr, CheckoutMode, CheckoutSpan, GlobalPtr};
use crate::runtime::Cluster;
use crate::sched::TaskCtx;

/// Common capability surface of all execution contexts.
pub trait Ctx {
    /// The rank this context is currently executing on.
    fn rank(&self) -> usize;

    /// Number of worker ranks.
    fn n_ranks(&self) -> usize {
        self.cluster().n_ranks
    }

    /// True inside the SPMD region.
    fn is_spmd(&self) -> bool;

    /// True for the root task created by `root_exec`.
    fn is_root_task(&self) -> bool {
        false
    }

    /// True where collective allocation may be issued directly (every rank is
    /// executing the same call site).
    fn is_collective_site(&self) -> bool {
        false
    }

    #[doc(hidden)]
    fn cluster(&self) -> &Arc<Cluster>;

    /// Downcast to a task context, if this is one.
    fn as_task_ctx(&self) -> Option<&TaskCtx> {
        None
    }

    /// Runs `f` under the scheduler: collectively via `root_exec` from the
    /// SPMD region, inline from a task.
    fn run_on_scheduler<F>(&self, f: F)
    where
        F: FnOnce(&TaskCtx) + Send + 'static,
        Self: Sized;

    /// Collective transport barrier across all ranks.
    fn barrier(&self) {
        self.cluster().comm.barrier();
    }

    /// Allocates a rank-local global segment of `count` elements.
    fn global_alloc<T: ByteRepr>(&self, count: usize) -> GlobalPtr<T> {
        let bytes = (count * T::SIZE) as u64;
        let id = self.cluster().memory.alloc_local(self.rank(), bytes);
        GlobalPtr::new(id, 0)
    }

    /// Frees a rank-local segment; any rank may do this.
    fn global_free<T: ByteRepr>(&self, ptr: GlobalPtr<T>) {
        self.cluster().memory.free(ptr.segment());
    }

    /// Collectively allocates a block-partitioned segment.
    ///
    /// # Panics
    ///
    /// Panics outside a collective site.
    fn global_alloc_coll<T: ByteRepr>(&self, count: usize) -> GlobalPtr<T> {
        assert!(
            self.is_collective_site(),
            "collective allocation outside an SPMD region or collective task"
        );
        let bytes = (count * T::SIZE) as u64;
        let cluster = self.cluster();
        let id = cluster.memory.alloc_coll(&cluster.comm, self.rank(), bytes);
        GlobalPtr::new(id, 0)
    }

    /// Collectively frees a block-partitioned segment.
    fn global_free_coll<T: ByteRepr>(&self, ptr: GlobalPtr<T>) {
        assert!(
            self.is_collective_site(),
            "collective deallocation outside an SPMD region or collective task"
        );
        let cluster = self.cluster();
        cluster
            .memory
            .free_coll(&cluster.comm, self.rank(), ptr.segment());
    }

    /// Collective allocation routed through whatever this context allows:
    /// direct at a collective site, through `coll_exec` from the root task.
    fn coll_alloc_routed<T: ByteRepr>(&self, count: usize) -> GlobalPtr<T> {
        self.global_alloc_coll(count)
    }

    /// Counterpart of [`Ctx::coll_alloc_routed`] for deallocation.
    fn coll_free_routed<T: ByteRepr>(&self, ptr: GlobalPtr<T>) {
        self.global_free_coll(ptr);
    }

    /// Makes `[ptr, ptr + count)` locally accessible until the returned guard
    /// checks in.
    fn checkout<T: ByteRepr>(
        &self,
        ptr: GlobalPtr<T>,
        count: usize,
        mode: CheckoutMode,
    ) -> CheckoutSpan<T> {
        checkout_impl(self.cluster(), self.rank(), ptr, count, mode)
    }

    /// Flushes deferred home-mapping work queued by checkouts.
    fn checkout_complete(&self) {
        self.cluster()
            .memory
            .home(self.rank())
            .checkout_complete();
    }
}
