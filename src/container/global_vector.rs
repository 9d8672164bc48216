//! Global vector: a contiguous container over global memory.
//!
//! A global vector manages a global memory region. Its elements cannot be
//! touched directly; access goes through checkout/checkin. Two flavors exist:
//!
//! - A **collective** vector must be allocated and deallocated by all ranks
//!   together, either in the SPMD region or from the root task. Its memory is
//!   block-distributed across ranks. Size-changing element operations
//!   (`push_back`, `pop_back`) are not permitted.
//! - A **non-collective** vector allocates on the calling rank and can be
//!   read, grown, and freed from any rank.
//!
//! The handle is a plain value with no destructor: freeing global memory
//! needs a context, so destruction is explicit via
//! [`GlobalVector::destroy`]. Because the handle is fixed-width encodable, a
//! vector can itself be stored inside global memory (vectors of vectors):
//! check the handle out, mutate it, and write it back.

use crate::ctx::Ctx;
use crate::mem::{ByteRepr, CheckoutMode, GlobalPtr, GlobalSpan};
use crate::pattern::{self, ParallelPolicy, SequencedPolicy};

/// Options for [`GlobalVector`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GlobalVectorOpts {
    /// Allocate collectively, block-distributed across all ranks.
    pub collective: bool,
    /// Parallelize element construction under the scheduler.
    pub parallel_construct: bool,
    /// Element count at which parallel construction stops recursing.
    pub cutoff_count: usize,
}

impl Default for GlobalVectorOpts {
    fn default() -> Self {
        Self {
            collective: false,
            parallel_construct: false,
            cutoff_count: 1024,
        }
    }
}

/// A contiguous global-memory container.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct GlobalVector<T: ByteRepr> {
    opts: GlobalVectorOpts,
    begin: GlobalPtr<T>,
    end: GlobalPtr<T>,
    reserved_end: GlobalPtr<T>,
}

impl<T: ByteRepr> std::fmt::Debug for GlobalVector<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GlobalVector")
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .field("collective", &self.opts.collective)
            .finish()
    }
}

impl<T: ByteRepr> Default for GlobalVector<T> {
    fn default() -> Self {
        Self::new(GlobalVectorOpts::default())
    }
}

impl<T: ByteRepr> GlobalVector<T> {
    /// An empty vector; no memory is allocated.
    #[must_use]
    pub const fn new(opts: GlobalVectorOpts) -> Self {
        Self {
            opts,
            begin: GlobalPtr::null(),
            end: GlobalPtr::null(),
            reserved_end: GlobalPtr::null(),
        }
    }

    /// A vector of `len` copies of `value`.
    pub fn with_len<C: Ctx>(ctx: &C, opts: GlobalVectorOpts, len: u64, value: T) -> Self {
        let mut v = Self::new(opts);
        if len > 0 {
            v.begin = v.allocate_mem(ctx, len);
            v.end = v.begin.add(len);
            v.reserved_end = v.begin.add(len);
            v.construct_fill(ctx, 0, len, value);
        }
        v
    }

    /// A vector whose element `i` is `f(i)`.
    pub fn from_fn<C, F>(ctx: &C, opts: GlobalVectorOpts, len: u64, f: F) -> Self
    where
        C: Ctx,
        F: Fn(u64) -> T + Clone + Send + 'static,
    {
        let mut v = Self::new(opts);
        if len > 0 {
            v.begin = v.allocate_mem(ctx, len);
            v.end = v.begin.add(len);
            v.reserved_end = v.begin.add(len);
            v.construct_with(ctx, 0, len, f);
        }
        v
    }

    /// A vector initialized from a local slice.
    pub fn from_slice<C: Ctx>(ctx: &C, opts: GlobalVectorOpts, values: &[T]) -> Self {
        let mut v = Self::new(opts);
        let len = values.len() as u64;
        if len > 0 {
            v.begin = v.allocate_mem(ctx, len);
            v.end = v.begin.add(len);
            v.reserved_end = v.begin.add(len);
            let mut cs = ctx.checkout(v.begin, values.len(), CheckoutMode::Write);
            cs.copy_from_slice(values);
            cs.checkin();
        }
        v
    }

    /// The construction options.
    #[must_use]
    pub const fn opts(&self) -> GlobalVectorOpts {
        self.opts
    }

    /// Element count.
    #[must_use]
    pub fn len(&self) -> u64 {
        if self.begin.is_null() {
            0
        } else {
            self.end.offset_from(self.begin)
        }
    }

    /// True if the vector holds no elements.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reserved element capacity.
    #[must_use]
    pub fn capacity(&self) -> u64 {
        if self.begin.is_null() {
            0
        } else {
            self.reserved_end.offset_from(self.begin)
        }
    }

    /// Pointer to the first element.
    #[must_use]
    pub const fn begin(&self) -> GlobalPtr<T> {
        self.begin
    }

    /// Pointer one past the last element.
    #[must_use]
    pub const fn end(&self) -> GlobalPtr<T> {
        self.end
    }

    /// The vector's elements as a global span.
    #[must_use]
    pub fn as_span(&self) -> GlobalSpan<T> {
        GlobalSpan::new(self.begin, self.len())
    }

    /// Reads element `i`.
    pub fn get<C: Ctx>(&self, ctx: &C, i: u64) -> T {
        assert!(i < self.len(), "global vector index {i} out of range");
        let cs = ctx.checkout(self.begin.add(i), 1, CheckoutMode::Read);
        let v = cs[0];
        cs.checkin();
        v
    }

    /// Writes element `i`.
    pub fn set<C: Ctx>(&self, ctx: &C, i: u64, value: T) {
        assert!(i < self.len(), "global vector index {i} out of range");
        let mut cs = ctx.checkout(self.begin.add(i), 1, CheckoutMode::Write);
        cs[0] = value;
        cs.checkin();
    }

    /// Grows the reserved capacity to at least `new_cap` elements.
    pub fn reserve<C: Ctx>(&mut self, ctx: &C, new_cap: u64) {
        if self.capacity() == 0 && new_cap > 0 {
            self.begin = self.allocate_mem(ctx, new_cap);
            self.end = self.begin;
            self.reserved_end = self.begin.add(new_cap);
        } else if new_cap > self.capacity() {
            self.realloc_mem(ctx, new_cap);
        }
    }

    /// Resizes to `new_len`, default-filling any new elements.
    pub fn resize<C: Ctx>(&mut self, ctx: &C, new_len: u64) {
        self.resize_impl(ctx, new_len, T::default());
    }

    /// Resizes to `new_len`, filling any new elements with `value`.
    pub fn resize_with<C: Ctx>(&mut self, ctx: &C, new_len: u64, value: T) {
        self.resize_impl(ctx, new_len, value);
    }

    /// Appends an element. Not permitted for collective vectors.
    pub fn push_back<C: Ctx>(&mut self, ctx: &C, value: T) {
        assert!(
            !self.opts.collective,
            "push_back is not permitted for collective global vectors"
        );
        let len = self.len();
        if len == self.capacity() {
            let new_cap = self.next_size(len + 1);
            if self.capacity() == 0 {
                self.reserve(ctx, new_cap);
            } else {
                self.realloc_mem(ctx, new_cap);
            }
        }
        let mut cs = ctx.checkout(self.end, 1, CheckoutMode::Write);
        cs[0] = value;
        cs.checkin();
        self.end = self.end.add(1);
    }

    /// Removes and returns the last element. Not permitted for collective
    /// vectors.
    pub fn pop_back<C: Ctx>(&mut self, ctx: &C) -> T {
        assert!(
            !self.opts.collective,
            "pop_back is not permitted for collective global vectors"
        );
        let len = self.len();
        assert!(len > 0, "pop_back on an empty global vector");
        let cs = ctx.checkout(self.begin.add(len - 1), 1, CheckoutMode::Read);
        let v = cs[0];
        cs.checkin();
        self.end = self.begin.add(len - 1);
        v
    }

    /// Drops all elements, keeping the reserved memory.
    pub fn clear(&mut self) {
        self.end = self.begin;
    }

    /// Swaps two vectors.
    pub fn swap(&mut self, other: &mut Self) {
        std::mem::swap(self, other);
    }

    /// Deep-copies the vector into fresh memory with the same options.
    pub fn duplicate<C: Ctx>(&self, ctx: &C) -> Self {
        let len = self.len();
        let mut copy = Self::new(self.opts);
        if len > 0 {
            copy.begin = copy.allocate_mem(ctx, len);
            copy.end = copy.begin.add(len);
            copy.reserved_end = copy.begin.add(len);
            let src = self.as_span();
            let dst = copy.begin;
            let policy = SequencedPolicy {
                checkout_count: self.opts.cutoff_count.max(1),
            };
            if self.opts.collective {
                ctx.run_on_scheduler(move |t| pattern::copy_seq(t, &policy, src, dst));
            } else {
                pattern::copy_seq(ctx, &policy, src, dst);
            }
        }
        copy
    }

    /// Frees the vector's memory. The handle (and any stored copies of it)
    /// become empty/dangling; this is the explicit counterpart of a
    /// destructor, since freeing global memory requires a context.
    pub fn destroy<C: Ctx>(&mut self, ctx: &C) {
        if !self.begin.is_null() {
            self.free_mem(ctx, self.begin);
        }
        self.begin = GlobalPtr::null();
        self.end = GlobalPtr::null();
        self.reserved_end = GlobalPtr::null();
    }

    fn next_size(&self, least: u64) -> u64 {
        least.max(self.len() * 2)
    }

    fn allocate_mem<C: Ctx>(&self, ctx: &C, count: u64) -> GlobalPtr<T> {
        if self.opts.collective {
            ctx.coll_alloc_routed::<T>(count as usize)
        } else {
            ctx.global_alloc::<T>(count as usize)
        }
    }

    fn free_mem<C: Ctx>(&self, ctx: &C, ptr: GlobalPtr<T>) {
        if self.opts.collective {
            ctx.coll_free_routed::<T>(ptr);
        } else {
            ctx.global_free::<T>(ptr);
        }
    }

    fn construct_fill<C: Ctx>(&self, ctx: &C, from: u64, to: u64, value: T) {
        self.construct_with(ctx, from, to, move |_| value);
    }

    fn construct_with<C, F>(&self, ctx: &C, from: u64, to: u64, f: F)
    where
        C: Ctx,
        F: Fn(u64) -> T + Clone + Send + 'static,
    {
        if from >= to {
            return;
        }
        let span = GlobalSpan::new(self.begin.add(from), to - from);
        let cutoff = self.opts.cutoff_count.max(1);
        let parallel = self.opts.parallel_construct;

        if self.opts.collective {
            // Collective construction runs once, under the scheduler.
            ctx.run_on_scheduler(move |t| {
                if parallel {
                    pattern::fill_with(t, &ParallelPolicy::with_counts(cutoff), span, from, f);
                } else {
                    pattern::fill_with_seq(
                        t,
                        &SequencedPolicy {
                            checkout_count: cutoff,
                        },
                        span,
                        from,
                        f,
                    );
                }
            });
        } else if parallel {
            if let Some(t) = ctx.as_task_ctx() {
                pattern::fill_with(t, &ParallelPolicy::with_counts(cutoff), span, from, f);
            } else {
                pattern::fill_with_seq(
                    ctx,
                    &SequencedPolicy {
                        checkout_count: cutoff,
                    },
                    span,
                    from,
                    f,
                );
            }
        } else {
            pattern::fill_with_seq(
                ctx,
                &SequencedPolicy {
                    checkout_count: cutoff,
                },
                span,
                from,
                f,
            );
        }
    }

    fn realloc_mem<C: Ctx>(&mut self, ctx: &C, new_cap: u64) {
        let old_begin = self.begin;
        let old_len = self.len();
        let old_cap = self.capacity();

        let new_begin = self.allocate_mem(ctx, new_cap);
        if old_len > 0 {
            let src = GlobalSpan::new(old_begin, old_len);
            let policy = SequencedPolicy {
                checkout_count: self.opts.cutoff_count.max(1),
            };
            if self.opts.collective {
                ctx.run_on_scheduler(move |t| pattern::copy_seq(t, &policy, src, new_begin));
            } else {
                pattern::copy_seq(ctx, &policy, src, new_begin);
            }
        }
        if old_cap > 0 {
            self.free_mem(ctx, old_begin);
        }

        self.begin = new_begin;
        self.end = new_begin.add(old_len);
        self.reserved_end = new_begin.add(new_cap);
    }

    fn resize_impl<C: Ctx>(&mut self, ctx: &C, count: u64, value: T) {
        let len = self.len();
        if count > len {
            if count > self.capacity() {
                let new_cap = self.next_size(count);
                if self.capacity() == 0 {
                    self.reserve(ctx, new_cap);
                } else {
                    self.realloc_mem(ctx, new_cap);
                }
            }
            self.construct_fill(ctx, len, count, value);
            self.end = self.begin.add(count);
        } else if count < len {
            self.end = self.begin.add(count);
        }
    }
}

impl<T: ByteRepr> ByteRepr for GlobalVector<T> {
    // collective + parallel_construct + cutoff + three pointers
    const SIZE: usize = 1 + 1 + 8 + 3 * 16;

    fn store(&self, buf: &mut [u8]) {
        buf[0] = u8::from(self.opts.collective);
        buf[1] = u8::from(self.opts.parallel_construct);
        buf[2..10].copy_from_slice(&(self.opts.cutoff_count as u64).to_le_bytes());
        self.begin.store(&mut buf[10..26]);
        self.end.store(&mut buf[26..42]);
        self.reserved_end.store(&mut buf[42..58]);
    }

    fn load(buf: &[u8]) -> Self {
        Self {
            opts: GlobalVectorOpts {
                collective: buf[0] != 0,
                parallel_construct: buf[1] != 0,
                cutoff_count: u64::from_le_bytes(
                    buf[2..10].try_into().expect("byte width mismatch"),
                ) as usize,
            },
            begin: ByteRepr::load(&buf[10..26]),
            end: ByteRepr::load(&buf[26..42]),
            reserved_end: ByteRepr::load(&buf[42..58]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handle_byte_repr_roundtrip() {
        let v: GlobalVector<i64> = GlobalVector {
            opts: GlobalVectorOpts {
                collective: true,
                parallel_construct: false,
                cutoff_count: 256,
            },
            begin: GlobalPtr::new(3, 0),
            end: GlobalPtr::new(3, 80),
            reserved_end: GlobalPtr::new(3, 160),
        };
        let mut buf = [0u8; <GlobalVector<i64> as ByteRepr>::SIZE];
        v.store(&mut buf);
        let w: GlobalVector<i64> = ByteRepr::load(&buf);
        assert_eq!(v, w);
        assert_eq!(w.len(), 10);
        assert_eq!(w.capacity(), 20);
    }

    #[test]
    fn empty_handle_defaults() {
        let v: GlobalVector<u32> = GlobalVector::default();
        assert!(v.is_empty());
        assert_eq!(v.len(), 0);
        assert_eq!(v.capacity(), 0);
        assert!(v.begin().is_null());
    }
}
