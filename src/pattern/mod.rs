//! Execution policies and loop templates over global memory.
//!
//! Parallel loops recurse by binary range splitting inside nested task
//! groups, forking with weights proportional to the sub-range lengths. That
//! proportionality is what lets the scheduler's distribution ranges line up
//! with element ranges, so the same worker keeps touching the same data
//! across runs. Leaves access elements through checkouts bounded by the
//! policy's `checkout_count`.

use crate::ctx::Ctx;
use crate::mem::{ByteRepr, CheckoutMode, GlobalPtr, GlobalSpan};
use crate::sched::{ForkOpts, TaskCtx};

/// Serial execution policy for loop templates.
#[derive(Debug, Clone, Copy)]
pub struct SequencedPolicy {
    /// Maximum number of elements checked out at a time.
    pub checkout_count: usize,
}

impl Default for SequencedPolicy {
    fn default() -> Self {
        Self { checkout_count: 1 }
    }
}

/// Parallel execution policy for loop templates.
#[derive(Debug, Clone, Copy)]
pub struct ParallelPolicy {
    /// Number of elements at which recursion stops and a leaf runs serially.
    pub cutoff_count: usize,
    /// Maximum number of elements checked out at a time inside a leaf.
    pub checkout_count: usize,
}

impl Default for ParallelPolicy {
    fn default() -> Self {
        Self {
            cutoff_count: 1,
            checkout_count: 1,
        }
    }
}

impl ParallelPolicy {
    /// Policy with both counts set to `count`.
    #[must_use]
    pub const fn with_counts(count: usize) -> Self {
        Self {
            cutoff_count: count,
            checkout_count: count,
        }
    }
}

/// Recursive binary split driving `leaf` over `[lo, hi)` and combining leaf
/// results with `comb`. One task group per split that can still go parallel.
fn parallel_leaf_driver<R, Leaf, Comb>(
    ctx: &TaskCtx,
    cutoff: u64,
    lo: u64,
    hi: u64,
    leaf: Leaf,
    comb: Comb,
) -> R
where
    R: Send + 'static,
    Leaf: Fn(&TaskCtx, u64, u64) -> R + Clone + Send + 'static,
    Comb: Fn(R, R) -> R + Clone + Send + 'static,
{
    if hi - lo <= cutoff {
        return leaf(ctx, lo, hi);
    }

    let tg = ctx.task_group_begin();
    let mid = lo + (hi - lo) / 2;
    let leaf2 = leaf.clone();
    let comb2 = comb.clone();
    let handle = ctx.fork_opts(
        ForkOpts::weighted((hi - mid) as f64, (mid - lo) as f64),
        move |c| parallel_leaf_driver(c, cutoff, mid, hi, leaf2, comb2),
    );
    let left = parallel_leaf_driver(ctx, cutoff, lo, mid, leaf.clone(), comb.clone());
    let right = ctx.join(handle);
    let result = comb(left, right);
    ctx.task_group_end(tg);
    result
}

/// Parallel reduction of a typed global span with `+`.
pub fn reduce<T>(ctx: &TaskCtx, policy: &ParallelPolicy, span: GlobalSpan<T>) -> T
where
    T: ByteRepr + std::ops::Add<Output = T>,
{
    transform_reduce(ctx, policy, span, T::default(), |a, b| a + b, |x| x)
}

/// Parallel transform-reduce of a typed global span.
pub fn transform_reduce<T, R, Comb, Tf>(
    ctx: &TaskCtx,
    policy: &ParallelPolicy,
    span: GlobalSpan<T>,
    identity: R,
    comb: Comb,
    transform: Tf,
) -> R
where
    T: ByteRepr,
    R: Clone + Send + 'static,
    Comb: Fn(R, R) -> R + Clone + Send + 'static,
    Tf: Fn(T) -> R + Clone + Send + 'static,
{
    if span.len == 0 {
        return identity;
    }
    let checkout = policy.checkout_count.max(1) as u64;
    let leaf = {
        let comb = comb.clone();
        let identity = identity.clone();
        move |ctx: &TaskCtx, lo: u64, hi: u64| -> R {
            let mut acc = identity.clone();
            let mut cursor = lo;
            while cursor < hi {
                let n = (hi - cursor).min(checkout);
                let cs = ctx.checkout(span.ptr.add(cursor), n as usize, CheckoutMode::Read);
                for v in cs.iter() {
                    acc = comb(acc, transform(*v));
                }
                cs.checkin();
                cursor += n;
            }
            acc
        }
    };
    parallel_leaf_driver(ctx, policy.cutoff_count.max(1) as u64, 0, span.len, leaf, comb)
}

/// Parallel transform-reduce handing each element's global pointer to the
/// transform, without checking the elements out (a no-access sentinel orders
/// the references). Used when leaves manage their own checkouts.
pub fn transform_reduce_ptr<T, R, Comb, Tf>(
    ctx: &TaskCtx,
    policy: &ParallelPolicy,
    span: GlobalSpan<T>,
    identity: R,
    comb: Comb,
    transform: Tf,
) -> R
where
    T: ByteRepr,
    R: Clone + Send + 'static,
    Comb: Fn(R, R) -> R + Clone + Send + 'static,
    Tf: Fn(&TaskCtx, GlobalPtr<T>) -> R + Clone + Send + 'static,
{
    if span.len == 0 {
        return identity;
    }
    let leaf = {
        let comb = comb.clone();
        let identity = identity.clone();
        move |ctx: &TaskCtx, lo: u64, hi: u64| -> R {
            let sentinel = ctx.checkout(span.ptr.add(lo), (hi - lo) as usize, CheckoutMode::NoAccess);
            let mut acc = identity.clone();
            for i in lo..hi {
                acc = comb(acc, transform(ctx, span.ptr.add(i)));
            }
            sentinel.checkin();
            acc
        }
    };
    parallel_leaf_driver(ctx, policy.cutoff_count.max(1) as u64, 0, span.len, leaf, comb)
}

/// Parallel for-each handing each element's global pointer to `f`.
pub fn for_each_ptr<T, F>(ctx: &TaskCtx, policy: &ParallelPolicy, span: GlobalSpan<T>, f: F)
where
    T: ByteRepr,
    F: Fn(&TaskCtx, GlobalPtr<T>) + Clone + Send + 'static,
{
    transform_reduce_ptr(ctx, policy, span, (), |(), ()| (), move |c, p| f(c, p));
}

/// Parallel in-place mutation of every element.
pub fn for_each_mut<T, F>(ctx: &TaskCtx, policy: &ParallelPolicy, span: GlobalSpan<T>, f: F)
where
    T: ByteRepr,
    F: Fn(&mut T) + Clone + Send + 'static,
{
    if span.len == 0 {
        return;
    }
    let checkout = policy.checkout_count.max(1) as u64;
    let leaf = move |ctx: &TaskCtx, lo: u64, hi: u64| {
        let mut cursor = lo;
        while cursor < hi {
            let n = (hi - cursor).min(checkout);
            let mut cs = ctx.checkout(span.ptr.add(cursor), n as usize, CheckoutMode::ReadWrite);
            for v in cs.iter_mut() {
                f(v);
            }
            cs.checkin();
            cursor += n;
        }
    };
    parallel_leaf_driver(
        ctx,
        policy.cutoff_count.max(1) as u64,
        0,
        span.len,
        leaf,
        |(), ()| (),
    );
}

/// Parallel in-place mutation receiving each element's position within the
/// span alongside its value.
pub fn for_each_indexed<T, F>(ctx: &TaskCtx, policy: &ParallelPolicy, span: GlobalSpan<T>, f: F)
where
    T: ByteRepr,
    F: Fn(u64, &mut T) + Clone + Send + 'static,
{
    if span.len == 0 {
        return;
    }
    let checkout = policy.checkout_count.max(1) as u64;
    let leaf = move |ctx: &TaskCtx, lo: u64, hi: u64| {
        let mut cursor = lo;
        while cursor < hi {
            let n = (hi - cursor).min(checkout);
            let mut cs = ctx.checkout(span.ptr.add(cursor), n as usize, CheckoutMode::ReadWrite);
            for (k, v) in cs.iter_mut().enumerate() {
                f(cursor + k as u64, v);
            }
            cs.checkin();
            cursor += n;
        }
    };
    parallel_leaf_driver(
        ctx,
        policy.cutoff_count.max(1) as u64,
        0,
        span.len,
        leaf,
        |(), ()| (),
    );
}

/// Parallel fill with a constant; write-only checkouts skip the fetch.
pub fn fill<T>(ctx: &TaskCtx, policy: &ParallelPolicy, span: GlobalSpan<T>, value: T)
where
    T: ByteRepr,
{
    fill_with(ctx, policy, span, 0, move |_| value);
}

/// Parallel fill from an index function; index `i` is relative to the span
/// start plus `base`.
pub fn fill_with<T, F>(
    ctx: &TaskCtx,
    policy: &ParallelPolicy,
    span: GlobalSpan<T>,
    base: u64,
    f: F,
) where
    T: ByteRepr,
    F: Fn(u64) -> T + Clone + Send + 'static,
{
    if span.len == 0 {
        return;
    }
    let checkout = policy.checkout_count.max(1) as u64;
    let leaf = move |ctx: &TaskCtx, lo: u64, hi: u64| {
        let mut cursor = lo;
        while cursor < hi {
            let n = (hi - cursor).min(checkout);
            let mut cs = ctx.checkout(span.ptr.add(cursor), n as usize, CheckoutMode::Write);
            for (k, v) in cs.iter_mut().enumerate() {
                *v = f(base + cursor + k as u64);
            }
            cs.checkin();
            cursor += n;
        }
    };
    parallel_leaf_driver(
        ctx,
        policy.cutoff_count.max(1) as u64,
        0,
        span.len,
        leaf,
        |(), ()| (),
    );
}

/// Serial in-place mutation with chunked checkouts; usable from any context.
pub fn for_each_seq<C, T, F>(ctx: &C, policy: &SequencedPolicy, span: GlobalSpan<T>, mut f: F)
where
    C: Ctx,
    T: ByteRepr,
    F: FnMut(&mut T),
{
    let checkout = policy.checkout_count.max(1) as u64;
    let mut cursor = 0;
    while cursor < span.len {
        let n = (span.len - cursor).min(checkout);
        let mut cs = ctx.checkout(span.ptr.add(cursor), n as usize, CheckoutMode::ReadWrite);
        for v in cs.iter_mut() {
            f(v);
        }
        cs.checkin();
        cursor += n;
    }
}

/// Serial fill with a constant.
pub fn fill_seq<C, T>(ctx: &C, policy: &SequencedPolicy, span: GlobalSpan<T>, value: T)
where
    C: Ctx,
    T: ByteRepr,
{
    fill_with_seq(ctx, policy, span, 0, move |_| value);
}

/// Serial fill from an index function.
pub fn fill_with_seq<C, T, F>(
    ctx: &C,
    policy: &SequencedPolicy,
    span: GlobalSpan<T>,
    base: u64,
    mut f: F,
) where
    C: Ctx,
    T: ByteRepr,
    F: FnMut(u64) -> T,
{
    let checkout = policy.checkout_count.max(1) as u64;
    let mut cursor = 0;
    while cursor < span.len {
        let n = (span.len - cursor).min(checkout);
        let mut cs = ctx.checkout(span.ptr.add(cursor), n as usize, CheckoutMode::Write);
        for (k, v) in cs.iter_mut().enumerate() {
            *v = f(base + cursor + k as u64);
        }
        cs.checkin();
        cursor += n;
    }
}

/// Serial element-wise copy from `src` to `dst`.
pub fn copy_seq<C, T>(ctx: &C, policy: &SequencedPolicy, src: GlobalSpan<T>, dst: GlobalPtr<T>)
where
    C: Ctx,
    T: ByteRepr,
{
    let checkout = policy.checkout_count.max(1) as u64;
    let mut cursor = 0;
    while cursor < src.len {
        let n = (src.len - cursor).min(checkout);
        let cs_src = ctx.checkout(src.ptr.add(cursor), n as usize, CheckoutMode::Read);
        let mut cs_dst = ctx.checkout(dst.add(cursor), n as usize, CheckoutMode::Write);
        cs_dst.copy_from_slice(&cs_src);
        cs_src.checkin();
        cs_dst.checkin();
        cursor += n;
    }
}
