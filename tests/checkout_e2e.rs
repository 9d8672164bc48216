//! Checkout/checkin behavior over live clusters: round-trip identity,
//! range-exact publication, collective allocation from the root task.

use weft::pattern::{self, ParallelPolicy};
use weft::{CheckoutMode, Ctx, GlobalPtr, GlobalVector, GlobalVectorOpts, Runtime};

#[test]
fn read_write_checkout_is_identity_on_untouched_memory() {
    let rt = Runtime::new(2).unwrap();
    rt.spmd(|ctx| {
        if ctx.rank() == 0 {
            let ptr: GlobalPtr<i64> = ctx.global_alloc(16);
            {
                let mut cs = ctx.checkout(ptr, 16, CheckoutMode::Write);
                for (i, v) in cs.iter_mut().enumerate() {
                    *v = i as i64;
                }
                cs.checkin();
            }
            {
                // Checkout and checkin with no writes: observable memory is
                // unchanged.
                let cs = ctx.checkout(ptr, 16, CheckoutMode::ReadWrite);
                assert_eq!(cs.len(), 16);
                cs.checkin();
            }
            let cs = ctx.checkout(ptr, 16, CheckoutMode::Read);
            for (i, v) in cs.iter().enumerate() {
                assert_eq!(*v, i as i64);
            }
            cs.checkin();
            ctx.global_free(ptr);
        }
        ctx.barrier();
    });
    rt.assert_quiescent();
}

#[test]
fn write_checkouts_publish_only_their_range() {
    let rt = Runtime::new(2).unwrap();
    rt.spmd(|ctx| {
        // Both ranks write disjoint halves of the same small segment; the
        // ranges share a block, so range-exact publication is what keeps the
        // halves from clobbering each other.
        let ptr: GlobalPtr<i64> = ctx.global_alloc_coll(8);
        let base = if ctx.rank() == 0 { 0 } else { 4 };
        let mut cs = ctx.checkout(ptr.add(base), 4, CheckoutMode::Write);
        for (i, v) in cs.iter_mut().enumerate() {
            *v = (base + i as u64) as i64 * 10;
        }
        cs.checkin();
        ctx.barrier();

        let cs = ctx.checkout(ptr, 8, CheckoutMode::Read);
        for (i, v) in cs.iter().enumerate() {
            assert_eq!(*v, i as i64 * 10);
        }
        cs.checkin();
        ctx.global_free_coll(ptr);
    });
    rt.assert_quiescent();
}

#[test]
fn checkout_complete_flushes_deferred_mappings() {
    let rt = Runtime::new(1).unwrap();
    rt.spmd(|ctx| {
        let ptr: GlobalPtr<i64> = ctx.global_alloc(4);
        let cs = ctx.checkout(ptr, 4, CheckoutMode::Read);
        ctx.checkout_complete();
        cs.checkin();
        ctx.global_free(ptr);
    });
    rt.assert_quiescent();
}

#[test]
fn collective_allocation_from_the_root_task() {
    let rt = Runtime::new(4).unwrap();
    rt.spmd(|ctx| {
        let _ = ctx.root_exec(|c| {
            // Allocation goes through collective execution: every rank's
            // scheduler participates while the root drives.
            let gv = GlobalVector::with_len(
                c,
                GlobalVectorOpts {
                    collective: true,
                    parallel_construct: true,
                    cutoff_count: 128,
                },
                1000,
                2i64,
            );
            let sum = pattern::reduce(c, &ParallelPolicy::with_counts(64), gv.as_span());
            assert_eq!(sum, 2000);
            let mut gv = gv;
            gv.destroy(c);
        });
    });
    rt.assert_quiescent();
}

#[test]
fn no_access_checkout_orders_without_mapping() {
    let rt = Runtime::new(1).unwrap();
    rt.spmd(|ctx| {
        let ptr: GlobalPtr<i64> = ctx.global_alloc(8);
        let sentinel = ctx.checkout(ptr, 8, CheckoutMode::NoAccess);
        // The sentinel grants no dereference; element access goes through a
        // nested real checkout.
        let mut cs = ctx.checkout(ptr.add(2), 1, CheckoutMode::Write);
        cs[0] = 42;
        cs.checkin();
        sentinel.checkin();

        let cs = ctx.checkout(ptr.add(2), 1, CheckoutMode::Read);
        assert_eq!(cs[0], 42);
        cs.checkin();
        ctx.global_free(ptr);
    });
    rt.assert_quiescent();
}
