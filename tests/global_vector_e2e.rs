//! Global vector end-to-end scenarios over four ranks: collective
//! construction and reduction, resizing, per-rank vectors nested inside a
//! collective vector, and initializer-slice reduction.

use weft::pattern::{self, ParallelPolicy, SequencedPolicy};
use weft::{CheckoutMode, Ctx, GlobalVector, GlobalVectorOpts, Runtime, TaskCtx};

const N: u64 = 10_000;

fn coll_opts(cutoff: usize) -> GlobalVectorOpts {
    GlobalVectorOpts {
        collective: true,
        parallel_construct: true,
        cutoff_count: cutoff,
    }
}

#[test]
fn collective_vector_reduce() {
    let rt = Runtime::new(4).unwrap();
    rt.spmd(|ctx| {
        let gv = GlobalVector::from_fn(ctx, coll_opts(256), N, |i| i as i64);
        assert!(!gv.is_empty());
        assert_eq!(gv.len(), N);
        assert!(gv.capacity() >= N);

        let sum = ctx.root_exec(move |c| {
            pattern::reduce(c, &ParallelPolicy::with_counts(128), gv.as_span())
        });
        if ctx.rank() == 0 {
            assert_eq!(sum, Some((N * (N - 1) / 2) as i64));
        }

        let mut gv = gv;
        gv.destroy(ctx);
    });
    rt.assert_quiescent();
}

#[test]
fn resize_then_sum() {
    let rt = Runtime::new(4).unwrap();
    rt.spmd(|ctx| {
        let mut gv = GlobalVector::from_fn(ctx, coll_opts(256), N, |i| i as i64);

        gv.resize_with(ctx, 5 * N, 3);
        let grown = gv;
        let sum = ctx.root_exec(move |c| {
            pattern::reduce(c, &ParallelPolicy::with_counts(128), grown.as_span())
        });
        if ctx.rank() == 0 {
            let expected = (N * (N - 1) / 2 + 4 * N * 3) as i64;
            assert_eq!(sum, Some(expected), "fill value must cover the new tail");
        }

        gv.resize(ctx, 25_000);
        let shrunk = gv;
        let sum = ctx.root_exec(move |c| {
            pattern::reduce(c, &ParallelPolicy::with_counts(128), shrunk.as_span())
        });
        if ctx.rank() == 0 {
            let expected = (N * (N - 1) / 2 + 15_000 * 3) as i64;
            assert_eq!(sum, Some(expected), "shrinking must drop the tail only");
        }

        gv.destroy(ctx);
    });
    rt.assert_quiescent();
}

#[test]
fn per_rank_vectors_inside_a_collective_vector() {
    let rt = Runtime::new(4).unwrap();
    rt.spmd(|ctx| {
        let n_ranks = ctx.n_ranks() as u64;

        let outer_opts = GlobalVectorOpts {
            collective: true,
            parallel_construct: false,
            cutoff_count: 16,
        };
        let gvs: GlobalVector<GlobalVector<i64>> =
            GlobalVector::with_len(ctx, outer_opts, n_ranks, GlobalVector::default());

        // Every rank builds its own vector and stores the handle.
        let mut local = GlobalVector::new(GlobalVectorOpts::default());
        for i in 0..N {
            local.push_back(ctx, i as i64);
        }
        gvs.set(ctx, ctx.rank() as u64, local);
        ctx.barrier();

        let _ = ctx.root_exec(move |c| {
            let check_sum = |c: &TaskCtx, expected: i64| {
                let total = pattern::transform_reduce_ptr(
                    c,
                    &ParallelPolicy::with_counts(1),
                    gvs.as_span(),
                    0i64,
                    |a, b| a + b,
                    |t, eptr| {
                        let cs = t.checkout(eptr, 1, CheckoutMode::Read);
                        let inner = cs[0];
                        cs.checkin();
                        pattern::reduce(t, &ParallelPolicy::with_counts(128), inner.as_span())
                    },
                );
                assert_eq!(total, expected);
            };

            check_sum(c, (N * (N - 1) / 2 * n_ranks) as i64);

            // Grow every per-rank vector in place: push/pop churn, then
            // resize to 2N with the upper half holding ascending indices.
            pattern::for_each_ptr(
                c,
                &ParallelPolicy::with_counts(1),
                gvs.as_span(),
                move |t, eptr| {
                    let mut cs = t.checkout(eptr, 1, CheckoutMode::ReadWrite);
                    let mut inner = cs[0];
                    for i in 0..100 {
                        inner.push_back(t, i);
                    }
                    for _ in 0..100 {
                        inner.pop_back(t);
                    }
                    inner.resize(t, 2 * N);
                    pattern::fill_with_seq(
                        t,
                        &SequencedPolicy { checkout_count: 128 },
                        inner.as_span().slice(N, 2 * N),
                        N,
                        |i| i as i64,
                    );
                    cs[0] = inner;
                    cs.checkin();
                },
            );

            check_sum(c, ((2 * N) * (2 * N - 1) / 2 * n_ranks) as i64);
        });

        // Tear down: each rank frees the vector stored in its slot (the
        // handle may have been reallocated, so re-read it), then the outer
        // vector goes collectively.
        ctx.barrier();
        let mut inner = gvs.get(ctx, ctx.rank() as u64);
        inner.destroy(ctx);
        ctx.barrier();
        let mut gvs = gvs;
        gvs.destroy(ctx);
    });
    rt.assert_quiescent();
}

#[test]
fn indexed_for_each_rewrites_by_position() {
    let rt = Runtime::new(4).unwrap();
    rt.spmd(|ctx| {
        let gv = GlobalVector::with_len(ctx, coll_opts(128), 2_000, 1i64);
        let sum = ctx.root_exec(move |c| {
            pattern::for_each_indexed(
                c,
                &ParallelPolicy::with_counts(64),
                gv.as_span(),
                |i, v| *v += i as i64,
            );
            pattern::reduce(c, &ParallelPolicy::with_counts(64), gv.as_span())
        });
        if ctx.rank() == 0 {
            let n = 2_000i64;
            assert_eq!(sum, Some(n + n * (n - 1) / 2), "each slot holds 1 + its index");
        }
        let mut gv = gv;
        gv.destroy(ctx);
    });
    rt.assert_quiescent();
}

#[test]
fn slice_initialized_product() {
    let rt = Runtime::new(4).unwrap();
    rt.spmd(|ctx| {
        let _ = ctx.root_exec(|c| {
            let mut v =
                GlobalVector::from_slice(c, GlobalVectorOpts::default(), &[1i64, 2, 3, 4, 5]);
            let product = pattern::transform_reduce(
                c,
                &ParallelPolicy::with_counts(2),
                v.as_span(),
                1i64,
                |a, b| a * b,
                |x| x,
            );
            assert_eq!(product, 120);
            v.destroy(c);
        });
    });
    rt.assert_quiescent();
}

#[test]
fn push_pop_get_set_roundtrip() {
    let rt = Runtime::new(1).unwrap();
    rt.spmd(|ctx| {
        let mut v = GlobalVector::new(GlobalVectorOpts::default());
        assert!(v.is_empty());
        for i in 0..100 {
            v.push_back(ctx, i as i64);
        }
        assert_eq!(v.len(), 100);
        assert!(v.capacity() >= 100);
        assert_eq!(v.get(ctx, 7), 7);
        v.set(ctx, 7, -7);
        assert_eq!(v.get(ctx, 7), -7);
        assert_eq!(v.pop_back(ctx), 99);
        assert_eq!(v.len(), 99);

        let dup = v.duplicate(ctx);
        assert_eq!(dup.len(), 99);
        assert_eq!(dup.get(ctx, 7), -7);

        v.clear();
        assert!(v.is_empty());
        assert!(v.capacity() >= 100, "clear keeps reserved memory");

        let mut dup = dup;
        dup.destroy(ctx);
        v.destroy(ctx);
    });
    rt.assert_quiescent();
}
