//! Load-balance scenario: a recursive even split over N workers terminates
//! with every leaf on a distinct rank, observed through transport barrier
//! arrivals (a leaf blocks in the barrier until all N leaves arrived, which
//! only works if the scheduler spread them one per rank).

use weft::{Ctx, Runtime, TaskCtx};

fn lb(ctx: &TaskCtx, n: usize) {
    if n == 0 {
        return;
    }
    if n == 1 {
        ctx.barrier();
        return;
    }
    let half = n / 2;
    let th = ctx.fork(move |c| lb(c, half));
    lb(ctx, n - half);
    ctx.join(th);
}

#[test]
fn leaves_land_on_distinct_ranks() {
    let rt = Runtime::new(4).unwrap();
    let before = rt.barrier_arrivals();
    rt.spmd(|ctx| {
        let n = ctx.n_ranks();
        let _ = ctx.root_exec(move |c| lb(c, n));
    });
    let after = rt.barrier_arrivals();
    assert_eq!(
        after - before,
        4,
        "each worker must arrive at the barrier exactly once"
    );
    rt.assert_quiescent();
}

#[test]
fn two_rank_split() {
    let rt = Runtime::new(2).unwrap();
    let before = rt.barrier_arrivals();
    rt.spmd(|ctx| {
        let n = ctx.n_ranks();
        let _ = ctx.root_exec(move |c| lb(c, n));
    });
    assert_eq!(rt.barrier_arrivals() - before, 2);
    rt.assert_quiescent();
}
