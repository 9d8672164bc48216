//! One-sided communication primitives.
//!
//! The scheduler and memory layers are written against this module's surface:
//! typed windows with one-sided get/put, atomic windows with remote
//! load/store/CAS/fetch-add, a collective barrier, and a non-blocking
//! barrier used for cooperative termination. This realization hosts all ranks
//! in one process and backs windows with shared buffers; a networked port
//! re-implements this module and nothing else.
//!
//! The barrier counts arrivals, which end-to-end tests use to observe how
//! many times tasks reached a collective point.

pub mod error;
pub mod window;

pub use error::TransportError;
pub use window::{AtomicWindow, Window};

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex};

/// A worker rank.
pub type Rank = usize;

/// In-process communicator over a fixed set of ranks.
#[derive(Debug)]
pub struct Comm {
    n_ranks: usize,
    barrier: GenerationBarrier,
    nb_barrier: NonBlockingBarrier,
    barrier_arrivals: AtomicUsize,
}

impl Comm {
    /// Creates a communicator spanning `n_ranks` workers.
    #[must_use]
    pub fn new(n_ranks: usize) -> Self {
        Self {
            n_ranks,
            barrier: GenerationBarrier::new(n_ranks),
            nb_barrier: NonBlockingBarrier::new(n_ranks),
            barrier_arrivals: AtomicUsize::new(0),
        }
    }

    /// Returns the number of ranks in the communicator.
    #[must_use]
    pub const fn n_ranks(&self) -> usize {
        self.n_ranks
    }

    /// Collective barrier; blocks until every rank has arrived.
    pub fn barrier(&self) {
        self.barrier_arrivals.fetch_add(1, Ordering::Relaxed);
        self.barrier.wait();
    }

    /// Total number of barrier arrivals so far (test observability).
    #[must_use]
    pub fn barrier_arrival_count(&self) -> usize {
        self.barrier_arrivals.load(Ordering::Relaxed)
    }

    /// Arrives at the non-blocking barrier, returning a testable handle.
    #[must_use]
    pub fn nb_barrier_arrive(&self) -> NbBarrierHandle {
        self.nb_barrier.arrive()
    }

    /// Returns true once every rank arrived at the handle's barrier round.
    #[must_use]
    pub fn nb_barrier_test(&self, handle: &NbBarrierHandle) -> bool {
        self.nb_barrier.generation.load(Ordering::SeqCst) >= handle.target
    }
}

/// Reusable generation-counting barrier.
#[derive(Debug)]
struct GenerationBarrier {
    n: usize,
    state: Mutex<(usize, u64)>, // (arrived, generation)
    cond: Condvar,
}

impl GenerationBarrier {
    fn new(n: usize) -> Self {
        Self {
            n,
            state: Mutex::new((0, 0)),
            cond: Condvar::new(),
        }
    }

    fn wait(&self) {
        let mut st = self.state.lock().expect("barrier lock poisoned");
        let gen = st.1;
        st.0 += 1;
        if st.0 == self.n {
            st.0 = 0;
            st.1 = st.1.wrapping_add(1);
            self.cond.notify_all();
        } else {
            while st.1 == gen {
                st = self.cond.wait(st).expect("barrier wait poisoned");
            }
        }
    }
}

/// Non-blocking barrier: ranks arrive once, then poll for completion.
#[derive(Debug)]
struct NonBlockingBarrier {
    n: usize,
    arrived: AtomicUsize,
    generation: AtomicU64,
}

impl NonBlockingBarrier {
    fn new(n: usize) -> Self {
        Self {
            n,
            arrived: AtomicUsize::new(0),
            generation: AtomicU64::new(0),
        }
    }

    fn arrive(&self) -> NbBarrierHandle {
        let target = self.generation.load(Ordering::SeqCst) + 1;
        let count = self.arrived.fetch_add(1, Ordering::SeqCst) + 1;
        if count == self.n {
            self.arrived.store(0, Ordering::SeqCst);
            self.generation.fetch_add(1, Ordering::SeqCst);
        }
        NbBarrierHandle { target }
    }
}

/// Handle returned by [`Comm::nb_barrier_arrive`]; poll it with
/// [`Comm::nb_barrier_test`].
#[derive(Debug)]
pub struct NbBarrierHandle {
    target: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn barrier_releases_all_ranks() {
        let comm = Arc::new(Comm::new(4));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let c = Arc::clone(&comm);
            handles.push(thread::spawn(move || {
                c.barrier();
                c.barrier();
            }));
        }
        for h in handles {
            h.join().expect("barrier thread");
        }
        assert_eq!(comm.barrier_arrival_count(), 8);
    }

    #[test]
    fn nb_barrier_completes_after_all_arrive() {
        let comm = Comm::new(2);
        let h0 = comm.nb_barrier_arrive();
        assert!(
            !comm.nb_barrier_test(&h0),
            "one arrival must not complete a 2-rank barrier"
        );
        let h1 = comm.nb_barrier_arrive();
        assert!(comm.nb_barrier_test(&h0));
        assert!(comm.nb_barrier_test(&h1));
    }

    #[test]
    fn nb_barrier_rounds_are_independent() {
        let comm = Comm::new(2);
        let a0 = comm.nb_barrier_arrive();
        let a1 = comm.nb_barrier_arrive();
        assert!(comm.nb_barrier_test(&a0) && comm.nb_barrier_test(&a1));

        let b0 = comm.nb_barrier_arrive();
        assert!(
            !comm.nb_barrier_test(&b0),
            "new round must wait for fresh arrivals"
        );
        let b1 = comm.nb_barrier_arrive();
        assert!(comm.nb_barrier_test(&b0) && comm.nb_barrier_test(&b1));
    }

    #[test]
    fn single_rank_nb_barrier_completes_immediately() {
        let comm = Comm::new(1);
        let h = comm.nb_barrier_arrive();
        assert!(comm.nb_barrier_test(&h));
    }
}
