//! Internal utilities.
//!
//! - [`DetRng`]: deterministic xorshift64 PRNG for steal-target selection
//! - [`SlotArena`]: generation-checked slot arena whose stale-handle test
//!   implements the remote-free protocol of the remotable allocators

pub mod det_rng;
pub mod slots;

pub use det_rng::DetRng;
pub use slots::{SlotArena, SlotHandle};

/// Returns the smallest power of two that is `>= n`.
#[must_use]
pub fn next_pow2(n: usize) -> usize {
    n.next_power_of_two()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_pow2_values() {
        assert_eq!(next_pow2(1), 1);
        assert_eq!(next_pow2(2), 2);
        assert_eq!(next_pow2(3), 4);
        assert_eq!(next_pow2(4), 4);
        assert_eq!(next_pow2(5), 8);
        assert_eq!(next_pow2(1000), 1024);
    }
}
