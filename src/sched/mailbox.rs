//! One-slot cross-worker mailboxes.
//!
//! Each rank owns a single slot. A sender publishes one entry; the owner
//! claims it in its scheduler loop. A full slot is a transient condition: the
//! sender retries after letting its own scheduler make progress, which keeps
//! two mutually-sending ranks from wedging each other.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use crate::transport::{Rank, TransportError};

/// One single-entry mailbox per rank.
#[derive(Debug)]
pub struct OneslotMailbox<E: Copy> {
    slots: Vec<Slot<E>>,
}

#[derive(Debug)]
struct Slot<E> {
    entry: Mutex<Option<E>>,
    arrived: AtomicBool,
}

impl<E: Copy> OneslotMailbox<E> {
    /// Creates mailboxes for `n_ranks` ranks.
    #[must_use]
    pub fn new(n_ranks: usize) -> Self {
        Self {
            slots: (0..n_ranks)
                .map(|_| Slot {
                    entry: Mutex::new(None),
                    arrived: AtomicBool::new(false),
                })
                .collect(),
        }
    }

    /// Publishes `entry` to `target`. Fails when the slot is occupied.
    pub fn put(&self, entry: E, target: Rank) -> Result<(), TransportError> {
        let slot = &self.slots[target];
        let mut guard = slot.entry.lock().expect("mailbox lock poisoned");
        if guard.is_some() {
            return Err(TransportError::MailboxFull);
        }
        *guard = Some(entry);
        slot.arrived.store(true, Ordering::Release);
        Ok(())
    }

    /// Atomically claims the current entry, if any.
    pub fn pop(&self, rank: Rank) -> Option<E> {
        let slot = &self.slots[rank];
        if !slot.arrived.load(Ordering::Acquire) {
            return None;
        }
        let mut guard = slot.entry.lock().expect("mailbox lock poisoned");
        let entry = guard.take();
        if entry.is_some() {
            slot.arrived.store(false, Ordering::Release);
        }
        entry
    }

    /// Non-destructively peeks for an arrival.
    #[must_use]
    pub fn arrived(&self, rank: Rank) -> bool {
        self.slots[rank].arrived.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_pop_roundtrip() {
        let mb: OneslotMailbox<u32> = OneslotMailbox::new(2);
        assert!(!mb.arrived(1));
        mb.put(7, 1).unwrap();
        assert!(mb.arrived(1));
        assert!(!mb.arrived(0));
        assert_eq!(mb.pop(1), Some(7));
        assert!(!mb.arrived(1));
        assert_eq!(mb.pop(1), None);
    }

    #[test]
    fn full_slot_rejects_until_popped() {
        let mb: OneslotMailbox<u32> = OneslotMailbox::new(1);
        mb.put(1, 0).unwrap();
        assert_eq!(mb.put(2, 0), Err(TransportError::MailboxFull));
        assert_eq!(mb.pop(0), Some(1));
        mb.put(2, 0).unwrap();
        assert_eq!(mb.pop(0), Some(2));
    }
}
