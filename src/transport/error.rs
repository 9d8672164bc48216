//! Transport layer errors.

use thiserror::Error;

/// Errors surfaced by the transport primitives.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum TransportError {
    /// A one-slot mailbox already holds an undelivered entry.
    #[error("mailbox slot occupied")]
    MailboxFull,

    /// A window access fell outside the target buffer.
    #[error("window access out of bounds: index {index}, length {len}")]
    OutOfBounds {
        /// First out-of-range index.
        index: usize,
        /// Buffer length on the target rank.
        len: usize,
    },

    /// The target rank does not exist in this communicator.
    #[error("rank {rank} out of range (communicator has {n_ranks} ranks)")]
    NoSuchRank {
        /// Requested rank.
        rank: usize,
        /// Communicator size.
        n_ranks: usize,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_messages() {
        assert_eq!(TransportError::MailboxFull.to_string(), "mailbox slot occupied");
        let e = TransportError::NoSuchRank { rank: 7, n_ranks: 4 };
        assert_eq!(e.to_string(), "rank 7 out of range (communicator has 4 ranks)");
    }
}
