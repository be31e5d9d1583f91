//! Log position checkpoints.
//!
//! A [`Checkpoint`] is a strictly non-decreasing position marker with two read
//! modes: `read_non_flushed()` includes every record appended so far in this
//! process (used for same-process read-your-writes), while `read_flushed()`
//! only reflects positions that have been made durable by an fsync (used when
//! the caller needs a durability guarantee before acknowledging).
//!
//! Only the log writer advances a checkpoint: once per appended record
//! (non-flushed) and once per flush (flushed). Readers treat a checkpoint value
//! as the exclusive upper bound of visible log content.

use std::sync::atomic::{AtomicU64, Ordering};

/// A monotonically increasing, flush-aware log position marker.
///
/// Both readings start at the position the checkpoint was created with and
/// never decrease. `read_flushed() <= read_non_flushed()` holds at all times.
#[derive(Debug)]
pub struct Checkpoint {
    /// Diagnostic name, e.g. `"writer"`.
    name: &'static str,
    /// Highest position appended, possibly not yet durable.
    non_flushed: AtomicU64,
    /// Highest position guaranteed durable.
    flushed: AtomicU64,
}

impl Checkpoint {
    /// Create a checkpoint with both readings at `initial`.
    pub fn new(name: &'static str, initial: u64) -> Checkpoint {
        Checkpoint {
            name,
            non_flushed: AtomicU64::new(initial),
            flushed: AtomicU64::new(initial),
        }
    }

    /// Diagnostic name of this checkpoint.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Advance the non-flushed reading to `position`.
    ///
    /// # Panics
    ///
    /// Panics if `position` is below the current non-flushed reading. Positions
    /// are assigned by a single monotonic allocator; a regression here means
    /// log state has been corrupted and continuing would misorder records.
    pub fn write(&self, position: u64) {
        let previous = self.non_flushed.swap(position, Ordering::Release);
        assert!(
            previous <= position,
            "checkpoint {} moved backwards: {previous} -> {position}",
            self.name
        );
    }

    /// Mark everything appended so far as durable.
    ///
    /// Called by the log writer immediately after a successful fsync.
    pub fn flush(&self) {
        let current = self.non_flushed.load(Ordering::Acquire);
        self.flushed.store(current, Ordering::Release);
    }

    /// Highest position appended in this process, including records not yet
    /// fsynced.
    pub fn read_non_flushed(&self) -> u64 {
        self.non_flushed.load(Ordering::Acquire)
    }

    /// Highest position guaranteed durable.
    pub fn read_flushed(&self) -> u64 {
        self.flushed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_checkpoint_reads_initial_in_both_modes() {
        let cp = Checkpoint::new("writer", 8);
        assert_eq!(cp.read_non_flushed(), 8);
        assert_eq!(cp.read_flushed(), 8);
        assert_eq!(cp.name(), "writer");
    }

    #[test]
    fn write_advances_only_non_flushed() {
        let cp = Checkpoint::new("writer", 8);
        cp.write(96);
        assert_eq!(cp.read_non_flushed(), 96);
        assert_eq!(cp.read_flushed(), 8);
    }

    #[test]
    fn flush_equalizes_readings() {
        let cp = Checkpoint::new("writer", 8);
        cp.write(96);
        cp.write(200);
        cp.flush();
        assert_eq!(cp.read_flushed(), 200);
        assert_eq!(cp.read_non_flushed(), 200);
    }

    #[test]
    fn write_to_same_position_is_allowed() {
        let cp = Checkpoint::new("writer", 64);
        cp.write(64);
        assert_eq!(cp.read_non_flushed(), 64);
    }

    #[test]
    #[should_panic(expected = "moved backwards")]
    fn write_backwards_panics() {
        let cp = Checkpoint::new("writer", 100);
        cp.write(50);
    }

    #[test]
    fn flushed_never_exceeds_non_flushed() {
        let cp = Checkpoint::new("writer", 0);
        for pos in [10u64, 25, 110, 4096] {
            cp.write(pos);
            assert!(cp.read_flushed() <= cp.read_non_flushed());
            cp.flush();
            assert_eq!(cp.read_flushed(), pos);
        }
    }
}
