//! Transaction log record model.
//!
//! The log holds exactly two kinds of immutable records: prepares (one staged
//! event each, carrying the transaction's expected version) and commits (one per
//! transaction, assigning the contiguous event-number range). [`LogRecord`] is
//! the closed sum over both; every consumer matches it exhaustively.

use bytes::Bytes;
use uuid::Uuid;

/// Bitset of prepare record flags.
///
/// Flags are combined with `|`. A single-event transaction carries both
/// [`PrepareFlags::TRANSACTION_BEGIN`] and [`PrepareFlags::TRANSACTION_END`] on
/// its one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrepareFlags(u16);

impl PrepareFlags {
    /// No flags set.
    pub const NONE: PrepareFlags = PrepareFlags(0);
    /// The record carries event data.
    pub const DATA: PrepareFlags = PrepareFlags(1 << 0);
    /// First prepare of its transaction.
    pub const TRANSACTION_BEGIN: PrepareFlags = PrepareFlags(1 << 1);
    /// Last prepare of its transaction.
    pub const TRANSACTION_END: PrepareFlags = PrepareFlags(1 << 2);
    /// Reserved for single-phase appends where the prepare is committed as
    /// written. Never set by the current writer, which always runs the
    /// explicit prepare/commit sequence.
    pub const IS_COMMITTED: PrepareFlags = PrepareFlags(1 << 3);
    /// The transaction deletes (tombstones) its stream.
    pub const STREAM_DELETE: PrepareFlags = PrepareFlags(1 << 4);

    /// Returns true if every flag in `other` is set in `self`.
    pub fn contains(self, other: PrepareFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// Raw bits, for the on-disk encoding.
    pub fn bits(self) -> u16 {
        self.0
    }

    /// Reconstruct from raw bits. Unknown bits are preserved so that records
    /// written by a newer format revision survive a round trip.
    pub fn from_bits(bits: u16) -> PrepareFlags {
        PrepareFlags(bits)
    }
}

impl std::ops::BitOr for PrepareFlags {
    type Output = PrepareFlags;

    fn bitor(self, rhs: PrepareFlags) -> PrepareFlags {
        PrepareFlags(self.0 | rhs.0)
    }
}

/// A prepare record: one event staged for commit.
///
/// All prepares sharing a `transaction_position` belong to one transaction and
/// share `event_stream_id` and `expected_version`. The prepare alone has no
/// effect on stream versions -- it becomes an event only when a commit record
/// covers its transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct PrepareLogRecord {
    /// Byte address of this record in the log, assigned at append time.
    pub log_position: u64,
    /// Log position of the first prepare of this record's transaction.
    /// Equals `log_position` for the first prepare.
    pub transaction_position: u64,
    /// Zero-based ordinal of this prepare within its transaction.
    pub transaction_offset: u32,
    /// Raw expected-version encoding: -1 "stream must not exist", -2 "any",
    /// n >= 0 "stream must be at exactly n". Identical for every prepare of
    /// one transaction.
    pub expected_version: i64,
    /// Stream the staged event targets.
    pub event_stream_id: String,
    /// Client-assigned unique event ID, the idempotency key.
    pub event_id: Uuid,
    /// Event type tag.
    pub event_type: String,
    /// Opaque domain event body.
    pub data: Bytes,
    /// Opaque metadata bytes.
    pub metadata: Bytes,
    /// Unix epoch milliseconds at prepare time.
    pub timestamp: u64,
    /// Record flags.
    pub flags: PrepareFlags,
}

impl PrepareLogRecord {
    /// True for the first prepare of a transaction.
    pub fn is_transaction_begin(&self) -> bool {
        self.flags.contains(PrepareFlags::TRANSACTION_BEGIN)
    }

    /// True for the last prepare of a transaction.
    pub fn is_transaction_end(&self) -> bool {
        self.flags.contains(PrepareFlags::TRANSACTION_END)
    }

    /// True if the record carries event data.
    pub fn has_data(&self) -> bool {
        self.flags.contains(PrepareFlags::DATA)
    }

    /// True if the transaction deletes its stream.
    pub fn is_stream_delete(&self) -> bool {
        self.flags.contains(PrepareFlags::STREAM_DELETE)
    }
}

/// A commit record: finalizes one transaction, assigning its event numbers.
///
/// `first_event_number` is the number assigned to the transaction's first data
/// prepare; the transaction occupies `first_event_number ..
/// first_event_number + event_count - 1` inclusive. A transaction is committed
/// at most once.
#[derive(Debug, Clone, PartialEq)]
pub struct CommitLogRecord {
    /// Byte address of this record in the log, assigned at append time.
    pub log_position: u64,
    /// Log position of the first prepare of the committed transaction.
    pub transaction_position: u64,
    /// Stream the committed transaction targets.
    pub event_stream_id: String,
    /// Event number assigned to the transaction's first prepare.
    pub first_event_number: i64,
    /// Number of events the transaction commits.
    pub event_count: u32,
    /// Unix epoch milliseconds at commit time.
    pub timestamp: u64,
}

/// A record in the transaction log.
#[derive(Debug, Clone, PartialEq)]
pub enum LogRecord {
    /// An event staged for commit.
    Prepare(PrepareLogRecord),
    /// A transaction finalization.
    Commit(CommitLogRecord),
}

impl LogRecord {
    /// Byte address of the record in the log.
    pub fn log_position(&self) -> u64 {
        match self {
            LogRecord::Prepare(p) => p.log_position,
            LogRecord::Commit(c) => c.log_position,
        }
    }
}
