//! Stream index: last committed event numbers, tombstones, and the
//! committed-transaction registry.
//!
//! The index is derived exclusively from commit records applied in log order --
//! never from prepares. A stream that has only uncommitted prepares is
//! indistinguishable from a stream that was never written: its current version
//! is [`NO_STREAM`]. This is what gives commit validation its
//! single-writer-wins semantics.
//!
//! The index is owned by whoever wraps it (the writer task holds it behind an
//! `Arc<RwLock<...>>` shared with [`ReadIndex`](crate::reader::ReadIndex));
//! [`StreamIndex::apply_commit`] is the single mutation point, so one write
//! guard covers the commit becoming observable and the version advancing.

use std::collections::HashMap;

use uuid::Uuid;

use crate::record::{CommitLogRecord, PrepareLogRecord};
use crate::types::{DELETED_STREAM, NO_STREAM};

/// Per-stream index state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamIndexEntry {
    /// Last committed event number, [`NO_STREAM`] if none yet.
    pub last_event_number: i64,
    /// Tombstone: set by a stream-delete commit, never cleared.
    pub is_deleted: bool,
    /// Log position of the prepare holding event `n`, at index `n`.
    pub positions: Vec<u64>,
}

impl StreamIndexEntry {
    fn empty() -> StreamIndexEntry {
        StreamIndexEntry {
            last_event_number: NO_STREAM,
            is_deleted: false,
            positions: Vec::new(),
        }
    }
}

/// Registry record of one committed transaction, keyed by its transaction
/// position.
///
/// This is the evidence consulted by the idempotency branch of commit
/// validation: a re-check of an already-committed transaction matches on the
/// event-id sequence and is re-acknowledged with the originally assigned
/// numbers; a mismatch at the same position is a data-integrity failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommittedTransaction {
    /// Event number assigned to the transaction's first prepare.
    pub first_event_number: i64,
    /// Number of events the transaction committed.
    pub event_count: u32,
    /// Event ids of the transaction's data prepares, in transaction order.
    pub event_ids: Vec<Uuid>,
}

/// Mapping from stream id to committed version state, plus the
/// committed-transaction registry and the global commit order.
#[derive(Debug, Default)]
pub struct StreamIndex {
    /// Stream id -> index entry. Entries are created on first commit and never
    /// removed (deletion tombstones them).
    streams: HashMap<String, StreamIndexEntry>,
    /// Transaction position -> committed transaction.
    transactions: HashMap<u64, CommittedTransaction>,
    /// Prepare log positions of all committed events, in commit order.
    /// Index `i` = the event at global position `i`.
    committed: Vec<u64>,
    /// Reverse mapping: prepare log position -> global commit-order position.
    global_of: HashMap<u64, u64>,
}

impl StreamIndex {
    /// Create an empty index.
    pub fn new() -> StreamIndex {
        StreamIndex::default()
    }

    /// Current version of a stream: the last committed event number,
    /// [`NO_STREAM`] if the stream has no committed events, or
    /// [`DELETED_STREAM`] if it has been tombstoned.
    pub fn last_event_number(&self, stream_id: &str) -> i64 {
        match self.streams.get(stream_id) {
            Some(entry) if entry.is_deleted => DELETED_STREAM,
            Some(entry) => entry.last_event_number,
            None => NO_STREAM,
        }
    }

    /// Whether the stream has been tombstoned.
    pub fn is_deleted(&self, stream_id: &str) -> bool {
        self.streams
            .get(stream_id)
            .map(|entry| entry.is_deleted)
            .unwrap_or(false)
    }

    /// The raw index entry for a stream, if any commit has touched it.
    pub fn entry(&self, stream_id: &str) -> Option<&StreamIndexEntry> {
        self.streams.get(stream_id)
    }

    /// The committed transaction at a transaction position, if one exists.
    pub fn committed_transaction(&self, transaction_position: u64) -> Option<&CommittedTransaction> {
        self.transactions.get(&transaction_position)
    }

    /// Number of committed events across all streams.
    pub fn committed_count(&self) -> u64 {
        self.committed.len() as u64
    }

    /// Global commit-order position of a committed prepare, if the prepare at
    /// this log position has been covered by a commit.
    pub fn global_position_of(&self, log_position: u64) -> Option<u64> {
        self.global_of.get(&log_position).copied()
    }

    /// Prepare positions of committed events in global commit order, starting
    /// at `from` (a global position), at most `max` entries.
    pub fn committed_range(&self, from: u64, max: u64) -> &[u64] {
        let len = self.committed.len() as u64;
        let start = from.min(len);
        let end = from.saturating_add(max).min(len);
        &self.committed[start as usize..end as usize]
    }

    /// Iterate all stream entries.
    pub fn streams(&self) -> impl Iterator<Item = (&String, &StreamIndexEntry)> {
        self.streams.iter()
    }

    /// Apply one commit record together with the prepares of its transaction.
    ///
    /// Advances the stream entry, extends the global commit order, and records
    /// the transaction in the registry -- the caller holds one write guard
    /// across all three, so no reader observes a commit without its index
    /// update or vice versa.
    ///
    /// Applying the same transaction position twice is a no-op: recovery
    /// replays commits in log order and must tolerate restarts.
    ///
    /// A stream-delete commit sets the tombstone and does not otherwise
    /// advance numbering.
    pub fn apply_commit(&mut self, commit: &CommitLogRecord, prepares: &[PrepareLogRecord]) {
        if self.transactions.contains_key(&commit.transaction_position) {
            return;
        }

        let entry = self
            .streams
            .entry(commit.event_stream_id.clone())
            .or_insert_with(StreamIndexEntry::empty);

        let is_delete = prepares.iter().any(|p| p.is_stream_delete());
        let mut event_ids = Vec::with_capacity(prepares.len());

        if is_delete {
            entry.is_deleted = true;
            for prepare in prepares {
                event_ids.push(prepare.event_id);
            }
        } else {
            debug_assert_eq!(
                commit.first_event_number,
                entry.last_event_number + 1,
                "commit numbering must be contiguous per stream"
            );
            for prepare in prepares.iter().filter(|p| p.has_data()) {
                entry.positions.push(prepare.log_position);
                self.global_of
                    .insert(prepare.log_position, self.committed.len() as u64);
                self.committed.push(prepare.log_position);
                event_ids.push(prepare.event_id);
            }
            entry.last_event_number = commit.first_event_number + commit.event_count as i64 - 1;
        }

        self.transactions.insert(
            commit.transaction_position,
            CommittedTransaction {
                first_event_number: commit.first_event_number,
                event_count: commit.event_count,
                event_ids,
            },
        );
    }
}
