//! Commit admission validation.
//!
//! [`check_commit_starting_at`] decides whether the transaction starting at a
//! given log position may be committed, as of a read bound. It is a pure query:
//! it accumulates the transaction's prepares from the mirror, consults the
//! stream index and the committed-transaction registry, and returns a
//! [`CommitCheckResult`] -- it never mutates anything, never blocks, and is
//! safely callable concurrently and repeatedly. Expected outcomes (conflicts,
//! deleted streams, incomplete transactions) are decision values, not errors.
//!
//! The decisive property of the algorithm is that it reads *committed* state
//! only: uncommitted sibling transactions targeting the same stream are
//! invisible, so any number of them independently validate `Ok` against the
//! same current version, and whichever commits first wins. Every later check
//! then sees the advanced version and correctly reports a conflict -- or an
//! idempotent replay, if the transaction under check is the one that won.

use crate::accumulator::{accumulate_transaction, TransactionAccumulation};
use crate::index::StreamIndex;
use crate::record::PrepareLogRecord;
use crate::store::LogMirror;
use crate::types::{DELETED_STREAM, EXPECTED_ANY, NO_STREAM};

/// Decision produced by a commit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitDecision {
    /// The transaction may be committed now.
    Ok,
    /// Genuine optimistic-concurrency conflict. Surfaced to the original
    /// caller as a rejected write; never retried automatically.
    WrongExpectedVersion,
    /// The target stream is tombstoned. Permanent.
    StreamDeleted,
    /// The transaction was already committed with identical content; safe to
    /// re-acknowledge with the originally assigned numbers.
    Idempotent,
    /// The transaction position was committed with *different* content.
    /// Fatal data-integrity failure: the caller must halt, not resolve it.
    CorruptedIdempotency,
    /// The transaction is incomplete or absent as of the read bound.
    /// Retryable once more of the log is visible; not a permanent failure.
    InvalidTransaction,
}

/// Result of a commit check. Not persisted.
///
/// `start_event_number` / `end_event_number` describe the inclusive range the
/// transaction would occupy (for `Ok` on a stream with committed history) or
/// did occupy (for `Idempotent`). Both are -1 when the decision carries no
/// range: rejections, incomplete transactions, empty transactions, and `Ok`
/// against a stream with no committed events, whose numbers are assigned at
/// commit time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitCheckResult {
    /// The decision.
    pub decision: CommitDecision,
    /// Stream the checked transaction targets. Empty when the transaction
    /// could not be resolved at all.
    pub event_stream_id: String,
    /// Committed version found in the index at check time.
    pub current_version: i64,
    /// First event number of the range, or -1.
    pub start_event_number: i64,
    /// Last event number of the range (inclusive), or -1.
    pub end_event_number: i64,
}

impl CommitCheckResult {
    fn unresolved(decision: CommitDecision, event_stream_id: String) -> CommitCheckResult {
        CommitCheckResult {
            decision,
            event_stream_id,
            current_version: NO_STREAM,
            start_event_number: -1,
            end_event_number: -1,
        }
    }
}

/// Event ids a commit of these prepares would record, in transaction order.
fn data_event_ids(prepares: &[PrepareLogRecord]) -> Vec<uuid::Uuid> {
    prepares
        .iter()
        .filter(|p| p.has_data())
        .map(|p| p.event_id)
        .collect()
}

/// Decide whether the transaction starting at `transaction_position` may be
/// committed, as of `read_bound`.
///
/// The mirror and index guards are borrowed from whoever owns the shared
/// state -- typically [`ReadIndex`](crate::reader::ReadIndex), which acquires
/// both read locks and delegates here.
pub fn check_commit_starting_at(
    mirror: &LogMirror,
    index: &StreamIndex,
    transaction_position: u64,
    read_bound: u64,
) -> CommitCheckResult {
    // Step 1: materialize the transaction's prepares.
    let prepares = match accumulate_transaction(mirror, transaction_position, read_bound) {
        TransactionAccumulation::Complete(prepares) => prepares,
        TransactionAccumulation::NotFound => {
            return CommitCheckResult::unresolved(CommitDecision::InvalidTransaction, String::new());
        }
        TransactionAccumulation::Incomplete => {
            // The begin-prepare is visible, so the stream is known even though
            // no version info can be reported yet.
            let stream_id = match mirror.record_at(transaction_position) {
                Some(crate::record::LogRecord::Prepare(p)) => p.event_stream_id.clone(),
                _ => String::new(),
            };
            return CommitCheckResult::unresolved(CommitDecision::InvalidTransaction, stream_id);
        }
    };

    let first = &prepares[0];
    let stream_id = first.event_stream_id.clone();
    let expected = first.expected_version;

    // Step 2/3: committed version, tombstone first.
    if index.is_deleted(&stream_id) {
        return CommitCheckResult {
            decision: CommitDecision::StreamDeleted,
            event_stream_id: stream_id,
            current_version: DELETED_STREAM,
            start_event_number: -1,
            end_event_number: -1,
        };
    }
    let current_version = index.last_event_number(&stream_id);
    let event_count = prepares.iter().filter(|p| p.has_data()).count() as i64;

    // Step 4: compare expected against current.
    if expected == EXPECTED_ANY || expected == current_version {
        // Legal append. The prospective range is anchored to committed
        // history; a virgin stream (and an empty transaction) reports none.
        let (start, end) = if current_version == NO_STREAM || event_count == 0 {
            (-1, -1)
        } else {
            (current_version + 1, current_version + event_count)
        };
        return CommitCheckResult {
            decision: CommitDecision::Ok,
            event_stream_id: stream_id,
            current_version,
            start_event_number: start,
            end_event_number: end,
        };
    }

    if expected < current_version {
        // The slot this transaction targeted is already occupied. A commit at
        // this exact transaction position with the same event-id sequence is a
        // safe replay; with a different sequence it is corruption; with no
        // commit here, some other transaction won the slot.
        return match index.committed_transaction(transaction_position) {
            Some(committed) => {
                if committed.event_ids == data_event_ids(&prepares) {
                    CommitCheckResult {
                        decision: CommitDecision::Idempotent,
                        event_stream_id: stream_id,
                        current_version,
                        start_event_number: committed.first_event_number,
                        end_event_number: committed.first_event_number
                            + committed.event_count as i64
                            - 1,
                    }
                } else {
                    CommitCheckResult {
                        decision: CommitDecision::CorruptedIdempotency,
                        event_stream_id: stream_id,
                        current_version,
                        start_event_number: -1,
                        end_event_number: -1,
                    }
                }
            }
            None => CommitCheckResult {
                decision: CommitDecision::WrongExpectedVersion,
                event_stream_id: stream_id,
                current_version,
                start_event_number: -1,
                end_event_number: -1,
            },
        };
    }

    // expected > current_version: the expected predecessor does not exist yet
    // (the writer raced ahead or lost state).
    CommitCheckResult {
        decision: CommitDecision::WrongExpectedVersion,
        event_stream_id: stream_id,
        current_version,
        start_event_number: -1,
        end_event_number: -1,
    }
}
