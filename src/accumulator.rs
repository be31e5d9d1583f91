//! Transaction accumulation: collecting the prepares of one transaction.
//!
//! Given the log position of a transaction's first prepare and a checkpoint
//! bound, the accumulator walks the mirror forward and gathers every prepare
//! sharing that transaction position, stopping at the record whose
//! transaction-end flag is set. Prepares of other transactions and commit
//! records interleave freely in the scanned range and are skipped.
//!
//! The walk is read-only and bounded: it never looks at records at or past the
//! bound, so a caller using a flushed checkpoint reading never observes
//! non-durable data. Ascending position order equals append order equals
//! logical event order within the transaction.

use crate::record::{LogRecord, PrepareLogRecord};
use crate::store::LogMirror;

/// Outcome of accumulating a transaction's prepares.
#[derive(Debug)]
pub enum TransactionAccumulation {
    /// Every prepare through the transaction-end record, in order.
    Complete(Vec<PrepareLogRecord>),
    /// The bound was reached before a transaction-end record. The caller
    /// should retry once more of the log is visible.
    Incomplete,
    /// No transaction-begin prepare exists at the given position below the
    /// bound.
    NotFound,
}

/// Accumulate the prepares of the transaction starting at
/// `transaction_position`, reading only records below `read_bound`.
pub fn accumulate_transaction(
    mirror: &LogMirror,
    transaction_position: u64,
    read_bound: u64,
) -> TransactionAccumulation {
    // The transaction must start with a begin-prepare at exactly this position.
    match mirror.record_at(transaction_position) {
        Some(LogRecord::Prepare(first))
            if transaction_position < read_bound
                && first.transaction_position == transaction_position
                && first.is_transaction_begin() => {}
        _ => return TransactionAccumulation::NotFound,
    }

    let mut prepares = Vec::new();
    for record in mirror.range(transaction_position, read_bound) {
        let prepare = match record {
            LogRecord::Prepare(p) if p.transaction_position == transaction_position => p,
            _ => continue,
        };
        let ends = prepare.is_transaction_end();
        prepares.push(prepare.clone());
        if ends {
            return TransactionAccumulation::Complete(prepares);
        }
    }

    TransactionAccumulation::Incomplete
}
