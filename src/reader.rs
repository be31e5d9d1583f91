//! Read-only handle over the shared log mirror and stream index.
//!
//! `ReadIndex` is what everything outside the writer task holds: it answers
//! version queries, serves committed events by `(stream, event_number)`, by
//! global commit order, or by raw log position, and runs commit checks. All
//! methods acquire read locks for the duration of one operation, so readers run
//! concurrently with each other and with the writer. Cloning produces a new
//! handle over the same underlying data.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::checkpoint::Checkpoint;
use crate::error::Error;
use crate::index::StreamIndex;
use crate::record::{LogRecord, PrepareLogRecord};
use crate::store::LogMirror;
use crate::types::{RecordedEvent, StreamInfo, DELETED_STREAM};
use crate::validator::{self, CommitCheckResult, CommitDecision};

/// Shared, read-only handle over the log mirror, the stream index, and the
/// writer checkpoint.
#[derive(Clone)]
pub struct ReadIndex {
    /// Shared in-memory mirror of appended records.
    mirror: Arc<RwLock<LogMirror>>,
    /// Shared stream index.
    index: Arc<RwLock<StreamIndex>>,
    /// Writer checkpoint used as the default read bound.
    writer_checkpoint: Arc<Checkpoint>,
}

impl ReadIndex {
    /// Create a new `ReadIndex` over the given shared state.
    pub fn new(
        mirror: Arc<RwLock<LogMirror>>,
        index: Arc<RwLock<StreamIndex>>,
        writer_checkpoint: Arc<Checkpoint>,
    ) -> ReadIndex {
        ReadIndex {
            mirror,
            index,
            writer_checkpoint,
        }
    }

    /// The writer checkpoint. `read_non_flushed()` bounds same-process
    /// read-your-writes; `read_flushed()` bounds durability-gated reads.
    pub fn writer_checkpoint(&self) -> &Checkpoint {
        &self.writer_checkpoint
    }

    /// Last committed event number of a stream: -1 if the stream has no
    /// committed events, [`DELETED_STREAM`] if it has been tombstoned.
    pub fn stream_last_event_number(&self, stream_id: &str) -> i64 {
        let index = self.index.read().expect("StreamIndex RwLock poisoned");
        index.last_event_number(stream_id)
    }

    /// Decide whether the transaction starting at `transaction_position` may
    /// be committed, as of `read_bound`.
    ///
    /// Pure query; see [`validator::check_commit_starting_at`]. Callers that
    /// want read-your-writes pass `writer_checkpoint().read_non_flushed()`;
    /// callers that must only trust durable state pass `read_flushed()`.
    pub fn check_commit_starting_at(
        &self,
        transaction_position: u64,
        read_bound: u64,
    ) -> CommitCheckResult {
        let mirror = self.mirror.read().expect("LogMirror RwLock poisoned");
        let index = self.index.read().expect("StreamIndex RwLock poisoned");
        validator::check_commit_starting_at(&mirror, &index, transaction_position, read_bound)
    }

    /// Commit check that waits, bounded, for the transaction to become fully
    /// visible.
    ///
    /// While the decision is `InvalidTransaction` the check is retried against
    /// the advancing non-flushed checkpoint every `poll_interval`, up to
    /// `timeout`. On timeout the last `InvalidTransaction` result is returned
    /// -- the wait is explicit and bounded, never an unbounded suspension.
    /// Any other decision returns immediately.
    pub async fn check_commit_with_retry(
        &self,
        transaction_position: u64,
        poll_interval: Duration,
        timeout: Duration,
    ) -> CommitCheckResult {
        let started = tokio::time::Instant::now();
        loop {
            let bound = self.writer_checkpoint.read_non_flushed();
            let result = self.check_commit_starting_at(transaction_position, bound);
            if result.decision != CommitDecision::InvalidTransaction {
                return result;
            }
            if started.elapsed() >= timeout {
                return result;
            }
            tokio::time::sleep(poll_interval).await;
        }
    }

    /// Read one committed event by stream and event number.
    ///
    /// # Errors
    ///
    /// [`Error::StreamNotFound`] if the stream has no committed events,
    /// [`Error::StreamDeleted`] if it is tombstoned, and
    /// [`Error::InvalidArgument`] if `event_number` is outside the committed
    /// range.
    pub fn read_event(&self, stream_id: &str, event_number: i64) -> Result<RecordedEvent, Error> {
        let mirror = self.mirror.read().expect("LogMirror RwLock poisoned");
        let index = self.index.read().expect("StreamIndex RwLock poisoned");

        let entry = index.entry(stream_id).ok_or_else(|| Error::StreamNotFound {
            stream_id: stream_id.to_string(),
        })?;
        if entry.is_deleted {
            return Err(Error::StreamDeleted {
                stream_id: stream_id.to_string(),
            });
        }
        if event_number < 0 || event_number as usize >= entry.positions.len() {
            return Err(Error::InvalidArgument(format!(
                "event number {event_number} outside committed range of stream {stream_id}"
            )));
        }

        let position = entry.positions[event_number as usize];
        Ok(recorded_event_at(&mirror, &index, position, event_number))
    }

    /// Read committed events from a stream starting at `from_event_number`,
    /// at most `max_count`. An empty result means the caller is at the head
    /// of the stream.
    ///
    /// # Errors
    ///
    /// [`Error::StreamNotFound`] / [`Error::StreamDeleted`] as for
    /// [`read_event`](Self::read_event).
    pub fn read_stream(
        &self,
        stream_id: &str,
        from_event_number: i64,
        max_count: u64,
    ) -> Result<Vec<RecordedEvent>, Error> {
        let mirror = self.mirror.read().expect("LogMirror RwLock poisoned");
        let index = self.index.read().expect("StreamIndex RwLock poisoned");

        let entry = index.entry(stream_id).ok_or_else(|| Error::StreamNotFound {
            stream_id: stream_id.to_string(),
        })?;
        if entry.is_deleted {
            return Err(Error::StreamDeleted {
                stream_id: stream_id.to_string(),
            });
        }

        let stream_len = entry.positions.len() as u64;
        let from = from_event_number.max(0) as u64;
        let start = from.min(stream_len);
        let end = from.saturating_add(max_count).min(stream_len);

        Ok(entry.positions[start as usize..end as usize]
            .iter()
            .enumerate()
            .map(|(i, &position)| {
                recorded_event_at(&mirror, &index, position, (start + i as u64) as i64)
            })
            .collect())
    }

    /// Read committed events in global commit order starting at
    /// `from_position`, at most `max_count`. Never errors -- an empty result
    /// means the caller is at the head of the committed log.
    pub fn read_all(&self, from_position: u64, max_count: u64) -> Vec<RecordedEvent> {
        let mirror = self.mirror.read().expect("LogMirror RwLock poisoned");
        let index = self.index.read().expect("StreamIndex RwLock poisoned");

        index
            .committed_range(from_position, max_count)
            .iter()
            .map(|&position| {
                let prepare = committed_prepare(&mirror, position);
                let event_number = event_number_of(&index, prepare);
                recorded_from_prepare(&index, prepare, event_number)
            })
            .collect()
    }

    /// Read the committed event whose prepare sits at a raw log position.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidArgument`] if no committed event exists at the position
    /// (the position is unoccupied, holds a commit record, or holds a prepare
    /// that no commit covers).
    pub fn read_at(&self, log_position: u64) -> Result<RecordedEvent, Error> {
        let mirror = self.mirror.read().expect("LogMirror RwLock poisoned");
        let index = self.index.read().expect("StreamIndex RwLock poisoned");

        if index.global_position_of(log_position).is_none() {
            return Err(Error::InvalidArgument(format!(
                "no committed event at log position {log_position}"
            )));
        }
        let prepare = committed_prepare(&mirror, log_position);
        let event_number = event_number_of(&index, prepare);
        Ok(recorded_from_prepare(&index, prepare, event_number))
    }

    /// The number of committed events (the next global position).
    pub fn committed_count(&self) -> u64 {
        let index = self.index.read().expect("StreamIndex RwLock poisoned");
        index.committed_count()
    }

    /// Summary information for all known streams, sorted by stream id.
    ///
    /// Touches only the index -- no event payloads are read or cloned.
    pub fn list_streams(&self) -> Vec<StreamInfo> {
        let index = self.index.read().expect("StreamIndex RwLock poisoned");
        let mut streams: Vec<StreamInfo> = index
            .streams()
            .map(|(id, entry)| StreamInfo {
                stream_id: id.clone(),
                event_count: entry.positions.len() as u64,
                last_event_number: if entry.is_deleted {
                    DELETED_STREAM
                } else {
                    entry.last_event_number
                },
                is_deleted: entry.is_deleted,
            })
            .collect();
        streams.sort_by(|a, b| a.stream_id.cmp(&b.stream_id));
        streams
    }
}

/// The committed prepare at `position`.
///
/// Only called for positions present in the index, which holds positions of
/// committed data prepares exclusively; the mirror cannot be missing them.
fn committed_prepare(mirror: &LogMirror, position: u64) -> &PrepareLogRecord {
    match mirror.record_at(position) {
        Some(LogRecord::Prepare(prepare)) => prepare,
        _ => unreachable!("index references a committed prepare at position {position}"),
    }
}

/// Event number of a committed prepare, resolved through the registry entry of
/// its transaction.
fn event_number_of(index: &StreamIndex, prepare: &PrepareLogRecord) -> i64 {
    let txn = index
        .committed_transaction(prepare.transaction_position)
        .expect("committed prepare belongs to a registered transaction");
    let offset = txn
        .event_ids
        .iter()
        .position(|id| *id == prepare.event_id)
        .expect("committed prepare's event id appears in its transaction");
    txn.first_event_number + offset as i64
}

fn recorded_from_prepare(
    index: &StreamIndex,
    prepare: &PrepareLogRecord,
    event_number: i64,
) -> RecordedEvent {
    let global_position = index
        .global_position_of(prepare.log_position)
        .expect("committed prepare has a global position");
    RecordedEvent {
        event_id: prepare.event_id,
        stream_id: prepare.event_stream_id.clone(),
        event_number,
        global_position,
        log_position: prepare.log_position,
        recorded_at: prepare.timestamp,
        event_type: prepare.event_type.clone(),
        metadata: prepare.metadata.clone(),
        payload: prepare.data.clone(),
    }
}

/// Shorthand used by `read_event` / `read_stream`, where the event number is
/// already known from the stream entry.
fn recorded_event_at(
    mirror: &LogMirror,
    index: &StreamIndex,
    position: u64,
    event_number: i64,
) -> RecordedEvent {
    recorded_from_prepare(index, committed_prepare(mirror, position), event_number)
}
