//! Single-writer commit admission.
//!
//! All mutations of the log go through one tokio task that owns the
//! [`TransactionLog`]. Requests arrive over a bounded mpsc channel through a
//! cloneable [`WriterHandle`]; the task serializes, for each request, the full
//! admission sequence: duplicate detection, prepare appends, commit check,
//! commit append, fsync, index apply, and broker publish. Serializing commit
//! admission globally is what enforces the ordering guarantee: commits apply
//! to the index in exactly the order their checks returned `Ok`.
//!
//! Rejected outcomes come back as [`Error`] values on the request's oneshot
//! channel. A `CorruptedIdempotency` decision is fatal: the writer responds
//! with the error and halts rather than risk double-applying a transaction.

use std::num::NonZeroUsize;
use std::time::{SystemTime, UNIX_EPOCH};

use metrics::counter;

use crate::broker::Broker;
use crate::config::Config;
use crate::dedup::DedupIndex;
use crate::error::Error;
use crate::reader::ReadIndex;
use crate::record::{CommitLogRecord, PrepareFlags, PrepareLogRecord};
use crate::store::TransactionLog;
use crate::types::{
    ExpectedVersion, ProposedEvent, RecordedEvent, MAX_EVENT_TYPE_LEN, NO_STREAM,
};
use crate::validator::CommitDecision;

/// Event type tag recorded on stream-delete prepares.
const STREAM_DELETED_EVENT_TYPE: &str = "$streamDeleted";

/// A request to append events to a stream.
pub struct AppendRequest {
    /// Target stream.
    pub stream_id: String,
    /// Optimistic concurrency check for the transaction.
    pub expected_version: ExpectedVersion,
    /// Events the client wants to append. Must be non-empty.
    pub events: Vec<ProposedEvent>,
    /// Oneshot channel for sending the result back to the caller.
    pub response_tx: tokio::sync::oneshot::Sender<Result<Vec<RecordedEvent>, Error>>,
}

/// A request to delete (tombstone) a stream.
pub struct DeleteStreamRequest {
    /// Target stream.
    pub stream_id: String,
    /// Optimistic concurrency check for the delete transaction.
    pub expected_version: ExpectedVersion,
    /// Oneshot channel for sending the result back to the caller.
    pub response_tx: tokio::sync::oneshot::Sender<Result<(), Error>>,
}

/// A request processed by the writer task.
pub(crate) enum WriteRequest {
    /// Append events to a stream.
    Append(AppendRequest),
    /// Tombstone a stream.
    DeleteStream(DeleteStreamRequest),
}

/// Cloneable handle for submitting write requests to the writer task.
///
/// Cloning produces a second sender into the same bounded channel, so multiple
/// callers submit concurrently while the writer processes sequentially.
#[derive(Clone)]
pub struct WriterHandle {
    /// Sender half of the bounded mpsc channel to the writer task.
    tx: tokio::sync::mpsc::Sender<WriteRequest>,
}

impl WriterHandle {
    /// Submit an append request and await the result.
    ///
    /// # Errors
    ///
    /// Returns the writer task's error (e.g., `WrongExpectedVersion`,
    /// `StreamDeleted`, `EventTooLarge`) if the append is rejected, or
    /// `Error::InvalidArgument("writer task closed")` if the task has shut
    /// down.
    pub async fn append(
        &self,
        stream_id: impl Into<String>,
        expected_version: ExpectedVersion,
        events: Vec<ProposedEvent>,
    ) -> Result<Vec<RecordedEvent>, Error> {
        let (response_tx, response_rx) = tokio::sync::oneshot::channel();

        let request = WriteRequest::Append(AppendRequest {
            stream_id: stream_id.into(),
            expected_version,
            events,
            response_tx,
        });

        self.tx
            .send(request)
            .await
            .map_err(|_| Error::InvalidArgument("writer task closed".into()))?;

        response_rx
            .await
            .map_err(|_| Error::InvalidArgument("writer task closed".into()))?
    }

    /// Submit a stream-delete request and await the result.
    ///
    /// # Errors
    ///
    /// As for [`append`](Self::append); deleting an already deleted stream
    /// returns `Error::StreamDeleted`.
    pub async fn delete_stream(
        &self,
        stream_id: impl Into<String>,
        expected_version: ExpectedVersion,
    ) -> Result<(), Error> {
        let (response_tx, response_rx) = tokio::sync::oneshot::channel();

        let request = WriteRequest::DeleteStream(DeleteStreamRequest {
            stream_id: stream_id.into(),
            expected_version,
            response_tx,
        });

        self.tx
            .send(request)
            .await
            .map_err(|_| Error::InvalidArgument("writer task closed".into()))?;

        response_rx
            .await
            .map_err(|_| Error::InvalidArgument("writer task closed".into()))?
    }
}

/// Unix epoch milliseconds, or 0 if the clock predates the epoch.
fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Version string for `WrongExpectedVersion` responses.
fn version_label(version: i64) -> String {
    if version == NO_STREAM {
        "NoStream".to_string()
    } else {
        version.to_string()
    }
}

/// The writer task state: everything the admission sequence touches.
struct Writer {
    log: TransactionLog,
    read_index: ReadIndex,
    broker: Broker,
    dedup: DedupIndex,
}

impl Writer {
    /// Append the transaction's prepares (one per event), unflushed.
    ///
    /// If an append fails partway (e.g. an oversized record), the prepares
    /// already written stay in the log as an incomplete transaction -- the
    /// same artifact a writer crash leaves, invisible to the index and to
    /// every version query.
    fn append_prepares(
        &mut self,
        stream_id: &str,
        expected_version: ExpectedVersion,
        events: &[ProposedEvent],
    ) -> Result<Vec<PrepareLogRecord>, Error> {
        let transaction_position = self.log.next_position();
        let mut prepares = Vec::with_capacity(events.len());
        let last = events.len() - 1;

        for (i, event) in events.iter().enumerate() {
            let mut flags = PrepareFlags::DATA;
            if i == 0 {
                flags = flags | PrepareFlags::TRANSACTION_BEGIN;
            }
            if i == last {
                flags = flags | PrepareFlags::TRANSACTION_END;
            }

            let prepare = PrepareLogRecord {
                log_position: self.log.next_position(),
                transaction_position,
                transaction_offset: i as u32,
                expected_version: expected_version.raw(),
                event_stream_id: stream_id.to_string(),
                event_id: event.event_id,
                event_type: event.event_type.clone(),
                data: event.payload.clone(),
                metadata: event.metadata.clone(),
                timestamp: now_ms(),
                flags,
            };
            self.log.append_prepare(prepare.clone())?;
            prepares.push(prepare);
        }

        Ok(prepares)
    }

    /// Commit a transaction whose check returned `Ok`: append + flush the
    /// commit record, apply it to the index, and build the recorded events.
    fn commit_transaction(
        &mut self,
        prepares: &[PrepareLogRecord],
        current_version: i64,
    ) -> Result<Vec<RecordedEvent>, Error> {
        let first = &prepares[0];
        let first_event_number = current_version + 1;
        let commit = CommitLogRecord {
            log_position: self.log.next_position(),
            transaction_position: first.transaction_position,
            event_stream_id: first.event_stream_id.clone(),
            first_event_number,
            event_count: prepares.len() as u32,
            timestamp: now_ms(),
        };
        self.log.append_commit(commit.clone())?;
        self.log.flush()?;

        // Index apply under one write guard: the commit becomes observable
        // and the stream version advances as a single step.
        let index = self.log.index();
        let mut index = index.write().expect("StreamIndex RwLock poisoned");
        let global_base = index.committed_count();
        index.apply_commit(&commit, prepares);
        drop(index);

        let recorded = prepares
            .iter()
            .filter(|p| p.has_data())
            .enumerate()
            .map(|(i, p)| RecordedEvent {
                event_id: p.event_id,
                stream_id: p.event_stream_id.clone(),
                event_number: first_event_number + i as i64,
                global_position: global_base + i as u64,
                log_position: p.log_position,
                recorded_at: p.timestamp,
                event_type: p.event_type.clone(),
                metadata: p.metadata.clone(),
                payload: p.data.clone(),
            })
            .collect();
        Ok(recorded)
    }

    /// Process one append request end to end.
    fn process_append(
        &mut self,
        stream_id: &str,
        expected_version: ExpectedVersion,
        events: &[ProposedEvent],
    ) -> Result<Vec<RecordedEvent>, Error> {
        if events.is_empty() {
            return Err(Error::InvalidArgument(
                "append requires at least one event".to_string(),
            ));
        }
        for event in events {
            if event.event_type.is_empty() {
                return Err(Error::InvalidArgument(
                    "event type must not be empty".to_string(),
                ));
            }
            if event.event_type.len() > MAX_EVENT_TYPE_LEN {
                return Err(Error::InvalidArgument(format!(
                    "event type exceeds {} byte limit: {} bytes",
                    MAX_EVENT_TYPE_LEN,
                    event.event_type.len()
                )));
            }
        }

        // A retried request is re-acknowledged with the original results
        // before any new prepares hit the log.
        if let Some(original) = self.dedup.check(events) {
            counter!("tidelog_idempotent_replays_total").increment(1);
            return Ok((*original).clone());
        }

        let prepares = self.append_prepares(stream_id, expected_version, events)?;
        let transaction_position = prepares[0].transaction_position;

        let bound = self.log.writer_checkpoint().read_non_flushed();
        let check = self
            .read_index
            .check_commit_starting_at(transaction_position, bound);

        match check.decision {
            CommitDecision::Ok => {
                let recorded = self.commit_transaction(&prepares, check.current_version)?;
                counter!("tidelog_commits_total").increment(1);
                self.broker.publish(&recorded);
                self.dedup.record(recorded.clone());
                Ok(recorded)
            }
            CommitDecision::Idempotent => {
                // The durable truth already carries this transaction; hand
                // back the originally assigned events.
                counter!("tidelog_idempotent_replays_total").increment(1);
                self.read_index.read_stream(
                    stream_id,
                    check.start_event_number,
                    (check.end_event_number - check.start_event_number + 1) as u64,
                )
            }
            CommitDecision::WrongExpectedVersion => {
                counter!("tidelog_conflicts_total").increment(1);
                Err(Error::WrongExpectedVersion {
                    expected: expected_version.to_string(),
                    actual: version_label(check.current_version),
                })
            }
            CommitDecision::StreamDeleted => Err(Error::StreamDeleted {
                stream_id: stream_id.to_string(),
            }),
            CommitDecision::CorruptedIdempotency => Err(Error::CorruptedIdempotency {
                transaction_position,
            }),
            CommitDecision::InvalidTransaction => {
                // The writer just appended the complete transaction; failing
                // to resolve it means log state is inconsistent. Abort this
                // commit attempt.
                tracing::error!(
                    transaction_position,
                    "commit check could not resolve a transaction this writer just appended"
                );
                Err(Error::InvalidTransaction {
                    position: transaction_position,
                })
            }
        }
    }

    /// Process one stream-delete request: a single tombstone prepare run
    /// through the same admission sequence.
    fn process_delete(
        &mut self,
        stream_id: &str,
        expected_version: ExpectedVersion,
    ) -> Result<(), Error> {
        let transaction_position = self.log.next_position();
        let prepare = PrepareLogRecord {
            log_position: transaction_position,
            transaction_position,
            transaction_offset: 0,
            expected_version: expected_version.raw(),
            event_stream_id: stream_id.to_string(),
            event_id: uuid::Uuid::new_v4(),
            event_type: STREAM_DELETED_EVENT_TYPE.to_string(),
            data: bytes::Bytes::new(),
            metadata: bytes::Bytes::new(),
            timestamp: now_ms(),
            flags: PrepareFlags::STREAM_DELETE
                | PrepareFlags::TRANSACTION_BEGIN
                | PrepareFlags::TRANSACTION_END,
        };
        self.log.append_prepare(prepare.clone())?;

        let bound = self.log.writer_checkpoint().read_non_flushed();
        let check = self
            .read_index
            .check_commit_starting_at(transaction_position, bound);

        match check.decision {
            CommitDecision::Ok => {
                let commit = CommitLogRecord {
                    log_position: self.log.next_position(),
                    transaction_position,
                    event_stream_id: stream_id.to_string(),
                    first_event_number: check.current_version + 1,
                    event_count: 1,
                    timestamp: now_ms(),
                };
                self.log.append_commit(commit.clone())?;
                self.log.flush()?;
                self.log
                    .index()
                    .write()
                    .expect("StreamIndex RwLock poisoned")
                    .apply_commit(&commit, &[prepare]);
                counter!("tidelog_deletes_total").increment(1);
                Ok(())
            }
            CommitDecision::Idempotent => Ok(()),
            CommitDecision::WrongExpectedVersion => {
                counter!("tidelog_conflicts_total").increment(1);
                Err(Error::WrongExpectedVersion {
                    expected: expected_version.to_string(),
                    actual: version_label(check.current_version),
                })
            }
            CommitDecision::StreamDeleted => Err(Error::StreamDeleted {
                stream_id: stream_id.to_string(),
            }),
            CommitDecision::CorruptedIdempotency => Err(Error::CorruptedIdempotency {
                transaction_position,
            }),
            CommitDecision::InvalidTransaction => Err(Error::InvalidTransaction {
                position: transaction_position,
            }),
        }
    }
}

/// Run the writer task loop.
///
/// Receives requests from the bounded mpsc channel, processes each through the
/// admission sequence, and sends results back on per-request oneshot channels.
/// The first request of an iteration is received with a blocking `recv()`,
/// then additional pending requests are drained with `try_recv()`. The loop
/// exits cleanly when all senders are dropped, or immediately after
/// responding to a fatal `CorruptedIdempotency` outcome.
pub(crate) async fn run_writer(
    log: TransactionLog,
    rx: tokio::sync::mpsc::Receiver<WriteRequest>,
    broker: Broker,
    dedup_capacity: NonZeroUsize,
) {
    let read_index = ReadIndex::new(log.mirror(), log.index(), log.writer_checkpoint());

    // Seed duplicate detection from the newest committed events, so retries
    // spanning a restart are still recognized.
    let mut dedup = DedupIndex::new(dedup_capacity);
    let committed = read_index.committed_count();
    let seed_from = committed.saturating_sub(dedup_capacity.get() as u64);
    dedup.seed_from_log(&read_index.read_all(seed_from, committed - seed_from));

    let mut writer = Writer {
        log,
        read_index,
        broker,
        dedup,
    };
    let mut rx = rx;

    while let Some(first) = rx.recv().await {
        // Drain any additional pending requests for batching.
        let mut batch = vec![first];
        while let Ok(req) = rx.try_recv() {
            batch.push(req);
        }

        for req in batch {
            match req {
                WriteRequest::Append(append) => {
                    let result = writer.process_append(
                        &append.stream_id,
                        append.expected_version,
                        &append.events,
                    );
                    let fatal = matches!(result, Err(Error::CorruptedIdempotency { .. }));
                    if fatal {
                        tracing::error!(
                            stream_id = %append.stream_id,
                            "halting writer: transaction position replayed with different content"
                        );
                    }
                    if append.response_tx.send(result).is_err() {
                        tracing::warn!(
                            "writer: response receiver dropped for stream {}",
                            append.stream_id
                        );
                    }
                    if fatal {
                        return;
                    }
                }
                WriteRequest::DeleteStream(delete) => {
                    let result =
                        writer.process_delete(&delete.stream_id, delete.expected_version);
                    let fatal = matches!(result, Err(Error::CorruptedIdempotency { .. }));
                    if fatal {
                        tracing::error!(
                            stream_id = %delete.stream_id,
                            "halting writer: transaction position replayed with different content"
                        );
                    }
                    if delete.response_tx.send(result).is_err() {
                        tracing::warn!(
                            "writer: response receiver dropped for stream {}",
                            delete.stream_id
                        );
                    }
                    if fatal {
                        return;
                    }
                }
            }
        }
    }
    // Channel closed -- all WriterHandle senders have been dropped. Exit cleanly.
}

/// Spawn the writer task on the tokio runtime.
///
/// Moves the log and broker into the task and returns a triple of
/// (`WriterHandle`, `ReadIndex`, `JoinHandle<()>`). The `ReadIndex` shares the
/// log's mirror, index, and checkpoint, so reads run concurrently with the
/// writer and observe its appends immediately.
pub fn spawn_writer(
    log: TransactionLog,
    config: &Config,
    broker: Broker,
) -> (
    WriterHandle,
    ReadIndex,
    tokio::task::JoinHandle<()>,
) {
    // Clone the shared state handles BEFORE moving the log into the task.
    let read_index = ReadIndex::new(log.mirror(), log.index(), log.writer_checkpoint());

    let (tx, rx) = tokio::sync::mpsc::channel(config.writer_capacity);
    let writer_handle = WriterHandle { tx };

    let join_handle = tokio::spawn(run_writer(log, rx, broker, config.dedup_capacity));

    (writer_handle, read_index, join_handle)
}
