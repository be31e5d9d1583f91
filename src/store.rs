//! Append-only transaction log storage.
//!
//! This module owns the log file, the in-memory mirror of appended records, and
//! the writer checkpoint. It provides methods for opening (or creating) the log,
//! appending prepare and commit records with assigned byte-offset positions, and
//! flushing for durability.
//!
//! Appending does not fsync; [`TransactionLog::flush`] does, and advances the
//! flushed checkpoint reading. The mirror and the non-flushed checkpoint advance
//! on every append, which is what gives same-process readers read-your-writes
//! over records that are not yet durable.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Seek, Write};
use std::path::Path;
use std::sync::{Arc, RwLock};

use crate::accumulator::{accumulate_transaction, TransactionAccumulation};
use crate::checkpoint::Checkpoint;
use crate::codec::{self, DecodeOutcome, HEADER_SIZE};
use crate::error::Error;
use crate::index::StreamIndex;
use crate::record::{CommitLogRecord, LogRecord, PrepareLogRecord};
use crate::types::MAX_EVENT_SIZE;

/// Check whether a valid record frame exists in `data` after byte offset `start`.
///
/// Scans forward one byte at a time from `start + 1` through the end of the
/// buffer, attempting a full frame decode at each offset. Returns `true` if one
/// decodes, indicating mid-file corruption (the corrupt region is not at the
/// tail). A random run of garbage essentially never passes the CRC, so a hit
/// here means real data follows the damage.
fn has_valid_frame_after(data: &[u8], start: usize) -> bool {
    for probe in (start + 1)..data.len() {
        if let Ok(DecodeOutcome::Complete { .. }) = codec::decode_record(&data[probe..]) {
            return true;
        }
    }
    false
}

/// In-memory mirror of every record appended to the log in this process.
///
/// Keyed by byte-offset position so forward scans (transaction accumulation,
/// index replay) are ordered range walks. Shared as `Arc<RwLock<LogMirror>>`
/// between the writer task and [`ReadIndex`](crate::reader::ReadIndex) handles.
#[derive(Debug, Default)]
pub struct LogMirror {
    /// Position -> record. Append-only.
    records: BTreeMap<u64, LogRecord>,
}

impl LogMirror {
    /// The record at an exact position, if any.
    pub fn record_at(&self, position: u64) -> Option<&LogRecord> {
        self.records.get(&position)
    }

    /// Records with positions in `from..bound`, in ascending position order.
    pub fn range(&self, from: u64, bound: u64) -> impl Iterator<Item = &LogRecord> {
        self.records.range(from..bound).map(|(_, record)| record)
    }

    /// Number of records appended so far.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// True when nothing has been appended.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn insert(&mut self, record: LogRecord) {
        self.records.insert(record.log_position(), record);
    }
}

/// Append-only transaction log with position assignment and crash recovery.
///
/// The log owns the file handle and the next-position allocator; there is
/// exactly one `TransactionLog` value per file and the writer task owns it,
/// which is the single point of mutual exclusion that keeps positions
/// strictly ordered and gap-free.
pub struct TransactionLog {
    /// Append-only log file handle.
    file: File,
    /// Byte offset the next appended record will receive.
    next_position: u64,
    /// Shared in-memory mirror of appended records.
    mirror: Arc<RwLock<LogMirror>>,
    /// Shared stream index, rebuilt from commit records on open.
    index: Arc<RwLock<StreamIndex>>,
    /// Writer checkpoint: non-flushed advances per append, flushed per fsync.
    writer_checkpoint: Arc<Checkpoint>,
}

impl TransactionLog {
    /// Open or create the transaction log at the given file path.
    ///
    /// If the file does not exist, creates it with the 8-byte file header,
    /// fsyncs file and parent directory, and returns an empty log. If the file
    /// exists, validates the header, decodes record frames sequentially,
    /// rebuilds the mirror, and replays commit records in log order to rebuild
    /// the stream index.
    ///
    /// # Recovery behavior
    ///
    /// - **Trailing incomplete/corrupt frame**: truncated from the file with a
    ///   `tracing::warn!` log. The log opens successfully with all preceding
    ///   valid records; uncommitted prepares among them are kept -- they stay
    ///   invisible to the index until a commit covers them.
    /// - **Mid-file corruption** (corrupt frame followed by valid frames):
    ///   returns [`Error::CorruptRecord`]. This is unrecoverable.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the file cannot be created or read,
    /// [`Error::InvalidHeader`] if an existing file has a bad header, and
    /// [`Error::CorruptRecord`] on mid-file corruption or a commit record
    /// whose transaction cannot be resolved from the preceding log.
    pub fn open(path: &Path) -> Result<TransactionLog, Error> {
        if !path.exists() {
            // New file: create with read+write so appends can write later.
            let mut file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .open(path)?;
            file.write_all(&codec::encode_header())?;
            file.sync_all()?;

            // Fsync the parent directory so the new file's directory entry is
            // durable. Without this, a crash between file creation and the OS
            // flushing the directory entry could leave the file inaccessible.
            let parent = path
                .parent()
                .expect("log path must have a parent directory");
            let dir_handle = File::open(parent)?;
            dir_handle.sync_all()?;

            return Self::assemble(file, HEADER_SIZE as u64, LogMirror::default());
        }

        // Existing file: read contents, validate header, recover records.
        let data = std::fs::read(path)?;

        if data.len() < HEADER_SIZE {
            return Err(Error::InvalidHeader(format!(
                "file too short for header: {} bytes",
                data.len()
            )));
        }

        let header: &[u8; 8] = data[..HEADER_SIZE]
            .try_into()
            .expect("slice is exactly 8 bytes");
        codec::decode_header(header)?;

        // Decode record frames sequentially from offset HEADER_SIZE.
        let mut mirror = LogMirror::default();
        let mut offset = HEADER_SIZE;

        loop {
            let remaining = &data[offset..];
            if remaining.is_empty() {
                break;
            }

            match codec::decode_record(remaining) {
                Ok(DecodeOutcome::Complete { value, consumed }) => {
                    if value.log_position() != offset as u64 {
                        // A frame whose stored position disagrees with its
                        // physical offset. Same handling as a bad checksum.
                        if has_valid_frame_after(&data, offset) {
                            return Err(Error::CorruptRecord {
                                position: offset as u64,
                                detail: format!(
                                    "record position {} does not match file offset {offset}, \
                                     and valid frames follow",
                                    value.log_position()
                                ),
                            });
                        }
                        tracing::warn!(
                            offset,
                            recovered_records = mirror.len(),
                            "truncating trailing frame with mismatched position at byte \
                             offset {offset}"
                        );
                        return Self::truncate_and_assemble(path, offset, mirror);
                    }
                    mirror.insert(value);
                    offset += consumed;
                }
                Ok(DecodeOutcome::Incomplete) => {
                    // Trailing partial frame -- the expected crash artifact.
                    tracing::warn!(
                        offset,
                        recovered_records = mirror.len(),
                        "truncating trailing partial frame at byte offset {offset}"
                    );
                    return Self::truncate_and_assemble(path, offset, mirror);
                }
                Err(Error::CorruptRecord { .. }) => {
                    // Bad checksum or tag at this offset. Check if valid data follows.
                    if has_valid_frame_after(&data, offset) {
                        return Err(Error::CorruptRecord {
                            position: offset as u64,
                            detail: "mid-file corruption: valid frame follows corrupt data"
                                .to_string(),
                        });
                    }
                    // Trailing corruption -- truncate.
                    tracing::warn!(
                        offset,
                        recovered_records = mirror.len(),
                        "truncating trailing corrupt data at byte offset {offset}"
                    );
                    return Self::truncate_and_assemble(path, offset, mirror);
                }
                Err(e) => return Err(e),
            }
        }

        // All frames decoded successfully. Open file for future appends.
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Self::assemble(file, offset as u64, mirror)
    }

    /// Truncate the log file to a given offset, fsync, and assemble the log
    /// from the records recovered so far.
    ///
    /// This is the common recovery path for all partial/corrupt tail
    /// scenarios: incomplete frame, checksum mismatch, or mismatched position.
    fn truncate_and_assemble(
        path: &Path,
        truncate_to: usize,
        mirror: LogMirror,
    ) -> Result<TransactionLog, Error> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        file.set_len(truncate_to as u64)?;
        file.sync_all()?;
        Self::assemble(file, truncate_to as u64, mirror)
    }

    /// Build the `TransactionLog` value: replay commit records in log order to
    /// rebuild the stream index, then initialize the writer checkpoint with
    /// both readings at the recovered end position.
    fn assemble(file: File, end: u64, mirror: LogMirror) -> Result<TransactionLog, Error> {
        let mut index = StreamIndex::new();
        for record in mirror.range(0, end) {
            if let LogRecord::Commit(commit) = record {
                match accumulate_transaction(&mirror, commit.transaction_position, end) {
                    TransactionAccumulation::Complete(prepares) => {
                        index.apply_commit(commit, &prepares);
                    }
                    TransactionAccumulation::Incomplete | TransactionAccumulation::NotFound => {
                        // A commit always follows its prepares in the log, so a
                        // fully recovered log cannot fail to resolve one.
                        return Err(Error::CorruptRecord {
                            position: commit.log_position,
                            detail: format!(
                                "commit references unresolvable transaction at position {}",
                                commit.transaction_position
                            ),
                        });
                    }
                }
            }
        }

        Ok(TransactionLog {
            file,
            next_position: end,
            mirror: Arc::new(RwLock::new(mirror)),
            index: Arc::new(RwLock::new(index)),
            writer_checkpoint: Arc::new(Checkpoint::new("writer", end)),
        })
    }

    /// The position the next appended record will receive.
    pub fn next_position(&self) -> u64 {
        self.next_position
    }

    /// Append a record to the log.
    ///
    /// The record's `log_position` must equal [`next_position`](Self::next_position);
    /// the caller constructs records against the allocator it is the sole user
    /// of. The frame is written to the file (not fsynced), mirrored in memory,
    /// and the non-flushed checkpoint advances past it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] on a position mismatch,
    /// [`Error::EventTooLarge`] if the encoded frame exceeds [`MAX_EVENT_SIZE`],
    /// and [`Error::Io`] if the write fails.
    pub fn append(&mut self, record: LogRecord) -> Result<u64, Error> {
        if record.log_position() != self.next_position {
            return Err(Error::InvalidArgument(format!(
                "record position {} does not match next log position {}",
                record.log_position(),
                self.next_position
            )));
        }

        let encoded = codec::encode_record(&record);
        if encoded.len() > MAX_EVENT_SIZE {
            return Err(Error::EventTooLarge {
                size: encoded.len(),
                max: MAX_EVENT_SIZE,
            });
        }

        self.file.seek(std::io::SeekFrom::End(0))?;
        self.file.write_all(&encoded)?;

        let position = record.log_position();
        {
            let mut mirror = self.mirror.write().expect("LogMirror RwLock poisoned");
            mirror.insert(record);
        }
        self.next_position += encoded.len() as u64;
        self.writer_checkpoint.write(self.next_position);

        Ok(position)
    }

    /// Append a prepare record. See [`append`](Self::append).
    pub fn append_prepare(&mut self, prepare: PrepareLogRecord) -> Result<u64, Error> {
        self.append(LogRecord::Prepare(prepare))
    }

    /// Append a commit record. See [`append`](Self::append).
    pub fn append_commit(&mut self, commit: CommitLogRecord) -> Result<u64, Error> {
        self.append(LogRecord::Commit(commit))
    }

    /// Fsync the log file and advance the flushed checkpoint reading.
    pub fn flush(&mut self) -> Result<(), Error> {
        self.file.sync_all()?;
        self.writer_checkpoint.flush();
        Ok(())
    }

    /// Returns a clone of the shared in-memory mirror handle.
    pub fn mirror(&self) -> Arc<RwLock<LogMirror>> {
        Arc::clone(&self.mirror)
    }

    /// Returns a clone of the shared stream index handle.
    pub fn index(&self) -> Arc<RwLock<StreamIndex>> {
        Arc::clone(&self.index)
    }

    /// Returns a clone of the writer checkpoint handle.
    pub fn writer_checkpoint(&self) -> Arc<Checkpoint> {
        Arc::clone(&self.writer_checkpoint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{CommitLogRecord, PrepareFlags, PrepareLogRecord};
    use crate::types::NO_STREAM;
    use bytes::Bytes;
    use uuid::Uuid;

    /// Helper: a single-event transaction prepare at the given position.
    fn prepare_at(position: u64, stream: &str, expected_version: i64) -> PrepareLogRecord {
        PrepareLogRecord {
            log_position: position,
            transaction_position: position,
            transaction_offset: 0,
            expected_version,
            event_stream_id: stream.to_string(),
            event_id: Uuid::new_v4(),
            event_type: "TestEvent".to_string(),
            data: Bytes::from_static(b"{}"),
            metadata: Bytes::new(),
            timestamp: 0,
            flags: PrepareFlags::DATA
                | PrepareFlags::TRANSACTION_BEGIN
                | PrepareFlags::TRANSACTION_END,
        }
    }

    fn commit_at(
        position: u64,
        transaction_position: u64,
        stream: &str,
        first: i64,
    ) -> CommitLogRecord {
        CommitLogRecord {
            log_position: position,
            transaction_position,
            event_stream_id: stream.to_string(),
            first_event_number: first,
            event_count: 1,
            timestamp: 0,
        }
    }

    #[test]
    fn open_creates_file_with_header_and_empty_log() {
        let dir = tempfile::tempdir().expect("failed to create tempdir");
        let path = dir.path().join("transactions.log");

        assert!(!path.exists());
        let log = TransactionLog::open(&path).expect("open should succeed");
        assert!(path.exists());

        let contents = std::fs::read(&path).expect("read file");
        assert_eq!(&contents[..8], &codec::encode_header());

        assert_eq!(log.next_position(), HEADER_SIZE as u64);
        assert_eq!(log.writer_checkpoint().read_flushed(), HEADER_SIZE as u64);
        assert!(log.mirror().read().expect("lock").is_empty());
    }

    #[test]
    fn append_assigns_contiguous_positions_and_advances_checkpoint() {
        let dir = tempfile::tempdir().expect("failed to create tempdir");
        let path = dir.path().join("transactions.log");
        let mut log = TransactionLog::open(&path).expect("open should succeed");

        let first_pos = log.next_position();
        let appended = log
            .append(LogRecord::Prepare(prepare_at(first_pos, "ES", NO_STREAM)))
            .expect("append should succeed");
        assert_eq!(appended, first_pos);

        let second_pos = log.next_position();
        assert!(second_pos > first_pos);
        // Non-flushed reading tracks the append; flushed lags until flush().
        assert_eq!(log.writer_checkpoint().read_non_flushed(), second_pos);
        assert_eq!(log.writer_checkpoint().read_flushed(), HEADER_SIZE as u64);

        log.flush().expect("flush should succeed");
        assert_eq!(log.writer_checkpoint().read_flushed(), second_pos);
    }

    #[test]
    fn append_rejects_position_mismatch() {
        let dir = tempfile::tempdir().expect("failed to create tempdir");
        let path = dir.path().join("transactions.log");
        let mut log = TransactionLog::open(&path).expect("open should succeed");

        let wrong = log.next_position() + 64;
        let result = log.append(LogRecord::Prepare(prepare_at(wrong, "ES", NO_STREAM)));
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
        // The allocator did not advance.
        assert_eq!(log.next_position(), HEADER_SIZE as u64);
    }

    #[test]
    fn append_rejects_oversized_record() {
        let dir = tempfile::tempdir().expect("failed to create tempdir");
        let path = dir.path().join("transactions.log");
        let mut log = TransactionLog::open(&path).expect("open should succeed");

        let mut prepare = prepare_at(log.next_position(), "ES", NO_STREAM);
        prepare.data = Bytes::from(vec![0u8; MAX_EVENT_SIZE + 1]);
        let result = log.append(LogRecord::Prepare(prepare));
        assert!(matches!(result, Err(Error::EventTooLarge { .. })));
    }

    #[test]
    fn reopen_recovers_records_and_index() {
        let dir = tempfile::tempdir().expect("failed to create tempdir");
        let path = dir.path().join("transactions.log");

        let (prepare_pos, commit_pos);
        {
            let mut log = TransactionLog::open(&path).expect("open should succeed");
            prepare_pos = log.next_position();
            log.append(LogRecord::Prepare(prepare_at(prepare_pos, "ES", NO_STREAM)))
                .expect("append prepare");
            commit_pos = log.next_position();
            log.append(LogRecord::Commit(commit_at(commit_pos, prepare_pos, "ES", 0)))
                .expect("append commit");
            log.flush().expect("flush");
        }

        let log = TransactionLog::open(&path).expect("reopen should succeed");
        assert_eq!(log.mirror().read().expect("lock").len(), 2);
        let index = log.index();
        let index = index.read().expect("lock");
        assert_eq!(index.last_event_number("ES"), 0);
        assert!(index.committed_transaction(prepare_pos).is_some());
    }

    #[test]
    fn uncommitted_prepares_survive_restart_but_stay_invisible() {
        let dir = tempfile::tempdir().expect("failed to create tempdir");
        let path = dir.path().join("transactions.log");

        {
            let mut log = TransactionLog::open(&path).expect("open should succeed");
            let pos = log.next_position();
            log.append(LogRecord::Prepare(prepare_at(pos, "ES", NO_STREAM)))
                .expect("append prepare");
            log.flush().expect("flush");
        }

        let log = TransactionLog::open(&path).expect("reopen should succeed");
        // The prepare is in the mirror, but no commit covers it: the stream
        // does not exist as far as the index is concerned.
        assert_eq!(log.mirror().read().expect("lock").len(), 1);
        assert_eq!(
            log.index().read().expect("lock").last_event_number("ES"),
            NO_STREAM
        );
    }

    #[test]
    fn recovery_truncates_trailing_garbage_bytes() {
        let dir = tempfile::tempdir().expect("failed to create tempdir");
        let path = dir.path().join("transactions.log");

        {
            let mut log = TransactionLog::open(&path).expect("open should succeed");
            let pos = log.next_position();
            log.append(LogRecord::Prepare(prepare_at(pos, "ES", NO_STREAM)))
                .expect("append prepare");
            log.flush().expect("flush");
        }

        let valid_size = std::fs::metadata(&path).expect("metadata").len();

        // Append garbage bytes (simulating a crash mid-write).
        {
            let mut file = OpenOptions::new()
                .append(true)
                .open(&path)
                .expect("open for append");
            file.write_all(&[0xDE, 0xAD, 0xBE, 0xEF, 0xCA, 0xFE, 0x01, 0x02])
                .expect("write garbage");
            file.sync_all().expect("sync");
        }
        assert!(std::fs::metadata(&path).expect("metadata").len() > valid_size);

        let log = TransactionLog::open(&path).expect("recovery should succeed");
        assert_eq!(log.mirror().read().expect("lock").len(), 1);
        assert_eq!(log.next_position(), valid_size);

        let final_size = std::fs::metadata(&path).expect("metadata").len();
        assert_eq!(final_size, valid_size, "file should be truncated");
    }

    #[test]
    fn recovery_rejects_mid_file_corruption() {
        let dir = tempfile::tempdir().expect("failed to create tempdir");
        let path = dir.path().join("transactions.log");

        let first_frame_start = HEADER_SIZE as u64;
        {
            let mut log = TransactionLog::open(&path).expect("open should succeed");
            let p0 = log.next_position();
            log.append(LogRecord::Prepare(prepare_at(p0, "ES", NO_STREAM)))
                .expect("append");
            let p1 = log.next_position();
            log.append(LogRecord::Prepare(prepare_at(p1, "ES", NO_STREAM)))
                .expect("append");
            log.flush().expect("flush");
        }

        // Corrupt a byte inside the first frame's payload region. The second
        // frame remains valid, so this is unrecoverable mid-file damage.
        {
            let mut data = std::fs::read(&path).expect("read");
            let target = first_frame_start as usize + 32;
            data[target] ^= 0xFF;
            std::fs::write(&path, &data).expect("write corrupted");
        }

        let result = TransactionLog::open(&path);
        assert!(
            matches!(result, Err(Error::CorruptRecord { .. })),
            "mid-file corruption must refuse to open"
        );
    }

    #[test]
    fn reopen_after_recovery_continues_appending() {
        let dir = tempfile::tempdir().expect("failed to create tempdir");
        let path = dir.path().join("transactions.log");

        {
            let mut log = TransactionLog::open(&path).expect("open");
            let pos = log.next_position();
            log.append(LogRecord::Prepare(prepare_at(pos, "ES", NO_STREAM)))
                .expect("append");
            log.flush().expect("flush");
        }
        {
            let mut file = OpenOptions::new().append(true).open(&path).expect("open");
            file.write_all(&[0x01, 0x02, 0x03]).expect("garbage");
        }

        let mut log = TransactionLog::open(&path).expect("recovery");
        let pos = log.next_position();
        log.append(LogRecord::Prepare(prepare_at(pos, "ES", 0)))
            .expect("append after recovery");
        log.flush().expect("flush");

        let log = TransactionLog::open(&path).expect("clean reopen");
        assert_eq!(log.mirror().read().expect("lock").len(), 2);
    }
}
