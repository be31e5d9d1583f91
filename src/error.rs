//! Error types for Tidelog.
//!
//! This module defines the unified error enum used throughout the crate. All fallible
//! operations return `Result<T, Error>`. Note that commit validation does *not* use
//! this enum for its expected outcomes -- the validator returns a
//! [`CommitDecision`](crate::validator::CommitDecision) value; the writer task maps
//! rejected decisions onto the variants here when responding to callers.

/// Unified error type for all Tidelog operations.
///
/// Retryability of the variants differs:
///
/// - `WrongExpectedVersion` is a normal optimistic-concurrency conflict. It is
///   surfaced to the original caller as a rejected write and never retried by
///   this crate.
/// - `InvalidTransaction` means the transaction was incomplete or absent as of
///   the read bound. It becomes retryable once more of the log is visible.
/// - `CorruptedIdempotency` is a data-integrity failure: the same transaction
///   position was replayed with different content. The writer task halts on it.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Optimistic concurrency check failed: the stream's current version does not
    /// match the caller's expectation.
    #[error("wrong expected version: expected {expected}, actual {actual}")]
    WrongExpectedVersion {
        /// The version the caller expected the stream to be at.
        expected: String,
        /// The version the stream is actually at.
        actual: String,
    },

    /// The target stream has been deleted (tombstoned). Permanent unless the
    /// stream is recreated through an explicit tombstone-clearing operation,
    /// which this crate does not provide.
    #[error("stream deleted: {stream_id}")]
    StreamDeleted {
        /// Identifier of the tombstoned stream.
        stream_id: String,
    },

    /// The transaction at the given position was incomplete or not found as of
    /// the read bound. Retryable once more of the log is visible.
    #[error("invalid transaction at position {position}")]
    InvalidTransaction {
        /// Log position the transaction was expected to start at.
        position: u64,
    },

    /// A transaction position was replayed with content that differs from what
    /// was committed there. Fatal: the writer halts rather than resolve it.
    #[error("corrupted idempotency at transaction position {transaction_position}")]
    CorruptedIdempotency {
        /// Position of the first prepare of the conflicting transaction.
        transaction_position: u64,
    },

    /// The requested stream does not exist.
    #[error("stream not found: {stream_id}")]
    StreamNotFound {
        /// Identifier of the stream that was not found.
        stream_id: String,
    },

    /// An I/O error occurred during a file operation.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A record on disk is corrupt (e.g., CRC mismatch, truncated data).
    #[error("corrupt record at position {position}: {detail}")]
    CorruptRecord {
        /// Log position of the corrupt record.
        position: u64,
        /// Human-readable description of the corruption.
        detail: String,
    },

    /// The file header is invalid or unrecognized.
    #[error("invalid file header: {0}")]
    InvalidHeader(String),

    /// The event exceeds the maximum allowed size.
    #[error("event too large: {size} bytes exceeds {max} byte limit")]
    EventTooLarge {
        /// Actual size of the encoded record in bytes.
        size: usize,
        /// Maximum allowed size in bytes.
        max: usize,
    },

    /// A request argument is invalid.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrong_expected_version_display() {
        let err = Error::WrongExpectedVersion {
            expected: "3".into(),
            actual: "NoStream".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("wrong expected version"), "got: {msg}");
        assert!(msg.contains("3"), "got: {msg}");
        assert!(msg.contains("NoStream"), "got: {msg}");
    }

    #[test]
    fn stream_deleted_display_includes_stream_id() {
        let err = Error::StreamDeleted {
            stream_id: "orders-42".into(),
        };
        assert!(err.to_string().contains("orders-42"));
    }

    #[test]
    fn invalid_transaction_display_includes_position() {
        let err = Error::InvalidTransaction { position: 1024 };
        assert!(err.to_string().contains("1024"));
    }

    #[test]
    fn corrupted_idempotency_display_includes_position() {
        let err = Error::CorruptedIdempotency {
            transaction_position: 512,
        };
        let msg = err.to_string();
        assert!(msg.contains("corrupted idempotency"), "got: {msg}");
        assert!(msg.contains("512"), "got: {msg}");
    }

    #[test]
    fn io_error_from_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file missing");
        let err = Error::from(io_err);
        assert!(matches!(err, Error::Io(_)));
        assert!(err.to_string().contains("I/O error"));
    }

    #[test]
    fn io_error_question_mark_coercion() {
        fn fallible() -> Result<(), Error> {
            let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file missing");
            Err(io_err)?
        }

        let result = fallible();
        assert!(matches!(result.unwrap_err(), Error::Io(_)));
    }

    #[test]
    fn corrupt_record_display() {
        let err = Error::CorruptRecord {
            position: 42,
            detail: "bad crc".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("42"), "got: {msg}");
        assert!(msg.contains("bad crc"), "got: {msg}");
    }

    #[test]
    fn event_too_large_display() {
        let err = Error::EventTooLarge {
            size: 70000,
            max: 65536,
        };
        let msg = err.to_string();
        assert!(msg.contains("70000"), "got: {msg}");
        assert!(msg.contains("65536"), "got: {msg}");
    }
}
