//! Core domain types for Tidelog.
//!
//! This module defines the types every other module depends on: proposed events
//! (client-submitted), recorded events (committed, with server-assigned numbers and
//! positions), expected-version semantics for optimistic concurrency, and the
//! sentinel values used throughout the log and index.

use std::sync::Arc;

use bytes::Bytes;
use uuid::Uuid;

/// Maximum size of a single encoded event record in bytes (payload + metadata +
/// fixed fields).
///
/// Records exceeding this limit are rejected on append. Domain events should be
/// small, structured data (typically JSON). Large artifacts belong in external
/// storage; events carry references to them.
pub const MAX_EVENT_SIZE: usize = 64 * 1024; // 64 KB

/// Maximum length of an event type tag in bytes.
pub const MAX_EVENT_TYPE_LEN: usize = 256;

/// Current version reported for a stream with no committed events.
///
/// Also the raw expected-version encoding of [`ExpectedVersion::NoStream`]:
/// "the stream must not yet exist."
pub const NO_STREAM: i64 = -1;

/// Raw expected-version encoding of [`ExpectedVersion::Any`]: no concurrency
/// check is performed for the transaction.
pub const EXPECTED_ANY: i64 = -2;

/// Tombstone sentinel reported as the last event number of a deleted stream.
///
/// Deletion is permanent: the index entry is never physically removed, and any
/// commit check against the stream yields a deleted decision.
pub const DELETED_STREAM: i64 = i64::MAX;

/// Controls optimistic concurrency on append.
///
/// The caller specifies what state the target stream must be in for the commit
/// to be admitted. Inside prepare records the variant is carried as a raw
/// signed integer (see [`ExpectedVersion::raw`]); the sum type exists so that
/// call sites match exhaustively instead of comparing sentinels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpectedVersion {
    /// No concurrency check -- the commit is admitted regardless of stream state.
    Any,
    /// Stream must not exist (first write to a new stream).
    NoStream,
    /// Stream's last committed event number must be exactly this value.
    Exact(u64),
}

impl ExpectedVersion {
    /// Raw signed encoding used inside prepare records: `Any` is -2, `NoStream`
    /// is -1, `Exact(n)` is `n`.
    pub fn raw(self) -> i64 {
        match self {
            ExpectedVersion::Any => EXPECTED_ANY,
            ExpectedVersion::NoStream => NO_STREAM,
            ExpectedVersion::Exact(n) => n as i64,
        }
    }

    /// Decode the raw signed encoding. Returns `None` for values below -2,
    /// which no writer ever produces.
    pub fn from_raw(raw: i64) -> Option<ExpectedVersion> {
        match raw {
            EXPECTED_ANY => Some(ExpectedVersion::Any),
            NO_STREAM => Some(ExpectedVersion::NoStream),
            n if n >= 0 => Some(ExpectedVersion::Exact(n as u64)),
            _ => None,
        }
    }
}

impl std::fmt::Display for ExpectedVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExpectedVersion::Any => write!(f, "Any"),
            ExpectedVersion::NoStream => write!(f, "NoStream"),
            ExpectedVersion::Exact(n) => write!(f, "{n}"),
        }
    }
}

/// An event the client wants to append to a stream.
///
/// The client assigns the `event_id` (a UUID serving as an idempotency key) and
/// provides the event type tag, metadata, and payload as opaque byte buffers.
/// The server does not interpret payload or metadata contents.
#[derive(Debug, Clone, PartialEq)]
pub struct ProposedEvent {
    /// Client-assigned unique ID for this event.
    pub event_id: Uuid,
    /// Event type tag (UTF-8, max 256 bytes).
    pub event_type: String,
    /// Opaque infrastructure context (correlation ID, causation ID, etc.).
    pub metadata: Bytes,
    /// Opaque domain event body.
    pub payload: Bytes,
}

/// A committed event with server-assigned numbers and positions.
///
/// Produced only from a prepare record that has been covered by a commit record.
/// `event_number` is the zero-based, contiguous index within the stream;
/// `global_position` is the zero-based index in overall commit order;
/// `log_position` is the byte address of the underlying prepare in the log.
/// All fields are immutable once assigned.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedEvent {
    /// Client-assigned unique ID.
    pub event_id: Uuid,
    /// Stream this event belongs to.
    pub stream_id: String,
    /// Zero-based, contiguous event number within the stream.
    pub event_number: i64,
    /// Zero-based position in overall commit order.
    pub global_position: u64,
    /// Byte address of the underlying prepare record in the log.
    pub log_position: u64,
    /// Unix epoch milliseconds, server-assigned at prepare time.
    pub recorded_at: u64,
    /// Event type tag.
    pub event_type: String,
    /// Opaque metadata bytes.
    pub metadata: Bytes,
    /// Opaque payload bytes.
    pub payload: Bytes,
}

/// A message yielded by subscription streams (`subscribe_all`).
///
/// During the catch-up phase the stream yields `Event` variants wrapping each
/// historical committed event in an `Arc` to avoid deep-cloning event data
/// across subscribers. Once catch-up completes the stream yields a single
/// `CaughtUp` marker, then forwards live events from the broadcast channel.
#[derive(Debug, Clone)]
pub enum SubscriptionMessage {
    /// A committed event, shared via `Arc` across subscribers.
    Event(Arc<RecordedEvent>),
    /// Marks the end of the catch-up phase.
    CaughtUp,
}

/// Metadata about a single stream returned by `ReadIndex::list_streams`.
///
/// Carries no event data -- only stream-level summary information.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamInfo {
    /// Stream identifier.
    pub stream_id: String,
    /// Total number of committed events in the stream.
    pub event_count: u64,
    /// Last committed event number, or [`DELETED_STREAM`] for a tombstoned stream.
    pub last_event_number: i64,
    /// Whether the stream has been deleted.
    pub is_deleted: bool,
}
