//! Tidelog: the append-only transaction-log storage core of an event-sourcing
//! database.
//!
//! The log stores immutable prepare and commit records per stream; a read index
//! answers "what is the current version of stream S, and can this pending
//! transaction be committed?". Commit admission runs under optimistic
//! concurrency: any number of writers may stage prepares for the same stream,
//! the index advances only on commit, and
//! [`ReadIndex::check_commit_starting_at`] decides -- as of a checkpoint bound
//! -- between a legal append, a conflict, a safe idempotent replay, and a
//! data-integrity failure.

pub mod accumulator;
pub mod broker;
pub mod checkpoint;
pub mod codec;
pub mod config;
pub mod dedup;
pub mod error;
pub mod index;
pub mod reader;
pub mod record;
pub mod store;
pub mod types;
pub mod validator;
pub mod writer;

pub use broker::{subscribe_all, Broker};
pub use checkpoint::Checkpoint;
pub use config::Config;
pub use error::Error;
pub use reader::ReadIndex;
pub use record::{CommitLogRecord, LogRecord, PrepareFlags, PrepareLogRecord};
pub use store::TransactionLog;
pub use types::{
    ExpectedVersion, ProposedEvent, RecordedEvent, StreamInfo, SubscriptionMessage,
    DELETED_STREAM, EXPECTED_ANY, MAX_EVENT_SIZE, MAX_EVENT_TYPE_LEN, NO_STREAM,
};
pub use validator::{CommitCheckResult, CommitDecision};
pub use writer::{spawn_writer, WriterHandle};
