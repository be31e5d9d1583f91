//! Broadcast broker for live subscriptions to committed events.
//!
//! The writer task publishes newly committed events after fsync + index apply,
//! and all active subscribers receive them as `Arc<RecordedEvent>` so the event
//! data is shared rather than deep-cloned per subscriber. Uncommitted prepares
//! are never published -- subscribers observe exactly the committed order.

use std::sync::Arc;

use async_stream::stream;
use tokio::sync::broadcast;

use crate::error::Error;
use crate::reader::ReadIndex;
use crate::types::{RecordedEvent, SubscriptionMessage};

/// Broadcast broker for pushing newly committed events to live subscribers.
#[derive(Clone)]
pub struct Broker {
    tx: broadcast::Sender<Arc<RecordedEvent>>,
}

impl Broker {
    /// Create a new broker with the given broadcast channel capacity.
    ///
    /// `capacity` bounds how many events the channel buffers before lagging
    /// subscribers are dropped. Must be greater than zero.
    pub fn new(capacity: usize) -> Self {
        // The initial receiver is discarded; subscribers obtain their own
        // via `subscribe()`.
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish committed events to all active subscribers.
    ///
    /// Publishing to an empty channel is expected during startup or when no
    /// clients are connected; the send error is logged at debug level only.
    pub fn publish(&self, events: &[RecordedEvent]) {
        for event in events {
            let arc_event = Arc::new(event.clone());
            if self.tx.send(arc_event).is_err() {
                tracing::debug!("broker publish: no active receivers");
            }
        }
    }

    /// Create a new broadcast receiver for live events.
    ///
    /// The receiver sees events published after this call; history is served
    /// by the catch-up phase of [`subscribe_all`].
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<RecordedEvent>> {
        self.tx.subscribe()
    }
}

/// Number of events to read per batch during the catch-up phase of a
/// subscription. Keeps memory bounded for large catch-up ranges.
const CATCHUP_BATCH_SIZE: u64 = 500;

/// Create an async stream that replays committed history from `from_position`
/// (global commit order), emits a `CaughtUp` marker, then forwards live events.
///
/// The broadcast receiver registers **before** the historical read begins, so
/// events committed between the end of catch-up and the start of live
/// listening are buffered, not lost; any already replayed during catch-up are
/// filtered out by global position.
///
/// The stream terminates with `Err(Error::InvalidArgument)` if the subscriber
/// falls behind the broadcast buffer; the consumer should re-subscribe from
/// its last processed position.
pub fn subscribe_all(
    read_index: ReadIndex,
    broker: &Broker,
    from_position: u64,
) -> impl futures_core::Stream<Item = Result<SubscriptionMessage, Error>> {
    // Register the live receiver before reading history.
    let mut rx = broker.subscribe();

    stream! {
        // Phase 1: catch-up over committed history, in batches.
        let mut next = from_position;
        loop {
            let batch = read_index.read_all(next, CATCHUP_BATCH_SIZE);
            if batch.is_empty() {
                break;
            }
            next += batch.len() as u64;
            for event in batch {
                yield Ok(SubscriptionMessage::Event(Arc::new(event)));
            }
        }

        yield Ok(SubscriptionMessage::CaughtUp);

        // Phase 2: live events from the broadcast channel. Skip anything the
        // catch-up already delivered.
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if event.global_position < next {
                        continue;
                    }
                    next = event.global_position + 1;
                    yield Ok(SubscriptionMessage::Event(event));
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    yield Err(Error::InvalidArgument(format!(
                        "subscription lagged behind by {missed} events"
                    )));
                    break;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
}
