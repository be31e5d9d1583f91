//! Bounded LRU duplicate detection for retried append requests.
//!
//! Tracks recently committed event IDs so that a client retry can be detected
//! before any new prepares are appended, and the originally recorded events
//! returned instead. This complements the validator's idempotency branch: the
//! validator recognizes a replay of the *same* durable transaction position,
//! while this index recognizes a *re-submitted request* that would otherwise
//! write brand-new prepares with previously committed event IDs.
//!
//! The index is an LRU cache keyed by event ID, so the most recently committed
//! events remain dedup-eligible while older entries are evicted.

use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use uuid::Uuid;

use crate::types::{ProposedEvent, RecordedEvent};

/// Bounded LRU index mapping event IDs to their committed batch.
///
/// Each entry maps one event ID to the full batch of [`RecordedEvent`]s that
/// were committed together; multiple event IDs from the same batch share a
/// single `Arc` allocation.
pub struct DedupIndex {
    /// LRU cache mapping event IDs to the batch that contained them.
    cache: LruCache<Uuid, Arc<Vec<RecordedEvent>>>,
}

impl DedupIndex {
    /// Create a new dedup index tracking at most `capacity` event IDs.
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            cache: LruCache::new(capacity),
        }
    }

    /// Check whether a proposed batch is a retry of a previously committed one.
    ///
    /// Looks up the first event's ID. A hit counts only if the cached batch
    /// carries the *same event-id sequence* as the proposal -- a partial match
    /// falls through to the normal append path, where the expected-version
    /// check rejects it as a genuine conflict. Returns `None` for an empty
    /// proposal or a miss.
    pub fn check(&mut self, proposed: &[ProposedEvent]) -> Option<Arc<Vec<RecordedEvent>>> {
        let first = proposed.first()?;
        // get() promotes the entry in LRU order, keeping retried batches warm.
        let recorded = self.cache.get(&first.event_id)?;
        let same_sequence = recorded.len() == proposed.len()
            && recorded
                .iter()
                .zip(proposed)
                .all(|(r, p)| r.event_id == p.event_id);
        if same_sequence {
            Some(Arc::clone(recorded))
        } else {
            None
        }
    }

    /// Record a successfully committed batch.
    ///
    /// Inserts one cache entry per event ID, all pointing at the same shared
    /// allocation, so a retry keyed on any event of the batch resolves to the
    /// full original result.
    pub fn record(&mut self, recorded: Vec<RecordedEvent>) {
        let shared = Arc::new(recorded);
        for event in shared.iter() {
            self.cache.put(event.event_id, Arc::clone(&shared));
        }
    }

    /// Seed the index from committed events recovered during startup.
    ///
    /// Each event is inserted as a single-event batch in ascending global
    /// order; because `put` marks the key most-recently-used, the newest
    /// events end up LRU-hottest, and anything beyond capacity is evicted
    /// oldest-first.
    pub fn seed_from_log(&mut self, events: &[RecordedEvent]) {
        for event in events {
            let batch = Arc::new(vec![event.clone()]);
            self.cache.put(event.event_id, batch);
        }
    }
}
