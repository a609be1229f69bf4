//! Bounded in-memory journal of recent pool and migration events.

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

use chrono::Utc;
use findex_db::{MigrationEvent, MigrationObserver, PoolEvent, PoolObserver};

use crate::event::{DiagnosticEvent, EventDomain, EventPayload};

/// Default number of events kept.
pub const DEFAULT_JOURNAL_CAPACITY: usize = 256;

#[derive(Debug)]
struct JournalInner {
    events: VecDeque<DiagnosticEvent>,
    next_seq: u64,
}

/// Ring buffer of the most recent events. Attach it to a pool and an
/// executor; once full, the oldest event is dropped for each new one.
#[derive(Debug)]
pub struct EventJournal {
    inner: Mutex<JournalInner>,
    capacity: usize,
}

impl Default for EventJournal {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_JOURNAL_CAPACITY)
    }
}

impl EventJournal {
    /// A journal holding the default number of events.
    pub fn new() -> Self {
        Self::default()
    }

    /// A journal keeping at most `capacity` events (at least one).
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Mutex::new(JournalInner {
                events: VecDeque::with_capacity(capacity),
                next_seq: 1,
            }),
            capacity,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, JournalInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Appends an event and returns its sequence number.
    pub fn record(&self, domain: EventDomain, kind: &'static str, payload: EventPayload) -> u64 {
        let mut inner = self.lock();
        let seq = inner.next_seq;
        inner.next_seq += 1;
        if inner.events.len() == self.capacity {
            inner.events.pop_front();
        }
        inner.events.push_back(DiagnosticEvent {
            seq,
            recorded_at: Utc::now(),
            domain,
            kind,
            payload,
        });
        seq
    }

    /// Copies the journal, oldest event first.
    pub fn snapshot(&self) -> Vec<DiagnosticEvent> {
        self.lock().events.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of events retained.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Drops every event. Sequence numbers keep counting.
    pub fn clear(&self) {
        self.lock().events.clear();
    }
}

impl PoolObserver for EventJournal {
    fn on_pool_event(&self, event: &PoolEvent) {
        self.record(EventDomain::Pool, event.kind(), event.into());
    }
}

impl MigrationObserver for EventJournal {
    fn on_migration_event(&self, event: &MigrationEvent) {
        self.record(EventDomain::Migration, event.kind(), event.into());
    }
}
