//! In-memory working set for the loaded subject.

use std::collections::{BTreeMap, HashMap};
use std::time::Instant;
use tracing::{debug, error};

use super::storage::{ActivityStorage, StoredStream};
use crate::error::{Result, StreamError};
use crate::stream::{ActivityEvent, ReplyThread, Subject};

/// Events and reply threads for one subject, keyed by id.
#[derive(Debug, Default)]
pub struct WorkingSet {
  events: BTreeMap<i64, ActivityEvent>,
  threads: HashMap<i64, ReplyThread>,
}

impl WorkingSet {
  pub fn new() -> Self {
    Self::default()
  }

  fn from_stored(stored: StoredStream) -> Self {
    Self {
      events: stored.events,
      threads: stored.threads,
    }
  }

  /// Read the cached stream for `subject`.
  ///
  /// A store that cannot be read is logged and yields an empty set.
  pub fn load<S: ActivityStorage + ?Sized>(storage: &S, subject: &Subject, limit: usize) -> Self {
    let started = Instant::now();
    match storage.load_all(subject, limit) {
      Ok(stored) => {
        let working_set = Self::from_stored(stored);
        debug!(
          "Loaded {} events and {} notes from cache in {:.4}s",
          working_set.len(),
          working_set.thread_count(),
          started.elapsed().as_secs_f64()
        );
        working_set
      }
      Err(e) => {
        error!(%subject, "Could not load activity stream data from cache: {}", e);
        Self::new()
      }
    }
  }

  pub fn len(&self) -> usize {
    self.events.len()
  }

  pub fn thread_count(&self) -> usize {
    self.threads.len()
  }

  /// Largest known event id.
  pub fn high_water_mark(&self) -> Option<i64> {
    self.events.keys().next_back().copied()
  }

  /// Event ids, oldest first. With a limit, only the newest `limit` are kept.
  pub fn activity_ids(&self, limit: Option<usize>) -> Vec<i64> {
    let skip = limit.map_or(0, |limit| self.events.len().saturating_sub(limit));
    self.events.keys().skip(skip).copied().collect()
  }

  pub fn event(&self, id: i64) -> Result<&ActivityEvent> {
    self.events.get(&id).ok_or(StreamError::NotFound {
      kind: "activity",
      id,
    })
  }

  pub fn thread(&self, note_id: i64) -> Result<&ReplyThread> {
    self.threads.get(&note_id).ok_or(StreamError::NotFound {
      kind: "note thread",
      id: note_id,
    })
  }

  /// Insert or overwrite an event. A thread link already known is kept.
  pub fn merge_event(&mut self, mut event: ActivityEvent) {
    if event.note_id.is_none() {
      event.note_id = self.events.get(&event.id).and_then(|e| e.note_id);
    }
    self.events.insert(event.id, event);
  }

  pub fn replace_thread(&mut self, thread: ReplyThread) {
    self.threads.insert(thread.note_id, thread);
  }

  /// Attach a note to an event that has none yet.
  pub fn link_note(&mut self, event_id: i64, note_id: i64) {
    if let Some(event) = self.events.get_mut(&event_id) {
      event.note_id.get_or_insert(note_id);
    }
  }
}
