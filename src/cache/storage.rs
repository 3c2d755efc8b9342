//! Activity storage trait and SQLite implementation.

use rusqlite::{params, Connection};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use tracing::{debug, warn};

use super::codec::{decode, encode};
use crate::error::{Result, StreamError};
use crate::stream::{ActivityEvent, ReplyThread, Subject};

/// Version tag of the on-disk layout. Bumping it starts a fresh file.
pub const PROTOCOL_VERSION: i64 = 1;

/// Events and threads read back from the store for one subject.
#[derive(Debug, Default)]
pub struct StoredStream {
  pub events: BTreeMap<i64, ActivityEvent>,
  pub threads: HashMap<i64, ReplyThread>,
}

/// Trait for activity storage backends.
pub trait ActivityStorage {
  /// Read up to `limit` of the newest events for a subject, with their threads.
  fn load_all(&self, subject: &Subject, limit: usize) -> Result<StoredStream>;

  /// Insert events not yet stored and link them to the subject.
  fn upsert_events(&self, subject: &Subject, events: &[ActivityEvent]) -> Result<()>;

  /// Replace the thread for a note and point the event at it.
  fn replace_thread(&self, event_id: i64, thread: &ReplyThread) -> Result<()>;
}

impl<T: ActivityStorage + ?Sized> ActivityStorage for Box<T> {
  fn load_all(&self, subject: &Subject, limit: usize) -> Result<StoredStream> {
    (**self).load_all(subject, limit)
  }

  fn upsert_events(&self, subject: &Subject, events: &[ActivityEvent]) -> Result<()> {
    (**self).upsert_events(subject, events)
  }

  fn replace_thread(&self, event_id: i64, thread: &ReplyThread) -> Result<()> {
    (**self).replace_thread(event_id, thread)
  }
}

/// Storage implementation that doesn't persist anything.
/// Used when caching is disabled.
pub struct NoopStorage;

impl ActivityStorage for NoopStorage {
  fn load_all(&self, _subject: &Subject, _limit: usize) -> Result<StoredStream> {
    Ok(StoredStream::default())
  }

  fn upsert_events(&self, _subject: &Subject, _events: &[ActivityEvent]) -> Result<()> {
    Ok(())
  }

  fn replace_thread(&self, _event_id: i64, _thread: &ReplyThread) -> Result<()> {
    Ok(())
  }
}

/// SQLite-backed storage.
///
/// A connection is opened for each call and closed when it returns, so no
/// handle is held across calls.
pub struct SqliteStorage {
  path: PathBuf,
}

impl SqliteStorage {
  /// Open the store at `path`, creating the file and schema if needed.
  pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
    let path = path.into();

    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent).map_err(|e| StreamError::storage(&path, e))?;
    }

    let storage = Self { path };
    storage.connect()?;
    Ok(storage)
  }

  /// Store file name for the current protocol version.
  pub fn file_name() -> String {
    format!("activity_stream_v{}.sqlite", PROTOCOL_VERSION)
  }

  fn connect(&self) -> Result<Connection> {
    let conn = Connection::open(&self.path).map_err(|e| self.unavailable(e))?;

    let version: i64 = conn
      .query_row("PRAGMA user_version", [], |row| row.get(0))
      .map_err(|e| self.unavailable(e))?;

    match version {
      0 => {
        debug!(path = %self.path.display(), "Creating activity cache schema");
        conn
          .execute_batch(SCHEMA)
          .map_err(|e| self.unavailable(e))?;
        conn
          .pragma_update(None, "user_version", PROTOCOL_VERSION)
          .map_err(|e| self.unavailable(e))?;
      }
      PROTOCOL_VERSION => {}
      other => {
        return Err(StreamError::storage(
          &self.path,
          format!(
            "schema version {} does not match protocol version {}",
            other, PROTOCOL_VERSION
          ),
        ))
      }
    }

    Ok(conn)
  }

  fn unavailable(&self, e: rusqlite::Error) -> StreamError {
    StreamError::storage(&self.path, e)
  }
}

/// Schema for the activity cache.
const SCHEMA: &str = r#"
-- Which activities belong to which subject
CREATE TABLE IF NOT EXISTS entity (
    entity_type TEXT NOT NULL,
    entity_id INTEGER NOT NULL,
    activity_id INTEGER NOT NULL,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE INDEX IF NOT EXISTS idx_entity_subject ON entity(entity_type, entity_id);
CREATE UNIQUE INDEX IF NOT EXISTS idx_entity_link ON entity(entity_type, entity_id, activity_id);

-- Activity payloads, first write wins
CREATE TABLE IF NOT EXISTS activity (
    activity_id INTEGER PRIMARY KEY,
    note_id INTEGER DEFAULT NULL,
    payload BLOB NOT NULL,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE INDEX IF NOT EXISTS idx_activity_note ON activity(activity_id, note_id);

-- Note threads, replaced wholesale
CREATE TABLE IF NOT EXISTS note (
    note_id INTEGER PRIMARY KEY,
    payload BLOB NOT NULL,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

impl ActivityStorage for SqliteStorage {
  fn load_all(&self, subject: &Subject, limit: usize) -> Result<StoredStream> {
    let conn = self.connect()?;

    let mut stmt = conn
      .prepare(
        "SELECT a.activity_id, a.payload, n.note_id, n.payload
         FROM activity a
         INNER JOIN entity e ON e.activity_id = a.activity_id
         LEFT OUTER JOIN note n ON a.note_id = n.note_id
         WHERE e.entity_type = ? AND e.entity_id = ?
         ORDER BY a.activity_id DESC
         LIMIT ?",
      )
      .map_err(|e| self.unavailable(e))?;

    let rows = stmt
      .query_map(
        params![subject.entity_type, subject.entity_id, limit as i64],
        |row| {
          Ok((
            row.get::<_, i64>(0)?,
            row.get::<_, Vec<u8>>(1)?,
            row.get::<_, Option<i64>>(2)?,
            row.get::<_, Option<Vec<u8>>>(3)?,
          ))
        },
      )
      .map_err(|e| self.unavailable(e))?;

    let mut stored = StoredStream::default();

    for row in rows {
      let (activity_id, payload, note_id, note_payload) = row.map_err(|e| self.unavailable(e))?;

      let mut event = match decode(&payload).and_then(|p| ActivityEvent::from_payload(&p)) {
        Ok(event) => event,
        Err(e) => {
          warn!(activity_id, "Skipping unreadable cached activity: {}", e);
          continue;
        }
      };

      event.note_id = note_id;
      if let (Some(note_id), Some(note_payload)) = (note_id, note_payload) {
        match decode(&note_payload).and_then(|p| ReplyThread::from_payload(note_id, &p)) {
          Ok(thread) => {
            stored.threads.insert(note_id, thread);
          }
          Err(e) => warn!(note_id, "Skipping unreadable cached note thread: {}", e),
        }
      }

      stored.events.insert(activity_id, event);
    }

    Ok(stored)
  }

  fn upsert_events(&self, subject: &Subject, events: &[ActivityEvent]) -> Result<()> {
    debug!("Updating database with {} new events", events.len());

    // Encode up front so a bad record abandons the call before touching disk.
    let encoded = events
      .iter()
      .map(|event| -> Result<(i64, Vec<u8>)> { Ok((event.id, encode(&event.to_payload()?)?)) })
      .collect::<Result<Vec<_>>>()?;

    let mut conn = self.connect()?;
    let tx = conn.transaction().map_err(|e| self.unavailable(e))?;

    for (activity_id, payload) in &encoded {
      tx.execute(
        "INSERT OR IGNORE INTO activity (activity_id, payload, created_at)
         VALUES (?, ?, datetime('now'))",
        params![activity_id, payload],
      )
      .map_err(|e| self.unavailable(e))?;

      tx.execute(
        "INSERT OR IGNORE INTO entity (entity_type, entity_id, activity_id, created_at)
         VALUES (?, ?, ?, datetime('now'))",
        params![subject.entity_type, subject.entity_id, activity_id],
      )
      .map_err(|e| self.unavailable(e))?;
    }

    tx.commit().map_err(|e| self.unavailable(e))?;

    Ok(())
  }

  fn replace_thread(&self, event_id: i64, thread: &ReplyThread) -> Result<()> {
    debug!(
      "Adding note {} to database, linking it to event {}",
      thread.note_id, event_id
    );

    let payload = encode(&thread.to_payload()?)?;

    let mut conn = self.connect()?;
    let tx = conn.transaction().map_err(|e| self.unavailable(e))?;

    tx.execute("DELETE FROM note WHERE note_id = ?", params![thread.note_id])
      .map_err(|e| self.unavailable(e))?;

    tx.execute(
      "INSERT INTO note (note_id, payload, created_at) VALUES (?, ?, datetime('now'))",
      params![thread.note_id, payload],
    )
    .map_err(|e| self.unavailable(e))?;

    tx.execute(
      "UPDATE activity SET note_id = ? WHERE activity_id = ?",
      params![thread.note_id, event_id],
    )
    .map_err(|e| self.unavailable(e))?;

    tx.commit().map_err(|e| self.unavailable(e))?;

    Ok(())
  }
}

#[cfg(test)]
use rusqlite::OptionalExtension;
#[cfg(test)]
use std::path::Path;

#[cfg(test)]
impl SqliteStorage {
  pub fn path(&self) -> &Path {
    &self.path
  }

  /// Number of distinct activities stored, across all subjects.
  pub fn activity_count(&self) -> Result<usize> {
    let conn = self.connect()?;
    let count: i64 = conn
      .query_row("SELECT COUNT(*) FROM activity", [], |row| row.get(0))
      .map_err(|e| self.unavailable(e))?;
    Ok(count as usize)
  }

  /// Raw stored thread payload for a note, if any.
  pub fn thread_rows(&self, note_id: i64) -> Result<Vec<Vec<u8>>> {
    let conn = self.connect()?;
    let mut stmt = conn
      .prepare("SELECT payload FROM note WHERE note_id = ?")
      .map_err(|e| self.unavailable(e))?;
    let rows = stmt
      .query_map(params![note_id], |row| row.get(0))
      .map_err(|e| self.unavailable(e))?
      .collect::<rusqlite::Result<Vec<Vec<u8>>>>()
      .map_err(|e| self.unavailable(e))?;
    Ok(rows)
  }

  /// Thread linked to an activity, as recorded in the activity row.
  pub fn linked_note(&self, activity_id: i64) -> Result<Option<i64>> {
    let conn = self.connect()?;
    conn
      .query_row(
        "SELECT note_id FROM activity WHERE activity_id = ?",
        params![activity_id],
        |row| row.get::<_, Option<i64>>(0),
      )
      .optional()
      .map(Option::flatten)
      .map_err(|e| self.unavailable(e))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::Payload;
  use crate::stream::UpdateType;
  use serde_json::json;

  fn storage() -> (tempfile::TempDir, SqliteStorage) {
    let dir = tempfile::tempdir().unwrap();
    let storage = SqliteStorage::open(dir.path().join(SqliteStorage::file_name())).unwrap();
    (dir, storage)
  }

  fn event(id: i64, update_type: &str) -> ActivityEvent {
    ActivityEvent::from_payload(&Payload::from_remote(json!({
      "id": id,
      "update_type": update_type,
      "primary_entity": {"type": "Note", "id": id * 100},
    })))
    .unwrap()
  }

  fn thread(note_id: i64, contents: &[&str]) -> ReplyThread {
    let entries = contents
      .iter()
      .enumerate()
      .map(|(i, c)| json!({"type": "Reply", "id": i, "content": c}))
      .collect::<Vec<_>>();
    ReplyThread::from_payload(note_id, &Payload::from_remote(json!(entries))).unwrap()
  }

  #[test]
  fn test_overlapping_upserts_store_distinct_ids() {
    let (_dir, storage) = storage();
    let subject = Subject::new("Shot", 1);

    storage
      .upsert_events(&subject, &[event(1, "create"), event(2, "update")])
      .unwrap();
    storage
      .upsert_events(&subject, &[event(2, "update"), event(3, "update")])
      .unwrap();
    storage
      .upsert_events(&subject, &[event(1, "create"), event(3, "update")])
      .unwrap();

    assert_eq!(storage.activity_count().unwrap(), 3);
    assert_eq!(storage.load_all(&subject, 1000).unwrap().events.len(), 3);
  }

  #[test]
  fn test_first_write_wins_for_payload() {
    let (_dir, storage) = storage();
    let subject = Subject::new("Shot", 1);

    storage.upsert_events(&subject, &[event(1, "create")]).unwrap();
    storage.upsert_events(&subject, &[event(1, "update")]).unwrap();

    let stored = storage.load_all(&subject, 1000).unwrap();
    assert_eq!(stored.events[&1].update_type, UpdateType::Create);
  }

  #[test]
  fn test_events_are_scoped_to_subject() {
    let (_dir, storage) = storage();
    let shot = Subject::new("Shot", 1);
    let asset = Subject::new("Asset", 1);

    storage.upsert_events(&shot, &[event(1, "create"), event(2, "update")]).unwrap();
    storage.upsert_events(&asset, &[event(2, "update"), event(3, "create")]).unwrap();

    let ids = |s: &Subject| storage.load_all(s, 1000).unwrap().events.into_keys().collect::<Vec<_>>();
    assert_eq!(ids(&shot), vec![1, 2]);
    assert_eq!(ids(&asset), vec![2, 3]);
    assert_eq!(storage.activity_count().unwrap(), 3);
  }

  #[test]
  fn test_load_limit_keeps_newest() {
    let (_dir, storage) = storage();
    let subject = Subject::new("Shot", 1);
    let events = (1..=5).map(|id| event(id, "update")).collect::<Vec<_>>();
    storage.upsert_events(&subject, &events).unwrap();

    let stored = storage.load_all(&subject, 2).unwrap();
    assert_eq!(stored.events.into_keys().collect::<Vec<_>>(), vec![4, 5]);
  }

  #[test]
  fn test_replace_thread_keeps_single_latest_record() {
    let (_dir, storage) = storage();
    let subject = Subject::new("Shot", 1);
    storage.upsert_events(&subject, &[event(1, "create_reply")]).unwrap();

    storage.replace_thread(1, &thread(100, &["first"])).unwrap();
    storage.replace_thread(1, &thread(100, &["second", "third"])).unwrap();

    let rows = storage.thread_rows(100).unwrap();
    assert_eq!(rows.len(), 1);
    let stored = ReplyThread::from_payload(100, &decode(&rows[0]).unwrap()).unwrap();
    assert_eq!(stored, thread(100, &["second", "third"]));

    let loaded = storage.load_all(&subject, 1000).unwrap();
    assert_eq!(loaded.events[&1].note_id, Some(100));
    assert_eq!(loaded.threads[&100].entries.len(), 2);
    assert_eq!(storage.linked_note(1).unwrap(), Some(100));
  }

  #[test]
  fn test_corrupt_row_is_skipped() {
    let (_dir, storage) = storage();
    let subject = Subject::new("Shot", 1);
    storage.upsert_events(&subject, &[event(1, "create"), event(2, "create")]).unwrap();

    let conn = Connection::open(storage.path()).unwrap();
    conn
      .execute("UPDATE activity SET payload = x'00ff' WHERE activity_id = 1", [])
      .unwrap();

    let stored = storage.load_all(&subject, 1000).unwrap();
    assert_eq!(stored.events.into_keys().collect::<Vec<_>>(), vec![2]);
  }

  #[test]
  fn test_foreign_schema_version_is_unavailable() {
    let (_dir, storage) = storage();
    let conn = Connection::open(storage.path()).unwrap();
    conn.pragma_update(None, "user_version", 99).unwrap();
    drop(conn);

    let result = storage.load_all(&Subject::new("Shot", 1), 10);
    assert!(matches!(result, Err(StreamError::StorageUnavailable { .. })));
  }

  #[test]
  fn test_open_on_directory_fails() {
    let dir = tempfile::tempdir().unwrap();
    let result = SqliteStorage::open(dir.path());
    assert!(matches!(result, Err(StreamError::StorageUnavailable { .. })));
  }
}
