//! Durable FIFO queue of pending mutations.
//!
//! The whole queue is kept in memory and written through to [`StateStorage`]
//! as a single JSON document on every change, so a restart sees exactly the
//! state of the last successful write.

use chrono::{DateTime, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::db::StateStorage;
use crate::error::PersistenceError;

/// State key under which the serialized queue is stored.
pub const QUEUE_STATE_KEY: &str = "queue_state";

/// Opaque record identifier: `sync_<unix millis>_<random suffix>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MutationId(String);

impl MutationId {
  fn generate(at: DateTime<Utc>) -> Self {
    let suffix: String = rand::thread_rng()
      .sample_iter(&Alphanumeric)
      .take(10)
      .map(|c| (c as char).to_ascii_lowercase())
      .collect();
    Self(format!("sync_{}_{}", at.timestamp_millis(), suffix))
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl fmt::Display for MutationId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

impl From<&str> for MutationId {
  fn from(s: &str) -> Self {
    Self(s.to_string())
  }
}

/// What a mutation changes on the remote side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationKind {
  ReadingProgress,
  Bookmark,
  Settings,
}

impl MutationKind {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::ReadingProgress => "reading_progress",
      Self::Bookmark => "bookmark",
      Self::Settings => "settings",
    }
  }
}

impl fmt::Display for MutationKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl std::str::FromStr for MutationKind {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_ascii_lowercase().replace('-', "_").as_str() {
      "reading_progress" | "progress" => Ok(Self::ReadingProgress),
      "bookmark" => Ok(Self::Bookmark),
      "settings" => Ok(Self::Settings),
      other => Err(format!("unknown mutation kind: {}", other)),
    }
  }
}

/// One locally generated change waiting to be delivered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MutationRecord {
  pub id: MutationId,
  pub kind: MutationKind,
  pub payload: serde_json::Value,
  pub enqueued_at: DateTime<Utc>,
  /// Failed delivery attempts so far. Never decreases.
  pub attempts: u32,
}

/// What happened to a record after a failed delivery.
#[derive(Debug, Clone, PartialEq)]
pub enum FailureOutcome {
  /// Still queued; holds the new attempt count.
  Retry(u32),
  /// Reached the retry bound and was removed.
  Exhausted(MutationRecord),
  /// The record was no longer queued (removed or cleared meanwhile).
  Missing,
}

/// Ordered, persisted list of pending mutations.
pub struct DurableQueue {
  records: Mutex<Vec<MutationRecord>>,
  storage: Arc<dyn StateStorage>,
  clock: Arc<dyn Clock>,
}

impl DurableQueue {
  /// Create a queue over `storage` and load whatever it holds.
  pub fn open(storage: Arc<dyn StateStorage>, clock: Arc<dyn Clock>) -> Self {
    let queue = Self {
      records: Mutex::new(Vec::new()),
      storage,
      clock,
    };
    queue.load();
    queue
  }

  /// Append a new record and persist the queue.
  ///
  /// If the write fails the record is not kept and the error is returned.
  pub fn enqueue(
    &self,
    kind: MutationKind,
    payload: serde_json::Value,
  ) -> Result<MutationId, PersistenceError> {
    let now = self.clock.now();
    let record = MutationRecord {
      id: MutationId::generate(now),
      kind,
      payload,
      enqueued_at: now,
      attempts: 0,
    };
    let id = record.id.clone();

    let mut records = self.records.lock()?;
    records.push(record);
    if let Err(e) = self.write(&records) {
      records.pop();
      return Err(e);
    }

    debug!(id = %id, kind = %kind, pending = records.len(), "Enqueued mutation");
    Ok(id)
  }

  /// Snapshot of all pending records in insertion order.
  pub fn peek_all(&self) -> Result<Vec<MutationRecord>, PersistenceError> {
    Ok(self.records.lock()?.clone())
  }

  /// Remove a record. Removing an absent id is a no-op returning `false`.
  ///
  /// The removal stands even if it can't be written.
  pub fn remove(&self, id: &MutationId) -> Result<bool, PersistenceError> {
    let mut records = self.records.lock()?;
    let Some(pos) = records.iter().position(|r| &r.id == id) else {
      return Ok(false);
    };
    records.remove(pos);
    self.write_through(&records);
    Ok(true)
  }

  /// Count one failed delivery, dropping the record once it reaches `retry_limit`.
  ///
  /// The outcome is always reported, even if it can't be written.
  pub fn record_failure(
    &self,
    id: &MutationId,
    retry_limit: u32,
  ) -> Result<FailureOutcome, PersistenceError> {
    let mut records = self.records.lock()?;
    let Some(pos) = records.iter().position(|r| &r.id == id) else {
      return Ok(FailureOutcome::Missing);
    };

    records[pos].attempts = records[pos].attempts.saturating_add(1);
    let attempts = records[pos].attempts;
    let outcome = if attempts >= retry_limit {
      FailureOutcome::Exhausted(records.remove(pos))
    } else {
      FailureOutcome::Retry(attempts)
    };

    self.write_through(&records);
    Ok(outcome)
  }

  /// Drop every pending record.
  pub fn clear(&self) -> Result<usize, PersistenceError> {
    let mut records = self.records.lock()?;
    let dropped = records.len();
    records.clear();
    self.write(&records)?;
    Ok(dropped)
  }

  pub fn len(&self) -> usize {
    self.records.lock().unwrap_or_else(|e| e.into_inner()).len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Write the current queue to storage.
  pub fn persist(&self) -> Result<(), PersistenceError> {
    let records = self.records.lock()?;
    self.write(&records)
  }

  /// Replace the in-memory queue with the stored one.
  ///
  /// A missing, empty or unreadable store resets the queue to empty.
  pub fn load(&self) {
    let loaded = match self.read() {
      Ok(records) => records,
      Err(e) => {
        warn!(error = %e, "Discarding unreadable sync queue");
        Vec::new()
      }
    };

    match self.records.lock() {
      Ok(mut records) => *records = loaded,
      Err(poisoned) => *poisoned.into_inner() = loaded,
    }
  }

  fn read(&self) -> Result<Vec<MutationRecord>, PersistenceError> {
    let Some(bytes) = self.storage.read_state(QUEUE_STATE_KEY)? else {
      return Ok(Vec::new());
    };
    if bytes.iter().all(u8::is_ascii_whitespace) {
      return Ok(Vec::new());
    }

    serde_json::from_slice(&bytes).map_err(|e| PersistenceError::Corrupt {
      key: QUEUE_STATE_KEY.to_string(),
      reason: e.to_string(),
    })
  }

  fn write(&self, records: &[MutationRecord]) -> Result<(), PersistenceError> {
    let bytes = serde_json::to_vec(records)?;
    self.storage.write_state(QUEUE_STATE_KEY, &bytes)
  }

  /// Write after a change that has already been applied in memory.
  ///
  /// A failed write leaves the queue running in memory only until the next
  /// successful write catches storage up.
  fn write_through(&self, records: &[MutationRecord]) {
    if let Err(e) = self.write(records) {
      warn!(pending = records.len(), error = %e, "Failed to persist sync queue, continuing in memory");
    }
  }

  /// Poison the record lock, simulating a structural failure.
  #[cfg(test)]
  pub(crate) fn poison(&self) {
    let _ = std::thread::scope(|s| {
      s.spawn(|| {
        let _guard = self.records.lock();
        panic!("poisoning queue lock");
      })
      .join()
    });
  }
}
