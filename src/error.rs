//! Error taxonomy for the sync engine.
//!
//! Per-record failures never escape the drain loop; they travel as event data.
//! Only structural failures (the queue cannot be read) abort a pass.

use std::time::Duration;

use thiserror::Error;

use crate::queue::{MutationId, MutationRecord};

/// Local storage is unavailable or holds data we cannot read.
#[derive(Debug, Error)]
pub enum PersistenceError {
  #[error("storage unavailable: {0}")]
  Unavailable(String),

  #[error("stored state for {key} is corrupt: {reason}")]
  Corrupt { key: String, reason: String },

  #[error("sqlite error: {0}")]
  Sqlite(#[from] rusqlite::Error),

  #[error("serialization error: {0}")]
  Serialize(#[from] serde_json::Error),

  #[error("lock poisoned: {0}")]
  LockPoisoned(String),
}

impl<T> From<std::sync::PoisonError<T>> for PersistenceError {
  fn from(e: std::sync::PoisonError<T>) -> Self {
    Self::LockPoisoned(e.to_string())
  }
}

/// Transient network failure. Drives the retry counter, never fatal.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NetworkError {
  #[error("request timed out after {0:?}")]
  Timeout(Duration),

  #[error("transport error: {0}")]
  Transport(String),

  #[error("remote responded with status {0}")]
  Status(u16),
}

impl From<reqwest::Error> for NetworkError {
  fn from(e: reqwest::Error) -> Self {
    if e.is_timeout() {
      // reqwest doesn't report the configured duration back
      return Self::Transport(format!("timed out: {}", e));
    }
    match e.status() {
      Some(status) => Self::Status(status.as_u16()),
      None => Self::Transport(e.to_string()),
    }
  }
}

/// A record hit the retry bound and was dropped from the queue.
///
/// The only recovery path is a manual re-enqueue by the caller.
#[derive(Debug, Clone, Error)]
#[error("mutation {} dropped after {} attempts: {}", .record.id, .record.attempts, .last_error)]
pub struct RetryExhausted {
  pub record: MutationRecord,
  pub last_error: NetworkError,
}

impl RetryExhausted {
  pub fn id(&self) -> &MutationId {
    &self.record.id
  }
}

/// Installing a new cache generation failed; the previous one stays active.
#[derive(Debug, Clone, Error)]
pub enum PrecacheFailure {
  #[error("failed to fetch {key}: {source}")]
  Fetch { key: String, source: NetworkError },

  #[error("{key} responded with status {status}")]
  BadStatus { key: String, status: u16 },

  #[error("invalid manifest entry {key}: {reason}")]
  InvalidKey { key: String, reason: String },

  #[error("failed to store precached entries: {0}")]
  Storage(String),
}

impl From<PersistenceError> for PrecacheFailure {
  fn from(e: PersistenceError) -> Self {
    Self::Storage(e.to_string())
  }
}

/// A lifecycle step was requested out of order or failed.
#[derive(Debug, Error)]
pub enum LifecycleError {
  #[error("cannot activate a worker in state {0:?}")]
  NotInstalled(crate::lifecycle::WorkerState),

  #[error(transparent)]
  Precache(#[from] PrecacheFailure),

  #[error(transparent)]
  Persistence(#[from] PersistenceError),
}
