//! Scripted collaborators shared by the unit tests.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio::sync::Semaphore;

use crate::db::{MemoryStorage, Result as StorageResult, StateStorage};
use crate::error::{NetworkError, PersistenceError};
use crate::queue::MutationRecord;
use crate::transport::{MutationDispatcher, Request, ResourceFetcher, Response};

/// State storage whose writes always fail.
pub struct FailingStorage;

impl StateStorage for FailingStorage {
  fn read_state(&self, _key: &str) -> StorageResult<Option<Vec<u8>>> {
    Ok(None)
  }

  fn write_state(&self, _key: &str, _value: &[u8]) -> StorageResult<()> {
    Err(PersistenceError::Unavailable("disk on fire".into()))
  }
}

/// Fetcher answering from a path -> response table; unknown paths fail.
#[derive(Default)]
pub struct ScriptedFetcher {
  responses: Mutex<HashMap<String, Response>>,
  calls: AtomicUsize,
}

impl ScriptedFetcher {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn respond(&self, path: &str, response: Response) {
    self
      .responses
      .lock()
      .unwrap()
      .insert(path.to_string(), response);
  }

  pub fn calls(&self) -> usize {
    self.calls.load(Ordering::SeqCst)
  }
}

#[async_trait]
impl ResourceFetcher for ScriptedFetcher {
  async fn fetch(&self, request: &Request) -> Result<Response, NetworkError> {
    self.calls.fetch_add(1, Ordering::SeqCst);
    self
      .responses
      .lock()
      .unwrap()
      .get(request.url().path())
      .cloned()
      .ok_or_else(|| NetworkError::Transport("unreachable".into()))
  }
}

/// Fetcher that blocks every call until released.
pub struct GatedFetcher {
  response: Response,
  gate: Semaphore,
  calls: AtomicUsize,
}

impl GatedFetcher {
  pub fn new(response: Response) -> Self {
    Self {
      response,
      gate: Semaphore::new(0),
      calls: AtomicUsize::new(0),
    }
  }

  pub fn release(&self) {
    self.gate.add_permits(1024);
  }

  pub fn calls(&self) -> usize {
    self.calls.load(Ordering::SeqCst)
  }
}

#[async_trait]
impl ResourceFetcher for GatedFetcher {
  async fn fetch(&self, _request: &Request) -> Result<Response, NetworkError> {
    self.calls.fetch_add(1, Ordering::SeqCst);
    let _permit = self
      .gate
      .acquire()
      .await
      .map_err(|e| NetworkError::Transport(e.to_string()))?;
    Ok(self.response.clone())
  }
}

/// Dispatcher that records every attempt and fails the records it's told to.
///
/// Records are identified by the `name` field of their payload.
#[derive(Default)]
pub struct ScriptedDispatcher {
  attempts: Mutex<Vec<String>>,
  failing: Mutex<HashSet<String>>,
  fail_all: AtomicBool,
  gate: Option<Semaphore>,
}

impl ScriptedDispatcher {
  pub fn new() -> Self {
    Self::default()
  }

  /// A dispatcher whose calls block until [`Self::release`].
  pub fn gated() -> Self {
    Self {
      gate: Some(Semaphore::new(0)),
      ..Self::default()
    }
  }

  pub fn fail(&self, name: &str) {
    self.failing.lock().unwrap().insert(name.to_string());
  }

  pub fn set_fail_all(&self, fail: bool) {
    self.fail_all.store(fail, Ordering::SeqCst);
  }

  pub fn release(&self) {
    if let Some(gate) = &self.gate {
      gate.add_permits(1024);
    }
  }

  /// Names of every dispatched record, in dispatch order.
  pub fn attempts(&self) -> Vec<String> {
    self.attempts.lock().unwrap().clone()
  }
}

pub fn record_name(record: &MutationRecord) -> String {
  record.payload["name"].as_str().unwrap_or_default().to_string()
}

#[async_trait]
impl MutationDispatcher for ScriptedDispatcher {
  async fn dispatch(&self, record: &MutationRecord) -> Result<(), NetworkError> {
    let name = record_name(record);
    self.attempts.lock().unwrap().push(name.clone());

    if let Some(gate) = &self.gate {
      let _permit = gate
        .acquire()
        .await
        .map_err(|e| NetworkError::Transport(e.to_string()))?;
    }

    if self.fail_all.load(Ordering::SeqCst) || self.failing.lock().unwrap().contains(&name) {
      return Err(NetworkError::Status(500));
    }
    Ok(())
  }
}

/// In-memory storage whose writes can be switched to fail.
#[derive(Default)]
pub struct SwitchableStorage {
  inner: MemoryStorage,
  fail_writes: AtomicBool,
}

impl SwitchableStorage {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn set_fail_writes(&self, fail: bool) {
    self.fail_writes.store(fail, Ordering::SeqCst);
  }
}

impl StateStorage for SwitchableStorage {
  fn read_state(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
    self.inner.read_state(key)
  }

  fn write_state(&self, key: &str, value: &[u8]) -> StorageResult<()> {
    if self.fail_writes.load(Ordering::SeqCst) {
      return Err(PersistenceError::Unavailable("disk full".into()));
    }
    self.inner.write_state(key, value)
  }
}
