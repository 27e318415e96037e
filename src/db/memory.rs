//! In-memory storage used when the on-disk database is unavailable.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use super::{CacheStorage, Result, StateStorage};
use crate::cache::{CacheEntry, CacheKey};

/// Storage that lives only as long as the process.
///
/// Behaves like [`super::Database`] for one session so the engine keeps
/// working (degraded) rather than failing outright.
#[derive(Default)]
pub struct MemoryStorage {
  state: Mutex<HashMap<String, Vec<u8>>>,
  // generation -> key hash -> entry
  entries: Mutex<BTreeMap<String, HashMap<String, CacheEntry>>>,
}

impl MemoryStorage {
  pub fn new() -> Self {
    Self::default()
  }
}

impl StateStorage for MemoryStorage {
  fn read_state(&self, key: &str) -> Result<Option<Vec<u8>>> {
    Ok(self.state.lock()?.get(key).cloned())
  }

  fn write_state(&self, key: &str, value: &[u8]) -> Result<()> {
    self.state.lock()?.insert(key.to_string(), value.to_vec());
    Ok(())
  }
}

impl CacheStorage for MemoryStorage {
  fn get_entry(&self, generation: &str, key: &CacheKey) -> Result<Option<CacheEntry>> {
    let entries = self.entries.lock()?;
    Ok(
      entries
        .get(generation)
        .and_then(|bucket| bucket.get(&key.hash()))
        .cloned(),
    )
  }

  fn put_entry(&self, generation: &str, entry: &CacheEntry) -> Result<()> {
    self
      .entries
      .lock()?
      .entry(generation.to_string())
      .or_default()
      .insert(entry.key.hash(), entry.clone());
    Ok(())
  }

  fn put_entries(&self, generation: &str, entries: &[CacheEntry]) -> Result<()> {
    // One lock for the whole batch keeps it atomic to readers
    let mut all = self.entries.lock()?;
    let bucket = all.entry(generation.to_string()).or_default();
    for entry in entries {
      bucket.insert(entry.key.hash(), entry.clone());
    }
    Ok(())
  }

  fn delete_entry(&self, generation: &str, key: &CacheKey) -> Result<bool> {
    let mut all = self.entries.lock()?;
    let removed = all
      .get_mut(generation)
      .map(|bucket| bucket.remove(&key.hash()).is_some())
      .unwrap_or(false);
    if all.get(generation).is_some_and(|bucket| bucket.is_empty()) {
      all.remove(generation);
    }
    Ok(removed)
  }

  fn generations(&self) -> Result<Vec<String>> {
    Ok(self.entries.lock()?.keys().cloned().collect())
  }

  fn delete_generation(&self, generation: &str) -> Result<usize> {
    Ok(
      self
        .entries
        .lock()?
        .remove(generation)
        .map(|bucket| bucket.len())
        .unwrap_or(0),
    )
  }

  fn entry_count(&self, generation: &str) -> Result<usize> {
    Ok(
      self
        .entries
        .lock()?
        .get(generation)
        .map(|bucket| bucket.len())
        .unwrap_or(0),
    )
  }
}
