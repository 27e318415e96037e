//! Explicit construction and teardown of every component.

use color_eyre::{eyre::eyre, Result};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

use crate::cache::{Classifier, ResourceCache};
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::connectivity::ConnectivityMonitor;
use crate::db::{CacheStorage, Database, MemoryStorage, StateStorage};
use crate::event::{EventBus, Subscription};
use crate::lifecycle::{ClientWindows, NotificationSink, OfflineWorker};
use crate::queue::DurableQueue;
use crate::sync::SyncOrchestrator;
use crate::transport::{MutationDispatcher, ResourceFetcher};

/// State key holding the generation activated last.
pub const ACTIVE_GENERATION_KEY: &str = "active_generation";

/// Platform-side collaborators the engine talks to.
#[derive(Clone)]
pub struct Collaborators {
  pub fetcher: Arc<dyn ResourceFetcher>,
  pub dispatcher: Arc<dyn MutationDispatcher>,
  pub notifier: Arc<dyn NotificationSink>,
  pub windows: Arc<dyn ClientWindows>,
}

/// Which storage backs this session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
  Sqlite,
  /// Database unavailable; nothing survives the process
  Memory,
}

pub struct Engine {
  backend: StorageBackend,
  state: Arc<dyn StateStorage>,
  bus: EventBus,
  monitor: Arc<ConnectivityMonitor>,
  queue: Arc<DurableQueue>,
  cache: ResourceCache,
  orchestrator: Arc<SyncOrchestrator>,
  worker: OfflineWorker,
}

impl Engine {
  /// Build the engine on the configured database.
  ///
  /// If the database can't be opened the session runs on in-memory
  /// storage instead.
  pub fn init(config: &Config, collaborators: Collaborators) -> Result<Self> {
    let (state, cache, backend) = open_storage(config.storage.path.as_deref());
    let clock = Arc::new(SystemClock);
    Self::with_storage(config, collaborators, state, cache, backend, clock)
  }

  pub fn with_storage(
    config: &Config,
    collaborators: Collaborators,
    state: Arc<dyn StateStorage>,
    cache_storage: Arc<dyn CacheStorage>,
    backend: StorageBackend,
    clock: Arc<dyn Clock>,
  ) -> Result<Self> {
    let bus = EventBus::new();
    let monitor = Arc::new(ConnectivityMonitor::new(config.sync.start_online, bus.clone()));
    let queue = Arc::new(DurableQueue::open(state.clone(), clock.clone()));

    let active = read_active_generation(state.as_ref());
    let cache = ResourceCache::new(
      cache_storage,
      collaborators.fetcher,
      clock.clone(),
      active.as_deref().unwrap_or_default(),
      config.timeout(),
    );

    let orchestrator = Arc::new(SyncOrchestrator::new(
      queue.clone(),
      monitor.clone(),
      collaborators.dispatcher,
      state.clone(),
      bus.clone(),
      clock,
      config.sync_settings(),
    ));

    let classifier = Classifier::new(config.origin()?, &config.cache.static_extensions);
    let worker = OfflineWorker::new(
      cache.clone(),
      orchestrator.clone(),
      classifier,
      &config.cache.generation,
      config.cache.precache.clone(),
      config.notifications.clone(),
      collaborators.notifier,
      collaborators.windows,
    );

    info!(
      backend = ?backend,
      pending = queue.len(),
      generation = %config.cache.generation,
      worker = ?worker.state(),
      "Engine initialized"
    );

    Ok(Self {
      backend,
      state,
      bus,
      monitor,
      queue,
      cache,
      orchestrator,
      worker,
    })
  }

  pub fn backend(&self) -> StorageBackend {
    self.backend
  }

  pub fn subscribe(&self) -> Subscription {
    self.bus.subscribe()
  }

  pub fn monitor(&self) -> &Arc<ConnectivityMonitor> {
    &self.monitor
  }

  pub fn queue(&self) -> &Arc<DurableQueue> {
    &self.queue
  }

  pub fn cache(&self) -> &ResourceCache {
    &self.cache
  }

  pub fn orchestrator(&self) -> &Arc<SyncOrchestrator> {
    &self.orchestrator
  }

  pub fn worker(&self) -> &OfflineWorker {
    &self.worker
  }

  /// Precache and activate the configured generation, remembering it
  /// for later sessions.
  pub async fn install(&self) -> Result<usize> {
    let cached = self.worker.install().await?;
    let purged = self.worker.activate()?;
    self
      .state
      .write_state(ACTIVE_GENERATION_KEY, self.worker.generation().as_bytes())?;
    info!(cached, purged, generation = %self.worker.generation(), "Generation installed");
    Ok(cached)
  }

  /// Start background syncing.
  pub fn start(&self) {
    self.orchestrator.start_auto_sync();
  }

  /// Stop background work and wait for pending revalidations.
  pub async fn shutdown(&self) {
    self.orchestrator.stop();
    self.orchestrator.stop_auto_sync();
    self.cache.settle().await;
    info!(pending = self.queue.len(), "Engine shut down");
  }
}

type OpenedStorage = (Arc<dyn StateStorage>, Arc<dyn CacheStorage>, StorageBackend);

fn open_storage(path: Option<&Path>) -> OpenedStorage {
  let opened = match path {
    Some(path) => Database::open(path),
    None => Database::open_default(),
  };

  match opened {
    Ok(db) => {
      let db = Arc::new(db);
      let state: Arc<dyn StateStorage> = db.clone();
      let cache: Arc<dyn CacheStorage> = db;
      (state, cache, StorageBackend::Sqlite)
    }
    Err(e) => {
      warn!(error = %e, "Database unavailable, using in-memory storage for this session");
      let memory = Arc::new(MemoryStorage::new());
      let state: Arc<dyn StateStorage> = memory.clone();
      let cache: Arc<dyn CacheStorage> = memory;
      (state, cache, StorageBackend::Memory)
    }
  }
}

fn read_active_generation(state: &dyn StateStorage) -> Option<String> {
  match state.read_state(ACTIVE_GENERATION_KEY) {
    Ok(Some(bytes)) => String::from_utf8(bytes)
      .map_err(|e| warn!(error = %e, "Ignoring unreadable active generation"))
      .ok(),
    Ok(None) => None,
    Err(e) => {
      warn!(error = %e, "Failed to read active generation");
      None
    }
  }
}

impl std::fmt::Debug for Engine {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Engine")
      .field("backend", &self.backend)
      .field("generation", &self.cache.active_generation())
      .field("pending", &self.queue.len())
      .finish()
  }
}

/// Parse a mutation payload given on the command line.
pub fn parse_payload(raw: &str) -> Result<serde_json::Value> {
  let value: serde_json::Value =
    serde_json::from_str(raw).map_err(|e| eyre!("Invalid JSON payload: {}", e))?;
  if !value.is_object() {
    return Err(eyre!("Payload must be a JSON object"));
  }
  Ok(value)
}
