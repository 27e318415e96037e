//! Sync orchestrator: drains the durable queue through the dispatcher.
//!
//! A drain pass attempts every record present at pass start exactly once,
//! in FIFO order. At most one pass runs at a time; requests arriving while a
//! pass is active are no-ops. Passes are triggered by reconnecting, by a
//! fixed-interval timer while online, or explicitly via [`SyncOrchestrator::flush`].

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::connectivity::ConnectivityMonitor;
use crate::db::StateStorage;
use crate::error::RetryExhausted;
use crate::event::{DrainSummary, EventBus, Subscription, SyncEvent};
use crate::queue::{DurableQueue, FailureOutcome, MutationId, MutationKind};
use crate::transport::{with_timeout, MutationDispatcher};

/// Failed attempts after which a record is dropped.
pub const DEFAULT_RETRY_LIMIT: u32 = 3;

/// State key holding the last completed drain time.
pub const LAST_SYNC_KEY: &str = "last_sync";

/// Tunables for the orchestrator.
#[derive(Debug, Clone)]
pub struct SyncSettings {
  pub retry_limit: u32,
  /// Period of the auto-sync timer
  pub interval: Duration,
  /// Deadline for a single dispatch
  pub dispatch_timeout: Duration,
  /// Request a background flush after every enqueue while online
  pub sync_on_enqueue: bool,
}

impl Default for SyncSettings {
  fn default() -> Self {
    Self {
      retry_limit: DEFAULT_RETRY_LIMIT,
      interval: Duration::from_secs(30),
      dispatch_timeout: Duration::from_secs(10),
      sync_on_enqueue: true,
    }
  }
}

/// Snapshot for the UI layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
  pub is_syncing: bool,
  pub pending_count: usize,
  pub last_sync_time: Option<DateTime<Utc>>,
  pub is_online: bool,
}

/// Why a drain request did nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
  AlreadyDraining,
  Offline,
}

/// Result of a drain request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainOutcome {
  /// Every record present at pass start was attempted
  Completed(DrainSummary),
  /// The pass was stopped between records
  Stopped(DrainSummary),
  /// No pass was started
  Skipped(SkipReason),
  /// The queue could not be read; the pass was aborted
  Failed(String),
}

/// Resets the syncing flag however a pass ends.
struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
  fn drop(&mut self) {
    self.0.store(false, Ordering::Release);
  }
}

pub struct SyncOrchestrator {
  queue: Arc<DurableQueue>,
  monitor: Arc<ConnectivityMonitor>,
  dispatcher: Arc<dyn MutationDispatcher>,
  state: Arc<dyn StateStorage>,
  bus: EventBus,
  clock: Arc<dyn Clock>,
  settings: SyncSettings,
  syncing: AtomicBool,
  stop_requested: AtomicBool,
  last_sync: Mutex<Option<DateTime<Utc>>>,
  auto_sync: Mutex<Option<JoinHandle<()>>>,
}

impl SyncOrchestrator {
  pub fn new(
    queue: Arc<DurableQueue>,
    monitor: Arc<ConnectivityMonitor>,
    dispatcher: Arc<dyn MutationDispatcher>,
    state: Arc<dyn StateStorage>,
    bus: EventBus,
    clock: Arc<dyn Clock>,
    settings: SyncSettings,
  ) -> Self {
    let last_sync = load_last_sync(state.as_ref());

    Self {
      queue,
      monitor,
      dispatcher,
      state,
      bus,
      clock,
      settings,
      syncing: AtomicBool::new(false),
      stop_requested: AtomicBool::new(false),
      last_sync: Mutex::new(last_sync),
      auto_sync: Mutex::new(None),
    }
  }

  pub fn settings(&self) -> &SyncSettings {
    &self.settings
  }

  pub fn status(&self) -> SyncStatus {
    SyncStatus {
      is_syncing: self.syncing.load(Ordering::Acquire),
      pending_count: self.queue.len(),
      last_sync_time: self.last_sync_time(),
      is_online: self.monitor.is_online(),
    }
  }

  pub fn last_sync_time(&self) -> Option<DateTime<Utc>> {
    *self.last_sync.lock().unwrap_or_else(|e| e.into_inner())
  }

  /// Queue a mutation. Persistence failures are logged and swallowed:
  /// the change stays applied locally but will not reach the server.
  pub fn enqueue(self: &Arc<Self>, kind: MutationKind, payload: Value) -> Option<MutationId> {
    match self.queue.enqueue(kind, payload) {
      Ok(id) => {
        if self.settings.sync_on_enqueue && self.monitor.is_online() {
          self.request_flush();
        }
        Some(id)
      }
      Err(e) => {
        warn!(kind = %kind, error = %e, "Failed to queue mutation, it will not be synced");
        None
      }
    }
  }

  pub fn sync_reading_progress(
    self: &Arc<Self>,
    book_id: &str,
    progress: Value,
  ) -> Option<MutationId> {
    self.enqueue(MutationKind::ReadingProgress, with_book_id(book_id, progress))
  }

  pub fn sync_bookmark(self: &Arc<Self>, book_id: &str, bookmark: Value) -> Option<MutationId> {
    self.enqueue(MutationKind::Bookmark, with_book_id(book_id, bookmark))
  }

  pub fn sync_settings(self: &Arc<Self>, settings: Value) -> Option<MutationId> {
    self.enqueue(MutationKind::Settings, settings)
  }

  /// Drop every pending mutation.
  pub fn clear_queue(&self) -> Result<usize, crate::error::PersistenceError> {
    let dropped = self.queue.clear()?;
    info!(dropped, "Cleared sync queue");
    Ok(dropped)
  }

  /// Explicitly requested drain. A no-op while offline or already draining.
  pub async fn flush(&self) -> DrainOutcome {
    if !self.monitor.is_online() {
      debug!("Offline, skipping flush");
      return DrainOutcome::Skipped(SkipReason::Offline);
    }
    self.drain().await
  }

  /// Kick off a flush in the background, if a runtime is available.
  pub fn request_flush(self: &Arc<Self>) {
    let Ok(handle) = tokio::runtime::Handle::try_current() else {
      debug!("No runtime, flush deferred to the next trigger");
      return;
    };
    let this = Arc::clone(self);
    handle.spawn(async move {
      this.flush().await;
    });
  }

  /// Stop the active pass before its next record.
  ///
  /// A delivery already handed to the dispatcher is left to finish.
  /// Returns `false` when no pass is running.
  pub fn stop(&self) -> bool {
    if !self.syncing.load(Ordering::Acquire) {
      return false;
    }
    self.stop_requested.store(true, Ordering::Release);
    true
  }

  /// Start the interval timer and reconnect listener. Idempotent.
  pub fn start_auto_sync(self: &Arc<Self>) -> bool {
    let mut slot = self.auto_sync.lock().unwrap_or_else(|e| e.into_inner());
    if slot.as_ref().is_some_and(|h| !h.is_finished()) {
      return false;
    }

    let events = self.bus.subscribe();
    let this = Arc::clone(self);
    *slot = Some(tokio::spawn(this.auto_sync_loop(events)));
    info!(interval = ?self.settings.interval, "Auto sync started");
    true
  }

  /// Stop the auto-sync loop. Returns `false` if it wasn't running.
  pub fn stop_auto_sync(&self) -> bool {
    let handle = self
      .auto_sync
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .take();
    match handle {
      Some(handle) => {
        handle.abort();
        info!("Auto sync stopped");
        true
      }
      None => false,
    }
  }

  async fn auto_sync_loop(self: Arc<Self>, mut events: Subscription) {
    let period = self.settings.interval;
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
      tokio::select! {
        _ = ticker.tick() => {
          if self.monitor.is_online() && !self.queue.is_empty() {
            self.drain().await;
          }
        }
        event = events.next() => match event {
          Some(SyncEvent::BecameOnline) => {
            if !self.queue.is_empty() {
              info!(pending = self.queue.len(), "Back online, syncing pending changes");
              self.flush().await;
            }
          }
          Some(_) => {}
          None => break,
        },
      }
    }
  }

  /// Run one drain pass unless one is already active.
  async fn drain(&self) -> DrainOutcome {
    if self
      .syncing
      .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
      .is_err()
    {
      debug!("Drain already in progress");
      return DrainOutcome::Skipped(SkipReason::AlreadyDraining);
    }
    let _guard = DrainGuard(&self.syncing);
    self.stop_requested.store(false, Ordering::Release);

    let records = match self.queue.peek_all() {
      Ok(records) => records,
      Err(e) => {
        error!(error = %e, "Cannot read sync queue, aborting drain");
        self.bus.publish(SyncEvent::DrainError(e.to_string()));
        return DrainOutcome::Failed(e.to_string());
      }
    };

    self.bus.publish(SyncEvent::DrainStart {
      pending: records.len(),
    });

    let mut summary = DrainSummary::default();
    let mut stopped = false;

    for record in records {
      if self.stop_requested.load(Ordering::Acquire) {
        info!("Drain stopped on request");
        stopped = true;
        break;
      }

      let delivery = with_timeout(
        self.settings.dispatch_timeout,
        self.dispatcher.dispatch(&record),
      )
      .await;

      match delivery {
        Ok(()) => {
          if let Err(e) = self.queue.remove(&record.id) {
            warn!(id = %record.id, error = %e, "Failed to remove synced mutation");
          }
          debug!(id = %record.id, kind = %record.kind, "Mutation synced");
          summary.synced += 1;
          self.bus.publish(SyncEvent::ItemSynced(record));
        }
        Err(last_error) => {
          match self.queue.record_failure(&record.id, self.settings.retry_limit) {
            Ok(FailureOutcome::Retry(attempts)) => {
              debug!(id = %record.id, attempts, error = %last_error, "Delivery failed, will retry");
            }
            Ok(FailureOutcome::Exhausted(record)) => {
              error!(
                id = %record.id,
                attempts = record.attempts,
                error = %last_error,
                "Sync failed after retries, dropping mutation"
              );
              summary.failed += 1;
              self
                .bus
                .publish(SyncEvent::ItemFailed(RetryExhausted { record, last_error }));
            }
            Ok(FailureOutcome::Missing) => {
              debug!(id = %record.id, "Failed record was already removed");
            }
            Err(e) => {
              warn!(id = %record.id, error = %e, "Failed to record delivery attempt");
            }
          }
        }
      }
    }

    summary.pending = self.queue.len();
    self.record_sync_time();

    info!(
      synced = summary.synced,
      failed = summary.failed,
      pending = summary.pending,
      "Sync complete"
    );
    self.bus.publish(SyncEvent::DrainComplete(summary));

    if stopped {
      DrainOutcome::Stopped(summary)
    } else {
      DrainOutcome::Completed(summary)
    }
  }

  fn record_sync_time(&self) {
    let now = self.clock.now();
    *self.last_sync.lock().unwrap_or_else(|e| e.into_inner()) = Some(now);

    if let Err(e) = self
      .state
      .write_state(LAST_SYNC_KEY, now.to_rfc3339().as_bytes())
    {
      warn!(error = %e, "Failed to persist last sync time");
    }
  }
}

fn load_last_sync(state: &dyn StateStorage) -> Option<DateTime<Utc>> {
  let bytes = match state.read_state(LAST_SYNC_KEY) {
    Ok(bytes) => bytes?,
    Err(e) => {
      warn!(error = %e, "Failed to read last sync time");
      return None;
    }
  };

  let text = String::from_utf8_lossy(&bytes);
  DateTime::parse_from_rfc3339(text.trim())
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| warn!(error = %e, "Ignoring unreadable last sync time"))
    .ok()
}

/// `{ "bookId": .., ...fields }`. Non-object payloads go under `value`.
fn with_book_id(book_id: &str, data: Value) -> Value {
  let mut merged = Map::new();
  merged.insert("bookId".to_string(), Value::String(book_id.to_string()));
  match data {
    Value::Object(fields) => merged.extend(fields),
    Value::Null => {}
    other => {
      merged.insert("value".to_string(), other);
    }
  }
  Value::Object(merged)
}
