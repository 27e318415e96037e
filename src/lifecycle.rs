//! Install/activate lifecycle of the cache layer, push notifications and
//! platform background-sync triggers.

use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tracing::{error, info, warn};

use crate::cache::{CacheResult, Classifier, ResourceCache};
use crate::error::{LifecycleError, PrecacheFailure};
use crate::sync::{DrainOutcome, SyncOrchestrator};
use crate::transport::{Request, Response};

/// Background-sync tag that flushes queued reading progress.
pub const READING_PROGRESS_SYNC_TAG: &str = "sync-reading-progress";

/// Where a worker is in its install/activate lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
  /// Created; its generation is not installed yet
  Parsed,
  Installing,
  /// Precache succeeded; ready to activate
  Installed,
  /// Serving requests from its generation
  Activated,
  /// Install failed; the previous generation stays in charge
  Redundant,
}

/// Minimal inbound push message.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushPayload {
  pub title: Option<String>,
  pub body: Option<String>,
  #[serde(alias = "url")]
  pub target_url: Option<String>,
}

/// Defaults filled into notifications the payload leaves blank.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NotificationDefaults {
  pub app_name: String,
  pub default_body: String,
  pub icon: String,
  pub badge: String,
  /// Vibration pattern in milliseconds
  pub vibrate: Vec<u32>,
}

impl Default for NotificationDefaults {
  fn default() -> Self {
    Self {
      app_name: "ModernReader".to_string(),
      default_body: "You have a new reading recommendation".to_string(),
      icon: "/assets/icons/icon-192.png".to_string(),
      badge: "/assets/icons/icon-72.png".to_string(),
      vibrate: vec![100, 50, 100],
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NotificationAction {
  pub action: String,
  pub title: String,
}

/// A user-visible notification built from a push message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
  pub title: String,
  pub body: String,
  pub icon: String,
  pub badge: String,
  pub vibrate: Vec<u32>,
  pub target_url: String,
  pub actions: Vec<NotificationAction>,
}

/// Displays notifications to the user.
pub trait NotificationSink: Send + Sync {
  fn show(&self, notification: &Notification);
}

/// An open client view (window or tab).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientView {
  pub id: String,
  pub url: String,
}

/// Platform access to the client's views.
pub trait ClientWindows: Send + Sync {
  fn clients(&self) -> Vec<ClientView>;

  /// Bring a view to the foreground. `false` if it can't be focused.
  fn focus(&self, id: &str) -> bool;

  fn open(&self, url: &str);
}

/// What a notification click led to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClickOutcome {
  Dismissed,
  Focused(String),
  Opened(String),
}

/// Drives one cache generation through install and activation and
/// answers platform hooks.
pub struct OfflineWorker {
  cache: ResourceCache,
  orchestrator: Arc<SyncOrchestrator>,
  classifier: Classifier,
  generation: String,
  manifest: Vec<String>,
  state: Mutex<WorkerState>,
  defaults: NotificationDefaults,
  notifier: Arc<dyn NotificationSink>,
  windows: Arc<dyn ClientWindows>,
}

impl OfflineWorker {
  #[allow(clippy::too_many_arguments)]
  pub fn new(
    cache: ResourceCache,
    orchestrator: Arc<SyncOrchestrator>,
    classifier: Classifier,
    generation: &str,
    manifest: Vec<String>,
    defaults: NotificationDefaults,
    notifier: Arc<dyn NotificationSink>,
    windows: Arc<dyn ClientWindows>,
  ) -> Self {
    // A worker for the generation already serving needs no install
    let state = if cache.active_generation() == generation {
      WorkerState::Activated
    } else {
      WorkerState::Parsed
    };

    Self {
      cache,
      orchestrator,
      classifier,
      generation: generation.to_string(),
      manifest,
      state: Mutex::new(state),
      defaults,
      notifier,
      windows,
    }
  }

  pub fn state(&self) -> WorkerState {
    *self.state.lock().unwrap_or_else(|e| e.into_inner())
  }

  pub fn generation(&self) -> &str {
    &self.generation
  }

  fn set_state(&self, state: WorkerState) {
    *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
  }

  /// Precache the manifest into this worker's generation.
  ///
  /// Only a complete precache makes the worker ready to activate.
  pub async fn install(&self) -> Result<usize, PrecacheFailure> {
    info!(generation = %self.generation, "Installing");
    self.set_state(WorkerState::Installing);

    let result = match self.manifest_requests() {
      Ok(requests) => self.cache.precache(&self.generation, &requests).await,
      Err(e) => Err(e),
    };

    match &result {
      Ok(count) => {
        info!(generation = %self.generation, count, "Installed, ready to activate");
        self.set_state(WorkerState::Installed);
      }
      Err(e) => {
        error!(generation = %self.generation, error = %e, "Precaching failed");
        self.set_state(WorkerState::Redundant);
      }
    }
    result
  }

  /// Switch to this worker's generation and purge the others.
  pub fn activate(&self) -> Result<usize, LifecycleError> {
    let state = self.state();
    if state != WorkerState::Installed {
      return Err(LifecycleError::NotInstalled(state));
    }

    info!(generation = %self.generation, "Activating");
    let purged = self.cache.activate(&self.generation)?;
    self.set_state(WorkerState::Activated);
    info!(generation = %self.generation, purged, "Activated");
    Ok(purged)
  }

  /// Answer a resource request, or `None` when it is not intercepted
  /// (no generation activated yet, or a non-HTTP URL).
  ///
  /// Requests are served from whichever generation is active, so a worker
  /// still installing (or one whose install failed) leaves the previous
  /// generation in charge.
  pub async fn handle_fetch(&self, request: &Request) -> Option<CacheResult<Response>> {
    if self.cache.active_generation().is_empty() {
      return None;
    }
    let class = self.classifier.classify(request.url())?;
    Some(self.cache.get(request, class.policy()).await)
  }

  /// Build and show a notification for an inbound push message.
  ///
  /// Empty messages are ignored.
  pub fn on_push(&self, data: &[u8]) -> Option<Notification> {
    if data.iter().all(u8::is_ascii_whitespace) {
      return None;
    }

    let payload: PushPayload = match serde_json::from_slice(data) {
      Ok(payload) => payload,
      Err(e) => {
        warn!(error = %e, "Ignoring malformed push payload");
        return None;
      }
    };

    let notification = self.build_notification(payload);
    self.notifier.show(&notification);
    Some(notification)
  }

  fn build_notification(&self, payload: PushPayload) -> Notification {
    let defaults = &self.defaults;
    Notification {
      title: payload.title.unwrap_or_else(|| defaults.app_name.clone()),
      body: payload.body.unwrap_or_else(|| defaults.default_body.clone()),
      icon: defaults.icon.clone(),
      badge: defaults.badge.clone(),
      vibrate: defaults.vibrate.clone(),
      target_url: payload.target_url.unwrap_or_else(|| "/".to_string()),
      actions: vec![
        NotificationAction {
          action: "open".to_string(),
          title: "Open".to_string(),
        },
        NotificationAction {
          action: "close".to_string(),
          title: "Close".to_string(),
        },
      ],
    }
  }

  /// Handle a click on a notification (or one of its actions).
  pub fn on_notification_click(
    &self,
    notification: &Notification,
    action: Option<&str>,
  ) -> ClickOutcome {
    if action == Some("close") {
      return ClickOutcome::Dismissed;
    }

    let target = &notification.target_url;
    for client in self.windows.clients() {
      if &client.url == target && self.windows.focus(&client.id) {
        return ClickOutcome::Focused(client.id);
      }
    }

    self.windows.open(target);
    ClickOutcome::Opened(target.clone())
  }

  /// Platform background-sync trigger. Unknown tags are ignored.
  pub async fn on_background_sync(&self, tag: &str) -> Option<DrainOutcome> {
    if tag != READING_PROGRESS_SYNC_TAG {
      return None;
    }
    info!("Syncing reading progress");
    Some(self.orchestrator.flush().await)
  }

  fn manifest_requests(&self) -> Result<Vec<Request>, PrecacheFailure> {
    self
      .manifest
      .iter()
      .map(|key| {
        self
          .classifier
          .origin()
          .join(key)
          .map(Request::get)
          .map_err(|e| PrecacheFailure::InvalidKey {
            key: key.clone(),
            reason: e.to_string(),
          })
      })
      .collect()
  }
}
