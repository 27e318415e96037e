use tokio::sync::broadcast;

use crate::error::RetryExhausted;
use crate::queue::MutationRecord;

/// Capacity of the broadcast buffer; slow subscribers past this lag and skip.
const BUS_CAPACITY: usize = 256;

/// Events emitted by the engine for the UI layer.
#[derive(Debug, Clone)]
pub enum SyncEvent {
  /// A record was delivered and removed from the queue
  ItemSynced(MutationRecord),
  /// A record hit the retry bound and was dropped
  ItemFailed(RetryExhausted),
  /// A drain pass started over this many records
  DrainStart { pending: usize },
  /// A drain pass finished
  DrainComplete(DrainSummary),
  /// A drain pass was aborted because the queue could not be read
  DrainError(String),
  BecameOnline,
  BecameOffline,
}

impl SyncEvent {
  /// Topic name, as shown to users and in logs.
  pub fn topic(&self) -> &'static str {
    match self {
      Self::ItemSynced(_) => "item-synced",
      Self::ItemFailed(_) => "item-failed",
      Self::DrainStart { .. } => "drain-start",
      Self::DrainComplete(_) => "drain-complete",
      Self::DrainError(_) => "drain-error",
      Self::BecameOnline => "became-online",
      Self::BecameOffline => "became-offline",
    }
  }
}

/// Counts reported at the end of a drain pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DrainSummary {
  /// Records delivered this pass
  pub synced: usize,
  /// Records dropped this pass after exhausting retries
  pub failed: usize,
  /// Records still queued after the pass
  pub pending: usize,
}

/// Typed publish/subscribe channel for [`SyncEvent`]s.
#[derive(Debug, Clone)]
pub struct EventBus {
  tx: broadcast::Sender<SyncEvent>,
}

impl EventBus {
  pub fn new() -> Self {
    let (tx, _rx) = broadcast::channel(BUS_CAPACITY);
    Self { tx }
  }

  /// Start receiving every event published from now on.
  pub fn subscribe(&self) -> Subscription {
    Subscription {
      rx: self.tx.subscribe(),
    }
  }

  /// Publish to current subscribers. Publishing with none is fine.
  pub fn publish(&self, event: SyncEvent) {
    let _ = self.tx.send(event);
  }

  pub fn subscriber_count(&self) -> usize {
    self.tx.receiver_count()
  }
}

impl Default for EventBus {
  fn default() -> Self {
    Self::new()
  }
}

/// A live subscription. Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription {
  rx: broadcast::Receiver<SyncEvent>,
}

impl Subscription {
  /// Receive the next event, `None` once the bus is gone.
  ///
  /// If this subscriber fell behind, the missed events are skipped.
  pub async fn next(&mut self) -> Option<SyncEvent> {
    loop {
      match self.rx.recv().await {
        Ok(event) => return Some(event),
        Err(broadcast::error::RecvError::Lagged(skipped)) => {
          tracing::warn!(skipped, "Event subscriber lagged, skipping events");
        }
        Err(broadcast::error::RecvError::Closed) => return None,
      }
    }
  }

  /// Take an already-published event without waiting.
  pub fn try_next(&mut self) -> Option<SyncEvent> {
    loop {
      match self.rx.try_recv() {
        Ok(event) => return Some(event),
        Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
        Err(_) => return None,
      }
    }
  }

  /// Drain everything published so far.
  pub fn drain(&mut self) -> Vec<SyncEvent> {
    std::iter::from_fn(|| self.try_next()).collect()
  }

  pub fn unsubscribe(self) {}
}
