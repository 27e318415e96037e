//! Online/offline tracking.

use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{info, warn};

use crate::event::{EventBus, SyncEvent};

/// Mirrors platform connectivity signals onto the event bus.
///
/// There is no polling: whoever observes the platform calls
/// [`ConnectivityMonitor::set_online`], and only real edges are broadcast.
pub struct ConnectivityMonitor {
  online: AtomicBool,
  bus: EventBus,
}

impl ConnectivityMonitor {
  pub fn new(initially_online: bool, bus: EventBus) -> Self {
    Self {
      online: AtomicBool::new(initially_online),
      bus,
    }
  }

  pub fn is_online(&self) -> bool {
    self.online.load(Ordering::Acquire)
  }

  /// Record a platform connectivity signal.
  ///
  /// Returns `true` if this changed the state (and an event was emitted).
  pub fn set_online(&self, online: bool) -> bool {
    if self.online.swap(online, Ordering::AcqRel) == online {
      return false;
    }

    if online {
      info!("Network online, pending changes will sync");
      self.bus.publish(SyncEvent::BecameOnline);
    } else {
      warn!("Network offline, changes will be queued");
      self.bus.publish(SyncEvent::BecameOffline);
    }
    true
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_only_edges_are_broadcast() {
    let bus = EventBus::new();
    let mut events = bus.subscribe();
    let monitor = ConnectivityMonitor::new(true, bus);

    assert!(!monitor.set_online(true));
    assert!(monitor.set_online(false));
    assert!(!monitor.set_online(false));
    assert!(monitor.set_online(true));

    let topics: Vec<_> = events.drain().iter().map(SyncEvent::topic).collect();
    assert_eq!(topics, vec!["became-offline", "became-online"]);
    assert!(monitor.is_online());
  }
}
