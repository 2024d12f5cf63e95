//! Host-scheduled background reconciliation.
//!
//! Runs the same drain as the foreground engine, but with no user present:
//! every accepted draft raises a system notification and is announced to all
//! connected views, and failures only go to the log.

use std::sync::Arc;
use tracing::{debug, error, warn};

use super::engine::{DrainReport, SyncEngine, SyncObserver};
use crate::clients::{ClientMessage, ClientRegistry};
use crate::notify::Notifier;
use crate::queue::QueueStorage;

/// Tag identifying the offline-sync background trigger.
pub const BACKGROUND_SYNC_TAG: &str = "sync-offline-records";

struct AnnounceOnSync<'a> {
  clients: &'a ClientRegistry,
  notifier: &'a dyn Notifier,
}

impl SyncObserver for AnnounceOnSync<'_> {
  fn record_synced(&self, id: &str) {
    self.notifier.notify(
      "Record synced",
      "An offline draft was synchronized successfully.",
    );
    let reached = self.clients.broadcast(ClientMessage::OfflineSynced { id: id.to_string() });
    debug!(id, reached, "Announced synced draft");
  }

  fn record_failed(&self, id: &str, reason: &str) {
    warn!(id, "Background sync of draft failed: {}", reason);
  }
}

pub struct BackgroundReconciler<S: QueueStorage> {
  engine: SyncEngine<S>,
  clients: Arc<ClientRegistry>,
  notifier: Arc<dyn Notifier>,
  tag: String,
}

impl<S: QueueStorage> BackgroundReconciler<S> {
  pub fn new(
    engine: SyncEngine<S>,
    clients: Arc<ClientRegistry>,
    notifier: Arc<dyn Notifier>,
  ) -> Self {
    Self {
      engine,
      clients,
      notifier,
      tag: BACKGROUND_SYNC_TAG.to_string(),
    }
  }

  pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
    self.tag = tag.into();
    self
  }

  /// Handle a background trigger. Tags other than ours are ignored and
  /// return `None`, as do drains that could not start.
  pub async fn on_background_trigger(&self, tag: &str) -> Option<DrainReport> {
    if tag != self.tag {
      debug!(tag, "Ignoring unrelated background trigger");
      return None;
    }

    let observer = AnnounceOnSync {
      clients: &self.clients,
      notifier: self.notifier.as_ref(),
    };

    match self.engine.drain_pending(&observer).await {
      Ok(report) => Some(report),
      Err(e) => {
        error!("Background sync failed: {}", e);
        None
      }
    }
  }
}
