//! Schedules foreground drains on connectivity changes.

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info};

use super::foreground::ForegroundSync;
use crate::notify::Notifier;
use crate::queue::QueueStorage;

/// Shortest settle time accepted after coming back online.
pub const MIN_DEBOUNCE: Duration = Duration::from_millis(800);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectivity {
  Online,
  Offline,
}

/// Debounces "online" transitions into a single drain.
///
/// Each "online" event cancels the pending timer and starts a new one, so a
/// flapping connection only syncs once it has settled.
pub struct ConnectivityTrigger<S: QueueStorage + 'static> {
  sync: Arc<ForegroundSync<S>>,
  notifier: Arc<dyn Notifier>,
  debounce: Duration,
  timer: Mutex<Option<JoinHandle<()>>>,
}

impl<S: QueueStorage + 'static> ConnectivityTrigger<S> {
  pub fn new(sync: Arc<ForegroundSync<S>>, notifier: Arc<dyn Notifier>) -> Self {
    Self {
      sync,
      notifier,
      debounce: MIN_DEBOUNCE,
      timer: Mutex::new(None),
    }
  }

  /// Set the settle time. Values below `MIN_DEBOUNCE` are raised to it.
  pub fn with_debounce(mut self, debounce: Duration) -> Self {
    self.debounce = debounce.max(MIN_DEBOUNCE);
    self
  }

  pub fn debounce(&self) -> Duration {
    self.debounce
  }

  /// Must be called from within a Tokio runtime.
  pub fn on_connectivity(&self, state: Connectivity) {
    match state {
      Connectivity::Online => {
        info!("Connection restored");
        self.schedule_drain();
      }
      Connectivity::Offline => {
        info!("Connection lost");
        self.notifier.notify(
          "Offline mode",
          "New records will be saved as local drafts.",
        );
      }
    }
  }

  fn schedule_drain(&self) {
    let mut timer = match self.timer.lock() {
      Ok(timer) => timer,
      Err(poisoned) => poisoned.into_inner(),
    };

    if let Some(pending) = timer.take() {
      pending.abort();
    }

    let sync = Arc::clone(&self.sync);
    let notifier = Arc::clone(&self.notifier);
    let debounce = self.debounce;

    *timer = Some(tokio::spawn(async move {
      tokio::time::sleep(debounce).await;
      notifier.notify(
        "Connection restored",
        "Automatic synchronization is starting.",
      );
      // Detached: aborting the timer must not cancel a running drain.
      tokio::spawn(async move {
        if let Err(e) = sync.drain_pending().await {
          error!("Sync failed: {}", e);
        }
      });
    }));
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::notify::MemoryNotifier;
  use crate::queue::SqliteQueueStore;
  use crate::sync::engine::SyncEngine;
  use crate::sync::transport::{RecordSink, SinkResponse};
  use async_trait::async_trait;
  use color_eyre::Result;
  use serde_json::{json, Value};
  use std::sync::atomic::{AtomicUsize, Ordering};

  #[derive(Default)]
  struct CountingSink {
    calls: AtomicUsize,
  }

  #[async_trait]
  impl RecordSink for CountingSink {
    async fn create(&self, _body: &Value) -> Result<SinkResponse> {
      self.calls.fetch_add(1, Ordering::SeqCst);
      Ok(SinkResponse::new(200, json!({"ok": true})))
    }
  }

  fn trigger(
    sink: Arc<CountingSink>,
    notifier: Arc<MemoryNotifier>,
  ) -> ConnectivityTrigger<SqliteQueueStore> {
    let store = Arc::new(SqliteQueueStore::open_in_memory().unwrap());
    store
      .save_draft(json!({"n": 1}), Some("a".to_string()))
      .unwrap();
    let engine = SyncEngine::new(store, sink);
    let sync = Arc::new(ForegroundSync::new(
      engine,
      notifier.clone(),
      "/invoices",
      "/invoices/offline",
    ));
    ConnectivityTrigger::new(sync, notifier)
  }

  #[test]
  fn test_debounce_never_below_minimum() {
    let sink = Arc::new(CountingSink::default());
    let notifier = Arc::new(MemoryNotifier::new());
    let trigger = trigger(sink, notifier).with_debounce(Duration::from_millis(100));
    assert_eq!(trigger.debounce(), MIN_DEBOUNCE);
  }

  #[tokio::test(start_paused = true)]
  async fn test_repeated_online_events_restart_timer() {
    let sink = Arc::new(CountingSink::default());
    let notifier = Arc::new(MemoryNotifier::new());
    let trigger = trigger(sink.clone(), notifier.clone());

    trigger.on_connectivity(Connectivity::Online);
    tokio::time::sleep(Duration::from_millis(500)).await;
    trigger.on_connectivity(Connectivity::Online);
    tokio::time::sleep(Duration::from_millis(700)).await;

    // The first timer would have fired at 800ms but was cancelled.
    assert_eq!(sink.calls.load(Ordering::SeqCst), 0);

    tokio::time::sleep(Duration::from_millis(200)).await;
    tokio::task::yield_now().await;

    assert_eq!(sink.calls.load(Ordering::SeqCst), 1);
    let titles = notifier.titles();
    assert_eq!(
      titles.iter().filter(|t| *t == "Connection restored").count(),
      1
    );
    assert!(titles.contains(&"Record synced".to_string()));
  }

  #[tokio::test]
  async fn test_offline_notifies_immediately() {
    let sink = Arc::new(CountingSink::default());
    let notifier = Arc::new(MemoryNotifier::new());
    let trigger = trigger(sink.clone(), notifier.clone());

    trigger.on_connectivity(Connectivity::Offline);

    assert_eq!(notifier.titles(), vec!["Offline mode".to_string()]);
    assert_eq!(sink.calls.load(Ordering::SeqCst), 0);
  }
}
