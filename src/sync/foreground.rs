//! Foreground sync: drain, notify per record, then bring the current view
//! up to date.

use color_eyre::Result;
use std::sync::Arc;
use tracing::info;

use super::engine::{DrainReport, SyncEngine, SyncObserver};
use crate::notify::Notifier;
use crate::queue::QueueStorage;

/// What the current view should do after drafts were synced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewAction {
  /// Reload the record listing in place
  Reload,
  /// Leave the drafts view for the given path
  Navigate(String),
  /// Leave the view alone
  Stay,
}

/// Decide how the view at `location` reacts to a successful sync.
pub fn reconcile_view(location: &str, listing_path: &str, drafts_path: &str) -> ViewAction {
  let listing = listing_path.trim_end_matches('/');

  if location == listing || location == format!("{}/", listing) {
    return ViewAction::Reload;
  }

  if location.starts_with(drafts_path) {
    return ViewAction::Navigate(listing_path.to_string());
  }

  ViewAction::Stay
}

/// The client view the foreground engine is running under.
pub trait ViewHost: Send + Sync {
  /// Path of the page currently shown
  fn location(&self) -> String;

  fn apply(&self, action: &ViewAction);
}

struct NotifyOnSync<'a>(&'a dyn Notifier);

impl SyncObserver for NotifyOnSync<'_> {
  fn record_synced(&self, _id: &str) {
    self.0.notify(
      "Record synced",
      "A pending record was saved to the server.",
    );
  }
}

pub struct ForegroundSync<S: QueueStorage> {
  engine: SyncEngine<S>,
  notifier: Arc<dyn Notifier>,
  view: Option<Arc<dyn ViewHost>>,
  listing_path: String,
  drafts_path: String,
}

impl<S: QueueStorage> ForegroundSync<S> {
  pub fn new(
    engine: SyncEngine<S>,
    notifier: Arc<dyn Notifier>,
    listing_path: impl Into<String>,
    drafts_path: impl Into<String>,
  ) -> Self {
    Self {
      engine,
      notifier,
      view: None,
      listing_path: listing_path.into(),
      drafts_path: drafts_path.into(),
    }
  }

  pub fn with_view(mut self, view: Arc<dyn ViewHost>) -> Self {
    self.view = Some(view);
    self
  }

  /// Drain pending drafts; if any went through, reconcile the current view.
  pub async fn drain_pending(&self) -> Result<DrainReport> {
    let observer = NotifyOnSync(self.notifier.as_ref());
    let report = self.engine.drain_pending(&observer).await?;

    if !report.any_synced() {
      return Ok(report);
    }

    if let Some(view) = &self.view {
      let action = reconcile_view(&view.location(), &self.listing_path, &self.drafts_path);
      if action != ViewAction::Stay {
        info!(?action, "Refreshing view after sync");
        view.apply(&action);
      }
    }

    Ok(report)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::notify::MemoryNotifier;
  use crate::queue::SqliteQueueStore;
  use crate::sync::transport::{RecordSink, SinkResponse};
  use async_trait::async_trait;
  use serde_json::{json, Value};
  use std::sync::Mutex;

  /// Accepts every draft except those whose id is listed.
  struct RejectingSink(Vec<&'static str>);

  #[async_trait]
  impl RecordSink for RejectingSink {
    async fn create(&self, body: &Value) -> Result<SinkResponse> {
      let id = body["offline_id"].as_str().unwrap_or_default();
      if self.0.iter().any(|rejected| *rejected == id) {
        Ok(SinkResponse::new(400, json!({"ok": false, "error": "rejected"})))
      } else {
        Ok(SinkResponse::new(200, json!({"ok": true})))
      }
    }
  }

  struct RecordingView {
    location: String,
    applied: Mutex<Vec<ViewAction>>,
  }

  impl RecordingView {
    fn at(location: &str) -> Arc<Self> {
      Arc::new(Self {
        location: location.to_string(),
        applied: Mutex::new(Vec::new()),
      })
    }

    fn applied(&self) -> Vec<ViewAction> {
      self.applied.lock().unwrap().clone()
    }
  }

  impl ViewHost for RecordingView {
    fn location(&self) -> String {
      self.location.clone()
    }

    fn apply(&self, action: &ViewAction) {
      self.applied.lock().unwrap().push(action.clone());
    }
  }

  fn foreground(
    rejected: Vec<&'static str>,
    view: Arc<RecordingView>,
    notifier: Arc<MemoryNotifier>,
  ) -> ForegroundSync<SqliteQueueStore> {
    let store = Arc::new(SqliteQueueStore::open_in_memory().unwrap());
    for id in ["a", "b"] {
      store.save_draft(json!({"total": 1}), Some(id.to_string())).unwrap();
    }
    let engine = SyncEngine::new(store, Arc::new(RejectingSink(rejected)));
    ForegroundSync::new(engine, notifier, "/invoices", "/invoices/offline").with_view(view)
  }

  #[tokio::test]
  async fn test_nothing_synced_leaves_view_alone() {
    let view = RecordingView::at("/invoices/offline");
    let notifier = Arc::new(MemoryNotifier::new());
    let sync = foreground(vec!["a", "b"], view.clone(), notifier.clone());

    let report = sync.drain_pending().await.unwrap();

    assert_eq!(report.failed.len(), 2);
    assert!(view.applied().is_empty());
    assert!(notifier.titles().is_empty());
  }

  #[tokio::test]
  async fn test_partial_success_leaves_drafts_view() {
    let view = RecordingView::at("/invoices/offline");
    let notifier = Arc::new(MemoryNotifier::new());
    let sync = foreground(vec!["b"], view.clone(), notifier.clone());

    let report = sync.drain_pending().await.unwrap();

    assert_eq!(report.synced, vec!["a".to_string()]);
    assert_eq!(
      view.applied(),
      vec![ViewAction::Navigate("/invoices".to_string())]
    );
    assert_eq!(notifier.titles(), vec!["Record synced".to_string()]);
  }

  #[tokio::test]
  async fn test_success_on_listing_reloads_it() {
    let view = RecordingView::at("/invoices");
    let sync = foreground(vec![], view.clone(), Arc::new(MemoryNotifier::new()));

    sync.drain_pending().await.unwrap();

    assert_eq!(view.applied(), vec![ViewAction::Reload]);
  }

  #[tokio::test]
  async fn test_success_elsewhere_does_not_touch_view() {
    let view = RecordingView::at("/dashboard");
    let sync = foreground(vec![], view.clone(), Arc::new(MemoryNotifier::new()));

    sync.drain_pending().await.unwrap();

    assert!(view.applied().is_empty());
  }

  #[test]
  fn test_listing_reloads() {
    assert_eq!(
      reconcile_view("/invoices", "/invoices", "/invoices/offline"),
      ViewAction::Reload
    );
    assert_eq!(
      reconcile_view("/invoices/", "/invoices", "/invoices/offline"),
      ViewAction::Reload
    );
  }

  #[test]
  fn test_drafts_view_navigates_to_listing() {
    assert_eq!(
      reconcile_view("/invoices/offline", "/invoices", "/invoices/offline"),
      ViewAction::Navigate("/invoices".to_string())
    );
    assert_eq!(
      reconcile_view("/invoices/offline/3", "/invoices", "/invoices/offline"),
      ViewAction::Navigate("/invoices".to_string())
    );
  }

  #[test]
  fn test_other_views_stay() {
    assert_eq!(
      reconcile_view("/dashboard", "/invoices", "/invoices/offline"),
      ViewAction::Stay
    );
    assert_eq!(
      reconcile_view("/invoices/42", "/invoices", "/invoices/offline"),
      ViewAction::Stay
    );
  }
}
