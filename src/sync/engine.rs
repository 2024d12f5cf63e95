//! Drains the draft queue into the remote API, one record at a time.

use color_eyre::Result;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::transport::RecordSink;
use crate::queue::{DraftRecord, QueueStorage};

/// Field carrying the draft id in every create request.
pub const IDEMPOTENCY_FIELD: &str = "offline_id";

const GENERIC_FAILURE: &str = "Sync failed";

/// Per-record hooks invoked while a drain runs.
pub trait SyncObserver: Send + Sync {
  fn record_synced(&self, _id: &str) {}
  fn record_failed(&self, _id: &str, _reason: &str) {}
}

/// Observer that does nothing.
pub struct NoopObserver;

impl SyncObserver for NoopObserver {}

/// Outcome of one `drain_pending` call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
  /// Another drain held the latch; nothing was touched
  pub skipped: bool,
  pub attempted: usize,
  pub synced: Vec<String>,
  /// (id, reason) for every record that stayed pending
  pub failed: Vec<(String, String)>,
  /// Records left alone because they reached the attempt limit
  pub deferred: Vec<String>,
}

impl DrainReport {
  fn skipped() -> Self {
    Self {
      skipped: true,
      ..Self::default()
    }
  }

  pub fn any_synced(&self) -> bool {
    !self.synced.is_empty()
  }
}

/// Single-flight drain of pending drafts.
///
/// Each engine owns its latch, so separate engines (for instance a
/// foreground and a background one) may drain concurrently. Store mutations
/// are idempotent, which keeps that safe.
pub struct SyncEngine<S: QueueStorage> {
  store: Arc<S>,
  sink: Arc<dyn RecordSink>,
  running: AtomicBool,
  max_attempts: Option<u32>,
}

/// Releases the latch when the drain finishes, however it finishes.
struct LatchGuard<'a>(&'a AtomicBool);

impl Drop for LatchGuard<'_> {
  fn drop(&mut self) {
    self.0.store(false, Ordering::Release);
  }
}

impl<S: QueueStorage> SyncEngine<S> {
  pub fn new(store: Arc<S>, sink: Arc<dyn RecordSink>) -> Self {
    Self {
      store,
      sink,
      running: AtomicBool::new(false),
      max_attempts: None,
    }
  }

  /// Skip drafts that have already failed `max` times.
  pub fn with_max_attempts(mut self, max: Option<u32>) -> Self {
    self.max_attempts = max;
    self
  }

  pub fn store(&self) -> &Arc<S> {
    &self.store
  }

  pub fn is_running(&self) -> bool {
    self.running.load(Ordering::Acquire)
  }

  fn try_acquire(&self) -> Option<LatchGuard<'_>> {
    self
      .running
      .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
      .ok()
      .map(|_| LatchGuard(&self.running))
  }

  /// Push every pending draft to the remote API.
  ///
  /// Records are sent sequentially. A failure is recorded on that record and
  /// the batch carries on. Only a failure to list the queue is returned as
  /// an error.
  pub async fn drain_pending(&self, observer: &dyn SyncObserver) -> Result<DrainReport> {
    let Some(_latch) = self.try_acquire() else {
      info!("Sync already in progress");
      return Ok(DrainReport::skipped());
    };

    let pending: Vec<DraftRecord<Value>> = self.store.list_pending()?;
    if pending.is_empty() {
      debug!("No pending drafts");
      return Ok(DrainReport::default());
    }

    info!(count = pending.len(), "Syncing pending drafts");
    let mut report = DrainReport::default();

    for record in pending {
      if let Some(max) = self.max_attempts {
        if record.attempts >= max {
          warn!(
            id = %record.id,
            attempts = record.attempts,
            "Draft reached attempt limit, skipping"
          );
          report.deferred.push(record.id);
          continue;
        }
      }

      report.attempted += 1;

      match self.push(&record).await {
        Ok(()) => match self.settle(&record.id) {
          Ok(()) => {
            info!(id = %record.id, "Draft synced");
            observer.record_synced(&record.id);
            report.synced.push(record.id);
          }
          Err(e) => {
            error!(id = %record.id, "Draft accepted but not cleared locally: {}", e);
            report.failed.push((record.id, e.to_string()));
          }
        },
        Err(reason) => {
          warn!(id = %record.id, "Failed to sync draft: {}", reason);
          if let Err(e) = self.store.mark_error(&record.id, &reason) {
            error!(id = %record.id, "Failed to record sync error: {}", e);
          }
          observer.record_failed(&record.id, &reason);
          report.failed.push((record.id, reason));
        }
      }
    }

    Ok(report)
  }

  /// Send one draft. `Err` carries the reason to store on the record.
  async fn push(&self, record: &DraftRecord<Value>) -> std::result::Result<(), String> {
    let body = request_body(record)?;

    match self.sink.create(&body).await {
      Err(e) => Err(e.to_string()),
      Ok(response) if response.is_accepted() => Ok(()),
      Ok(response) => Err(
        response
          .error_message()
          .unwrap_or_else(|| GENERIC_FAILURE.to_string()),
      ),
    }
  }

  fn settle(&self, id: &str) -> Result<()> {
    self.store.mark_synced(id)?;
    self.store.remove(id)?;
    Ok(())
  }
}

/// The draft payload with its id set as the idempotency token.
fn request_body(record: &DraftRecord<Value>) -> std::result::Result<Value, String> {
  match &record.payload {
    Value::Object(fields) => {
      let mut fields = fields.clone();
      fields.insert(IDEMPOTENCY_FIELD.to_string(), Value::String(record.id.clone()));
      Ok(Value::Object(fields))
    }
    _ => Err("Draft payload is not a JSON object".to_string()),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::queue::SqliteQueueStore;
  use crate::sync::transport::SinkResponse;
  use async_trait::async_trait;
  use color_eyre::eyre::eyre;
  use serde_json::json;
  use std::sync::atomic::AtomicUsize;
  use std::sync::Mutex;
  use tokio::sync::Notify;

  /// Sink that answers with a closure and records every body it receives.
  struct FnSink<F> {
    respond: F,
    bodies: Mutex<Vec<Value>>,
  }

  impl<F> FnSink<F>
  where
    F: Fn(&Value) -> Result<SinkResponse> + Send + Sync,
  {
    fn new(respond: F) -> Arc<Self> {
      Arc::new(Self {
        respond,
        bodies: Mutex::new(Vec::new()),
      })
    }

    fn calls(&self) -> usize {
      self.bodies.lock().unwrap().len()
    }
  }

  #[async_trait]
  impl<F> RecordSink for FnSink<F>
  where
    F: Fn(&Value) -> Result<SinkResponse> + Send + Sync,
  {
    async fn create(&self, body: &Value) -> Result<SinkResponse> {
      self.bodies.lock().unwrap().push(body.clone());
      (self.respond)(body)
    }
  }

  fn accept_all(_: &Value) -> Result<SinkResponse> {
    Ok(SinkResponse::new(200, json!({"ok": true})))
  }

  fn store_with(ids: &[&str]) -> Arc<SqliteQueueStore> {
    let store = SqliteQueueStore::open_in_memory().unwrap();
    for id in ids {
      store
        .save_draft(json!({"customer_id": 3}), Some(id.to_string()))
        .unwrap();
    }
    Arc::new(store)
  }

  #[derive(Default)]
  struct RecordingObserver {
    synced: Mutex<Vec<String>>,
    failed: Mutex<Vec<String>>,
  }

  impl SyncObserver for RecordingObserver {
    fn record_synced(&self, id: &str) {
      self.synced.lock().unwrap().push(id.to_string());
    }

    fn record_failed(&self, id: &str, _reason: &str) {
      self.failed.lock().unwrap().push(id.to_string());
    }
  }

  #[tokio::test]
  async fn test_empty_queue_makes_no_calls() {
    let sink = FnSink::new(accept_all);
    let engine = SyncEngine::new(store_with(&[]), sink.clone());

    let report = engine.drain_pending(&NoopObserver).await.unwrap();

    assert_eq!(sink.calls(), 0);
    assert!(!report.skipped);
    assert!(!report.any_synced());
  }

  #[tokio::test]
  async fn test_body_carries_payload_and_idempotency_token() {
    let sink = FnSink::new(accept_all);
    let engine = SyncEngine::new(store_with(&["offline_1_a"]), sink.clone());

    engine.drain_pending(&NoopObserver).await.unwrap();

    let bodies = sink.bodies.lock().unwrap();
    assert_eq!(bodies[0], json!({"customer_id": 3, "offline_id": "offline_1_a"}));
  }

  #[tokio::test]
  async fn test_failure_in_middle_does_not_abort_batch() {
    let sink = FnSink::new(|body: &Value| -> Result<SinkResponse> {
      if body[IDEMPOTENCY_FIELD] == "b" {
        let body = json!({"ok": false, "error": "Invoice needs at least one line"});
        Ok(SinkResponse::new(400, body))
      } else {
        accept_all(body)
      }
    });
    let store = store_with(&["a", "b", "c"]);
    let engine = SyncEngine::new(store.clone(), sink.clone());
    let observer = RecordingObserver::default();

    let report = engine.drain_pending(&observer).await.unwrap();

    assert_eq!(report.synced, vec!["a".to_string(), "c".to_string()]);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(*observer.failed.lock().unwrap(), vec!["b".to_string()]);

    let remaining: Vec<DraftRecord<Value>> = store.list_all().unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].id, "b");
    assert!(!remaining[0].synced);
    assert_eq!(
      remaining[0].last_error.as_deref(),
      Some("Invoice needs at least one line")
    );
  }

  #[tokio::test]
  async fn test_transport_error_is_recorded() {
    let sink = FnSink::new(|_: &Value| -> Result<SinkResponse> {
      Err(eyre!("connection refused"))
    });
    let store = store_with(&["a"]);
    let engine = SyncEngine::new(store.clone(), sink);

    let report = engine.drain_pending(&NoopObserver).await.unwrap();

    assert!(!report.any_synced());
    let record: DraftRecord<Value> = store.get("a").unwrap().unwrap();
    assert_eq!(record.last_error.as_deref(), Some("connection refused"));
    assert_eq!(record.attempts, 1);
  }

  #[tokio::test]
  async fn test_falsy_ok_without_message_uses_generic_reason() {
    let sink = FnSink::new(|_: &Value| -> Result<SinkResponse> {
      Ok(SinkResponse::from_bytes(200, b"not json"))
    });
    let store = store_with(&["a"]);
    let engine = SyncEngine::new(store.clone(), sink);

    engine.drain_pending(&NoopObserver).await.unwrap();

    let record: DraftRecord<Value> = store.get("a").unwrap().unwrap();
    assert_eq!(record.last_error.as_deref(), Some("Sync failed"));
  }

  #[tokio::test]
  async fn test_non_object_payload_fails_record_without_call() {
    let sink = FnSink::new(accept_all);
    let store = Arc::new(SqliteQueueStore::open_in_memory().unwrap());
    store.save_draft(json!([1, 2]), Some("list".to_string())).unwrap();
    let engine = SyncEngine::new(store.clone(), sink.clone());

    let report = engine.drain_pending(&NoopObserver).await.unwrap();

    assert_eq!(sink.calls(), 0);
    assert_eq!(report.failed[0].0, "list");
  }

  #[tokio::test]
  async fn test_attempt_limit_defers_poison_records() {
    let sink = FnSink::new(accept_all);
    let store = store_with(&["poison", "fresh"]);
    store.mark_error("poison", "rejected").unwrap();
    store.mark_error("poison", "rejected").unwrap();
    let engine = SyncEngine::new(store.clone(), sink.clone()).with_max_attempts(Some(2));

    let report = engine.drain_pending(&NoopObserver).await.unwrap();

    assert_eq!(report.deferred, vec!["poison".to_string()]);
    assert_eq!(report.synced, vec!["fresh".to_string()]);
    assert_eq!(sink.calls(), 1);
    let poison: Option<DraftRecord<Value>> = store.get("poison").unwrap();
    assert!(poison.is_some());
  }

  /// Sink that parks inside `create` until released.
  struct GatedSink {
    entered: Notify,
    release: Notify,
    calls: AtomicUsize,
  }

  #[async_trait]
  impl RecordSink for GatedSink {
    async fn create(&self, _body: &Value) -> Result<SinkResponse> {
      self.calls.fetch_add(1, Ordering::SeqCst);
      self.entered.notify_one();
      self.release.notified().await;
      Ok(SinkResponse::new(200, json!({"ok": true})))
    }
  }

  #[tokio::test]
  async fn test_overlapping_drain_is_a_noop() {
    let sink = Arc::new(GatedSink {
      entered: Notify::new(),
      release: Notify::new(),
      calls: AtomicUsize::new(0),
    });
    let store = store_with(&["a"]);
    let engine = SyncEngine::new(store.clone(), sink.clone());

    let first = engine.drain_pending(&NoopObserver);
    let second = async {
      sink.entered.notified().await;
      assert!(engine.is_running());
      let report = engine.drain_pending(&NoopObserver).await;
      sink.release.notify_one();
      report
    };

    let (first, second) = tokio::join!(first, second);
    let (first, second) = (first.unwrap(), second.unwrap());

    assert!(second.skipped);
    assert_eq!(second.attempted, 0);
    assert_eq!(first.synced, vec!["a".to_string()]);
    assert_eq!(sink.calls.load(Ordering::SeqCst), 1);
    assert!(!engine.is_running());
  }

  #[tokio::test]
  async fn test_latch_released_after_list_failure() {
    struct BrokenStore;

    impl QueueStorage for BrokenStore {
      fn save_draft<P: crate::queue::Payload>(
        &self,
        _payload: P,
        _id: Option<String>,
      ) -> Result<DraftRecord<P>> {
        Err(eyre!("disk full"))
      }
      fn list_pending<P: crate::queue::Payload>(&self) -> Result<Vec<DraftRecord<P>>> {
        Err(eyre!("database disk image is malformed"))
      }
      fn list_all<P: crate::queue::Payload>(&self) -> Result<Vec<DraftRecord<P>>> {
        Err(eyre!("database disk image is malformed"))
      }
      fn get<P: crate::queue::Payload>(&self, _id: &str) -> Result<Option<DraftRecord<P>>> {
        Ok(None)
      }
      fn mark_synced(&self, _id: &str) -> Result<bool> {
        Ok(false)
      }
      fn mark_error(&self, _id: &str, _message: &str) -> Result<bool> {
        Ok(false)
      }
      fn remove(&self, _id: &str) -> Result<bool> {
        Ok(true)
      }
    }

    let engine = SyncEngine::new(Arc::new(BrokenStore), FnSink::new(accept_all));

    assert!(engine.drain_pending(&NoopObserver).await.is_err());
    assert!(!engine.is_running());
  }
}
