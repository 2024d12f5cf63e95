//! Reconciling draft synchronization.
//!
//! - `SyncEngine` drains the queue one record at a time behind a
//!   single-flight latch
//! - `ForegroundSync` adds per-record notifications and view reconciliation
//! - `ConnectivityTrigger` debounces connectivity changes into drains
//! - `BackgroundReconciler` runs drains for host-scheduled triggers and
//!   announces results to every connected view

mod background;
mod engine;
mod foreground;
mod monitor;
mod transport;
mod trigger;

pub use background::{BackgroundReconciler, BACKGROUND_SYNC_TAG};
pub use engine::{DrainReport, NoopObserver, SyncEngine, SyncObserver, IDEMPOTENCY_FIELD};
pub use foreground::{reconcile_view, ForegroundSync, ViewAction, ViewHost};
pub use monitor::ConnectivityMonitor;
pub use transport::{HttpRecordSink, RecordSink, SinkResponse};
pub use trigger::{Connectivity, ConnectivityTrigger, MIN_DEBOUNCE};
