//! Registry of connected client views.
//!
//! Delivery is best effort: a view that falls behind the channel capacity
//! loses the oldest messages, and views that connect later never see
//! earlier broadcasts.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, warn};

const CHANNEL_CAPACITY: usize = 64;

/// Message pushed to every open view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
  /// A queued draft was accepted by the server
  OfflineSynced { id: String },
}

pub struct ClientRegistry {
  tx: broadcast::Sender<ClientMessage>,
  next_id: AtomicU64,
  /// Cache version that has claimed the open views
  controller: Mutex<Option<String>>,
}

/// One connected view.
pub struct ClientView {
  pub id: u64,
  rx: broadcast::Receiver<ClientMessage>,
}

impl ClientRegistry {
  pub fn new() -> Self {
    let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
    Self {
      tx,
      next_id: AtomicU64::new(1),
      controller: Mutex::new(None),
    }
  }

  pub fn connect(&self) -> ClientView {
    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
    debug!(id, "Client view connected");
    ClientView {
      id,
      rx: self.tx.subscribe(),
    }
  }

  pub fn view_count(&self) -> usize {
    self.tx.receiver_count()
  }

  /// Send to every connected view, controlled or not. Returns how many
  /// views the message reached.
  pub fn broadcast(&self, message: ClientMessage) -> usize {
    self.tx.send(message).unwrap_or(0)
  }

  /// Take control of all open views on behalf of a cache version.
  pub fn claim(&self, version: &str) {
    match self.controller.lock() {
      Ok(mut controller) => {
        *controller = Some(version.to_string());
        debug!(version, views = self.view_count(), "Claimed client views");
      }
      Err(e) => warn!("Failed to claim client views: {}", e),
    }
  }

  pub fn controller(&self) -> Option<String> {
    self.controller.lock().ok().and_then(|c| c.clone())
  }
}

impl Default for ClientRegistry {
  fn default() -> Self {
    Self::new()
  }
}

impl ClientView {
  /// Wait for the next message. Returns `None` once the registry is gone.
  pub async fn recv(&mut self) -> Option<ClientMessage> {
    loop {
      match self.rx.recv().await {
        Ok(message) => return Some(message),
        Err(broadcast::error::RecvError::Lagged(missed)) => {
          warn!(id = self.id, missed, "Client view lagged, messages dropped");
        }
        Err(broadcast::error::RecvError::Closed) => return None,
      }
    }
  }

  /// Next message if one is already waiting.
  pub fn try_recv(&mut self) -> Option<ClientMessage> {
    loop {
      match self.rx.try_recv() {
        Ok(message) => return Some(message),
        Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
        Err(_) => return None,
      }
    }
  }
}
