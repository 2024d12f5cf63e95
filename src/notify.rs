//! User-facing notifications.

use std::sync::Mutex;
use tracing::info;

/// Something that can show a short titled message to the user.
pub trait Notifier: Send + Sync {
  fn notify(&self, title: &str, body: &str);
}

/// Writes notifications to the log.
pub struct LogNotifier;

impl Notifier for LogNotifier {
  fn notify(&self, title: &str, body: &str) {
    info!(target: "offsync::notify", "{}: {}", title, body);
  }
}

/// Keeps notifications in memory until a host drains them.
#[derive(Default)]
pub struct MemoryNotifier {
  sent: Mutex<Vec<(String, String)>>,
}

impl MemoryNotifier {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn titles(&self) -> Vec<String> {
    match self.sent.lock() {
      Ok(sent) => sent.iter().map(|(title, _)| title.clone()).collect(),
      Err(_) => Vec::new(),
    }
  }
}

impl Notifier for MemoryNotifier {
  fn notify(&self, title: &str, body: &str) {
    if let Ok(mut sent) = self.sent.lock() {
      sent.push((title.to_string(), body.to_string()));
    }
  }
}
