//! Connectivity probing for hosts without a native online/offline signal.

use color_eyre::{eyre::eyre, Result};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;
use url::Url;

use super::trigger::Connectivity;

/// Shortest probe interval; also the lower bound of the probe timeout.
const MIN_PROBE_INTERVAL: Duration = Duration::from_millis(250);

/// Polls the server and reports connectivity transitions.
pub struct ConnectivityMonitor {
  client: reqwest::Client,
  probe_url: Url,
  interval: Duration,
}

impl ConnectivityMonitor {
  /// Intervals below `MIN_PROBE_INTERVAL` are raised to it. Each probe
  /// times out after one interval.
  pub fn new(probe_url: Url, interval: Duration) -> Result<Self> {
    let interval = interval.max(MIN_PROBE_INTERVAL);
    let client = reqwest::Client::builder()
      .timeout(interval)
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      client,
      probe_url,
      interval,
    })
  }

  /// Any HTTP response counts as online; only transport failures count as
  /// offline.
  pub async fn probe(&self) -> Connectivity {
    match self.client.get(self.probe_url.clone()).send().await {
      Ok(_) => Connectivity::Online,
      Err(e) => {
        debug!("Probe of {} failed: {}", self.probe_url, e);
        Connectivity::Offline
      }
    }
  }

  /// Spawn the probe loop. The first observation is always sent, after that
  /// only changes are.
  pub fn spawn(self) -> (mpsc::UnboundedReceiver<Connectivity>, JoinHandle<()>) {
    let (tx, rx) = mpsc::unbounded_channel();

    let handle = tokio::spawn(async move {
      let mut last = None;
      let mut ticker = tokio::time::interval(self.interval);

      loop {
        ticker.tick().await;
        let state = self.probe().await;
        if last != Some(state) {
          last = Some(state);
          if tx.send(state).is_err() {
            break;
          }
        }
      }
    });

    (rx, handle)
  }
}
