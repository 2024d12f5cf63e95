use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

/// Anything that can ride in the queue as a draft payload.
pub trait Payload: Clone + Send + Sync + Serialize + DeserializeOwned {}

impl<T> Payload for T where T: Clone + Send + Sync + Serialize + DeserializeOwned {}

/// A locally queued write that the remote API has not yet accepted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DraftRecord<P> {
  /// Stable local identity, also sent as the idempotency token
  pub id: String,
  pub payload: P,
  pub created_at: DateTime<Utc>,
  pub synced: bool,
  /// Most recent sync failure, cleared on success
  pub last_error: Option<String>,
  /// Failed sync attempts since the draft was last saved
  #[serde(default)]
  pub attempts: u32,
}

impl<P> DraftRecord<P> {
  pub(crate) fn new(id: String, payload: P) -> Self {
    Self {
      id,
      payload,
      created_at: Utc::now(),
      synced: false,
      last_error: None,
      attempts: 0,
    }
  }
}

/// Generate a local draft id of the form `offline_<millis>_<hex>`.
pub fn generate_id() -> String {
  format!(
    "offline_{}_{:x}",
    Utc::now().timestamp_millis(),
    rand::random::<u64>()
  )
}
