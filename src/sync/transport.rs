//! Remote create endpoint the sync engine drains drafts into.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use serde_json::{Map, Value};
use url::Url;

/// Where drafts are sent once connectivity returns.
///
/// An `Err` means the request never produced a response (transport
/// failure). Any HTTP response, successful or not, is returned as `Ok`.
#[async_trait]
pub trait RecordSink: Send + Sync {
  async fn create(&self, body: &Value) -> Result<SinkResponse>;
}

/// Status and parsed body of a create call.
#[derive(Debug, Clone, PartialEq)]
pub struct SinkResponse {
  pub status: u16,
  pub body: Value,
}

impl SinkResponse {
  pub fn new(status: u16, body: Value) -> Self {
    Self { status, body }
  }

  /// Parse a raw body. Empty or non-JSON bodies become `{}`.
  pub fn from_bytes(status: u16, bytes: &[u8]) -> Self {
    let body = serde_json::from_slice(bytes).unwrap_or_else(|_| Value::Object(Map::new()));
    Self { status, body }
  }

  /// True when the status is 2xx and the body's `ok` flag is truthy.
  pub fn is_accepted(&self) -> bool {
    (200..300).contains(&self.status) && self.body.get("ok").map(truthy).unwrap_or(false)
  }

  /// Rejection reason reported by the API, from `error` or `detail`.
  pub fn error_message(&self) -> Option<String> {
    ["error", "detail"]
      .iter()
      .filter_map(|field| self.body.get(*field))
      .find_map(|value| match value {
        Value::Null => None,
        Value::String(s) if s.is_empty() => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
      })
  }
}

fn truthy(value: &Value) -> bool {
  match value {
    Value::Null => false,
    Value::Bool(b) => *b,
    Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
    Value::String(s) => !s.is_empty(),
    Value::Array(_) | Value::Object(_) => true,
  }
}

/// JSON-over-HTTP sink for the remote create endpoint.
#[derive(Clone)]
pub struct HttpRecordSink {
  client: reqwest::Client,
  endpoint: Url,
}

impl HttpRecordSink {
  pub fn new(endpoint: Url) -> Result<Self> {
    let client = reqwest::Client::builder()
      .cookie_store(true)
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client, endpoint })
  }
}

#[async_trait]
impl RecordSink for HttpRecordSink {
  async fn create(&self, body: &Value) -> Result<SinkResponse> {
    let response = self
      .client
      .post(self.endpoint.clone())
      .json(body)
      .send()
      .await
      .map_err(|e| eyre!("Failed to reach {}: {}", self.endpoint, e))?;

    let status = response.status().as_u16();
    let bytes = response.bytes().await.unwrap_or_default();

    Ok(SinkResponse::from_bytes(status, &bytes))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_non_json_body_becomes_empty_object() {
    let response = SinkResponse::from_bytes(502, b"<html>Bad Gateway</html>");
    assert_eq!(response.body, json!({}));
    assert!(!response.is_accepted());
    assert!(response.error_message().is_none());

    let empty = SinkResponse::from_bytes(200, b"");
    assert_eq!(empty.body, json!({}));
  }

  #[test]
  fn test_accepted_requires_status_and_ok_flag() {
    assert!(SinkResponse::new(200, json!({"ok": true})).is_accepted());
    assert!(SinkResponse::new(201, json!({"ok": 1})).is_accepted());
    assert!(!SinkResponse::new(200, json!({"ok": false})).is_accepted());
    assert!(!SinkResponse::new(200, json!({})).is_accepted());
    assert!(!SinkResponse::new(409, json!({"ok": true})).is_accepted());
  }

  #[test]
  fn test_error_message_prefers_error_then_detail() {
    let both = SinkResponse::new(400, json!({"error": "bad lines", "detail": "other"}));
    assert_eq!(both.error_message().as_deref(), Some("bad lines"));

    let detail = SinkResponse::new(403, json!({"detail": "No active company selected"}));
    assert_eq!(
      detail.error_message().as_deref(),
      Some("No active company selected")
    );

    let structured = SinkResponse::new(422, json!({"detail": [{"loc": ["body", "lines"]}]}));
    assert!(structured.error_message().unwrap().contains("lines"));
  }
}
