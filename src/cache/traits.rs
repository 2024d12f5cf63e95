//! Core traits and types for the request cache.

use async_trait::async_trait;
use color_eyre::Result;
use serde::{Deserialize, Serialize};
use url::Url;

/// How the request was issued by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RequestMode {
  /// Top-level page navigation
  Navigate,
  SameOrigin,
  Cors,
  NoCors,
}

/// What the fetcher does with a 3xx response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedirectMode {
  Follow,
  /// Return the redirect itself as an opaque response
  Manual,
}

/// An intercepted outgoing request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
  pub method: String,
  pub url: Url,
  pub mode: RequestMode,
  pub redirect: RedirectMode,
}

impl Request {
  pub fn get(url: Url) -> Self {
    Self {
      method: "GET".to_string(),
      url,
      mode: RequestMode::SameOrigin,
      redirect: RedirectMode::Follow,
    }
  }

  /// Page navigation. Redirects are handed back to the view unfollowed.
  pub fn navigate(url: Url) -> Self {
    Self {
      mode: RequestMode::Navigate,
      redirect: RedirectMode::Manual,
      ..Self::get(url)
    }
  }

  /// The same request with redirects followed.
  pub fn following(&self) -> Self {
    Self {
      redirect: RedirectMode::Follow,
      ..self.clone()
    }
  }

  pub fn with_method(mut self, method: &str) -> Self {
    self.method = method.to_uppercase();
    self
  }

  pub fn path(&self) -> &str {
    self.url.path()
  }

  pub fn is_get(&self) -> bool {
    self.method.eq_ignore_ascii_case("GET")
  }

  /// Identity of the request inside a cache generation: path plus query.
  pub fn cache_key(&self) -> String {
    match self.url.query() {
      Some(query) => format!("{}?{}", self.url.path(), query),
      None => self.url.path().to_string(),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseKind {
  Basic,
  /// A redirect that was not followed; its target is not inspected
  OpaqueRedirect,
}

impl ResponseKind {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Basic => "basic",
      Self::OpaqueRedirect => "opaque_redirect",
    }
  }

  pub fn parse(s: &str) -> Self {
    match s {
      "opaque_redirect" => Self::OpaqueRedirect,
      _ => Self::Basic,
    }
  }
}

/// A fetched or cached response. Cloning is how a response gets both
/// stored and returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
  pub status: u16,
  pub content_type: Option<String>,
  pub kind: ResponseKind,
  pub body: Vec<u8>,
}

impl Response {
  pub fn new(status: u16, content_type: Option<&str>, body: impl Into<Vec<u8>>) -> Self {
    Self {
      status,
      content_type: content_type.map(String::from),
      kind: ResponseKind::Basic,
      body: body.into(),
    }
  }

  pub fn html(status: u16, body: impl Into<Vec<u8>>) -> Self {
    Self::new(status, Some("text/html; charset=utf-8"), body)
  }

  pub fn opaque_redirect() -> Self {
    Self {
      status: 0,
      content_type: None,
      kind: ResponseKind::OpaqueRedirect,
      body: Vec::new(),
    }
  }

  pub fn is_ok(&self) -> bool {
    (200..300).contains(&self.status)
  }

  pub fn is_html(&self) -> bool {
    self
      .content_type
      .as_deref()
      .map(|ct| ct.contains("text/html"))
      .unwrap_or(false)
  }

  pub fn is_auth_failure(&self) -> bool {
    matches!(self.status, 401 | 403)
  }
}

/// Indicates where a served response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
  Network,
  Cache,
  /// Network and cache both failed; the offline page was served
  OfflineFallback,
  /// The session expired; the login page was served instead
  LoginRedirect,
}

/// Result of routing a request, with where the response came from.
#[derive(Debug, Clone)]
pub struct Served {
  pub response: Response,
  pub source: ResponseSource,
}

impl Served {
  pub fn network(response: Response) -> Self {
    Self {
      response,
      source: ResponseSource::Network,
    }
  }

  pub fn cache(response: Response) -> Self {
    Self {
      response,
      source: ResponseSource::Cache,
    }
  }
}

/// Network access used by the router.
///
/// `Err` means no response at all (unreachable, DNS, reset). HTTP error
/// statuses are returned as `Ok`.
#[async_trait]
pub trait Fetcher: Send + Sync {
  async fn fetch(&self, request: &Request) -> Result<Response>;
}
