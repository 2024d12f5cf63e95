use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use reqwest::{cookie::Jar, header::CONTENT_TYPE, redirect::Policy, Client, Method};
use std::sync::Arc;
use std::time::Duration;

use super::traits::{Fetcher, RedirectMode, Request, Response, ResponseKind};

const TIMEOUT: Duration = Duration::from_secs(30);

/// Fetcher backed by a real HTTP client.
///
/// Requests in `RedirectMode::Manual` get a 3xx back as an opaque redirect;
/// everything else follows redirects. Both share one session cookie jar.
pub struct HttpFetcher {
  follow: Client,
  manual: Client,
}

fn build_client(jar: &Arc<Jar>, policy: Policy) -> Result<Client> {
  Client::builder()
    .redirect(policy)
    .cookie_provider(Arc::clone(jar))
    .timeout(TIMEOUT)
    .build()
    .map_err(|e| eyre!("Failed to build HTTP client: {}", e))
}

impl HttpFetcher {
  pub fn new() -> Result<Self> {
    let jar = Arc::new(Jar::default());

    Ok(Self {
      follow: build_client(&jar, Policy::default())?,
      manual: build_client(&jar, Policy::none())?,
    })
  }
}

#[async_trait]
impl Fetcher for HttpFetcher {
  async fn fetch(&self, request: &Request) -> Result<Response> {
    let method = Method::from_bytes(request.method.as_bytes())
      .map_err(|e| eyre!("Invalid method {}: {}", request.method, e))?;

    let client = match request.redirect {
      RedirectMode::Follow => &self.follow,
      RedirectMode::Manual => &self.manual,
    };

    let response = client
      .request(method, request.url.clone())
      .send()
      .await
      .map_err(|e| eyre!("Failed to fetch {}: {}", request.url, e))?;

    let status = response.status();
    if request.redirect == RedirectMode::Manual && status.is_redirection() {
      return Ok(Response::opaque_redirect());
    }

    let content_type = response
      .headers()
      .get(CONTENT_TYPE)
      .and_then(|v| v.to_str().ok())
      .map(String::from);

    let body = response
      .bytes()
      .await
      .map_err(|e| eyre!("Failed to read body of {}: {}", request.url, e))?;

    Ok(Response {
      status: status.as_u16(),
      content_type,
      kind: ResponseKind::Basic,
      body: body.to_vec(),
    })
  }
}
