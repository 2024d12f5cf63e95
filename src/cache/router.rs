//! Per-request caching decisions at the network edge.

use color_eyre::{eyre::eyre, Report, Result};
use futures::future::try_join_all;
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;

use super::storage::CacheStorage;
use super::traits::{Fetcher, Request, RequestMode, ResponseKind, ResponseSource, Served};
use crate::clients::ClientRegistry;
use crate::config::Config;

/// Strategy chosen for an intercepted request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
  /// Not intercepted; the request goes to the network untouched
  Passthrough,
  CacheFirst,
  NetworkFirst,
  /// Never cached, offline page on network failure
  NetworkOnly,
}

/// The two cache generations derived from one version tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheVersion {
  tag: String,
}

impl CacheVersion {
  pub fn new(tag: impl Into<String>) -> Self {
    Self { tag: tag.into() }
  }

  pub fn tag(&self) -> &str {
    &self.tag
  }

  /// Immutable app shell assets
  pub fn static_name(&self) -> String {
    format!("static-{}", self.tag)
  }

  /// Cached pages
  pub fn dynamic_name(&self) -> String {
    format!("dynamic-{}", self.tag)
  }
}

/// Path rules used to classify requests.
#[derive(Debug, Clone)]
pub struct RouteRules {
  pub api_prefix: String,
  pub record_sections: Vec<String>,
  /// Exact paths, or bare file names matched against the last path segment
  pub documents: Vec<String>,
  pub excluded_extensions: Vec<String>,
}

fn under(path: &str, prefix: &str) -> bool {
  let prefix = prefix.trim_end_matches('/');
  path == prefix || path.starts_with(&format!("{}/", prefix))
}

impl RouteRules {
  pub fn from_config(config: &Config) -> Self {
    Self {
      api_prefix: config.server.api_prefix.clone(),
      record_sections: config.server.record_sections.clone(),
      documents: config.cache.documents.clone(),
      excluded_extensions: config.cache.excluded_extensions.clone(),
    }
  }

  pub fn classify(&self, request: &Request) -> Route {
    if !request.is_get() {
      return Route::Passthrough;
    }

    let path = request.path();
    let file_name = path.rsplit('/').next().unwrap_or("");

    let excluded = self.excluded_extensions.iter().any(|ext| {
      file_name
        .to_lowercase()
        .ends_with(&format!(".{}", ext.trim_start_matches('.').to_lowercase()))
    });
    if excluded {
      return Route::NetworkOnly;
    }

    if under(path, &self.api_prefix) {
      return Route::Passthrough;
    }

    let is_document = self.documents.iter().any(|doc| {
      if doc.contains('/') {
        doc == path
      } else {
        doc == file_name
      }
    });
    if is_document {
      return Route::CacheFirst;
    }

    if request.mode == RequestMode::Navigate
      || self.record_sections.iter().any(|section| under(path, section))
    {
      return Route::NetworkFirst;
    }

    Route::CacheFirst
  }
}

/// Decides, per request, whether to answer from cache, network, or a
/// fallback page, and manages the cache version lifecycle.
pub struct CacheStrategyRouter<S: CacheStorage> {
  storage: Arc<S>,
  fetcher: Arc<dyn Fetcher>,
  version: CacheVersion,
  rules: RouteRules,
  origin: Url,
  login_path: String,
  offline_path: String,
  auth_purge_paths: Vec<String>,
  shell_assets: Vec<String>,
  clients: Option<Arc<ClientRegistry>>,
}

impl<S: CacheStorage> CacheStrategyRouter<S> {
  pub fn new(storage: Arc<S>, fetcher: Arc<dyn Fetcher>, config: &Config) -> Result<Self> {
    let origin = Url::parse(&config.server.base_url)
      .map_err(|e| eyre!("Invalid server URL {}: {}", config.server.base_url, e))?;

    Ok(Self {
      storage,
      fetcher,
      version: CacheVersion::new(config.cache.version.clone()),
      rules: RouteRules::from_config(config),
      origin,
      login_path: config.server.login_path.clone(),
      offline_path: config.server.offline_path.clone(),
      auth_purge_paths: config.server.auth_purge_paths.clone(),
      shell_assets: config.cache.shell_assets.clone(),
      clients: None,
    })
  }

  /// Views to claim when a new version activates.
  pub fn with_clients(mut self, clients: Arc<ClientRegistry>) -> Self {
    self.clients = Some(clients);
    self
  }

  pub fn version(&self) -> &CacheVersion {
    &self.version
  }

  pub fn storage(&self) -> &Arc<S> {
    &self.storage
  }

  /// Absolute URL for a path on the server.
  pub fn url(&self, path: &str) -> Result<Url> {
    self
      .origin
      .join(path)
      .map_err(|e| eyre!("Invalid path {}: {}", path, e))
  }

  pub fn on_intercept(&self, request: &Request) -> Route {
    self.rules.classify(request)
  }

  /// Answer an intercepted request. `None` means the request was not
  /// intercepted and should go to the network as-is.
  pub async fn handle(&self, request: &Request) -> Result<Option<Served>> {
    let route = self.on_intercept(request);
    debug!(path = request.path(), ?route, "Routing request");

    match route {
      Route::Passthrough => Ok(None),
      Route::CacheFirst => self.cache_first(request).await.map(Some),
      Route::NetworkFirst => self.network_first(request).await.map(Some),
      Route::NetworkOnly => self.network_only(request).await.map(Some),
    }
  }

  async fn cache_first(&self, request: &Request) -> Result<Served> {
    let generation = self.version.static_name();
    let key = request.cache_key();

    if let Some(hit) = self.storage.match_entry(&generation, &key)? {
      return Ok(Served::cache(hit.response));
    }

    let response = self.fetcher.fetch(&request.following()).await?;
    if response.kind != ResponseKind::OpaqueRedirect {
      if let Err(e) = self.storage.put(&generation, &key, &response) {
        warn!("Failed to cache {}: {}", key, e);
      }
    }

    Ok(Served::network(response))
  }

  async fn network_first(&self, request: &Request) -> Result<Served> {
    let generation = self.version.dynamic_name();
    let key = request.cache_key();

    let response = match self.fetcher.fetch(request).await {
      Ok(response) => response,
      Err(e) => {
        debug!("Network failed for {}: {}", key, e);
        match self.storage.match_entry(&generation, &key) {
          Ok(Some(hit)) => return Ok(Served::cache(hit.response)),
          Ok(None) => {}
          Err(lookup) => warn!("Failed to read cached {}: {}", key, lookup),
        }
        return self.offline_fallback(e);
      }
    };

    if response.is_auth_failure() {
      warn!(status = response.status, "Session expired, clearing cached views");
      return self.redirect_to_login().await;
    }

    if response.kind == ResponseKind::OpaqueRedirect {
      return Ok(Served::network(response));
    }

    if response.status == 200 && response.is_html() {
      if let Err(e) = self.storage.put(&generation, &key, &response) {
        warn!("Failed to cache {}: {}", key, e);
      }
    }

    Ok(Served::network(response))
  }

  async fn network_only(&self, request: &Request) -> Result<Served> {
    match self.fetcher.fetch(&request.following()).await {
      Ok(response) => Ok(Served::network(response)),
      Err(e) => self.offline_fallback(e),
    }
  }

  async fn redirect_to_login(&self) -> Result<Served> {
    let generation = self.version.dynamic_name();
    for path in &self.auth_purge_paths {
      if let Err(e) = self.storage.delete(&generation, path) {
        warn!("Failed to purge {}: {}", path, e);
      }
    }

    let login = Request::get(self.url(&self.login_path)?);
    let response = self.fetcher.fetch(&login).await?;

    Ok(Served {
      response,
      source: ResponseSource::LoginRedirect,
    })
  }

  fn offline_fallback(&self, cause: Report) -> Result<Served> {
    match self.storage.match_any(&self.offline_path)? {
      Some(hit) => Ok(Served {
        response: hit.response,
        source: ResponseSource::OfflineFallback,
      }),
      None => Err(cause.wrap_err("Network unavailable and no offline page cached")),
    }
  }

  /// Fetch every shell asset into the static generation. Nothing is stored
  /// unless every asset comes back OK.
  pub async fn on_install(&self) -> Result<usize> {
    let requests = self
      .shell_assets
      .iter()
      .map(|asset| self.url(asset).map(Request::get))
      .collect::<Result<Vec<_>>>()?;

    let entries = try_join_all(requests.iter().map(|request| async move {
      let response = self
        .fetcher
        .fetch(request)
        .await
        .map_err(|e| e.wrap_err(format!("Failed to install {}", request.path())))?;

      if !response.is_ok() {
        return Err(eyre!(
          "Failed to install {}: HTTP {}",
          request.path(),
          response.status
        ));
      }

      Ok::<_, Report>((request.cache_key(), response))
    }))
    .await?;

    self
      .storage
      .put_all(&self.version.static_name(), &entries)?;

    info!(
      version = self.version.tag(),
      assets = entries.len(),
      "Installed app shell"
    );
    Ok(entries.len())
  }

  /// Drop every generation other than this version's and take control of
  /// all open views. Returns the purged generation names.
  pub fn on_activate(&self) -> Result<Vec<String>> {
    let keep = [self.version.static_name(), self.version.dynamic_name()];
    let mut purged = Vec::new();

    for name in self.storage.generations()? {
      if !keep.contains(&name) {
        self.storage.delete_generation(&name)?;
        purged.push(name);
      }
    }

    if let Some(clients) = &self.clients {
      clients.claim(self.version.tag());
    }

    info!(version = self.version.tag(), ?purged, "Activated cache version");
    Ok(purged)
  }
}
