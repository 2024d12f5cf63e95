use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use offsync::cache::{CacheStrategyRouter, HttpFetcher, Request, SqliteCacheStorage};
use offsync::clients::ClientRegistry;
use offsync::config::Config;
use offsync::notify::{LogNotifier, Notifier};
use offsync::queue::{QueueStorage, SqliteQueueStore};
use offsync::sync::{
  BackgroundReconciler, ConnectivityMonitor, ConnectivityTrigger, ForegroundSync, HttpRecordSink,
  SyncEngine,
};

#[derive(Parser, Debug)]
#[command(name = "offsync")]
#[command(about = "Offline drafts with background sync, and an offline-first HTTP cache")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/offsync/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  /// Log at debug level
  #[arg(short, long, global = true)]
  verbose: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Queue a JSON payload as a draft (reads stdin when no file is given)
  Save {
    file: Option<PathBuf>,
    /// Reuse an existing draft id instead of generating one
    #[arg(long)]
    id: Option<String>,
  },
  /// Print drafts as JSON lines
  List {
    /// Include drafts already accepted by the server
    #[arg(long)]
    all: bool,
  },
  /// Delete a draft
  Remove { id: String },
  /// Push every pending draft once
  Sync,
  /// Watch connectivity and sync whenever the server comes back
  Watch,
  /// Run the background reconciler for a trigger tag
  Background {
    #[arg(long)]
    tag: Option<String>,
  },
  /// Fetch the app shell into the current cache version
  Install,
  /// Drop cache generations from other versions
  Activate,
  /// Send one request through the cache router
  Fetch {
    path: String,
    /// Treat the request as a page navigation
    #[arg(long)]
    navigate: bool,
    #[arg(long, default_value = "GET")]
    method: String,
  },
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _guard = offsync::logging::init(args.verbose)?;

  let config = Config::load(args.config.as_deref())?;

  match args.command {
    Command::Save { file, id } => save(&config, file, id),
    Command::List { all } => list(&config, all),
    Command::Remove { id } => remove(&config, &id),
    Command::Sync => sync_once(&config).await,
    Command::Watch => watch(&config).await,
    Command::Background { tag } => background(&config, tag).await,
    Command::Install => install(&config).await,
    Command::Activate => activate(&config),
    Command::Fetch {
      path,
      navigate,
      method,
    } => fetch(&config, &path, navigate, &method).await,
  }
}

fn open_store(config: &Config) -> Result<Arc<SqliteQueueStore>> {
  SqliteQueueStore::open_shared(&config.queue_path()?)
}

fn engine(config: &Config) -> Result<SyncEngine<SqliteQueueStore>> {
  let sink = HttpRecordSink::new(config.server_url(&config.server.sync_endpoint)?)?;
  let engine = SyncEngine::new(open_store(config)?, Arc::new(sink));
  Ok(engine.with_max_attempts(config.queue.max_attempts))
}

fn foreground(config: &Config) -> Result<ForegroundSync<SqliteQueueStore>> {
  Ok(ForegroundSync::new(
    engine(config)?,
    Arc::new(LogNotifier),
    config.server.listing_path.clone(),
    config.server.drafts_path.clone(),
  ))
}

fn router(config: &Config) -> Result<CacheStrategyRouter<SqliteCacheStorage>> {
  let storage = Arc::new(SqliteCacheStorage::open(&config.cache_path()?)?);
  CacheStrategyRouter::new(storage, Arc::new(HttpFetcher::new()?), config)
}

fn save(config: &Config, file: Option<PathBuf>, id: Option<String>) -> Result<()> {
  let contents = match file {
    Some(path) => std::fs::read_to_string(&path)
      .map_err(|e| eyre!("Failed to read {}: {}", path.display(), e))?,
    None => {
      let mut buf = String::new();
      std::io::stdin()
        .read_to_string(&mut buf)
        .map_err(|e| eyre!("Failed to read stdin: {}", e))?;
      buf
    }
  };

  let payload: Value =
    serde_json::from_str(&contents).map_err(|e| eyre!("Payload is not valid JSON: {}", e))?;
  if !payload.is_object() {
    return Err(eyre!("Payload must be a JSON object"));
  }

  let record = open_store(config)?.save_draft(payload, id)?;
  println!("{}", record.id);
  Ok(())
}

fn list(config: &Config, all: bool) -> Result<()> {
  let store = open_store(config)?;
  let records = if all {
    store.list_all::<Value>()?
  } else {
    store.list_pending::<Value>()?
  };

  for record in records {
    let line = serde_json::to_string(&record).map_err(|e| eyre!("Failed to encode draft: {}", e))?;
    println!("{}", line);
  }
  Ok(())
}

fn remove(config: &Config, id: &str) -> Result<()> {
  open_store(config)?.remove(id)?;
  Ok(())
}

async fn sync_once(config: &Config) -> Result<()> {
  let report = foreground(config)?.drain_pending().await?;
  if report.skipped {
    warn!("A sync is already running");
    return Ok(());
  }

  println!(
    "attempted {} synced {} failed {} deferred {}",
    report.attempted,
    report.synced.len(),
    report.failed.len(),
    report.deferred.len()
  );
  for (id, reason) in &report.failed {
    println!("{}\t{}", id, reason);
  }
  Ok(())
}

async fn watch(config: &Config) -> Result<()> {
  let notifier: Arc<dyn Notifier> = Arc::new(LogNotifier);
  let trigger = ConnectivityTrigger::new(Arc::new(foreground(config)?), notifier)
    .with_debounce(Duration::from_millis(config.sync.debounce_ms));

  let monitor = ConnectivityMonitor::new(
    config.server_url(&config.server.login_path)?,
    Duration::from_secs(config.sync.probe_interval_secs),
  )?;
  let (mut changes, probe) = monitor.spawn();

  info!("Watching {} for connectivity changes", config.server.base_url);
  loop {
    tokio::select! {
      change = changes.recv() => match change {
        Some(state) => trigger.on_connectivity(state),
        None => break,
      },
      _ = tokio::signal::ctrl_c() => {
        info!("Stopping");
        break;
      }
    }
  }

  probe.abort();
  Ok(())
}

async fn background(config: &Config, tag: Option<String>) -> Result<()> {
  let reconciler = BackgroundReconciler::new(
    engine(config)?,
    Arc::new(ClientRegistry::new()),
    Arc::new(LogNotifier),
  )
  .with_tag(config.sync.background_tag.clone());

  let tag = tag.unwrap_or_else(|| config.sync.background_tag.clone());
  match reconciler.on_background_trigger(&tag).await {
    Some(report) => println!("synced {} failed {}", report.synced.len(), report.failed.len()),
    None => println!("nothing to do for {}", tag),
  }
  Ok(())
}

async fn install(config: &Config) -> Result<()> {
  let router = router(config)?;
  let count = router.on_install().await?;
  println!("installed {} assets into {}", count, router.version().static_name());
  Ok(())
}

fn activate(config: &Config) -> Result<()> {
  let router = router(config)?;
  for name in router.on_activate()? {
    println!("purged {}", name);
  }
  for (name, entries) in router.storage().entry_counts()? {
    println!("{}\t{} entries", name, entries);
  }
  Ok(())
}

async fn fetch(config: &Config, path: &str, navigate: bool, method: &str) -> Result<()> {
  let router = router(config)?;
  let url = router.url(path)?;
  let request = if navigate {
    Request::navigate(url)
  } else {
    Request::get(url)
  }
  .with_method(method);

  match router.handle(&request).await? {
    Some(served) => println!(
      "{} {:?} {} bytes",
      served.response.status,
      served.source,
      served.response.body.len()
    ),
    None => println!("{:?}: not intercepted", router.on_intercept(&request)),
  }
  Ok(())
}
