//! Queue storage trait and SQLite implementation.

use chrono::{DateTime, SecondsFormat, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::Duration;
use tracing::debug;

use super::record::{generate_id, DraftRecord, Payload};
use super::schema::{MIGRATIONS, SCHEMA_VERSION};

/// Trait for draft queue backends.
///
/// Every method may fail on an underlying storage error. Callers treat such
/// failures as transient: nothing is dropped, the draft is simply still
/// pending on the next sync cycle.
pub trait QueueStorage: Send + Sync {
  /// Upsert a draft. Generates an id when `id` is `None`; re-saving an
  /// existing id replaces that draft and resets its sync state.
  fn save_draft<P: Payload>(&self, payload: P, id: Option<String>) -> Result<DraftRecord<P>>;

  /// All drafts not yet accepted by the remote API.
  fn list_pending<P: Payload>(&self) -> Result<Vec<DraftRecord<P>>>;

  /// Every draft regardless of status.
  fn list_all<P: Payload>(&self) -> Result<Vec<DraftRecord<P>>>;

  fn get<P: Payload>(&self, id: &str) -> Result<Option<DraftRecord<P>>>;

  /// Mark a draft as accepted. Returns false if no such draft exists.
  fn mark_synced(&self, id: &str) -> Result<bool>;

  /// Record a sync failure. Returns false if no such draft exists.
  fn mark_error(&self, id: &str, message: &str) -> Result<bool>;

  fn remove(&self, id: &str) -> Result<bool>;
}

const UNKNOWN_ERROR: &str = "Unknown error";

/// SQLite-backed draft queue.
pub struct SqliteQueueStore {
  conn: Mutex<Connection>,
}

static OPEN_STORES: OnceLock<Mutex<HashMap<PathBuf, Arc<SqliteQueueStore>>>> = OnceLock::new();

impl SqliteQueueStore {
  /// Open (or create) the queue database at `path`, upgrading its schema.
  pub fn open(path: &Path) -> Result<Self> {
    if let Some(parent) = path.parent() {
      if !parent.as_os_str().is_empty() {
        std::fs::create_dir_all(parent)
          .map_err(|e| eyre!("Failed to create queue directory: {}", e))?;
      }
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open queue database at {}: {}", path.display(), e))?;

    conn
      .busy_timeout(Duration::from_secs(5))
      .map_err(|e| eyre!("Failed to set busy timeout: {}", e))?;
    conn
      .pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))
      .map_err(|e| eyre!("Failed to enable WAL: {}", e))?;

    Self::from_connection(conn)
  }

  /// Open the queue at `path` once per process and hand out the same store
  /// to every caller afterwards.
  pub fn open_shared(path: &Path) -> Result<Arc<Self>> {
    let registry = OPEN_STORES.get_or_init(|| Mutex::new(HashMap::new()));
    let mut stores = registry
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let key = canonical_key(path);
    if let Some(store) = stores.get(&key) {
      return Ok(Arc::clone(store));
    }

    let store = Arc::new(Self::open(path)?);
    // Canonicalize again now that the file exists.
    stores.insert(canonical_key(path), Arc::clone(&store));
    Ok(store)
  }

  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory queue: {}", e))?;
    Self::from_connection(conn)
  }

  fn from_connection(mut conn: Connection) -> Result<Self> {
    run_migrations(&mut conn)?;
    Ok(Self {
      conn: Mutex::new(conn),
    })
  }

  fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
    self.conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  fn query_drafts<P: Payload>(&self, sql: &str) -> Result<Vec<DraftRecord<P>>> {
    let conn = self.conn()?;
    let mut stmt = conn
      .prepare(sql)
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let rows: Vec<DraftRow> = stmt
      .query_map([], DraftRow::from_row)
      .map_err(|e| eyre!("Failed to query drafts: {}", e))?
      .collect::<rusqlite::Result<_>>()
      .map_err(|e| eyre!("Failed to read draft: {}", e))?;

    rows.into_iter().map(DraftRow::decode).collect()
  }
}

fn canonical_key(path: &Path) -> PathBuf {
  std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

/// Apply every migration newer than the database's `user_version`.
///
/// Runs inside an immediate transaction so two processes opening the same
/// file at once cannot both apply a step.
fn run_migrations(conn: &mut Connection) -> Result<()> {
  let tx = conn
    .transaction_with_behavior(TransactionBehavior::Immediate)
    .map_err(|e| eyre!("Failed to begin migration: {}", e))?;

  let current: i64 = tx
    .query_row("PRAGMA user_version", [], |row| row.get(0))
    .map_err(|e| eyre!("Failed to read schema version: {}", e))?;
  let current = usize::try_from(current).unwrap_or(0);

  for (index, sql) in MIGRATIONS.iter().enumerate().skip(current) {
    let version = index + 1;
    debug!(version, "Applying queue migration");
    tx.execute_batch(sql)
      .map_err(|e| eyre!("Failed to apply queue migration v{}: {}", version, e))?;
    tx.execute_batch(&format!("PRAGMA user_version = {}", version))
      .map_err(|e| eyre!("Failed to bump schema version: {}", e))?;
  }

  tx.commit()
    .map_err(|e| eyre!("Failed to commit migrations: {}", e))?;

  debug!(version = SCHEMA_VERSION, "Queue schema ready");
  Ok(())
}

const SELECT_DRAFTS: &str =
  "SELECT id, payload, created_at, synced, last_error, attempts FROM drafts";

struct DraftRow {
  id: String,
  payload: Vec<u8>,
  created_at: String,
  synced: bool,
  last_error: Option<String>,
  attempts: u32,
}

impl DraftRow {
  fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      id: row.get(0)?,
      payload: row.get(1)?,
      created_at: row.get(2)?,
      synced: row.get(3)?,
      last_error: row.get(4)?,
      attempts: row.get(5)?,
    })
  }

  fn decode<P: Payload>(self) -> Result<DraftRecord<P>> {
    let payload = serde_json::from_slice(&self.payload)
      .map_err(|e| eyre!("Failed to deserialize draft {}: {}", self.id, e))?;
    let created_at = DateTime::parse_from_rfc3339(&self.created_at)
      .map(|dt| dt.with_timezone(&Utc))
      .map_err(|e| eyre!("Failed to parse created_at '{}': {}", self.created_at, e))?;

    Ok(DraftRecord {
      id: self.id,
      payload,
      created_at,
      synced: self.synced,
      last_error: self.last_error,
      attempts: self.attempts,
    })
  }
}

impl QueueStorage for SqliteQueueStore {
  fn save_draft<P: Payload>(&self, payload: P, id: Option<String>) -> Result<DraftRecord<P>> {
    let id = id.filter(|id| !id.is_empty()).unwrap_or_else(generate_id);
    let record = DraftRecord::new(id, payload);

    let data = serde_json::to_vec(&record.payload)
      .map_err(|e| eyre!("Failed to serialize draft: {}", e))?;
    let created_at = record.created_at.to_rfc3339_opts(SecondsFormat::Millis, true);

    let conn = self.conn()?;
    conn
      .execute(
        "INSERT INTO drafts (id, payload, created_at, synced, last_error, attempts)
         VALUES (?, ?, ?, 0, NULL, 0)
         ON CONFLICT(id) DO UPDATE SET
           payload = excluded.payload,
           created_at = excluded.created_at,
           synced = 0,
           last_error = NULL,
           attempts = 0",
        params![record.id, data, created_at],
      )
      .map_err(|e| eyre!("Failed to save draft {}: {}", record.id, e))?;

    debug!(id = %record.id, "Draft saved");
    Ok(record)
  }

  fn list_pending<P: Payload>(&self) -> Result<Vec<DraftRecord<P>>> {
    self.query_drafts(&format!("{} WHERE synced = 0 ORDER BY rowid", SELECT_DRAFTS))
  }

  fn list_all<P: Payload>(&self) -> Result<Vec<DraftRecord<P>>> {
    self.query_drafts(&format!("{} ORDER BY rowid", SELECT_DRAFTS))
  }

  fn get<P: Payload>(&self, id: &str) -> Result<Option<DraftRecord<P>>> {
    let row = {
      let conn = self.conn()?;
      conn
        .query_row(
          &format!("{} WHERE id = ?", SELECT_DRAFTS),
          params![id],
          DraftRow::from_row,
        )
        .optional()
        .map_err(|e| eyre!("Failed to get draft {}: {}", id, e))?
    };

    row.map(DraftRow::decode).transpose()
  }

  fn mark_synced(&self, id: &str) -> Result<bool> {
    let conn = self.conn()?;
    let changed = conn
      .execute(
        "UPDATE drafts SET synced = 1, last_error = NULL WHERE id = ?",
        params![id],
      )
      .map_err(|e| eyre!("Failed to mark draft {} synced: {}", id, e))?;

    Ok(changed > 0)
  }

  fn mark_error(&self, id: &str, message: &str) -> Result<bool> {
    let message = if message.trim().is_empty() {
      UNKNOWN_ERROR
    } else {
      message
    };

    let conn = self.conn()?;
    let changed = conn
      .execute(
        "UPDATE drafts SET last_error = ?, attempts = attempts + 1 WHERE id = ?",
        params![message, id],
      )
      .map_err(|e| eyre!("Failed to record error on draft {}: {}", id, e))?;

    Ok(changed > 0)
  }

  fn remove(&self, id: &str) -> Result<bool> {
    let conn = self.conn()?;
    conn
      .execute("DELETE FROM drafts WHERE id = ?", params![id])
      .map_err(|e| eyre!("Failed to remove draft {}: {}", id, e))?;

    Ok(true)
  }
}
