//! Cache storage trait with SQLite and in-memory implementations.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use super::traits::{Response, ResponseKind};

/// A single cached response.
#[derive(Debug, Clone)]
pub struct CachedResponse {
  pub response: Response,
  /// When the response was cached
  pub cached_at: DateTime<Utc>,
}

/// Trait for generational cache backends.
///
/// A generation is a named, disposable set of entries keyed by request
/// identity. Generations exist once something has been written to them.
pub trait CacheStorage: Send + Sync {
  /// Look up a request in one generation.
  fn match_entry(&self, generation: &str, key: &str) -> Result<Option<CachedResponse>>;

  /// Look up a request across all generations, oldest generation first.
  fn match_any(&self, key: &str) -> Result<Option<CachedResponse>>;

  fn put(&self, generation: &str, key: &str, response: &Response) -> Result<()>;

  /// Store several entries at once; either all land or none do.
  fn put_all(&self, generation: &str, entries: &[(String, Response)]) -> Result<()>;

  fn delete(&self, generation: &str, key: &str) -> Result<bool>;

  /// Names of every generation, in creation order.
  fn generations(&self) -> Result<Vec<String>>;

  fn delete_generation(&self, generation: &str) -> Result<bool>;
}

/// Cache storage held entirely in memory.
#[derive(Default)]
pub struct MemoryCacheStorage {
  generations: Mutex<Vec<(String, BTreeMap<String, CachedResponse>)>>,
}

impl MemoryCacheStorage {
  pub fn new() -> Self {
    Self::default()
  }

  fn lock(&self) -> Result<MutexGuard<'_, Vec<(String, BTreeMap<String, CachedResponse>)>>> {
    self
      .generations
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

fn entries_for<'a>(
  generations: &'a mut Vec<(String, BTreeMap<String, CachedResponse>)>,
  name: &str,
) -> &'a mut BTreeMap<String, CachedResponse> {
  let index = match generations.iter().position(|(n, _)| n == name) {
    Some(index) => index,
    None => {
      generations.push((name.to_string(), BTreeMap::new()));
      generations.len() - 1
    }
  };
  &mut generations[index].1
}

impl CacheStorage for MemoryCacheStorage {
  fn match_entry(&self, generation: &str, key: &str) -> Result<Option<CachedResponse>> {
    let generations = self.lock()?;
    Ok(
      generations
        .iter()
        .find(|(name, _)| name == generation)
        .and_then(|(_, entries)| entries.get(key).cloned()),
    )
  }

  fn match_any(&self, key: &str) -> Result<Option<CachedResponse>> {
    let generations = self.lock()?;
    Ok(
      generations
        .iter()
        .find_map(|(_, entries)| entries.get(key).cloned()),
    )
  }

  fn put(&self, generation: &str, key: &str, response: &Response) -> Result<()> {
    let mut generations = self.lock()?;
    entries_for(&mut generations, generation).insert(
      key.to_string(),
      CachedResponse {
        response: response.clone(),
        cached_at: Utc::now(),
      },
    );
    Ok(())
  }

  fn put_all(&self, generation: &str, entries: &[(String, Response)]) -> Result<()> {
    let mut generations = self.lock()?;
    let target = entries_for(&mut generations, generation);
    for (key, response) in entries {
      target.insert(
        key.clone(),
        CachedResponse {
          response: response.clone(),
          cached_at: Utc::now(),
        },
      );
    }
    Ok(())
  }

  fn delete(&self, generation: &str, key: &str) -> Result<bool> {
    let mut generations = self.lock()?;
    Ok(
      generations
        .iter_mut()
        .find(|(name, _)| name == generation)
        .map(|(_, entries)| entries.remove(key).is_some())
        .unwrap_or(false),
    )
  }

  fn generations(&self) -> Result<Vec<String>> {
    let generations = self.lock()?;
    Ok(generations.iter().map(|(name, _)| name.clone()).collect())
  }

  fn delete_generation(&self, generation: &str) -> Result<bool> {
    let mut generations = self.lock()?;
    let before = generations.len();
    generations.retain(|(name, _)| name != generation);
    Ok(generations.len() != before)
  }
}

/// SQLite-based cache storage implementation.
pub struct SqliteCacheStorage {
  conn: Mutex<Connection>,
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS cache_generations (
    name TEXT PRIMARY KEY,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Cached responses, keyed by hashed request identity
CREATE TABLE IF NOT EXISTS cache_entries (
    generation TEXT NOT NULL,
    key_hash TEXT NOT NULL,
    request_key TEXT NOT NULL,
    status INTEGER NOT NULL,
    content_type TEXT,
    kind TEXT NOT NULL,
    body BLOB NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (generation, key_hash),
    FOREIGN KEY (generation) REFERENCES cache_generations(name) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_cache_entries_key ON cache_entries(key_hash);
"#;

impl SqliteCacheStorage {
  /// Open (or create) the cache database at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    if let Some(parent) = path.parent() {
      if !parent.as_os_str().is_empty() {
        std::fs::create_dir_all(parent)
          .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
      }
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::from_connection(conn)
  }

  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory cache: {}", e))?;
    Self::from_connection(conn)
  }

  fn from_connection(conn: Connection) -> Result<Self> {
    conn
      .execute_batch("PRAGMA foreign_keys = ON;")
      .map_err(|e| eyre!("Failed to enable foreign keys: {}", e))?;
    conn
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(Self {
      conn: Mutex::new(conn),
    })
  }

  fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
    self.conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  /// Entry count per generation, in creation order.
  pub fn entry_counts(&self) -> Result<Vec<(String, usize)>> {
    let conn = self.conn()?;
    let mut stmt = conn
      .prepare(
        "SELECT g.name, COUNT(e.key_hash) FROM cache_generations g
         LEFT JOIN cache_entries e ON e.generation = g.name
         GROUP BY g.name
         ORDER BY g.rowid",
      )
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let counts = stmt
      .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
      .map_err(|e| eyre!("Failed to count cache entries: {}", e))?
      .collect::<rusqlite::Result<Vec<(String, usize)>>>()
      .map_err(|e| eyre!("Failed to read cache counts: {}", e))?;

    Ok(counts)
  }
}

/// SHA256 of the request key, for stable fixed-length keys.
fn key_hash(key: &str) -> String {
  let mut hasher = Sha256::new();
  hasher.update(key.as_bytes());
  hex::encode(hasher.finalize())
}

fn insert_entry(conn: &Connection, generation: &str, key: &str, response: &Response) -> Result<()> {
  conn
    .execute(
      "INSERT OR IGNORE INTO cache_generations (name) VALUES (?)",
      params![generation],
    )
    .map_err(|e| eyre!("Failed to create cache generation {}: {}", generation, e))?;

  conn
    .execute(
      "INSERT OR REPLACE INTO cache_entries
         (generation, key_hash, request_key, status, content_type, kind, body, cached_at)
       VALUES (?, ?, ?, ?, ?, ?, ?, datetime('now'))",
      params![
        generation,
        key_hash(key),
        key,
        response.status,
        response.content_type,
        response.kind.as_str(),
        response.body,
      ],
    )
    .map_err(|e| eyre!("Failed to store cache entry {}: {}", key, e))?;

  Ok(())
}

type EntryRow = (u16, Option<String>, String, Vec<u8>, String);

fn entry_from_row(row: EntryRow) -> Result<CachedResponse> {
  let (status, content_type, kind, body, cached_at) = row;
  Ok(CachedResponse {
    response: Response {
      status,
      content_type,
      kind: ResponseKind::parse(&kind),
      body,
    },
    cached_at: parse_datetime(&cached_at)?,
  })
}

impl CacheStorage for SqliteCacheStorage {
  fn match_entry(&self, generation: &str, key: &str) -> Result<Option<CachedResponse>> {
    let row: Option<EntryRow> = {
      let conn = self.conn()?;
      conn
        .query_row(
          "SELECT status, content_type, kind, body, cached_at FROM cache_entries
           WHERE generation = ? AND key_hash = ?",
          params![generation, key_hash(key)],
          |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?)),
        )
        .optional()
        .map_err(|e| eyre!("Failed to query cache entry: {}", e))?
    };

    row.map(entry_from_row).transpose()
  }

  fn match_any(&self, key: &str) -> Result<Option<CachedResponse>> {
    let row: Option<EntryRow> = {
      let conn = self.conn()?;
      conn
        .query_row(
          "SELECT e.status, e.content_type, e.kind, e.body, e.cached_at
           FROM cache_entries e
           INNER JOIN cache_generations g ON g.name = e.generation
           WHERE e.key_hash = ?
           ORDER BY g.rowid
           LIMIT 1",
          params![key_hash(key)],
          |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?)),
        )
        .optional()
        .map_err(|e| eyre!("Failed to query cache entry: {}", e))?
    };

    row.map(entry_from_row).transpose()
  }

  fn put(&self, generation: &str, key: &str, response: &Response) -> Result<()> {
    let conn = self.conn()?;
    insert_entry(&conn, generation, key, response)
  }

  fn put_all(&self, generation: &str, entries: &[(String, Response)]) -> Result<()> {
    let mut conn = self.conn()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    for (key, response) in entries {
      insert_entry(&tx, generation, key, response)?;
    }

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  fn delete(&self, generation: &str, key: &str) -> Result<bool> {
    let conn = self.conn()?;
    let deleted = conn
      .execute(
        "DELETE FROM cache_entries WHERE generation = ? AND key_hash = ?",
        params![generation, key_hash(key)],
      )
      .map_err(|e| eyre!("Failed to delete cache entry {}: {}", key, e))?;

    Ok(deleted > 0)
  }

  fn generations(&self) -> Result<Vec<String>> {
    let conn = self.conn()?;
    let mut stmt = conn
      .prepare("SELECT name FROM cache_generations ORDER BY rowid")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list cache generations: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read cache generation: {}", e))?;

    Ok(names)
  }

  fn delete_generation(&self, generation: &str) -> Result<bool> {
    let conn = self.conn()?;
    let deleted = conn
      .execute(
        "DELETE FROM cache_generations WHERE name = ?",
        params![generation],
      )
      .map_err(|e| eyre!("Failed to delete cache generation {}: {}", generation, e))?;

    Ok(deleted > 0)
  }
}

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}
