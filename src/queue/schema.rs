//! Versioned queue schema. Each entry upgrades the database by one
//! `user_version`; entries are only ever appended and never drop data.

pub const MIGRATIONS: &[&str] = &[
  // v1: draft collection keyed by id
  r#"
CREATE TABLE IF NOT EXISTS drafts (
    id TEXT PRIMARY KEY NOT NULL,
    payload BLOB NOT NULL,
    created_at TEXT NOT NULL,
    synced INTEGER NOT NULL DEFAULT 0,
    last_error TEXT
);
"#,
  // v2: explicit uniqueness index, also added for stores created before it existed
  r#"
CREATE UNIQUE INDEX IF NOT EXISTS idx_drafts_id ON drafts(id);
"#,
  // v3: failed attempt counter
  r#"
ALTER TABLE drafts ADD COLUMN attempts INTEGER NOT NULL DEFAULT 0;
"#,
];

pub const SCHEMA_VERSION: usize = MIGRATIONS.len();
