//! Shared SQLite connection and schema for the durable stores.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::Connection;

use crate::error::Result;
use crate::queue::SqliteEntryStore;
use crate::store::sqlite::{SqliteControlStore, SqliteRunStore};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS queue_entries (
  id TEXT PRIMARY KEY,
  name TEXT NOT NULL,
  kind TEXT NOT NULL,
  command TEXT NOT NULL,
  archived INTEGER NOT NULL DEFAULT 0,
  created_ms INTEGER NOT NULL,
  updated_ms INTEGER NOT NULL,
  enabled INTEGER NOT NULL DEFAULT 1,
  auto_repeat INTEGER NOT NULL DEFAULT 1,
  priority INTEGER NOT NULL DEFAULT 0,
  running INTEGER NOT NULL DEFAULT 0,
  started_ms INTEGER NULL,
  completed_ms INTEGER NULL,
  state_label TEXT NULL
);
CREATE TABLE IF NOT EXISTS runs (
  id TEXT PRIMARY KEY,
  config_id TEXT NOT NULL,
  samples_per_run INTEGER NOT NULL,
  created_ms INTEGER NOT NULL,
  updated_ms INTEGER NOT NULL,
  stats_json TEXT NULL
);
CREATE TABLE IF NOT EXISTS samples (
  seq INTEGER PRIMARY KEY AUTOINCREMENT,
  id TEXT NOT NULL UNIQUE,
  run_id TEXT NOT NULL,
  config_id TEXT NOT NULL,
  value REAL NOT NULL,
  created_ms INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS control (
  singleton INTEGER PRIMARY KEY CHECK (singleton = 1),
  paused INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_queue_entries_claim ON queue_entries(running, enabled, archived, priority DESC, completed_ms);
CREATE INDEX IF NOT EXISTS idx_runs_config_created ON runs(config_id, created_ms DESC);
CREATE INDEX IF NOT EXISTS idx_samples_run_created ON samples(run_id, created_ms, seq);
"#;

/// Handle to one SQLite database shared by the entry, run and control stores.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (or create) a database file. Several processes may open the same
    /// file; writers serialize on SQLite's database lock.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
            row.get::<_, String>(0)
        })?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(SCHEMA)?;
        tracing::debug!("SQLite schema ready");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn entry_store(&self) -> SqliteEntryStore {
        SqliteEntryStore::new(self.conn.clone())
    }

    pub fn run_store(&self) -> SqliteRunStore {
        SqliteRunStore::new(self.conn.clone())
    }

    pub fn control_store(&self) -> SqliteControlStore {
        SqliteControlStore::new(self.conn.clone())
    }
}

pub(crate) fn dt_to_ms(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

pub(crate) fn ms_to_dt(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or_default()
}

pub(crate) fn parse_uuid(value: &str) -> rusqlite::Result<uuid::Uuid> {
    uuid::Uuid::parse_str(value).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })
}
