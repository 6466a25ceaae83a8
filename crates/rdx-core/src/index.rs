//! SQLite index holding every piece of pipeline metadata.
//!
//! Each operation opens its own connection; writes go through
//! [`Index::with_immediate_tx`] so concurrent writers queue on the database
//! lock instead of failing mid-transaction.

use std::{
    fs,
    path::{Path, PathBuf},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};

const INDEX_FILENAME: &str = "index.sqlite";
const SCHEMA_VERSION: u32 = 2;
const META_KEY_SCHEMA_VERSION: &str = "schema_version";
const META_KEY_CREATED_BY: &str = "created_by_rdx_version";
const META_KEY_LAST_USED: &str = "last_used_rdx_version";
const RDX_VERSION: &str = env!("CARGO_PKG_VERSION");

const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS studies (
    object_id TEXT PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    server_key TEXT NOT NULL,
    created_at INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS participants (
    patient_id TEXT PRIMARY KEY,
    study_id TEXT NOT NULL REFERENCES studies(object_id),
    device_id TEXT NOT NULL DEFAULT '',
    os_type TEXT NOT NULL DEFAULT '',
    created_at INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS files_to_process (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    s3_file_path TEXT NOT NULL UNIQUE,
    study_id TEXT NOT NULL,
    participant_id TEXT NOT NULL,
    created_at INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS chunks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    study_id TEXT NOT NULL,
    participant_id TEXT NOT NULL,
    data_type TEXT NOT NULL,
    survey_id TEXT NOT NULL DEFAULT '',
    time_bin INTEGER NOT NULL,
    chunk_path TEXT NOT NULL,
    blob_key TEXT NOT NULL,
    chunk_hash TEXT,
    is_chunkable INTEGER NOT NULL,
    number_of_observations INTEGER NOT NULL DEFAULT 0,
    last_updated INTEGER NOT NULL,
    deleted INTEGER NOT NULL DEFAULT 0
);
CREATE UNIQUE INDEX IF NOT EXISTS chunks_live_bucket
    ON chunks(study_id, participant_id, data_type, survey_id, time_bin)
    WHERE deleted = 0 AND is_chunkable = 1;
CREATE UNIQUE INDEX IF NOT EXISTS chunks_live_path
    ON chunks(chunk_path)
    WHERE deleted = 0;
CREATE TABLE IF NOT EXISTS file_process_lock (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    lock_time INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS received_data_stats (
    participant_id TEXT NOT NULL,
    data_type TEXT NOT NULL,
    number_of_uploads INTEGER NOT NULL,
    number_bytes_uploaded INTEGER NOT NULL,
    last_upload_timestamp INTEGER NOT NULL,
    PRIMARY KEY (participant_id, data_type)
);
CREATE TABLE IF NOT EXISTS received_data_stats_hourly (
    participant_id TEXT NOT NULL,
    data_type TEXT NOT NULL,
    hour INTEGER NOT NULL,
    number_of_uploads INTEGER NOT NULL DEFAULT 0,
    number_bytes_uploaded INTEGER NOT NULL DEFAULT 0,
    number_of_observations INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (participant_id, data_type, hour)
);
CREATE TABLE IF NOT EXISTS upload_tracking (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    file_path TEXT NOT NULL,
    file_size INTEGER NOT NULL,
    timestamp INTEGER NOT NULL,
    participant_id TEXT NOT NULL,
    data_type TEXT
);
CREATE TABLE IF NOT EXISTS line_encryption_errors (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    type TEXT NOT NULL,
    line TEXT NOT NULL,
    base64_decryption_key TEXT NOT NULL,
    prev_line TEXT NOT NULL,
    next_line TEXT NOT NULL,
    participant_id TEXT NOT NULL,
    created_at INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS encryption_error_metadata (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    file_name TEXT NOT NULL,
    total_lines INTEGER NOT NULL,
    number_errors INTEGER NOT NULL,
    error_lines TEXT NOT NULL,
    error_types TEXT NOT NULL,
    participant_id TEXT NOT NULL,
    created_at INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS decryption_key_errors (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    file_path TEXT NOT NULL,
    contents TEXT NOT NULL,
    traceback TEXT NOT NULL,
    participant_id TEXT NOT NULL,
    created_at INTEGER NOT NULL
);
";

const EXPECTED_TABLES: [&str; 12] = [
    "meta",
    "studies",
    "participants",
    "files_to_process",
    "chunks",
    "file_process_lock",
    "received_data_stats",
    "received_data_stats_hourly",
    "upload_tracking",
    "line_encryption_errors",
    "encryption_error_metadata",
    "decryption_key_errors",
];

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum IndexError {
    #[error("[RD410] index metadata is missing required key '{0}'")]
    MissingMeta(String),
    #[error("[RD411] index schema incompatible for {key}: expected {expected}, found {found}")]
    IncompatibleSchema {
        key: String,
        expected: String,
        found: String,
    },
    #[error("[RD412] index is missing tables: {0}")]
    MissingTables(String),
}

impl IndexError {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::MissingMeta(_) => "RD410",
            Self::IncompatibleSchema { .. } => "RD411",
            Self::MissingTables(_) => "RD412",
        }
    }
}

/// Handle to the on-disk index. Cheap to clone; holds only the path.
#[derive(Clone, Debug)]
pub struct Index {
    path: PathBuf,
}

impl Index {
    /// Open (creating if needed) the index under `root`.
    ///
    /// # Errors
    /// Fails if the directory or database cannot be created, or if an
    /// existing database was written with a different schema version.
    pub fn open(root: &Path) -> Result<Self> {
        fs::create_dir_all(root)
            .with_context(|| format!("failed to create data root {}", root.display()))?;
        let index = Self {
            path: root.join(INDEX_FILENAME),
        };
        let mut conn = index.connection()?;
        conn.execute_batch(SCHEMA)
            .context("failed to initialize index schema")?;
        index.ensure_meta(&mut conn)?;
        index.assert_expected_tables(&conn)?;
        Ok(index)
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn connection(&self) -> Result<Connection> {
        let conn = Connection::open(&self.path)
            .with_context(|| format!("failed to open index at {}", self.path.display()))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .context("failed to enable WAL for index")?;
        conn.pragma_update(None, "foreign_keys", "ON")
            .context("failed to enable foreign keys for index")?;
        conn.busy_timeout(Duration::from_secs(10))
            .context("failed to set busy timeout for index")?;
        Ok(conn)
    }

    pub(crate) fn with_immediate_tx<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&rusqlite::Transaction<'_>) -> Result<T>,
    {
        let mut conn = self.connection()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start index transaction")?;
        let result = f(&tx)?;
        tx.commit().context("failed to commit index transaction")?;
        Ok(result)
    }

    fn ensure_meta(&self, conn: &mut Connection) -> Result<()> {
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start index meta transaction")?;
        tx.execute(
            "INSERT OR IGNORE INTO meta(key, value) VALUES (?1, ?2)",
            params![META_KEY_SCHEMA_VERSION, SCHEMA_VERSION.to_string()],
        )?;
        tx.execute(
            "INSERT OR IGNORE INTO meta(key, value) VALUES (?1, ?2)",
            params![META_KEY_CREATED_BY, RDX_VERSION],
        )?;
        tx.execute(
            "INSERT INTO meta(key, value) VALUES (?1, ?2) \
             ON CONFLICT(key) DO UPDATE SET value=excluded.value",
            params![META_KEY_LAST_USED, RDX_VERSION],
        )?;
        tx.commit()?;
        self.enforce_meta_version(conn, META_KEY_SCHEMA_VERSION, SCHEMA_VERSION)
    }

    fn meta_value(&self, conn: &Connection, key: &str) -> Result<Option<String>> {
        conn.query_row(
            "SELECT value FROM meta WHERE key = ?1",
            params![key],
            |row| row.get::<_, String>(0),
        )
        .optional()
        .map_err(Into::into)
    }

    fn enforce_meta_version(&self, conn: &Connection, key: &str, expected: u32) -> Result<()> {
        let value = self
            .meta_value(conn, key)?
            .ok_or_else(|| IndexError::MissingMeta(key.to_string()))?;
        if value.parse::<u32>().ok() != Some(expected) {
            return Err(IndexError::IncompatibleSchema {
                key: key.to_string(),
                expected: expected.to_string(),
                found: value,
            }
            .into());
        }
        Ok(())
    }

    fn assert_expected_tables(&self, conn: &Connection) -> Result<()> {
        let mut stmt = conn.prepare("SELECT name FROM sqlite_master WHERE type = 'table'")?;
        let found = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        let missing: Vec<&str> = EXPECTED_TABLES
            .iter()
            .copied()
            .filter(|name| !found.iter().any(|table| table == name))
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(IndexError::MissingTables(missing.join(", ")).into())
        }
    }
}

/// Seconds since the unix epoch.
pub(crate) fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| i64::try_from(elapsed.as_secs()).unwrap_or(i64::MAX))
}

/// Milliseconds since the unix epoch.
pub(crate) fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX))
}
