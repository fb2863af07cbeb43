// ADMX Cache Store
//
// SQLite schema and connection handling for the policy cache:
//
//   Meta            key/value bookkeeping (schema version, source root,
//                   per-culture fingerprints)
//   Policies        one row per (ns, policy_name)
//   PolicyI18n      one row per (policy, culture)
//   PolicyIndex     FTS5 projections, one row per (policy, culture)
//   PolicyIndexMap  PolicyIndex rowid <-> (policy, culture)

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::types::ValueRef;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Transaction};

pub const SCHEMA_VERSION: i64 = 2;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS Policies (
    id INTEGER PRIMARY KEY,
    ns TEXT NOT NULL,
    policy_name TEXT NOT NULL,
    category_key TEXT,
    hive TEXT NOT NULL,
    reg_key TEXT NOT NULL,
    reg_value TEXT,
    value_type TEXT NOT NULL,
    product_hint TEXT,
    UNIQUE (ns, policy_name)
);
CREATE INDEX IF NOT EXISTS ix_policies_name ON Policies (policy_name COLLATE NOCASE);
CREATE INDEX IF NOT EXISTS ix_policies_key ON Policies (reg_key COLLATE NOCASE);

CREATE TABLE IF NOT EXISTS PolicyI18n (
    policy_id INTEGER NOT NULL REFERENCES Policies (id) ON DELETE CASCADE,
    culture TEXT NOT NULL COLLATE NOCASE,
    display_name TEXT NOT NULL,
    explain_text TEXT NOT NULL,
    category_path TEXT NOT NULL,
    presentation_json TEXT,
    PRIMARY KEY (policy_id, culture)
);
CREATE INDEX IF NOT EXISTS ix_i18n_culture ON PolicyI18n (culture);

CREATE VIRTUAL TABLE IF NOT EXISTS PolicyIndex USING fts5 (
    title_norm,
    desc_norm,
    title_loose,
    desc_loose,
    registry_path,
    tags,
    tokenize = 'unicode61 remove_diacritics 0'
);

CREATE TABLE IF NOT EXISTS PolicyIndexMap (
    fts_rowid INTEGER PRIMARY KEY,
    policy_id INTEGER NOT NULL REFERENCES Policies (id) ON DELETE CASCADE,
    culture TEXT NOT NULL COLLATE NOCASE,
    UNIQUE (policy_id, culture)
);
CREATE INDEX IF NOT EXISTS ix_map_culture ON PolicyIndexMap (culture);
";

const DROP_SCHEMA: &str = "
DROP TABLE IF EXISTS PolicyIndexMap;
DROP TABLE IF EXISTS PolicyIndex;
DROP TABLE IF EXISTS PolicyI18n;
DROP TABLE IF EXISTS Policies;
DELETE FROM Meta;
";

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("cache I/O failed: {0}")]
    Io(#[from] io::Error),

    #[error("cache serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("cache operation cancelled")]
    Cancelled,

    #[error("unsupported cache schema version {0}")]
    VersionMismatch(i64),
}

/// Handle on the cache database file. Connections are opened per operation.
#[derive(Debug, Clone)]
pub struct AdmxCacheStore {
    path: PathBuf,
}

impl AdmxCacheStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn open(&self) -> Result<Connection, CacheError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_FULL_MUTEX;
        let connection = Connection::open_with_flags(&self.path, flags)?;
        connection.execute_batch("PRAGMA foreign_keys = ON;")?;
        let _mode: String =
            connection.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        connection.busy_timeout(BUSY_TIMEOUT)?;
        Ok(connection)
    }

    /// Create the schema if needed and check its version. Caches written by
    /// an older schema are emptied and rebuilt on the next scan. Idempotent.
    pub fn initialize(&self) -> Result<(), CacheError> {
        let mut connection = self.open()?;
        let tx = connection.transaction()?;
        tx.execute_batch(
            "CREATE TABLE IF NOT EXISTS Meta (key TEXT PRIMARY KEY, value TEXT NOT NULL);",
        )?;
        match read_meta(&tx, "schema_version")? {
            None => {
                tx.execute_batch(SCHEMA)?;
                write_meta(&tx, "schema_version", &SCHEMA_VERSION.to_string())?;
            }
            Some(value) => {
                let version = value.parse::<i64>().unwrap_or(-1);
                if (1..SCHEMA_VERSION).contains(&version) {
                    tracing::info!(
                        from = version,
                        to = SCHEMA_VERSION,
                        "resetting policy cache schema"
                    );
                    tx.execute_batch(DROP_SCHEMA)?;
                    tx.execute_batch(SCHEMA)?;
                    write_meta(&tx, "schema_version", &SCHEMA_VERSION.to_string())?;
                } else if version != SCHEMA_VERSION {
                    return Err(CacheError::VersionMismatch(version));
                }
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Merge FTS segments and refresh planner statistics. Idempotent.
    pub fn optimize(&self) -> Result<(), CacheError> {
        let connection = self.open()?;
        connection.execute("INSERT INTO PolicyIndex (PolicyIndex) VALUES ('optimize')", [])?;
        connection.execute_batch("PRAGMA optimize;")?;
        Ok(())
    }

    /// Cultures with at least one indexed policy.
    pub fn cultures(&self) -> Result<Vec<String>, CacheError> {
        let connection = self.open()?;
        let mut stmt =
            connection.prepare("SELECT DISTINCT culture FROM PolicyIndexMap ORDER BY culture")?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    pub fn meta(&self, key: &str) -> Result<Option<String>, CacheError> {
        let connection = self.open()?;
        read_meta(&connection, key)
    }

    /// Every row of every table, rendered as text in a stable order.
    pub fn dump(&self) -> Result<Vec<String>, CacheError> {
        let connection = self.open()?;
        let queries = [
            ("Meta", "SELECT * FROM Meta ORDER BY key"),
            ("Policies", "SELECT * FROM Policies ORDER BY id"),
            ("PolicyI18n", "SELECT * FROM PolicyI18n ORDER BY policy_id, culture"),
            ("PolicyIndexMap", "SELECT * FROM PolicyIndexMap ORDER BY fts_rowid"),
            ("PolicyIndex", "SELECT rowid, * FROM PolicyIndex ORDER BY rowid"),
        ];

        let mut lines = Vec::new();
        for (table, sql) in queries {
            let mut stmt = connection.prepare(sql)?;
            let columns = stmt.column_count();
            let mut rows = stmt.query([])?;
            while let Some(row) = rows.next()? {
                let mut line = String::from(table);
                for i in 0..columns {
                    line.push('|');
                    line.push_str(&render(row.get_ref(i)?));
                }
                lines.push(line);
            }
        }
        Ok(lines)
    }
}

fn render(value: ValueRef<'_>) -> String {
    match value {
        ValueRef::Null => "NULL".into(),
        ValueRef::Integer(n) => n.to_string(),
        ValueRef::Real(r) => r.to_string(),
        ValueRef::Text(t) => String::from_utf8_lossy(t).into_owned(),
        ValueRef::Blob(b) => format!("<{} bytes>", b.len()),
    }
}

pub(crate) fn read_meta(connection: &Connection, key: &str) -> Result<Option<String>, CacheError> {
    Ok(connection
        .query_row("SELECT value FROM Meta WHERE key = ?1", params![key], |row| {
            row.get(0)
        })
        .optional()?)
}

pub(crate) fn write_meta(connection: &Connection, key: &str, value: &str) -> Result<(), CacheError> {
    connection.execute(
        "INSERT INTO Meta (key, value) VALUES (?1, ?2)
         ON CONFLICT (key) DO UPDATE SET value = excluded.value",
        params![key, value],
    )?;
    Ok(())
}

/// Remove every policy and every culture, and forget all fingerprints.
pub(crate) fn purge_all(tx: &Transaction<'_>) -> Result<(), CacheError> {
    tx.execute_batch(
        "DELETE FROM PolicyIndex;
         DELETE FROM PolicyIndexMap;
         DELETE FROM PolicyI18n;
         DELETE FROM Policies;
         DELETE FROM Meta WHERE key LIKE 'fingerprint:%';",
    )?;
    Ok(())
}

/// Remove exactly one culture's display and index rows.
pub(crate) fn purge_culture(tx: &Transaction<'_>, culture: &str) -> Result<(), CacheError> {
    tx.execute(
        "DELETE FROM PolicyIndex
         WHERE rowid IN (SELECT fts_rowid FROM PolicyIndexMap WHERE culture = ?1)",
        params![culture],
    )?;
    tx.execute("DELETE FROM PolicyIndexMap WHERE culture = ?1", params![culture])?;
    tx.execute("DELETE FROM PolicyI18n WHERE culture = ?1", params![culture])?;
    Ok(())
}

/// Drop policies no culture refers to any more.
pub(crate) fn purge_orphans(tx: &Transaction<'_>) -> Result<usize, CacheError> {
    Ok(tx.execute(
        "DELETE FROM Policies WHERE id NOT IN (SELECT policy_id FROM PolicyI18n)",
        [],
    )?)
}
