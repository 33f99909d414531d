//! Persisted table of per-path file state.
//!
//! One SQLite table keyed by path, indexed by aggregate checksum (ordered
//! range queries for sync) and by (device, inode) for hard-link and rename
//! lookups. All access goes through a single mutex; every public method is
//! one logical operation and holds the lock for exactly that long.

use crate::entry::{DetectionMode, FileAttributes, FileEntry};
use crate::error::Result;
use crate::sync::{digest_checksums, SyncRange};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use tracing::debug;

const SCHEMA_VERSION: i32 = 1;

const ENTRY_COLUMNS: &str = "path, checksum, size, permissions, uid, gid, user_name, group_name, \
     mtime, inode, device, hashes, mode, scanned";

/// Result of reconciling one observation with the stored record.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreOutcome {
    Added(FileEntry),
    Modified {
        previous: FileEntry,
        current: FileEntry,
    },
    /// Checksums matched; only the scanned flag was refreshed.
    Unchanged(FileEntry),
    Removed(FileEntry),
    /// Nothing stored and nothing observed.
    Absent,
}

/// Digest summary of one key range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeSummary {
    pub count: usize,
    pub digest: String,
    /// Key at offset `count / 2`, the bisection point.
    pub split_key: Option<String>,
}

pub struct EntryStore {
    conn: Mutex<Connection>,
}

impl EntryStore {
    /// Open or create the store at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA temp_store = MEMORY;",
        )?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        debug!(path = %path.display(), "entry store opened");
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER PRIMARY KEY)",
            [],
        )?;
        let current: i32 = conn.query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )?;
        if current < 1 {
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS file_entry (
                    path TEXT PRIMARY KEY,
                    checksum TEXT NOT NULL,
                    size INTEGER NOT NULL,
                    permissions INTEGER NOT NULL,
                    uid INTEGER NOT NULL,
                    gid INTEGER NOT NULL,
                    user_name TEXT,
                    group_name TEXT,
                    mtime INTEGER NOT NULL,
                    inode INTEGER NOT NULL,
                    device INTEGER NOT NULL,
                    hashes TEXT NOT NULL DEFAULT '{}',
                    mode TEXT NOT NULL,
                    scanned INTEGER NOT NULL DEFAULT 0
                );
                CREATE INDEX IF NOT EXISTS idx_file_entry_checksum ON file_entry(checksum);
                CREATE INDEX IF NOT EXISTS idx_file_entry_inode ON file_entry(device, inode);",
            )?;
            conn.execute(
                "INSERT OR REPLACE INTO schema_version (version) VALUES (?1)",
                params![SCHEMA_VERSION],
            )?;
        }
        Ok(())
    }

    pub fn get(&self, path: &str) -> Result<Option<FileEntry>> {
        let conn = self.conn.lock();
        Ok(select_one(&conn, path)?)
    }

    /// Atomic check-then-update for one path. `current` is the live state
    /// (`None` when the path no longer exists).
    pub fn apply(&self, path: &str, current: Option<FileEntry>) -> Result<StoreOutcome> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let stored = select_one(&tx, path)?;
        let outcome = match (stored, current) {
            (None, Some(mut current)) => {
                current.scanned = true;
                write_entry(&tx, &current)?;
                StoreOutcome::Added(current)
            }
            (Some(previous), Some(mut current)) if previous.checksum != current.checksum => {
                current.scanned = true;
                write_entry(&tx, &current)?;
                StoreOutcome::Modified { previous, current }
            }
            (Some(mut previous), Some(_)) => {
                tx.execute(
                    "UPDATE file_entry SET scanned = 1 WHERE path = ?1",
                    params![path],
                )?;
                previous.scanned = true;
                StoreOutcome::Unchanged(previous)
            }
            (Some(previous), None) => {
                tx.execute("DELETE FROM file_entry WHERE path = ?1", params![path])?;
                StoreOutcome::Removed(previous)
            }
            (None, None) => StoreOutcome::Absent,
        };
        tx.commit()?;
        Ok(outcome)
    }

    /// Insert or replace an entry as-is.
    pub fn upsert(&self, entry: &FileEntry) -> Result<()> {
        let conn = self.conn.lock();
        write_entry(&conn, entry)
    }

    /// Stored paths strictly below the directory `prefix`.
    pub fn paths_under(&self, prefix: &str) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        let (low, high) = child_bounds(prefix);
        let mut stmt = conn.prepare(
            "SELECT path FROM file_entry WHERE path >= ?1 AND path < ?2 ORDER BY path",
        )?;
        let rows = stmt.query_map(params![low, high], |row| row.get::<_, String>(0))?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Every stored path sharing the given (device, inode).
    pub fn paths_from_inode(&self, device: u64, inode: u64) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT path FROM file_entry WHERE device = ?1 AND inode = ?2 ORDER BY path")?;
        let rows = stmt.query_map(params![device as i64, inode as i64], |row| {
            row.get::<_, String>(0)
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Start of a mark-and-sweep pass.
    pub fn set_all_unscanned(&self) -> Result<usize> {
        let conn = self.conn.lock();
        Ok(conn.execute("UPDATE file_entry SET scanned = 0", [])?)
    }

    /// End of a mark-and-sweep pass: remove and return every entry that was
    /// not marked scanned since [`EntryStore::set_all_unscanned`].
    pub fn sweep_not_scanned(&self) -> Result<Vec<FileEntry>> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let swept = {
            let sql = format!(
                "SELECT {ENTRY_COLUMNS} FROM file_entry WHERE scanned = 0 ORDER BY path"
            );
            let mut stmt = tx.prepare(&sql)?;
            let rows = stmt.query_map([], row_to_entry)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };
        tx.execute("DELETE FROM file_entry WHERE scanned = 0", [])?;
        tx.commit()?;
        Ok(swept)
    }

    pub fn count(&self) -> Result<usize> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM file_entry", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Entries inside `range`, in key order.
    pub fn range_entries(&self, range: &SyncRange) -> Result<Vec<FileEntry>> {
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT {ENTRY_COLUMNS} FROM file_entry
             WHERE checksum >= ?1 AND (?2 IS NULL OR checksum < ?2)
             ORDER BY checksum, path"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![range.start, range.end], row_to_entry)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Count, digest and bisection key of `range` in one read.
    pub fn range_summary(&self, range: &SyncRange) -> Result<RangeSummary> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT checksum FROM file_entry
             WHERE checksum >= ?1 AND (?2 IS NULL OR checksum < ?2)
             ORDER BY checksum, path",
        )?;
        let keys = stmt
            .query_map(params![range.start, range.end], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(RangeSummary {
            count: keys.len(),
            digest: digest_checksums(keys.iter().map(String::as_str)),
            split_key: keys.get(keys.len() / 2).cloned(),
        })
    }
}

fn select_one(conn: &Connection, path: &str) -> rusqlite::Result<Option<FileEntry>> {
    let sql = format!("SELECT {ENTRY_COLUMNS} FROM file_entry WHERE path = ?1");
    conn.query_row(&sql, params![path], row_to_entry).optional()
}

fn write_entry(conn: &Connection, entry: &FileEntry) -> Result<()> {
    let hashes = serde_json::to_string(&entry.attributes.hashes)?;
    let a = &entry.attributes;
    conn.execute(
        "INSERT OR REPLACE INTO file_entry
            (path, checksum, size, permissions, uid, gid, user_name, group_name,
             mtime, inode, device, hashes, mode, scanned)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
        params![
            entry.path,
            entry.checksum,
            a.size as i64,
            a.permissions,
            a.uid,
            a.gid,
            a.user_name,
            a.group_name,
            a.mtime,
            a.inode as i64,
            a.device as i64,
            hashes,
            entry.mode.as_str(),
            entry.scanned,
        ],
    )?;
    Ok(())
}

fn row_to_entry(row: &Row<'_>) -> rusqlite::Result<FileEntry> {
    let hashes: String = row.get(11)?;
    let mode: String = row.get(12)?;
    let attributes = FileAttributes {
        size: row.get::<_, i64>(2)? as u64,
        permissions: row.get(3)?,
        uid: row.get(4)?,
        gid: row.get(5)?,
        user_name: row.get(6)?,
        group_name: row.get(7)?,
        mtime: row.get(8)?,
        inode: row.get::<_, i64>(9)? as u64,
        device: row.get::<_, i64>(10)? as u64,
        hashes: serde_json::from_str(&hashes).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(11, rusqlite::types::Type::Text, Box::new(e))
        })?,
    };
    Ok(FileEntry {
        path: row.get(0)?,
        checksum: row.get(1)?,
        attributes,
        mode: DetectionMode::parse(&mode).unwrap_or(DetectionMode::Scheduled),
        scanned: row.get(13)?,
    })
}

/// Half-open string bounds enclosing every path below `prefix`.
fn child_bounds(prefix: &str) -> (String, String) {
    let sep = std::path::MAIN_SEPARATOR;
    let base = prefix.trim_end_matches(sep);
    // The character right after the separator closes the interval.
    let next = char::from_u32(sep as u32 + 1).unwrap_or(sep);
    (format!("{base}{sep}"), format!("{base}{next}"))
}
