//! # Metadata Store
//!
//! Durable keyed storage for snapshots, per-snapshot file entries, content
//! blobs, and autosave state, backed by a single SQLite database.
//!
//! ## Schema
//!
//! ```text
//! .gencodedoc/
//! └── gencodedoc.db
//!     ├── snapshots       (id, hash UNIQUE, message, tag UNIQUE, created_at,
//!     │                    parent_id, is_autosave, trigger_type, files_count,
//!     │                    total_size, compressed_size)
//!     ├── snapshot_files  (snapshot_id, path, content_hash, size, mode)
//!     ├── file_contents   (hash PK, content, original_size, compressed_size,
//!     │                    created_at)
//!     └── autosave_state  (singleton row)
//! ```
//!
//! A snapshot owns its `snapshot_files` rows; content blobs are shared by
//! every file entry referencing the same hash and are only removed by the
//! explicit orphan cleanup. All multi-row mutations run inside a transaction
//! behind a single writer lock.

use crate::error::{EngineError, Result};
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Mutex;

/// A file as it appears in one snapshot. Immutable once recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    /// Project-relative path with forward slashes.
    pub path: String,

    /// SHA-256 content hash — the key into the blob store.
    pub hash: String,

    /// Original (uncompressed) file size in bytes.
    pub size: u64,

    /// Unix file mode bits.
    pub mode: u32,
}

/// Metadata for one snapshot, as stored in the `snapshots` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    /// Monotonically increasing id, assigned on create.
    pub id: i64,

    /// Deterministic hash over the sorted (path, content-hash) pairs.
    pub hash: String,

    /// Optional human message.
    pub message: Option<String>,

    /// Optional tag, globally unique among snapshots.
    pub tag: Option<String>,

    /// When the snapshot was created.
    pub created_at: DateTime<Utc>,

    /// The latest snapshot at creation time, if any.
    pub parent_id: Option<i64>,

    /// Whether this snapshot was cut by the autosave loop.
    pub is_autosave: bool,

    /// What caused the snapshot ("manual", "timer", "diff_threshold", ...).
    pub trigger_type: String,

    /// Number of files recorded.
    pub files_count: u64,

    /// Sum of uncompressed file sizes.
    pub total_size: u64,

    /// Storage cost of blobs first persisted by this creation.
    pub compressed_size: u64,
}

/// A snapshot with its ordered file entries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(flatten)]
    pub meta: SnapshotMetadata,
    pub files: Vec<FileEntry>,
}

/// Singleton autosave bookkeeping row, created lazily on first use.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AutosaveState {
    pub last_check: Option<DateTime<Utc>>,
    pub last_save: Option<DateTime<Utc>>,
    pub last_snapshot_id: Option<i64>,
    pub files_tracked: u64,
}

/// The metadata database. One logical writer at a time; every mutation
/// touching more than one row goes through [`MetadataDB::with_tx`].
pub struct MetadataDB {
    conn: Mutex<Connection>,
}

impl MetadataDB {
    /// Opens (or creates) the database at `path` and ensures the schema.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    /// In-memory database for tests.
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS snapshots (
                 id              INTEGER PRIMARY KEY AUTOINCREMENT,
                 hash            TEXT NOT NULL UNIQUE,
                 message         TEXT,
                 tag             TEXT UNIQUE,
                 created_at      TEXT NOT NULL,
                 parent_id       INTEGER REFERENCES snapshots(id) ON DELETE SET NULL,
                 is_autosave     INTEGER NOT NULL DEFAULT 0,
                 trigger_type    TEXT NOT NULL DEFAULT 'manual',
                 files_count     INTEGER NOT NULL DEFAULT 0,
                 total_size      INTEGER NOT NULL DEFAULT 0,
                 compressed_size INTEGER NOT NULL DEFAULT 0
             );
             CREATE TABLE IF NOT EXISTS snapshot_files (
                 snapshot_id  INTEGER NOT NULL REFERENCES snapshots(id) ON DELETE CASCADE,
                 path         TEXT NOT NULL,
                 content_hash TEXT NOT NULL,
                 size         INTEGER NOT NULL,
                 mode         INTEGER NOT NULL,
                 UNIQUE (snapshot_id, path)
             );
             CREATE TABLE IF NOT EXISTS file_contents (
                 hash            TEXT PRIMARY KEY,
                 content         BLOB NOT NULL,
                 original_size   INTEGER NOT NULL,
                 compressed_size INTEGER NOT NULL,
                 created_at      TEXT NOT NULL
             );
             CREATE TABLE IF NOT EXISTS autosave_state (
                 id               INTEGER PRIMARY KEY CHECK (id = 1),
                 last_check       TEXT,
                 last_save        TEXT,
                 last_snapshot_id INTEGER,
                 files_tracked    INTEGER NOT NULL DEFAULT 0
             );
             CREATE INDEX IF NOT EXISTS idx_snapshots_created_at
                 ON snapshots (created_at DESC);
             CREATE INDEX IF NOT EXISTS idx_snapshots_tag
                 ON snapshots (tag);
             CREATE INDEX IF NOT EXISTS idx_snapshot_files_content_hash
                 ON snapshot_files (content_hash);",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Runs `f` inside a transaction, committing on `Ok` and rolling back on
    /// any error. This is the snapshot-create atomicity boundary.
    pub fn with_tx<T>(&self, f: impl FnOnce(&Transaction) -> Result<T>) -> Result<T> {
        let mut conn = self.conn.lock().expect("metadata db lock poisoned");
        let tx = conn.transaction()?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }

    // ─── Snapshot rows ──────────────────────────────────────────────────────

    /// Inserts a snapshot row and returns its assigned id.
    ///
    /// Callers are expected to have checked hash/tag uniqueness inside the
    /// same transaction; constraint violations are still mapped onto the
    /// distinguished error kinds as a backstop.
    pub fn insert_snapshot(
        tx: &Transaction,
        hash: &str,
        message: Option<&str>,
        tag: Option<&str>,
        parent_id: Option<i64>,
        is_autosave: bool,
        trigger_type: &str,
    ) -> Result<i64> {
        let created_at = Utc::now();
        tx.execute(
            "INSERT INTO snapshots (hash, message, tag, created_at, parent_id, is_autosave, trigger_type)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![hash, message, tag, created_at, parent_id, is_autosave, trigger_type],
        )
        .map_err(|e| {
            if let rusqlite::Error::SqliteFailure(f, Some(msg)) = &e {
                if f.code == rusqlite::ErrorCode::ConstraintViolation {
                    if msg.contains("snapshots.hash") {
                        return EngineError::NoChanges;
                    }
                    if msg.contains("snapshots.tag") {
                        if let Some(t) = tag {
                            return EngineError::DuplicateTag(t.to_string());
                        }
                    }
                }
            }
            EngineError::Storage(e)
        })?;
        Ok(tx.last_insert_rowid())
    }

    /// Updates the aggregate columns after all file entries were recorded.
    pub fn finalize_snapshot(
        tx: &Transaction,
        id: i64,
        files_count: u64,
        total_size: u64,
        compressed_size: u64,
    ) -> Result<()> {
        tx.execute(
            "UPDATE snapshots SET files_count = ?2, total_size = ?3, compressed_size = ?4
             WHERE id = ?1",
            params![id, files_count, total_size, compressed_size],
        )?;
        Ok(())
    }

    pub fn snapshot_hash_exists(tx: &Transaction, hash: &str) -> Result<bool> {
        let found: Option<i64> = tx
            .query_row("SELECT id FROM snapshots WHERE hash = ?1", [hash], |r| {
                r.get(0)
            })
            .optional()?;
        Ok(found.is_some())
    }

    pub fn tag_exists(tx: &Transaction, tag: &str) -> Result<bool> {
        let found: Option<i64> = tx
            .query_row("SELECT id FROM snapshots WHERE tag = ?1", [tag], |r| {
                r.get(0)
            })
            .optional()?;
        Ok(found.is_some())
    }

    /// Id of the most recent snapshot, used as parent for the next one.
    pub fn latest_snapshot_id(tx: &Transaction) -> Result<Option<i64>> {
        let id: Option<i64> = tx
            .query_row(
                "SELECT id FROM snapshots ORDER BY created_at DESC, id DESC LIMIT 1",
                [],
                |r| r.get(0),
            )
            .optional()?;
        Ok(id)
    }

    pub fn get_snapshot(&self, id: i64) -> Result<Option<SnapshotMetadata>> {
        let conn = self.conn.lock().expect("metadata db lock poisoned");
        let meta = conn
            .query_row(
                &format!("SELECT {META_COLS} FROM snapshots WHERE id = ?1"),
                [id],
                meta_from_row,
            )
            .optional()?;
        Ok(meta)
    }

    pub fn get_snapshot_by_tag(&self, tag: &str) -> Result<Option<SnapshotMetadata>> {
        let conn = self.conn.lock().expect("metadata db lock poisoned");
        let meta = conn
            .query_row(
                &format!("SELECT {META_COLS} FROM snapshots WHERE tag = ?1"),
                [tag],
                meta_from_row,
            )
            .optional()?;
        Ok(meta)
    }

    /// Lists snapshots newest-first, optionally filtering out autosaves.
    pub fn list_snapshots(
        &self,
        limit: Option<usize>,
        include_autosave: bool,
    ) -> Result<Vec<SnapshotMetadata>> {
        let conn = self.conn.lock().expect("metadata db lock poisoned");
        let sql = format!(
            "SELECT {META_COLS} FROM snapshots
             WHERE (?1 OR is_autosave = 0)
             ORDER BY created_at DESC, id DESC
             LIMIT ?2"
        );
        let limit = limit.map(|n| n as i64).unwrap_or(-1);
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![include_autosave, limit], meta_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// All snapshot metadata in ascending id order (for file history walks).
    pub fn all_snapshots_ascending(&self) -> Result<Vec<SnapshotMetadata>> {
        let conn = self.conn.lock().expect("metadata db lock poisoned");
        let mut stmt =
            conn.prepare(&format!("SELECT {META_COLS} FROM snapshots ORDER BY id ASC"))?;
        let rows = stmt.query_map([], meta_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Deletes a snapshot and its file links atomically. Returns whether a
    /// row was actually removed. Content blobs are left for the orphan sweep.
    pub fn delete_snapshot(&self, id: i64) -> Result<bool> {
        self.with_tx(|tx| {
            tx.execute("DELETE FROM snapshot_files WHERE snapshot_id = ?1", [id])?;
            let n = tx.execute("DELETE FROM snapshots WHERE id = ?1", [id])?;
            Ok(n > 0)
        })
    }

    // ─── File links ─────────────────────────────────────────────────────────

    pub fn add_file(tx: &Transaction, snapshot_id: i64, entry: &FileEntry) -> Result<()> {
        tx.execute(
            "INSERT INTO snapshot_files (snapshot_id, path, content_hash, size, mode)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![snapshot_id, entry.path, entry.hash, entry.size, entry.mode],
        )?;
        Ok(())
    }

    /// Lists a snapshot's file entries ordered by path.
    pub fn snapshot_files(&self, snapshot_id: i64) -> Result<Vec<FileEntry>> {
        let conn = self.conn.lock().expect("metadata db lock poisoned");
        let mut stmt = conn.prepare(
            "SELECT path, content_hash, size, mode FROM snapshot_files
             WHERE snapshot_id = ?1 ORDER BY path ASC",
        )?;
        let rows = stmt.query_map([snapshot_id], |r| {
            Ok(FileEntry {
                path: r.get(0)?,
                hash: r.get(1)?,
                size: r.get::<_, i64>(2)? as u64,
                mode: r.get::<_, i64>(3)? as u32,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    // ─── Content blobs ──────────────────────────────────────────────────────

    /// Inserts a content blob, returning false when the hash was already
    /// present (INSERT OR IGNORE semantics).
    pub fn insert_content(
        tx: &Transaction,
        hash: &str,
        content: &[u8],
        original_size: u64,
        stored_size: u64,
    ) -> Result<bool> {
        let n = tx.execute(
            "INSERT OR IGNORE INTO file_contents (hash, content, original_size, compressed_size, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![hash, content, original_size, stored_size, Utc::now()],
        )?;
        Ok(n > 0)
    }

    pub fn content_exists_tx(tx: &Transaction, hash: &str) -> Result<bool> {
        let found: Option<String> = tx
            .query_row(
                "SELECT hash FROM file_contents WHERE hash = ?1",
                [hash],
                |r| r.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn content_exists(&self, hash: &str) -> Result<bool> {
        let conn = self.conn.lock().expect("metadata db lock poisoned");
        let found: Option<String> = conn
            .query_row(
                "SELECT hash FROM file_contents WHERE hash = ?1",
                [hash],
                |r| r.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Reads a blob's stored bytes (still compressed when written that way).
    pub fn read_content(&self, hash: &str) -> Result<Option<Vec<u8>>> {
        let conn = self.conn.lock().expect("metadata db lock poisoned");
        let content = conn
            .query_row(
                "SELECT content FROM file_contents WHERE hash = ?1",
                [hash],
                |r| r.get::<_, Vec<u8>>(0),
            )
            .optional()?;
        Ok(content)
    }

    /// (distinct blob count, total stored bytes) for status reporting.
    pub fn content_stats(&self) -> Result<(u64, u64)> {
        let conn = self.conn.lock().expect("metadata db lock poisoned");
        let (count, stored): (i64, Option<i64>) = conn.query_row(
            "SELECT COUNT(*), SUM(compressed_size) FROM file_contents",
            [],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )?;
        Ok((count as u64, stored.unwrap_or(0) as u64))
    }

    /// (manual count, autosave count) for status reporting.
    pub fn snapshot_counts(&self) -> Result<(u64, u64)> {
        let conn = self.conn.lock().expect("metadata db lock poisoned");
        let (manual, auto): (i64, i64) = conn.query_row(
            "SELECT SUM(is_autosave = 0), SUM(is_autosave = 1) FROM snapshots",
            [],
            |r| {
                Ok((
                    r.get::<_, Option<i64>>(0)?.unwrap_or(0),
                    r.get::<_, Option<i64>>(1)?.unwrap_or(0),
                ))
            },
        )?;
        Ok((manual as u64, auto as u64))
    }

    // ─── Autosave state ─────────────────────────────────────────────────────

    pub fn autosave_state(&self) -> Result<AutosaveState> {
        let conn = self.conn.lock().expect("metadata db lock poisoned");
        let state = conn
            .query_row(
                "SELECT last_check, last_save, last_snapshot_id, files_tracked
                 FROM autosave_state WHERE id = 1",
                [],
                |r| {
                    Ok(AutosaveState {
                        last_check: r.get(0)?,
                        last_save: r.get(1)?,
                        last_snapshot_id: r.get(2)?,
                        files_tracked: r.get::<_, i64>(3)? as u64,
                    })
                },
            )
            .optional()?;
        Ok(state.unwrap_or_default())
    }

    /// Upserts the singleton autosave row.
    pub fn update_autosave_state(&self, state: &AutosaveState) -> Result<()> {
        let conn = self.conn.lock().expect("metadata db lock poisoned");
        conn.execute(
            "INSERT INTO autosave_state (id, last_check, last_save, last_snapshot_id, files_tracked)
             VALUES (1, ?1, ?2, ?3, ?4)
             ON CONFLICT (id) DO UPDATE SET
                 last_check = excluded.last_check,
                 last_save = excluded.last_save,
                 last_snapshot_id = excluded.last_snapshot_id,
                 files_tracked = excluded.files_tracked",
            params![
                state.last_check,
                state.last_save,
                state.last_snapshot_id,
                state.files_tracked as i64
            ],
        )?;
        Ok(())
    }

    // ─── Retention & garbage collection ─────────────────────────────────────

    /// Deletes autosave snapshots beyond the newest `max_keep`. Manual
    /// snapshots are never touched. Returns the number deleted.
    pub fn cleanup_old_autosaves(&self, max_keep: usize) -> Result<usize> {
        self.with_tx(|tx| {
            let ids = collect_ids(
                tx,
                "SELECT id FROM snapshots WHERE is_autosave = 1
                 AND id NOT IN (
                     SELECT id FROM snapshots WHERE is_autosave = 1
                     ORDER BY created_at DESC, id DESC LIMIT ?1
                 )",
                params![max_keep as i64],
            )?;
            delete_snapshot_rows(tx, &ids)?;
            Ok(ids.len())
        })
    }

    /// Deletes autosave snapshots older than `days` days.
    pub fn cleanup_expired_autosaves(&self, days: u32) -> Result<usize> {
        let cutoff = Utc::now() - Duration::days(i64::from(days));
        self.with_tx(|tx| {
            let ids = collect_ids(
                tx,
                "SELECT id FROM snapshots WHERE is_autosave = 1 AND created_at < ?1",
                params![cutoff],
            )?;
            delete_snapshot_rows(tx, &ids)?;
            Ok(ids.len())
        })
    }

    /// Deletes content blobs no longer referenced by any snapshot file.
    pub fn cleanup_orphaned_contents(&self) -> Result<usize> {
        self.with_tx(|tx| {
            let n = tx.execute(
                "DELETE FROM file_contents WHERE hash NOT IN (
                     SELECT DISTINCT content_hash FROM snapshot_files
                 )",
                [],
            )?;
            Ok(n)
        })
    }
}

/// Column list shared by every snapshot-metadata query.
const META_COLS: &str = "id, hash, message, tag, created_at, parent_id, \
                         is_autosave, trigger_type, files_count, total_size, compressed_size";

fn meta_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SnapshotMetadata> {
    Ok(SnapshotMetadata {
        id: row.get(0)?,
        hash: row.get(1)?,
        message: row.get(2)?,
        tag: row.get(3)?,
        created_at: row.get(4)?,
        parent_id: row.get(5)?,
        is_autosave: row.get(6)?,
        trigger_type: row.get(7)?,
        files_count: row.get::<_, i64>(8)? as u64,
        total_size: row.get::<_, i64>(9)? as u64,
        compressed_size: row.get::<_, i64>(10)? as u64,
    })
}

fn collect_ids(
    tx: &Transaction,
    sql: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<i64>> {
    let mut stmt = tx.prepare(sql)?;
    let rows = stmt.query_map(params, |r| r.get::<_, i64>(0))?;
    let mut ids = Vec::new();
    for row in rows {
        ids.push(row?);
    }
    Ok(ids)
}

fn delete_snapshot_rows(tx: &Transaction, ids: &[i64]) -> Result<()> {
    for id in ids {
        tx.execute("DELETE FROM snapshot_files WHERE snapshot_id = ?1", [id])?;
        tx.execute("DELETE FROM snapshots WHERE id = ?1", [id])?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(path: &str, hash: &str) -> FileEntry {
        FileEntry {
            path: path.to_string(),
            hash: hash.to_string(),
            size: 5,
            mode: 0o644,
        }
    }

    fn create_snapshot(db: &MetadataDB, hash: &str, tag: Option<&str>, autosave: bool) -> i64 {
        db.with_tx(|tx| {
            let id = MetadataDB::insert_snapshot(
                tx,
                hash,
                None,
                tag,
                None,
                autosave,
                if autosave { "timer" } else { "manual" },
            )?;
            MetadataDB::add_file(tx, id, &entry("a.txt", "h-a"))?;
            MetadataDB::insert_content(tx, "h-a", b"hello", 5, 5)?;
            MetadataDB::finalize_snapshot(tx, id, 1, 5, 5)?;
            Ok(id)
        })
        .unwrap()
    }

    #[test]
    fn ids_are_monotonic() {
        let db = MetadataDB::open_in_memory().unwrap();
        let a = create_snapshot(&db, "s1", None, false);
        let b = create_snapshot(&db, "s2", None, false);
        assert!(b > a);
    }

    #[test]
    fn duplicate_hash_is_no_changes() {
        let db = MetadataDB::open_in_memory().unwrap();
        create_snapshot(&db, "same", None, false);
        let err = db
            .with_tx(|tx| MetadataDB::insert_snapshot(tx, "same", None, None, None, false, "manual"))
            .unwrap_err();
        assert!(matches!(err, EngineError::NoChanges));
    }

    #[test]
    fn duplicate_tag_is_distinguished() {
        let db = MetadataDB::open_in_memory().unwrap();
        create_snapshot(&db, "s1", Some("v1"), false);
        let err = db
            .with_tx(|tx| {
                MetadataDB::insert_snapshot(tx, "s2", None, Some("v1"), None, false, "manual")
            })
            .unwrap_err();
        assert!(matches!(err, EngineError::DuplicateTag(t) if t == "v1"));
    }

    #[test]
    fn rollback_on_error_leaves_no_rows() {
        let db = MetadataDB::open_in_memory().unwrap();
        let res: Result<()> = db.with_tx(|tx| {
            MetadataDB::insert_snapshot(tx, "s1", None, None, None, false, "manual")?;
            Err(EngineError::Invalid("forced".into()))
        });
        assert!(res.is_err());
        assert!(db.get_snapshot(1).unwrap().is_none());
    }

    #[test]
    fn content_insert_is_idempotent() {
        let db = MetadataDB::open_in_memory().unwrap();
        db.with_tx(|tx| {
            assert!(MetadataDB::insert_content(tx, "h", b"x", 1, 1)?);
            assert!(!MetadataDB::insert_content(tx, "h", b"x", 1, 1)?);
            Ok(())
        })
        .unwrap();
        assert!(db.content_exists("h").unwrap());
        assert_eq!(db.content_stats().unwrap().0, 1);
    }

    #[test]
    fn list_filters_autosaves_and_limits() {
        let db = MetadataDB::open_in_memory().unwrap();
        create_snapshot(&db, "s1", None, false);
        create_snapshot(&db, "s2", None, true);
        create_snapshot(&db, "s3", None, true);

        assert_eq!(db.list_snapshots(None, true).unwrap().len(), 3);
        assert_eq!(db.list_snapshots(None, false).unwrap().len(), 1);
        assert_eq!(db.list_snapshots(Some(2), true).unwrap().len(), 2);
        // newest first
        let all = db.list_snapshots(None, true).unwrap();
        assert!(all[0].id > all[1].id);
    }

    #[test]
    fn delete_removes_file_links() {
        let db = MetadataDB::open_in_memory().unwrap();
        let id = create_snapshot(&db, "s1", None, false);
        assert!(db.delete_snapshot(id).unwrap());
        assert!(!db.delete_snapshot(id).unwrap());
        assert!(db.snapshot_files(id).unwrap().is_empty());
    }

    #[test]
    fn retention_keeps_newest_and_spares_manual() {
        let db = MetadataDB::open_in_memory().unwrap();
        create_snapshot(&db, "m1", None, false);
        let ids: Vec<i64> = (0..4)
            .map(|i| create_snapshot(&db, &format!("a{i}"), None, true))
            .collect();

        let deleted = db.cleanup_old_autosaves(2).unwrap();
        assert_eq!(deleted, 2);
        let (manual, auto) = db.snapshot_counts().unwrap();
        assert_eq!(manual, 1);
        assert_eq!(auto, 2);
        // the two newest autosaves survive
        assert!(db.get_snapshot(ids[3]).unwrap().is_some());
        assert!(db.get_snapshot(ids[2]).unwrap().is_some());
    }

    #[test]
    fn orphan_sweep_counts_unreferenced_blobs() {
        let db = MetadataDB::open_in_memory().unwrap();
        let id = create_snapshot(&db, "s1", None, false);
        db.with_tx(|tx| {
            MetadataDB::insert_content(tx, "orphan", b"x", 1, 1)?;
            Ok(())
        })
        .unwrap();

        assert_eq!(db.cleanup_orphaned_contents().unwrap(), 1);
        assert!(db.content_exists("h-a").unwrap());

        db.delete_snapshot(id).unwrap();
        assert_eq!(db.cleanup_orphaned_contents().unwrap(), 1);
    }

    #[test]
    fn autosave_state_upserts() {
        let db = MetadataDB::open_in_memory().unwrap();
        assert!(db.autosave_state().unwrap().last_save.is_none());

        let state = AutosaveState {
            last_check: Some(Utc::now()),
            last_save: Some(Utc::now()),
            last_snapshot_id: Some(7),
            files_tracked: 42,
        };
        db.update_autosave_state(&state).unwrap();
        let read = db.autosave_state().unwrap();
        assert_eq!(read.last_snapshot_id, Some(7));
        assert_eq!(read.files_tracked, 42);
    }
}
