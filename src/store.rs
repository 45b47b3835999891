//! # Content Store
//!
//! Bridges files on disk and the metadata database: content is hashed by the
//! scanner, deduplicated against `file_contents`, compressed on write when
//! the project enables it, and decompressed transparently on read. Restores
//! write decompressed bytes back to a target path and reapply mode bits.

use crate::compress;
use crate::db::MetadataDB;
use crate::error::{EngineError, Result};
use rusqlite::Transaction;
use std::path::Path;
use std::sync::Arc;

/// Read/write access to content blobs, with the project's compression policy.
pub struct ContentStore {
    db: Arc<MetadataDB>,
    compression_enabled: bool,
    compression_level: i32,
}

impl ContentStore {
    pub fn new(db: Arc<MetadataDB>, compression_enabled: bool, compression_level: i32) -> Self {
        Self {
            db,
            compression_enabled,
            compression_level,
        }
    }

    /// Persists the content of `abs_path` under `expected_hash` within the
    /// caller's snapshot transaction.
    ///
    /// Returns `(original_size, stored_size)` for this call's accounting:
    /// `(0, 0)` when the blob was already present, so a snapshot's
    /// `compressed_size` only reflects blobs it persisted first.
    pub fn ingest(
        &self,
        tx: &Transaction,
        abs_path: &Path,
        expected_hash: &str,
    ) -> Result<(u64, u64)> {
        if MetadataDB::content_exists_tx(tx, expected_hash)? {
            return Ok((0, 0));
        }

        let raw = std::fs::read(abs_path)?;
        let original_size = raw.len() as u64;

        let stored = if self.compression_enabled {
            compress::compress(&raw, self.compression_level)?
        } else {
            raw
        };
        let stored_size = stored.len() as u64;

        MetadataDB::insert_content(tx, expected_hash, &stored, original_size, stored_size)?;
        Ok((original_size, stored_size))
    }

    /// Reads and decompresses a blob. `None` when the hash is unknown.
    pub fn content_bytes(&self, hash: &str) -> Result<Option<Vec<u8>>> {
        match self.db.read_content(hash)? {
            Some(stored) => Ok(Some(compress::decompress(&stored)?)),
            None => Ok(None),
        }
    }

    /// Reads a blob as UTF-8 text. `None` for unknown hashes and for content
    /// that is not valid text.
    pub fn content_text(&self, hash: &str) -> Result<Option<String>> {
        match self.content_bytes(hash)? {
            Some(bytes) => Ok(String::from_utf8(bytes).ok()),
            None => Ok(None),
        }
    }

    /// Writes a blob's decompressed bytes to `target`, creating parent
    /// directories and applying mode bits.
    ///
    /// Returns false when the target exists and `force` is not set (the file
    /// is skipped, not an error: restores report skips per file).
    pub fn restore_file(&self, hash: &str, target: &Path, mode: u32, force: bool) -> Result<bool> {
        if target.exists() && !force {
            return Ok(false);
        }

        let bytes = self
            .content_bytes(hash)?
            .ok_or_else(|| EngineError::ContentMissing {
                hash: hash.to_string(),
            })?;

        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(target, &bytes)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(mode);
            let _ = std::fs::set_permissions(target, perms);
        }
        #[cfg(not(unix))]
        let _ = mode;

        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hasher;
    use std::io::Write;

    fn store(compression: bool) -> ContentStore {
        let db = Arc::new(MetadataDB::open_in_memory().unwrap());
        ContentStore::new(db, compression, 3)
    }

    fn write_file(dir: &Path, name: &str, content: &[u8]) -> std::path::PathBuf {
        let path = dir.join(name);
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(content).unwrap();
        path
    }

    #[test]
    fn ingest_then_read_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(true);
        let path = write_file(dir.path(), "a.txt", b"hello content store");
        let hash = hasher::hash_file(&path).unwrap();

        let (orig, stored) = store
            .db
            .clone()
            .with_tx(|tx| store.ingest(tx, &path, &hash))
            .unwrap();
        assert_eq!(orig, 19);
        assert!(stored > 0);

        assert_eq!(
            store.content_bytes(&hash).unwrap().unwrap(),
            b"hello content store"
        );
        assert_eq!(
            store.content_text(&hash).unwrap().unwrap(),
            "hello content store"
        );
    }

    #[test]
    fn second_ingest_reports_zero() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(true);
        let path = write_file(dir.path(), "a.txt", b"dup");
        let hash = hasher::hash_file(&path).unwrap();

        store
            .db
            .clone()
            .with_tx(|tx| store.ingest(tx, &path, &hash))
            .unwrap();
        let (orig, stored) = store
            .db
            .clone()
            .with_tx(|tx| store.ingest(tx, &path, &hash))
            .unwrap();
        assert_eq!((orig, stored), (0, 0));
    }

    #[test]
    fn uncompressed_write_still_reads_back() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(false);
        let path = write_file(dir.path(), "raw.txt", b"stored raw");
        let hash = hasher::hash_file(&path).unwrap();

        store
            .db
            .clone()
            .with_tx(|tx| store.ingest(tx, &path, &hash))
            .unwrap();
        // decompress falls through for raw blobs
        assert_eq!(store.content_bytes(&hash).unwrap().unwrap(), b"stored raw");
    }

    #[test]
    fn binary_content_is_not_text() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(true);
        let path = write_file(dir.path(), "bin", &[0xff, 0xfe, 0x00, 0x01]);
        let hash = hasher::hash_file(&path).unwrap();

        store
            .db
            .clone()
            .with_tx(|tx| store.ingest(tx, &path, &hash))
            .unwrap();
        assert!(store.content_text(&hash).unwrap().is_none());
        assert!(store.content_bytes(&hash).unwrap().is_some());
    }

    #[test]
    fn restore_skips_existing_without_force() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(true);
        let path = write_file(dir.path(), "a.txt", b"v1");
        let hash = hasher::hash_file(&path).unwrap();
        store
            .db
            .clone()
            .with_tx(|tx| store.ingest(tx, &path, &hash))
            .unwrap();

        let target = dir.path().join("out/a.txt");
        assert!(store.restore_file(&hash, &target, 0o644, false).unwrap());
        assert_eq!(std::fs::read(&target).unwrap(), b"v1");

        std::fs::write(&target, b"local edit").unwrap();
        assert!(!store.restore_file(&hash, &target, 0o644, false).unwrap());
        assert_eq!(std::fs::read(&target).unwrap(), b"local edit");

        assert!(store.restore_file(&hash, &target, 0o644, true).unwrap());
        assert_eq!(std::fs::read(&target).unwrap(), b"v1");
    }

    #[test]
    fn restore_missing_blob_errors() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(true);
        let err = store
            .restore_file("nope", &dir.path().join("x"), 0o644, true)
            .unwrap_err();
        assert!(matches!(err, EngineError::ContentMissing { .. }));
    }
}
