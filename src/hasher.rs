//! # Content Hashing
//!
//! SHA-256 content hashes (lowercase hex) are the keys into the blob store:
//! two files with identical content produce the same hash and are stored
//! only once. The snapshot hash is derived from the sorted set of
//! (path, content-hash) pairs, so it is invariant under scan order and can
//! be recomputed from disk content alone.

use crate::error::Result;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::Read;
use std::path::Path;

/// Size of the read buffer for streaming hash computation (64 KiB).
///
/// Chosen to balance syscall overhead against memory usage. Larger buffers
/// provide diminishing returns on modern kernels with readahead.
const BUF_SIZE: usize = 64 * 1024;

/// Computes the SHA-256 hash of a file's contents, returning a hex string.
///
/// Uses streaming reads to handle arbitrarily large files without loading
/// the entire contents into memory.
pub fn hash_file(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; BUF_SIZE];

    loop {
        let bytes_read = file.read(&mut buf)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buf[..bytes_read]);
    }

    Ok(hex_digest(hasher))
}

/// Computes the SHA-256 hash of in-memory data.
pub fn hash_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex_digest(hasher)
}

/// Computes the deterministic snapshot hash from (path, content-hash) pairs.
///
/// Pairs are sorted by path before hashing, so the result does not depend
/// on the order files were scanned in.
pub fn snapshot_hash<'a, I>(entries: I) -> String
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut pairs: Vec<(&str, &str)> = entries.into_iter().collect();
    pairs.sort_by(|a, b| a.0.cmp(b.0));

    let mut hasher = Sha256::new();
    for (path, hash) in pairs {
        hasher.update(path.as_bytes());
        hasher.update(hash.as_bytes());
    }
    hex_digest(hasher)
}

/// Returns the first `n` characters of a hash for display purposes.
pub fn short_hash(hash: &str, n: usize) -> &str {
    &hash[..n.min(hash.len())]
}

fn hex_digest(hasher: Sha256) -> String {
    let digest = hasher.finalize();
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn hash_file_matches_hash_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.txt");
        let mut f = File::create(&path).unwrap();
        f.write_all(b"hello world").unwrap();
        drop(f);

        assert_eq!(hash_file(&path).unwrap(), hash_bytes(b"hello world"));
    }

    #[test]
    fn hash_bytes_known_vector() {
        // sha256("hello")
        assert_eq!(
            hash_bytes(b"hello"),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn hash_bytes_different_inputs() {
        assert_ne!(hash_bytes(b"data A"), hash_bytes(b"data B"));
    }

    #[test]
    fn snapshot_hash_order_invariant() {
        let a = snapshot_hash(vec![("a.txt", "h1"), ("b.txt", "h2")]);
        let b = snapshot_hash(vec![("b.txt", "h2"), ("a.txt", "h1")]);
        assert_eq!(a, b);
    }

    #[test]
    fn snapshot_hash_sensitive_to_content() {
        let a = snapshot_hash(vec![("a.txt", "h1")]);
        let b = snapshot_hash(vec![("a.txt", "h2")]);
        assert_ne!(a, b);
    }

    #[test]
    fn short_hash_truncates() {
        let hash = "abcdefghij";
        assert_eq!(short_hash(hash, 4), "abcd");
        assert_eq!(short_hash(hash, 100), hash);
    }
}
