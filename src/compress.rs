//! # Compression
//!
//! Thin layer over Zstandard used by the content store. Blobs are written
//! either compressed or raw depending on the project's `compression_enabled`
//! setting at the time of the write, so `decompress` is format-agnostic: it
//! probes for the zstd frame magic and passes raw input through unchanged.

use crate::error::Result;
use std::io::{Read, Write};

/// Zstandard frame magic number (little-endian on the wire).
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xB5, 0x2F, 0xFD];

/// Compresses data using Zstandard at the specified level (1–22).
///
/// Level 3 provides a good balance; levels 19+ trade significant CPU time
/// for marginal ratio improvements.
pub fn compress(data: &[u8], level: i32) -> Result<Vec<u8>> {
    let mut encoder = zstd::Encoder::new(Vec::new(), level)?;
    encoder.write_all(data)?;
    let compressed = encoder.finish()?;
    Ok(compressed)
}

/// Decompresses a blob read back from the store.
///
/// Blobs written while compression was disabled are stored raw; those are
/// detected by the absent frame magic and returned unchanged.
pub fn decompress(data: &[u8]) -> Result<Vec<u8>> {
    if !is_compressed(data) {
        return Ok(data.to_vec());
    }
    let mut decoder = zstd::Decoder::new(data)?;
    let mut decompressed = Vec::new();
    decoder.read_to_end(&mut decompressed)?;
    Ok(decompressed)
}

/// Whether the blob starts with a zstd frame.
pub fn is_compressed(data: &[u8]) -> bool {
    data.len() >= 4 && data[..4] == ZSTD_MAGIC
}

/// Estimates the compression ratio for display purposes.
pub fn ratio(original_size: u64, compressed_size: u64) -> f64 {
    if original_size == 0 {
        return 1.0;
    }
    compressed_size as f64 / original_size as f64
}
