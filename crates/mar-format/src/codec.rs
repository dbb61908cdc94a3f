//! Per-chunk decompression.
//!
//! Chunks are compressed independently; the method is recorded per chunk so
//! a single file can mix zstd, LZ4 and passthrough runs. Passthrough chunks
//! are normally served straight from the data shard without touching this
//! module; `decompress_chunk` still accepts them for completeness.

use crate::proto::{ChunkInfo, CompressedMethod};
use crate::{FormatError, Result};

/// Decompress one chunk payload to exactly `original_length` bytes.
pub fn decompress_chunk(chunk: &ChunkInfo, compressed: &[u8]) -> Result<Vec<u8>> {
    let decoded = match chunk.compressed_method() {
        CompressedMethod::Passthrough => compressed.to_vec(),
        CompressedMethod::Zstandard => zstd::decode_all(compressed)?,
        CompressedMethod::Lz4 => {
            lz4::block::decompress(compressed, Some(chunk.original_length as i32))?
        }
    };

    if decoded.len() != chunk.original_length as usize {
        return Err(FormatError::ChunkLength {
            expected: chunk.original_length,
            actual: decoded.len(),
        });
    }
    Ok(decoded)
}
