//! Size-weighted cache of decompressed payloads.
//!
//! Values are immutable `Arc<Vec<u8>>` buffers shared with readers; the
//! cache never hands out anything mutable. Two concurrent misses on the same
//! key may both decode; the later insert overwrites an identical value, so
//! no single-flight guard is needed for correctness.

use std::path::PathBuf;
use std::sync::Arc;

use moka::sync::Cache;

/// Total decompressed-byte capacity.
pub const CHUNK_CACHE_CAPACITY: u64 = 4 * 1024 * 1024 * 1024;

/// Cache key.
///
/// MAR chunks use `(shard path, chunk offset in shard, chunk index)`; whole
/// ZIP payloads use `(archive path, data offset, compressed size)`.
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub struct ChunkKey {
    pub backing: PathBuf,
    pub offset: u64,
    pub seq: u64,
}

pub struct ChunkCache {
    inner: Cache<ChunkKey, Arc<Vec<u8>>>,
}

impl ChunkCache {
    pub fn new(max_bytes: u64) -> Self {
        let inner = Cache::builder()
            .max_capacity(max_bytes)
            .weigher(|_k, v: &Arc<Vec<u8>>| v.len().min(u32::MAX as usize) as u32)
            .build();
        Self { inner }
    }

    pub fn get(&self, key: &ChunkKey) -> Option<Arc<Vec<u8>>> {
        self.inner.get(key)
    }

    pub fn insert(&self, key: ChunkKey, data: Arc<Vec<u8>>) {
        self.inner.insert(key, data);
    }
}

impl Default for ChunkCache {
    fn default() -> Self {
        Self::new(CHUNK_CACHE_CAPACITY)
    }
}
