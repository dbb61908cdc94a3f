//! Per-backing-file descriptor pools.
//!
//! Each `.dat` shard (and each mounted `.zip`) gets its own small pool of
//! open read-only descriptors. Half the cap is opened eagerly so the first
//! reads after mount don't pay the open latency; under contention extra
//! ephemeral descriptors are opened freely and at most [`FILE_POOL_LIMIT`]
//! are retained on release.

use std::collections::HashMap;
use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use tracing::debug;

/// Retained-descriptor cap per backing file.
pub const FILE_POOL_LIMIT: usize = 8;

pub struct FilePool {
    path: PathBuf,
    idle: Mutex<Vec<File>>,
}

impl FilePool {
    fn new(path: &Path) -> std::io::Result<Self> {
        let mut idle = Vec::with_capacity(FILE_POOL_LIMIT);
        for _ in 0..FILE_POOL_LIMIT / 2 {
            idle.push(File::open(path)?);
        }
        Ok(Self {
            path: path.to_path_buf(),
            idle: Mutex::new(idle),
        })
    }

    fn acquire(&self) -> std::io::Result<File> {
        if let Some(file) = self.idle.lock().expect("file pool poisoned").pop() {
            return Ok(file);
        }
        debug!(path = %self.path.display(), "pool empty, opening ephemeral descriptor");
        File::open(&self.path)
    }

    fn release(&self, file: File) {
        let mut idle = self.idle.lock().expect("file pool poisoned");
        if idle.len() < FILE_POOL_LIMIT {
            idle.push(file);
        }
        // over the cap the descriptor just drops
    }

    /// Fill `buf` from `offset`. Acquires a descriptor, reads, releases.
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> std::io::Result<()> {
        let file = self.acquire()?;
        let result = file.read_exact_at(buf, offset);
        self.release(file);
        result
    }
}

/// Registry of pools, keyed by backing-file display path.
#[derive(Default)]
pub struct FilePoolMap {
    pools: RwLock<HashMap<PathBuf, Arc<FilePool>>>,
}

impl FilePoolMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create the pool for a backing file. Creation (which opens the
    /// pre-warm descriptors) happens under the write lock; steady-state
    /// lookups only take the read lock.
    pub fn get(&self, path: &Path) -> std::io::Result<Arc<FilePool>> {
        if let Some(pool) = self.pools.read().expect("pool registry poisoned").get(path) {
            return Ok(pool.clone());
        }

        let mut pools = self.pools.write().expect("pool registry poisoned");
        if let Some(pool) = pools.get(path) {
            return Ok(pool.clone());
        }
        let pool = Arc::new(FilePool::new(path)?);
        pools.insert(path.to_path_buf(), pool.clone());
        Ok(pool)
    }
}
