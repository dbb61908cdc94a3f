//! # mar-store
//!
//! The read side of a mounted archive: bounded per-file descriptor pools,
//! a size-weighted cache of decompressed chunks, and the chunk-walking read
//! pipeline that serves `read()` callbacks for MAR and ZIP entries.
//!
//! Everything here is safe for concurrent use; no global lock is held
//! across disk reads or decompression.

pub mod cache;
pub mod pool;
pub mod reader;

use thiserror::Error;

pub use cache::{ChunkCache, ChunkKey, CHUNK_CACHE_CAPACITY};
pub use pool::{FilePool, FilePoolMap, FILE_POOL_LIMIT};
pub use reader::ChunkStore;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("archive format error: {0}")]
    Format(#[from] mar_format::FormatError),

    #[error("unsupported zip compression method {0}")]
    UnsupportedZipMethod(u16),
}

pub type Result<T> = std::result::Result<T, StoreError>;
