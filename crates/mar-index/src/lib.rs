//! # mar-index
//!
//! The mount-time directory index.
//!
//! Archives are loaded once at startup into an [`ArchiveTree`]: a pair of
//! maps from *keys* (NFC-normalized, lower-cased paths) to file records and
//! directory listings. After loading completes the tree is immutable, which
//! is what lets the filesystem's lookup path run without synchronization.
//!
//! Load order is significant: a later archive overwrites earlier entries at
//! the same key, and a later archive's `.__whiteout__` entries delete
//! earlier entries outright.

pub mod options;
pub mod path;
pub mod tree;

use thiserror::Error;

pub use options::{ArchiveReadOptions, ZipLocale};
pub use path::normalize_key;
pub use tree::{ArchiveTree, DirInfo, FileSource, ZipEntry};

/// Marker suffix hiding the archive entry at the stripped path.
pub const WHITEOUT_SUFFIX: &str = ".__whiteout__";

#[derive(Error, Debug)]
pub enum IndexError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("archive format error: {0}")]
    Format(#[from] mar_format::FormatError),

    #[error("invalid glob pattern {pattern:?}: {source}")]
    Glob {
        pattern: String,
        source: glob::PatternError,
    },

    #[error("invalid zip locale: {0}")]
    ZipLocale(String),
}

pub type Result<T> = std::result::Result<T, IndexError>;
