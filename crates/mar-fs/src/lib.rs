//! # mar-fs
//!
//! The mount-time virtual filesystem.
//!
//! [`MayakashiFs`] composes the read-only archive index with an optional
//! writable overlay directory and exposes the path-based capability set a
//! kernel bridge drives: getattr, readdir, open, read, write, create,
//! mkdir, unlink, rename, truncate, release, statfs, access.
//!
//! Write semantics over the immutable archives come from the overlay
//! engine: copy-up on write-intent opens, `.__whiteout__` markers for
//! deletion, and a deferred table for unlinks/renames that fail while a
//! handle is still open.
//!
//! Every operation takes `&self` and is safe under arbitrary concurrent
//! interleaving; no global lock is held across disk I/O or decompression.

pub mod error;
pub mod handles;
pub mod ops;
pub mod overlay;
pub mod preload;

pub use error::{FsError, FsResult};
pub use handles::{HandleTable, RenameRequest, SharedFileHandle, OVERLAY_HANDLE_BASE};
pub use ops::{Attr, DirEntry, FileKind, MayakashiFs, OpenFlags, StatFs};
pub use overlay::{Overlay, WRITEBACK_SUFFIX};
pub use preload::spawn_preload;
