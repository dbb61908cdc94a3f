//! The two-namespace handle table.
//!
//! Archive-read handles carry no per-open state (reads are restartable
//! against the index entry), so they are bare counter values. Overlay
//! handles own a real host file object; the two counters start far apart so
//! a handle's namespace is unambiguous.

use std::fs::File;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use dashmap::DashMap;

/// First overlay handle value; archive handles stay far below this.
pub const OVERLAY_HANDLE_BASE: u64 = 1 << 28;

/// One open overlay file. The mutex is held for the entire
/// read/write/truncate/seek sequence of an operation.
pub struct SharedFileHandle {
    pub file: Mutex<File>,
    pub append_mode: bool,
}

/// A rename that failed while the file was open, retried at `release`.
#[derive(Debug, Clone)]
pub struct RenameRequest {
    pub old_host: PathBuf,
    pub new_host: PathBuf,
    pub old_path: String,
    pub new_path: String,
}

pub struct HandleTable {
    archive_count: AtomicU64,
    overlay_count: AtomicU64,
    overlay: DashMap<u64, Arc<SharedFileHandle>>,
}

impl HandleTable {
    pub fn new() -> Self {
        Self {
            archive_count: AtomicU64::new(0),
            overlay_count: AtomicU64::new(OVERLAY_HANDLE_BASE),
            overlay: DashMap::new(),
        }
    }

    /// Allocate an archive-read handle (monotonic, starting at 1).
    pub fn next_archive_handle(&self) -> u64 {
        self.archive_count.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Register an overlay file and return its handle.
    pub fn register_overlay(&self, file: File, append_mode: bool) -> u64 {
        let fh = self.overlay_count.fetch_add(1, Ordering::Relaxed) + 1;
        self.overlay.insert(
            fh,
            Arc::new(SharedFileHandle {
                file: Mutex::new(file),
                append_mode,
            }),
        );
        fh
    }

    pub fn get_overlay(&self, fh: u64) -> Option<Arc<SharedFileHandle>> {
        self.overlay.get(&fh).map(|h| Arc::clone(h.value()))
    }

    pub fn remove_overlay(&self, fh: u64) -> Option<Arc<SharedFileHandle>> {
        self.overlay.remove(&fh).map(|(_, h)| h)
    }
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn namespaces_do_not_overlap() {
        let table = HandleTable::new();
        let a = table.next_archive_handle();
        let b = table.next_archive_handle();
        assert_eq!(a, 1);
        assert_eq!(b, 2);

        let tmp = tempfile::tempfile().unwrap();
        let fh = table.register_overlay(tmp, false);
        assert!(fh > OVERLAY_HANDLE_BASE);
        assert!(table.get_overlay(fh).is_some());
        assert!(table.get_overlay(a).is_none());
    }

    #[test]
    fn remove_unregisters() {
        let table = HandleTable::new();
        let fh = table.register_overlay(tempfile::tempfile().unwrap(), true);
        let handle = table.remove_overlay(fh).unwrap();
        assert!(handle.append_mode);
        assert!(table.get_overlay(fh).is_none());
        assert!(table.remove_overlay(fh).is_none());
    }
}
