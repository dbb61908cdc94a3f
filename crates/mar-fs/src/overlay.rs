//! Overlay path mapping.
//!
//! The overlay root is a real host directory; mount path `P` maps to
//! `<root><P>`. Paths under a configured read-only prefix never resolve to
//! an overlay location, which is what makes every write there fail with
//! `READONLY`.

use std::path::{Path, PathBuf};

use mar_index::{normalize_key, WHITEOUT_SUFFIX};

/// Scratch-file suffix used while copying an archive file up; renamed into
/// place on success, deleted on failure.
pub const WRITEBACK_SUFFIX: &str = ".__writeback__";

#[derive(Debug)]
pub struct Overlay {
    root: PathBuf,
    ro_prefixes: Vec<String>,
}

impl Overlay {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ro_prefixes: Vec::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Mark a mount-path prefix as read-only (compared in key form).
    pub fn add_readonly_prefix(&mut self, prefix: &str) {
        let prefix = if prefix.starts_with('/') {
            prefix.to_string()
        } else {
            format!("/{prefix}")
        };
        self.ro_prefixes.push(normalize_key(&prefix));
    }

    /// Host path backing a mount path, or `None` when the path is under a
    /// read-only prefix.
    pub fn host_path(&self, path: &str) -> Option<PathBuf> {
        let key = normalize_key(path);
        if self.ro_prefixes.iter().any(|p| key.starts_with(p.as_str())) {
            return None;
        }
        let mut host = self.root.as_os_str().to_os_string();
        host.push(path);
        Some(PathBuf::from(host))
    }

    /// Host path of the whiteout marker for a mount path.
    pub fn whiteout_path(&self, path: &str) -> Option<PathBuf> {
        let mut host = self.host_path(path)?.into_os_string();
        host.push(WHITEOUT_SUFFIX);
        Some(PathBuf::from(host))
    }
}

/// `<host>.__writeback__` for a copy-up target.
pub fn writeback_path(host: &Path) -> PathBuf {
    let mut p = host.as_os_str().to_os_string();
    p.push(WRITEBACK_SUFFIX);
    PathBuf::from(p)
}
