//! The in-memory directory tree.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use tracing::{debug, info, warn};

use mar_format::{index, proto, zip};

use crate::options::ArchiveReadOptions;
use crate::path::{fix_separators, normalize_key, parent_dir};
use crate::{Result, WHITEOUT_SUFFIX};

/// A ZIP entry as held by the tree: name decoded, payload located.
#[derive(Debug, Clone)]
pub struct ZipEntry {
    pub method: u16,
    pub compressed_size: u64,
    pub uncompressed_size: u64,
    pub data_offset: u64,
    pub modified: SystemTime,
}

/// One mounted file. The read pipeline dispatches on the variant; everything
/// else only needs `size()` and `modified()`.
#[derive(Debug, Clone)]
pub enum FileSource {
    Mar {
        info: proto::FileInfo,
        file_index: u32,
        body_offset: u64,
        archive: PathBuf,
    },
    Zip {
        entry: ZipEntry,
        archive: PathBuf,
    },
}

impl FileSource {
    /// Logical file size as reported by `getattr`.
    pub fn size(&self) -> u64 {
        match self {
            FileSource::Mar { info, .. } => info.total_size(),
            FileSource::Zip { entry, .. } => entry.uncompressed_size,
        }
    }

    pub fn modified(&self) -> SystemTime {
        match self {
            FileSource::Mar { info, .. } => info.modified(),
            FileSource::Zip { entry, .. } => entry.modified,
        }
    }

    /// Path of the archive file this entry came from (display form).
    pub fn archive(&self) -> &Path {
        match self {
            FileSource::Mar { archive, .. } | FileSource::Zip { archive, .. } => archive,
        }
    }
}

/// Listing of one directory: key → display path, for files and subdirs.
#[derive(Debug, Default)]
pub struct DirInfo {
    pub files: HashMap<String, String>,
    pub dirs: HashMap<String, String>,
}

/// The full mount namespace, keyed by normalized path.
///
/// Populated at startup by [`ArchiveTree::load_mar`] / [`ArchiveTree::load_zip`]
/// and immutable afterwards.
#[derive(Debug, Default)]
pub struct ArchiveTree {
    files: HashMap<String, FileSource>,
    dirs: HashMap<String, DirInfo>,
}

impl ArchiveTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup_file(&self, key: &str) -> Option<&FileSource> {
        self.files.get(key)
    }

    pub fn lookup_dir(&self, key: &str) -> Option<&DirInfo> {
        self.dirs.get(key)
    }

    /// All mounted files, keyed by normalized path.
    pub fn files(&self) -> impl Iterator<Item = (&str, &FileSource)> {
        self.files.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    /// Ensure a directory and its whole ancestor chain exist, registering
    /// each new directory in its parent's listing. Returns the key.
    fn ensure_dir(&mut self, dir_path: &str) -> String {
        let dir_path = if dir_path.is_empty() { "/" } else { dir_path };
        let key = normalize_key(dir_path);
        if self.dirs.contains_key(&key) {
            return key;
        }
        self.dirs.insert(key.clone(), DirInfo::default());

        let up = parent_dir(dir_path);
        let up = if up.is_empty() { "/" } else { up };
        if up != dir_path {
            let up_key = self.ensure_dir(up);
            self.dirs
                .get_mut(&up_key)
                .expect("ancestor directory just ensured")
                .dirs
                .insert(key.clone(), dir_path.to_string());
        }
        key
    }

    fn insert_file(&mut self, display: &str, source: FileSource) {
        let key = normalize_key(display);
        self.files.insert(key.clone(), source);
        let dir_key = self.ensure_dir(parent_dir(display));
        self.dirs
            .get_mut(&dir_key)
            .expect("parent directory just ensured")
            .files
            .insert(key, display.to_string());
    }

    fn remove_file(&mut self, display: &str) {
        let key = normalize_key(display);
        self.files.remove(&key);
        let dir_key = self.ensure_dir(parent_dir(display));
        if let Some(dir) = self.dirs.get_mut(&dir_key) {
            dir.files.remove(&key);
        }
    }

    /// Load a MAR archive (`<archive>.idx` next to its data shards).
    ///
    /// An entry whose key ends in `.__whiteout__` deletes any entry an
    /// *earlier* archive placed at the stripped path, unless this archive
    /// itself provides that path, in which case the whiteout is ignored.
    pub fn load_mar(&mut self, archive: &Path, options: &ArchiveReadOptions) -> Result<usize> {
        let mut idx_path = archive.as_os_str().to_os_string();
        idx_path.push(".idx");
        let mut file = std::fs::File::open(PathBuf::from(idx_path))?;
        let index_file = index::read_index_file(&mut file)?;

        let mut loaded = 0usize;
        let mut our_files: HashSet<String> = HashSet::new();

        for entry in index_file.entries {
            let Some(info) = entry.info else {
                warn!(archive = %archive.display(), "index entry without file info, skipping");
                continue;
            };
            let Some(display_path) = options.apply(&info.path) else {
                continue;
            };

            let key = normalize_key(&display_path);
            if let Some(stripped_key) = key.strip_suffix(WHITEOUT_SUFFIX) {
                if our_files.contains(stripped_key) {
                    debug!(path = %display_path, "whiteout for a path this archive also provides, ignoring");
                    continue;
                }
                let stripped_display = &display_path[..display_path.len() - WHITEOUT_SUFFIX.len()];
                debug!(path = %stripped_display, "whiteout entry masks earlier archive");
                self.remove_file(stripped_display);
                continue;
            }
            our_files.insert(key);

            self.insert_file(
                &display_path,
                FileSource::Mar {
                    info,
                    file_index: entry.file_index,
                    body_offset: entry.body_offset,
                    archive: archive.to_path_buf(),
                },
            );
            loaded += 1;
        }

        info!(archive = %archive.display(), files = loaded, "loaded MAR archive");
        Ok(loaded)
    }

    /// Load a ZIP archive's central directory.
    pub fn load_zip(&mut self, archive: &Path, options: &ArchiveReadOptions) -> Result<usize> {
        let records = zip::read_central_directory(archive)?;
        let mut loaded = 0usize;

        for record in records {
            let name = fix_separators(&options.decode_zip_name(&record.name_bytes, record.utf8_flag));
            let Some(mut display_path) = options.apply(&name) else {
                continue;
            };

            let mut is_dir = record.is_dir;
            if display_path.ends_with('/') {
                if !is_dir && record.uncompressed_size != 0 {
                    warn!(path = %display_path, "non-empty zip entry with a directory name, skipping");
                    continue;
                }
                display_path.truncate(display_path.len() - 1);
                is_dir = true;
            }

            if is_dir {
                self.ensure_dir(&display_path);
                continue;
            }

            self.insert_file(
                &display_path,
                FileSource::Zip {
                    entry: ZipEntry {
                        method: record.method,
                        compressed_size: record.compressed_size,
                        uncompressed_size: record.uncompressed_size,
                        data_offset: record.data_offset,
                        modified: record.modified,
                    },
                    archive: archive.to_path_buf(),
                },
            );
            loaded += 1;
        }

        info!(archive = %archive.display(), files = loaded, "loaded ZIP archive");
        Ok(loaded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mar_format::proto::CompressedMethod;
    use mar_format::testing::{self, zip_fixture, FixtureFile};

    fn load_fixture(files: &[FixtureFile<'_>]) -> (tempfile::TempDir, ArchiveTree) {
        let dir = tempfile::tempdir().unwrap();
        let archive = testing::write_archive(&dir.path().join("fx"), files).unwrap();
        let mut tree = ArchiveTree::new();
        tree.load_mar(&archive, &ArchiveReadOptions::default())
            .unwrap();
        (dir, tree)
    }

    #[test]
    fn lookup_is_case_and_normalization_insensitive() {
        let (_dir, tree) = load_fixture(&[FixtureFile::new(
            "/Foo/Bar.TXT",
            b"hello",
            CompressedMethod::Passthrough,
        )]);

        let file = tree.lookup_file(&normalize_key("/foo/bar.txt")).unwrap();
        assert_eq!(file.size(), 5);
        // the display path keeps its original case
        let dir = tree.lookup_dir(&normalize_key("/Foo")).unwrap();
        assert_eq!(dir.files.values().next().unwrap(), "/Foo/Bar.TXT");
    }

    #[test]
    fn ancestor_directories_are_created() {
        let (_dir, tree) = load_fixture(&[FixtureFile::new(
            "/a/b/c/d.bin",
            b"x",
            CompressedMethod::Passthrough,
        )]);

        for dir in ["/", "/a", "/a/b", "/a/b/c"] {
            assert!(tree.lookup_dir(&normalize_key(dir)).is_some(), "{dir}");
        }
        let root = tree.lookup_dir("/").unwrap();
        assert_eq!(root.dirs.values().next().unwrap(), "/a");
    }

    #[test]
    fn later_archive_wins_on_collision() {
        let dir = tempfile::tempdir().unwrap();
        let a = testing::write_archive(
            &dir.path().join("a"),
            &[FixtureFile::new("/f.txt", b"old", CompressedMethod::Passthrough)],
        )
        .unwrap();
        let b = testing::write_archive(
            &dir.path().join("b"),
            &[FixtureFile::new("/F.txt", b"newer", CompressedMethod::Passthrough)],
        )
        .unwrap();

        let mut tree = ArchiveTree::new();
        let options = ArchiveReadOptions::default();
        tree.load_mar(&a, &options).unwrap();
        tree.load_mar(&b, &options).unwrap();

        let file = tree.lookup_file("/f.txt").unwrap();
        assert_eq!(file.size(), 5);
        assert_eq!(file.archive(), b.as_path());
    }

    #[test]
    fn whiteout_in_later_archive_removes_earlier_entry() {
        let dir = tempfile::tempdir().unwrap();
        let a = testing::write_archive(
            &dir.path().join("a"),
            &[FixtureFile::new("/foo/bar", b"data", CompressedMethod::Passthrough)],
        )
        .unwrap();
        let b = testing::write_archive(
            &dir.path().join("b"),
            &[FixtureFile::new(
                "/foo/bar.__whiteout__",
                b"",
                CompressedMethod::Passthrough,
            )],
        )
        .unwrap();

        let mut tree = ArchiveTree::new();
        let options = ArchiveReadOptions::default();
        tree.load_mar(&a, &options).unwrap();
        tree.load_mar(&b, &options).unwrap();

        assert!(tree.lookup_file("/foo/bar").is_none());
        assert!(tree.lookup_dir("/foo").unwrap().files.is_empty());
    }

    #[test]
    fn whiteout_is_ignored_when_same_archive_provides_the_path() {
        let (_dir, tree) = load_fixture(&[
            FixtureFile::new("/foo/bar", b"data", CompressedMethod::Passthrough),
            FixtureFile::new("/foo/bar.__whiteout__", b"", CompressedMethod::Passthrough),
        ]);

        assert!(tree.lookup_file("/foo/bar").is_some());
    }

    #[test]
    fn include_globs_limit_loaded_entries() {
        let dir = tempfile::tempdir().unwrap();
        let archive = testing::write_archive(
            &dir.path().join("fx"),
            &[
                FixtureFile::new("/data/keep.bin", b"1", CompressedMethod::Passthrough),
                FixtureFile::new("/other/drop.bin", b"2", CompressedMethod::Passthrough),
            ],
        )
        .unwrap();

        let mut options = ArchiveReadOptions::default();
        options.add_include_glob("/data/**").unwrap();
        let mut tree = ArchiveTree::new();
        let loaded = tree.load_mar(&archive, &options).unwrap();

        assert_eq!(loaded, 1);
        assert!(tree.lookup_file("/data/keep.bin").is_some());
        assert!(tree.lookup_file("/other/drop.bin").is_none());
    }

    #[test]
    fn zip_entries_load_with_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fx.zip");
        zip_fixture::write_zip(
            &path,
            &[
                zip_fixture::Entry::stored("Top/File.txt", b"HELLO"),
                zip_fixture::Entry::dir("Top/Empty/"),
            ],
        )
        .unwrap();

        let mut tree = ArchiveTree::new();
        let loaded = tree
            .load_zip(&path, &ArchiveReadOptions::default())
            .unwrap();

        assert_eq!(loaded, 1);
        let file = tree.lookup_file("/top/file.txt").unwrap();
        assert_eq!(file.size(), 5);
        assert!(tree.lookup_dir("/top/empty").is_some());
        assert!(matches!(file, FileSource::Zip { .. }));
    }

    #[test]
    fn zip_cp932_names_decode_when_configured() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fx.zip");
        // "テスト.txt" in Shift_JIS
        let mut raw = vec![0x83, 0x65, 0x83, 0x58, 0x83, 0x67];
        raw.extend_from_slice(b".txt");
        zip_fixture::write_zip(&path, &[zip_fixture::Entry::legacy_name(&raw, b"x")]).unwrap();

        let mut options = ArchiveReadOptions::default();
        options.set_zip_locale("cp932").unwrap();
        let mut tree = ArchiveTree::new();
        tree.load_zip(&path, &options).unwrap();

        assert!(tree.lookup_file(&normalize_key("/テスト.txt")).is_some());
    }
}
