//! The chunk-walking read pipeline.
//!
//! Given a file record and a logical offset, find the chunk covering the
//! offset, serve it from the decompressed-chunk cache or decode it, and copy
//! the requested window out. Passthrough chunks never enter the cache: the
//! shard bytes *are* the file bytes, so they are read straight through the
//! pool with offset math.

use std::io::Read;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{error, warn};

use mar_format::proto::CompressedMethod;
use mar_format::{codec, index, zip};
use mar_index::FileSource;

use crate::cache::{ChunkCache, ChunkKey};
use crate::pool::FilePoolMap;
use crate::{Result, StoreError};

/// Pooled reads slower than this get the path appended to the slow-read log.
const SLOW_READ_THRESHOLD: Duration = Duration::from_millis(40);

const NEVER: u64 = u64::MAX;

/// Process-wide read state: pools, cache, and the last-user-read timestamp
/// the preloader yields on.
pub struct ChunkStore {
    pools: FilePoolMap,
    cache: ChunkCache,
    epoch: Instant,
    last_user_read_ms: AtomicU64,
    slow_log: Option<Mutex<std::fs::File>>,
}

impl ChunkStore {
    pub fn new() -> Self {
        Self {
            pools: FilePoolMap::new(),
            cache: ChunkCache::default(),
            epoch: Instant::now(),
            last_user_read_ms: AtomicU64::new(NEVER),
            slow_log: None,
        }
    }

    /// Route slow-read observations to a log file (best effort; never
    /// affects read results).
    pub fn with_slow_read_log(mut self, path: &Path) -> std::io::Result<Self> {
        self.slow_log = Some(Mutex::new(std::fs::File::create(path)?));
        Ok(self)
    }

    /// Record that a user-initiated archive read happened now. Also called
    /// by `open` so the preloader backs off as soon as a file is opened.
    pub fn touch_user_read(&self) {
        self.last_user_read_ms
            .store(self.epoch.elapsed().as_millis() as u64, Ordering::Relaxed);
    }

    /// Did a user-initiated read happen within `window`?
    pub fn user_read_within(&self, window: Duration) -> bool {
        let last = self.last_user_read_ms.load(Ordering::Relaxed);
        if last == NEVER {
            return false;
        }
        let now = self.epoch.elapsed().as_millis() as u64;
        now.saturating_sub(last) <= window.as_millis() as u64
    }

    /// Warm OS caches with one raw chunk read, without counting as a user
    /// read.
    pub fn preload_read(&self, backing: &Path, offset: u64, len: usize) -> std::io::Result<()> {
        let pool = self.pools.get(backing)?;
        let mut scratch = vec![0u8; len];
        pool.read_at(&mut scratch, offset)
    }

    /// Read up to `buf.len()` bytes of `source` starting at `offset`.
    ///
    /// Returns the number of bytes copied; 0 means EOF. A return shorter
    /// than `buf.len()` means the read stopped at a chunk boundary and the
    /// caller should re-invoke with the remaining tail.
    pub fn read_entry(
        &self,
        display_path: &str,
        source: &FileSource,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<usize> {
        match source {
            FileSource::Mar { .. } => self.read_mar(display_path, source, offset, buf),
            FileSource::Zip { .. } => self.read_zip(source, offset, buf),
        }
    }

    fn read_mar(
        &self,
        display_path: &str,
        source: &FileSource,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<usize> {
        let FileSource::Mar {
            info,
            file_index,
            body_offset,
            archive,
        } = source
        else {
            unreachable!("read_mar called with a zip source");
        };

        let mut chunk_start: u64 = 0;
        let mut dat_start: u64 = *body_offset;
        let mut target = None;
        for (chunk_no, chunk) in info.chunks.iter().enumerate() {
            if offset < chunk_start + chunk.original_length as u64 {
                target = Some((chunk_no, chunk));
                break;
            }
            chunk_start += chunk.original_length as u64;
            dat_start += chunk.compressed_length as u64;
        }
        let Some((chunk_no, chunk)) = target else {
            return Ok(0); // past the last chunk: EOF
        };

        let dat = index::dat_path(archive, *file_index);
        let pool = self.pools.get(&dat)?;
        let skip = (offset - chunk_start) as usize;

        if chunk.compressed_method() == CompressedMethod::Passthrough {
            let remaining = chunk.original_length as usize - skip;
            let n = buf.len().min(remaining);
            if buf.len() > remaining {
                warn!(
                    path = display_path,
                    requested = buf.len(),
                    remaining,
                    "read request crosses passthrough chunk end, clamping"
                );
            }
            pool.read_at(&mut buf[..n], dat_start + skip as u64)?;
            return Ok(n);
        }

        let key = ChunkKey {
            backing: dat,
            offset: dat_start,
            seq: chunk_no as u64,
        };
        let decoded = match self.cache.get(&key) {
            Some(hit) => hit,
            None => {
                let mut compressed = vec![0u8; chunk.compressed_length as usize];
                self.touch_user_read();
                let started = Instant::now();
                pool.read_at(&mut compressed, dat_start)?;
                if started.elapsed() > SLOW_READ_THRESHOLD {
                    self.log_slow_read(display_path);
                }

                let decoded = Arc::new(codec::decompress_chunk(chunk, &compressed)?);
                self.cache.insert(key, decoded.clone());
                decoded
            }
        };

        let n = buf.len().min(decoded.len() - skip);
        buf[..n].copy_from_slice(&decoded[skip..skip + n]);
        Ok(n)
    }

    fn read_zip(&self, source: &FileSource, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let FileSource::Zip { entry, archive } = source else {
            unreachable!("read_zip called with a mar source");
        };

        if offset >= entry.uncompressed_size {
            return Ok(0);
        }
        let pool = self.pools.get(archive)?;

        match entry.method {
            // Stored entries stream straight from the archive, bypassing the
            // cache entirely.
            zip::METHOD_STORED => {
                let remaining = entry.uncompressed_size - offset;
                let n = (buf.len() as u64).min(remaining) as usize;
                pool.read_at(&mut buf[..n], entry.data_offset + offset)?;
                Ok(n)
            }
            zip::METHOD_DEFLATE => {
                let key = ChunkKey {
                    backing: archive.clone(),
                    offset: entry.data_offset,
                    seq: entry.compressed_size,
                };
                let decoded = match self.cache.get(&key) {
                    Some(hit) => hit,
                    None => {
                        let mut compressed = vec![0u8; entry.compressed_size as usize];
                        pool.read_at(&mut compressed, entry.data_offset)?;

                        let mut decoded = Vec::with_capacity(entry.uncompressed_size as usize);
                        flate2::read::DeflateDecoder::new(&compressed[..])
                            .read_to_end(&mut decoded)?;
                        if decoded.len() as u64 != entry.uncompressed_size {
                            error!(
                                expected = entry.uncompressed_size,
                                actual = decoded.len(),
                                "zip entry decompressed to an unexpected size"
                            );
                            return Err(StoreError::Io(std::io::Error::other(
                                "zip entry size mismatch",
                            )));
                        }
                        let decoded = Arc::new(decoded);
                        self.cache.insert(key, decoded.clone());
                        decoded
                    }
                };

                let skip = offset as usize;
                let n = buf.len().min(decoded.len() - skip);
                buf[..n].copy_from_slice(&decoded[skip..skip + n]);
                Ok(n)
            }
            other => Err(StoreError::UnsupportedZipMethod(other)),
        }
    }

    fn log_slow_read(&self, display_path: &str) {
        if let Some(log) = &self.slow_log {
            use std::io::Write;
            let mut log = log.lock().expect("slow-read log poisoned");
            let _ = writeln!(log, "{display_path}");
        }
    }
}

impl Default for ChunkStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mar_format::proto::CompressedMethod;
    use mar_format::testing::{self, zip_fixture, FixtureFile};
    use mar_index::{normalize_key, ArchiveReadOptions, ArchiveTree};

    fn load_tree(dir: &Path, files: &[FixtureFile<'_>]) -> ArchiveTree {
        let archive = testing::write_archive(&dir.join("fx"), files).unwrap();
        let mut tree = ArchiveTree::new();
        tree.load_mar(&archive, &ArchiveReadOptions::default())
            .unwrap();
        tree
    }

    fn read_all(store: &ChunkStore, source: &FileSource, mut offset: u64, len: usize) -> Vec<u8> {
        let mut out = vec![0u8; len];
        let mut filled = 0;
        while filled < len {
            let n = store
                .read_entry("/test", source, offset, &mut out[filled..])
                .unwrap();
            if n == 0 {
                break;
            }
            filled += n;
            offset += n as u64;
        }
        out.truncate(filled);
        out
    }

    #[test]
    fn random_access_inside_zstd_chunks() {
        // 3 MiB source split into 1 MiB zstd chunks, random 4-byte window
        let data: Vec<u8> = (0..3 * 1024 * 1024u32).map(|i| (i * 7 + 13) as u8).collect();
        let dir = tempfile::tempdir().unwrap();
        let tree = load_tree(
            dir.path(),
            &[FixtureFile::chunked(
                "/big.bin",
                &data,
                1024 * 1024,
                CompressedMethod::Zstandard,
            )],
        );

        let store = ChunkStore::new();
        let source = tree.lookup_file("/big.bin").unwrap();
        let got = read_all(&store, source, 1_500_000, 4);
        assert_eq!(got, &data[1_500_000..1_500_004]);
    }

    #[test]
    fn reads_span_chunk_boundaries() {
        let data: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let dir = tempfile::tempdir().unwrap();
        let tree = load_tree(
            dir.path(),
            &[FixtureFile::chunked(
                "/spanned.bin",
                &data,
                64 * 1024,
                CompressedMethod::Lz4,
            )],
        );

        let store = ChunkStore::new();
        let source = tree.lookup_file("/spanned.bin").unwrap();
        // window straddles the first and second 64 KiB chunks
        let got = read_all(&store, source, 65_000, 2_000);
        assert_eq!(got, &data[65_000..67_000]);
        // full-file read
        let got = read_all(&store, source, 0, data.len());
        assert_eq!(got, data);
    }

    #[test]
    fn passthrough_chunks_clamp_and_bypass_cache() {
        let data = b"passthrough payload, stored raw".repeat(10);
        let dir = tempfile::tempdir().unwrap();
        let tree = load_tree(
            dir.path(),
            &[FixtureFile::chunked(
                "/raw.bin",
                &data,
                100,
                CompressedMethod::Passthrough,
            )],
        );

        let store = ChunkStore::new();
        let source = tree.lookup_file("/raw.bin").unwrap();

        // over-long request is served in chunk-sized pieces
        let mut buf = vec![0u8; 150];
        let n = store.read_entry("/raw.bin", source, 0, &mut buf).unwrap();
        assert_eq!(n, 100);
        assert_eq!(&buf[..100], &data[..100]);

        let got = read_all(&store, source, 50, 200);
        assert_eq!(got, &data[50..250]);
    }

    #[test]
    fn eof_returns_zero() {
        let dir = tempfile::tempdir().unwrap();
        let tree = load_tree(
            dir.path(),
            &[FixtureFile::new("/s.bin", b"abc", CompressedMethod::Lz4)],
        );
        let store = ChunkStore::new();
        let source = tree.lookup_file("/s.bin").unwrap();

        let mut buf = [0u8; 4];
        assert_eq!(store.read_entry("/s.bin", source, 3, &mut buf).unwrap(), 0);
        assert_eq!(store.read_entry("/s.bin", source, 100, &mut buf).unwrap(), 0);
    }

    #[test]
    fn repeated_reads_hit_the_cache() {
        let data = b"cache me".repeat(1000);
        let dir = tempfile::tempdir().unwrap();
        let tree = load_tree(
            dir.path(),
            &[FixtureFile::new("/c.bin", &data, CompressedMethod::Zstandard)],
        );
        let store = ChunkStore::new();
        let source = tree.lookup_file("/c.bin").unwrap();

        let first = read_all(&store, source, 0, data.len());
        // truncate the shard: a second read must be served from cache
        let archive = source.archive().to_path_buf();
        let dat = mar_format::index::dat_path(&archive, 0);
        std::fs::File::create(&dat).unwrap();

        let second = read_all(&store, source, 100, 64);
        assert_eq!(first, data);
        assert_eq!(second, &data[100..164]);
    }

    #[test]
    fn zip_stored_and_deflate_reads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fx.zip");
        let big = b"zip deflate body ".repeat(500);
        zip_fixture::write_zip(
            &path,
            &[
                zip_fixture::Entry::stored("plain.txt", b"HELLO ZIP"),
                zip_fixture::Entry::deflate("packed.bin", &big),
            ],
        )
        .unwrap();

        let mut tree = ArchiveTree::new();
        tree.load_zip(&path, &ArchiveReadOptions::default()).unwrap();
        let store = ChunkStore::new();

        let plain = tree.lookup_file(&normalize_key("/plain.txt")).unwrap();
        assert_eq!(read_all(&store, plain, 0, 9), b"HELLO ZIP");
        assert_eq!(read_all(&store, plain, 6, 3), b"ZIP");

        let packed = tree.lookup_file(&normalize_key("/packed.bin")).unwrap();
        assert_eq!(read_all(&store, packed, 0, big.len()), big);
        assert_eq!(read_all(&store, packed, 17, 17), &big[17..34]);
    }

    #[test]
    fn user_read_window_tracks_touches() {
        let store = ChunkStore::new();
        assert!(!store.user_read_within(Duration::from_secs(3)));
        store.touch_user_read();
        assert!(store.user_read_within(Duration::from_secs(3)));
    }
}
