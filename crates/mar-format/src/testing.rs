//! Fixture builders for tests.
//!
//! Downstream crates exercise real archives rather than mocks: these helpers
//! emit byte-exact `.mar.idx`/`.mar.dat` pairs (and small ZIP files) into a
//! scratch directory. Not intended for production use; the real builder is
//! a separate offline tool.

use std::io::{self, Write};
use std::path::{Path, PathBuf};

use prost::Message;

use crate::index::INDEX_MAGIC;
use crate::proto::{self, CompressedMethod};

/// Write a `FileIndexFile` with the standard `.idx` framing.
pub fn write_index_file<W: Write>(index: &proto::FileIndexFile, out: &mut W) -> io::Result<()> {
    let raw = index.encode_to_vec();
    let compressed = zstd::encode_all(&raw[..], 3)?;

    out.write_all(INDEX_MAGIC)?;
    out.write_all(&(compressed.len() as u32).to_be_bytes())?;
    out.write_all(&(raw.len() as u32).to_be_bytes())?;
    out.write_all(&compressed)?;
    Ok(())
}

/// Compress one chunk with the given method, returning its `ChunkInfo` and
/// payload bytes.
pub fn compress_chunk(method: CompressedMethod, data: &[u8]) -> (proto::ChunkInfo, Vec<u8>) {
    let compressed = match method {
        CompressedMethod::Passthrough => data.to_vec(),
        CompressedMethod::Zstandard => zstd::encode_all(data, 3).expect("zstd encode"),
        CompressedMethod::Lz4 => {
            lz4::block::compress(data, None, false).expect("lz4 encode")
        }
    };
    let info = proto::ChunkInfo {
        compressed_length: compressed.len() as u32,
        original_length: data.len() as u32,
        compressed_method: method as i32,
    };
    (info, compressed)
}

/// Source description for one file of a fixture archive.
pub struct FixtureFile<'a> {
    pub path: &'a str,
    pub data: &'a [u8],
    pub chunk_size: usize,
    pub method: CompressedMethod,
}

impl<'a> FixtureFile<'a> {
    /// A single-chunk file compressed with the given method.
    pub fn new(path: &'a str, data: &'a [u8], method: CompressedMethod) -> Self {
        Self {
            path,
            data,
            chunk_size: usize::MAX,
            method,
        }
    }

    /// Split into `chunk_size`-byte chunks, each compressed independently.
    pub fn chunked(path: &'a str, data: &'a [u8], chunk_size: usize, method: CompressedMethod) -> Self {
        Self {
            path,
            data,
            chunk_size,
            method,
        }
    }
}

/// Fixed modification time stamped on fixture entries.
pub const FIXTURE_MTIME: i64 = 1_700_000_000;

/// Write `<base>.mar.idx` and `<base>.mar.dat`, returning the archive path
/// (`<base>.mar`) to hand to the loaders.
pub fn write_archive(base: &Path, files: &[FixtureFile<'_>]) -> io::Result<PathBuf> {
    let mut archive = base.as_os_str().to_os_string();
    archive.push(".mar");
    let archive = PathBuf::from(archive);

    let mut body = Vec::new();
    let mut entries = Vec::with_capacity(files.len());

    for file in files {
        let body_offset = body.len() as u64;
        let mut chunks = Vec::new();
        let chunk_size = file.chunk_size.max(1);
        for piece in file.data.chunks(chunk_size) {
            let (info, compressed) = compress_chunk(file.method, piece);
            chunks.push(info);
            body.extend_from_slice(&compressed);
        }

        entries.push(proto::FileEntry {
            info: Some(proto::FileInfo {
                path: file.path.to_string(),
                chunks,
                modified_time: Some(prost_types::Timestamp {
                    seconds: FIXTURE_MTIME,
                    nanos: 0,
                }),
                ..Default::default()
            }),
            file_index: 0,
            body_offset,
            body_size: body.len() as u64 - body_offset,
        });
    }

    let index = proto::FileIndexFile { entries };
    let mut idx_path = archive.as_os_str().to_os_string();
    idx_path.push(".idx");
    let mut idx = std::fs::File::create(PathBuf::from(idx_path))?;
    write_index_file(&index, &mut idx)?;

    let mut dat_path = archive.as_os_str().to_os_string();
    dat_path.push(".dat");
    std::fs::write(PathBuf::from(dat_path), &body)?;

    Ok(archive)
}

/// Minimal ZIP writer used by parser and loader tests.
pub mod zip_fixture {
    use std::io::{self, Write};
    use std::path::Path;

    const FIXTURE_DOS_DATE: u16 = (44 << 9) | (3 << 5) | 15;
    const FIXTURE_DOS_TIME: u16 = (12 << 11) | (30 << 5) | 5;

    pub struct Entry {
        pub name_bytes: Vec<u8>,
        pub utf8_flag: bool,
        pub method: u16,
        pub data: Vec<u8>,
        pub uncompressed_size: u64,
        pub is_dir: bool,
    }

    impl Entry {
        pub fn stored(name: &str, data: &[u8]) -> Self {
            Self {
                name_bytes: name.as_bytes().to_vec(),
                utf8_flag: true,
                method: crate::zip::METHOD_STORED,
                data: data.to_vec(),
                uncompressed_size: data.len() as u64,
                is_dir: false,
            }
        }

        pub fn deflate(name: &str, data: &[u8]) -> Self {
            let mut enc =
                flate2::write::DeflateEncoder::new(Vec::new(), flate2::Compression::default());
            enc.write_all(data).expect("deflate encode");
            let compressed = enc.finish().expect("deflate finish");
            Self {
                name_bytes: name.as_bytes().to_vec(),
                utf8_flag: true,
                method: crate::zip::METHOD_DEFLATE,
                data: compressed,
                uncompressed_size: data.len() as u64,
                is_dir: false,
            }
        }

        pub fn dir(name: &str) -> Self {
            Self {
                name_bytes: name.as_bytes().to_vec(),
                utf8_flag: true,
                method: crate::zip::METHOD_STORED,
                data: Vec::new(),
                uncompressed_size: 0,
                is_dir: true,
            }
        }

        /// An entry whose raw name bytes are in a legacy encoding (the
        /// language-encoding flag is left clear).
        pub fn legacy_name(name_bytes: &[u8], data: &[u8]) -> Self {
            Self {
                name_bytes: name_bytes.to_vec(),
                utf8_flag: false,
                method: crate::zip::METHOD_STORED,
                data: data.to_vec(),
                uncompressed_size: data.len() as u64,
                is_dir: false,
            }
        }
    }

    pub fn write_zip(path: &Path, entries: &[Entry]) -> io::Result<()> {
        let mut out = Vec::new();
        let mut offsets = Vec::with_capacity(entries.len());

        for e in entries {
            offsets.push(out.len() as u32);
            let flags: u16 = if e.utf8_flag { 1 << 11 } else { 0 };
            out.extend_from_slice(&0x04034b50u32.to_le_bytes());
            out.extend_from_slice(&20u16.to_le_bytes()); // version needed
            out.extend_from_slice(&flags.to_le_bytes());
            out.extend_from_slice(&e.method.to_le_bytes());
            out.extend_from_slice(&FIXTURE_DOS_TIME.to_le_bytes());
            out.extend_from_slice(&FIXTURE_DOS_DATE.to_le_bytes());
            out.extend_from_slice(&0u32.to_le_bytes()); // crc32 (unchecked)
            out.extend_from_slice(&(e.data.len() as u32).to_le_bytes());
            out.extend_from_slice(&(e.uncompressed_size as u32).to_le_bytes());
            out.extend_from_slice(&(e.name_bytes.len() as u16).to_le_bytes());
            out.extend_from_slice(&0u16.to_le_bytes()); // extra len
            out.extend_from_slice(&e.name_bytes);
            out.extend_from_slice(&e.data);
        }

        let cd_offset = out.len() as u32;
        for (e, lho) in entries.iter().zip(&offsets) {
            let flags: u16 = if e.utf8_flag { 1 << 11 } else { 0 };
            let external_attrs: u32 = if e.is_dir { 0x10 } else { 0 };
            out.extend_from_slice(&0x02014b50u32.to_le_bytes());
            out.extend_from_slice(&20u16.to_le_bytes()); // version made by
            out.extend_from_slice(&20u16.to_le_bytes()); // version needed
            out.extend_from_slice(&flags.to_le_bytes());
            out.extend_from_slice(&e.method.to_le_bytes());
            out.extend_from_slice(&FIXTURE_DOS_TIME.to_le_bytes());
            out.extend_from_slice(&FIXTURE_DOS_DATE.to_le_bytes());
            out.extend_from_slice(&0u32.to_le_bytes()); // crc32
            out.extend_from_slice(&(e.data.len() as u32).to_le_bytes());
            out.extend_from_slice(&(e.uncompressed_size as u32).to_le_bytes());
            out.extend_from_slice(&(e.name_bytes.len() as u16).to_le_bytes());
            out.extend_from_slice(&0u16.to_le_bytes()); // extra len
            out.extend_from_slice(&0u16.to_le_bytes()); // comment len
            out.extend_from_slice(&0u16.to_le_bytes()); // disk number start
            out.extend_from_slice(&0u16.to_le_bytes()); // internal attrs
            out.extend_from_slice(&external_attrs.to_le_bytes());
            out.extend_from_slice(&lho.to_le_bytes());
            out.extend_from_slice(&e.name_bytes);
        }
        let cd_size = out.len() as u32 - cd_offset;

        out.extend_from_slice(&0x06054b50u32.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes()); // disk number
        out.extend_from_slice(&0u16.to_le_bytes()); // cd start disk
        out.extend_from_slice(&(entries.len() as u16).to_le_bytes());
        out.extend_from_slice(&(entries.len() as u16).to_le_bytes());
        out.extend_from_slice(&cd_size.to_le_bytes());
        out.extend_from_slice(&cd_offset.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes()); // comment len

        std::fs::write(path, out)
    }
}
