//! MAR index (`.idx`) framing.
//!
//! Layout, all integers big-endian:
//!
//! ```text
//! offset 0  : magic "MARI"
//! offset 4  : compressed payload length (u32)
//! offset 8  : decompressed payload length (u32)
//! offset 12 : zstd-compressed FileIndexFile protobuf
//! ```

use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use prost::Message;

use crate::proto;
use crate::{FormatError, Result};

pub const INDEX_MAGIC: &[u8; 4] = b"MARI";

/// Read and decode a `.idx` stream into its file index.
pub fn read_index_file<R: Read>(input: &mut R) -> Result<proto::FileIndexFile> {
    let mut magic = [0u8; 4];
    input.read_exact(&mut magic)?;
    if &magic != INDEX_MAGIC {
        return Err(FormatError::BadMagic(magic));
    }

    let mut word = [0u8; 4];
    input.read_exact(&mut word)?;
    let compressed_len = u32::from_be_bytes(word);
    input.read_exact(&mut word)?;
    let decompressed_len = u32::from_be_bytes(word);

    let mut compressed = vec![0u8; compressed_len as usize];
    input.read_exact(&mut compressed)?;

    let raw = zstd::decode_all(&compressed[..])?;
    if raw.len() != decompressed_len as usize {
        return Err(FormatError::IndexLength {
            expected: decompressed_len as u64,
            actual: raw.len() as u64,
        });
    }

    Ok(proto::FileIndexFile::decode(&raw[..])?)
}

/// Path of the data shard holding a file's chunk run.
///
/// `archive` is the archive path as given on the command line (ending in
/// `.mar`); shard 0 is `<archive>.dat`, shard N is `<archive>.<N>.dat`.
pub fn dat_path(archive: &Path, file_index: u32) -> PathBuf {
    let mut name = archive.as_os_str().to_os_string();
    if file_index == 0 {
        name.push(".dat");
    } else {
        name.push(format!(".{file_index}.dat"));
    }
    PathBuf::from(name)
}

impl proto::FileInfo {
    /// Logical (decompressed) file size: the sum of chunk original lengths.
    pub fn total_size(&self) -> u64 {
        self.chunks.iter().map(|c| c.original_length as u64).sum()
    }

    /// Modification time as a `SystemTime`; missing or pre-epoch timestamps
    /// clamp to the epoch.
    pub fn modified(&self) -> SystemTime {
        match &self.modified_time {
            Some(ts) if ts.seconds >= 0 => {
                UNIX_EPOCH + Duration::new(ts.seconds as u64, ts.nanos.max(0) as u32)
            }
            _ => UNIX_EPOCH,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_bad_magic() {
        let data = b"NOPE\x00\x00\x00\x00\x00\x00\x00\x00";
        match read_index_file(&mut &data[..]) {
            Err(FormatError::BadMagic(m)) => assert_eq!(&m, b"NOPE"),
            other => panic!("expected BadMagic, got {other:?}"),
        }
    }

    #[test]
    fn rejects_truncated_payload() {
        let mut data = Vec::new();
        data.extend_from_slice(INDEX_MAGIC);
        data.extend_from_slice(&100u32.to_be_bytes());
        data.extend_from_slice(&100u32.to_be_bytes());
        data.extend_from_slice(&[0u8; 10]);
        assert!(matches!(
            read_index_file(&mut &data[..]),
            Err(FormatError::Io(_))
        ));
    }

    #[test]
    fn roundtrips_through_testing_writer() {
        let index = proto::FileIndexFile {
            entries: vec![proto::FileEntry {
                info: Some(proto::FileInfo {
                    path: "/a/b.txt".to_string(),
                    chunks: vec![proto::ChunkInfo {
                        compressed_length: 5,
                        original_length: 5,
                        compressed_method: proto::CompressedMethod::Passthrough as i32,
                    }],
                    ..Default::default()
                }),
                file_index: 0,
                body_offset: 0,
                body_size: 5,
            }],
        };

        let mut buf = Vec::new();
        crate::testing::write_index_file(&index, &mut buf).unwrap();
        let decoded = read_index_file(&mut &buf[..]).unwrap();
        assert_eq!(decoded, index);
        assert_eq!(decoded.entries[0].info.as_ref().unwrap().total_size(), 5);
    }

    #[test]
    fn dat_path_shards() {
        assert_eq!(
            dat_path(Path::new("/data/game.mar"), 0),
            PathBuf::from("/data/game.mar.dat")
        );
        assert_eq!(
            dat_path(Path::new("/data/game.mar"), 3),
            PathBuf::from("/data/game.mar.3.dat")
        );
    }
}
