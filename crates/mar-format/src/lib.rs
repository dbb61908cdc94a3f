//! # mar-format
//!
//! Wire-format layer for Mayakashi archives.
//!
//! A MAR archive is an index file (`<name>.mar.idx`) plus one or more data
//! shards (`<name>.mar.dat`, `<name>.mar.<N>.dat`). The index is a
//! zstd-compressed protobuf message describing every file as an ordered run
//! of independently compressed chunks; the shards are opaque blobs of chunk
//! payloads.
//!
//! This crate owns:
//! - the protobuf schema (`proto`, checked-in prost definitions),
//! - the `.idx` framing reader (`index`),
//! - the per-chunk decompression codec (`codec`),
//! - a minimal ZIP central-directory parser (`zip`) for the convenience
//!   ZIP-mount path,
//! - fixture builders for tests (`testing`).

pub mod codec;
pub mod index;
pub mod proto;
pub mod testing;
pub mod zip;

use std::io;

use thiserror::Error;

/// Errors that can occur while reading archive metadata or chunk payloads.
#[derive(Error, Debug)]
pub enum FormatError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("bad index magic {0:?} (expected \"MARI\")")]
    BadMagic([u8; 4]),

    #[error("index payload length mismatch: header says {expected}, got {actual}")]
    IndexLength { expected: u64, actual: u64 },

    #[error("index decode error: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("chunk decompressed to {actual} bytes, expected {expected}")]
    ChunkLength { expected: u32, actual: usize },

    #[error("not a ZIP archive: {0}")]
    Zip(String),
}

pub type Result<T> = std::result::Result<T, FormatError>;
