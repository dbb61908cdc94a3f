//! Protobuf types for the MAR index payload.
//!
//! Hand-maintained prost definitions kept in sync with the builder's
//! `mayakashi.proto` schema; tags are wire-stable and must not change.

/// Root message of a decompressed `.idx` payload.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FileIndexFile {
    #[prost(message, repeated, tag = "1")]
    pub entries: ::prost::alloc::vec::Vec<FileEntry>,
}

/// One archived file: metadata plus the location of its chunk run inside a
/// data shard.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FileEntry {
    #[prost(message, optional, tag = "1")]
    pub info: ::core::option::Option<FileInfo>,
    /// Which data shard holds the body: 0 = `<name>.mar.dat`,
    /// N = `<name>.mar.<N>.dat`.
    #[prost(uint32, tag = "2")]
    pub file_index: u32,
    #[prost(uint64, tag = "5")]
    pub body_offset: u64,
    #[prost(uint64, tag = "6")]
    pub body_size: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FileInfo {
    #[prost(string, tag = "1")]
    pub path: ::prost::alloc::string::String,
    #[prost(message, repeated, tag = "2")]
    pub chunks: ::prost::alloc::vec::Vec<ChunkInfo>,
    #[prost(uint32, tag = "5")]
    pub chunks_crc32: u32,
    #[prost(uint32, tag = "6")]
    pub original_crc32: u32,
    #[prost(bytes = "vec", tag = "7")]
    pub chunks_sha256: ::prost::alloc::vec::Vec<u8>,
    #[prost(bytes = "vec", tag = "8")]
    pub original_sha256: ::prost::alloc::vec::Vec<u8>,
    #[prost(message, optional, tag = "9")]
    pub modified_time: ::core::option::Option<::prost_types::Timestamp>,
    #[prost(int32, tag = "12")]
    pub priority: i32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ChunkInfo {
    #[prost(uint32, tag = "1")]
    pub compressed_length: u32,
    #[prost(uint32, tag = "2")]
    pub original_length: u32,
    #[prost(enumeration = "CompressedMethod", tag = "3")]
    pub compressed_method: i32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum CompressedMethod {
    Passthrough = 0,
    Zstandard = 1,
    Lz4 = 2,
}

impl CompressedMethod {
    /// String value of the enum field names used in the ProtoBuf definition.
    pub fn as_str_name(&self) -> &'static str {
        match self {
            CompressedMethod::Passthrough => "PASSTHROUGH",
            CompressedMethod::Zstandard => "ZSTANDARD",
            CompressedMethod::Lz4 => "LZ4",
        }
    }
}
