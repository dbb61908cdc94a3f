//! Minimal ZIP central-directory parser.
//!
//! Only the End of Central Directory record (plus ZIP64 variants) and the
//! central directory itself are read, in a single pass near the end of the
//! file, so opening a multi-gigabyte archive costs one mmap and one scan
//! rather than a seek per entry. Payload data offsets are resolved eagerly from each
//! local file header while the map is live; after `read_central_directory`
//! returns, nothing holds the archive open.

use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use memmap2::Mmap;

use crate::{FormatError, Result};

/// Compression method "stored" (no compression).
pub const METHOD_STORED: u16 = 0;
/// Compression method "deflate".
pub const METHOD_DEFLATE: u16 = 8;

/// One central-directory entry with its payload location resolved.
///
/// `name_bytes` is raw: when `utf8_flag` is clear the bytes are in an
/// archive-dependent legacy encoding and the caller decides how to decode
/// them.
#[derive(Debug, Clone)]
pub struct ZipEntryRecord {
    pub name_bytes: Vec<u8>,
    pub utf8_flag: bool,
    pub method: u16,
    pub compressed_size: u64,
    pub uncompressed_size: u64,
    /// Absolute offset of the payload bytes (past the local file header).
    pub data_offset: u64,
    pub modified: SystemTime,
    pub is_dir: bool,
}

const EOCD_SIG: u32 = 0x06054b50;
const EOCD64_LOC_SIG: u32 = 0x07064b50;
const EOCD64_SIG: u32 = 0x06064b50;
const CD_SIG: u32 = 0x02014b50;
const LOCAL_SIG: u32 = 0x04034b50;

#[inline]
fn r16(d: &[u8], o: usize) -> u16 {
    u16::from_le_bytes([d[o], d[o + 1]])
}

#[inline]
fn r32(d: &[u8], o: usize) -> u32 {
    u32::from_le_bytes([d[o], d[o + 1], d[o + 2], d[o + 3]])
}

#[inline]
fn r64(d: &[u8], o: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&d[o..o + 8]);
    u64::from_le_bytes(b)
}

/// Parse the central directory of a ZIP file.
pub fn read_central_directory(path: &Path) -> Result<Vec<ZipEntryRecord>> {
    let file = std::fs::File::open(path)?;
    // SAFETY: read-only map; the archive is treated as immutable input.
    let mmap = unsafe { Mmap::map(&file)? };
    let data = &mmap[..];

    if data.len() < 22 {
        return Err(FormatError::Zip("file too small".to_string()));
    }

    let eocd_pos =
        find_eocd(data).ok_or_else(|| FormatError::Zip("EOCD record not found".to_string()))?;
    let (num_entries, cd_offset) = parse_eocd(data, eocd_pos);

    parse_cd(data, cd_offset as usize, num_entries as usize)
}

/// Scan backwards from the end of the file for the EOCD signature (it may be
/// preceded by a trailing comment of up to 64 KiB).
fn find_eocd(data: &[u8]) -> Option<usize> {
    let search_len = std::cmp::min(data.len(), 22 + 65535);
    let start = data.len() - search_len;
    (start..=data.len().saturating_sub(22))
        .rev()
        .find(|&i| r32(data, i) == EOCD_SIG)
}

/// Returns `(num_entries, cd_offset)`, preferring the ZIP64 record if one is
/// present.
fn parse_eocd(data: &[u8], eocd_pos: usize) -> (u64, u64) {
    let num16 = r16(data, eocd_pos + 10) as u64;
    let off32 = r32(data, eocd_pos + 16) as u64;

    if eocd_pos >= 20 {
        let loc = eocd_pos - 20;
        if r32(data, loc) == EOCD64_LOC_SIG {
            let eocd64_off = r64(data, loc + 8) as usize;
            if eocd64_off + 56 <= data.len() && r32(data, eocd64_off) == EOCD64_SIG {
                return (r64(data, eocd64_off + 32), r64(data, eocd64_off + 48));
            }
        }
    }

    (num16, off32)
}

fn parse_cd(data: &[u8], cd_offset: usize, num_entries: usize) -> Result<Vec<ZipEntryRecord>> {
    let mut entries = Vec::with_capacity(num_entries);
    let mut pos = cd_offset;

    for _ in 0..num_entries {
        if pos + 46 > data.len() || r32(data, pos) != CD_SIG {
            break;
        }

        let flags = r16(data, pos + 8);
        let method = r16(data, pos + 10);
        let mod_time = r16(data, pos + 12);
        let mod_date = r16(data, pos + 14);
        let c32 = r32(data, pos + 20) as u64;
        let u32_ = r32(data, pos + 24) as u64;
        let name_len = r16(data, pos + 28) as usize;
        let extra_len = r16(data, pos + 30) as usize;
        let comment_len = r16(data, pos + 32) as usize;
        let external_attrs = r32(data, pos + 38);
        let off32 = r32(data, pos + 42) as u64;

        let name_end = pos + 46 + name_len;
        if name_end > data.len() {
            break;
        }
        let name_bytes = data[pos + 46..name_end].to_vec();

        let mut compressed_size = c32;
        let mut uncompressed_size = u32_;
        let mut local_header_offset = off32;
        if c32 == 0xFFFF_FFFF || u32_ == 0xFFFF_FFFF || off32 == 0xFFFF_FFFF {
            let extra_end = name_end + extra_len;
            if extra_end <= data.len() {
                read_zip64_extra(
                    &data[name_end..extra_end],
                    &mut uncompressed_size,
                    &mut compressed_size,
                    &mut local_header_offset,
                );
            }
        }

        let data_offset = resolve_data_offset(data, local_header_offset)?;
        let is_dir = name_bytes.ends_with(b"/") || external_attrs & 0x10 != 0;

        entries.push(ZipEntryRecord {
            name_bytes,
            utf8_flag: flags & (1 << 11) != 0,
            method,
            compressed_size,
            uncompressed_size,
            data_offset,
            modified: dos_datetime(mod_date, mod_time),
            is_dir,
        });

        pos = name_end + extra_len + comment_len;
    }

    Ok(entries)
}

/// Payload starts past the local file header; its name/extra lengths may
/// differ from the central directory's copy, so they are read from the local
/// header itself.
fn resolve_data_offset(data: &[u8], local_header_offset: u64) -> Result<u64> {
    let lh = local_header_offset as usize;
    if lh + 30 > data.len() {
        return Err(FormatError::Zip("local header offset out of bounds".to_string()));
    }
    if r32(data, lh) != LOCAL_SIG {
        return Err(FormatError::Zip("bad local file header signature".to_string()));
    }
    let name_len = r16(data, lh + 26) as u64;
    let extra_len = r16(data, lh + 28) as u64;
    Ok(local_header_offset + 30 + name_len + extra_len)
}

fn read_zip64_extra(extra: &[u8], uncompressed: &mut u64, compressed: &mut u64, offset: &mut u64) {
    let mut p = 0;
    while p + 4 <= extra.len() {
        let id = r16(extra, p);
        let sz = r16(extra, p + 2) as usize;
        if id == 0x0001 {
            let mut fp = p + 4;
            for field in [&mut *uncompressed, &mut *compressed, &mut *offset] {
                if *field == 0xFFFF_FFFF && fp + 8 <= p + 4 + sz {
                    *field = r64(extra, fp);
                    fp += 8;
                }
            }
            break;
        }
        p += 4 + sz;
    }
}

/// MS-DOS date/time to `SystemTime`; invalid fields clamp to the epoch.
fn dos_datetime(date: u16, time: u16) -> SystemTime {
    let year = 1980 + ((date >> 9) & 0x7f) as i32;
    let month = ((date >> 5) & 0xf) as u32;
    let day = (date & 0x1f) as u32;
    let hour = ((time >> 11) & 0x1f) as u32;
    let minute = ((time >> 5) & 0x3f) as u32;
    let second = ((time & 0x1f) * 2) as u32;

    let secs = chrono::NaiveDate::from_ymd_opt(year, month, day)
        .and_then(|d| d.and_hms_opt(hour, minute, second))
        .map(|dt| dt.and_utc().timestamp())
        .unwrap_or(0);
    if secs <= 0 {
        return UNIX_EPOCH;
    }
    UNIX_EPOCH + Duration::from_secs(secs as u64)
}
