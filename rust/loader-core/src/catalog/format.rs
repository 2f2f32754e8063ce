// rust/loader-core/src/catalog/format.rs

//! Indexed shard file format.
//!
//! ## Format Layout
//!
//! ```text
//! +------------------------------+
//! | Sample payloads, contiguous  |  <- 0 .. index_offset
//! +------------------------------+
//! | Index entries                |  <- sample_count x 16 bytes
//! |   offset u64 LE              |
//! |   length u64 LE              |
//! +------------------------------+
//! | Footer (32 bytes)            |
//! |   index_offset   u64 LE      |
//! |   sample_count   u64 LE      |
//! |   index_checksum u64 LE      |  <- XXH64 of the index bytes, seed 0
//! |   version        u32 LE      |
//! |   magic "SLDX"               |
//! +------------------------------+
//! ```
//!
//! ## Reading Strategy
//!
//! 1. Read the last 32 bytes and check magic and version
//! 2. Check that index and footer exactly fill the tail of the file
//! 3. Read the index, verify its checksum, then bounds-check every entry

use std::hash::Hasher;
use std::path::Path;

use twox_hash::XxHash64;

use crate::error::{LoaderError, Result};
use crate::storage::ShardReader;

/// Magic bytes closing every indexed shard file.
pub const SHARD_MAGIC: [u8; 4] = *b"SLDX";

/// Current footer version.
pub const SHARD_VERSION: u32 = 1;

/// Footer size in bytes.
pub const FOOTER_SIZE: u64 = 32;

/// Size of one index entry in bytes.
pub const INDEX_ENTRY_SIZE: u64 = 16;

/// Location of one sample inside its shard file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    pub offset: u64,
    pub length: u64,
}

impl IndexEntry {
    pub fn new(offset: u64, length: u64) -> Self {
        Self { offset, length }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardFooter {
    pub index_offset: u64,
    pub sample_count: u64,
    pub index_checksum: u64,
    pub version: u32,
    pub magic: [u8; 4],
}

impl ShardFooter {
    pub fn new(index_offset: u64, sample_count: u64, index_checksum: u64) -> Self {
        Self {
            index_offset,
            sample_count,
            index_checksum,
            version: SHARD_VERSION,
            magic: SHARD_MAGIC,
        }
    }

    pub fn to_bytes(&self) -> [u8; FOOTER_SIZE as usize] {
        let mut bytes = [0u8; FOOTER_SIZE as usize];
        bytes[0..8].copy_from_slice(&self.index_offset.to_le_bytes());
        bytes[8..16].copy_from_slice(&self.sample_count.to_le_bytes());
        bytes[16..24].copy_from_slice(&self.index_checksum.to_le_bytes());
        bytes[24..28].copy_from_slice(&self.version.to_le_bytes());
        bytes[28..32].copy_from_slice(&self.magic);
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < FOOTER_SIZE as usize {
            return None;
        }

        let mut magic = [0u8; 4];
        magic.copy_from_slice(&bytes[28..32]);

        Some(Self {
            index_offset: read_u64(&bytes[0..8]),
            sample_count: read_u64(&bytes[8..16]),
            index_checksum: read_u64(&bytes[16..24]),
            version: u32::from_le_bytes([bytes[24], bytes[25], bytes[26], bytes[27]]),
            magic,
        })
    }
}

fn read_u64(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[..8]);
    u64::from_le_bytes(buf)
}

/// XXH64 (seed 0) of serialized index bytes.
pub fn index_checksum(index_bytes: &[u8]) -> u64 {
    let mut hasher = XxHash64::with_seed(0);
    hasher.write(index_bytes);
    hasher.finish()
}

pub fn encode_index(entries: &[IndexEntry]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(entries.len() * INDEX_ENTRY_SIZE as usize);
    for entry in entries {
        bytes.extend_from_slice(&entry.offset.to_le_bytes());
        bytes.extend_from_slice(&entry.length.to_le_bytes());
    }
    bytes
}

/// Reads and validates the index of an indexed shard.
///
/// # Errors
///
/// Returns `CorruptIndex` when the footer is malformed, the checksum does not
/// match, or any entry points outside the data region. Read failures are
/// reported as `Io`.
pub fn read_index(path: &Path, reader: &dyn ShardReader) -> Result<Vec<IndexEntry>> {
    let file_len = reader.len();
    if file_len < FOOTER_SIZE {
        return Err(LoaderError::corrupt_index(
            path,
            format!("file is {file_len} bytes, smaller than the {FOOTER_SIZE}-byte footer"),
        ));
    }

    let footer_bytes = reader
        .read_at(file_len - FOOTER_SIZE, FOOTER_SIZE)
        .map_err(|e| LoaderError::io_with_source(path, "failed to read shard footer", e))?;
    let footer = ShardFooter::from_bytes(&footer_bytes)
        .ok_or_else(|| LoaderError::corrupt_index(path, "truncated footer"))?;

    if footer.magic != SHARD_MAGIC {
        return Err(LoaderError::corrupt_index(path, "bad magic"));
    }
    if footer.version != SHARD_VERSION {
        return Err(LoaderError::corrupt_index(
            path,
            format!("unsupported version {}", footer.version),
        ));
    }

    let index_len = footer
        .sample_count
        .checked_mul(INDEX_ENTRY_SIZE)
        .ok_or_else(|| LoaderError::corrupt_index(path, "sample count overflows"))?;
    let expected_len = footer
        .index_offset
        .checked_add(index_len)
        .and_then(|n| n.checked_add(FOOTER_SIZE))
        .ok_or_else(|| LoaderError::corrupt_index(path, "index offset overflows"))?;
    if expected_len != file_len {
        return Err(LoaderError::corrupt_index(
            path,
            format!(
                "index at {} with {} entries implies {expected_len} bytes, file has {file_len}",
                footer.index_offset, footer.sample_count
            ),
        ));
    }

    let index_bytes = reader
        .read_at(footer.index_offset, index_len)
        .map_err(|e| LoaderError::io_with_source(path, "failed to read shard index", e))?;
    if index_checksum(&index_bytes) != footer.index_checksum {
        return Err(LoaderError::corrupt_index(path, "index checksum mismatch"));
    }

    let mut entries = Vec::with_capacity(footer.sample_count as usize);
    for (i, chunk) in index_bytes.chunks_exact(INDEX_ENTRY_SIZE as usize).enumerate() {
        let entry = IndexEntry::new(read_u64(&chunk[0..8]), read_u64(&chunk[8..16]));
        match entry.offset.checked_add(entry.length) {
            Some(end) if end <= footer.index_offset => entries.push(entry),
            _ => {
                return Err(LoaderError::corrupt_index(
                    path,
                    format!(
                        "entry {i} ({}+{}) overflows data region of {} bytes",
                        entry.offset, entry.length, footer.index_offset
                    ),
                ))
            }
        }
    }

    Ok(entries)
}
