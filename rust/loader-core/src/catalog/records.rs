// rust/loader-core/src/catalog/records.rs

//! Record layouts a shard file can use, and how to index each of them.

use std::path::Path;

use bytes::Bytes;

use super::format::{read_index, IndexEntry};
use crate::config::ShardFormat;
use crate::error::{LoaderError, Result};
use crate::storage::ShardReader;

// Bytes fetched per read while walking a record stream.
const WALK_WINDOW: u64 = 1024 * 1024;

/// Describes how to find sample boundaries in a shard file.
pub trait RecordFormat: Send + Sync {
    /// Builds the `(offset, length)` index of every sample in the file.
    fn index(&self, path: &Path, reader: &dyn ShardReader) -> Result<Vec<IndexEntry>>;

    /// Name of this record format
    fn name(&self) -> &'static str;
}

/// Shards carrying their own index table and footer.
#[derive(Debug, Clone, Default)]
pub struct IndexedFormat;

impl RecordFormat for IndexedFormat {
    fn index(&self, path: &Path, reader: &dyn ShardReader) -> Result<Vec<IndexEntry>> {
        read_index(path, reader)
    }

    fn name(&self) -> &'static str {
        "indexed"
    }
}

/// `[u32 LE size][payload]` records back to back.
#[derive(Debug, Clone, Default)]
pub struct LengthPrefixedFormat;

impl RecordFormat for LengthPrefixedFormat {
    fn index(&self, path: &Path, reader: &dyn ShardReader) -> Result<Vec<IndexEntry>> {
        let file_len = reader.len();
        let mut window = Window::default();
        let mut entries = Vec::new();
        let mut pos = 0u64;

        while pos < file_len {
            if file_len - pos < 4 {
                return Err(LoaderError::corrupt_index(
                    path,
                    format!("truncated length prefix at offset {pos}"),
                ));
            }
            let prefix = window.slice(path, reader, pos, 4)?;
            let size = u32::from_le_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as u64;

            let start = pos + 4;
            if size > file_len - start {
                return Err(LoaderError::corrupt_index(
                    path,
                    format!("record at offset {pos} claims {size} bytes, only {} remain", file_len - start),
                ));
            }
            entries.push(IndexEntry::new(start, size));
            pos = start + size;
        }

        Ok(entries)
    }

    fn name(&self) -> &'static str {
        "length-prefixed"
    }
}

/// One sample per line. The newline is not part of the sample and blank
/// lines are skipped.
#[derive(Debug, Clone, Default)]
pub struct NewlineDelimitedFormat;

impl RecordFormat for NewlineDelimitedFormat {
    fn index(&self, path: &Path, reader: &dyn ShardReader) -> Result<Vec<IndexEntry>> {
        let file_len = reader.len();
        let mut entries = Vec::new();
        let mut line_start = 0u64;
        let mut pos = 0u64;

        while pos < file_len {
            let len = WALK_WINDOW.min(file_len - pos);
            let chunk = reader
                .read_at(pos, len)
                .map_err(|e| LoaderError::io_with_source(path, "failed to read shard", e))?;

            for (i, byte) in chunk.iter().enumerate() {
                if *byte == b'\n' {
                    let end = pos + i as u64;
                    if end > line_start {
                        entries.push(IndexEntry::new(line_start, end - line_start));
                    }
                    line_start = end + 1;
                }
            }
            pos += len;
        }

        // Final line without a trailing newline
        if file_len > line_start {
            entries.push(IndexEntry::new(line_start, file_len - line_start));
        }

        Ok(entries)
    }

    fn name(&self) -> &'static str {
        "newline-delimited"
    }
}

impl ShardFormat {
    /// Picks a concrete format from a file extension.
    pub fn from_extension(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "shard" => Some(Self::Indexed),
            "protos" | "pb" | "lp" => Some(Self::LengthPrefixed),
            "jsonl" | "txt" => Some(Self::Newline),
            _ => None,
        }
    }

    /// Resolves `Auto` for a specific file. `None` means the file is not a
    /// recognised shard.
    pub fn resolve(self, path: &Path) -> Option<Self> {
        match self {
            Self::Auto => Self::from_extension(path),
            concrete => Some(concrete),
        }
    }

    /// The record layout for a concrete format.
    pub fn record_format(self, path: &Path) -> Option<Box<dyn RecordFormat>> {
        match self.resolve(path)? {
            Self::Indexed => Some(Box::new(IndexedFormat)),
            Self::LengthPrefixed => Some(Box::new(LengthPrefixedFormat)),
            Self::Newline => Some(Box::new(NewlineDelimitedFormat)),
            Self::Auto => None,
        }
    }
}

/// A cached read window so that walking small headers doesn't cost one
/// read per record.
#[derive(Default)]
struct Window {
    start: u64,
    data: Bytes,
}

impl Window {
    fn slice(
        &mut self,
        path: &Path,
        reader: &dyn ShardReader,
        offset: u64,
        len: u64,
    ) -> Result<&[u8]> {
        let end = offset + len;
        let cached_end = self.start + self.data.len() as u64;
        if offset < self.start || end > cached_end {
            let read_len = WALK_WINDOW.max(len).min(reader.len() - offset);
            self.data = reader
                .read_at(offset, read_len)
                .map_err(|e| LoaderError::io_with_source(path, "failed to read shard", e))?;
            self.start = offset;
        }
        let from = (offset - self.start) as usize;
        Ok(&self.data[from..from + len as usize])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::FileShardReader;
    use std::fs::File;
    use tempfile::TempDir;

    fn index_bytes(format: &dyn RecordFormat, bytes: &[u8]) -> Result<Vec<IndexEntry>> {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("records");
        std::fs::write(&path, bytes).unwrap();
        let reader = FileShardReader::new(File::open(&path).unwrap(), bytes.len() as u64);
        format.index(&path, &reader)
    }

    fn length_prefixed(records: &[&[u8]]) -> Vec<u8> {
        let mut bytes = Vec::new();
        for record in records {
            bytes.extend_from_slice(&(record.len() as u32).to_le_bytes());
            bytes.extend_from_slice(record);
        }
        bytes
    }

    #[test]
    fn test_length_prefixed_index() {
        let bytes = length_prefixed(&[b"first", b"", b"third!"]);
        let entries = index_bytes(&LengthPrefixedFormat, &bytes).unwrap();
        assert_eq!(
            entries,
            vec![
                IndexEntry::new(4, 5),
                IndexEntry::new(13, 0),
                IndexEntry::new(17, 6)
            ]
        );
    }

    #[test]
    fn test_length_prefixed_truncated_payload() {
        let mut bytes = length_prefixed(&[b"first"]);
        bytes.extend_from_slice(&100u32.to_le_bytes());
        bytes.extend_from_slice(b"short");
        let err = index_bytes(&LengthPrefixedFormat, &bytes).unwrap_err();
        assert!(matches!(err, LoaderError::CorruptIndex { .. }));
    }

    #[test]
    fn test_length_prefixed_truncated_prefix() {
        let mut bytes = length_prefixed(&[b"first"]);
        bytes.extend_from_slice(&[1, 0]);
        let err = index_bytes(&LengthPrefixedFormat, &bytes).unwrap_err();
        assert!(err.to_string().contains("truncated length prefix"));
    }

    #[test]
    fn test_length_prefixed_spans_windows() {
        let big = vec![1u8; WALK_WINDOW as usize + 10];
        let bytes = length_prefixed(&[b"a", &big, b"b"]);
        let entries = index_bytes(&LengthPrefixedFormat, &bytes).unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[2].length, 1);
        assert_eq!(entries[2].offset, bytes.len() as u64 - 1);
    }

    #[test]
    fn test_newline_index() {
        let entries = index_bytes(&NewlineDelimitedFormat, b"{\"a\":1}\n\n{\"b\":2}\nlast").unwrap();
        assert_eq!(
            entries,
            vec![
                IndexEntry::new(0, 7),
                IndexEntry::new(9, 7),
                IndexEntry::new(17, 4)
            ]
        );
    }

    #[test]
    fn test_newline_empty_file() {
        assert!(index_bytes(&NewlineDelimitedFormat, b"").unwrap().is_empty());
        assert!(index_bytes(&NewlineDelimitedFormat, b"\n\n").unwrap().is_empty());
    }

    #[test]
    fn test_format_from_extension() {
        assert_eq!(
            ShardFormat::from_extension(Path::new("a/b.SHARD")),
            Some(ShardFormat::Indexed)
        );
        assert_eq!(
            ShardFormat::from_extension(Path::new("train.protos")),
            Some(ShardFormat::LengthPrefixed)
        );
        assert_eq!(
            ShardFormat::from_extension(Path::new("x.jsonl")),
            Some(ShardFormat::Newline)
        );
        assert_eq!(ShardFormat::from_extension(Path::new("README.md")), None);
        assert_eq!(
            ShardFormat::Newline.resolve(Path::new("README.md")),
            Some(ShardFormat::Newline)
        );
    }
}
