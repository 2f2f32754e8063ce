// rust/loader-core/src/storage/local.rs

//! Local filesystem shard handles.
//!
//! Small files are read with positional `pread`-style calls; large files can
//! be memory-mapped when enabled in [`StorageConfig`].

use std::fs::File;
use std::io;
use std::path::Path;

use bytes::Bytes;
use memmap2::Mmap;

use super::ShardReader;
use crate::config::StorageConfig;
use crate::error::{LoaderError, Result};

/// Opens a shard file, choosing mmap or positional reads from the config.
///
/// # Errors
///
/// Returns an `Io` error if the file cannot be opened, inspected or mapped.
pub fn open_shard_reader(path: &Path, config: &StorageConfig) -> Result<Box<dyn ShardReader>> {
    let file = File::open(path)
        .map_err(|e| LoaderError::io_with_source(path, "failed to open shard", e))?;
    let size = file
        .metadata()
        .map_err(|e| LoaderError::io_with_source(path, "failed to read shard metadata", e))?
        .len();

    // Use mmap for large files if enabled
    if config.use_mmap && size >= config.mmap_threshold && size > 0 {
        // SAFETY: The file is opened read-only and shard files are never
        // modified in place; the writer replaces them by rename.
        let mmap = unsafe { Mmap::map(&file) }
            .map_err(|e| LoaderError::io_with_source(path, "failed to memory-map shard", e))?;
        Ok(Box::new(MmapShardReader::new(mmap)))
    } else {
        Ok(Box::new(FileShardReader::new(file, size)))
    }
}

fn out_of_range(offset: u64, length: u64, size: u64) -> io::Error {
    io::Error::new(
        io::ErrorKind::UnexpectedEof,
        format!("range {offset}+{length} exceeds shard size {size}"),
    )
}

fn range_end(offset: u64, length: u64, size: u64) -> io::Result<u64> {
    match offset.checked_add(length) {
        Some(end) if end <= size => Ok(end),
        _ => Err(out_of_range(offset, length, size)),
    }
}

/// Shard handle backed by positional reads on an open file.
pub struct FileShardReader {
    file: File,
    size: u64,
}

impl FileShardReader {
    pub fn new(file: File, size: u64) -> Self {
        Self { file, size }
    }

    #[cfg(unix)]
    fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> io::Result<()> {
        use std::os::unix::fs::FileExt;
        self.file.read_exact_at(buf, offset)
    }

    #[cfg(windows)]
    fn read_exact_at(&self, mut buf: &mut [u8], mut offset: u64) -> io::Result<()> {
        use std::os::windows::fs::FileExt;
        while !buf.is_empty() {
            match self.file.seek_read(buf, offset) {
                Ok(0) => return Err(io::Error::from(io::ErrorKind::UnexpectedEof)),
                Ok(n) => {
                    buf = &mut buf[n..];
                    offset += n as u64;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

impl ShardReader for FileShardReader {
    fn len(&self) -> u64 {
        self.size
    }

    fn read_at(&self, offset: u64, length: u64) -> io::Result<Bytes> {
        range_end(offset, length, self.size)?;
        let length = usize::try_from(length)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "sample too large"))?;
        let mut buf = vec![0u8; length];
        self.read_exact_at(&mut buf, offset)?;
        Ok(Bytes::from(buf))
    }
}

/// Shard handle backed by a read-only memory map.
pub struct MmapShardReader {
    mmap: Mmap,
}

impl MmapShardReader {
    pub fn new(mmap: Mmap) -> Self {
        Self { mmap }
    }
}

impl ShardReader for MmapShardReader {
    fn len(&self) -> u64 {
        self.mmap.len() as u64
    }

    fn read_at(&self, offset: u64, length: u64) -> io::Result<Bytes> {
        let end = range_end(offset, length, self.len())?;
        Ok(Bytes::copy_from_slice(
            &self.mmap[offset as usize..end as usize],
        ))
    }
}
