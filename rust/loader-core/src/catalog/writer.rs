// rust/loader-core/src/catalog/writer.rs

//! Writer for indexed shard files.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use super::format::{encode_index, index_checksum, IndexEntry, ShardFooter};
use crate::error::{LoaderError, Result};

/// Summary of a finished shard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardSummary {
    pub path: PathBuf,
    pub sample_count: u64,
    pub data_bytes: u64,
    pub index_checksum: u64,
}

/// Builds an indexed shard file sample by sample.
///
/// Data goes to a hidden temp file next to the target, which is renamed
/// into place by [`ShardWriter::finish`]. Readers never observe a partial
/// shard, and dropping an unfinished writer leaves the target untouched.
pub struct ShardWriter {
    path: PathBuf,
    temp_path: PathBuf,
    out: Option<BufWriter<File>>,
    entries: Vec<IndexEntry>,
    data_bytes: u64,
}

impl ShardWriter {
    /// # Errors
    ///
    /// Returns an `Io` error if the parent directory or temp file cannot be
    /// created.
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| LoaderError::invalid_argument(format!("bad shard path {}", path.display())))?;

        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        if !dir.exists() {
            fs::create_dir_all(&dir)
                .map_err(|e| LoaderError::io_with_source(&dir, "failed to create parent directories", e))?;
        }

        let temp_path = dir.join(format!(".{file_name}.tmp"));
        let file = File::create(&temp_path)
            .map_err(|e| LoaderError::io_with_source(&temp_path, "failed to create temp shard", e))?;

        Ok(Self {
            path,
            temp_path,
            out: Some(BufWriter::new(file)),
            entries: Vec::new(),
            data_bytes: 0,
        })
    }

    /// Appends one sample and returns its index within the shard.
    pub fn append(&mut self, sample: &[u8]) -> Result<u64> {
        let out = self
            .out
            .as_mut()
            .ok_or_else(|| LoaderError::io(&self.temp_path, "writer already finished"))?;
        out.write_all(sample)
            .map_err(|e| LoaderError::io_with_source(&self.temp_path, "failed to write sample", e))?;

        self.entries
            .push(IndexEntry::new(self.data_bytes, sample.len() as u64));
        self.data_bytes += sample.len() as u64;
        Ok(self.entries.len() as u64 - 1)
    }

    pub fn sample_count(&self) -> u64 {
        self.entries.len() as u64
    }

    /// Writes the index and footer, syncs, and renames into place.
    pub fn finish(mut self) -> Result<ShardSummary> {
        let mut out = self
            .out
            .take()
            .ok_or_else(|| LoaderError::io(&self.temp_path, "writer already finished"))?;

        let index = encode_index(&self.entries);
        let checksum = index_checksum(&index);
        let footer = ShardFooter::new(self.data_bytes, self.entries.len() as u64, checksum);

        let write = |out: &mut BufWriter<File>| -> std::io::Result<()> {
            out.write_all(&index)?;
            out.write_all(&footer.to_bytes())?;
            out.flush()?;
            out.get_ref().sync_all()
        };
        write(&mut out)
            .map_err(|e| LoaderError::io_with_source(&self.temp_path, "failed to write shard index", e))?;
        drop(out);

        fs::rename(&self.temp_path, &self.path).map_err(|e| {
            LoaderError::io_with_source(&self.path, "failed to rename temp shard into place", e)
        })?;

        Ok(ShardSummary {
            path: self.path.clone(),
            sample_count: self.entries.len() as u64,
            data_bytes: self.data_bytes,
            index_checksum: checksum,
        })
    }
}

impl Drop for ShardWriter {
    fn drop(&mut self) {
        if self.out.take().is_some() {
            let _ = fs::remove_file(&self.temp_path);
        }
    }
}
