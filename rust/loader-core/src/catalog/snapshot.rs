// rust/loader-core/src/catalog/snapshot.rs

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use chrono::{DateTime, Utc};

use super::format::IndexEntry;
use crate::config::ShardFormat;
use crate::storage::ShardReader;

/// Locator for one sample: shard id within its snapshot plus a byte range.
///
/// Never carries sample bytes; those are read only when a batch resolves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SampleRef {
    pub shard: u32,
    pub offset: u64,
    pub length: u64,
}

impl SampleRef {
    pub fn new(shard: u32, offset: u64, length: u64) -> Self {
        Self {
            shard,
            offset,
            length,
        }
    }
}

impl fmt::Display for SampleRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "shard {} [{}+{}]", self.shard, self.offset, self.length)
    }
}

/// Identity of a file on disk at scan time, used to decide whether a
/// rescan can keep an already-open handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileFingerprint {
    pub size: u64,
    pub modified: Option<SystemTime>,
}

/// A shard file and its sample index.
#[derive(Clone)]
pub struct Shard {
    pub id: u32,
    pub path: PathBuf,
    pub format: ShardFormat,
    pub fingerprint: FileFingerprint,
    pub(crate) reader: Arc<dyn ShardReader>,
    pub(crate) index: Arc<[IndexEntry]>,
}

impl fmt::Debug for Shard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Shard")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("format", &self.format)
            .field("samples", &self.index.len())
            .finish()
    }
}

impl Shard {
    /// Builds a shard over an already-open reader and a prepared index.
    ///
    /// Scans go through [`crate::catalog::Catalog`]; this is for callers
    /// that supply their own [`ShardReader`].
    pub fn from_reader(
        id: u32,
        path: impl Into<PathBuf>,
        reader: Arc<dyn ShardReader>,
        index: Vec<IndexEntry>,
    ) -> Self {
        Self {
            id,
            path: path.into(),
            format: ShardFormat::Indexed,
            fingerprint: FileFingerprint {
                size: reader.len(),
                modified: None,
            },
            reader,
            index: index.into(),
        }
    }

    pub fn sample_count(&self) -> u64 {
        self.index.len() as u64
    }

    pub fn reader(&self) -> &Arc<dyn ShardReader> {
        &self.reader
    }

    pub fn sample_ref(&self, index: usize) -> Option<SampleRef> {
        self.index
            .get(index)
            .map(|e| SampleRef::new(self.id, e.offset, e.length))
    }

    /// Same file and index under a different shard id.
    pub(crate) fn renumbered(&self, id: u32) -> Self {
        Self {
            id,
            ..self.clone()
        }
    }
}

/// Immutable view of a dataset's shards at one point in time.
///
/// Sessions hold an `Arc<Snapshot>`; shard handles close once the last
/// snapshot referencing them is dropped.
pub struct Snapshot {
    id: String,
    dataset_id: String,
    generation: u64,
    shards: Vec<Shard>,
    total_samples: u64,
    created_at: DateTime<Utc>,
}

impl fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Snapshot")
            .field("id", &self.id)
            .field("shards", &self.shards.len())
            .field("total_samples", &self.total_samples)
            .finish()
    }
}

impl Snapshot {
    pub fn new(dataset_id: impl Into<String>, generation: u64, shards: Vec<Shard>) -> Self {
        let dataset_id = dataset_id.into();
        let total_samples = shards.iter().map(Shard::sample_count).sum();
        Self {
            id: format!("{dataset_id}@{generation}"),
            dataset_id,
            generation,
            shards,
            total_samples,
            created_at: Utc::now(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn dataset_id(&self) -> &str {
        &self.dataset_id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn shards(&self) -> &[Shard] {
        &self.shards
    }

    pub fn shard(&self, id: u32) -> Option<&Shard> {
        self.shards.get(id as usize)
    }

    pub fn shard_path(&self, id: u32) -> &Path {
        self.shard(id)
            .map(|s| s.path.as_path())
            .unwrap_or_else(|| Path::new("<unknown shard>"))
    }

    pub fn total_samples(&self) -> u64 {
        self.total_samples
    }

    pub fn is_empty(&self) -> bool {
        self.total_samples == 0
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Every sample ref in shard order, then index order.
    pub fn sample_refs(&self) -> impl Iterator<Item = SampleRef> + '_ {
        self.shards
            .iter()
            .flat_map(|shard| (0..shard.index.len()).filter_map(move |i| shard.sample_ref(i)))
    }
}

impl Drop for Snapshot {
    fn drop(&mut self) {
        tracing::debug!("Retiring snapshot {} ({} shards)", self.id, self.shards.len());
    }
}

/// Position in a snapshot's source order.
///
/// `Copy` so a transaction can save and restore it cheaply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SourceCursor {
    shard: usize,
    sample: usize,
    consumed: u64,
}

impl SourceCursor {
    /// Number of refs handed out so far.
    pub fn consumed(&self) -> u64 {
        self.consumed
    }

    /// Next ref in source order, advancing the cursor.
    pub fn next(&mut self, snapshot: &Snapshot) -> Option<SampleRef> {
        while let Some(shard) = snapshot.shards.get(self.shard) {
            if let Some(sample) = shard.sample_ref(self.sample) {
                self.sample += 1;
                self.consumed += 1;
                return Some(sample);
            }
            self.shard += 1;
            self.sample = 0;
        }
        None
    }

    pub fn is_exhausted(&self, snapshot: &Snapshot) -> bool {
        self.consumed >= snapshot.total_samples
    }
}
