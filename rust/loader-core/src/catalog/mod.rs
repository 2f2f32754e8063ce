// rust/loader-core/src/catalog/mod.rs

//! Shard Catalog.
//!
//! Discovers shard files for each configured dataset and publishes an
//! immutable [`Snapshot`] of them. A rescan builds a fresh snapshot and
//! swaps the dataset's current pointer atomically; sessions bound to an
//! older snapshot keep reading from it until they let go.
//!
//! # Example
//!
//! ```no_run
//! use loader_core::catalog::Catalog;
//! use loader_core::config::{DatasetConfig, StorageConfig};
//!
//! let catalog = Catalog::new(
//!     vec![DatasetConfig::new("libritts", "/data/libritts")],
//!     StorageConfig::default(),
//! );
//! catalog.scan_all().unwrap();
//! let snapshot = catalog.current("libritts").unwrap();
//! println!("{} samples", snapshot.total_samples());
//! ```

pub mod format;
mod records;
mod scan;
mod snapshot;
mod writer;

pub use format::IndexEntry;
pub use records::{IndexedFormat, LengthPrefixedFormat, NewlineDelimitedFormat, RecordFormat};
pub use scan::scan;
pub use snapshot::{FileFingerprint, SampleRef, Shard, Snapshot, SourceCursor};
pub use writer::{ShardSummary, ShardWriter};

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, Weak};

use arc_swap::ArcSwapOption;

use crate::config::{DatasetConfig, LoaderConfig, StorageConfig};
use crate::error::{LoaderError, Result};

struct DatasetEntry {
    config: DatasetConfig,
    current: ArcSwapOption<Snapshot>,
    // Every snapshot ever published for this dataset, pruned when dead
    published: Mutex<Vec<Weak<Snapshot>>>,
    // Serializes rescans of the same dataset
    rescan_lock: Mutex<()>,
}

/// Registry of datasets and their current snapshots.
pub struct Catalog {
    storage: StorageConfig,
    datasets: HashMap<String, DatasetEntry>,
}

impl Catalog {
    pub fn new(datasets: Vec<DatasetConfig>, storage: StorageConfig) -> Self {
        let datasets = datasets
            .into_iter()
            .map(|config| {
                let entry = DatasetEntry {
                    config,
                    current: ArcSwapOption::empty(),
                    published: Mutex::new(Vec::new()),
                    rescan_lock: Mutex::new(()),
                };
                (entry.config.id.clone(), entry)
            })
            .collect();

        Self { storage, datasets }
    }

    pub fn from_config(config: &LoaderConfig) -> Self {
        Self::new(config.datasets.clone(), config.storage.clone())
    }

    /// Builds the first snapshot of every dataset.
    ///
    /// # Errors
    ///
    /// Fails on the first dataset that can't be scanned.
    pub fn scan_all(&self) -> Result<Vec<Arc<Snapshot>>> {
        self.dataset_ids()
            .iter()
            .map(|id| self.rescan(id))
            .collect()
    }

    /// Scans a dataset again and publishes the result as its current
    /// snapshot. Sessions bound to earlier snapshots are unaffected.
    ///
    /// # Errors
    ///
    /// Returns `DatasetNotFound` for an unknown id. Scan failures leave the
    /// previous snapshot in place.
    pub fn rescan(&self, dataset_id: &str) -> Result<Arc<Snapshot>> {
        let entry = self.entry(dataset_id)?;
        let _guard = entry
            .rescan_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let previous = entry.current.load_full();
        let generation = previous.as_ref().map_or(1, |s| s.generation() + 1);

        tracing::info!(
            "Scanning dataset {} at {} (generation {})",
            dataset_id,
            entry.config.path.display(),
            generation
        );
        let snapshot = Arc::new(scan::scan_dataset(
            &entry.config,
            &self.storage,
            generation,
            previous.as_deref(),
        )?);

        entry.current.store(Some(Arc::clone(&snapshot)));
        {
            let mut published = entry
                .published
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            published.retain(|weak| weak.strong_count() > 0);
            published.push(Arc::downgrade(&snapshot));
        }

        match previous {
            Some(previous) => tracing::info!(
                "Published snapshot {} ({} shards, {} samples), replacing {}",
                snapshot.id(),
                snapshot.shards().len(),
                snapshot.total_samples(),
                previous.id()
            ),
            None => tracing::info!(
                "Published snapshot {} ({} shards, {} samples)",
                snapshot.id(),
                snapshot.shards().len(),
                snapshot.total_samples()
            ),
        }

        Ok(snapshot)
    }

    /// The snapshot new sessions on this dataset bind to.
    pub fn current(&self, dataset_id: &str) -> Result<Arc<Snapshot>> {
        self.entry(dataset_id)?
            .current
            .load_full()
            .ok_or_else(|| LoaderError::snapshot_not_found(format!("{dataset_id}@0")))
    }

    /// Looks up a snapshot by id, falling back to the current one when no
    /// id is given. Older snapshots resolve only while something still
    /// holds them.
    pub fn resolve(&self, dataset_id: &str, snapshot_id: Option<&str>) -> Result<Arc<Snapshot>> {
        let snapshot_id = match snapshot_id {
            Some(id) if !id.is_empty() => id,
            _ => return self.current(dataset_id),
        };

        let entry = self.entry(dataset_id)?;
        let published = entry
            .published
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        published
            .iter()
            .filter_map(Weak::upgrade)
            .find(|s| s.id() == snapshot_id)
            .ok_or_else(|| LoaderError::snapshot_not_found(snapshot_id))
    }

    /// Number of snapshots of this dataset still referenced, the current
    /// one included.
    pub fn live_snapshots(&self, dataset_id: &str) -> Result<usize> {
        let entry = self.entry(dataset_id)?;
        let mut published = entry
            .published
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        published.retain(|weak| weak.strong_count() > 0);
        Ok(published.len())
    }

    /// Configured dataset ids, sorted.
    pub fn dataset_ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.datasets.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn dataset(&self, dataset_id: &str) -> Option<&DatasetConfig> {
        self.datasets.get(dataset_id).map(|e| &e.config)
    }

    fn entry(&self, dataset_id: &str) -> Result<&DatasetEntry> {
        self.datasets
            .get(dataset_id)
            .ok_or_else(|| LoaderError::dataset_not_found(dataset_id))
    }
}

/// In-memory shards for unit tests. Sample `i` of shard `s` is the text
/// `s{s}-{i}`.
#[cfg(test)]
pub(crate) fn in_memory_snapshot(dataset_id: &str, shard_sizes: &[usize]) -> Arc<Snapshot> {
    use crate::storage::ShardReader;
    use bytes::Bytes;

    struct MemoryReader(Bytes);

    impl ShardReader for MemoryReader {
        fn len(&self) -> u64 {
            self.0.len() as u64
        }

        fn read_at(&self, offset: u64, length: u64) -> std::io::Result<Bytes> {
            let end = offset + length;
            if end > self.len() {
                return Err(std::io::ErrorKind::UnexpectedEof.into());
            }
            Ok(self.0.slice(offset as usize..end as usize))
        }
    }

    let shards = shard_sizes
        .iter()
        .enumerate()
        .map(|(s, &count)| {
            let mut data = Vec::new();
            let mut index = Vec::new();
            for i in 0..count {
                let sample = format!("s{s}-{i}");
                index.push(IndexEntry {
                    offset: data.len() as u64,
                    length: sample.len() as u64,
                });
                data.extend_from_slice(sample.as_bytes());
            }
            Shard::from_reader(
                s as u32,
                format!("mem://{dataset_id}/{s}"),
                Arc::new(MemoryReader(Bytes::from(data))),
                index,
            )
        })
        .collect();

    Arc::new(Snapshot::new(dataset_id, 1, shards))
}
