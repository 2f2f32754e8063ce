// rust/loader-core/src/catalog/scan.rs

//! Shard discovery and snapshot construction.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::snapshot::{FileFingerprint, Shard, Snapshot};
use crate::config::{DatasetConfig, ShardFormat, StorageConfig};
use crate::error::{LoaderError, Result};
use crate::storage::{open_shard_reader, ShardReader};

/// Builds a standalone snapshot of a shard file or directory.
///
/// The snapshot id is derived from the final path component.
///
/// # Errors
///
/// Returns `Config` for a missing path, `CorruptIndex` for a malformed shard
/// and `Io` when the filesystem can't be walked or read.
pub fn scan(path: impl AsRef<Path>, format: ShardFormat, storage: &StorageConfig) -> Result<Snapshot> {
    let path = path.as_ref();
    let id = path
        .file_name()
        .map(|n| n.to_string_lossy().replace('@', "_"))
        .unwrap_or_else(|| "dataset".to_string());
    let dataset = DatasetConfig {
        format,
        ..DatasetConfig::new(id, path)
    };
    scan_dataset(&dataset, storage, 1, None)
}

/// Scans one dataset into a snapshot of the given generation.
///
/// Shards whose path, size and modification time match a shard of
/// `previous` share its open handle and index instead of being reopened.
pub(crate) fn scan_dataset(
    dataset: &DatasetConfig,
    storage: &StorageConfig,
    generation: u64,
    previous: Option<&Snapshot>,
) -> Result<Snapshot> {
    let files = discover(dataset)?;

    let reusable: HashMap<&Path, &Shard> = previous
        .map(|snapshot| {
            snapshot
                .shards()
                .iter()
                .map(|shard| (shard.path.as_path(), shard))
                .collect()
        })
        .unwrap_or_default();

    let mut shards = Vec::with_capacity(files.len());
    let mut reused = 0usize;

    for (path, format) in files {
        let id = u32::try_from(shards.len())
            .map_err(|_| LoaderError::config(format!("dataset '{}' has too many shards", dataset.id)))?;
        let fingerprint = fingerprint(&path)?;

        if let Some(existing) = reusable.get(path.as_path()) {
            if existing.fingerprint == fingerprint && existing.format == format {
                shards.push(existing.renumbered(id));
                reused += 1;
                continue;
            }
        }

        shards.push(open_shard(id, path, format, fingerprint, storage)?);
    }

    let snapshot = Snapshot::new(&dataset.id, generation, shards);
    tracing::debug!(
        "Built snapshot {} ({} shards reused from previous generation)",
        snapshot.id(),
        reused
    );
    Ok(snapshot)
}

fn open_shard(
    id: u32,
    path: PathBuf,
    format: ShardFormat,
    fingerprint: FileFingerprint,
    storage: &StorageConfig,
) -> Result<Shard> {
    let layout = format
        .record_format(&path)
        .ok_or_else(|| LoaderError::config(format!("no record format for {}", path.display())))?;
    let reader: Arc<dyn ShardReader> = Arc::from(open_shard_reader(&path, storage)?);
    let index = layout.index(&path, &*reader)?;

    tracing::debug!(
        "Indexed shard {} ({}, {} samples)",
        path.display(),
        layout.name(),
        index.len()
    );

    Ok(Shard {
        id,
        path,
        format,
        fingerprint,
        reader,
        index: index.into(),
    })
}

fn fingerprint(path: &Path) -> Result<FileFingerprint> {
    let meta = fs::metadata(path)
        .map_err(|e| LoaderError::io_with_source(path, "failed to read shard metadata", e))?;
    Ok(FileFingerprint {
        size: meta.len(),
        modified: meta.modified().ok(),
    })
}

/// Lists the shard files of a dataset in sorted order, each with its
/// concrete format.
pub(crate) fn discover(dataset: &DatasetConfig) -> Result<Vec<(PathBuf, ShardFormat)>> {
    let root = &dataset.path;
    let meta = fs::metadata(root).map_err(|e| {
        LoaderError::config_with_source(
            format!("dataset '{}' path {} is not accessible", dataset.id, root.display()),
            e,
        )
    })?;

    if meta.is_file() {
        let format = dataset.format.resolve(root).ok_or_else(|| {
            LoaderError::config(format!(
                "cannot infer shard format of {}; set format explicitly",
                root.display()
            ))
        })?;
        return Ok(vec![(root.clone(), format)]);
    }

    let mut paths = Vec::new();
    walk(root, dataset.recursive, &mut paths)?;
    paths.sort();

    Ok(paths
        .into_iter()
        .filter_map(|path| dataset.format.resolve(&path).map(|format| (path, format)))
        .collect())
}

fn walk(dir: &Path, recursive: bool, out: &mut Vec<PathBuf>) -> Result<()> {
    let entries = fs::read_dir(dir)
        .map_err(|e| LoaderError::io_with_source(dir, "failed to read directory", e))?;

    for entry in entries {
        let entry =
            entry.map_err(|e| LoaderError::io_with_source(dir, "failed to read directory entry", e))?;
        let path = entry.path();

        // Hidden files include in-progress shard writes
        if entry.file_name().to_string_lossy().starts_with('.') {
            continue;
        }

        let file_type = entry
            .file_type()
            .map_err(|e| LoaderError::io_with_source(&path, "failed to read file type", e))?;
        if file_type.is_dir() {
            if recursive {
                walk(&path, recursive, out)?;
            }
        } else if file_type.is_file() || fs::metadata(&path).map(|m| m.is_file()).unwrap_or(false) {
            out.push(path);
        }
    }

    Ok(())
}
