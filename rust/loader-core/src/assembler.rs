// rust/loader-core/src/assembler.rs

//! Batch Assembler.
//!
//! Turns drawn sample refs into sample bytes. Reads run on the blocking
//! pool, a bounded number at a time, each under its own timeout, and come
//! back in draw order regardless of which finishes first.
//!
//! A blocking read can't be cancelled, so a read that times out keeps its
//! pool thread until the shard answers. Every read holds a permit from the
//! caller's [`ReadSlots`] until it actually returns, which caps how many
//! threads one session's stalled reads can pin.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::stream::{self, StreamExt, TryStreamExt};
use tokio::sync::Semaphore;

use crate::catalog::{SampleRef, Snapshot};
use crate::config::StorageConfig;
use crate::error::{ErrorContext, LoaderError, Result};

/// A resolved batch plus the epoch metadata the client needs.
#[derive(Debug, Clone, Default)]
pub struct Batch {
    /// Sample bytes in draw order.
    pub samples: Vec<Bytes>,
    /// Locator of each entry in `samples`.
    pub refs: Vec<SampleRef>,
    /// Epoch of the first sample, or the current epoch for an empty batch.
    pub epoch_index: u32,
    /// Set on the batch that completes a bounded epoch.
    pub is_epoch_end: bool,
    /// Draws made in the current epoch after this batch.
    pub cursor: u64,
    /// Index in `samples` where a continuous session entered a new epoch.
    pub epoch_boundary: Option<u32>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Blocking reads one session may have outstanding, counting reads that
/// timed out but have not returned yet.
#[derive(Debug, Clone)]
pub struct ReadSlots(Arc<Semaphore>);

impl ReadSlots {
    pub fn new(permits: usize) -> Self {
        Self(Arc::new(Semaphore::new(permits.max(1))))
    }

    /// Permits not held by an outstanding read.
    pub fn available(&self) -> usize {
        self.0.available_permits()
    }
}

/// Resolves sample refs against a snapshot's shard handles.
#[derive(Debug, Clone)]
pub struct BatchAssembler {
    read_parallelism: usize,
    read_timeout: Duration,
}

impl BatchAssembler {
    pub fn new(config: &StorageConfig) -> Self {
        Self::with_limits(config.read_parallelism, config.read_timeout())
    }

    pub fn with_limits(read_parallelism: usize, read_timeout: Duration) -> Self {
        Self {
            read_parallelism: read_parallelism.max(1),
            read_timeout,
        }
    }

    pub fn read_timeout(&self) -> Duration {
        self.read_timeout
    }

    /// Fresh read slots sized to this assembler's parallelism, one set per
    /// session.
    pub fn read_slots(&self) -> ReadSlots {
        ReadSlots::new(self.read_parallelism)
    }

    /// Reads every ref, preserving order.
    ///
    /// # Errors
    ///
    /// The first failing ref aborts the batch with `SampleRead`, or with
    /// `ReadTimeout` if the read did not finish in time. Either error
    /// carries `context` and the offending ref. When every slot is still
    /// held by an earlier stalled read the batch fails with `SampleRead`
    /// without starting another read.
    pub async fn resolve(
        &self,
        snapshot: &Arc<Snapshot>,
        refs: &[SampleRef],
        context: &ErrorContext,
        slots: &ReadSlots,
    ) -> Result<Vec<Bytes>> {
        stream::iter(refs.iter().copied())
            .map(|sample| self.read_one(snapshot, sample, context, slots))
            .buffered(self.read_parallelism)
            .try_collect()
            .await
    }

    async fn read_one(
        &self,
        snapshot: &Arc<Snapshot>,
        sample: SampleRef,
        context: &ErrorContext,
        slots: &ReadSlots,
    ) -> Result<Bytes> {
        let path = snapshot.shard_path(sample.shard).to_path_buf();
        let read_error = |source: std::io::Error| LoaderError::SampleRead {
            context: context.clone(),
            sample,
            path: path.clone(),
            source,
        };

        let reader = match snapshot.shard(sample.shard) {
            Some(shard) => Arc::clone(shard.reader()),
            None => {
                return Err(read_error(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "shard is not part of the session's snapshot",
                )))
            }
        };

        let permit = match Arc::clone(&slots.0).try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                return Err(read_error(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "earlier reads for this session are still stalled",
                )))
            }
        };

        // The permit goes back only once the read itself returns
        let task = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            reader.read_at(sample.offset, sample.length)
        });
        match tokio::time::timeout(self.read_timeout, task).await {
            Ok(Ok(Ok(bytes))) if bytes.len() as u64 == sample.length => Ok(bytes),
            Ok(Ok(Ok(bytes))) => Err(read_error(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("short read: got {} of {} bytes", bytes.len(), sample.length),
            ))),
            Ok(Ok(Err(e))) => Err(read_error(e)),
            Ok(Err(join_error)) => Err(read_error(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("read task failed: {join_error}"),
            ))),
            Err(_) => Err(LoaderError::ReadTimeout {
                context: context.clone(),
                sample,
                path: path.clone(),
                timeout: self.read_timeout,
            }),
        }
    }
}
