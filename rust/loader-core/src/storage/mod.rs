// rust/loader-core/src/storage/mod.rs

//! Random-access handles over shard files.
//!
//! A shard is opened once at scan time and shared by every snapshot that
//! references it. Reads are positional so any number of sessions can
//! resolve samples from the same handle concurrently.

mod local;

pub use local::{open_shard_reader, FileShardReader, MmapShardReader};

use bytes::Bytes;

/// Positional read access to one shard file.
///
/// Implementations must be safe to share across threads; there is no
/// shared cursor, every call names its own offset.
pub trait ShardReader: Send + Sync {
    /// Total size of the underlying file in bytes.
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reads exactly `length` bytes starting at `offset`.
    ///
    /// # Errors
    ///
    /// Fails with `UnexpectedEof` when the range runs past the end of the
    /// file, or with whatever error the underlying read produced.
    fn read_at(&self, offset: u64, length: u64) -> std::io::Result<Bytes>;
}
