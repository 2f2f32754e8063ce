// rust/loader-core/src/lib.rs

//! Shard Loader - Core Library
//!
//! Building blocks of the dataset loading server: shard discovery and
//! indexing, bounded-memory shuffling, batch assembly and session
//! management. The gRPC surface lives in the `loader-server` crate.

pub mod config;
pub mod error;
pub mod storage;

// Re-export commonly used types for convenience
pub use config::LoaderConfig;
pub use error::{ErrorContext, ErrorKind, LoaderError, Result};
pub use storage::ShardReader;

pub mod catalog;
pub use catalog::{Catalog, SampleRef, Shard, ShardWriter, Snapshot};

pub mod shuffle;
pub use shuffle::ShuffleEngine;

pub mod assembler;
pub use assembler::{Batch, BatchAssembler, ReadSlots};

pub mod session;
pub use session::{EpochPolicy, OpenRequest, ResumePosition, SessionInfo, SessionPhase, SessionStore};
