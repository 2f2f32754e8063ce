// rust/loader-core/src/error.rs

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::catalog::SampleRef;

/// Position of a session at the time an error was raised.
///
/// Together with the session seed this is enough to reproduce the failing
/// draw exactly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorContext {
    pub session_id: String,
    pub epoch_index: u32,
    pub cursor: u64,
}

impl std::fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "session {} at epoch {} cursor {}",
            self.session_id, self.epoch_index, self.cursor
        )
    }
}

/// Coarse classification used for retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Fatal at scan/open time, never retried.
    Config,
    /// Surfaced per batch request; the client may retry.
    Io,
    /// Returned immediately, not retried server-side.
    Session,
}

#[derive(Error, Debug)]
pub enum LoaderError {
    #[error("Configuration error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Invalid argument: {message}")]
    InvalidArgument { message: String },

    #[error("Corrupt shard index '{path}': {message}")]
    CorruptIndex { path: PathBuf, message: String },

    #[error("I/O error at '{path}': {message}")]
    Io {
        path: PathBuf,
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("Failed to read sample {sample} from '{path}' ({context})")]
    SampleRead {
        context: ErrorContext,
        sample: SampleRef,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Timed out after {timeout:?} reading sample {sample} from '{path}' ({context})")]
    ReadTimeout {
        context: ErrorContext,
        sample: SampleRef,
        path: PathBuf,
        timeout: Duration,
    },

    #[error("Dataset '{dataset_id}' not found")]
    DatasetNotFound { dataset_id: String },

    #[error("Snapshot '{snapshot_id}' not found")]
    SnapshotNotFound { snapshot_id: String },

    #[error("Dataset snapshot '{snapshot_id}' has no samples")]
    EmptySnapshot { snapshot_id: String },

    #[error("Session '{session_id}' not found")]
    SessionNotFound { session_id: String },

    #[error("Session expired ({context})")]
    SessionExpired { context: ErrorContext },

    #[error("Session closed ({context})")]
    SessionClosed { context: ErrorContext },

    #[error("Another request is already in flight ({context})")]
    SessionBusy { context: ErrorContext },

    #[error("Session limit reached ({limit} open sessions)")]
    TooManySessions { limit: usize },
}

pub type Result<T> = std::result::Result<T, LoaderError>;

// Convenience constructors
impl LoaderError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    pub fn config_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Config {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    pub fn corrupt_index(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::CorruptIndex {
            path: path.into(),
            message: message.into(),
        }
    }

    pub fn io(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Io {
            path: path.into(),
            message: message.into(),
            source: None,
        }
    }

    pub fn io_with_source(
        path: impl Into<PathBuf>,
        message: impl Into<String>,
        source: std::io::Error,
    ) -> Self {
        Self::Io {
            path: path.into(),
            message: message.into(),
            source: Some(source),
        }
    }

    pub fn dataset_not_found(dataset_id: impl Into<String>) -> Self {
        Self::DatasetNotFound {
            dataset_id: dataset_id.into(),
        }
    }

    pub fn snapshot_not_found(snapshot_id: impl Into<String>) -> Self {
        Self::SnapshotNotFound {
            snapshot_id: snapshot_id.into(),
        }
    }

    pub fn session_not_found(session_id: impl Into<String>) -> Self {
        Self::SessionNotFound {
            session_id: session_id.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Config { .. } | Self::InvalidArgument { .. } | Self::CorruptIndex { .. } => {
                ErrorKind::Config
            }
            Self::Io { .. } | Self::SampleRead { .. } | Self::ReadTimeout { .. } => ErrorKind::Io,
            Self::DatasetNotFound { .. }
            | Self::SnapshotNotFound { .. }
            | Self::EmptySnapshot { .. }
            | Self::SessionNotFound { .. }
            | Self::SessionExpired { .. }
            | Self::SessionClosed { .. }
            | Self::SessionBusy { .. }
            | Self::TooManySessions { .. } => ErrorKind::Session,
        }
    }

    /// Session position attached to this error, if any.
    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            Self::SampleRead { context, .. }
            | Self::ReadTimeout { context, .. }
            | Self::SessionExpired { context }
            | Self::SessionClosed { context }
            | Self::SessionBusy { context } => Some(context),
            _ => None,
        }
    }

    /// The sample that failed to resolve, for per-batch I/O errors.
    pub fn sample(&self) -> Option<SampleRef> {
        match self {
            Self::SampleRead { sample, .. } | Self::ReadTimeout { sample, .. } => Some(*sample),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> ErrorContext {
        ErrorContext {
            session_id: "s-1".to_string(),
            epoch_index: 2,
            cursor: 17,
        }
    }

    #[test]
    fn test_kind_classification() {
        assert_eq!(LoaderError::config("bad").kind(), ErrorKind::Config);
        assert_eq!(
            LoaderError::corrupt_index("/a.shard", "bad magic").kind(),
            ErrorKind::Config
        );
        assert_eq!(LoaderError::io("/a", "missing").kind(), ErrorKind::Io);
        assert_eq!(
            LoaderError::SessionBusy { context: context() }.kind(),
            ErrorKind::Session
        );
    }

    #[test]
    fn test_sample_read_carries_position() {
        let err = LoaderError::SampleRead {
            context: context(),
            sample: SampleRef::new(3, 128, 64),
            path: PathBuf::from("/data/a.shard"),
            source: std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "short read"),
        };

        let message = err.to_string();
        assert!(message.contains("s-1"));
        assert!(message.contains("cursor 17"));
        assert!(message.contains("shard 3"));
        assert_eq!(err.context().map(|c| c.cursor), Some(17));
        assert_eq!(err.sample(), Some(SampleRef::new(3, 128, 64)));
    }
}
