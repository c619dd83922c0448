use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("no catalog found in {}", .0.display())]
    NotFound(PathBuf),

    #[error("shard {shard} is corrupted: {reason}")]
    Corrupted { shard: String, reason: String },

    #[error("catalog manifest is corrupted: {0}")]
    CorruptedManifest(String),

    #[error("unsupported catalog format version {found} (this build reads version {supported})")]
    UnsupportedVersion { found: u32, supported: u32 },

    #[error("invalid content hash: {0:?}")]
    InvalidHash(String),

    #[error("invalid catalog row: {0}")]
    InvalidRecord(String),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: Arc<std::io::Error>,
    },

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),
}

impl Error {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Error::Io {
            context: context.into(),
            source: Arc::new(source),
        }
    }

    /// True for failures the caller should answer with a live directory scan
    /// rather than surfacing to the user.
    pub fn is_recoverable_by_rescan(&self) -> bool {
        matches!(
            self,
            Error::NotFound(_)
                | Error::Corrupted { .. }
                | Error::CorruptedManifest(_)
                | Error::UnsupportedVersion { .. }
        )
    }

    /// Disk or network trouble that may succeed on retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Io { .. } | Error::Timeout(_))
    }
}

impl From<std::io::Error> for Error {
    fn from(source: std::io::Error) -> Self {
        Error::io("I/O error", source)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
