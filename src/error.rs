//! Error types for the archiving engine.
//!
//! Only validation, busy and target-directory failures ever reach the caller
//! of [`Archiver::start`](crate::archive::dispatcher::Archiver::start).
//! Everything that goes wrong inside a single directory's pipeline is turned
//! into an `Error` status for that directory.

use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ArchiveError>;

#[derive(Error, Debug)]
pub enum ArchiveError {
    /// Bad settings value or directory/target overlap. The run never starts.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Something on disk is not where it should be
    #[error("{context} '{}': {source}", path.display())]
    Environment {
        context: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// An external archive or compression step failed
    #[error("{step} failed: {diagnostic}")]
    Pipeline {
        step: PipelineStep,
        diagnostic: String,
    },

    #[error("an archiving run is already active")]
    Busy,

    #[error("worker pool is no longer accepting tasks")]
    PoolClosed,

    /// The background run task panicked or was aborted
    #[error("archive run ended abnormally: {0}")]
    RunAborted(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineStep {
    Collect,
    Archive,
    Compress,
}

impl std::fmt::Display for PipelineStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PipelineStep::Collect => f.write_str("file selection"),
            PipelineStep::Archive => f.write_str("tar"),
            PipelineStep::Compress => f.write_str("compression"),
        }
    }
}

impl ArchiveError {
    pub fn environment(context: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        ArchiveError::Environment {
            context,
            path: path.into(),
            source,
        }
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, ArchiveError::Validation(_))
    }
}
