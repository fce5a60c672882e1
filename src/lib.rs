//! Archives a list of directories into compressed files, one archive per
//! directory, with a bounded pool of concurrent workers.
//!
//! A run is started with [`Archiver::start`], reports every status change
//! through a [`StatusSink`], and can be cancelled between directories.

pub mod archive;
pub mod error;
pub mod session;
pub mod settings;
pub mod utils;

pub use archive::{
    ArchivePipeline, ArchiveTask, Archiver, Canceller, DirectoryEntry, DirectoryList, DirectoryStatus,
    ElapsedTicker, NullSink, RunHandle, RunReport, StatusEvent, StatusSink, TarPipeline, WorkerPool,
};
pub use error::{ArchiveError, Result};
pub use session::Session;
pub use settings::{CompressionMethod, Settings};
