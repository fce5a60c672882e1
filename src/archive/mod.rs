pub mod dispatcher;
pub mod pipeline;
pub mod pool;
pub mod scanner;
pub mod sink;
pub mod ticker;

pub use dispatcher::{Archiver, Canceller, RunHandle, RunReport};
pub use pipeline::{ArchivePipeline, TarPipeline};
pub use pool::WorkerPool;
pub use sink::{NullSink, StatusSink};
pub use ticker::ElapsedTicker;

use crate::error::{ArchiveError, Result};
use crate::settings::{CompressionMethod, Settings};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::warn;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DirectoryStatus {
    NotStarted,
    Scheduled,
    Started,
    Completed,
    Error,
}

impl DirectoryStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, DirectoryStatus::Completed | DirectoryStatus::Error)
    }

    /// Allowed forward moves: NotStarted → Scheduled → Started → {Completed, Error}.
    pub fn can_become(&self, next: DirectoryStatus) -> bool {
        use DirectoryStatus::*;
        matches!(
            (self, next),
            (NotStarted, Scheduled) | (Scheduled, Started) | (Started, Completed) | (Started, Error)
        )
    }
}

impl std::fmt::Display for DirectoryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            DirectoryStatus::NotStarted => "Not started",
            DirectoryStatus::Scheduled => "Scheduled",
            DirectoryStatus::Started => "Started",
            DirectoryStatus::Completed => "Completed",
            DirectoryStatus::Error => "Error",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DirectoryEntry {
    pub path: PathBuf,
    pub status: DirectoryStatus,
    pub elapsed_seconds: u64,
    pub started_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl DirectoryEntry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            status: DirectoryStatus::NotStarted,
            elapsed_seconds: 0,
            started_at: None,
            last_error: None,
        }
    }

    fn reset(&mut self) {
        self.status = DirectoryStatus::NotStarted;
        self.elapsed_seconds = 0;
        self.started_at = None;
        self.last_error = None;
    }
}

/// One directory's unit of work, frozen at submission time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveTask {
    pub source_dir: PathBuf,
    pub target_dir: PathBuf,
    pub file_suffix: String,
    pub file_size_limit_kb: u32,
    pub compression: CompressionMethod,
}

impl ArchiveTask {
    pub fn new(source_dir: impl Into<PathBuf>, target_dir: impl Into<PathBuf>, settings: &Settings) -> Self {
        Self {
            source_dir: source_dir.into(),
            target_dir: target_dir.into(),
            file_suffix: settings.file_suffix.clone(),
            file_size_limit_kb: settings.file_size_limit_kb,
            compression: settings.compression,
        }
    }

    /// Base name used for the archive files of this task.
    pub fn archive_stem(&self) -> String {
        archive_stem_of(&self.source_dir)
    }

    /// `<target>/<basename>.tar`
    pub fn tar_path(&self) -> PathBuf {
        self.target_dir.join(format!("{}.tar", self.archive_stem()))
    }

    /// Where the compressed artifact ends up for the configured method.
    pub fn artifact_path(&self) -> PathBuf {
        self.target_dir
            .join(format!("{}.tar.{}", self.archive_stem(), self.compression.extension()))
    }
}

/// Status changes as delivered to broadcast subscribers.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StatusEvent {
    Scheduled { dir: PathBuf },
    Started { dir: PathBuf, at: DateTime<Utc> },
    Completed { dir: PathBuf },
    Error { dir: PathBuf, diagnostic: String },
    RunFinished { cancelled: bool },
}

/// Shared, synchronized directory table.
///
/// Every writer (dispatcher, workers, ticker) goes through the methods here,
/// and readers take a consistent copy with [`DirectoryList::snapshot`].
#[derive(Clone, Default)]
pub struct DirectoryList {
    entries: Arc<RwLock<Vec<DirectoryEntry>>>,
    in_use: Arc<AtomicBool>,
}

impl DirectoryList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_paths<I, P>(paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        let list = Self::new();
        {
            let mut entries = list.entries.write();
            for path in paths {
                let path = path.into();
                if !entries.iter().any(|e| e.path == path) {
                    entries.push(DirectoryEntry::new(path));
                }
            }
        }
        list
    }

    /// Adds a directory. Returns `Ok(false)` when it is already listed.
    pub fn add(&self, path: impl Into<PathBuf>) -> Result<bool> {
        let path = path.into();
        let meta = std::fs::metadata(&path).map_err(|e| ArchiveError::environment("cannot access directory", &path, e))?;
        if !meta.is_dir() {
            return Err(ArchiveError::Validation(format!("{} is not a directory", path.display())));
        }
        let mut entries = self.entries.write();
        if entries.iter().any(|e| e.path == path) {
            return Ok(false);
        }
        entries.push(DirectoryEntry::new(path));
        Ok(true)
    }

    /// Removes a directory; refused while a run holds the list.
    pub fn remove(&self, path: &Path) -> Result<bool> {
        if self.is_in_use() {
            return Err(ArchiveError::Busy);
        }
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|e| e.path != path);
        Ok(entries.len() != before)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn paths(&self) -> Vec<PathBuf> {
        self.entries.read().iter().map(|e| e.path.clone()).collect()
    }

    pub fn snapshot(&self) -> Vec<DirectoryEntry> {
        self.entries.read().clone()
    }

    pub fn get(&self, path: &Path) -> Option<DirectoryEntry> {
        self.entries.read().iter().find(|e| e.path == path).cloned()
    }

    pub fn is_in_use(&self) -> bool {
        self.in_use.load(Ordering::Acquire)
    }

    /// Marks the list as held by a run. Returns false if it already was.
    pub(crate) fn acquire(&self) -> bool {
        self.in_use
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn release(&self) {
        self.in_use.store(false, Ordering::Release);
    }

    /// Puts every entry back to NotStarted with a zero clock.
    pub fn reset(&self) {
        for entry in self.entries.write().iter_mut() {
            entry.reset();
        }
    }

    /// Applies a status change if the transition is allowed.
    pub fn set_status(&self, path: &Path, next: DirectoryStatus) -> bool {
        self.update(path, next, |_| {})
    }

    pub(crate) fn mark_started(&self, path: &Path, at: DateTime<Utc>) -> bool {
        self.update(path, DirectoryStatus::Started, |e| e.started_at = Some(at))
    }

    pub(crate) fn mark_error(&self, path: &Path, diagnostic: &str) -> bool {
        self.update(path, DirectoryStatus::Error, |e| e.last_error = Some(diagnostic.to_string()))
    }

    fn update(&self, path: &Path, next: DirectoryStatus, extra: impl FnOnce(&mut DirectoryEntry)) -> bool {
        let mut entries = self.entries.write();
        let Some(entry) = entries.iter_mut().find(|e| e.path == path) else {
            warn!(dir = %path.display(), "status update for unknown directory");
            return false;
        };
        if !entry.status.can_become(next) {
            warn!(
                dir = %path.display(),
                "ignoring status change {} -> {}",
                entry.status,
                next
            );
            return false;
        }
        entry.status = next;
        extra(entry);
        true
    }

    /// Advances the clock of every Started entry by one second.
    /// Returns how many entries were advanced.
    pub fn tick(&self) -> usize {
        let mut entries = self.entries.write();
        let mut advanced = 0;
        for entry in entries.iter_mut().filter(|e| e.status == DirectoryStatus::Started) {
            entry.elapsed_seconds += 1;
            advanced += 1;
        }
        advanced
    }
}

fn archive_stem_of(dir: &Path) -> String {
    dir.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "root".to_string())
}

/// Rejects two directories that would write the same archive file, i.e.
/// share a base name.
pub fn check_archive_names(dirs: &[PathBuf]) -> Result<()> {
    let mut seen: HashMap<String, &Path> = HashMap::new();
    for dir in dirs {
        if let Some(first) = seen.insert(archive_stem_of(dir), dir.as_path()) {
            return Err(ArchiveError::Validation(format!(
                "{} and {} would both be archived as {}.tar",
                first.display(),
                dir.display(),
                archive_stem_of(dir)
            )));
        }
    }
    Ok(())
}

/// Rejects a target directory that equals, contains, or lies inside any of
/// the directories to archive. Comparison is per path component.
pub fn check_target_overlap(dirs: &[PathBuf], target: &Path) -> Result<()> {
    let target = normalize(target);
    for dir in dirs {
        let dir_norm = normalize(dir);
        if target.starts_with(&dir_norm) || dir_norm.starts_with(&target) {
            return Err(ArchiveError::Validation(format!(
                "target directory {} overlaps with {}",
                target.display(),
                dir.display()
            )));
        }
    }
    Ok(())
}

/// Canonicalizes the longest existing ancestor and re-appends the rest, so
/// that existing and not-yet-created paths compare on equal terms.
fn normalize(path: &Path) -> PathBuf {
    let mut existing = path.to_path_buf();
    let mut rest = Vec::new();
    loop {
        if let Ok(mut resolved) = std::fs::canonicalize(&existing) {
            for part in rest.iter().rev() {
                resolved.push(part);
            }
            return resolved;
        }
        match (existing.file_name(), existing.parent()) {
            (Some(name), Some(parent)) => {
                rest.push(name.to_os_string());
                existing = parent.to_path_buf();
            }
            _ => return path.components().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_status_transitions() {
        use DirectoryStatus::*;
        assert!(NotStarted.can_become(Scheduled));
        assert!(Scheduled.can_become(Started));
        assert!(Started.can_become(Completed));
        assert!(Started.can_become(Error));
        assert!(!NotStarted.can_become(Started));
        assert!(!Scheduled.can_become(Completed));
        assert!(!Completed.can_become(Started));
        assert!(!Started.can_become(Started));
    }

    #[test]
    fn test_list_rejects_skipped_states() {
        let list = DirectoryList::from_paths(["/a"]);
        assert!(!list.set_status(Path::new("/a"), DirectoryStatus::Started));
        assert!(list.set_status(Path::new("/a"), DirectoryStatus::Scheduled));
        assert!(list.mark_started(Path::new("/a"), Utc::now()));
        assert!(list.mark_error(Path::new("/a"), "boom"));
        let entry = list.get(Path::new("/a")).unwrap();
        assert_eq!(entry.status, DirectoryStatus::Error);
        assert_eq!(entry.last_error.as_deref(), Some("boom"));
    }

    #[test]
    fn test_tick_only_advances_started() {
        let list = DirectoryList::from_paths(["/a", "/b"]);
        list.set_status(Path::new("/a"), DirectoryStatus::Scheduled);
        list.mark_started(Path::new("/a"), Utc::now());
        list.set_status(Path::new("/b"), DirectoryStatus::Scheduled);
        assert_eq!(list.tick(), 1);
        assert_eq!(list.tick(), 1);
        assert_eq!(list.get(Path::new("/a")).unwrap().elapsed_seconds, 2);
        assert_eq!(list.get(Path::new("/b")).unwrap().elapsed_seconds, 0);
    }

    #[test]
    fn test_reset_clears_previous_run() {
        let list = DirectoryList::from_paths(["/a"]);
        list.set_status(Path::new("/a"), DirectoryStatus::Scheduled);
        list.mark_started(Path::new("/a"), Utc::now());
        list.tick();
        list.set_status(Path::new("/a"), DirectoryStatus::Completed);
        list.reset();
        let entry = list.get(Path::new("/a")).unwrap();
        assert_eq!(entry.status, DirectoryStatus::NotStarted);
        assert_eq!(entry.elapsed_seconds, 0);
    }

    #[test]
    fn test_from_paths_deduplicates() {
        let list = DirectoryList::from_paths(["/a", "/b", "/a"]);
        assert_eq!(list.paths(), vec![PathBuf::from("/a"), PathBuf::from("/b")]);
    }

    #[test]
    fn test_add_requires_existing_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let list = DirectoryList::new();
        assert!(list.add(tmp.path()).unwrap());
        assert!(!list.add(tmp.path()).unwrap());
        assert!(list.add(tmp.path().join("missing")).is_err());
        let file = tmp.path().join("f.txt");
        std::fs::write(&file, b"x").unwrap();
        assert!(list.add(&file).unwrap_err().is_validation());
    }

    #[test]
    fn test_remove_refused_while_in_use() {
        let list = DirectoryList::from_paths(["/a"]);
        assert!(list.acquire());
        assert!(!list.acquire());
        assert!(matches!(list.remove(Path::new("/a")), Err(ArchiveError::Busy)));
        list.release();
        assert!(list.remove(Path::new("/a")).unwrap());
        assert!(list.is_empty());
    }

    #[test]
    fn test_artifact_naming() {
        let settings = Settings {
            compression: CompressionMethod::Gz,
            ..Settings::default()
        };
        let task = ArchiveTask::new("/home/me/docs", "/backup/backup-1", &settings);
        assert_eq!(task.tar_path(), PathBuf::from("/backup/backup-1/docs.tar"));
        assert_eq!(task.artifact_path(), PathBuf::from("/backup/backup-1/docs.tar.gz"));
    }

    #[test]
    fn test_overlap_examples() {
        let dirs = vec![PathBuf::from("/data/photos")];
        assert!(check_target_overlap(&dirs, Path::new("/data/photos")).is_err());
        assert!(check_target_overlap(&dirs, Path::new("/data/photos/backups")).is_err());
        assert!(check_target_overlap(&dirs, Path::new("/data")).is_err());
        assert!(check_target_overlap(&dirs, Path::new("/data/photos2")).is_ok());
        assert!(check_target_overlap(&dirs, Path::new("/backup")).is_ok());
    }

    #[test]
    fn test_shared_base_name_rejected() {
        let dirs = vec![PathBuf::from("/x/docs"), PathBuf::from("/x/music"), PathBuf::from("/y/docs")];
        let err = check_archive_names(&dirs).unwrap_err();
        assert!(err.is_validation());
        assert!(err.to_string().contains("/y/docs"));
        assert!(check_archive_names(&dirs[..2]).is_ok());
        assert!(check_archive_names(&[]).is_ok());
    }

    proptest! {
        #[test]
        fn test_overlap_detects_nesting(
            base in "/[a-z]{1,6}(/[a-z]{1,6}){0,2}",
            child in "[a-z]{1,6}(/[a-z]{1,6}){0,2}",
        ) {
            let base = PathBuf::from(base);
            let nested = base.join(&child);
            prop_assert!(check_target_overlap(&[base.clone()], &nested).is_err());
            prop_assert!(check_target_overlap(&[nested.clone()], &base).is_err());
            prop_assert!(check_target_overlap(&[base.clone()], &base).is_err());
        }

        #[test]
        fn test_overlap_allows_siblings(
            parent in "/[a-z]{1,6}",
            left in "[a-m]{1,6}",
            right in "[n-z]{1,6}",
        ) {
            let parent = PathBuf::from(parent);
            prop_assert!(check_target_overlap(&[parent.join(&left)], &parent.join(&right)).is_ok());
        }
    }
}
