use crate::error::{ArchiveError, PipelineStep, Result};
use globset::{Glob, GlobMatcher};
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

/// Picks the files of one source directory that go into its archive.
pub struct FileSelector {
    matcher: GlobMatcher,
    limit_bytes: u64,
}

impl FileSelector {
    pub fn new(pattern: &str, file_size_limit_kb: u32) -> Result<Self> {
        let matcher = Glob::new(pattern)
            .map_err(|e| ArchiveError::Validation(format!("invalid file suffix pattern '{}': {}", pattern, e)))?
            .compile_matcher();
        Ok(Self {
            matcher,
            limit_bytes: u64::from(file_size_limit_kb) * 1024,
        })
    }

    /// Regular files under `root` whose name matches and whose size is
    /// strictly below the limit, as paths relative to `root`, sorted.
    pub fn select(&self, root: &Path) -> Result<Vec<PathBuf>> {
        let meta = std::fs::metadata(root).map_err(|e| ArchiveError::environment("source directory is gone", root, e))?;
        if !meta.is_dir() {
            return Err(ArchiveError::Validation(format!("{} is not a directory", root.display())));
        }

        let mut selected = Vec::new();
        for entry in WalkDir::new(root).follow_links(false) {
            let entry = entry.map_err(|e| ArchiveError::Pipeline {
                step: PipelineStep::Collect,
                diagnostic: e.to_string(),
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            if !self.matcher.is_match(entry.file_name()) {
                continue;
            }
            let size = match entry.metadata() {
                Ok(m) => m.len(),
                Err(e) => {
                    debug!("skipping {}: {}", entry.path().display(), e);
                    continue;
                }
            };
            if size >= self.limit_bytes {
                continue;
            }
            if let Ok(relative) = entry.path().strip_prefix(root) {
                selected.push(relative.to_path_buf());
            }
        }
        selected.sort();
        Ok(selected)
    }
}

/// Apparent size of everything under `dir` in KiB, rounded up. Unreadable
/// entries are skipped; a missing directory counts as zero.
pub fn directory_size_kb(dir: &Path) -> u64 {
    let bytes: u64 = WalkDir::new(dir)
        .follow_links(false)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.metadata().ok())
        .map(|m| m.len())
        .sum();
    bytes.div_ceil(1024)
}
