use crate::archive::RunReport;
use crate::error::{ArchiveError, Result};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use tracing::info;

pub const README_NAME: &str = "README";

/// `m:ss`, minutes unbounded.
pub fn format_elapsed(seconds: u64) -> String {
    format!("{}:{:02}", seconds / 60, seconds % 60)
}

pub fn render(report: &RunReport) -> String {
    let mut out = String::new();
    for dir in &report.directories {
        let _ = writeln!(
            out,
            "{}\t{}\t{}",
            dir.path.display(),
            dir.size_kb,
            format_elapsed(dir.elapsed_seconds)
        );
    }
    out
}

/// Writes `<target_dir>/README` with one `path<TAB>sizeKB<TAB>m:ss` line per
/// directory.
pub fn write_readme(target_dir: &Path, report: &RunReport) -> Result<PathBuf> {
    let path = target_dir.join(README_NAME);
    std::fs::write(&path, render(report)).map_err(|e| ArchiveError::environment("cannot write summary", &path, e))?;
    info!("Summary written to {}", path.display());
    Ok(path)
}
