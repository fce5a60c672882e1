use super::scanner::FileSelector;
use super::ArchiveTask;
use crate::error::{ArchiveError, PipelineStep, Result};
use crate::settings::CompressionMethod;
use async_trait::async_trait;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Turns one [`ArchiveTask`] into an archive on disk.
///
/// Workers only see this trait, which keeps the pool independent from the
/// external tools and lets tests script the outcome of each directory.
#[async_trait]
pub trait ArchivePipeline: Send + Sync {
    /// Returns the path of the final artifact.
    async fn run(&self, worker_id: usize, task: &ArchiveTask) -> Result<PathBuf>;
}

/// `tar` followed by the configured compressor, each as an external process.
///
/// Partial artifacts are left on disk when a step fails.
#[derive(Debug, Clone)]
pub struct TarPipeline {
    tar_program: String,
}

impl Default for TarPipeline {
    fn default() -> Self {
        Self {
            tar_program: "tar".to_string(),
        }
    }
}

impl TarPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a different tar binary (e.g. `gtar` or `bsdtar`).
    pub fn with_tar_program(program: impl Into<String>) -> Self {
        Self {
            tar_program: program.into(),
        }
    }

    async fn build_tar(&self, task: &ArchiveTask, files: Vec<PathBuf>) -> Result<PathBuf> {
        let tar_path = task.tar_path();

        let mut cmd = Command::new(&self.tar_program);
        cmd.arg("--null")
            .arg("-c")
            .arg("-f")
            .arg(&tar_path)
            .arg("-C")
            .arg(&task.source_dir)
            .arg("-T")
            .arg("-")
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());

        debug!("Running tar command: {:?}", cmd);
        let mut child = cmd.spawn().map_err(|e| spawn_error(PipelineStep::Archive, &self.tar_program, e))?;

        // Names are fed NUL-separated and anchored at "./" so that nothing
        // in the list can be read as an option or an absolute path.
        let mut stdin = child.stdin.take().ok_or_else(|| ArchiveError::Pipeline {
            step: PipelineStep::Archive,
            diagnostic: "tar stdin unavailable".into(),
        })?;
        let feeder = tokio::spawn(async move {
            let mut list = Vec::new();
            for file in files {
                list.extend_from_slice(b"./");
                list.extend_from_slice(file.as_os_str().as_bytes());
                list.push(0);
            }
            stdin.write_all(&list).await?;
            stdin.shutdown().await
        });

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| spawn_error(PipelineStep::Archive, &self.tar_program, e))?;
        if let Ok(Err(e)) = feeder.await {
            warn!("writing file list to tar failed: {}", e);
        }

        check_status(PipelineStep::Archive, &output)?;
        Ok(tar_path)
    }

    async fn compress(&self, task: &ArchiveTask, tar_path: &Path) -> Result<PathBuf> {
        let program = task.compression.program();
        let mut cmd = Command::new(program);
        match task.compression {
            CompressionMethod::Gz | CompressionMethod::Bz2 => {
                cmd.arg("-f").arg(tar_path);
            }
            CompressionMethod::Zip => {
                // zip has no in-place mode: write <name>.tar.zip and drop the tar
                cmd.arg("-q").arg("-j").arg("-m").arg(task.artifact_path()).arg(tar_path);
            }
        }
        cmd.stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::piped());

        debug!("Running compression command: {:?}", cmd);
        let output = cmd
            .output()
            .await
            .map_err(|e| spawn_error(PipelineStep::Compress, program, e))?;
        check_status(PipelineStep::Compress, &output)?;
        Ok(task.artifact_path())
    }
}

#[async_trait]
impl ArchivePipeline for TarPipeline {
    async fn run(&self, worker_id: usize, task: &ArchiveTask) -> Result<PathBuf> {
        let selector = FileSelector::new(&task.file_suffix, task.file_size_limit_kb)?;
        let source = task.source_dir.clone();
        let files = tokio::task::spawn_blocking(move || selector.select(&source))
            .await
            .map_err(|e| ArchiveError::Pipeline {
                step: PipelineStep::Collect,
                diagnostic: e.to_string(),
            })??;

        info!(
            "Worker {}: archiving {} files from {}",
            worker_id,
            files.len(),
            task.source_dir.display()
        );

        let tar_path = self.build_tar(task, files).await?;
        let artifact = self.compress(task, &tar_path).await?;
        Ok(artifact)
    }
}

fn spawn_error(step: PipelineStep, program: &str, e: std::io::Error) -> ArchiveError {
    ArchiveError::Pipeline {
        step,
        diagnostic: format!("cannot run {}: {}", program, e),
    }
}

fn check_status(step: PipelineStep, output: &std::process::Output) -> Result<()> {
    if output.status.success() {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    let diagnostic = if stderr.trim().is_empty() {
        format!("exited with {}", output.status)
    } else {
        format!("exited with {}: {}", output.status, stderr.trim())
    };
    Err(ArchiveError::Pipeline { step, diagnostic })
}
