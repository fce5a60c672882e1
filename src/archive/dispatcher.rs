use super::pipeline::{ArchivePipeline, TarPipeline};
use super::pool::WorkerPool;
use super::scanner::directory_size_kb;
use super::sink::{RunSink, StatusSink};
use super::{check_archive_names, check_target_overlap, ArchiveTask, DirectoryList, DirectoryStatus};
use crate::error::{ArchiveError, Result};
use crate::settings::Settings;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Runs archiving jobs over a [`DirectoryList`], one run at a time.
#[derive(Clone)]
pub struct Archiver {
    capacity: usize,
    sink: Arc<dyn StatusSink>,
    pipeline: Arc<dyn ArchivePipeline>,
    active: Arc<AtomicBool>,
}

/// Cooperative stop request for one run. Cheap to clone and hand to a
/// signal handler or an observer.
#[derive(Clone, Debug, Default)]
pub struct Canceller {
    flag: Arc<AtomicBool>,
}

impl Canceller {
    /// Takes effect before the next directory is scheduled. Idempotent.
    pub fn cancel(&self) {
        if !self.flag.swap(true, Ordering::AcqRel) {
            info!("Cancellation requested");
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

/// Per-run state owned by the dispatcher.
struct RunContext {
    id: Uuid,
    target_dir: PathBuf,
    tasks: Vec<ArchiveTask>,
    canceller: Canceller,
}

/// Handle to a started run.
#[derive(Debug)]
pub struct RunHandle {
    id: Uuid,
    target_dir: PathBuf,
    canceller: Canceller,
    join: JoinHandle<RunReport>,
}

impl RunHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// The `backup-<timestamp>` directory this run writes into.
    pub fn target_dir(&self) -> &Path {
        &self.target_dir
    }

    pub fn cancel(&self) {
        self.canceller.cancel();
    }

    pub fn canceller(&self) -> Canceller {
        self.canceller.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Waits for the run to drain and returns its report.
    pub async fn wait(self) -> Result<RunReport> {
        self.join.await.map_err(|e| {
            error!(run = %self.id, "Run task ended abnormally: {}", e);
            ArchiveError::RunAborted(e.to_string())
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: String,
    pub target_dir: PathBuf,
    pub cancelled: bool,
    pub directories: Vec<DirectoryReport>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DirectoryReport {
    pub path: PathBuf,
    pub status: DirectoryStatus,
    pub size_kb: u64,
    pub elapsed_seconds: u64,
    pub error: Option<String>,
}

impl RunReport {
    pub fn completed(&self) -> usize {
        self.count(DirectoryStatus::Completed)
    }

    pub fn failed(&self) -> usize {
        self.count(DirectoryStatus::Error)
    }

    fn count(&self, status: DirectoryStatus) -> usize {
        self.directories.iter().filter(|d| d.status == status).count()
    }
}

/// Releases the one-run-at-a-time guard and the directory list when the
/// run task ends, however it ends.
struct ActiveRun {
    active: Arc<AtomicBool>,
    list: DirectoryList,
}

impl Drop for ActiveRun {
    fn drop(&mut self) {
        self.list.release();
        self.active.store(false, Ordering::Release);
    }
}

impl Archiver {
    /// Archiver backed by the external `tar` pipeline.
    pub fn new(capacity: usize, sink: Arc<dyn StatusSink>) -> Self {
        Self::with_pipeline(capacity, sink, Arc::new(TarPipeline::new()))
    }

    pub fn with_pipeline(capacity: usize, sink: Arc<dyn StatusSink>, pipeline: Arc<dyn ArchivePipeline>) -> Self {
        Self {
            capacity: capacity.max(1),
            sink,
            pipeline,
            active: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_running(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Validates, creates `<targetDir>/backup-<UTC timestamp>` and launches
    /// the run in the background.
    ///
    /// Fails with `Busy` if a run is active, `Validation` for bad settings,
    /// a directory overlapping the target or two directories sharing a base
    /// name, and `Environment` when the target
    /// directory cannot be created. In all those cases nothing has changed.
    pub async fn start(&self, dirs: &DirectoryList, settings: &Settings) -> Result<RunHandle> {
        if self
            .active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            warn!("Refusing to start: a run is already active");
            return Err(ArchiveError::Busy);
        }
        if !dirs.acquire() {
            self.active.store(false, Ordering::Release);
            return Err(ArchiveError::Busy);
        }
        let guard = ActiveRun {
            active: self.active.clone(),
            list: dirs.clone(),
        };

        let paths = dirs.paths();
        settings.validate()?;
        check_target_overlap(&paths, &settings.target_dir)?;
        check_archive_names(&paths)?;

        let target_dir = settings
            .target_dir
            .join(format!("backup-{}", chrono::Utc::now().format("%Y%m%d_%H%M%S")));
        tokio::fs::create_dir_all(&target_dir)
            .await
            .map_err(|e| ArchiveError::environment("cannot create target directory", &target_dir, e))?;

        dirs.reset();

        let ctx = RunContext {
            id: Uuid::new_v4(),
            tasks: paths
                .iter()
                .map(|p| ArchiveTask::new(p, &target_dir, settings))
                .collect(),
            target_dir: target_dir.clone(),
            canceller: Canceller::default(),
        };
        info!(
            run = %ctx.id,
            "Starting archive run of {} directories into {}",
            ctx.tasks.len(),
            target_dir.display()
        );

        let handle_id = ctx.id;
        let canceller = ctx.canceller.clone();
        let sink = Arc::new(RunSink {
            list: dirs.clone(),
            outer: self.sink.clone(),
        });
        let pool = WorkerPool::new(self.capacity, sink.clone(), self.pipeline.clone());
        let list = dirs.clone();

        let join = tokio::spawn(async move {
            let _guard = guard;
            execute(ctx, pool, sink, list).await
        });

        Ok(RunHandle {
            id: handle_id,
            target_dir,
            canceller,
            join,
        })
    }

    /// Requests cancellation of a run; running directories still finish.
    pub fn cancel(&self, handle: &RunHandle) {
        handle.cancel();
    }

    pub fn target_dir<'a>(&self, handle: &'a RunHandle) -> &'a Path {
        handle.target_dir()
    }
}

async fn execute(ctx: RunContext, pool: WorkerPool, sink: Arc<RunSink>, list: DirectoryList) -> RunReport {
    let sources: Vec<PathBuf> = ctx.tasks.iter().map(|t| t.source_dir.clone()).collect();
    let sizes = tokio::task::spawn_blocking(move || {
        sources
            .iter()
            .map(|dir| (dir.clone(), directory_size_kb(dir)))
            .collect::<Vec<_>>()
    })
    .await
    .unwrap_or_default();
    debug!(run = %ctx.id, "Computed sizes for {} directories", sizes.len());

    let mut cancelled = false;
    for task in ctx.tasks {
        if ctx.canceller.is_cancelled() {
            cancelled = true;
            break;
        }
        let dir = task.source_dir.clone();
        sink.on_scheduled(&dir);
        if let Err(e) = pool.submit(task).await {
            error!(run = %ctx.id, dir = %dir.display(), "Could not submit task: {}", e);
            sink.on_error(&dir, &e.to_string());
        }
    }
    // a cancel that landed after the last submission still counts
    cancelled |= ctx.canceller.is_cancelled();

    pool.drain().await;
    pool.shutdown().await;

    let snapshot = list.snapshot();
    let directories = snapshot
        .into_iter()
        .map(|entry| DirectoryReport {
            size_kb: sizes
                .iter()
                .find(|(p, _)| *p == entry.path)
                .map(|(_, kb)| *kb)
                .unwrap_or(0),
            path: entry.path,
            status: entry.status,
            elapsed_seconds: entry.elapsed_seconds,
            error: entry.last_error,
        })
        .collect();

    let report = RunReport {
        run_id: ctx.id.to_string(),
        target_dir: ctx.target_dir,
        cancelled,
        directories,
    };
    info!(
        run = %report.run_id,
        "Archive run finished: {} completed, {} failed, cancelled: {}",
        report.completed(),
        report.failed(),
        cancelled
    );
    sink.on_run_finished(cancelled);
    report
}
