use super::pipeline::ArchivePipeline;
use super::sink::StatusSink;
use super::ArchiveTask;
use crate::error::{ArchiveError, Result};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Fixed-size pool of archive workers fed through a bounded queue.
///
/// The queue holds at most `capacity` pending tasks, so [`WorkerPool::submit`]
/// waits while it is full instead of buffering without limit.
pub struct WorkerPool {
    capacity: usize,
    sender: Option<mpsc::Sender<ArchiveTask>>,
    queue: Arc<Mutex<mpsc::Receiver<ArchiveTask>>>,
    /// Tasks submitted and not yet finished (queued + running)
    outstanding: watch::Sender<usize>,
    stop: watch::Sender<bool>,
    workers: Vec<WorkerHandle>,
}

struct WorkerHandle {
    id: usize,
    handle: JoinHandle<()>,
}

struct WorkerContext {
    id: usize,
    queue: Arc<Mutex<mpsc::Receiver<ArchiveTask>>>,
    outstanding: watch::Sender<usize>,
    stop: watch::Receiver<bool>,
    sink: Arc<dyn StatusSink>,
    pipeline: Arc<dyn ArchivePipeline>,
}

impl WorkerPool {
    /// Pool size when nothing is configured: one more than the CPU count.
    pub fn default_capacity() -> usize {
        num_cpus::get() + 1
    }

    /// Spawns `capacity` workers on the current tokio runtime.
    pub fn new(capacity: usize, sink: Arc<dyn StatusSink>, pipeline: Arc<dyn ArchivePipeline>) -> Self {
        let capacity = capacity.max(1);
        let (sender, receiver) = mpsc::channel(capacity);
        let queue = Arc::new(Mutex::new(receiver));
        let (outstanding, _) = watch::channel(0usize);
        let (stop, _) = watch::channel(false);

        info!("Starting worker pool with {} workers", capacity);

        let workers = (0..capacity)
            .map(|id| {
                let ctx = WorkerContext {
                    id,
                    queue: queue.clone(),
                    outstanding: outstanding.clone(),
                    stop: stop.subscribe(),
                    sink: sink.clone(),
                    pipeline: pipeline.clone(),
                };
                WorkerHandle {
                    id,
                    handle: tokio::spawn(worker_loop(ctx)),
                }
            })
            .collect();

        Self {
            capacity,
            sender: Some(sender),
            queue,
            outstanding,
            stop,
            workers,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Tasks queued or running right now.
    pub fn outstanding(&self) -> usize {
        *self.outstanding.borrow()
    }

    /// Queues a task, waiting for room if the queue is full.
    pub async fn submit(&self, task: ArchiveTask) -> Result<()> {
        let sender = self.sender.as_ref().ok_or(ArchiveError::PoolClosed)?;
        if *self.stop.borrow() {
            return Err(ArchiveError::PoolClosed);
        }
        self.outstanding.send_modify(|n| *n += 1);
        if sender.send(task).await.is_err() {
            self.outstanding.send_modify(|n| *n = n.saturating_sub(1));
            return Err(ArchiveError::PoolClosed);
        }
        Ok(())
    }

    /// Waits until nothing is queued and no worker is mid-task.
    /// Returns at once when the pool is already idle.
    pub async fn drain(&self) {
        let mut rx = self.outstanding.subscribe();
        // the sender lives in self, so this can only end by reaching zero
        let _ = rx.wait_for(|n| *n == 0).await;
        debug!("Worker pool drained");
    }

    /// Drains, then lets the workers exit once the queue is closed.
    pub async fn shutdown(mut self) {
        self.drain().await;
        self.sender.take();
        self.join_workers().await;
        info!("Worker pool shut down");
    }

    /// Stops the workers as soon as their current task is done. Tasks still
    /// queued are discarded and their count is returned.
    pub async fn force_stop(mut self) -> usize {
        self.sender.take();
        self.stop.send_replace(true);
        self.join_workers().await;

        let mut discarded = 0;
        let mut queue = self.queue.lock().await;
        while let Ok(task) = queue.try_recv() {
            warn!("Discarding queued task for {}", task.source_dir.display());
            discarded += 1;
        }
        self.outstanding.send_modify(|n| *n = n.saturating_sub(discarded));
        info!("Worker pool force-stopped, {} queued tasks discarded", discarded);
        discarded
    }

    async fn join_workers(&mut self) {
        let handles = self.workers.drain(..).map(|w| async move {
            if let Err(e) = w.handle.await {
                error!("Worker {} terminated abnormally: {}", w.id, e);
            }
        });
        futures::future::join_all(handles).await;
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Workers still attached here were neither shut down nor
        // force-stopped; let them finish what they hold and exit.
        if !self.workers.is_empty() {
            self.stop.send_replace(true);
        }
    }
}

async fn worker_loop(mut ctx: WorkerContext) {
    debug!("Worker {} started", ctx.id);

    loop {
        if *ctx.stop.borrow_and_update() {
            break;
        }

        let next = {
            let mut queue = ctx.queue.lock().await;
            tokio::select! {
                biased;
                _ = ctx.stop.changed() => None,
                task = queue.recv() => task,
            }
        };
        let Some(task) = next else { break };

        run_task(&ctx, task).await;
        ctx.outstanding.send_modify(|n| *n = n.saturating_sub(1));
    }

    debug!("Worker {} shutting down", ctx.id);
}

async fn run_task(ctx: &WorkerContext, task: ArchiveTask) {
    let dir = task.source_dir.as_path();
    ctx.sink.on_started(dir, chrono::Utc::now());
    info!(worker = ctx.id, dir = %dir.display(), "Archiving started");

    let started = std::time::Instant::now();
    let outcome = AssertUnwindSafe(ctx.pipeline.run(ctx.id, &task)).catch_unwind().await;
    let took = humantime::format_duration(std::time::Duration::from_secs(started.elapsed().as_secs()));

    match outcome {
        Ok(Ok(artifact)) => {
            info!(
                worker = ctx.id,
                dir = %dir.display(),
                "Archived to {} in {}",
                artifact.display(),
                took
            );
            ctx.sink.on_completed(dir);
        }
        Ok(Err(e)) => {
            error!(worker = ctx.id, dir = %dir.display(), "Archiving failed after {}: {}", took, e);
            ctx.sink.on_error(dir, &e.to_string());
        }
        Err(panic) => {
            let reason = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            error!(worker = ctx.id, dir = %dir.display(), "Archive pipeline panicked: {}", reason);
            ctx.sink.on_error(dir, &format!("pipeline panicked: {}", reason));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::sink::NullSink;
    use crate::settings::Settings;
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Sleeps per task and records the highest concurrency it saw.
    #[derive(Default)]
    struct SlowPipeline {
        running: AtomicUsize,
        peak: AtomicUsize,
        finished: AtomicUsize,
    }

    #[async_trait]
    impl ArchivePipeline for SlowPipeline {
        async fn run(&self, _worker_id: usize, task: &ArchiveTask) -> Result<PathBuf> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            self.finished.fetch_add(1, Ordering::SeqCst);
            if task.source_dir.ends_with("bad") {
                return Err(ArchiveError::Pipeline {
                    step: crate::error::PipelineStep::Archive,
                    diagnostic: "exit status 2".into(),
                });
            }
            if task.source_dir.ends_with("panic") {
                panic!("simulated");
            }
            Ok(task.artifact_path())
        }
    }

    #[derive(Default)]
    struct Recorder {
        events: parking_lot::Mutex<Vec<String>>,
    }

    impl StatusSink for Recorder {
        fn on_scheduled(&self, dir: &Path) {
            self.events.lock().push(format!("scheduled {}", dir.display()));
        }
        fn on_started(&self, dir: &Path, _at: DateTime<Utc>) {
            self.events.lock().push(format!("started {}", dir.display()));
        }
        fn on_completed(&self, dir: &Path) {
            self.events.lock().push(format!("completed {}", dir.display()));
        }
        fn on_error(&self, dir: &Path, diagnostic: &str) {
            self.events.lock().push(format!("error {} {}", dir.display(), diagnostic));
        }
        fn on_run_finished(&self, cancelled: bool) {
            self.events.lock().push(format!("finished {}", cancelled));
        }
    }

    fn task(name: &str) -> ArchiveTask {
        ArchiveTask::new(format!("/src/{}", name), "/dst", &Settings::default())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrency_never_exceeds_capacity() {
        let pipeline = Arc::new(SlowPipeline::default());
        let pool = WorkerPool::new(3, Arc::new(NullSink), pipeline.clone());
        for i in 0..20 {
            pool.submit(task(&format!("d{}", i))).await.unwrap();
        }
        pool.drain().await;
        assert_eq!(pipeline.finished.load(Ordering::SeqCst), 20);
        assert!(pipeline.peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(pool.outstanding(), 0);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_failures_are_reported_and_isolated() {
        let recorder = Arc::new(Recorder::default());
        let pool = WorkerPool::new(2, recorder.clone(), Arc::new(SlowPipeline::default()));
        pool.submit(task("good")).await.unwrap();
        pool.submit(task("bad")).await.unwrap();
        pool.submit(task("panic")).await.unwrap();
        pool.submit(task("after")).await.unwrap();
        pool.drain().await;
        pool.shutdown().await;

        let events = recorder.events.lock().clone();
        assert!(events.contains(&"completed /src/good".to_string()));
        assert!(events.contains(&"completed /src/after".to_string()));
        assert!(events.iter().any(|e| e.starts_with("error /src/bad") && e.contains("exit status 2")));
        assert!(events.iter().any(|e| e.starts_with("error /src/panic") && e.contains("simulated")));
        assert_eq!(events.iter().filter(|e| e.starts_with("started")).count(), 4);
    }

    #[tokio::test]
    async fn test_drain_on_idle_pool_returns_immediately() {
        let pool = WorkerPool::new(2, Arc::new(NullSink), Arc::new(SlowPipeline::default()));
        pool.drain().await;
        pool.drain().await;
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_repeated_drain_after_work() {
        let pipeline = Arc::new(SlowPipeline::default());
        let pool = WorkerPool::new(1, Arc::new(NullSink), pipeline.clone());
        pool.submit(task("a")).await.unwrap();
        pool.drain().await;
        pool.drain().await;
        assert_eq!(pipeline.finished.load(Ordering::SeqCst), 1);
        pool.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_force_stop_discards_queued_work() {
        let pipeline = Arc::new(SlowPipeline::default());
        let pool = WorkerPool::new(1, Arc::new(NullSink), pipeline.clone());
        pool.submit(task("a")).await.unwrap();
        pool.submit(task("b")).await.unwrap();
        let discarded = pool.force_stop().await;
        let finished = pipeline.finished.load(Ordering::SeqCst);
        assert_eq!(finished + discarded, 2);
        assert_eq!(pipeline.running.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_zero_capacity_is_clamped() {
        let pool = WorkerPool::new(0, Arc::new(NullSink), Arc::new(SlowPipeline::default()));
        assert_eq!(pool.capacity(), 1);
        pool.shutdown().await;
    }
}
