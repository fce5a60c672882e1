use super::{DirectoryList, DirectoryStatus, StatusEvent};
use chrono::{DateTime, Utc};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Receiver of run progress.
///
/// Called synchronously from the dispatcher and from worker tasks, so
/// implementations must be quick and must not block on the pool.
pub trait StatusSink: Send + Sync {
    fn on_scheduled(&self, dir: &Path);
    fn on_started(&self, dir: &Path, at: DateTime<Utc>);
    fn on_completed(&self, dir: &Path);
    fn on_error(&self, dir: &Path, diagnostic: &str);
    fn on_run_finished(&self, cancelled: bool);
}

/// Discards everything.
pub struct NullSink;

impl StatusSink for NullSink {
    fn on_scheduled(&self, _dir: &Path) {}
    fn on_started(&self, _dir: &Path, _at: DateTime<Utc>) {}
    fn on_completed(&self, _dir: &Path) {}
    fn on_error(&self, _dir: &Path, _diagnostic: &str) {}
    fn on_run_finished(&self, _cancelled: bool) {}
}

/// Fans events out to every subscriber. Sending with no subscribers is fine.
impl StatusSink for broadcast::Sender<StatusEvent> {
    fn on_scheduled(&self, dir: &Path) {
        let _ = self.send(StatusEvent::Scheduled { dir: dir.to_path_buf() });
    }

    fn on_started(&self, dir: &Path, at: DateTime<Utc>) {
        let _ = self.send(StatusEvent::Started {
            dir: dir.to_path_buf(),
            at,
        });
    }

    fn on_completed(&self, dir: &Path) {
        let _ = self.send(StatusEvent::Completed { dir: dir.to_path_buf() });
    }

    fn on_error(&self, dir: &Path, diagnostic: &str) {
        let _ = self.send(StatusEvent::Error {
            dir: dir.to_path_buf(),
            diagnostic: diagnostic.to_string(),
        });
    }

    fn on_run_finished(&self, cancelled: bool) {
        let _ = self.send(StatusEvent::RunFinished { cancelled });
    }
}

/// Applying events to the shared table keeps it in step with the run.
impl StatusSink for DirectoryList {
    fn on_scheduled(&self, dir: &Path) {
        self.set_status(dir, DirectoryStatus::Scheduled);
    }

    fn on_started(&self, dir: &Path, at: DateTime<Utc>) {
        self.mark_started(dir, at);
    }

    fn on_completed(&self, dir: &Path) {
        self.set_status(dir, DirectoryStatus::Completed);
    }

    fn on_error(&self, dir: &Path, diagnostic: &str) {
        self.mark_error(dir, diagnostic);
    }

    fn on_run_finished(&self, _cancelled: bool) {}
}

/// Updates the directory table first, then forwards to the caller's sink,
/// so an observer reacting to an event always sees the table already updated.
pub(crate) struct RunSink {
    pub(crate) list: DirectoryList,
    pub(crate) outer: Arc<dyn StatusSink>,
}

impl StatusSink for RunSink {
    fn on_scheduled(&self, dir: &Path) {
        self.list.on_scheduled(dir);
        self.outer.on_scheduled(dir);
    }

    fn on_started(&self, dir: &Path, at: DateTime<Utc>) {
        self.list.on_started(dir, at);
        self.outer.on_started(dir, at);
    }

    fn on_completed(&self, dir: &Path) {
        self.list.on_completed(dir);
        self.outer.on_completed(dir);
    }

    fn on_error(&self, dir: &Path, diagnostic: &str) {
        self.list.on_error(dir, diagnostic);
        self.outer.on_error(dir, diagnostic);
    }

    fn on_run_finished(&self, cancelled: bool) {
        self.outer.on_run_finished(cancelled);
    }
}
