use super::DirectoryList;
use parking_lot::Mutex;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;

/// Advances the elapsed-time clock of every Started directory once per
/// period. Purely observational: it only touches the [`DirectoryList`].
pub struct ElapsedTicker {
    list: DirectoryList,
    period: Duration,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ElapsedTicker {
    pub fn new(list: DirectoryList) -> Self {
        Self::with_period(list, Duration::from_secs(1))
    }

    pub fn with_period(list: DirectoryList, period: Duration) -> Self {
        Self {
            list,
            period,
            handle: Mutex::new(None),
        }
    }

    /// Starts ticking on the current runtime. No-op if already running.
    pub fn start(&self) {
        let mut handle = self.handle.lock();
        if handle.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        let list = self.list.clone();
        let period = self.period;
        *handle = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let advanced = list.tick();
                if advanced > 0 {
                    debug!("Ticked {} running directories", advanced);
                }
            }
        }));
        debug!("Elapsed-time ticker started");
    }

    /// Stops ticking. No-op if not running.
    pub fn stop(&self) {
        if let Some(handle) = self.handle.lock().take() {
            handle.abort();
            debug!("Elapsed-time ticker stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.lock().as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Drop for ElapsedTicker {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::DirectoryStatus;
    use chrono::Utc;
    use std::path::Path;

    fn started_list() -> DirectoryList {
        let list = DirectoryList::from_paths(["/a", "/b"]);
        list.set_status(Path::new("/a"), DirectoryStatus::Scheduled);
        list.mark_started(Path::new("/a"), Utc::now());
        list
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticks_started_entries_each_second() {
        let list = started_list();
        let ticker = ElapsedTicker::new(list.clone());
        ticker.start();

        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert_eq!(list.get(Path::new("/a")).unwrap().elapsed_seconds, 3);
        assert_eq!(list.get(Path::new("/b")).unwrap().elapsed_seconds, 0);
        ticker.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_and_stop_are_idempotent() {
        let list = started_list();
        let ticker = ElapsedTicker::new(list.clone());
        ticker.start();
        ticker.start();
        assert!(ticker.is_running());

        tokio::time::sleep(Duration::from_millis(2500)).await;
        // a second start must not double the rate
        assert_eq!(list.get(Path::new("/a")).unwrap().elapsed_seconds, 2);

        ticker.stop();
        ticker.stop();
        assert!(!ticker.is_running());
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(list.get(Path::new("/a")).unwrap().elapsed_seconds, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_finished_entries_stop_counting() {
        let list = started_list();
        let ticker = ElapsedTicker::new(list.clone());
        ticker.start();
        tokio::time::sleep(Duration::from_millis(1500)).await;
        list.set_status(Path::new("/a"), DirectoryStatus::Completed);
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(list.get(Path::new("/a")).unwrap().elapsed_seconds, 1);
        ticker.stop();
    }
}
