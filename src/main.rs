use anyhow::Result;
use backupdirs::archive::{Archiver, ElapsedTicker, StatusEvent};
use backupdirs::utils::{self, summary, LogFormat};
use backupdirs::Session;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // Load configuration
    let config = utils::config::load_config()?;
    utils::logging::init_tracing(config.log_format);

    info!("Starting backupdirs v{}", env!("CARGO_PKG_VERSION"));
    info!("Worker pool size: {}", config.workers);

    let session = Session::load(&config.settings_file)?;
    if session.is_dirty() {
        warn!(
            "{} needs attention ({} problems); run with corrected values and save",
            session.path().display(),
            session.warnings().len()
        );
    }
    if session.directories().is_empty() {
        warn!("No directories listed in {}, nothing to do", session.path().display());
        return Ok(());
    }

    let (event_tx, event_rx) = broadcast::channel(256);
    let reporter = tokio::spawn(report_events(event_rx));

    let archiver = Archiver::new(config.workers, Arc::new(event_tx));
    let ticker = ElapsedTicker::with_period(session.directories().clone(), config.tick_interval);
    ticker.start();

    let handle = archiver.start(session.directories(), session.settings()).await?;
    info!("Writing archives to {}", handle.target_dir().display());

    let canceller = handle.canceller();
    let signal_task = tokio::spawn(async move {
        shutdown_signal().await;
        warn!("Stopping after the directories already in progress");
        canceller.cancel();
    });

    let report = handle.wait().await?;
    signal_task.abort();
    ticker.stop();

    summary::write_readme(&report.target_dir, &report)?;
    if config.log_format == LogFormat::Json {
        info!(report = %serde_json::to_string(&report)?, "Run report");
    }
    for dir in report.directories.iter().filter(|d| d.error.is_some()) {
        error!(
            "{}: {}",
            dir.path.display(),
            dir.error.as_deref().unwrap_or_default()
        );
    }

    drop(archiver);
    let _ = reporter.await;

    info!(
        "Done: {} completed, {} failed{}",
        report.completed(),
        report.failed(),
        if report.cancelled { ", cancelled" } else { "" }
    );
    Ok(())
}

async fn report_events(mut rx: broadcast::Receiver<StatusEvent>) {
    loop {
        match rx.recv().await {
            Ok(StatusEvent::Scheduled { dir }) => info!("Scheduled {}", dir.display()),
            Ok(StatusEvent::Started { dir, at }) => info!("Started {} at {}", dir.display(), at.format("%H:%M:%S")),
            Ok(StatusEvent::Completed { dir }) => info!("Completed {}", dir.display()),
            Ok(StatusEvent::Error { dir, diagnostic }) => error!("Error {}: {}", dir.display(), diagnostic),
            Ok(StatusEvent::RunFinished { cancelled }) => {
                info!("Run finished (cancelled: {})", cancelled);
                break;
            }
            Err(broadcast::error::RecvError::Lagged(n)) => warn!("Missed {} status events", n),
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
