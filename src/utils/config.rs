use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Worker pool size (0 = CPU count + 1)
    pub workers: usize,

    /// Settings file holding directories and preferences
    pub settings_file: PathBuf,

    /// Elapsed-time ticker period
    pub tick_interval: Duration,

    pub log_format: LogFormat,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workers: 0,
            settings_file: dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".backupdirs"),
            tick_interval: Duration::from_secs(1),
            log_format: LogFormat::Text,
        }
    }
}

impl Config {
    /// Load config from environment variables over the defaults.
    pub fn load() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Config::default();

        if let Some(workers) = lookup("BACKUPDIRS_WORKERS") {
            config.workers = workers
                .parse()
                .with_context(|| format!("BACKUPDIRS_WORKERS must be a number, got '{}'", workers))?;
        }

        if let Some(path) = lookup("BACKUPDIRS_SETTINGS") {
            config.settings_file = PathBuf::from(path);
        }

        if let Some(ms) = lookup("BACKUPDIRS_TICK_MS") {
            let ms: u64 = ms
                .parse()
                .with_context(|| format!("BACKUPDIRS_TICK_MS must be a number, got '{}'", ms))?;
            anyhow::ensure!(ms > 0, "BACKUPDIRS_TICK_MS must be positive");
            config.tick_interval = Duration::from_millis(ms);
        }

        if let Some(format) = lookup("BACKUPDIRS_LOG_FORMAT") {
            config.log_format = match format.to_ascii_lowercase().as_str() {
                "json" => LogFormat::Json,
                "text" | "" => LogFormat::Text,
                other => anyhow::bail!("unknown BACKUPDIRS_LOG_FORMAT '{}'", other),
            };
        }

        // Auto-detect workers if not set
        if config.workers == 0 {
            config.workers = num_cpus::get() + 1;
        }

        Ok(config)
    }
}

pub fn load_config() -> Result<Config> {
    Config::load()
}
