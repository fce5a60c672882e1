use super::config::LogFormat;
use tracing_subscriber::{fmt, EnvFilter};

const DEFAULT_FILTER: &str = "backupdirs=info";

/// Installs the global tracing subscriber. `RUST_LOG` overrides the default
/// filter. Calling it again is harmless.
pub fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let result = match format {
        LogFormat::Json => fmt().json().with_env_filter(filter).with_target(false).try_init(),
        LogFormat::Text => fmt().with_env_filter(filter).with_target(false).try_init(),
    };
    if result.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}
