pub mod config;
pub mod logging;
pub mod summary;

pub use config::{load_config, Config, LogFormat};
