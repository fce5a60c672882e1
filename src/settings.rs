use crate::error::{ArchiveError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub const MIN_FILE_SIZE_LIMIT_KB: u32 = 100;
pub const MAX_FILE_SIZE_LIMIT_KB: u32 = 10_000;

const DIRECTORIES_HEADER: &str = "[DIRECTORIES]";
const SETTINGS_HEADER: &str = "[SETTINGS]";

const KEY_TARGET_DIR: &str = "targetDir";
const KEY_COMPRESSION: &str = "compressionMethod";
const KEY_FILE_SIZE_LIMIT: &str = "fileSizeLimit";
const KEY_FILE_SUFFIX: &str = "fileSuffix";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CompressionMethod {
    Gz,
    Bz2,
    Zip,
}

impl CompressionMethod {
    pub const ALL: [CompressionMethod; 3] = [CompressionMethod::Gz, CompressionMethod::Bz2, CompressionMethod::Zip];

    pub fn as_str(&self) -> &'static str {
        match self {
            CompressionMethod::Gz => "gz",
            CompressionMethod::Bz2 => "bz2",
            CompressionMethod::Zip => "zip",
        }
    }

    /// Extension the compressor appends to `<name>.tar`.
    pub fn extension(&self) -> &'static str {
        self.as_str()
    }

    pub fn program(&self) -> &'static str {
        match self {
            CompressionMethod::Gz => "gzip",
            CompressionMethod::Bz2 => "bzip2",
            CompressionMethod::Zip => "zip",
        }
    }
}

impl std::fmt::Display for CompressionMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for CompressionMethod {
    type Err = ArchiveError;

    fn from_str(s: &str) -> Result<Self> {
        CompressionMethod::ALL
            .into_iter()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| ArchiveError::Validation(format!("unknown compression method '{}'", s)))
    }
}

/// Archiving preferences of one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    pub target_dir: PathBuf,
    pub compression: CompressionMethod,
    pub file_size_limit_kb: u32,
    pub file_suffix: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            target_dir: dirs::home_dir().unwrap_or_else(|| PathBuf::from("/tmp")),
            compression: CompressionMethod::Bz2,
            file_size_limit_kb: 1000,
            file_suffix: "*".to_string(),
        }
    }
}

impl Settings {
    pub fn validate(&self) -> Result<()> {
        if self.target_dir.as_os_str().is_empty() {
            return Err(ArchiveError::Validation("target directory is empty".into()));
        }
        validate_file_size_limit(self.file_size_limit_kb)?;
        validate_file_suffix(&self.file_suffix)?;
        Ok(())
    }
}

pub fn validate_file_size_limit(kb: u32) -> Result<()> {
    if !(MIN_FILE_SIZE_LIMIT_KB..=MAX_FILE_SIZE_LIMIT_KB).contains(&kb) {
        return Err(ArchiveError::Validation(format!(
            "file size limit {} KB outside [{}, {}]",
            kb, MIN_FILE_SIZE_LIMIT_KB, MAX_FILE_SIZE_LIMIT_KB
        )));
    }
    Ok(())
}

pub fn validate_file_suffix(pattern: &str) -> Result<()> {
    if pattern.trim().is_empty() {
        return Err(ArchiveError::Validation("file suffix pattern is empty".into()));
    }
    globset::Glob::new(pattern)
        .map(|_| ())
        .map_err(|e| ArchiveError::Validation(format!("invalid file suffix pattern '{}': {}", pattern, e)))
}

/// Result of reading a settings file.
#[derive(Debug, Clone, Default)]
pub struct LoadedSettings {
    pub directories: Vec<PathBuf>,
    pub settings: Settings,
    /// Lines that were skipped or values that were replaced by defaults
    pub warnings: Vec<String>,
}

impl LoadedSettings {
    /// A value was replaced by its default, so the file on disk no longer
    /// matches what the session holds.
    pub fn needs_resave(&self) -> bool {
        !self.warnings.is_empty()
    }
}

#[derive(Clone, Copy, PartialEq)]
enum Section {
    None,
    Directories,
    Settings,
}

pub fn parse(contents: &str) -> LoadedSettings {
    let mut loaded = LoadedSettings::default();
    let mut section = Section::None;

    for (lineno, raw) in contents.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }
        if line == DIRECTORIES_HEADER {
            section = Section::Directories;
            continue;
        }
        if line == SETTINGS_HEADER {
            section = Section::Settings;
            continue;
        }

        match section {
            Section::Directories => loaded.directories.push(PathBuf::from(line)),
            Section::Settings => {
                // values may contain '=' themselves, only the first one splits
                match line.split_once('=') {
                    Some((key, value)) => apply_setting(&mut loaded, key.trim(), value.trim()),
                    None => loaded
                        .warnings
                        .push(format!("line {}: expected key=value, got '{}'", lineno + 1, line)),
                }
            }
            Section::None => loaded
                .warnings
                .push(format!("line {}: '{}' outside of any section", lineno + 1, line)),
        }
    }

    for warning in &loaded.warnings {
        warn!("settings: {}", warning);
    }
    loaded
}

fn apply_setting(loaded: &mut LoadedSettings, key: &str, value: &str) {
    let defaults = Settings::default();
    let settings = &mut loaded.settings;
    match key {
        KEY_TARGET_DIR => {
            if value.is_empty() {
                loaded.warnings.push("targetDir is empty, restoring default".into());
                settings.target_dir = defaults.target_dir;
            } else {
                settings.target_dir = PathBuf::from(value);
            }
        }
        KEY_COMPRESSION => match value.parse() {
            Ok(method) => settings.compression = method,
            Err(_) => {
                loaded
                    .warnings
                    .push(format!("invalid compressionMethod '{}', restoring default", value));
                settings.compression = defaults.compression;
            }
        },
        KEY_FILE_SIZE_LIMIT => match value.parse::<u32>().ok().filter(|kb| validate_file_size_limit(*kb).is_ok()) {
            Some(kb) => settings.file_size_limit_kb = kb,
            None => {
                loaded
                    .warnings
                    .push(format!("invalid fileSizeLimit '{}', restoring default", value));
                settings.file_size_limit_kb = defaults.file_size_limit_kb;
            }
        },
        KEY_FILE_SUFFIX => {
            if validate_file_suffix(value).is_ok() {
                settings.file_suffix = value.to_string();
            } else {
                loaded
                    .warnings
                    .push(format!("invalid fileSuffix '{}', restoring default", value));
                settings.file_suffix = defaults.file_suffix;
            }
        }
        other => {
            debug!("ignoring unknown settings key {}", other);
            loaded.warnings.push(format!("unknown key '{}' ignored", other));
        }
    }
}

pub fn render(directories: &[PathBuf], settings: &Settings) -> String {
    let mut out = String::new();
    if !directories.is_empty() {
        out.push_str(DIRECTORIES_HEADER);
        out.push('\n');
        for dir in directories {
            out.push_str(&dir.to_string_lossy());
            out.push('\n');
        }
    }
    out.push_str(SETTINGS_HEADER);
    out.push('\n');
    out.push_str(&format!("{}={}\n", KEY_TARGET_DIR, settings.target_dir.display()));
    out.push_str(&format!("{}={}\n", KEY_COMPRESSION, settings.compression));
    out.push_str(&format!("{}={}\n", KEY_FILE_SIZE_LIMIT, settings.file_size_limit_kb));
    out.push_str(&format!("{}={}\n", KEY_FILE_SUFFIX, settings.file_suffix));
    out
}

/// Read a settings file. A missing file yields defaults.
pub fn load_file(path: &Path) -> Result<LoadedSettings> {
    match std::fs::read_to_string(path) {
        Ok(contents) => Ok(parse(&contents)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!("no settings file at {}, using defaults", path.display());
            Ok(LoadedSettings::default())
        }
        Err(e) => Err(ArchiveError::environment("cannot read settings file", path, e)),
    }
}

pub fn store_file(path: &Path, directories: &[PathBuf], settings: &Settings) -> Result<()> {
    std::fs::write(path, render(directories, settings))
        .map_err(|e| ArchiveError::environment("cannot write settings file", path, e))
}
