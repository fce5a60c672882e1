use crate::archive::DirectoryList;
use crate::error::Result;
use crate::settings::{self, CompressionMethod, Settings};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// What the user edits between runs: the directory list, the preferences,
/// and whether those differ from the settings file.
pub struct Session {
    path: PathBuf,
    directories: DirectoryList,
    settings: Settings,
    dirty: bool,
    warnings: Vec<String>,
}

impl Session {
    /// Reads the settings file. A missing file gives an empty, clean session.
    /// If values had to be replaced by defaults the session starts dirty.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let loaded = settings::load_file(&path)?;
        let dirty = loaded.needs_resave();

        for dir in &loaded.directories {
            if !dir.is_dir() {
                warn!("listed directory {} does not exist", dir.display());
            }
        }
        info!(
            "Loaded {} directories from {}",
            loaded.directories.len(),
            path.display()
        );

        Ok(Self {
            directories: DirectoryList::from_paths(loaded.directories),
            settings: loaded.settings,
            dirty,
            warnings: loaded.warnings,
            path,
        })
    }

    pub fn save(&mut self) -> Result<()> {
        settings::store_file(&self.path, &self.directories.paths(), &self.settings)?;
        self.dirty = false;
        info!("Settings saved to {}", self.path.display());
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn directories(&self) -> &DirectoryList {
        &self.directories
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Problems found while loading the settings file.
    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    /// Registers an existing directory. Already listed directories are skipped.
    pub fn add_directory(&mut self, dir: impl Into<PathBuf>) -> Result<bool> {
        let added = self.directories.add(dir)?;
        self.dirty |= added;
        Ok(added)
    }

    /// Fails with `Busy` while a run is using the list.
    pub fn remove_directory(&mut self, dir: &Path) -> Result<bool> {
        let removed = self.directories.remove(dir)?;
        self.dirty |= removed;
        Ok(removed)
    }

    pub fn set_target_dir(&mut self, dir: impl Into<PathBuf>) {
        self.settings.target_dir = dir.into();
        self.dirty = true;
    }

    pub fn set_compression(&mut self, method: CompressionMethod) {
        self.settings.compression = method;
        self.dirty = true;
    }

    pub fn set_file_size_limit(&mut self, kb: u32) -> Result<()> {
        settings::validate_file_size_limit(kb)?;
        self.settings.file_size_limit_kb = kb;
        self.dirty = true;
        Ok(())
    }

    pub fn set_file_suffix(&mut self, pattern: impl Into<String>) -> Result<()> {
        let pattern = pattern.into();
        settings::validate_file_suffix(&pattern)?;
        self.settings.file_suffix = pattern;
        self.dirty = true;
        Ok(())
    }
}
