//! User settings, read from `settings.toml` in the config directory
//!
//! Every field has a default, so a missing file or a partial file is fine.

use crate::paths;
use anyhow::{Context, Result};
use history::DatabaseOptions;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Use this database instead of `<state_dir>/History/config.db`
    pub database_path: Option<PathBuf>,

    /// How long SQLite waits on a locked database
    pub busy_timeout_ms: u64,

    /// How often a queued apply that holds the mutex but is not first in
    /// line re-checks the queue
    pub queue_poll_interval_ms: u64,

    /// How often a change listener wakes up to check whether it should stop
    pub listener_wait_timeout_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database_path: None,
            busy_timeout_ms: 5000,
            queue_poll_interval_ms: 250,
            listener_wait_timeout_ms: 1000,
        }
    }
}

impl Settings {
    /// Load from the default settings file
    pub fn load() -> Result<Self> {
        Self::load_from(&paths::settings_path()?)
    }

    /// Load from `path`, or return defaults if it doesn't exist
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            log::debug!("Settings file does not exist, using defaults");
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings file: {}", path.display()))?;
        let settings: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse settings file: {}", path.display()))?;

        log::debug!("Loaded settings from {}", path.display());
        Ok(settings)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create config directory: {}", dir.display()))?;
        }
        let content = toml::to_string_pretty(self).context("Failed to serialize settings")?;
        fs::write(path, content)
            .with_context(|| format!("Failed to write settings file: {}", path.display()))?;
        Ok(())
    }

    /// The history database path, with `~` and variables expanded
    pub fn database_path(&self) -> Result<PathBuf> {
        match &self.database_path {
            Some(path) => Ok(paths::expand(&path.to_string_lossy())),
            None => paths::database_path(),
        }
    }

    pub fn database_options(&self) -> Result<DatabaseOptions> {
        Ok(DatabaseOptions::new(self.database_path()?).with_busy_timeout(self.busy_timeout()))
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    pub fn queue_poll_interval(&self) -> Duration {
        Duration::from_millis(self.queue_poll_interval_ms.max(1))
    }

    pub fn listener_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.listener_wait_timeout_ms.max(1))
    }
}
