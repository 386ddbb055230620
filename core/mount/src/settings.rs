//! User settings consumed by the mount layer.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, DirBuilder};
use std::io::{ErrorKind, Write};
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::lock::{DEFAULT_LOCK_TIMEOUT, DEFAULT_POLL_INTERVAL};
use crate::spec::MountParams;
use snapkeep_common::{Error, ProfileId, Result};

/// Application directory name under the XDG base dirs.
pub const APP_DIRNAME: &str = "snapkeep";
/// Settings file name.
pub const SETTINGS_FILENAME: &str = "settings.json";
/// Collision salt file name, next to the settings by default.
pub const SALT_FILENAME: &str = "hash_collision";
/// Default cap on salted mount retries.
pub const DEFAULT_MAX_COLLISION_RETRIES: u32 = 16;

fn data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(APP_DIRNAME)
}

/// Where the password cache daemon lives and how to start it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PasswordCacheSettings {
    /// Check the daemon before mounting password protected modes.
    pub enabled: bool,
    /// Pid file the daemon writes.
    pub pid_file: PathBuf,
    /// File holding the running daemon's version.
    pub version_file: PathBuf,
    /// Version this build talks to.
    pub expected_version: String,
    /// Command line starting the daemon.
    pub start_command: Vec<String>,
}

impl Default for PasswordCacheSettings {
    fn default() -> Self {
        let dir = data_dir();
        Self {
            enabled: false,
            pid_file: dir.join("password_cache.pid"),
            version_file: dir.join("password_cache.version"),
            expected_version: env!("CARGO_PKG_VERSION").to_string(),
            start_command: vec!["snapkeep-pwcache".to_string(), "start".to_string()],
        }
    }
}

/// Snapshot storage of one profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileSettings {
    /// Backend parameters, tagged with `mode`.
    #[serde(flatten)]
    pub params: MountParams,
    /// Folder inside the mount the profile symlink points at.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symlink_subfolder: Option<PathBuf>,
}

/// Settings document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Root of the shared mount tree.
    pub mount_root: PathBuf,
    /// How long to wait for the process lock.
    pub lock_timeout_secs: u64,
    /// Pause between process lock attempts.
    pub lock_poll_interval_ms: u64,
    /// Salted retries before a mount gives up.
    pub max_collision_retries: u32,
    /// Collision salt file; defaults to one next to the settings file.
    pub salt_file: Option<PathBuf>,
    pub password_cache: PasswordCacheSettings,
    pub profiles: BTreeMap<ProfileId, ProfileSettings>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            mount_root: data_dir().join("mnt"),
            lock_timeout_secs: DEFAULT_LOCK_TIMEOUT.as_secs(),
            lock_poll_interval_ms: DEFAULT_POLL_INTERVAL.as_millis() as u64,
            max_collision_retries: DEFAULT_MAX_COLLISION_RETRIES,
            salt_file: None,
            password_cache: PasswordCacheSettings::default(),
            profiles: BTreeMap::new(),
        }
    }
}

impl Settings {
    /// `$XDG_CONFIG_HOME/snapkeep/settings.json`.
    pub fn default_path() -> Result<PathBuf> {
        dirs::config_dir()
            .map(|dir| dir.join(APP_DIRNAME).join(SETTINGS_FILENAME))
            .ok_or_else(|| Error::Config("No configuration directory available".to_string()))
    }

    /// Load settings; a missing file yields defaults.
    ///
    /// # Errors
    /// - `Config` for unreadable JSON
    pub fn load(path: &Path) -> Result<Self> {
        match fs::read(path) {
            Ok(data) => serde_json::from_slice(&data).map_err(|e| {
                Error::Config(format!("Invalid settings in {}: {}", path.display(), e))
            }),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("No settings at {}, using defaults", path.display());
                Ok(Self::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Write settings atomically.
    pub fn save(&self, path: &Path) -> Result<()> {
        let dir = match path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        DirBuilder::new().recursive(true).mode(0o700).create(dir)?;
        let data = serde_json::to_vec_pretty(self)?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(&data)?;
        tmp.persist(path).map_err(|e| Error::Io(e.error))?;
        Ok(())
    }

    /// Settings of one profile.
    pub fn profile(&self, id: &ProfileId) -> Result<&ProfileSettings> {
        self.profiles
            .get(id)
            .ok_or_else(|| Error::NotFound(format!("Profile '{}' is not configured", id)))
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }

    pub fn lock_poll_interval(&self) -> Duration {
        Duration::from_millis(self.lock_poll_interval_ms)
    }

    /// Collision salt file for settings stored at `settings_path`.
    pub fn salt_path(&self, settings_path: &Path) -> PathBuf {
        match &self.salt_file {
            Some(path) => path.clone(),
            None => settings_path.with_file_name(SALT_FILENAME),
        }
    }
}
