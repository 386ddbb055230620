//! Precondition on the external password cache daemon.
//!
//! The daemon itself lives elsewhere; this module only asks whether it
//! runs in the expected version and starts it through its CLI if not.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

use crate::backend::{run_checked, Command, CommandRunner};
use crate::process::ProcessProbe;
use crate::settings::PasswordCacheSettings;
use snapkeep_common::{Error, Result};

/// View of a running password cache.
pub trait PasswordCache: Send + Sync {
    /// Whether the daemon is running.
    fn status(&self) -> bool;

    /// Whether the running daemon speaks our version.
    fn check_version(&self) -> bool;
}

/// Password cache discovered through its pid and version files.
pub struct PidFilePasswordCache {
    pid_file: PathBuf,
    version_file: PathBuf,
    expected_version: String,
    probe: Arc<dyn ProcessProbe>,
}

impl PidFilePasswordCache {
    pub fn new(settings: &PasswordCacheSettings, probe: Arc<dyn ProcessProbe>) -> Self {
        Self {
            pid_file: settings.pid_file.clone(),
            version_file: settings.version_file.clone(),
            expected_version: settings.expected_version.clone(),
            probe,
        }
    }
}

impl PasswordCache for PidFilePasswordCache {
    fn status(&self) -> bool {
        fs::read_to_string(&self.pid_file)
            .ok()
            .and_then(|text| text.trim().parse::<u32>().ok())
            .is_some_and(|pid| self.probe.is_alive(pid))
    }

    fn check_version(&self) -> bool {
        fs::read_to_string(&self.version_file)
            .is_ok_and(|text| text.trim() == self.expected_version)
    }
}

/// Start the password cache unless it already runs in the right version.
///
/// # Errors
/// - `Config` if no start command is configured
/// - `Mount` if the start command fails
pub async fn ensure_password_cache(
    cache: &dyn PasswordCache,
    runner: &dyn CommandRunner,
    start_command: &[String],
) -> Result<()> {
    let running = cache.status();
    if running && cache.check_version() {
        debug!("Password cache is running");
        return Ok(());
    }

    let (program, args) = start_command
        .split_first()
        .ok_or_else(|| Error::Config("No password cache start command".to_string()))?;
    let command = args
        .iter()
        .fold(Command::new(program.clone()), |command, arg| command.arg(arg));

    if running {
        info!("Password cache runs a different version, restarting");
    } else {
        info!("Starting password cache");
    }
    run_checked(runner, &command, "Can't start password cache").await
}
