//! Local encrypted snapshots through encfs.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::backend::{
    check_fuse, require_program, run_checked, Command, CommandRunner, MountBackend, MountTarget,
};
use crate::spec::{MountMode, MountParams, MountSpec};
use snapkeep_common::{Error, Password, Result};

/// Config file encfs keeps at the root of an encrypted volume.
pub const ENCFS_CONFIG: &str = ".encfs6.xml";

/// Decrypts a local directory onto the mountpoint.
pub struct EncfsBackend {
    path: PathBuf,
    password: Option<Password>,
    runner: Arc<dyn CommandRunner>,
}

impl EncfsBackend {
    pub fn new(path: PathBuf, password: Option<Password>, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            path,
            password,
            runner,
        }
    }

    /// Build from a `local_encfs` spec.
    pub fn from_spec(spec: &MountSpec, runner: Arc<dyn CommandRunner>) -> Result<Self> {
        match &spec.params {
            MountParams::LocalEncfs { path, password } => {
                Ok(Self::new(path.clone(), password.clone(), runner))
            }
            other => Err(Error::InvalidInput(format!(
                "local_encfs backend cannot mount {} parameters",
                other.mode()
            ))),
        }
    }
}

/// `encfs --stdinpass <source> <mountpoint>`, password on stdin.
pub fn encfs_command(source: &Path, mountpoint: &Path, password: &Password) -> Command {
    Command::new("encfs")
        .arg("--stdinpass")
        .arg(source)
        .arg(mountpoint)
        .stdin(password.clone())
}

/// Password required by the encfs backends.
pub fn require_password(password: Option<&Password>) -> Result<&Password> {
    match password {
        Some(pw) if !pw.is_empty() => Ok(pw),
        _ => Err(Error::Mount("No encfs password available".to_string())),
    }
}

#[async_trait]
impl MountBackend for EncfsBackend {
    fn mode(&self) -> MountMode {
        MountMode::LocalEncfs
    }

    fn runner(&self) -> &dyn CommandRunner {
        self.runner.as_ref()
    }

    /// The source must exist; outside a first run it must already be an
    /// encfs volume.
    async fn pre_mount_check(&self, first_run: bool) -> Result<()> {
        if !self.path.is_dir() {
            return Err(Error::Mount(format!(
                "{} is not a directory",
                self.path.display()
            )));
        }
        if !first_run && !self.path.join(ENCFS_CONFIG).is_file() {
            return Err(Error::Mount(format!(
                "{} is not an encfs volume",
                self.path.display()
            )));
        }
        require_password(self.password.as_ref())?;
        require_program("encfs")?;
        check_fuse()
    }

    async fn do_mount(&self, target: &MountTarget) -> Result<()> {
        let password = require_password(self.password.as_ref())?;
        let command = encfs_command(&self.path, &target.mountpoint, password);
        run_checked(
            self.runner.as_ref(),
            &command,
            &format!("Can't mount {}", command.display()),
        )
        .await
    }
}
