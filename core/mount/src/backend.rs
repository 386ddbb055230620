//! Backend contract and the command runner transports go through.

use async_trait::async_trait;
use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error};

use crate::layout::{is_empty_dir, is_mount_point, MountLayout};
use crate::spec::MountMode;
use snapkeep_common::{Error, HashId, Password, Result};

/// An external command to run.
#[derive(Debug, Clone)]
pub struct Command {
    pub program: String,
    pub args: Vec<OsString>,
    /// Fed to the child's stdin, then stdin is closed.
    pub stdin: Option<Password>,
}

impl Command {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            stdin: None,
        }
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn stdin(mut self, secret: Password) -> Self {
        self.stdin = Some(secret);
        self
    }

    /// Program and arguments for log lines.
    pub fn display(&self) -> String {
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            line.push_str(&arg.to_string_lossy());
        }
        line
    }
}

/// What a finished command reported.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub success: bool,
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

/// Runs external commands.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run to completion and collect output.
    ///
    /// # Errors
    /// - `Mount` if the program cannot be found
    /// - I/O errors while spawning or talking to the child
    async fn run(&self, command: &Command) -> Result<CommandOutput>;
}

/// Runner spawning real processes.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, command: &Command) -> Result<CommandOutput> {
        debug!("Running {}", command.display());

        let mut child = tokio::process::Command::new(&command.program)
            .args(&command.args)
            .stdin(if command.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => {
                    Error::Mount(format!("{} not found. Please install it", command.program))
                }
                _ => Error::Io(e),
            })?;

        if let (Some(secret), Some(mut stdin)) = (&command.stdin, child.stdin.take()) {
            stdin.write_all(secret.expose().as_bytes()).await?;
            stdin.write_all(b"\n").await?;
        }

        let output = child.wait_with_output().await?;
        Ok(CommandOutput {
            success: output.status.success(),
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Run a command and turn a non-zero exit into a mount error.
pub async fn run_checked(runner: &dyn CommandRunner, command: &Command, what: &str) -> Result<()> {
    let output = runner.run(command).await?;
    if output.success {
        return Ok(());
    }
    error!("{} failed: {}", command.display(), output.stderr.trim());
    Err(Error::Mount(format!(
        "{}: {} exited with {}: {}",
        what,
        command.program,
        output
            .code
            .map_or_else(|| "signal".to_string(), |c| c.to_string()),
        output.stderr.trim()
    )))
}

/// Locate a program on `PATH`.
pub fn require_program(name: &str) -> Result<PathBuf> {
    which::which(name).map_err(|_| {
        Error::Mount(format!(
            "{} not found. Please install e.g. 'apt-get install {}'",
            name, name
        ))
    })
}

/// Make sure FUSE can be used by this user.
pub fn check_fuse() -> Result<()> {
    require_program("fusermount")?;
    if cfg!(target_os = "linux") && !Path::new("/dev/fuse").exists() {
        return Err(Error::Mount(
            "FUSE not available: /dev/fuse is missing".to_string(),
        ));
    }
    Ok(())
}

/// Where one mount happens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountTarget {
    pub hash_id: HashId,
    pub hash_dir: PathBuf,
    pub mountpoint: PathBuf,
}

impl MountTarget {
    pub fn new(layout: &MountLayout, hash_id: HashId) -> Self {
        Self {
            hash_id,
            hash_dir: layout.hash_dir(hash_id),
            mountpoint: layout.mountpoint(hash_id),
        }
    }
}

/// A concrete way of mounting snapshot storage.
///
/// Lifecycle and locking live in [`crate::MountControl`]; backends only
/// validate, mount and unmount.
#[async_trait]
pub trait MountBackend: Send + Sync {
    /// Mode this backend serves.
    fn mode(&self) -> MountMode;

    /// Runner for external commands.
    fn runner(&self) -> &dyn CommandRunner;

    /// Whether `mountpoint` is currently mounted.
    ///
    /// # Errors
    /// - `Mount` if it is not mounted but not empty either
    fn is_mounted(&self, mountpoint: &Path) -> Result<bool> {
        if is_mount_point(mountpoint)? {
            return Ok(true);
        }
        if mountpoint.is_dir() && !is_empty_dir(mountpoint)? {
            return Err(Error::Mount(format!(
                "mountpoint {} not empty.",
                mountpoint.display()
            )));
        }
        Ok(false)
    }

    /// Validate the configuration before mounting.
    async fn pre_mount_check(&self, _first_run: bool) -> Result<()> {
        Ok(())
    }

    /// Perform the mount.
    async fn do_mount(&self, target: &MountTarget) -> Result<()>;

    /// Verify the mount took effect.
    async fn post_mount_check(&self, target: &MountTarget) -> Result<()> {
        if self.is_mounted(&target.mountpoint)? {
            Ok(())
        } else {
            Err(Error::Mount(format!(
                "{} is not mounted after {} mount",
                target.mountpoint.display(),
                self.mode()
            )))
        }
    }

    async fn pre_umount_check(&self, _target: &MountTarget) -> Result<()> {
        Ok(())
    }

    /// Undo the mount. Defaults to `fusermount -u <mountpoint>`.
    async fn do_umount(&self, target: &MountTarget) -> Result<()> {
        fuse_unmount(self.runner(), &target.mountpoint).await
    }

    async fn post_umount_check(&self, _target: &MountTarget) -> Result<()> {
        Ok(())
    }
}

/// `fusermount -u <path>`.
pub async fn fuse_unmount(runner: &dyn CommandRunner, path: &Path) -> Result<()> {
    let command = Command::new("fusermount").arg("-u").arg(path);
    run_checked(
        runner,
        &command,
        &format!("Can't unmount {}", path.display()),
    )
    .await
}
