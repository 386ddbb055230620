//! Remote encrypted snapshots: sshfs underneath, encfs on top.

use async_trait::async_trait;
use std::fs::DirBuilder;
use std::os::unix::fs::DirBuilderExt;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::warn;

use super::encfs::{encfs_command, require_password};
use super::ssh::{check_ssh, sshfs_command};
use crate::backend::{
    fuse_unmount, require_program, run_checked, CommandRunner, MountBackend, MountTarget,
};
use crate::spec::{MountMode, MountParams, MountSpec, SshParams};
use snapkeep_common::{Error, Password, Result};

/// Directory inside the hash dir holding the raw sshfs layer.
pub const SSH_LAYER_DIRNAME: &str = "ssh";

/// Mounts the remote encrypted volume with sshfs, then decrypts it.
pub struct SshEncfsBackend {
    ssh: SshParams,
    password: Option<Password>,
    runner: Arc<dyn CommandRunner>,
}

impl SshEncfsBackend {
    pub fn new(ssh: SshParams, password: Option<Password>, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            ssh,
            password,
            runner,
        }
    }

    /// Build from an `ssh_encfs` spec.
    pub fn from_spec(spec: &MountSpec, runner: Arc<dyn CommandRunner>) -> Result<Self> {
        match &spec.params {
            MountParams::SshEncfs { ssh, password } => {
                Ok(Self::new(ssh.clone(), password.clone(), runner))
            }
            other => Err(Error::InvalidInput(format!(
                "ssh_encfs backend cannot mount {} parameters",
                other.mode()
            ))),
        }
    }

    fn ssh_layer(target: &MountTarget) -> PathBuf {
        target.hash_dir.join(SSH_LAYER_DIRNAME)
    }
}

#[async_trait]
impl MountBackend for SshEncfsBackend {
    fn mode(&self) -> MountMode {
        MountMode::SshEncfs
    }

    fn runner(&self) -> &dyn CommandRunner {
        self.runner.as_ref()
    }

    async fn pre_mount_check(&self, first_run: bool) -> Result<()> {
        require_password(self.password.as_ref())?;
        require_program("encfs")?;
        check_ssh(&self.ssh, self.runner.as_ref(), first_run).await
    }

    async fn do_mount(&self, target: &MountTarget) -> Result<()> {
        let password = require_password(self.password.as_ref())?;
        let layer = Self::ssh_layer(target);
        DirBuilder::new().recursive(true).mode(0o700).create(&layer)?;

        let sshfs = sshfs_command(&self.ssh, &layer);
        run_checked(
            self.runner.as_ref(),
            &sshfs,
            &format!("Can't mount {}", sshfs.display()),
        )
        .await?;

        let encfs = encfs_command(&layer, &target.mountpoint, password);
        if let Err(e) = run_checked(
            self.runner.as_ref(),
            &encfs,
            &format!("Can't mount {}", encfs.display()),
        )
        .await
        {
            // Leave nothing half mounted behind.
            if let Err(undo) = fuse_unmount(self.runner.as_ref(), &layer).await {
                warn!("Failed to unmount ssh layer {:?}: {}", layer, undo);
            }
            return Err(e);
        }
        Ok(())
    }

    async fn do_umount(&self, target: &MountTarget) -> Result<()> {
        fuse_unmount(self.runner.as_ref(), &target.mountpoint).await?;
        fuse_unmount(self.runner.as_ref(), &Self::ssh_layer(target)).await
    }
}
