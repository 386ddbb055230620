//! Remote snapshots over sshfs.

use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

use crate::backend::{
    check_fuse, require_program, run_checked, Command, CommandRunner, MountBackend, MountTarget,
};
use crate::spec::{MountMode, MountParams, MountSpec, SshParams};
use snapkeep_common::{Error, Result};

/// Cipher value meaning "let ssh choose".
pub const DEFAULT_CIPHER: &str = "default";

/// Mounts `user@host:path` with sshfs.
pub struct SshBackend {
    ssh: SshParams,
    runner: Arc<dyn CommandRunner>,
}

impl SshBackend {
    pub fn new(ssh: SshParams, runner: Arc<dyn CommandRunner>) -> Self {
        Self { ssh, runner }
    }

    /// Build from an `ssh` spec.
    pub fn from_spec(spec: &MountSpec, runner: Arc<dyn CommandRunner>) -> Result<Self> {
        match &spec.params {
            MountParams::Ssh { ssh } => Ok(Self::new(ssh.clone(), runner)),
            other => Err(Error::InvalidInput(format!(
                "ssh backend cannot mount {} parameters",
                other.mode()
            ))),
        }
    }
}

/// `sshfs` invocation mounting the remote path onto `mountpoint`.
pub fn sshfs_command(ssh: &SshParams, mountpoint: &Path) -> Command {
    let mut command = Command::new("sshfs")
        .arg("-p")
        .arg(ssh.port.to_string())
        .arg("-o")
        .arg("idmap=user");
    if ssh.cipher != DEFAULT_CIPHER && !ssh.cipher.is_empty() {
        command = command.arg("-o").arg(format!("Ciphers={}", ssh.cipher));
    }
    if !ssh.private_key_file.is_empty() {
        command = command
            .arg("-o")
            .arg(format!("IdentityFile={}", ssh.private_key_file));
    }
    command
        .arg(format!("{}@{}:{}", ssh.user, ssh.host, ssh.path))
        .arg(mountpoint)
}

/// `ssh` invocation running `remote` on the host, non-interactively.
pub fn ssh_command(ssh: &SshParams, remote: &str) -> Command {
    let mut command = Command::new("ssh")
        .arg("-p")
        .arg(ssh.port.to_string())
        .arg("-o")
        .arg("BatchMode=yes");
    if ssh.cipher != DEFAULT_CIPHER && !ssh.cipher.is_empty() {
        command = command.arg("-c").arg(&ssh.cipher);
    }
    if !ssh.private_key_file.is_empty() {
        command = command.arg("-i").arg(&ssh.private_key_file);
    }
    command.arg(format!("{}@{}", ssh.user, ssh.host)).arg(remote)
}

fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

/// Static and remote checks shared by the ssh based backends.
pub async fn check_ssh(ssh: &SshParams, runner: &dyn CommandRunner, first_run: bool) -> Result<()> {
    if ssh.host.is_empty() {
        return Err(Error::Mount("No ssh host configured".to_string()));
    }
    if ssh.user.is_empty() {
        return Err(Error::Mount("No ssh user configured".to_string()));
    }
    if ssh.port == 0 {
        return Err(Error::Mount("Invalid ssh port 0".to_string()));
    }
    if !ssh.private_key_file.is_empty() && !Path::new(&ssh.private_key_file).is_file() {
        return Err(Error::Mount(format!(
            "Private key file {} not found",
            ssh.private_key_file
        )));
    }
    require_program("sshfs")?;
    check_fuse()?;

    if first_run && !ssh.path.is_empty() {
        info!("Creating remote folder {} on {}", ssh.path, ssh.host);
        let command = ssh_command(ssh, &format!("mkdir -p -- {}", shell_quote(&ssh.path)));
        run_checked(
            runner,
            &command,
            &format!("Remote folder {} not accessible", ssh.path),
        )
        .await?;
    }
    Ok(())
}

#[async_trait]
impl MountBackend for SshBackend {
    fn mode(&self) -> MountMode {
        MountMode::Ssh
    }

    fn runner(&self) -> &dyn CommandRunner {
        self.runner.as_ref()
    }

    async fn pre_mount_check(&self, first_run: bool) -> Result<()> {
        check_ssh(&self.ssh, self.runner.as_ref(), first_run).await
    }

    async fn do_mount(&self, target: &MountTarget) -> Result<()> {
        let command = sshfs_command(&self.ssh, &target.mountpoint);
        run_checked(
            self.runner.as_ref(),
            &command,
            &format!("Can't mount {}", command.display()),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::fake::RecordingRunner;
    use std::path::PathBuf;

    fn params() -> SshParams {
        SshParams {
            host: "nas".to_string(),
            port: 2222,
            user: "bob".to_string(),
            path: "/backups".to_string(),
            cipher: "aes128-ctr".to_string(),
            private_key_file: "/home/bob/.ssh/id".to_string(),
        }
    }

    #[test]
    fn test_sshfs_command_line() {
        let cmd = sshfs_command(&params(), Path::new("/mnt/ABCD/mountpoint"));
        assert_eq!(
            cmd.display(),
            "sshfs -p 2222 -o idmap=user -o Ciphers=aes128-ctr -o IdentityFile=/home/bob/.ssh/id bob@nas:/backups /mnt/ABCD/mountpoint"
        );
    }

    #[test]
    fn test_default_cipher_and_no_key_are_omitted() {
        let mut ssh = params();
        ssh.cipher = DEFAULT_CIPHER.to_string();
        ssh.private_key_file = String::new();
        let cmd = sshfs_command(&ssh, Path::new("/m"));
        assert_eq!(cmd.display(), "sshfs -p 2222 -o idmap=user bob@nas:/backups /m");
    }

    #[test]
    fn test_remote_command_is_quoted() {
        let cmd = ssh_command(&params(), &format!("mkdir -p -- {}", shell_quote("/it's")));
        assert!(cmd.display().ends_with("bob@nas mkdir -p -- '/it'\\''s'"));
    }

    #[test]
    fn test_from_spec_rejects_other_modes() {
        let spec = MountSpec::new(
            MountParams::Local {
                path: PathBuf::from("/x"),
            },
            0,
        );
        assert!(SshBackend::from_spec(&spec, Arc::new(RecordingRunner::default())).is_err());
    }

    #[tokio::test]
    async fn test_check_rejects_missing_host_and_key() {
        let runner = RecordingRunner::default();
        let mut ssh = params();
        ssh.host = String::new();
        assert!(check_ssh(&ssh, &runner, false).await.is_err());

        let mut ssh = params();
        ssh.private_key_file = "/nonexistent/key".to_string();
        let err = check_ssh(&ssh, &runner, false).await.unwrap_err();
        assert!(err.to_string().contains("Private key file"));
        assert!(runner.lines().is_empty());
    }

    #[tokio::test]
    async fn test_do_mount_runs_sshfs() {
        let runner = RecordingRunner::default();
        let backend = SshBackend::new(params(), Arc::new(runner.clone()));
        let target = MountTarget {
            hash_id: snapkeep_common::HashId::from_checksum(1),
            hash_dir: PathBuf::from("/r/00000001"),
            mountpoint: PathBuf::from("/r/00000001/mountpoint"),
        };

        backend.do_mount(&target).await.unwrap();
        assert!(runner.lines()[0].starts_with("sshfs -p 2222"));
    }
}
