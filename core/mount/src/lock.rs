//! Filesystem based locks.
//!
//! Two kinds of PID-named lock files coordinate independent processes:
//!
//! - the process lock (`<mount_root>/<pid>.lock`) serializes structural
//!   changes to the mount root and is held only for a few filesystem calls;
//! - mount locks (`<hash_id>/locks/<pid>[.tmp].lock`) mark a process that
//!   depends on a mount and block others from unmounting it.
//!
//! Crashed holders are detected through [`ProcessProbe`]. Any scan that
//! meets a lock of a dead process deletes it together with the profile
//! symlinks of that process.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::layout::{parse_lock_file_name, MountLayout};
use crate::process::ProcessProbe;
use snapkeep_common::{Error, HashId, Result};

/// Default time to wait for the process lock.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(60);
/// Default pause between process lock attempts.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Scans lock directories on behalf of one process.
#[derive(Clone)]
pub struct LockScanner {
    layout: MountLayout,
    pid: u32,
    probe: Arc<dyn ProcessProbe>,
}

impl LockScanner {
    /// Create a scanner acting as process `pid`.
    pub fn new(layout: MountLayout, pid: u32, probe: Arc<dyn ProcessProbe>) -> Self {
        Self { layout, pid, probe }
    }

    /// Pid this scanner acts for.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Layout the scanner cleans up in.
    pub fn layout(&self) -> &MountLayout {
        &self.layout
    }

    /// Look for live foreign locks in `dir`, deleting stale ones on the way.
    ///
    /// A lock is our own when its pid is ours and its trial flag equals
    /// `own_tmp`; own locks are skipped. Locks of dead processes are removed
    /// along with every `*_<pid>` symlink in the mount root, and the scan
    /// continues. Returns true at the first lock of a live process.
    pub fn scan_and_reclaim_stale_locks(&self, dir: &Path, own_tmp: bool) -> Result<bool> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };

        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            let Some((lock_pid, is_tmp)) = name.to_str().and_then(parse_lock_file_name) else {
                continue;
            };

            if lock_pid == self.pid && is_tmp == own_tmp {
                continue;
            }

            if self.probe.is_alive(lock_pid) {
                return Ok(true);
            }

            debug!("Removing stale lock {:?} of dead process {}", entry.path(), lock_pid);
            remove_if_present(&entry.path())?;
            self.remove_symlinks_of(lock_pid)?;
        }

        Ok(false)
    }

    /// Delete the profile symlinks a process left in the mount root.
    fn remove_symlinks_of(&self, pid: u32) -> Result<()> {
        let suffix = format!("_{}", pid);
        let entries = match fs::read_dir(self.layout.root()) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        for entry in entries {
            let entry = entry?;
            let is_link_of_pid = entry
                .file_name()
                .to_str()
                .is_some_and(|name| name.ends_with(&suffix));
            if is_link_of_pid && entry.file_type()?.is_symlink() {
                debug!("Removing stale symlink {:?}", entry.path());
                remove_if_present(&entry.path())?;
            }
        }
        Ok(())
    }
}

/// Mutex over structural changes to the mount root.
pub struct ProcessLock {
    scanner: LockScanner,
    timeout: Duration,
    poll_interval: Duration,
}

impl ProcessLock {
    /// Create a process lock with the given timing.
    pub fn new(scanner: LockScanner, timeout: Duration, poll_interval: Duration) -> Self {
        Self {
            scanner,
            timeout,
            poll_interval,
        }
    }

    /// Our lock file.
    pub fn path(&self) -> PathBuf {
        self.scanner.layout().process_lock_file(self.scanner.pid())
    }

    /// Whether another live process holds the lock right now.
    pub fn is_held(&self) -> Result<bool> {
        self.scanner
            .scan_and_reclaim_stale_locks(self.scanner.layout().root(), false)
    }

    /// Wait for the lock, then take it.
    ///
    /// Our lock file is created and the root scanned again; if a rival
    /// showed up in between, the file is withdrawn and the attempt repeated
    /// after a jittered pause.
    ///
    /// # Errors
    /// - `LockTimeout` if the lock stays contended for the whole timeout
    /// - I/O errors while scanning or writing the lock file
    pub async fn acquire(&self) -> Result<ProcessLockGuard> {
        let started = Instant::now();
        let path = self.path();

        loop {
            if !self.is_held()? {
                write_pid_file(&path, self.scanner.pid())?;
                if !self.is_held()? {
                    debug!("Acquired process lock {:?}", path);
                    return Ok(ProcessLockGuard { path });
                }
                debug!("Process lock contended, backing off");
                remove_if_present(&path)?;
            }

            if started.elapsed() >= self.timeout {
                warn!("Mountprocess lock timeout in {:?}", self.scanner.layout().root());
                return Err(Error::LockTimeout {
                    path: self.scanner.layout().root().to_path_buf(),
                    waited: started.elapsed(),
                });
            }

            let jitter = 0.75 + rand::random::<f64>() * 0.5;
            sleep(self.poll_interval.mul_f64(jitter)).await;
        }
    }

    /// Remove our lock file if present. Idempotent.
    pub fn release(&self) -> Result<()> {
        remove_if_present(&self.path())
    }
}

/// Held process lock; released on drop.
#[derive(Debug)]
pub struct ProcessLockGuard {
    path: PathBuf,
}

impl ProcessLockGuard {
    /// Release explicitly, reporting failures.
    pub fn release(mut self) -> Result<()> {
        let path = std::mem::take(&mut self.path);
        remove_if_present(&path)
    }
}

impl Drop for ProcessLockGuard {
    fn drop(&mut self) {
        if self.path.as_os_str().is_empty() {
            return;
        }
        if let Err(e) = remove_if_present(&self.path) {
            warn!("Failed to release process lock {:?}: {}", self.path, e);
        } else {
            debug!("Released process lock {:?}", self.path);
        }
    }
}

/// A process's claim on a mount.
pub struct MountLock {
    scanner: LockScanner,
    hash_id: HashId,
    tmp: bool,
}

impl MountLock {
    /// Mount lock of the scanner's process on `hash_id`.
    pub fn new(scanner: LockScanner, hash_id: HashId, tmp: bool) -> Self {
        Self {
            scanner,
            hash_id,
            tmp,
        }
    }

    /// Our lock file.
    pub fn path(&self) -> PathBuf {
        self.scanner
            .layout()
            .mount_lock_file(self.hash_id, self.scanner.pid(), self.tmp)
    }

    /// Record that this process depends on the mount.
    pub fn acquire(&self) -> Result<()> {
        write_pid_file(&self.path(), self.scanner.pid())
    }

    /// Drop this process's claim. Idempotent.
    pub fn release(&self) -> Result<()> {
        remove_if_present(&self.path())
    }

    /// Whether any other live process still depends on the mount.
    pub fn is_held_by_others(&self) -> Result<bool> {
        self.scanner.scan_and_reclaim_stale_locks(
            &self.scanner.layout().locks_dir(self.hash_id),
            self.tmp,
        )
    }
}

fn write_pid_file(path: &Path, pid: u32) -> Result<()> {
    let mut file = match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(file) => file,
        // A leftover of our own pid, e.g. after pid reuse. It is ours now.
        Err(e) if e.kind() == ErrorKind::AlreadyExists => {
            OpenOptions::new().write(true).truncate(true).open(path)?
        }
        Err(e) => return Err(e.into()),
    };
    file.write_all(pid.to_string().as_bytes())?;
    Ok(())
}

fn remove_if_present(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
