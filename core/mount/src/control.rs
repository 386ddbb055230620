//! Mount/unmount lifecycle of one spec in one process.
//!
//! ```text
//! Unmounted -> Checking -> Mounting -> Mounted -> Unmounting -> Unmounted
//! ```
//!
//! Every structural change (mount status, umount info, symlinks) happens
//! while the process lock is held; the guard releases it on every path.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::backend::{MountBackend, MountTarget};
use crate::hash::compute_hash;
use crate::layout::{is_empty_dir, MountLayout};
use crate::lock::{
    LockScanner, MountLock, ProcessLock, DEFAULT_LOCK_TIMEOUT, DEFAULT_POLL_INTERVAL,
};
use crate::process::ProcessProbe;
use crate::salt::SaltStore;
use crate::spec::MountSpec;
use crate::symlink::ProfileLink;
use snapkeep_common::{Error, HashId, ProfileId, Result};

/// Process-wide environment shared by every mount attempt.
pub struct MountContext {
    pub layout: MountLayout,
    /// Pid all locks and symlinks are named after.
    pub pid: u32,
    pub probe: Arc<dyn ProcessProbe>,
    pub salt: Arc<SaltStore>,
    pub lock_timeout: Duration,
    pub poll_interval: Duration,
}

impl MountContext {
    /// Context with default lock timing.
    pub fn new(
        layout: MountLayout,
        pid: u32,
        probe: Arc<dyn ProcessProbe>,
        salt: Arc<SaltStore>,
    ) -> Self {
        Self {
            layout,
            pid,
            probe,
            salt,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Set lock timing.
    pub fn with_lock_timing(mut self, timeout: Duration, poll_interval: Duration) -> Self {
        self.lock_timeout = timeout;
        self.poll_interval = poll_interval;
        self
    }

    pub fn scanner(&self) -> LockScanner {
        LockScanner::new(self.layout.clone(), self.pid, self.probe.clone())
    }

    pub fn process_lock(&self) -> ProcessLock {
        ProcessLock::new(self.scanner(), self.lock_timeout, self.poll_interval)
    }
}

/// Per-attempt knobs.
#[derive(Debug, Clone)]
pub struct MountOptions {
    /// Profile the symlink is named after.
    pub profile: ProfileId,
    /// Trial mount with separate locks and symlinks.
    pub tmp_mount: bool,
    /// Maintain the profile symlink.
    pub symlink: bool,
    /// Point the symlink at this folder inside the mount.
    pub symlink_subfolder: Option<PathBuf>,
}

impl MountOptions {
    pub fn new(profile: ProfileId) -> Self {
        Self {
            profile,
            tmp_mount: false,
            symlink: true,
            symlink_subfolder: None,
        }
    }
}

/// Lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountState {
    Unmounted,
    Checking,
    Mounting,
    Mounted,
    Unmounting,
}

/// What an unmount request ended up doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UmountOutcome {
    /// The backend unmounted the filesystem.
    Unmounted,
    /// Nothing was mounted.
    NotMounted,
    /// Another live process still uses the mount; it stays mounted.
    StillInUse,
}

/// Drives one backend through mount and unmount.
pub struct MountControl {
    ctx: Arc<MountContext>,
    spec: MountSpec,
    hash_id: HashId,
    backend: Box<dyn MountBackend>,
    options: MountOptions,
    state: MountState,
}

impl MountControl {
    /// Prepare a mount of `spec` through `backend`.
    ///
    /// # Errors
    /// - Spec cannot be rendered for hashing
    pub fn new(
        ctx: Arc<MountContext>,
        spec: MountSpec,
        backend: Box<dyn MountBackend>,
        options: MountOptions,
    ) -> Result<Self> {
        let hash_id = compute_hash(&spec)?;
        Ok(Self {
            ctx,
            spec,
            hash_id,
            backend,
            options,
            state: MountState::Unmounted,
        })
    }

    pub fn hash_id(&self) -> HashId {
        self.hash_id
    }

    pub fn spec(&self) -> &MountSpec {
        &self.spec
    }

    pub fn state(&self) -> MountState {
        self.state
    }

    pub fn mountpoint(&self) -> PathBuf {
        self.ctx.layout.mountpoint(self.hash_id)
    }

    fn target(&self) -> MountTarget {
        MountTarget::new(&self.ctx.layout, self.hash_id)
    }

    fn mount_lock(&self) -> MountLock {
        MountLock::new(self.ctx.scanner(), self.hash_id, self.options.tmp_mount)
    }

    fn link_for(&self, profile: ProfileId) -> ProfileLink {
        ProfileLink::new(
            self.ctx.layout.clone(),
            profile,
            self.ctx.pid,
            self.options.tmp_mount,
        )
    }

    fn transition(&mut self, next: MountState) {
        debug!("{}: {:?} -> {:?}", self.hash_id, self.state, next);
        self.state = next;
    }

    /// Backend validation without mounting.
    pub async fn pre_mount_check(&self, first_run: bool) -> Result<()> {
        self.backend.pre_mount_check(first_run).await
    }

    /// Mount, or attach to an identical existing mount.
    ///
    /// # Postconditions
    /// - Mounted, umount info written, mount lock held, symlink set
    ///
    /// # Errors
    /// - `HashCollision` if a different spec is mounted under this hash id;
    ///   the salt has already been incremented
    /// - `LockTimeout` and backend `Mount` errors
    pub async fn mount(&mut self, check: bool) -> Result<HashId> {
        self.transition(MountState::Checking);
        let outcome = self.mount_guarded(check).await;
        if outcome.is_err() {
            self.transition(MountState::Unmounted);
        }
        outcome
    }

    async fn mount_guarded(&mut self, check: bool) -> Result<HashId> {
        self.ctx.layout.create_structure(self.hash_id)?;
        let guard = self.ctx.process_lock().acquire().await?;
        // On error the guard is dropped, which releases the lock.
        let id = self.mount_locked(check).await?;
        guard.release()?;
        Ok(id)
    }

    async fn mount_locked(&mut self, check: bool) -> Result<HashId> {
        let target = self.target();

        if self.backend.is_mounted(&target.mountpoint)? {
            if !self.compare_umount_info()? {
                let salt = self.ctx.salt.increment()?;
                warn!(
                    "Hash collision occurred in hash_id {}. Incrementing global value hash_collision and try again.",
                    self.hash_id
                );
                return Err(Error::HashCollision {
                    hash_id: self.hash_id.to_string(),
                    salt,
                });
            }
            info!("Mountpoint {} is already mounted", target.mountpoint.display());
        } else {
            if check {
                self.backend.pre_mount_check(false).await?;
            }
            self.transition(MountState::Mounting);
            self.backend.do_mount(&target).await?;
            self.backend.post_mount_check(&target).await?;
            info!(
                "mount {} on {}",
                self.spec.mode(),
                target.mountpoint.display()
            );
            self.ctx.layout.write_umount_info(self.hash_id, &self.spec)?;
        }

        self.transition(MountState::Mounted);
        self.mount_lock().acquire()?;
        if self.options.symlink {
            self.link_for(self.options.profile.clone())
                .set(self.hash_id, self.options.symlink_subfolder.as_deref())?;
        }
        Ok(self.hash_id)
    }

    /// Unmount unless another live process still depends on the mount.
    ///
    /// Always drops this process's mount lock and symlink on success.
    ///
    /// # Errors
    /// - `LockTimeout`
    /// - `Mount` from the backend, or a stray non-empty unmounted mountpoint
    pub async fn umount(&mut self) -> Result<UmountOutcome> {
        let guard = self.ctx.process_lock().acquire().await?;
        let outcome = self.umount_locked().await?;
        self.mount_lock().release()?;
        if self.options.symlink {
            self.link_for(self.options.profile.clone()).remove()?;
        }
        guard.release()?;
        Ok(outcome)
    }

    async fn umount_locked(&mut self) -> Result<UmountOutcome> {
        let target = self.target();

        if !self.ctx.layout.hash_dir_exists(self.hash_id) {
            info!("Mountpoint {} does not exist", target.mountpoint.display());
            return Ok(UmountOutcome::NotMounted);
        }
        if !self.backend.is_mounted(&target.mountpoint)? {
            info!("Mountpoint {} is not mounted", target.mountpoint.display());
            self.transition(MountState::Unmounted);
            return Ok(UmountOutcome::NotMounted);
        }
        if self.mount_lock().is_held_by_others()? {
            info!(
                "Mountpoint {} still in use. Keep mounted",
                target.mountpoint.display()
            );
            return Ok(UmountOutcome::StillInUse);
        }

        self.transition(MountState::Unmounting);
        self.backend.pre_umount_check(&target).await?;
        self.backend.do_umount(&target).await?;
        self.backend.post_umount_check(&target).await?;
        self.transition(MountState::Unmounted);

        if target.mountpoint.is_dir() && !is_empty_dir(&target.mountpoint)? {
            warn!(
                "Mountpoint {} not empty after unmount",
                target.mountpoint.display()
            );
        } else {
            info!(
                "unmount {} from {}",
                self.spec.mode(),
                target.mountpoint.display()
            );
        }
        Ok(UmountOutcome::Unmounted)
    }

    /// Whether the persisted umount info describes our spec.
    ///
    /// Missing umount info never matches.
    pub fn compare_umount_info(&self) -> Result<bool> {
        match self.ctx.layout.read_umount_value(self.hash_id) {
            Ok(persisted) => self.spec.matches_umount_value(&persisted),
            Err(Error::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Whether a switch from the mount `old` can reuse it as is.
    pub fn compare_remount(&self, old: HashId) -> Result<bool> {
        if old != self.hash_id {
            return Ok(false);
        }
        self.compare_umount_info()
    }

    /// Move the symlink from `from` to our profile on the existing mount.
    pub async fn swap_symlink(&self, from: &ProfileId) -> Result<()> {
        let guard = self.ctx.process_lock().acquire().await?;
        let old = self.link_for(from.clone());
        old.remove()?;
        old.for_profile(self.options.profile.clone())
            .set(self.hash_id, self.options.symlink_subfolder.as_deref())?;
        guard.release()
    }
}
