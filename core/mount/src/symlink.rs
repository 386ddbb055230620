//! Per-profile symlinks into shared mountpoints.
//!
//! Profiles whose specs hash alike share one mount; each (profile, process)
//! pair reaches it through its own symlink in the mount root. Removing a
//! symlink never unmounts anything.

use std::fs;
use std::io::ErrorKind;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::layout::MountLayout;
use snapkeep_common::{HashId, ProfileId, Result};

/// The symlink of one profile in one process.
#[derive(Debug, Clone)]
pub struct ProfileLink {
    layout: MountLayout,
    profile: ProfileId,
    pid: u32,
    tmp: bool,
}

impl ProfileLink {
    pub fn new(layout: MountLayout, profile: ProfileId, pid: u32, tmp: bool) -> Self {
        Self {
            layout,
            profile,
            pid,
            tmp,
        }
    }

    /// Where the symlink lives.
    pub fn path(&self) -> PathBuf {
        self.layout.symlink_path(&self.profile, self.pid, self.tmp)
    }

    /// Point the symlink at the mountpoint of `hash_id`, or a subfolder of it.
    ///
    /// An existing symlink is replaced.
    pub fn set(&self, hash_id: HashId, subfolder: Option<&Path>) -> Result<PathBuf> {
        let mountpoint = self.layout.mountpoint(hash_id);
        let target = match subfolder {
            Some(sub) => mountpoint.join(sub),
            None => mountpoint,
        };
        let path = self.path();
        self.remove()?;
        symlink(&target, &path)?;
        debug!("Symlink {:?} -> {:?}", path, target);
        Ok(path)
    }

    /// Remove the symlink if present. Idempotent.
    pub fn remove(&self) -> Result<()> {
        let path = self.path();
        // symlink_metadata so dangling links are found too
        match fs::symlink_metadata(&path) {
            Ok(_) => {
                fs::remove_file(&path)?;
                debug!("Removed symlink {:?}", path);
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// The same profile link for another profile.
    pub fn for_profile(&self, profile: ProfileId) -> Self {
        Self {
            profile,
            ..self.clone()
        }
    }
}
