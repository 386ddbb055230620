//! On-disk layout of the mount root.
//!
//! ```text
//! <mount_root>/
//!   <pid>.lock                 process lock
//!   <hash_id>/
//!     mountpoint/              real mount target
//!     umount                   persisted mount spec (JSON)
//!     locks/
//!       <pid>.lock             mount lock
//!       <pid>.tmp.lock         mount lock of a trial mount
//!   <profile_id>_<pid>         symlink into mountpoint
//!   tmp_<profile_id>_<pid>     symlink of a trial mount
//! ```

use serde_json::Value;
use std::fs::{self, DirBuilder};
use std::io::Write;
use std::os::unix::fs::{DirBuilderExt, MetadataExt};
use std::path::{Path, PathBuf};

use crate::spec::MountSpec;
use snapkeep_common::{Error, HashId, ProfileId, Result};

/// Suffix shared by process and mount locks.
pub const LOCK_SUFFIX: &str = ".lock";
/// Infix marking a trial mount lock.
pub const TMP_INFIX: &str = ".tmp";
/// Prefix of trial mount symlinks.
pub const TMP_SYMLINK_PREFIX: &str = "tmp_";

const MOUNTPOINT_DIRNAME: &str = "mountpoint";
const LOCKS_DIRNAME: &str = "locks";
const UMOUNT_FILENAME: &str = "umount";

/// Paths under a single mount root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountLayout {
    root: PathBuf,
}

impl MountLayout {
    /// Create a layout rooted at `root`. Nothing is touched on disk.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The mount root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory owned by one hash id.
    pub fn hash_dir(&self, id: HashId) -> PathBuf {
        self.root.join(id.to_string())
    }

    /// Where the backend mounts.
    pub fn mountpoint(&self, id: HashId) -> PathBuf {
        self.hash_dir(id).join(MOUNTPOINT_DIRNAME)
    }

    /// Directory holding mount locks.
    pub fn locks_dir(&self, id: HashId) -> PathBuf {
        self.hash_dir(id).join(LOCKS_DIRNAME)
    }

    /// Persisted spec used for unmounting and collision checks.
    pub fn umount_info(&self, id: HashId) -> PathBuf {
        self.hash_dir(id).join(UMOUNT_FILENAME)
    }

    /// Process lock file of `pid`.
    pub fn process_lock_file(&self, pid: u32) -> PathBuf {
        self.root.join(lock_file_name(pid, false))
    }

    /// Mount lock file of `pid` for `id`.
    pub fn mount_lock_file(&self, id: HashId, pid: u32, tmp: bool) -> PathBuf {
        self.locks_dir(id).join(lock_file_name(pid, tmp))
    }

    /// Symlink a profile uses to reach its mount.
    pub fn symlink_path(&self, profile: &ProfileId, pid: u32, tmp: bool) -> PathBuf {
        let prefix = if tmp { TMP_SYMLINK_PREFIX } else { "" };
        self.root.join(format!("{}{}_{}", prefix, profile, pid))
    }

    /// Create root, hash dir, mountpoint and locks dir. Idempotent.
    pub fn create_structure(&self, id: HashId) -> Result<()> {
        for dir in [
            self.root.clone(),
            self.hash_dir(id),
            self.mountpoint(id),
            self.locks_dir(id),
        ] {
            mkdir_private(&dir)?;
        }
        Ok(())
    }

    /// Whether anything exists for `id`.
    pub fn hash_dir_exists(&self, id: HashId) -> bool {
        self.hash_dir(id).is_dir()
    }

    /// Persist `spec` as the umount info of `id`.
    ///
    /// Written through a temporary file and renamed into place.
    pub fn write_umount_info(&self, id: HashId, spec: &MountSpec) -> Result<()> {
        let data = serde_json::to_vec_pretty(&Value::Object(spec.to_umount_value()?))?;
        let mut tmp = tempfile::NamedTempFile::new_in(self.hash_dir(id))?;
        tmp.write_all(&data)?;
        tmp.as_file().sync_all()?;
        tmp.persist(self.umount_info(id)).map_err(|e| Error::Io(e.error))?;
        Ok(())
    }

    /// Raw umount info of `id`.
    pub fn read_umount_value(&self, id: HashId) -> Result<Value> {
        let path = self.umount_info(id);
        let data = fs::read(&path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => {
                Error::NotFound(format!("No umount info at {}", path.display()))
            }
            _ => Error::Io(e),
        })?;
        Ok(serde_json::from_slice(&data)?)
    }

    /// Umount info of `id` parsed back into a spec.
    pub fn read_umount_info(&self, id: HashId) -> Result<MountSpec> {
        MountSpec::from_umount_value(self.read_umount_value(id)?)
    }
}

/// `<pid>.lock` or `<pid>.tmp.lock`.
pub fn lock_file_name(pid: u32, tmp: bool) -> String {
    if tmp {
        format!("{}{}{}", pid, TMP_INFIX, LOCK_SUFFIX)
    } else {
        format!("{}{}", pid, LOCK_SUFFIX)
    }
}

/// Split a lock file name into owner pid and trial flag.
///
/// Returns `None` for anything that is not a lock file.
pub fn parse_lock_file_name(name: &str) -> Option<(u32, bool)> {
    let stem = name.strip_suffix(LOCK_SUFFIX)?;
    let (pid, tmp) = match stem.strip_suffix(TMP_INFIX) {
        Some(pid) => (pid, true),
        None => (stem, false),
    };
    pid.parse().ok().map(|pid| (pid, tmp))
}

fn mkdir_private(dir: &Path) -> Result<()> {
    DirBuilder::new().recursive(true).mode(0o700).create(dir)?;
    Ok(())
}

/// Whether `path` is the root of a mounted filesystem.
///
/// Symlinks never count. Otherwise the path is a mount point if its
/// device differs from its parent's, or if it is its own parent.
pub fn is_mount_point(path: &Path) -> Result<bool> {
    let meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e.into()),
    };
    if meta.file_type().is_symlink() {
        return Ok(false);
    }
    let parent = fs::metadata(path.join(".."))?;
    Ok(meta.dev() != parent.dev() || meta.ino() == parent.ino())
}

/// Whether a directory has no entries.
pub fn is_empty_dir(path: &Path) -> Result<bool> {
    Ok(fs::read_dir(path)?.next().is_none())
}
