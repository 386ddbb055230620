//! Persisted hash collision salt.

use std::fs::{self, DirBuilder};
use std::io::{ErrorKind, Write};
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::debug;

use snapkeep_common::{Error, Result};

/// Collision salt read once at startup and written back on every bump.
#[derive(Debug)]
pub struct SaltStore {
    path: Option<PathBuf>,
    value: AtomicU32,
}

impl SaltStore {
    /// Load the salt from `path`; a missing file means 0.
    ///
    /// # Errors
    /// - `Config` if the file holds anything but an unsigned integer
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let value = match fs::read_to_string(&path) {
            Ok(text) => text.trim().parse::<u32>().map_err(|e| {
                Error::Config(format!("Invalid hash_collision in {}: {}", path.display(), e))
            })?,
            Err(e) if e.kind() == ErrorKind::NotFound => 0,
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path: Some(path),
            value: AtomicU32::new(value),
        })
    }

    /// A salt that lives only in this process.
    pub fn in_memory(initial: u32) -> Self {
        Self {
            path: None,
            value: AtomicU32::new(initial),
        }
    }

    /// Current salt.
    pub fn current(&self) -> u32 {
        self.value.load(Ordering::SeqCst)
    }

    /// Bump the salt and persist the new value.
    pub fn increment(&self) -> Result<u32> {
        let previous = self
            .value
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_add(1))
            .map_err(|_| Error::Config("hash_collision overflow".to_string()))?;
        let next = previous + 1;
        if let Some(path) = &self.path {
            persist(path, next)?;
        }
        debug!("hash_collision is now {}", next);
        Ok(next)
    }
}

fn persist(path: &Path, value: u32) -> Result<()> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    DirBuilder::new().recursive(true).mode(0o700).create(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(value.to_string().as_bytes())?;
    tmp.persist(path).map_err(|e| Error::Io(e.error))?;
    Ok(())
}
