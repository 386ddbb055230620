//! Common error types for snapkeep.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Top-level error type for mount operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Precondition, transport or postcondition failure of a mount.
    #[error("Mount error: {0}")]
    Mount(String),

    /// The process lock could not be taken in time.
    #[error("Mountprocess lock timeout after {waited:?} in {path:?}")]
    LockTimeout { path: PathBuf, waited: Duration },

    /// A different mount already lives under this hash id.
    #[error("Hash collision occurred in hash_id {hash_id}. Incremented hash_collision to {salt}")]
    HashCollision { hash_id: String, salt: u32 },

    /// Salted retries gave up without finding a free hash id.
    #[error("Gave up resolving hash collisions after {attempts} attempts")]
    CollisionRetriesExhausted { attempts: u32 },

    /// Settings are missing or malformed.
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Resource already exists.
    #[error("Already exists: {0}")]
    AlreadyExists(String),
}

impl Error {
    /// Whether the orchestrator should retry with a fresh hash id.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::HashCollision { .. })
    }

    /// Whether this is a user-actionable mount failure.
    pub fn is_mount_failure(&self) -> bool {
        matches!(self, Error::Mount(_) | Error::LockTimeout { .. })
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_collisions_are_retryable() {
        let collision = Error::HashCollision {
            hash_id: "0000ABCD".to_string(),
            salt: 1,
        };
        assert!(collision.is_retryable());
        assert!(!collision.is_mount_failure());
        assert!(!Error::Mount("boom".to_string()).is_retryable());
    }

    #[test]
    fn test_lock_timeout_is_mount_failure() {
        let err = Error::LockTimeout {
            path: PathBuf::from("/tmp/mnt"),
            waited: Duration::from_secs(60),
        };
        assert!(err.is_mount_failure());
        assert!(err.to_string().contains("lock timeout"));
    }

    #[test]
    fn test_json_error_maps_to_serialization() {
        let err: Error = serde_json::from_str::<u32>("nope").unwrap_err().into();
        assert!(matches!(err, Error::Serialization(_)));
    }
}
