//! Common types used throughout snapkeep.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Identifier of a backup profile.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ProfileId(String);

impl ProfileId {
    /// Create a new ProfileId from a string.
    ///
    /// # Preconditions
    /// - `id` must be non-empty
    /// - `id` must not contain path separators
    ///
    /// # Errors
    /// - Returns error if id is empty or contains a separator
    pub fn new(id: impl Into<String>) -> crate::Result<Self> {
        let id = id.into();
        if id.is_empty() {
            return Err(crate::Error::InvalidInput(
                "ProfileId cannot be empty".to_string(),
            ));
        }
        if id.contains('/') || id.contains('\\') {
            return Err(crate::Error::InvalidInput(format!(
                "ProfileId cannot contain separators: {}",
                id
            )));
        }
        Ok(Self(id))
    }

    /// Get the inner string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProfileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for ProfileId {
    type Error = crate::Error;

    fn try_from(value: String) -> crate::Result<Self> {
        Self::new(value)
    }
}

impl From<ProfileId> for String {
    fn from(id: ProfileId) -> Self {
        id.0
    }
}

/// Eight uppercase hex digits naming a shared mount directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HashId(u32);

impl HashId {
    /// Wrap a raw 32-bit checksum.
    pub fn from_checksum(checksum: u32) -> Self {
        Self(checksum)
    }

    /// The raw checksum.
    pub fn checksum(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for HashId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08X}", self.0)
    }
}

impl FromStr for HashId {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        if s.is_empty() || s.len() > 8 || !s.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(crate::Error::InvalidInput(format!(
                "Not a hash id: {:?}",
                s
            )));
        }
        u32::from_str_radix(s, 16)
            .map(Self)
            .map_err(|e| crate::Error::InvalidInput(format!("Not a hash id: {}", e)))
    }
}

/// Mount password, held in memory only and wiped on drop.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct Password(String);

impl Password {
    /// Wrap a secret.
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    /// Expose the secret for handing to a transport.
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Check if empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Password {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Password([REDACTED])")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profile_id_creation() {
        let id = ProfileId::new("2").unwrap();
        assert_eq!(id.as_str(), "2");
    }

    #[test]
    fn test_profile_id_rejects_bad_input() {
        assert!(ProfileId::new("").is_err());
        assert!(ProfileId::new("a/b").is_err());
    }

    #[test]
    fn test_profile_id_deserialize_validates() {
        let ok: ProfileId = serde_json::from_str("\"main\"").unwrap();
        assert_eq!(ok.as_str(), "main");
        assert!(serde_json::from_str::<ProfileId>("\"\"").is_err());
    }

    #[test]
    fn test_hash_id_is_eight_upper_hex_digits() {
        assert_eq!(HashId::from_checksum(0xab).to_string(), "000000AB");
        assert_eq!(HashId::from_checksum(0xDEADBEEF).to_string(), "DEADBEEF");
    }

    #[test]
    fn test_hash_id_parse() {
        let id: HashId = "DEADBEEF".parse().unwrap();
        assert_eq!(id.checksum(), 0xDEADBEEF);
        assert!("local".parse::<HashId>().is_err());
        assert!("123456789".parse::<HashId>().is_err());
    }

    #[test]
    fn test_password_debug_is_redacted() {
        let pw = Password::new("hunter2");
        assert!(!format!("{:?}", pw).contains("hunter2"));
        assert_eq!(pw.expose(), "hunter2");
    }
}
