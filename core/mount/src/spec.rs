//! Mount parameter sets and the handles returned to callers.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use snapkeep_common::{Error, HashId, Password, Result};

/// Snapshot storage modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MountMode {
    /// Plain local directory, nothing to mount.
    Local,
    /// Remote directory over sshfs.
    Ssh,
    /// Local directory decrypted through encfs.
    LocalEncfs,
    /// Remote directory over sshfs, decrypted through encfs.
    SshEncfs,
}

impl MountMode {
    /// All known modes.
    pub const ALL: [MountMode; 4] = [
        MountMode::Local,
        MountMode::Ssh,
        MountMode::LocalEncfs,
        MountMode::SshEncfs,
    ];

    /// Whether this mode needs a filesystem mount at all.
    pub fn needs_mount(&self) -> bool {
        !matches!(self, MountMode::Local)
    }

    /// Whether a password must be supplied to mount.
    pub fn requires_password(&self) -> bool {
        matches!(self, MountMode::LocalEncfs | MountMode::SshEncfs)
    }

    /// The name used in settings and umount info.
    pub fn as_str(&self) -> &'static str {
        match self {
            MountMode::Local => "local",
            MountMode::Ssh => "ssh",
            MountMode::LocalEncfs => "local_encfs",
            MountMode::SshEncfs => "ssh_encfs",
        }
    }
}

impl fmt::Display for MountMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MountMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        MountMode::ALL
            .into_iter()
            .find(|mode| mode.as_str() == s)
            .ok_or_else(|| Error::InvalidInput(format!("Unknown mount mode '{}'", s)))
    }
}

/// Connection details shared by the ssh based modes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SshParams {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub path: String,
    pub cipher: String,
    pub private_key_file: String,
}

/// Backend parameters, tagged by mode.
///
/// Passwords never leave memory: they are skipped when serializing and
/// take no part in the hash id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum MountParams {
    Local {
        path: PathBuf,
    },
    Ssh {
        #[serde(flatten)]
        ssh: SshParams,
    },
    LocalEncfs {
        path: PathBuf,
        #[serde(skip)]
        password: Option<Password>,
    },
    SshEncfs {
        #[serde(flatten)]
        ssh: SshParams,
        #[serde(skip)]
        password: Option<Password>,
    },
}

impl MountParams {
    /// Mode this parameter set belongs to.
    pub fn mode(&self) -> MountMode {
        match self {
            MountParams::Local { .. } => MountMode::Local,
            MountParams::Ssh { .. } => MountMode::Ssh,
            MountParams::LocalEncfs { .. } => MountMode::LocalEncfs,
            MountParams::SshEncfs { .. } => MountMode::SshEncfs,
        }
    }

    /// The password, if this mode carries one.
    pub fn password(&self) -> Option<&Password> {
        match self {
            MountParams::LocalEncfs { password, .. } | MountParams::SshEncfs { password, .. } => {
                password.as_ref()
            }
            _ => None,
        }
    }

    /// Attach a password; ignored by modes without one.
    pub fn with_password(mut self, secret: Password) -> Self {
        match &mut self {
            MountParams::LocalEncfs { password, .. } | MountParams::SshEncfs { password, .. } => {
                *password = Some(secret);
            }
            _ => {}
        }
        self
    }

    /// Ssh connection details, for the ssh based modes.
    pub fn ssh(&self) -> Option<&SshParams> {
        match self {
            MountParams::Ssh { ssh } | MountParams::SshEncfs { ssh, .. } => Some(ssh),
            _ => None,
        }
    }
}

/// Everything needed to perform one mount.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountSpec {
    #[serde(flatten)]
    pub params: MountParams,
    /// Salt bumped to move away from a colliding hash id.
    #[serde(default)]
    pub hash_collision: u32,
}

impl MountSpec {
    /// Create a spec from parameters and the current collision salt.
    pub fn new(params: MountParams, hash_collision: u32) -> Self {
        Self {
            params,
            hash_collision,
        }
    }

    /// Mode of this spec.
    pub fn mode(&self) -> MountMode {
        self.params.mode()
    }

    /// Render the umount info object.
    ///
    /// Keys are the backend parameter names, values JSON natives.
    pub fn to_umount_value(&self) -> Result<Map<String, Value>> {
        match serde_json::to_value(self)? {
            Value::Object(map) => Ok(map),
            other => Err(Error::Serialization(format!(
                "Mount spec rendered as {} instead of an object",
                other
            ))),
        }
    }

    /// Parse a umount info object back into a spec.
    pub fn from_umount_value(value: Value) -> Result<Self> {
        Ok(serde_json::from_value(value)?)
    }

    /// Whether a persisted umount info describes this spec.
    ///
    /// Every key of this spec must be present with an equal value.
    pub fn matches_umount_value(&self, persisted: &Value) -> Result<bool> {
        let Value::Object(saved) = persisted else {
            return Ok(false);
        };
        let ours = self.to_umount_value()?;
        Ok(ours
            .iter()
            .all(|(key, value)| saved.get(key).is_some_and(|v| v == value)))
    }
}

/// Handle returned by a successful mount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MountHandle {
    /// Mode needed no mount.
    Local,
    /// Shared mount keyed by hash id.
    Hashed(HashId),
}

impl MountHandle {
    /// The hash id, unless this is the local sentinel.
    pub fn hash_id(&self) -> Option<HashId> {
        match self {
            MountHandle::Local => None,
            MountHandle::Hashed(id) => Some(*id),
        }
    }
}

impl fmt::Display for MountHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MountHandle::Local => f.write_str("local"),
            MountHandle::Hashed(id) => write!(f, "{}", id),
        }
    }
}

impl FromStr for MountHandle {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s == "local" {
            Ok(MountHandle::Local)
        } else {
            Ok(MountHandle::Hashed(s.parse()?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ssh_params() -> SshParams {
        SshParams {
            host: "backup.example.org".to_string(),
            port: 22,
            user: "alice".to_string(),
            path: "/srv/snapshots".to_string(),
            cipher: "default".to_string(),
            private_key_file: "/home/alice/.ssh/id_ed25519".to_string(),
        }
    }

    #[test]
    fn test_umount_value_has_flat_backend_keys() {
        let spec = MountSpec::new(MountParams::Ssh { ssh: ssh_params() }, 3);
        let value = spec.to_umount_value().unwrap();

        assert_eq!(value["mode"], json!("ssh"));
        assert_eq!(value["port"], json!(22));
        assert_eq!(value["hash_collision"], json!(3));
        assert_eq!(value["private_key_file"], json!("/home/alice/.ssh/id_ed25519"));
    }

    #[test]
    fn test_password_never_serialized() {
        let spec = MountSpec::new(
            MountParams::LocalEncfs {
                path: PathBuf::from("/data/enc"),
                password: None,
            }
            .with_password(Password::new("secret")),
            0,
        );
        let text = serde_json::to_string(&spec).unwrap();
        assert!(!text.contains("secret"));
        assert!(!text.contains("password"));
    }

    #[test]
    fn test_umount_value_round_trip() {
        let spec = MountSpec::new(
            MountParams::SshEncfs {
                ssh: ssh_params(),
                password: None,
            },
            7,
        );
        let value = Value::Object(spec.to_umount_value().unwrap());
        let back = MountSpec::from_umount_value(value).unwrap();
        assert_eq!(back, spec);
    }

    #[test]
    fn test_matches_umount_value_detects_difference() {
        let spec = MountSpec::new(MountParams::Ssh { ssh: ssh_params() }, 0);
        let same = Value::Object(spec.to_umount_value().unwrap());
        assert!(spec.matches_umount_value(&same).unwrap());

        let mut other = ssh_params();
        other.private_key_file = "/home/alice/.ssh/other".to_string();
        let other = MountSpec::new(MountParams::Ssh { ssh: other }, 0);
        assert!(!other.matches_umount_value(&same).unwrap());
        assert!(!spec.matches_umount_value(&json!([1, 2])).unwrap());
    }

    #[test]
    fn test_port_type_matters() {
        let spec = MountSpec::new(MountParams::Ssh { ssh: ssh_params() }, 0);
        let mut value = spec.to_umount_value().unwrap();
        value.insert("port".to_string(), json!("22"));
        assert!(!spec.matches_umount_value(&Value::Object(value)).unwrap());
    }

    #[test]
    fn test_mode_names() {
        assert_eq!("ssh_encfs".parse::<MountMode>().unwrap(), MountMode::SshEncfs);
        assert!("nfs".parse::<MountMode>().is_err());
        assert!(!MountMode::Local.needs_mount());
        assert!(MountMode::LocalEncfs.requires_password());
    }

    #[test]
    fn test_handle_display_and_parse() {
        assert_eq!(MountHandle::Local.to_string(), "local");
        let handle: MountHandle = "0A0B0C0D".parse().unwrap();
        assert_eq!(handle.to_string(), "0A0B0C0D");
        assert_eq!("local".parse::<MountHandle>().unwrap(), MountHandle::Local);
    }
}
